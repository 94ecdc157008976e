//! Encoding of commit pointers as branch log messages.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chunkvault_store::encryption::{decrypt, encrypt, random_iv, IV_LEN};
use chunkvault_store::{BoxPointer, CryptoConfig, Iv};

use crate::error::{RepoError, RepoResult};

/// Turns a commit pointer into the opaque single-line log message and back.
pub trait CommitCallback: Send + Sync {
    /// Encode a commit pointer
    fn log_message(&self, commit: &BoxPointer) -> RepoResult<String>;

    /// Decode a message written by [`CommitCallback::log_message`]
    fn commit_pointer(&self, message: &str) -> RepoResult<BoxPointer>;
}

/// Stores the pointer as JSON with hex fields.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainCommitCallback;

impl CommitCallback for PlainCommitCallback {
    fn log_message(&self, commit: &BoxPointer) -> RepoResult<String> {
        serde_json::to_string(commit).map_err(|e| RepoError::InvalidLogMessage(e.to_string()))
    }

    fn commit_pointer(&self, message: &str) -> RepoResult<BoxPointer> {
        serde_json::from_str(message).map_err(|e| RepoError::InvalidLogMessage(e.to_string()))
    }
}

/// Seals the pointer with the repository key under a random IV and base64-encodes `iv || ciphertext`.
#[derive(Debug, Clone)]
pub struct EncryptedCommitCallback {
    crypto: CryptoConfig,
}

impl EncryptedCommitCallback {
    /// Callback sealing with `crypto`
    pub fn new(crypto: CryptoConfig) -> Self {
        Self { crypto }
    }
}

impl CommitCallback for EncryptedCommitCallback {
    fn log_message(&self, commit: &BoxPointer) -> RepoResult<String> {
        let iv = random_iv();
        let mut sealed = iv.0.to_vec();
        sealed.extend_from_slice(&encrypt(&commit.to_bytes(), &self.crypto, &iv)?);
        Ok(STANDARD.encode(sealed))
    }

    fn commit_pointer(&self, message: &str) -> RepoResult<BoxPointer> {
        let sealed = STANDARD
            .decode(message)
            .map_err(|e| RepoError::InvalidLogMessage(e.to_string()))?;
        if sealed.len() < IV_LEN {
            return Err(RepoError::InvalidLogMessage("sealed commit pointer too short".into()));
        }
        let (iv, ciphertext) = sealed.split_at(IV_LEN);
        let mut iv_bytes = [0u8; IV_LEN];
        iv_bytes.copy_from_slice(iv);
        let plain = decrypt(ciphertext, &self.crypto, &Iv(iv_bytes))?;
        Ok(BoxPointer::from_bytes(&plain)?)
    }
}
