//! AES-256-GCM and ChaCha20-Poly1305 AEAD box encryption with convergent IVs

use crate::error::{StoreError, StoreResult};
use crate::hash::HashValue;
use aes_gcm::{aead::Aead, Aes256Gcm, KeyInit};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Length of the stored initialization vector.
pub const IV_LEN: usize = 16;
/// Length of the AEAD nonce taken from the front of the IV.
pub const NONCE_LEN: usize = 12;

const IV_INFO: &[u8] = b"chunkvault-box-iv";

/// 256-bit (32-byte) encryption key
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct EncryptionKey(pub [u8; 32]);

impl std::fmt::Debug for EncryptionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "EncryptionKey([REDACTED])")
    }
}

/// 128-bit initialization vector stored in every box pointer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, PartialOrd, Ord)]
pub struct Iv(pub [u8; IV_LEN]);

impl Iv {
    /// IV of unencrypted boxes
    pub const ZERO: Iv = Iv([0u8; IV_LEN]);

    /// The AEAD nonce used for this IV
    pub fn nonce(&self) -> [u8; NONCE_LEN] {
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&self.0[..NONCE_LEN]);
        nonce
    }
}

/// AEAD cipher selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum EncryptionAlgorithm {
    /// AES-256-GCM, hardware accelerated on x86 with AES-NI
    #[default]
    AesGcm256,
    /// ChaCha20-Poly1305, fast on non-AES hardware
    ChaCha20Poly1305,
}

/// Key plus cipher used by an encrypting accessor
#[derive(Debug, Clone)]
pub struct CryptoConfig {
    /// Symmetric key shared by everyone allowed to read the boxes
    pub key: EncryptionKey,
    /// Cipher
    pub algorithm: EncryptionAlgorithm,
}

impl CryptoConfig {
    /// AES-256-GCM with the given key
    pub fn new(key: EncryptionKey) -> Self {
        Self {
            key,
            algorithm: EncryptionAlgorithm::default(),
        }
    }
}

/// Derive the convergent IV of a box.
///
/// The IV depends only on the key, the plaintext data hash and the exact payload
/// being sealed, so identical plaintexts encrypt to identical boxes.
pub fn derive_iv(key: &EncryptionKey, data_hash: &HashValue, payload: &[u8]) -> StoreResult<Iv> {
    let hk = Hkdf::<Sha256>::new(Some(data_hash.as_bytes()), &key.0);
    let mut info = Vec::with_capacity(IV_INFO.len() + 32);
    info.extend_from_slice(IV_INFO);
    info.extend_from_slice(blake3::hash(payload).as_bytes());
    let mut okm = [0u8; IV_LEN];
    hk.expand(&info, &mut okm)
        .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
    Ok(Iv(okm))
}

/// Generate a cryptographically random IV (only for records that are never deduplicated)
pub fn random_iv() -> Iv {
    use rand::RngCore;
    let mut bytes = [0u8; IV_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    Iv(bytes)
}

/// Encrypt plaintext under the given IV. The 16-byte auth tag is appended.
pub fn encrypt(plaintext: &[u8], config: &CryptoConfig, iv: &Iv) -> StoreResult<Vec<u8>> {
    let nonce = iv.nonce();
    match config.algorithm {
        EncryptionAlgorithm::AesGcm256 => {
            let cipher = Aes256Gcm::new_from_slice(&config.key.0)
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
            cipher
                .encrypt(aes_gcm::Nonce::from_slice(&nonce), plaintext)
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&config.key.0)
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
            cipher
                .encrypt(chacha20poly1305::Nonce::from_slice(&nonce), plaintext)
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))
        }
    }
}

/// Decrypt ciphertext sealed under the given IV. Returns DecryptionAuthFailed if tampered.
pub fn decrypt(ciphertext: &[u8], config: &CryptoConfig, iv: &Iv) -> StoreResult<Vec<u8>> {
    let nonce = iv.nonce();
    match config.algorithm {
        EncryptionAlgorithm::AesGcm256 => {
            let cipher = Aes256Gcm::new_from_slice(&config.key.0)
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
            cipher
                .decrypt(aes_gcm::Nonce::from_slice(&nonce), ciphertext)
                .map_err(|_| StoreError::DecryptionAuthFailed)
        }
        EncryptionAlgorithm::ChaCha20Poly1305 => {
            use chacha20poly1305::aead::Aead as _;
            use chacha20poly1305::KeyInit as _;
            let cipher = ChaCha20Poly1305::new_from_slice(&config.key.0)
                .map_err(|e| StoreError::EncryptionFailed(e.to_string()))?;
            cipher
                .decrypt(chacha20poly1305::Nonce::from_slice(&nonce), ciphertext)
                .map_err(|_| StoreError::DecryptionAuthFailed)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn test_config(algorithm: EncryptionAlgorithm) -> CryptoConfig {
        CryptoConfig {
            key: EncryptionKey([42u8; 32]),
            algorithm,
        }
    }

    proptest! {
        #[test]
        fn prop_aesgcm_roundtrip(data in prop::collection::vec(0u8..=255, 0..16_384)) {
            let config = test_config(EncryptionAlgorithm::AesGcm256);
            let iv = derive_iv(&config.key, &HashValue::of(&data), &data).unwrap();
            let enc = encrypt(&data, &config, &iv).unwrap();
            prop_assert_eq!(decrypt(&enc, &config, &iv).unwrap(), data);
        }
        #[test]
        fn prop_chacha_roundtrip(data in prop::collection::vec(0u8..=255, 0..16_384)) {
            let config = test_config(EncryptionAlgorithm::ChaCha20Poly1305);
            let iv = random_iv();
            let enc = encrypt(&data, &config, &iv).unwrap();
            prop_assert_eq!(decrypt(&enc, &config, &iv).unwrap(), data);
        }
    }

    #[test]
    fn derived_iv_is_convergent() {
        let key = EncryptionKey([7u8; 32]);
        let hash = HashValue::of(b"same plaintext");
        let a = derive_iv(&key, &hash, b"same plaintext").unwrap();
        let b = derive_iv(&key, &hash, b"same plaintext").unwrap();
        assert_eq!(a, b);
        assert_ne!(a, Iv::ZERO);
    }

    #[test]
    fn derived_iv_depends_on_key() {
        let hash = HashValue::of(b"x");
        let a = derive_iv(&EncryptionKey([1u8; 32]), &hash, b"x").unwrap();
        let b = derive_iv(&EncryptionKey([2u8; 32]), &hash, b"x").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn same_iv_gives_same_ciphertext() {
        let config = test_config(EncryptionAlgorithm::AesGcm256);
        let iv = derive_iv(&config.key, &HashValue::of(b"abc"), b"abc").unwrap();
        assert_eq!(
            encrypt(b"abc", &config, &iv).unwrap(),
            encrypt(b"abc", &config, &iv).unwrap()
        );
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let config = test_config(EncryptionAlgorithm::AesGcm256);
        let iv = random_iv();
        let mut enc = encrypt(b"secret", &config, &iv).unwrap();
        enc[0] ^= 0xff;
        assert!(matches!(
            decrypt(&enc, &config, &iv),
            Err(StoreError::DecryptionAuthFailed)
        ));
    }

    #[test]
    fn wrong_key_fails() {
        let config = test_config(EncryptionAlgorithm::AesGcm256);
        let iv = random_iv();
        let enc = encrypt(b"secret", &config, &iv).unwrap();
        let wrong = CryptoConfig::new(EncryptionKey([99u8; 32]));
        assert!(matches!(
            decrypt(&enc, &wrong, &iv),
            Err(StoreError::DecryptionAuthFailed)
        ));
    }
}
