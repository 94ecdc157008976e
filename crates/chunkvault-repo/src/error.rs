//! Error types for the chunkvault-repo subsystem

use chunkvault_store::{HashValue, StoreError};

/// Result type alias for repository operations.
pub type RepoResult<T> = Result<T, RepoError>;

/// Errors raised by the repository layer
#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    /// Error from the chunk store, accessor or container tree
    #[error(transparent)]
    Store(#[from] StoreError),
    /// I/O error on the branch log or repository directory
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The two histories share no commit
    #[error("No common ancestor between {ours} and {theirs}")]
    NoCommonAncestor {
        /// Data hash of the local head
        ours: HashValue,
        /// Data hash of the merged head
        theirs: HashValue,
    },
    /// No entry exists at the path
    #[error("Path not found: {0}")]
    PathNotFound(String),
    /// A path component names a file where a directory is required
    #[error("Not a directory: {0}")]
    NotADirectory(String),
    /// The path names a directory where a file is required
    #[error("Not a file: {0}")]
    NotAFile(String),
    /// Empty or malformed path
    #[error("Invalid path: {0:?}")]
    InvalidPath(String),
    /// No commit with this hash is reachable from head
    #[error("Commit not found: {0}")]
    CommitNotFound(HashValue),
    /// A branch log message could not be encoded or decoded
    #[error("Invalid log message: {0}")]
    InvalidLogMessage(String),
    /// Invalid configuration value or unreadable config file
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl RepoError {
    /// True when the error came from decrypting with the wrong key or tampered data.
    pub fn is_crypto(&self) -> bool {
        matches!(self, RepoError::Store(StoreError::DecryptionAuthFailed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts() {
        let err: RepoError = StoreError::DecryptionAuthFailed.into();
        assert!(err.is_crypto());
        assert!(err.to_string().contains("authentication tag mismatch"));
    }

    #[test]
    fn test_io_error_converts() {
        let err: RepoError = std::io::Error::new(std::io::ErrorKind::Other, "disk").into();
        assert!(matches!(err, RepoError::Io(_)));
        assert!(!err.is_crypto());
    }

    #[test]
    fn test_invalid_path_message() {
        assert_eq!(
            RepoError::InvalidPath("a//b".into()).to_string(),
            "Invalid path: \"a//b\""
        );
    }
}
