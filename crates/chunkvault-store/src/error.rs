//! Error types for the chunkvault-store subsystem

use crate::hash::HashValue;

/// Result type alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// All errors that can occur while storing, encoding or walking chunks
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// I/O error from the backing pack or index
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// The store files do not exist and the store was not opened for creation
    #[error("Store not found: {0}")]
    NotFound(String),
    /// A chunk referenced by hash is not present in the store
    #[error("Chunk not found: {0}")]
    ChunkNotFound(HashValue),
    /// Unknown splitter, compression or record type id
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),
    /// Malformed or truncated record, or a hash that does not match its content
    #[error("Corrupted data: {0}")]
    Corrupted(String),
    /// Position is outside the logical byte range of a container tree
    #[error("Invalid position {position} (length {length})")]
    InvalidPosition {
        /// The requested position.
        position: u64,
        /// Total logical length of the tree.
        length: u64,
    },
    /// Insertion was requested strictly inside an existing chunk
    #[error("Invalid insert position {position}: not on a chunk boundary")]
    InvalidInsertPosition {
        /// The requested position.
        position: u64,
    },
    /// Removal did not target exactly one whole chunk
    #[error("Data length mismatch at {position}: chunk has {actual} bytes, expected {expected}")]
    DataLengthMismatch {
        /// Start of the chunk.
        position: u64,
        /// Length requested by the caller.
        expected: u64,
        /// Length of the chunk found at the position.
        actual: u64,
    },
    /// A subtree grew beyond what the chunk pointer wire format can express
    #[error("Data length overflow: {0} bytes in one subtree")]
    DataLengthOverflow(u64),
    /// Compression operation failed
    #[error("Compression failed: {0}")]
    CompressionFailed(String),
    /// Decompression operation failed
    #[error("Decompression failed: {0}")]
    DecompressionFailed(String),
    /// Encryption operation failed
    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),
    /// Decryption authentication tag mismatch: wrong key or corrupted ciphertext
    #[error("Decryption failed: authentication tag mismatch (wrong key or corrupted data)")]
    DecryptionAuthFailed,
    /// Invalid configuration value or unreadable config file
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// True for errors caused by a caller violating the tree access contract.
    pub fn is_positional(&self) -> bool {
        matches!(
            self,
            StoreError::InvalidPosition { .. }
                | StoreError::InvalidInsertPosition { .. }
                | StoreError::DataLengthMismatch { .. }
        )
    }

    /// True for errors that indicate a version mismatch or corrupted data.
    pub fn is_format(&self) -> bool {
        matches!(
            self,
            StoreError::UnsupportedFormat(_) | StoreError::Corrupted(_)
        )
    }
}
