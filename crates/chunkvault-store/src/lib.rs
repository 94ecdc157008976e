#![warn(missing_docs)]

//! chunkvault storage layer: deduplicating chunk store (BLAKE3), container trees
//! over content-defined chunks, compression (LZ4/Zstd), convergent encryption (AES-GCM)
//!
//! Write path: Bytes → Split (gear / fixed) → Hash (BLAKE3) → Compress → Encrypt (convergent IV) → Dedupe → Pack
//! Read path:  Pack → Verify box hash → Decrypt → Decompress → Bytes

pub mod accessor;
pub mod box_pointer;
pub mod cache;
pub mod chunk_pointer;
pub mod compression;
pub mod config;
pub mod encryption;
pub mod error;
pub mod hash;
pub mod hasher;
pub mod splitter;
pub mod store;
pub mod tree;
pub mod wire;

pub use accessor::{BoxedChunkAccessor, ChunkAccessor, PutChunk};
pub use box_pointer::BoxPointer;
pub use cache::{CacheConfig, CacheStats};
pub use chunk_pointer::ChunkPointer;
pub use compression::CompressionType;
pub use config::StoreConfig;
pub use encryption::{CryptoConfig, EncryptionAlgorithm, EncryptionKey, Iv};
pub use error::{StoreError, StoreResult};
pub use hash::HashValue;
pub use hasher::ContentHasher;
pub use splitter::{ChunkSplitter, SplitterConfig};
pub use store::{ChunkStore, OpenMode, PutResult, StoreRegistry, StoreStats, StoreTransaction};
pub use tree::sync::{copy_box, copy_tree, CopyStats};
pub use tree::{
    read_blob, write_blob, ChunkedAppender, ContainerReader, ContainerTree, TreeConfig, TreeHeader,
};
