//! Zstd and LZ4 compression for stored boxes and container tree bodies

use crate::error::{StoreError, StoreResult};
use serde::{Deserialize, Serialize};

/// Zstd level used for every compressed box. Fixed so that identical
/// plaintexts always produce identical boxes.
pub const ZSTD_LEVEL: i32 = 3;

/// Compression type, matching the 2-bit id in the container tree header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    /// No compression (passthrough)
    #[default]
    None,
    /// Zstandard, for archival data. Wire id 1, the format's deflate-style slot.
    Zstd,
    /// LZ4 block format with prepended size
    Lz4,
}

impl CompressionType {
    /// Wire id of this compression type
    pub fn id(self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Zstd => 1,
            CompressionType::Lz4 => 2,
        }
    }

    /// Look up a compression type by wire id
    pub fn from_id(id: u8) -> StoreResult<Self> {
        match id {
            0 => Ok(CompressionType::None),
            1 => Ok(CompressionType::Zstd),
            2 => Ok(CompressionType::Lz4),
            other => Err(StoreError::UnsupportedFormat(format!(
                "unknown compression id {}",
                other
            ))),
        }
    }
}

/// Compress data with the given algorithm. Returns compressed bytes.
pub fn compress(data: &[u8], algo: CompressionType) -> StoreResult<Vec<u8>> {
    match algo {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        CompressionType::Zstd => zstd::encode_all(data, ZSTD_LEVEL)
            .map_err(|e| StoreError::CompressionFailed(e.to_string())),
    }
}

/// Decompress data using the algorithm that was used for compression.
pub fn decompress(data: &[u8], algo: CompressionType) -> StoreResult<Vec<u8>> {
    match algo {
        CompressionType::None => Ok(data.to_vec()),
        CompressionType::Lz4 => lz4_flex::decompress_size_prepended(data)
            .map_err(|e| StoreError::DecompressionFailed(e.to_string())),
        CompressionType::Zstd => {
            zstd::decode_all(data).map_err(|e| StoreError::DecompressionFailed(e.to_string()))
        }
    }
}
