//! Root chunk format: header (level, splitter, compression) followed by the
//! possibly compressed list of root children.

use serde::{Deserialize, Serialize};

use crate::chunk_pointer::ChunkPointer;
use crate::compression::{compress, decompress, CompressionType};
use crate::error::{StoreError, StoreResult};
use crate::splitter::SplitterConfig;
use crate::tree::node::{decode_body, encode_body};
use crate::wire::WireReader;

const SPLITTER_ID_MASK: u8 = 0x1f;
const COMPRESSION_SHIFT: u8 = 5;
const COMPRESSION_MASK: u8 = 0x03;
const RESERVED_BIT: u8 = 0x80;

/// Chunking and compression of a container tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TreeConfig {
    /// Splitter used for data chunks and index nodes alike
    pub splitter: SplitterConfig,
    /// Compression of leaves, index nodes and the root body
    pub compression: CompressionType,
}

/// Decoded header of a root chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeHeader {
    /// Level of the root node (1 = root holds leaves)
    pub level: u8,
    /// Tree configuration
    pub config: TreeConfig,
}

impl TreeHeader {
    /// Append the header bytes
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.push(self.level);
        out.push(self.config.splitter.id() | (self.config.compression.id() << COMPRESSION_SHIFT));
        self.config.splitter.write_params(out);
    }

    /// Read a header
    pub fn read_from(reader: &mut WireReader<'_>) -> StoreResult<Self> {
        let level = reader.u8()?;
        if level == 0 {
            return Err(StoreError::Corrupted("root level must be at least 1".to_string()));
        }
        let config = reader.u8()?;
        if config & RESERVED_BIT != 0 {
            return Err(StoreError::UnsupportedFormat(
                "reserved header bit is set".to_string(),
            ));
        }
        let compression =
            CompressionType::from_id((config >> COMPRESSION_SHIFT) & COMPRESSION_MASK)?;
        let splitter = SplitterConfig::read_params(config & SPLITTER_ID_MASK, reader)?;
        Ok(Self {
            level,
            config: TreeConfig {
                splitter,
                compression,
            },
        })
    }
}

/// Serialize a root chunk: header, then the children compressed with the tree compression
pub fn encode_root(header: &TreeHeader, children: &[ChunkPointer]) -> StoreResult<Vec<u8>> {
    let mut out = Vec::new();
    header.write_to(&mut out);
    let body = compress(&encode_body(children), header.config.compression)?;
    out.extend_from_slice(&body);
    Ok(out)
}

/// Parse a root chunk into its header and children
pub fn decode_root(bytes: &[u8]) -> StoreResult<(TreeHeader, Vec<ChunkPointer>)> {
    let mut reader = WireReader::new(bytes);
    let header = TreeHeader::read_from(&mut reader)?;
    let body = decompress(reader.rest(), header.config.compression)?;
    let children = decode_body(&body, header.level - 1)?;
    Ok((header, children))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::box_pointer::BoxPointer;
    use crate::encryption::Iv;
    use crate::hash::HashValue;

    fn children() -> Vec<ChunkPointer> {
        (0..3u8)
            .map(|i| {
                let bp = BoxPointer::new(HashValue::of(&[i]), HashValue::of(&[i, i]), Iv::ZERO);
                ChunkPointer::new(10 + i as u64, 1, bp).unwrap()
            })
            .collect()
    }

    #[test]
    fn root_chunk_parses_back() {
        for compression in [CompressionType::None, CompressionType::Zstd, CompressionType::Lz4] {
            let header = TreeHeader {
                level: 2,
                config: TreeConfig {
                    splitter: SplitterConfig::FixedSize { block_size: 512 },
                    compression,
                },
            };
            let bytes = encode_root(&header, &children()).unwrap();
            let (decoded, kids) = decode_root(&bytes).unwrap();
            assert_eq!(decoded, header);
            assert_eq!(kids, children());
        }
    }

    #[test]
    fn config_byte_layout() {
        let header = TreeHeader {
            level: 1,
            config: TreeConfig {
                splitter: SplitterConfig::default(),
                compression: CompressionType::Lz4,
            },
        };
        let mut out = Vec::new();
        header.write_to(&mut out);
        assert_eq!(out[0], 1);
        assert_eq!(out[1], 0b0100_0001);
        assert_eq!(out.len(), 2 + 12);
    }

    #[test]
    fn reserved_bit_and_unknown_ids_are_unsupported() {
        for config in [0x80u8, 0x1f, 0x60] {
            let bytes = [1u8, config, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
            assert!(matches!(
                decode_root(&bytes),
                Err(StoreError::UnsupportedFormat(_))
            ));
        }
    }

    #[test]
    fn truncated_header_is_corrupted() {
        assert!(matches!(decode_root(&[1u8]), Err(StoreError::Corrupted(_))));
        assert!(matches!(
            decode_root(&[0u8, 0, 1, 0, 0, 0]),
            Err(StoreError::Corrupted(_))
        ));
    }
}
