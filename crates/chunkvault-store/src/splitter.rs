//! Chunk boundary detection: fixed-size and content-defined (gear rolling hash)
//!
//! The same splitter configuration drives both levels of a container tree: raw
//! bytes are split into leaf chunks, and the stream of child data hashes is split
//! into index nodes.

use serde::{Deserialize, Serialize};

use crate::error::{StoreError, StoreResult};
use crate::hash::HashValue;
use crate::wire::WireReader;

/// Splitter type id for fixed-size chunking.
pub const SPLITTER_FIXED: u8 = 0;
/// Splitter type id for content-defined chunking.
pub const SPLITTER_ROLLING: u8 = 1;
/// An index node is never closed before it holds this many children.
pub const MIN_NODE_CHILDREN: usize = 2;

const fn splitmix64(state: u64) -> u64 {
    let mut z = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

const fn make_gear_table() -> [u64; 256] {
    let mut table = [0u64; 256];
    let mut i = 0;
    while i < 256 {
        table[i] = splitmix64(i as u64 ^ 0x6368_756E_6B76_6C74);
        i += 1;
    }
    table
}

/// Gear table for the rolling hash. Part of the on-disk format: changing it changes every chunk boundary.
const GEAR: [u64; 256] = make_gear_table();

/// Splitter policy and parameters, stored in the container tree header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SplitterConfig {
    /// Cut every `block_size` bytes
    FixedSize {
        /// Chunk size in bytes
        block_size: u32,
    },
    /// Cut where the gear hash of the recent bytes matches a mask
    Rolling {
        /// Expected distance past `min` to a boundary; rounded down to a power of two
        target: u32,
        /// Minimum chunk size in bytes
        min: u32,
        /// Maximum chunk size in bytes
        max: u32,
    },
}

impl Default for SplitterConfig {
    fn default() -> Self {
        SplitterConfig::Rolling {
            target: 8 * 1024,
            min: 2 * 1024,
            max: 64 * 1024,
        }
    }
}

impl SplitterConfig {
    /// Wire id of the splitter type
    pub fn id(&self) -> u8 {
        match self {
            SplitterConfig::FixedSize { .. } => SPLITTER_FIXED,
            SplitterConfig::Rolling { .. } => SPLITTER_ROLLING,
        }
    }

    /// Check the parameters make a terminating splitter
    pub fn validate(&self) -> StoreResult<()> {
        match *self {
            SplitterConfig::FixedSize { block_size } if block_size == 0 => Err(
                StoreError::Config("fixed splitter block_size must be > 0".to_string()),
            ),
            SplitterConfig::Rolling { target, min, max }
                if min == 0 || target == 0 || min > max || target > max =>
            {
                Err(StoreError::Config(format!(
                    "rolling splitter needs 0 < min <= max and 0 < target <= max (target {}, min {}, max {})",
                    target, min, max
                )))
            }
            _ => Ok(()),
        }
    }

    /// Append the splitter parameters (without the type id)
    pub fn write_params(&self, out: &mut Vec<u8>) {
        match *self {
            SplitterConfig::FixedSize { block_size } => {
                out.extend_from_slice(&block_size.to_le_bytes());
            }
            SplitterConfig::Rolling { target, min, max } => {
                out.extend_from_slice(&target.to_le_bytes());
                out.extend_from_slice(&min.to_le_bytes());
                out.extend_from_slice(&max.to_le_bytes());
            }
        }
    }

    /// Read the parameters of the splitter with the given type id
    pub fn read_params(id: u8, reader: &mut WireReader<'_>) -> StoreResult<Self> {
        let config = match id {
            SPLITTER_FIXED => SplitterConfig::FixedSize {
                block_size: reader.u32()?,
            },
            SPLITTER_ROLLING => SplitterConfig::Rolling {
                target: reader.u32()?,
                min: reader.u32()?,
                max: reader.u32()?,
            },
            other => {
                return Err(StoreError::UnsupportedFormat(format!(
                    "unknown splitter id {}",
                    other
                )))
            }
        };
        config
            .validate()
            .map_err(|e| StoreError::Corrupted(e.to_string()))?;
        Ok(config)
    }
}

/// Stateful boundary detector.
///
/// Once a boundary is reported it stays set until [`ChunkSplitter::reset`], so a
/// caller feeding a multi-byte item can check once after the whole item.
#[derive(Debug, Clone)]
pub struct ChunkSplitter {
    config: SplitterConfig,
    mask: u64,
    hash: u64,
    count: u32,
    boundary: bool,
}

impl ChunkSplitter {
    /// Create a fresh splitter for the configuration
    pub fn new(config: SplitterConfig) -> Self {
        let mask = match config {
            SplitterConfig::Rolling { target, .. } => {
                let bits = 31 - target.max(1).leading_zeros();
                if bits == 0 {
                    0
                } else {
                    !0u64 << (64 - bits)
                }
            }
            SplitterConfig::FixedSize { .. } => 0,
        };
        Self {
            config,
            mask,
            hash: 0,
            count: 0,
            boundary: false,
        }
    }

    /// The configuration this splitter was built from
    pub fn config(&self) -> &SplitterConfig {
        &self.config
    }

    /// A new instance with the same configuration and no state
    pub fn fresh(&self) -> Self {
        Self::new(self.config)
    }

    /// Feed one byte; returns whether a boundary has been reached
    pub fn feed(&mut self, byte: u8) -> bool {
        if self.boundary {
            return true;
        }
        self.count += 1;
        match self.config {
            SplitterConfig::FixedSize { block_size } => {
                if self.count >= block_size {
                    self.boundary = true;
                }
            }
            SplitterConfig::Rolling { min, max, .. } => {
                self.hash = (self.hash << 1).wrapping_add(GEAR[byte as usize]);
                if self.count >= max || (self.count >= min && self.hash & self.mask == 0) {
                    self.boundary = true;
                }
            }
        }
        self.boundary
    }

    /// Feed a slice; returns whether a boundary has been reached
    pub fn update(&mut self, bytes: &[u8]) -> bool {
        for &b in bytes {
            if self.feed(b) {
                return true;
            }
        }
        self.boundary
    }

    /// Feed bytes until a boundary; returns the number of bytes consumed up to
    /// and including the boundary byte, or `None` if the slice ran out first.
    pub fn find_boundary(&mut self, bytes: &[u8]) -> Option<usize> {
        for (i, &b) in bytes.iter().enumerate() {
            if self.feed(b) {
                return Some(i + 1);
            }
        }
        None
    }

    /// Feed the data hash of the `children`-th child of an index node; returns
    /// whether the node closes after it.
    pub fn feed_child(&mut self, hash: &HashValue, children: usize) -> bool {
        self.update(hash.as_bytes()) && children >= MIN_NODE_CHILDREN
    }

    /// Whether a boundary has been reached since the last reset
    pub fn is_boundary(&self) -> bool {
        self.boundary
    }

    /// Bytes fed since the last reset
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Clear all state
    pub fn reset(&mut self) {
        self.hash = 0;
        self.count = 0;
        self.boundary = false;
    }
}
