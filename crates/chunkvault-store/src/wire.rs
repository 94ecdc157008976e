//! Little-endian cursor for the fixed binary records (pointers, headers, blobs).

use crate::error::{StoreError, StoreResult};
use crate::hash::{HashValue, HASH_LEN};

/// Reads fixed-width little-endian fields from a byte slice.
///
/// Every read fails with [`StoreError::Corrupted`] on truncation instead of panicking.
pub struct WireReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> WireReader<'a> {
    /// Start reading at the beginning of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Current offset.
    pub fn position(&self) -> usize {
        self.pos
    }

    /// The unread tail.
    pub fn rest(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }

    /// Consume `len` bytes.
    pub fn bytes(&mut self, len: usize) -> StoreResult<&'a [u8]> {
        if self.remaining() < len {
            return Err(StoreError::Corrupted(format!(
                "truncated record: need {} bytes at offset {}, {} left",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Consume one byte.
    pub fn u8(&mut self) -> StoreResult<u8> {
        Ok(self.bytes(1)?[0])
    }

    /// Consume a little-endian u16.
    pub fn u16(&mut self) -> StoreResult<u16> {
        let b = self.bytes(2)?;
        Ok(u16::from_le_bytes([b[0], b[1]]))
    }

    /// Consume a little-endian u32.
    pub fn u32(&mut self) -> StoreResult<u32> {
        let mut arr = [0u8; 4];
        arr.copy_from_slice(self.bytes(4)?);
        Ok(u32::from_le_bytes(arr))
    }

    /// Consume a little-endian u64.
    pub fn u64(&mut self) -> StoreResult<u64> {
        let mut arr = [0u8; 8];
        arr.copy_from_slice(self.bytes(8)?);
        Ok(u64::from_le_bytes(arr))
    }

    /// Consume a 32-byte hash.
    pub fn hash(&mut self) -> StoreResult<HashValue> {
        HashValue::from_slice(self.bytes(HASH_LEN)?)
    }

    /// Fail unless every byte was consumed.
    pub fn finish(&self) -> StoreResult<()> {
        if self.remaining() != 0 {
            return Err(StoreError::Corrupted(format!(
                "{} trailing bytes after record",
                self.remaining()
            )));
        }
        Ok(())
    }
}
