//! Chunk pointers: a box pointer plus the logical length of the subtree behind it

use crate::box_pointer::{BoxPointer, BOX_POINTER_LEN};
use crate::error::{StoreError, StoreResult};
use crate::wire::WireReader;

/// Serialized size of a chunk pointer.
pub const CHUNK_POINTER_LEN: usize = 4 + BOX_POINTER_LEN;

/// Largest subtree length the wire format can express (the low bit of the length word is reserved).
pub const MAX_DATA_LENGTH: u64 = (u32::MAX >> 1) as u64;

/// Pointer from an index node to a child chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ChunkPointer {
    /// Logical bytes reachable through this pointer
    pub data_length: u32,
    /// 0 for a leaf, otherwise the level of the child node
    pub level: u8,
    /// Where the child chunk is stored
    pub box_pointer: BoxPointer,
}

impl ChunkPointer {
    /// Build a pointer, rejecting lengths the wire format cannot hold
    pub fn new(data_length: u64, level: u8, box_pointer: BoxPointer) -> StoreResult<Self> {
        Ok(Self {
            data_length: checked_length(data_length)?,
            level,
            box_pointer,
        })
    }

    /// Append the wire form (`u32 LE length << 1` + box pointer)
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.data_length << 1).to_le_bytes());
        self.box_pointer.write_to(out);
    }

    /// Read one pointer; the level is implied by the node holding it
    pub fn read_from(reader: &mut WireReader<'_>, level: u8) -> StoreResult<Self> {
        let word = reader.u32()?;
        if word & 1 != 0 {
            return Err(StoreError::Corrupted(
                "reserved bit set in chunk pointer length".to_string(),
            ));
        }
        Ok(Self {
            data_length: word >> 1,
            level,
            box_pointer: BoxPointer::read_from(reader)?,
        })
    }
}

/// Convert a subtree length to its wire width
pub fn checked_length(length: u64) -> StoreResult<u32> {
    if length > MAX_DATA_LENGTH {
        return Err(StoreError::DataLengthOverflow(length));
    }
    Ok(length as u32)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::Iv;
    use crate::hash::HashValue;

    fn pointer(len: u64) -> ChunkPointer {
        let bp = BoxPointer::new(HashValue::of(b"d"), HashValue::of(b"b"), Iv([5; 16]));
        ChunkPointer::new(len, 0, bp).unwrap()
    }

    #[test]
    fn wire_form_shifts_length() {
        let mut buf = Vec::new();
        pointer(300).write_to(&mut buf);
        assert_eq!(buf.len(), CHUNK_POINTER_LEN);
        assert_eq!(&buf[..4], &600u32.to_le_bytes());
        let mut r = WireReader::new(&buf);
        assert_eq!(ChunkPointer::read_from(&mut r, 0).unwrap(), pointer(300));
    }

    #[test]
    fn reserved_bit_is_rejected() {
        let mut buf = Vec::new();
        pointer(1).write_to(&mut buf);
        buf[0] |= 1;
        let mut r = WireReader::new(&buf);
        assert!(matches!(
            ChunkPointer::read_from(&mut r, 0),
            Err(StoreError::Corrupted(_))
        ));
    }

    #[test]
    fn oversized_length_overflows() {
        assert!(checked_length(MAX_DATA_LENGTH).is_ok());
        assert!(matches!(
            checked_length(MAX_DATA_LENGTH + 1),
            Err(StoreError::DataLengthOverflow(_))
        ));
    }
}
