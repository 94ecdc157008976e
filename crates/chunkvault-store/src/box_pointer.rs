//! Dual-hash content reference: plaintext identity plus stored-box identity

use serde::{Deserialize, Serialize};

use crate::encryption::{Iv, IV_LEN};
use crate::error::StoreResult;
use crate::hash::{HashValue, HASH_LEN};
use crate::wire::WireReader;

/// Serialized size of a box pointer.
pub const BOX_POINTER_LEN: usize = HASH_LEN * 2 + IV_LEN;

/// Reference to a stored chunk.
///
/// `data_hash` names the plaintext (what the content is), `box_hash` names the
/// encoded bytes in the chunk store (where it lives), and `iv` is the
/// content-derived IV the box was sealed with (zero when unencrypted).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct BoxPointer {
    /// Hash of the plaintext logical content
    pub data_hash: HashValue,
    /// Chunk store key of the stored box
    pub box_hash: HashValue,
    /// Initialization vector used to seal the box
    #[serde(with = "iv_hex")]
    pub iv: Iv,
}

impl BoxPointer {
    /// Create a pointer from its parts
    pub fn new(data_hash: HashValue, box_hash: HashValue, iv: Iv) -> Self {
        Self {
            data_hash,
            box_hash,
            iv,
        }
    }

    /// True when both pointers reference the same plaintext, whatever the encoding
    pub fn same_data(&self, other: &BoxPointer) -> bool {
        self.data_hash == other.data_hash
    }

    /// Append the 80-byte wire form
    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(self.data_hash.as_bytes());
        out.extend_from_slice(self.box_hash.as_bytes());
        out.extend_from_slice(&self.iv.0);
    }

    /// Wire form as a fresh buffer
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(BOX_POINTER_LEN);
        self.write_to(&mut out);
        out
    }

    /// Read the 80-byte wire form
    pub fn read_from(reader: &mut WireReader<'_>) -> StoreResult<Self> {
        let data_hash = reader.hash()?;
        let box_hash = reader.hash()?;
        let mut iv = [0u8; IV_LEN];
        iv.copy_from_slice(reader.bytes(IV_LEN)?);
        Ok(Self {
            data_hash,
            box_hash,
            iv: Iv(iv),
        })
    }

    /// Parse a buffer holding exactly one pointer
    pub fn from_bytes(data: &[u8]) -> StoreResult<Self> {
        let mut reader = WireReader::new(data);
        let pointer = Self::read_from(&mut reader)?;
        reader.finish()?;
        Ok(pointer)
    }
}

impl std::fmt::Display for BoxPointer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.data_hash, self.box_hash)
    }
}

mod iv_hex {
    use super::{Iv, IV_LEN};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(iv: &Iv, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(iv.0))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Iv, D::Error> {
        let s = String::deserialize(deserializer)?;
        let bytes = hex::decode(&s).map_err(serde::de::Error::custom)?;
        let arr: [u8; IV_LEN] = bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("iv must be 16 bytes"))?;
        Ok(Iv(arr))
    }
}
