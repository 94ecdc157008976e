//! Content hashing: 32-byte BLAKE3 digests used as chunk and data identities

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{StoreError, StoreResult};

/// Length of a hash value in bytes.
pub const HASH_LEN: usize = 32;

/// A 32-byte BLAKE3 hash identifying content. Used both as CAS key and as data identity.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct HashValue(pub [u8; HASH_LEN]);

impl HashValue {
    /// The distinguished all-zero "empty" value.
    pub const ZERO: HashValue = HashValue([0u8; HASH_LEN]);

    /// Hash a byte slice
    pub fn of(data: &[u8]) -> Self {
        HashValue(*blake3::hash(data).as_bytes())
    }

    /// Build from a slice that must be exactly 32 bytes long
    pub fn from_slice(bytes: &[u8]) -> StoreResult<Self> {
        let arr: [u8; HASH_LEN] = bytes.try_into().map_err(|_| {
            StoreError::Corrupted(format!("hash must be {} bytes, got {}", HASH_LEN, bytes.len()))
        })?;
        Ok(HashValue(arr))
    }

    /// Parse a lowercase or uppercase hex string
    pub fn from_hex(s: &str) -> StoreResult<Self> {
        let bytes = hex::decode(s.trim())
            .map_err(|e| StoreError::Corrupted(format!("invalid hash hex: {}", e)))?;
        Self::from_slice(&bytes)
    }

    /// Return the hash as a lowercase hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// True for the all-zero value
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; HASH_LEN]
    }
}

impl From<blake3::Hash> for HashValue {
    fn from(hash: blake3::Hash) -> Self {
        HashValue(*hash.as_bytes())
    }
}

impl std::fmt::Display for HashValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::fmt::Debug for HashValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HashValue({})", &self.to_hex()[..12])
    }
}

impl Serialize for HashValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for HashValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        HashValue::from_hex(&s).map_err(serde::de::Error::custom)
    }
}
