//! Chunk accessors: translate plaintext chunks into stored boxes and back.
//!
//! Put path: Data → Compress → Prefix box header → Encrypt (convergent IV) → Store
//! Get path: Store → Decrypt → Read box header → Decompress → Data

use parking_lot::RwLock;
use tracing::{debug, instrument, trace};

use crate::box_pointer::BoxPointer;
use crate::compression::{compress, decompress, CompressionType};
use crate::encryption::{decrypt, derive_iv, encrypt, CryptoConfig, Iv};
use crate::error::{StoreError, StoreResult};
use crate::hash::HashValue;
use crate::store::{ChunkStore, StoreTransaction};

/// Result of writing a chunk through an accessor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutChunk {
    /// Pointer to the stored box
    pub pointer: BoxPointer,
    /// True when an identical box was already stored
    pub was_present: bool,
}

/// Everything the container tree needs from the storage below it.
pub trait ChunkAccessor: Send + Sync {
    /// Encode and store a chunk whose logical identity is `data_hash`
    fn put_chunk(
        &self,
        data: &[u8],
        data_hash: &HashValue,
        compression: CompressionType,
    ) -> StoreResult<PutChunk>;

    /// Load and decode the chunk a pointer refers to
    fn get_chunk(&self, pointer: &BoxPointer) -> StoreResult<Vec<u8>>;

    /// Whether the encoded box is stored
    fn has_box(&self, box_hash: &HashValue) -> StoreResult<bool>;

    /// Raw encoded box bytes
    fn get_box(&self, box_hash: &HashValue) -> StoreResult<Vec<u8>>;

    /// Store raw encoded box bytes as-is, returning their hash
    fn put_box(&self, bytes: &[u8]) -> StoreResult<HashValue>;
}

/// Accessor over a chunk store, optionally encrypting every box.
///
/// Writes go through a swappable transaction slot so an owner can commit the
/// current transaction and continue in a fresh one.
pub struct BoxedChunkAccessor {
    transaction: RwLock<StoreTransaction>,
    crypto: Option<CryptoConfig>,
}

impl std::fmt::Debug for BoxedChunkAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxedChunkAccessor")
            .field("transaction", &*self.transaction.read())
            .field("encrypted", &self.crypto.is_some())
            .finish()
    }
}

impl BoxedChunkAccessor {
    /// Accessor writing through a transaction of `store`
    pub fn new(store: &ChunkStore, crypto: Option<CryptoConfig>) -> Self {
        Self::with_transaction(store.open_transaction(), crypto)
    }

    /// Accessor writing through an existing transaction
    pub fn with_transaction(transaction: StoreTransaction, crypto: Option<CryptoConfig>) -> Self {
        Self {
            transaction: RwLock::new(transaction),
            crypto,
        }
    }

    /// The transaction currently in the slot
    pub fn transaction(&self) -> StoreTransaction {
        self.transaction.read().clone()
    }

    /// Replace the transaction, returning the previous one
    pub fn set_transaction(&self, transaction: StoreTransaction) -> StoreTransaction {
        std::mem::replace(&mut *self.transaction.write(), transaction)
    }

    /// Commit the current transaction and continue in a fresh one
    pub fn commit_transaction(&self) -> StoreResult<()> {
        let mut slot = self.transaction.write();
        slot.commit()?;
        let next = slot.store().open_transaction();
        debug!(committed = slot.id(), next = next.id(), "rotated accessor transaction");
        *slot = next;
        Ok(())
    }

    /// Whether boxes are encrypted
    pub fn is_encrypted(&self) -> bool {
        self.crypto.is_some()
    }

    /// The store behind the transaction slot
    pub fn store(&self) -> ChunkStore {
        self.transaction.read().store().clone()
    }

    fn seal(&self, data_hash: &HashValue, plain: Vec<u8>) -> StoreResult<(Vec<u8>, Iv)> {
        match &self.crypto {
            Some(crypto) => {
                let iv = derive_iv(&crypto.key, data_hash, &plain)?;
                Ok((encrypt(&plain, crypto, &iv)?, iv))
            }
            None => Ok((plain, Iv::ZERO)),
        }
    }

    fn open(&self, pointer: &BoxPointer, stored: Vec<u8>) -> StoreResult<Vec<u8>> {
        match &self.crypto {
            Some(crypto) => decrypt(&stored, crypto, &pointer.iv),
            None => Ok(stored),
        }
    }
}

impl ChunkAccessor for BoxedChunkAccessor {
    #[instrument(skip(self, data), fields(len = data.len(), %data_hash))]
    fn put_chunk(
        &self,
        data: &[u8],
        data_hash: &HashValue,
        compression: CompressionType,
    ) -> StoreResult<PutChunk> {
        let compressed = compress(data, compression)?;
        let mut plain = Vec::with_capacity(1 + compressed.len());
        plain.push(compression.id());
        plain.extend_from_slice(&compressed);

        let (sealed, iv) = self.seal(data_hash, plain)?;
        let result = self.transaction.read().put(&sealed)?;
        trace!(box_hash = %result.hash, present = result.already_present, "put chunk");
        Ok(PutChunk {
            pointer: BoxPointer::new(*data_hash, result.hash, iv),
            was_present: result.already_present,
        })
    }

    fn get_chunk(&self, pointer: &BoxPointer) -> StoreResult<Vec<u8>> {
        let stored = self.get_box(&pointer.box_hash)?;
        let plain = self.open(pointer, stored)?;
        let (&header, payload) = plain
            .split_first()
            .ok_or_else(|| StoreError::Corrupted(format!("empty box {}", pointer.box_hash)))?;
        decompress(payload, CompressionType::from_id(header)?)
    }

    fn has_box(&self, box_hash: &HashValue) -> StoreResult<bool> {
        self.transaction.read().has(box_hash)
    }

    fn get_box(&self, box_hash: &HashValue) -> StoreResult<Vec<u8>> {
        let bytes = self.transaction.read().get(box_hash)?;
        if HashValue::of(&bytes) != *box_hash {
            return Err(StoreError::Corrupted(format!(
                "box {} does not match its hash",
                box_hash
            )));
        }
        Ok(bytes)
    }

    fn put_box(&self, bytes: &[u8]) -> StoreResult<HashValue> {
        Ok(self.transaction.read().put(bytes)?.hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encryption::{EncryptionAlgorithm, EncryptionKey};

    fn crypto(byte: u8) -> CryptoConfig {
        CryptoConfig {
            key: EncryptionKey([byte; 32]),
            algorithm: EncryptionAlgorithm::ChaCha20Poly1305,
        }
    }

    #[test]
    fn plain_roundtrip_all_compressions() {
        let store = ChunkStore::in_memory("acc");
        let accessor = BoxedChunkAccessor::new(&store, None);
        let data = b"some chunk data, some chunk data, some chunk data".to_vec();
        let hash = HashValue::of(&data);
        for compression in [CompressionType::None, CompressionType::Zstd, CompressionType::Lz4] {
            let put = accessor.put_chunk(&data, &hash, compression).unwrap();
            assert_eq!(put.pointer.iv, Iv::ZERO);
            assert_eq!(accessor.get_chunk(&put.pointer).unwrap(), data);
        }
    }

    #[test]
    fn encrypted_boxes_are_convergent() {
        let store = ChunkStore::in_memory("acc");
        let a = BoxedChunkAccessor::new(&store, Some(crypto(3)));
        let b = BoxedChunkAccessor::new(&ChunkStore::in_memory("other"), Some(crypto(3)));
        let data = b"convergent".to_vec();
        let hash = HashValue::of(&data);
        let pa = a.put_chunk(&data, &hash, CompressionType::Lz4).unwrap();
        let pb = b.put_chunk(&data, &hash, CompressionType::Lz4).unwrap();
        assert_eq!(pa.pointer, pb.pointer);
        assert!(!pa.pointer.iv.0.iter().all(|b| *b == 0));
        let again = a.put_chunk(&data, &hash, CompressionType::Lz4).unwrap();
        assert!(again.was_present);
        assert_eq!(a.get_chunk(&pa.pointer).unwrap(), data);
    }

    #[test]
    fn different_keys_produce_different_boxes() {
        let store = ChunkStore::in_memory("acc");
        let a = BoxedChunkAccessor::new(&store, Some(crypto(1)));
        let b = BoxedChunkAccessor::new(&store, Some(crypto(2)));
        let hash = HashValue::of(b"x");
        let pa = a.put_chunk(b"x", &hash, CompressionType::None).unwrap();
        let pb = b.put_chunk(b"x", &hash, CompressionType::None).unwrap();
        assert!(pa.pointer.same_data(&pb.pointer));
        assert_ne!(pa.pointer.box_hash, pb.pointer.box_hash);
        assert!(matches!(
            b.get_chunk(&pa.pointer),
            Err(StoreError::DecryptionAuthFailed)
        ));
    }

    #[test]
    fn missing_box_is_chunk_not_found() {
        let accessor = BoxedChunkAccessor::new(&ChunkStore::in_memory("acc"), None);
        let pointer = BoxPointer::new(HashValue::of(b"a"), HashValue::of(b"b"), Iv::ZERO);
        assert!(matches!(
            accessor.get_chunk(&pointer),
            Err(StoreError::ChunkNotFound(_))
        ));
    }

    #[test]
    fn raw_boxes_copy_between_stores() {
        let from = BoxedChunkAccessor::new(&ChunkStore::in_memory("a"), Some(crypto(9)));
        let to = BoxedChunkAccessor::new(&ChunkStore::in_memory("b"), Some(crypto(9)));
        let hash = HashValue::of(b"payload");
        let put = from.put_chunk(b"payload", &hash, CompressionType::Zstd).unwrap();
        assert!(!to.has_box(&put.pointer.box_hash).unwrap());
        let raw = from.get_box(&put.pointer.box_hash).unwrap();
        assert_eq!(to.put_box(&raw).unwrap(), put.pointer.box_hash);
        assert_eq!(to.get_chunk(&put.pointer).unwrap(), b"payload");
    }

    #[test]
    fn commit_rotates_the_transaction() {
        let accessor = BoxedChunkAccessor::new(&ChunkStore::in_memory("acc"), None);
        let first = accessor.transaction().id();
        accessor.commit_transaction().unwrap();
        assert_ne!(accessor.transaction().id(), first);
    }
}
