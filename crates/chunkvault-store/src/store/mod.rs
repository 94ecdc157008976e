//! Deduplicating content-addressable chunk store.
//!
//! A store is an ordered hash index over an append-only pack. Every operation on
//! one physical store runs under a single lock that all handles share.

pub mod backend;
pub mod registry;
pub mod transaction;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, trace};

use crate::error::{StoreError, StoreResult};
use crate::hash::HashValue;

pub use backend::{
    FileHashIndex, FilePackLog, HashIndex, MemoryHashIndex, MemoryPackLog, PackLog,
};
pub use registry::StoreRegistry;
pub use transaction::StoreTransaction;

use transaction::TransactionState;

/// Result of a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PutResult {
    /// Content hash of the stored bytes (the store key)
    pub hash: HashValue,
    /// True when the bytes were already stored and nothing was written
    pub already_present: bool,
}

/// Whether opening a store may create its files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Create missing files
    Create,
    /// Fail with `NotFound` when files are missing
    Existing,
}

/// Store statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreStats {
    /// Number of distinct chunks
    pub entries: usize,
    /// Bytes in the pack, including record headers
    pub pack_bytes: u64,
    /// `put` calls that found the chunk already present
    pub dedup_hits: u64,
}

pub(crate) struct StoreInner {
    index: Box<dyn HashIndex>,
    pack: Box<dyn PackLog>,
    open_transaction: Option<Arc<TransactionState>>,
    next_transaction_id: u64,
}

/// The backing object shared by every handle to one physical store.
pub(crate) struct SharedStore {
    id: String,
    inner: Mutex<StoreInner>,
    dedup_hits: AtomicU64,
}

impl SharedStore {
    fn new(id: String, index: Box<dyn HashIndex>, pack: Box<dyn PackLog>) -> Self {
        Self {
            id,
            inner: Mutex::new(StoreInner {
                index,
                pack,
                open_transaction: None,
                next_transaction_id: 1,
            }),
            dedup_hits: AtomicU64::new(0),
        }
    }

    pub(crate) fn open_files(dir: &Path, name: &str, mode: OpenMode) -> StoreResult<Self> {
        let create = mode == OpenMode::Create;
        if create {
            std::fs::create_dir_all(dir)?;
        } else if !dir.is_dir() {
            return Err(StoreError::NotFound(dir.display().to_string()));
        }
        let pack = FilePackLog::open(&dir.join(format!("{}.pack", name)), create)?;
        let index = FileHashIndex::open(&dir.join(format!("{}.idx", name)), create)?;
        debug!(dir = %dir.display(), name, entries = index.len(), "opened chunk store");
        Ok(Self::new(
            store_id(dir, name).display().to_string(),
            Box::new(index),
            Box::new(pack),
        ))
    }
}

pub(crate) fn store_id(dir: &Path, name: &str) -> PathBuf {
    dir.join(name)
}

/// Handle to a deduplicating chunk store. Cloning shares the backing store and its lock.
#[derive(Clone)]
pub struct ChunkStore {
    shared: Arc<SharedStore>,
}

impl std::fmt::Debug for ChunkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkStore").field("id", &self.shared.id).finish()
    }
}

impl ChunkStore {
    pub(crate) fn from_shared(shared: Arc<SharedStore>) -> Self {
        Self { shared }
    }

    pub(crate) fn shared(&self) -> &Arc<SharedStore> {
        &self.shared
    }

    /// An unregistered store held entirely in memory
    pub fn in_memory(name: &str) -> Self {
        Self::with_backends(
            format!("memory:{}", name),
            Box::new(MemoryHashIndex::new()),
            Box::new(MemoryPackLog::new()),
        )
    }

    /// A store over caller-provided backends
    pub fn with_backends(id: String, index: Box<dyn HashIndex>, pack: Box<dyn PackLog>) -> Self {
        Self {
            shared: Arc::new(SharedStore::new(id, index, pack)),
        }
    }

    /// Identity of the physical store (directory + name)
    pub fn id(&self) -> &str {
        &self.shared.id
    }

    /// True when both handles share one backing store
    pub fn same_store(&self, other: &ChunkStore) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    /// Store bytes under their BLAKE3 hash unless already present.
    ///
    /// The pack is appended before the index is updated, so an index entry never
    /// points past the end of the pack.
    #[instrument(skip(self, bytes), fields(store = %self.shared.id, len = bytes.len()))]
    pub fn put(&self, bytes: &[u8]) -> StoreResult<PutResult> {
        let hash = HashValue::of(bytes);
        let mut inner = self.shared.inner.lock();
        if inner.index.get(&hash).is_some() {
            self.shared.dedup_hits.fetch_add(1, Ordering::Relaxed);
            trace!(%hash, "chunk already present");
            return Ok(PutResult {
                hash,
                already_present: true,
            });
        }
        let offset = inner.pack.append(&hash, bytes)?;
        inner.index.put(hash, offset)?;
        trace!(%hash, offset, "stored chunk");
        Ok(PutResult {
            hash,
            already_present: false,
        })
    }

    /// Fetch the bytes stored under `hash`
    pub fn get(&self, hash: &HashValue) -> StoreResult<Vec<u8>> {
        let mut inner = self.shared.inner.lock();
        let offset = inner
            .index
            .get(hash)
            .ok_or(StoreError::ChunkNotFound(*hash))?;
        inner.pack.read(offset, hash)
    }

    /// Whether `hash` is stored
    pub fn has(&self, hash: &HashValue) -> StoreResult<bool> {
        Ok(self.shared.inner.lock().index.get(hash).is_some())
    }

    /// All stored hashes in order
    pub fn hashes(&self) -> Vec<HashValue> {
        self.shared
            .inner
            .lock()
            .index
            .entries()
            .into_iter()
            .map(|(h, _)| h)
            .collect()
    }

    /// Flush pack then index to disk
    pub fn sync(&self) -> StoreResult<()> {
        let mut inner = self.shared.inner.lock();
        inner.pack.sync()?;
        inner.index.sync()
    }

    /// Current statistics
    pub fn stats(&self) -> StoreStats {
        let inner = self.shared.inner.lock();
        StoreStats {
            entries: inner.index.len(),
            pack_bytes: inner.pack.size(),
            dedup_hits: self.shared.dedup_hits.load(Ordering::Relaxed),
        }
    }

    /// Open a transaction, or join the one already open on this store.
    pub fn open_transaction(&self) -> StoreTransaction {
        let mut inner = self.shared.inner.lock();
        if let Some(state) = &inner.open_transaction {
            if !state.is_closed() {
                return StoreTransaction::new(self.clone(), state.clone());
            }
        }
        let id = inner.next_transaction_id;
        inner.next_transaction_id += 1;
        let state = Arc::new(TransactionState::new(id));
        inner.open_transaction = Some(state.clone());
        debug!(store = %self.shared.id, transaction = id, "opened transaction");
        StoreTransaction::new(self.clone(), state)
    }

    pub(crate) fn end_transaction(&self, state: &Arc<TransactionState>) {
        let mut inner = self.shared.inner.lock();
        if let Some(open) = &inner.open_transaction {
            if Arc::ptr_eq(open, state) {
                inner.open_transaction = None;
            }
        }
    }

    /// Release this handle. The backing files close once no handle remains.
    pub fn close(self) {
        debug!(store = %self.shared.id, handles = Arc::strong_count(&self.shared), "closing store handle");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn put_dedups_identical_bytes() {
        let store = ChunkStore::in_memory("t");
        let first = store.put(b"hello").unwrap();
        let second = store.put(b"hello").unwrap();
        assert!(!first.already_present);
        assert!(second.already_present);
        assert_eq!(first.hash, second.hash);
        assert_eq!(store.stats().entries, 1);
        assert_eq!(store.stats().dedup_hits, 1);
    }

    #[test]
    fn get_and_has() {
        let store = ChunkStore::in_memory("t");
        let r = store.put(b"payload").unwrap();
        assert!(store.has(&r.hash).unwrap());
        assert_eq!(store.get(&r.hash).unwrap(), b"payload");
        let missing = HashValue::of(b"missing");
        assert!(!store.has(&missing).unwrap());
        assert!(matches!(
            store.get(&missing),
            Err(StoreError::ChunkNotFound(h)) if h == missing
        ));
    }

    #[test]
    fn file_store_persists() {
        let dir = TempDir::new().unwrap();
        let hash = {
            let shared = SharedStore::open_files(dir.path(), "s", OpenMode::Create).unwrap();
            let store = ChunkStore::from_shared(Arc::new(shared));
            let r = store.put(b"durable").unwrap();
            store.sync().unwrap();
            r.hash
        };
        let shared = SharedStore::open_files(dir.path(), "s", OpenMode::Existing).unwrap();
        let store = ChunkStore::from_shared(Arc::new(shared));
        assert_eq!(store.get(&hash).unwrap(), b"durable");
        assert!(store.put(b"durable").unwrap().already_present);
    }

    #[test]
    fn opening_missing_store_fails() {
        let dir = TempDir::new().unwrap();
        let result = SharedStore::open_files(&dir.path().join("absent"), "s", OpenMode::Existing);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn second_transaction_joins_the_first() {
        let store = ChunkStore::in_memory("t");
        let a = store.open_transaction();
        let b = store.open_transaction();
        assert_eq!(a.id(), b.id());
        a.commit().unwrap();
        let c = store.open_transaction();
        assert_ne!(a.id(), c.id());
    }
}
