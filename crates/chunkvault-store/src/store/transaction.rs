//! Advisory transactions over a chunk store.
//!
//! A transaction groups writes but gives no atomicity: `commit` is a durability
//! barrier (pack and index are synced), `cancel` only closes the transaction and
//! leaves already written chunks in place. Unreferenced chunks are harmless since
//! the store is content addressed.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{ChunkStore, PutResult};
use crate::error::StoreResult;
use crate::hash::HashValue;

pub(crate) struct TransactionState {
    id: u64,
    closed: AtomicBool,
    puts: AtomicU64,
    written: AtomicU64,
    changes: Mutex<Vec<HashValue>>,
}

impl TransactionState {
    pub(crate) fn new(id: u64) -> Self {
        Self {
            id,
            closed: AtomicBool::new(false),
            puts: AtomicU64::new(0),
            written: AtomicU64::new(0),
            changes: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

/// Pass-through view of a store that tracks the writes made through it.
#[derive(Clone)]
pub struct StoreTransaction {
    store: ChunkStore,
    state: Arc<TransactionState>,
}

impl std::fmt::Debug for StoreTransaction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreTransaction")
            .field("store", &self.store.id())
            .field("id", &self.state.id)
            .field("closed", &self.state.is_closed())
            .finish()
    }
}

impl StoreTransaction {
    pub(crate) fn new(store: ChunkStore, state: Arc<TransactionState>) -> Self {
        Self { store, state }
    }

    /// Transaction number, unique per store instance
    pub fn id(&self) -> u64 {
        self.state.id
    }

    /// The store this transaction writes to
    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    /// Whether `commit` or `cancel` was called
    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// `put` calls made through this transaction
    pub fn put_count(&self) -> u64 {
        self.state.puts.load(Ordering::Relaxed)
    }

    /// Chunks this transaction actually wrote (excludes dedup hits)
    pub fn written_count(&self) -> u64 {
        self.state.written.load(Ordering::Relaxed)
    }

    /// Hashes of the chunks this transaction wrote, in write order
    pub fn changes(&self) -> Vec<HashValue> {
        self.state.changes.lock().clone()
    }

    /// See [`ChunkStore::put`]
    pub fn put(&self, bytes: &[u8]) -> StoreResult<PutResult> {
        if self.is_closed() {
            warn!(transaction = self.state.id, "write through a closed transaction");
        }
        let result = self.store.put(bytes)?;
        self.state.puts.fetch_add(1, Ordering::Relaxed);
        if !result.already_present {
            self.state.written.fetch_add(1, Ordering::Relaxed);
            self.state.changes.lock().push(result.hash);
        }
        Ok(result)
    }

    /// See [`ChunkStore::get`]
    pub fn get(&self, hash: &HashValue) -> StoreResult<Vec<u8>> {
        self.store.get(hash)
    }

    /// See [`ChunkStore::has`]
    pub fn has(&self, hash: &HashValue) -> StoreResult<bool> {
        self.store.has(hash)
    }

    /// Sync the store to disk and close the transaction
    pub fn commit(&self) -> StoreResult<()> {
        self.store.sync()?;
        self.state.closed.store(true, Ordering::Release);
        self.store.end_transaction(&self.state);
        debug!(
            transaction = self.state.id,
            written = self.written_count(),
            "committed transaction"
        );
        Ok(())
    }

    /// Close the transaction without syncing. Written chunks are not rolled back.
    pub fn cancel(&self) {
        self.state.closed.store(true, Ordering::Release);
        self.store.end_transaction(&self.state);
        debug!(
            transaction = self.state.id,
            written = self.written_count(),
            "cancelled transaction (no rollback)"
        );
    }
}
