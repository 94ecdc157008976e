//! Registry of open stores keyed by directory + name.
//!
//! Every handle to the same physical store shares one backing object and one
//! lock. The registry only keeps weak references: the backing object is
//! released when its last handle is dropped or closed.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::debug;

use super::{store_id, ChunkStore, OpenMode, SharedStore};
use crate::error::StoreResult;

/// Explicit table of open stores.
#[derive(Default)]
pub struct StoreRegistry {
    handles: DashMap<PathBuf, Weak<SharedStore>>,
}

impl StoreRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Open the store `name` in `dir`, sharing the backing object with any live handle.
    pub fn open(&self, dir: &Path, name: &str, mode: OpenMode) -> StoreResult<ChunkStore> {
        let key = store_id(dir, name);
        match self.handles.entry(key) {
            Entry::Occupied(mut occupied) => {
                if let Some(shared) = occupied.get().upgrade() {
                    debug!(store = %occupied.key().display(), "reusing open store");
                    return Ok(ChunkStore::from_shared(shared));
                }
                let shared = Arc::new(SharedStore::open_files(dir, name, mode)?);
                occupied.insert(Arc::downgrade(&shared));
                Ok(ChunkStore::from_shared(shared))
            }
            Entry::Vacant(vacant) => {
                let shared = Arc::new(SharedStore::open_files(dir, name, mode)?);
                vacant.insert(Arc::downgrade(&shared));
                Ok(ChunkStore::from_shared(shared))
            }
        }
    }

    /// Release a handle and forget the store if it was the last one.
    pub fn release(&self, store: ChunkStore) {
        let key = PathBuf::from(store.id());
        let last = Arc::strong_count(store.shared()) == 1;
        store.close();
        if last {
            self.handles.remove(&key);
        }
    }

    /// Forget entries whose stores have no live handle left
    pub fn prune(&self) {
        self.handles.retain(|_, weak| weak.strong_count() > 0);
    }

    /// Number of stores with at least one live handle
    pub fn open_count(&self) -> usize {
        self.handles
            .iter()
            .filter(|entry| entry.value().strong_count() > 0)
            .count()
    }
}
