//! Pointer cache bounding the memory a container tree keeps resident.
//!
//! Every child of a loaded node that holds cached content (leaf bytes or a
//! loaded child node) is tracked here by key together with the node holding it.
//! The recency list is allowed to grow to `capacity + slack`; crossing that
//! trigger evicts the oldest entries down to `capacity` in one batch and hands
//! them back to the tree, which drops the cached content and cleans up parents.

use lru::LruCache;
use serde::{Deserialize, Serialize};
use tracing::trace;

/// Stable identity of a child slot inside a container tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChildKey(pub u64);

/// Index of a node in the container tree arena.
pub type NodeId = usize;

/// Configuration for the pointer cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entries kept after an eviction batch (default 4096).
    pub capacity: usize,
    /// Extra entries tolerated before an eviction batch runs (default 256).
    pub slack: usize,
    /// Index levels directly below the root that are never unloaded (default 2).
    pub kept_metadata_levels: u8,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 4096,
            slack: 256,
            kept_metadata_levels: 2,
        }
    }
}

/// Statistics for cache performance monitoring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Number of reads served from cached content.
    pub hits: u64,
    /// Number of reads that had to load from the accessor.
    pub misses: u64,
    /// Number of entries evicted by the recency trigger.
    pub evictions: u64,
}

impl CacheStats {
    /// Calculates the cache hit rate as a ratio of hits to total accesses.
    ///
    /// Returns 0.0 if there have been no cache accesses.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Recency list of cached children.
pub struct PointerCache {
    entries: LruCache<ChildKey, NodeId>,
    config: CacheConfig,
    stats: CacheStats,
}

impl std::fmt::Debug for PointerCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PointerCache")
            .field("len", &self.entries.len())
            .field("config", &self.config)
            .field("stats", &self.stats)
            .finish()
    }
}

impl PointerCache {
    /// Create an empty cache
    pub fn new(config: CacheConfig) -> Self {
        Self {
            entries: LruCache::unbounded(),
            config,
            stats: CacheStats::default(),
        }
    }

    /// Cache configuration
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Move `key` to the front (inserting it if new).
    ///
    /// Returns the entries evicted when the list crossed `capacity + slack`,
    /// oldest first.
    pub fn touch(&mut self, key: ChildKey, parent: NodeId) -> Vec<(ChildKey, NodeId)> {
        self.entries.put(key, parent);
        if self.entries.len() <= self.config.capacity + self.config.slack {
            return Vec::new();
        }
        let mut evicted = Vec::with_capacity(self.entries.len() - self.config.capacity);
        while self.entries.len() > self.config.capacity {
            match self.entries.pop_lru() {
                Some(entry) => evicted.push(entry),
                None => break,
            }
        }
        self.stats.evictions += evicted.len() as u64;
        trace!(evicted = evicted.len(), "pointer cache trimmed");
        evicted
    }

    /// Drop `key` without triggering any cleanup
    pub fn evict(&mut self, key: ChildKey) -> Option<NodeId> {
        self.entries.pop(&key)
    }

    /// Record a new holder for `key` without changing its recency
    pub fn reparent(&mut self, key: ChildKey, parent: NodeId) -> bool {
        match self.entries.peek_mut(&key) {
            Some(slot) => {
                *slot = parent;
                true
            }
            None => false,
        }
    }

    /// Whether `key` is tracked
    pub fn contains(&self, key: ChildKey) -> bool {
        self.entries.contains(&key)
    }

    /// Count a read served from cached content
    pub fn record_hit(&mut self) {
        self.stats.hits += 1;
    }

    /// Count a read that went to the accessor
    pub fn record_miss(&mut self) {
        self.stats.misses += 1;
    }

    /// Tracked entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every entry; statistics are kept
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Current statistics
    pub fn stats(&self) -> CacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small(capacity: usize, slack: usize) -> PointerCache {
        PointerCache::new(CacheConfig {
            capacity,
            slack,
            kept_metadata_levels: 0,
        })
    }

    #[test]
    fn no_eviction_below_trigger() {
        let mut cache = small(4, 2);
        for i in 0..6 {
            assert!(cache.touch(ChildKey(i), 0).is_empty());
        }
        assert_eq!(cache.len(), 6);
    }

    #[test]
    fn crossing_trigger_evicts_down_to_capacity() {
        let mut cache = small(4, 2);
        for i in 0..6 {
            cache.touch(ChildKey(i), 0);
        }
        let evicted = cache.touch(ChildKey(6), 0);
        assert_eq!(
            evicted.iter().map(|(k, _)| k.0).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        assert_eq!(cache.len(), 4);
        for i in 3..7 {
            assert!(cache.contains(ChildKey(i)));
        }
        assert_eq!(cache.stats().evictions, 3);
    }

    #[test]
    fn touch_refreshes_recency() {
        let mut cache = small(2, 0);
        cache.touch(ChildKey(1), 0);
        cache.touch(ChildKey(2), 0);
        cache.touch(ChildKey(1), 0);
        let evicted = cache.touch(ChildKey(3), 0);
        assert_eq!(evicted, vec![(ChildKey(2), 0)]);
    }

    #[test]
    fn evict_and_reparent() {
        let mut cache = small(8, 0);
        cache.touch(ChildKey(1), 10);
        assert!(cache.reparent(ChildKey(1), 11));
        assert!(!cache.reparent(ChildKey(2), 11));
        assert_eq!(cache.evict(ChildKey(1)), Some(11));
        assert!(cache.is_empty());
    }

    #[test]
    fn hit_rate() {
        let mut cache = small(1, 0);
        assert_eq!(cache.stats().hit_rate(), 0.0);
        cache.record_hit();
        cache.record_hit();
        cache.record_hit();
        cache.record_miss();
        assert!((cache.stats().hit_rate() - 0.75).abs() < f64::EPSILON);
    }
}
