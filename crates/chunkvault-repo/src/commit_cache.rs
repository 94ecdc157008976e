//! Bounded memo of decoded commits and the breadth-first ancestor search over it.

use std::collections::{HashSet, VecDeque};
use std::num::NonZeroUsize;
use std::sync::Arc;

use chunkvault_store::{BoxPointer, ChunkAccessor, HashValue};
use lru::LruCache;
use tracing::trace;

use crate::blob::{read_commit, CommitBox};
use crate::error::RepoResult;

/// A commit together with the pointer it was read from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    /// Where the commit is stored
    pub pointer: BoxPointer,
    /// Decoded commit
    pub commit: CommitBox,
}

impl CommitRecord {
    /// Data hash identifying the commit
    pub fn hash(&self) -> HashValue {
        self.pointer.data_hash
    }
}

/// Commits keyed by data hash, least recently used evicted first.
pub struct CommitCache {
    commits: LruCache<HashValue, CommitRecord>,
    hits: u64,
    misses: u64,
}

impl std::fmt::Debug for CommitCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitCache")
            .field("len", &self.commits.len())
            .field("cap", &self.commits.cap())
            .field("hits", &self.hits)
            .field("misses", &self.misses)
            .finish()
    }
}

impl CommitCache {
    /// Cache holding at most `capacity` commits (at least one)
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            commits: LruCache::new(cap),
            hits: 0,
            misses: 0,
        }
    }

    /// Remember a commit that was just written
    pub fn insert(&mut self, record: CommitRecord) {
        self.commits.put(record.hash(), record);
    }

    /// Decode the commit at `pointer`, memoized by data hash
    pub fn load(
        &mut self,
        accessor: &Arc<dyn ChunkAccessor>,
        pointer: &BoxPointer,
    ) -> RepoResult<CommitRecord> {
        if let Some(record) = self.commits.get(&pointer.data_hash) {
            self.hits += 1;
            return Ok(record.clone());
        }
        self.misses += 1;
        let record = CommitRecord {
            pointer: *pointer,
            commit: read_commit(accessor.clone(), pointer)?,
        };
        self.commits.put(pointer.data_hash, record.clone());
        Ok(record)
    }

    /// Breadth-first search from `head` over parents for the commit with data hash `target`.
    pub fn find(
        &mut self,
        accessor: &Arc<dyn ChunkAccessor>,
        head: &BoxPointer,
        target: &HashValue,
    ) -> RepoResult<Option<CommitRecord>> {
        let mut queue = VecDeque::from([*head]);
        let mut seen = HashSet::from([head.data_hash]);
        while let Some(pointer) = queue.pop_front() {
            let record = self.load(accessor, &pointer)?;
            if pointer.data_hash == *target {
                return Ok(Some(record));
            }
            for parent in &record.commit.parents {
                if seen.insert(parent.data_hash) {
                    queue.push_back(*parent);
                }
            }
        }
        trace!(%head, %target, visited = seen.len(), "commit not reachable");
        Ok(None)
    }

    /// Whether `ancestor` is a strict ancestor of `head`
    pub fn is_ancestor(
        &mut self,
        accessor: &Arc<dyn ChunkAccessor>,
        ancestor: &HashValue,
        head: &BoxPointer,
    ) -> RepoResult<bool> {
        if head.data_hash == *ancestor {
            return Ok(false);
        }
        Ok(self.find(accessor, head, ancestor)?.is_some())
    }

    /// Number of cached commits
    pub fn len(&self) -> usize {
        self.commits.len()
    }

    /// Whether no commit is cached
    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    /// `(hits, misses)` of [`CommitCache::load`]
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::blob::{write_typed, TypedBlob};
    use chunkvault_store::{BoxedChunkAccessor, ChunkStore, Iv, TreeConfig};

    pub(crate) fn accessor() -> Arc<dyn ChunkAccessor> {
        Arc::new(BoxedChunkAccessor::new(&ChunkStore::in_memory("commits"), None))
    }

    pub(crate) fn commit(acc: &Arc<dyn ChunkAccessor>, parents: &[BoxPointer], message: &str) -> BoxPointer {
        let tree = BoxPointer::new(HashValue::of(message.as_bytes()), HashValue::ZERO, Iv::ZERO);
        let blob = TypedBlob::Commit(CommitBox {
            tree,
            parents: parents.to_vec(),
            message: message.as_bytes().to_vec(),
        });
        write_typed(acc.clone(), &blob, TreeConfig::default()).unwrap()
    }

    #[test]
    fn test_find_walks_all_parents() {
        let acc = accessor();
        let root = commit(&acc, &[], "root");
        let left = commit(&acc, &[root], "left");
        let right = commit(&acc, &[root], "right");
        let merge = commit(&acc, &[left, right], "merge");

        let mut cache = CommitCache::new(16);
        let found = cache.find(&acc, &merge, &right.data_hash).unwrap().unwrap();
        assert_eq!(found.commit.message, b"right");
        assert!(cache.is_ancestor(&acc, &root.data_hash, &merge).unwrap());
        assert!(!cache.is_ancestor(&acc, &merge.data_hash, &merge).unwrap());
        assert!(!cache.is_ancestor(&acc, &left.data_hash, &right).unwrap());
        assert!(cache.find(&acc, &left, &HashValue::of(b"elsewhere")).unwrap().is_none());
    }

    #[test]
    fn test_repeated_queries_hit_cache() {
        let acc = accessor();
        let mut head = commit(&acc, &[], "c0");
        for i in 1..10 {
            head = commit(&acc, &[head], &format!("c{}", i));
        }
        let mut cache = CommitCache::new(64);
        let first = commit(&acc, &[], "c0");
        assert!(cache.find(&acc, &head, &first.data_hash).unwrap().is_some());
        let (_, misses) = cache.stats();
        assert!(cache.find(&acc, &head, &first.data_hash).unwrap().is_some());
        assert_eq!(cache.stats().1, misses);
        assert_eq!(cache.len(), 10);
    }

    #[test]
    fn test_capacity_bounds_memo() {
        let acc = accessor();
        let mut head = commit(&acc, &[], "0");
        for i in 1..8 {
            head = commit(&acc, &[head], &i.to_string());
        }
        let mut cache = CommitCache::new(3);
        cache.find(&acc, &head, &HashValue::ZERO).unwrap();
        assert_eq!(cache.len(), 3);
    }
}
