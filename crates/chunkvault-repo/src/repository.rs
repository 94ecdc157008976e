//! A versioned repository: working tree, commits, branch log and merges.
//!
//! All operations take the per-repository state lock, so one repository
//! handle can be shared between threads.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chunkvault_store::{
    BoxPointer, BoxedChunkAccessor, ChunkAccessor, ChunkStore, CryptoConfig, EncryptionKey,
    HashValue, OpenMode, StoreRegistry, StoreStats,
};
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use crate::ancestors::find_common_ancestors;
use crate::blob::{write_typed, CommitBox, TypedBlob};
use crate::branch_log::{BranchLog, LogEntry};
use crate::callback::{CommitCallback, EncryptedCommitCallback, PlainCommitCallback};
use crate::commit_cache::{CommitCache, CommitRecord};
use crate::config::RepoConfig;
use crate::diff::{DiffEntry, TreeDiff};
use crate::error::{RepoError, RepoResult};
use crate::merge::{merge_trees, MergeStats};
use crate::transfer::copy_commits;
use crate::tree_accessor::TreeAccessor;

/// Result of [`Repository::merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// Head moved to the given commit without a merge commit
    FastForward(BoxPointer),
    /// The working tree has changes; nothing was done
    UncommittedChanges,
    /// Head is the given commit, which contains both histories
    Merged(BoxPointer),
}

struct RepoState {
    head: Option<CommitRecord>,
    log: BranchLog,
    tree: TreeAccessor,
    commits: CommitCache,
    last_merge: MergeStats,
}

/// Repository handle over one chunk store and one branch.
pub struct Repository {
    dir: PathBuf,
    config: RepoConfig,
    store: ChunkStore,
    accessor: Arc<BoxedChunkAccessor>,
    callback: Box<dyn CommitCallback>,
    state: Mutex<RepoState>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("dir", &self.dir)
            .field("branch", &self.config.branch)
            .field("store", &self.store.id())
            .finish()
    }
}

impl Repository {
    /// Create a repository in `dir`, or open it if it already exists
    pub fn init(
        registry: &StoreRegistry,
        dir: &Path,
        config: RepoConfig,
        key: Option<EncryptionKey>,
    ) -> RepoResult<Self> {
        Self::open_with(registry, dir, config, key, OpenMode::Create)
    }

    /// Open an existing repository
    pub fn open(
        registry: &StoreRegistry,
        dir: &Path,
        config: RepoConfig,
        key: Option<EncryptionKey>,
    ) -> RepoResult<Self> {
        Self::open_with(registry, dir, config, key, OpenMode::Existing)
    }

    fn open_with(
        registry: &StoreRegistry,
        dir: &Path,
        config: RepoConfig,
        key: Option<EncryptionKey>,
        mode: OpenMode,
    ) -> RepoResult<Self> {
        config.validate()?;
        let store = registry.open(&dir.join(&config.store.dir), &config.store.name, mode)?;
        let crypto = key.map(|key| CryptoConfig {
            key,
            algorithm: config.store.algorithm,
        });
        let callback: Box<dyn CommitCallback> = match &crypto {
            Some(crypto) => Box::new(EncryptedCommitCallback::new(crypto.clone())),
            None => Box::new(PlainCommitCallback),
        };
        let accessor = Arc::new(BoxedChunkAccessor::new(&store, crypto));
        let shared: Arc<dyn ChunkAccessor> = accessor.clone();

        let log = BranchLog::open(dir, &config.branch)?;
        let mut commits = CommitCache::new(config.commit_cache_capacity);
        let head = match log.latest() {
            Some(entry) => {
                let pointer = callback.commit_pointer(&entry.message)?;
                Some(commits.load(&shared, &pointer)?)
            }
            None => None,
        };
        let tree = TreeAccessor::open(
            shared,
            config.store.tree,
            head.as_ref().map(|h| h.commit.tree),
        )?;
        info!(
            dir = %dir.display(),
            branch = %config.branch,
            revision = log.revision(),
            encrypted = accessor.is_encrypted(),
            "opened repository"
        );
        Ok(Self {
            dir: dir.to_path_buf(),
            config,
            store,
            accessor,
            callback,
            state: Mutex::new(RepoState {
                head,
                log,
                tree,
                commits,
                last_merge: MergeStats::default(),
            }),
        })
    }

    /// Repository directory
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Active configuration
    pub fn config(&self) -> &RepoConfig {
        &self.config
    }

    /// Accessor reading and writing this repository's boxes
    pub fn accessor(&self) -> Arc<dyn ChunkAccessor> {
        self.accessor.clone()
    }

    /// Store statistics
    pub fn store_stats(&self) -> StoreStats {
        self.store.stats()
    }

    /// Current head commit
    pub fn head(&self) -> Option<BoxPointer> {
        self.state.lock().head.as_ref().map(|h| h.pointer)
    }

    /// Latest branch log revision, 0 before the first commit
    pub fn revision(&self) -> u64 {
        self.state.lock().log.revision()
    }

    /// Branch log records, oldest first
    pub fn log_entries(&self) -> Vec<LogEntry> {
        self.state.lock().log.entries().to_vec()
    }

    /// Conflict counts of the last three-way merge
    pub fn last_merge_stats(&self) -> MergeStats {
        self.state.lock().last_merge
    }

    /// Create or replace a file in the working tree
    pub fn write_bytes(&self, path: &str, data: &[u8]) -> RepoResult<()> {
        self.state.lock().tree.write_bytes(path, data)
    }

    /// Read a file from the working tree
    pub fn read_bytes(&self, path: &str) -> RepoResult<Vec<u8>> {
        self.state.lock().tree.read_bytes(path)
    }

    /// Remove a file or directory from the working tree
    pub fn remove(&self, path: &str) -> RepoResult<()> {
        self.state.lock().tree.remove(path)
    }

    /// Subdirectory names of a working tree directory
    pub fn list_directories(&self, path: &str) -> RepoResult<Vec<String>> {
        self.state.lock().tree.list_directories(path)
    }

    /// File names of a working tree directory
    pub fn list_files(&self, path: &str) -> RepoResult<Vec<String>> {
        self.state.lock().tree.list_files(path)
    }

    /// Whether the working tree has a file at `path`
    pub fn has_file(&self, path: &str) -> RepoResult<bool> {
        self.state.lock().tree.has_file(path)
    }

    /// Whether the working tree has uncommitted changes
    pub fn is_modified(&self) -> bool {
        self.state.lock().tree.is_modified()
    }

    /// Drop uncommitted changes
    pub fn discard(&self) -> RepoResult<()> {
        let mut state = self.state.lock();
        let root = state.head.as_ref().map(|h| h.commit.tree);
        state.tree = TreeAccessor::open(self.accessor(), self.config.store.tree, root)?;
        Ok(())
    }

    /// Commit the working tree. Returns `None` when nothing changed since head.
    #[instrument(skip(self))]
    pub fn commit(&self, message: &str) -> RepoResult<Option<BoxPointer>> {
        let mut state = self.state.lock();
        if !state.tree.is_modified() && state.head.is_some() {
            return Ok(None);
        }
        let tree = state.tree.flush()?;
        let parents = match &state.head {
            Some(head) if head.commit.tree.same_data(&tree) => {
                debug!("working tree matches head, nothing to commit");
                return Ok(None);
            }
            Some(head) => vec![head.pointer],
            None => Vec::new(),
        };
        self.record_commit(&mut state, tree, parents, message).map(Some)
    }

    /// Commits from head following first parents, newest first
    pub fn history(&self) -> RepoResult<Vec<CommitRecord>> {
        let mut state = self.state.lock();
        let accessor = self.accessor();
        let mut history = Vec::new();
        let mut next = state.head.as_ref().map(|h| h.pointer);
        while let Some(pointer) = next {
            let record = state.commits.load(&accessor, &pointer)?;
            next = record.commit.parents.first().copied();
            history.push(record);
        }
        Ok(history)
    }

    /// Bring in the history ending at `other_head` from another repository's accessor.
    ///
    /// Both accessors must use the same key, since boxes are copied as stored.
    #[instrument(skip(self, other), fields(other = %other_head))]
    pub fn merge(
        &self,
        other: &Arc<dyn ChunkAccessor>,
        other_head: &BoxPointer,
    ) -> RepoResult<MergeOutcome> {
        let mut state = self.state.lock();
        if state.tree.is_modified() {
            return Ok(MergeOutcome::UncommittedChanges);
        }
        let local = self.accessor();
        copy_commits(other, &local, other_head)?;

        let Some(head) = state.head.clone() else {
            self.fast_forward(&mut state, other_head)?;
            return Ok(MergeOutcome::FastForward(*other_head));
        };
        if head.pointer.same_data(other_head) {
            return Ok(MergeOutcome::FastForward(head.pointer));
        }
        if state.commits.is_ancestor(&local, &head.hash(), other_head)? {
            self.fast_forward(&mut state, other_head)?;
            return Ok(MergeOutcome::FastForward(*other_head));
        }
        if state.commits.is_ancestor(&local, &other_head.data_hash, &head.pointer)? {
            debug!("other head already contained in local history");
            return Ok(MergeOutcome::Merged(head.pointer));
        }

        let chains = find_common_ancestors(&mut state.commits, &local, &head.pointer, other_head)?;
        let nearest = chains.first().ok_or(RepoError::NoCommonAncestor {
            ours: head.hash(),
            theirs: other_head.data_hash,
        })?;
        let base = state.commits.load(&local, &nearest.ancestor)?;
        let theirs = state.commits.load(&local, other_head)?;
        let (tree, stats) = merge_trees(
            &local,
            self.config.store.tree,
            Some(&base.commit.tree),
            &head.commit.tree,
            &theirs.commit.tree,
            self.config.conflict_policy,
        )?;
        let message = format!("merge {}", other_head.data_hash);
        let pointer = self.record_commit(&mut state, tree, vec![head.pointer, *other_head], &message)?;
        state.tree = TreeAccessor::open(local, self.config.store.tree, Some(tree))?;
        state.last_merge = stats;
        Ok(MergeOutcome::Merged(pointer))
    }

    /// Paths that differ between two commits reachable from head
    pub fn get_diff(&self, base: &HashValue, end: &HashValue) -> RepoResult<Vec<DiffEntry>> {
        let accessor = self.accessor();
        let mut state = self.state.lock();
        let head = state
            .head
            .as_ref()
            .map(|h| h.pointer)
            .ok_or(RepoError::CommitNotFound(*base))?;
        let base_record = state
            .commits
            .find(&accessor, &head, base)?
            .ok_or(RepoError::CommitNotFound(*base))?;
        let end_record = state
            .commits
            .find(&accessor, &head, end)?
            .ok_or(RepoError::CommitNotFound(*end))?;
        let entries = TreeDiff::new(accessor, &base_record.commit.tree, &end_record.commit.tree).collect();
        drop(state);
        entries
    }

    /// Release the store handle back to `registry`
    pub fn close(self, registry: &StoreRegistry) {
        let Repository {
            store,
            accessor,
            state,
            ..
        } = self;
        drop(state);
        drop(accessor);
        registry.release(store);
    }

    fn record_commit(
        &self,
        state: &mut RepoState,
        tree: BoxPointer,
        parents: Vec<BoxPointer>,
        message: &str,
    ) -> RepoResult<BoxPointer> {
        let commit = CommitBox {
            tree,
            parents,
            message: message.as_bytes().to_vec(),
        };
        let pointer = write_typed(
            self.accessor(),
            &TypedBlob::Commit(commit.clone()),
            self.config.store.tree,
        )?;
        let revision = self.publish(state, &pointer)?;
        info!(revision, commit = %pointer.data_hash, parents = commit.parents.len(), "committed");
        let record = CommitRecord { pointer, commit };
        state.commits.insert(record.clone());
        state.head = Some(record);
        Ok(pointer)
    }

    fn fast_forward(&self, state: &mut RepoState, target: &BoxPointer) -> RepoResult<()> {
        let accessor = self.accessor();
        let record = state.commits.load(&accessor, target)?;
        let revision = self.publish(state, target)?;
        state.tree = TreeAccessor::open(accessor, self.config.store.tree, Some(record.commit.tree))?;
        state.head = Some(record);
        info!(revision, commit = %target.data_hash, "fast-forwarded");
        Ok(())
    }

    /// Make the store durable, then record `head` in the branch log.
    fn publish(&self, state: &mut RepoState, head: &BoxPointer) -> RepoResult<u64> {
        let changes = self.accessor.transaction().changes();
        let message = self.callback.log_message(head)?;
        self.accessor.commit_transaction()?;
        state.log.append(&message, &changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn init(dir: &Path) -> Repository {
        Repository::init(&StoreRegistry::new(), dir, RepoConfig::default(), None).unwrap()
    }

    #[test]
    fn test_first_commit_and_noop() {
        let dir = TempDir::new().unwrap();
        let repo = init(dir.path());
        assert_eq!(repo.head(), None);
        repo.write_bytes("a", b"hello").unwrap();
        let first = repo.commit("first").unwrap().unwrap();
        assert_eq!(repo.head(), Some(first));
        assert_eq!(repo.revision(), 1);
        assert_eq!(repo.commit("again").unwrap(), None);

        repo.write_bytes("a", b"hello").unwrap();
        assert!(repo.is_modified());
        assert_eq!(repo.commit("same content").unwrap(), None);
        assert_eq!(repo.revision(), 1);
    }

    #[test]
    fn test_history_follows_first_parent() {
        let dir = TempDir::new().unwrap();
        let repo = init(dir.path());
        for i in 0..3 {
            repo.write_bytes("f", format!("v{}", i).as_bytes()).unwrap();
            repo.commit(&format!("c{}", i)).unwrap();
        }
        let messages: Vec<String> = repo
            .history()
            .unwrap()
            .iter()
            .map(|r| r.commit.message_text())
            .collect();
        assert_eq!(messages, vec!["c2", "c1", "c0"]);
    }

    #[test]
    fn test_log_records_written_chunks() {
        let dir = TempDir::new().unwrap();
        let repo = init(dir.path());
        repo.write_bytes("x", b"content").unwrap();
        repo.commit("x").unwrap();
        let entries = repo.log_entries();
        assert_eq!(entries.len(), 1);
        assert!(!entries[0].changes.is_empty());
        assert!(entries[0].message.contains(&repo.head().unwrap().data_hash.to_hex()));
    }

    #[test]
    fn test_discard_restores_head_tree() {
        let dir = TempDir::new().unwrap();
        let repo = init(dir.path());
        repo.write_bytes("kept", b"1").unwrap();
        repo.commit("one").unwrap();
        repo.write_bytes("scratch", b"2").unwrap();
        repo.discard().unwrap();
        assert!(!repo.is_modified());
        assert!(!repo.has_file("scratch").unwrap());
        assert_eq!(repo.read_bytes("kept").unwrap(), b"1");
    }

    #[test]
    fn test_diff_between_commits() {
        let dir = TempDir::new().unwrap();
        let repo = init(dir.path());
        repo.write_bytes("a", b"1").unwrap();
        let first = repo.commit("one").unwrap().unwrap();
        repo.write_bytes("b", b"2").unwrap();
        let second = repo.commit("two").unwrap().unwrap();

        let diff = repo.get_diff(&first.data_hash, &second.data_hash).unwrap();
        assert_eq!(diff.len(), 1);
        assert_eq!(diff[0].path, "b");
        assert!(matches!(
            repo.get_diff(&HashValue::of(b"nothing"), &second.data_hash),
            Err(RepoError::CommitNotFound(_))
        ));
    }

    #[test]
    fn test_diff_while_committing() {
        let dir = TempDir::new().unwrap();
        let repo = init(dir.path());
        repo.write_bytes("base", b"0").unwrap();
        let first = repo.commit("base").unwrap().unwrap();
        repo.write_bytes("next", b"1").unwrap();
        let second = repo.commit("next").unwrap().unwrap();

        std::thread::scope(|scope| {
            scope.spawn(|| {
                for i in 0..20 {
                    repo.write_bytes(&format!("extra{}", i), b"x").unwrap();
                    repo.commit("extra").unwrap();
                }
            });
            for _ in 0..20 {
                let diff = repo.get_diff(&first.data_hash, &second.data_hash).unwrap();
                assert_eq!(diff.len(), 1);
                assert_eq!(diff[0].path, "next");
            }
        });
        assert_eq!(repo.revision(), 22);
    }

    #[test]
    fn test_merge_with_dirty_tree_is_refused() {
        let dir = TempDir::new().unwrap();
        let repo = init(dir.path());
        repo.write_bytes("a", b"1").unwrap();
        let head = repo.commit("one").unwrap().unwrap();
        repo.write_bytes("a", b"2").unwrap();
        assert_eq!(
            repo.merge(&repo.accessor(), &head).unwrap(),
            MergeOutcome::UncommittedChanges
        );
    }
}
