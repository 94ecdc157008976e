#![warn(missing_docs)]

//! Versioned repository over chunkvault container trees.
//!
//! A repository keeps a working tree of directories and files as typed blobs
//! in a chunk store. Committing flushes the working tree and records a commit
//! in the branch log; histories from other repositories are brought in by
//! fast-forward or three-way merge.

pub mod ancestors;
pub mod blob;
pub mod branch_log;
pub mod callback;
pub mod cli;
pub mod commit_cache;
pub mod config;
pub mod diff;
pub mod directory;
pub mod error;
pub mod merge;
pub mod repository;
pub mod transfer;
pub mod tree_accessor;

pub use ancestors::{find_common_ancestors, AncestorChain};
pub use blob::{read_commit, read_directory, read_typed, write_typed, CommitBox, TypedBlob};
pub use branch_log::{BranchLog, LogEntry};
pub use callback::{CommitCallback, EncryptedCommitCallback, PlainCommitCallback};
pub use commit_cache::{CommitCache, CommitRecord};
pub use config::RepoConfig;
pub use diff::{ChangeKind, DiffEntry, TreeDiff};
pub use directory::{BasicFileAttrs, DirEntry, DirectoryBlob};
pub use error::{RepoError, RepoResult};
pub use merge::{merge_trees, ConflictPolicy, MergeStats};
pub use repository::{MergeOutcome, Repository};
pub use transfer::{copy_commits, copy_directory};
pub use tree_accessor::TreeAccessor;
