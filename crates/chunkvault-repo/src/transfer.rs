//! Copying commits and the trees they reference between repositories.
//!
//! Everything moves as stored boxes. A commit is copied after its parents and
//! after its directory tree, so a commit present at the destination always has
//! its full history and content there too.

use std::collections::HashSet;
use std::sync::Arc;

use chunkvault_store::{copy_tree, BoxPointer, ChunkAccessor, CopyStats, HashValue};
use tracing::{debug, instrument};

use crate::blob::{read_commit, read_directory};
use crate::error::RepoResult;

/// Copy `head` and every ancestor commit missing at `to`.
#[instrument(skip(from, to), fields(head = %head))]
pub fn copy_commits(
    from: &Arc<dyn ChunkAccessor>,
    to: &Arc<dyn ChunkAccessor>,
    head: &BoxPointer,
) -> RepoResult<CopyStats> {
    let mut stats = CopyStats::default();
    let mut seen: HashSet<HashValue> = HashSet::new();
    let mut ordered = Vec::new();
    // (commit, parents already pushed)
    let mut stack = vec![(*head, false)];
    while let Some((pointer, expanded)) = stack.pop() {
        if expanded {
            ordered.push(pointer);
            continue;
        }
        if !seen.insert(pointer.data_hash) || to.has_box(&pointer.box_hash)? {
            continue;
        }
        let commit = read_commit(from.clone(), &pointer)?;
        stack.push((pointer, true));
        for parent in commit.parents.iter().rev() {
            stack.push((*parent, false));
        }
    }
    for pointer in &ordered {
        let commit = read_commit(from.clone(), pointer)?;
        stats += copy_directory(from, to, &commit.tree)?;
        stats += copy_tree(from.as_ref(), to.as_ref(), pointer)?;
    }
    debug!(commits = ordered.len(), copied = stats.copied, skipped = stats.skipped, "copied commits");
    Ok(stats)
}

/// Copy a directory tree, its files and subdirectories; present directories are skipped whole.
pub fn copy_directory(
    from: &Arc<dyn ChunkAccessor>,
    to: &Arc<dyn ChunkAccessor>,
    pointer: &BoxPointer,
) -> RepoResult<CopyStats> {
    let mut stats = CopyStats::default();
    if to.has_box(&pointer.box_hash)? {
        stats.skipped += 1;
        return Ok(stats);
    }
    let dir = read_directory(from.clone(), pointer)?;
    for entry in dir.entries() {
        let Some(data) = entry.data_pointer else {
            continue;
        };
        if entry.is_file {
            stats += copy_tree(from.as_ref(), to.as_ref(), &data)?;
        } else {
            stats += copy_directory(from, to, &data)?;
        }
        for attrs in [entry.encrypted_attrs, entry.attrs].into_iter().flatten() {
            stats += copy_tree(from.as_ref(), to.as_ref(), &attrs)?;
        }
    }
    stats += copy_tree(from.as_ref(), to.as_ref(), pointer)?;
    Ok(stats)
}
