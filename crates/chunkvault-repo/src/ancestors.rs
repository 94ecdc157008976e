//! Nearest common ancestors of two commit heads.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chunkvault_store::{BoxPointer, ChunkAccessor, HashValue};
use tracing::debug;

use crate::commit_cache::CommitCache;
use crate::error::RepoResult;

/// A common ancestor and the commit chains leading from it to both heads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AncestorChain {
    /// The shared commit
    pub ancestor: BoxPointer,
    /// Commits after `ancestor` up to and including our head, oldest first
    pub ours: Vec<BoxPointer>,
    /// Commits after `ancestor` up to and including their head, oldest first
    pub theirs: Vec<BoxPointer>,
}

impl AncestorChain {
    /// Commits on both sides since the ancestor
    pub fn cost(&self) -> usize {
        self.ours.len() + self.theirs.len()
    }
}

/// Breadth-first walk recording, for each commit, the child it was reached from.
struct Walk {
    order: Vec<BoxPointer>,
    child_of: HashMap<HashValue, Option<BoxPointer>>,
}

impl Walk {
    /// Commits from just after `from` up to the head of the walk
    fn chain(&self, from: &BoxPointer) -> Vec<BoxPointer> {
        let mut chain = Vec::new();
        let mut current = self.child_of.get(&from.data_hash).copied().flatten();
        while let Some(pointer) = current {
            chain.push(pointer);
            current = self.child_of.get(&pointer.data_hash).copied().flatten();
        }
        chain
    }
}

fn walk(
    cache: &mut CommitCache,
    accessor: &Arc<dyn ChunkAccessor>,
    head: &BoxPointer,
    stop: Option<&HashMap<HashValue, Option<BoxPointer>>>,
) -> RepoResult<Walk> {
    let mut walk = Walk {
        order: Vec::new(),
        child_of: HashMap::from([(head.data_hash, None)]),
    };
    let mut queue = VecDeque::from([*head]);
    while let Some(pointer) = queue.pop_front() {
        walk.order.push(pointer);
        if stop.is_some_and(|s| s.contains_key(&pointer.data_hash)) {
            continue;
        }
        let record = cache.load(accessor, &pointer)?;
        for parent in &record.commit.parents {
            if !walk.child_of.contains_key(&parent.data_hash) {
                walk.child_of.insert(parent.data_hash, Some(pointer));
                queue.push_back(*parent);
            }
        }
    }
    Ok(walk)
}

/// All nearest common ancestors of `ours` and `theirs`, cheapest first.
///
/// A candidate reachable from another candidate is dropped. Ties are broken by
/// hash so the result is deterministic.
pub fn find_common_ancestors(
    cache: &mut CommitCache,
    accessor: &Arc<dyn ChunkAccessor>,
    ours: &BoxPointer,
    theirs: &BoxPointer,
) -> RepoResult<Vec<AncestorChain>> {
    let our_walk = walk(cache, accessor, ours, None)?;
    let their_walk = walk(cache, accessor, theirs, Some(&our_walk.child_of))?;

    let candidates: Vec<BoxPointer> = their_walk
        .order
        .iter()
        .filter(|p| our_walk.child_of.contains_key(&p.data_hash))
        .copied()
        .collect();

    let mut nearest = Vec::new();
    for candidate in &candidates {
        let mut shadowed = false;
        for other in candidates.iter().filter(|o| o.data_hash != candidate.data_hash) {
            if cache.is_ancestor(accessor, &candidate.data_hash, other)? {
                shadowed = true;
                break;
            }
        }
        if !shadowed {
            nearest.push(AncestorChain {
                ancestor: *candidate,
                ours: our_walk.chain(candidate),
                theirs: their_walk.chain(candidate),
            });
        }
    }
    nearest.sort_by(|a, b| {
        a.cost()
            .cmp(&b.cost())
            .then_with(|| a.ancestor.data_hash.cmp(&b.ancestor.data_hash))
    });
    debug!(%ours, %theirs, candidates = candidates.len(), nearest = nearest.len(), "common ancestors");
    Ok(nearest)
}
