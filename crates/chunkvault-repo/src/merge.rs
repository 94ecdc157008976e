//! Three-way merge of directory trees.
//!
//! Per name, with `b`, `o`, `t` the base, our and their entries:
//! identical sides keep ours, a side equal to the base takes the other side,
//! two changed directories merge recursively, and anything else is a conflict
//! resolved by [`ConflictPolicy`].

use std::collections::BTreeSet;
use std::sync::Arc;

use chunkvault_store::{BoxPointer, ChunkAccessor, TreeConfig};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::blob::{read_directory, write_typed, TypedBlob};
use crate::directory::{DirEntry, DirectoryBlob};
use crate::error::RepoResult;

/// Which side wins when both changed the same name differently.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ConflictPolicy {
    /// Keep the local entry
    #[default]
    Ours,
    /// Take the merged-in entry
    Theirs,
}

/// What a merge did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeStats {
    /// Entries taken from their side without conflict
    pub taken_theirs: u64,
    /// Names changed differently on both sides
    pub conflicts: u64,
}

/// Merge the directory trees `ours` and `theirs` against `base` and store the result.
pub fn merge_trees(
    accessor: &Arc<dyn ChunkAccessor>,
    config: TreeConfig,
    base: Option<&BoxPointer>,
    ours: &BoxPointer,
    theirs: &BoxPointer,
    policy: ConflictPolicy,
) -> RepoResult<(BoxPointer, MergeStats)> {
    let mut stats = MergeStats::default();
    if ours.same_data(theirs) || base.is_some_and(|b| b.same_data(theirs)) {
        return Ok((*ours, stats));
    }
    if base.is_some_and(|b| b.same_data(ours)) {
        stats.taken_theirs += 1;
        return Ok((*theirs, stats));
    }
    let mut merger = Merger {
        accessor,
        config,
        policy,
        stats: &mut stats,
    };
    let pointer = merger.merge_pointers(base, ours, theirs, "")?;
    debug!(root = %pointer, taken_theirs = stats.taken_theirs, conflicts = stats.conflicts, "merged trees");
    Ok((pointer, stats))
}

struct Merger<'a> {
    accessor: &'a Arc<dyn ChunkAccessor>,
    config: TreeConfig,
    policy: ConflictPolicy,
    stats: &'a mut MergeStats,
}

impl Merger<'_> {
    fn merge_pointers(
        &mut self,
        base: Option<&BoxPointer>,
        ours: &BoxPointer,
        theirs: &BoxPointer,
        path: &str,
    ) -> RepoResult<BoxPointer> {
        let base_dir = match base {
            Some(pointer) => read_directory(self.accessor.clone(), pointer)?,
            None => DirectoryBlob::new(),
        };
        let our_dir = read_directory(self.accessor.clone(), ours)?;
        let their_dir = read_directory(self.accessor.clone(), theirs)?;

        let names: BTreeSet<&str> = base_dir
            .entries()
            .chain(our_dir.entries())
            .chain(their_dir.entries())
            .map(|e| e.name.as_str())
            .collect();
        let mut merged = DirectoryBlob::new();
        for name in names {
            let child = join(path, name);
            let entry = self.merge_entry(
                base_dir.get(name),
                our_dir.get(name),
                their_dir.get(name),
                &child,
            )?;
            if let Some(entry) = entry {
                merged.insert(entry);
            }
        }
        write_typed(self.accessor.clone(), &TypedBlob::Directory(merged), self.config)
    }

    fn merge_entry(
        &mut self,
        base: Option<&DirEntry>,
        ours: Option<&DirEntry>,
        theirs: Option<&DirEntry>,
        path: &str,
    ) -> RepoResult<Option<DirEntry>> {
        if same(ours, theirs) || same(base, theirs) {
            return Ok(ours.cloned());
        }
        if same(base, ours) {
            self.stats.taken_theirs += 1;
            return Ok(theirs.cloned());
        }
        if let (Some(o), Some(t)) = (ours, theirs) {
            if !o.is_file && !t.is_file {
                if let (Some(op), Some(tp)) = (o.data_pointer, t.data_pointer) {
                    let bp = base.filter(|b| !b.is_file).and_then(|b| b.data_pointer);
                    let pointer = self.merge_pointers(bp.as_ref(), &op, &tp, path)?;
                    let mut entry = o.clone();
                    entry.data_pointer = Some(pointer);
                    return Ok(Some(entry));
                }
            }
        }
        self.stats.conflicts += 1;
        warn!(path, policy = ?self.policy, "merge conflict");
        Ok(match self.policy {
            ConflictPolicy::Ours => ours.cloned(),
            ConflictPolicy::Theirs => theirs.cloned(),
        })
    }
}

fn same(a: Option<&DirEntry>, b: Option<&DirEntry>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => a.same_content(b),
        _ => false,
    }
}

fn join(parent: &str, name: &str) -> String {
    if parent.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", parent, name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree_accessor::TreeAccessor;
    use chunkvault_store::{BoxedChunkAccessor, ChunkStore};

    fn accessor() -> Arc<dyn ChunkAccessor> {
        Arc::new(BoxedChunkAccessor::new(&ChunkStore::in_memory("merge"), None))
    }

    fn build(acc: &Arc<dyn ChunkAccessor>, base: Option<BoxPointer>, edits: &[(&str, Option<&str>)]) -> BoxPointer {
        let mut tree = TreeAccessor::open(acc.clone(), TreeConfig::default(), base).unwrap();
        for (path, content) in edits {
            match content {
                Some(text) => tree.write_bytes(path, text.as_bytes()).unwrap(),
                None => tree.remove(path).unwrap(),
            }
        }
        tree.flush().unwrap()
    }

    fn read(acc: &Arc<dyn ChunkAccessor>, root: BoxPointer, path: &str) -> Option<Vec<u8>> {
        let mut tree = TreeAccessor::open(acc.clone(), TreeConfig::default(), Some(root)).unwrap();
        tree.read_bytes(path).ok()
    }

    #[test]
    fn test_disjoint_changes_combine() {
        let acc = accessor();
        let base = build(&acc, None, &[("a", Some("1")), ("d/x", Some("x")), ("gone", Some("g"))]);
        let ours = build(&acc, Some(base), &[("a", Some("ours")), ("gone", None)]);
        let theirs = build(&acc, Some(base), &[("d/y", Some("y")), ("new", Some("n"))]);

        let (merged, stats) =
            merge_trees(&acc, TreeConfig::default(), Some(&base), &ours, &theirs, ConflictPolicy::Ours).unwrap();
        assert_eq!(stats.conflicts, 0);
        assert_eq!(read(&acc, merged, "a").unwrap(), b"ours");
        assert_eq!(read(&acc, merged, "d/x").unwrap(), b"x");
        assert_eq!(read(&acc, merged, "d/y").unwrap(), b"y");
        assert_eq!(read(&acc, merged, "new").unwrap(), b"n");
        assert!(read(&acc, merged, "gone").is_none());
    }

    #[test]
    fn test_conflict_follows_policy() {
        let acc = accessor();
        let base = build(&acc, None, &[("f", Some("base"))]);
        let ours = build(&acc, Some(base), &[("f", Some("ours"))]);
        let theirs = build(&acc, Some(base), &[("f", Some("theirs"))]);

        let (merged, stats) =
            merge_trees(&acc, TreeConfig::default(), Some(&base), &ours, &theirs, ConflictPolicy::Ours).unwrap();
        assert_eq!(stats.conflicts, 1);
        assert_eq!(read(&acc, merged, "f").unwrap(), b"ours");

        let (merged, _) =
            merge_trees(&acc, TreeConfig::default(), Some(&base), &ours, &theirs, ConflictPolicy::Theirs).unwrap();
        assert_eq!(read(&acc, merged, "f").unwrap(), b"theirs");
    }

    #[test]
    fn test_unchanged_side_short_circuits() {
        let acc = accessor();
        let base = build(&acc, None, &[("f", Some("1"))]);
        let theirs = build(&acc, Some(base), &[("f", Some("2"))]);
        let (merged, stats) =
            merge_trees(&acc, TreeConfig::default(), Some(&base), &base, &theirs, ConflictPolicy::Ours).unwrap();
        assert_eq!(merged, theirs);
        assert_eq!(stats.taken_theirs, 1);
    }

    #[test]
    fn test_file_against_directory_conflicts() {
        let acc = accessor();
        let base = build(&acc, None, &[("keep", Some("k"))]);
        let ours = build(&acc, Some(base), &[("p", Some("file"))]);
        let theirs = build(&acc, Some(base), &[("p/inner", Some("dir"))]);
        let (merged, stats) =
            merge_trees(&acc, TreeConfig::default(), Some(&base), &ours, &theirs, ConflictPolicy::Theirs).unwrap();
        assert_eq!(stats.conflicts, 1);
        assert_eq!(read(&acc, merged, "p/inner").unwrap(), b"dir");
    }
}
