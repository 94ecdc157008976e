//! Differences between two directory trees.

use std::collections::BTreeSet;
use std::sync::Arc;

use chunkvault_store::{BoxPointer, ChunkAccessor};
use serde::Serialize;

use crate::blob::read_directory;
use crate::directory::{DirEntry, DirectoryBlob};
use crate::error::RepoResult;

/// How a path differs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// Only in the end tree
    Added,
    /// Only in the base tree
    Removed,
    /// File content differs
    Modified,
}

/// One changed path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DiffEntry {
    /// Slash-separated path from the root
    pub path: String,
    /// Kind of change
    pub kind: ChangeKind,
    /// File or directory
    pub is_file: bool,
}

enum Step {
    Emit(DiffEntry),
    Compare {
        path: String,
        base: Option<BoxPointer>,
        end: Option<BoxPointer>,
    },
}

/// Lazily walks two trees, yielding changes in path order.
///
/// Identical subtrees are skipped without loading them. Added and removed
/// directories are reported and then their contents. A path that changes kind
/// is reported as removed and then added.
pub struct TreeDiff {
    accessor: Arc<dyn ChunkAccessor>,
    stack: Vec<Step>,
}

impl TreeDiff {
    /// Diff the directory tree at `base` against the one at `end`
    pub fn new(accessor: Arc<dyn ChunkAccessor>, base: &BoxPointer, end: &BoxPointer) -> Self {
        let mut stack = Vec::new();
        if !base.same_data(end) {
            stack.push(Step::Compare {
                path: String::new(),
                base: Some(*base),
                end: Some(*end),
            });
        }
        Self { accessor, stack }
    }

    fn load(&self, pointer: Option<BoxPointer>) -> RepoResult<DirectoryBlob> {
        match pointer {
            Some(pointer) => read_directory(self.accessor.clone(), &pointer),
            None => Ok(DirectoryBlob::new()),
        }
    }

    fn expand(&mut self, path: &str, base: Option<BoxPointer>, end: Option<BoxPointer>) -> RepoResult<()> {
        let base_dir = self.load(base)?;
        let end_dir = self.load(end)?;
        let names: BTreeSet<&str> = base_dir
            .entries()
            .chain(end_dir.entries())
            .map(|e| e.name.as_str())
            .collect();
        let mut steps = Vec::new();
        for name in names {
            let child = if path.is_empty() {
                name.to_string()
            } else {
                format!("{}/{}", path, name)
            };
            match (base_dir.get(name), end_dir.get(name)) {
                (Some(b), Some(e)) if b.same_content(e) => {}
                (Some(b), Some(e)) if !b.is_file && !e.is_file => steps.push(Step::Compare {
                    path: child,
                    base: b.data_pointer,
                    end: e.data_pointer,
                }),
                (Some(b), Some(e)) if b.is_file && e.is_file => {
                    steps.push(emit(child, ChangeKind::Modified, true));
                }
                (b, e) => {
                    if let Some(b) = b {
                        side(&mut steps, child.clone(), b, ChangeKind::Removed);
                    }
                    if let Some(e) = e {
                        side(&mut steps, child, e, ChangeKind::Added);
                    }
                }
            }
        }
        self.stack.extend(steps.into_iter().rev());
        Ok(())
    }
}

fn emit(path: String, kind: ChangeKind, is_file: bool) -> Step {
    Step::Emit(DiffEntry { path, kind, is_file })
}

/// Report an entry present on one side only, then its contents if it is a directory.
fn side(steps: &mut Vec<Step>, path: String, entry: &DirEntry, kind: ChangeKind) {
    steps.push(emit(path.clone(), kind, entry.is_file));
    if !entry.is_file {
        let (base, end) = match kind {
            ChangeKind::Removed => (entry.data_pointer, None),
            _ => (None, entry.data_pointer),
        };
        steps.push(Step::Compare { path, base, end });
    }
}

impl Iterator for TreeDiff {
    type Item = RepoResult<DiffEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.stack.pop()? {
                Step::Emit(entry) => return Some(Ok(entry)),
                Step::Compare { path, base, end } => {
                    if let Err(e) = self.expand(&path, base, end) {
                        self.stack.clear();
                        return Some(Err(e));
                    }
                }
            }
        }
    }
}
