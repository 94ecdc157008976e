//! Mutable working view of a committed directory tree.
//!
//! Directories are loaded on first access and kept. Writes mark every entry on
//! the path to the root dirty (null data pointer) and keep new file contents in
//! memory until [`TreeAccessor::flush`] writes them bottom-up.

use std::collections::HashMap;
use std::sync::Arc;

use chunkvault_store::{read_blob, write_blob, BoxPointer, ChunkAccessor, StoreError, TreeConfig};
use tracing::{debug, instrument};

use crate::blob::{read_directory, write_typed, TypedBlob};
use crate::directory::{valid_name, DirEntry, DirectoryBlob};
use crate::error::{RepoError, RepoResult};

enum Cached {
    Dir(Box<DirState>),
    File(Vec<u8>),
}

#[derive(Default)]
struct DirState {
    blob: DirectoryBlob,
    cached: HashMap<String, Cached>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Walk {
    Read,
    Write,
    Create,
}

/// Split a slash-separated repository path into components. `""` is the root.
pub fn parse_path(path: &str) -> RepoResult<Vec<&str>> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    let parts: Vec<&str> = trimmed.split('/').collect();
    if parts.iter().all(|p| valid_name(p)) {
        Ok(parts)
    } else {
        Err(RepoError::InvalidPath(path.to_string()))
    }
}

/// Working tree over a directory hierarchy stored in container trees.
pub struct TreeAccessor {
    accessor: Arc<dyn ChunkAccessor>,
    config: TreeConfig,
    root: DirState,
    root_pointer: Option<BoxPointer>,
    modified: bool,
}

impl std::fmt::Debug for TreeAccessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TreeAccessor")
            .field("root_pointer", &self.root_pointer)
            .field("modified", &self.modified)
            .finish()
    }
}

impl TreeAccessor {
    /// Open the tree rooted at `root`, or an empty tree
    pub fn open(
        accessor: Arc<dyn ChunkAccessor>,
        config: TreeConfig,
        root: Option<BoxPointer>,
    ) -> RepoResult<Self> {
        let state = match &root {
            Some(pointer) => DirState {
                blob: read_directory(accessor.clone(), pointer)?,
                cached: HashMap::new(),
            },
            None => DirState::default(),
        };
        Ok(Self {
            accessor,
            config,
            root: state,
            root_pointer: root,
            modified: false,
        })
    }

    /// Root directory pointer as of the last flush or open
    pub fn root_pointer(&self) -> Option<BoxPointer> {
        self.root_pointer
    }

    /// Whether anything changed since the last flush or open
    pub fn is_modified(&self) -> bool {
        self.modified
    }

    /// Create or replace a file, creating missing parent directories
    pub fn write_bytes(&mut self, path: &str, data: &[u8]) -> RepoResult<()> {
        let (parents, name) = split_last(path)?;
        let dir = self.walk(&parents, Walk::Create, path)?;
        if dir.blob.get(name).is_some_and(|e| !e.is_file) {
            return Err(RepoError::NotAFile(path.to_string()));
        }
        dir.blob.insert(DirEntry::file(name, None, data.len() as u64));
        dir.cached.insert(name.to_string(), Cached::File(data.to_vec()));
        self.modified = true;
        Ok(())
    }

    /// Content of a file
    pub fn read_bytes(&mut self, path: &str) -> RepoResult<Vec<u8>> {
        let (parents, name) = split_last(path)?;
        let accessor = self.accessor.clone();
        let dir = self.walk(&parents, Walk::Read, path)?;
        let entry = dir
            .blob
            .get(name)
            .ok_or_else(|| RepoError::PathNotFound(path.to_string()))?;
        if !entry.is_file {
            return Err(RepoError::NotAFile(path.to_string()));
        }
        if let Some(Cached::File(data)) = dir.cached.get(name) {
            return Ok(data.clone());
        }
        let pointer = entry.data_pointer.ok_or_else(|| dirty_without_content(path))?;
        Ok(read_blob(accessor, &pointer)?)
    }

    /// Remove a file or a whole directory
    pub fn remove(&mut self, path: &str) -> RepoResult<()> {
        let (parents, name) = split_last(path)?;
        if self.walk(&parents, Walk::Read, path)?.blob.get(name).is_none() {
            return Err(RepoError::PathNotFound(path.to_string()));
        }
        let dir = self.walk(&parents, Walk::Write, path)?;
        dir.blob.remove(name);
        dir.cached.remove(name);
        self.modified = true;
        Ok(())
    }

    /// Names of the subdirectories of a directory, sorted
    pub fn list_directories(&mut self, path: &str) -> RepoResult<Vec<String>> {
        let parts = parse_path(path)?;
        let dir = self.walk(&parts, Walk::Read, path)?;
        Ok(dir.blob.directories().map(|e| e.name.clone()).collect())
    }

    /// Names of the files of a directory, sorted
    pub fn list_files(&mut self, path: &str) -> RepoResult<Vec<String>> {
        let parts = parse_path(path)?;
        let dir = self.walk(&parts, Walk::Read, path)?;
        Ok(dir.blob.files().map(|e| e.name.clone()).collect())
    }

    /// Whether a file exists at the path
    pub fn has_file(&mut self, path: &str) -> RepoResult<bool> {
        let (parents, name) = split_last(path)?;
        match self.walk(&parents, Walk::Read, path) {
            Ok(dir) => Ok(dir.blob.get(name).is_some_and(|e| e.is_file)),
            Err(RepoError::PathNotFound(_)) | Err(RepoError::NotADirectory(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Write every dirty file and directory and return the root directory pointer
    #[instrument(skip(self))]
    pub fn flush(&mut self) -> RepoResult<BoxPointer> {
        if let (false, Some(pointer)) = (self.modified, self.root_pointer) {
            return Ok(pointer);
        }
        let pointer = flush_dir(&self.accessor, self.config, &mut self.root)?;
        debug!(root = %pointer.data_hash, "flushed working tree");
        self.root_pointer = Some(pointer);
        self.modified = false;
        Ok(pointer)
    }

    fn walk(&mut self, parts: &[&str], mode: Walk, path: &str) -> RepoResult<&mut DirState> {
        let accessor = self.accessor.clone();
        let mut dir = &mut self.root;
        for depth in 0..parts.len() {
            let prefix = parts[..=depth].join("/");
            dir = descend(&accessor, dir, parts[depth], mode, &prefix).map_err(|e| match e {
                RepoError::PathNotFound(_) => RepoError::PathNotFound(path.to_string()),
                other => other,
            })?;
        }
        Ok(dir)
    }
}

fn split_last(path: &str) -> RepoResult<(Vec<&str>, &str)> {
    let mut parts = parse_path(path)?;
    match parts.pop() {
        Some(name) => Ok((parts, name)),
        None => Err(RepoError::InvalidPath(path.to_string())),
    }
}

fn dirty_without_content(path: &str) -> RepoError {
    StoreError::Corrupted(format!("dirty entry {:?} has no cached content", path)).into()
}

fn descend<'a>(
    accessor: &Arc<dyn ChunkAccessor>,
    dir: &'a mut DirState,
    name: &str,
    mode: Walk,
    prefix: &str,
) -> RepoResult<&'a mut DirState> {
    match dir.blob.get(name) {
        Some(entry) if entry.is_file => return Err(RepoError::NotADirectory(prefix.to_string())),
        Some(_) => {}
        None if mode == Walk::Create => {
            dir.blob.insert(DirEntry::directory(name, None));
            dir.cached
                .insert(name.to_string(), Cached::Dir(Box::<DirState>::default()));
        }
        None => return Err(RepoError::PathNotFound(prefix.to_string())),
    }
    if !matches!(dir.cached.get(name), Some(Cached::Dir(_))) {
        let pointer = dir
            .blob
            .get(name)
            .and_then(|e| e.data_pointer)
            .ok_or_else(|| dirty_without_content(prefix))?;
        let blob = read_directory(accessor.clone(), &pointer)?;
        dir.cached.insert(
            name.to_string(),
            Cached::Dir(Box::new(DirState {
                blob,
                cached: HashMap::new(),
            })),
        );
    }
    if mode != Walk::Read {
        if let Some(entry) = dir.blob.get_mut(name) {
            entry.data_pointer = None;
        }
    }
    match dir.cached.get_mut(name) {
        Some(Cached::Dir(child)) => Ok(child),
        _ => Err(dirty_without_content(prefix)),
    }
}

/// Write the dirty entries of `dir` depth-first, then `dir` itself.
fn flush_dir(
    accessor: &Arc<dyn ChunkAccessor>,
    config: TreeConfig,
    dir: &mut DirState,
) -> RepoResult<BoxPointer> {
    let dirty: Vec<String> = dir
        .blob
        .entries()
        .filter(|e| e.is_dirty())
        .map(|e| e.name.clone())
        .collect();
    for name in dirty {
        let pointer = match dir.cached.get_mut(&name) {
            Some(Cached::File(data)) => write_blob(accessor.clone(), data, config)?,
            Some(Cached::Dir(child)) => flush_dir(accessor, config, child)?,
            None => return Err(dirty_without_content(&name)),
        };
        if let Some(entry) = dir.blob.get_mut(&name) {
            entry.data_pointer = Some(pointer);
        }
        if matches!(dir.cached.get(&name), Some(Cached::File(_))) {
            dir.cached.remove(&name);
        }
    }
    write_typed(
        accessor.clone(),
        &TypedBlob::Directory(dir.blob.clone()),
        config,
    )
}
