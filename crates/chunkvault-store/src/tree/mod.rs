//! Container tree: a logical byte stream stored as a multi-level tree of
//! content-defined chunks.
//!
//! Leaves hold data chunks; index nodes hold chunk pointers. Leaves are written
//! through the accessor as soon as they are inserted, index nodes only on
//! [`ContainerTree::flush`], which re-splits every dirty node with the
//! node-level splitter so that the shape of a tree depends only on its leaves.

pub mod header;
pub mod node;
pub mod stream;
pub mod sync;

use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, instrument, trace};

use crate::accessor::ChunkAccessor;
use crate::box_pointer::BoxPointer;
use crate::cache::{CacheConfig, CacheStats, ChildKey, NodeId, PointerCache};
use crate::chunk_pointer::{checked_length, ChunkPointer};
use crate::compression::CompressionType;
use crate::error::{StoreError, StoreResult};
use crate::hash::HashValue;
use crate::splitter::{ChunkSplitter, SplitterConfig};

pub use header::{TreeConfig, TreeHeader};
pub use stream::{read_blob, write_blob, ChunkedAppender, ContainerReader};

use header::{decode_root, encode_root};
use node::{decode_body, encode_body, node_hash, tree_hash, Cached, Child, Node, NodeArena};

/// Position of a leaf inside its level-1 node.
#[derive(Debug, Clone, Copy)]
struct LeafSlot {
    node: NodeId,
    index: usize,
    start: u64,
}

/// A byte stream stored as a tree of chunks.
pub struct ContainerTree {
    accessor: Arc<dyn ChunkAccessor>,
    config: TreeConfig,
    arena: NodeArena,
    root: NodeId,
    length: u64,
    height: u8,
    cache: PointerCache,
    next_key: u64,
    root_pointer: Option<BoxPointer>,
}

impl std::fmt::Debug for ContainerTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerTree")
            .field("config", &self.config)
            .field("length", &self.length)
            .field("height", &self.height)
            .field("loaded_nodes", &self.arena.live())
            .field("root_pointer", &self.root_pointer)
            .finish()
    }
}

fn corrupted(what: &str) -> StoreError {
    StoreError::Corrupted(format!("container tree: {}", what))
}

impl ContainerTree {
    /// Create an empty tree
    pub fn create(
        accessor: Arc<dyn ChunkAccessor>,
        config: TreeConfig,
        cache: CacheConfig,
    ) -> StoreResult<Self> {
        config.splitter.validate()?;
        let mut arena = NodeArena::default();
        let root = arena.alloc(Node::new(1, None));
        Ok(Self {
            accessor,
            config,
            arena,
            root,
            length: 0,
            height: 1,
            cache: PointerCache::new(cache),
            next_key: 0,
            root_pointer: None,
        })
    }

    /// Load a tree from its root pointer. Index nodes are read on demand.
    #[instrument(skip(accessor, pointer, cache), fields(root = %pointer))]
    pub fn load(
        accessor: Arc<dyn ChunkAccessor>,
        pointer: &BoxPointer,
        cache: CacheConfig,
    ) -> StoreResult<Self> {
        let bytes = accessor.get_chunk(pointer)?;
        let (header, pointers) = decode_root(&bytes)?;
        let hashes: Vec<HashValue> = pointers.iter().map(|p| p.box_pointer.data_hash).collect();
        if tree_hash(&hashes) != pointer.data_hash {
            return Err(corrupted("root children do not match the tree hash"));
        }

        let mut tree = Self::create(accessor, header.config, cache)?;
        let children = tree.wrap_children(pointers);
        tree.length = children.iter().map(Child::len).sum();
        tree.height = header.level;
        let root = tree.arena.get_mut(tree.root)?;
        root.level = header.level;
        root.children = children;
        root.dirty = false;
        tree.root_pointer = Some(*pointer);
        debug!(length = tree.length, height = tree.height, "loaded container tree");
        Ok(tree)
    }

    /// Logical length in bytes
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Whether the stream is empty
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Level of the root node
    pub fn height(&self) -> u8 {
        self.height
    }

    /// Chunking and compression of this tree
    pub fn config(&self) -> &TreeConfig {
        &self.config
    }

    /// The accessor the tree reads and writes through
    pub fn accessor(&self) -> &Arc<dyn ChunkAccessor> {
        &self.accessor
    }

    /// Root pointer of the last flush, if the tree has been flushed or loaded
    pub fn root_pointer(&self) -> Option<BoxPointer> {
        self.root_pointer
    }

    /// Whether there are edits since the last flush
    pub fn is_dirty(&self) -> bool {
        self.root_pointer.is_none() || self.arena.get(self.root).map_or(true, |n| n.dirty)
    }

    /// Pointer cache statistics
    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Number of index nodes resident in memory, root included
    pub fn loaded_nodes(&self) -> usize {
        self.arena.live()
    }

    /// Number of leaves whose bytes are resident in memory
    pub fn cached_leaves(&self) -> usize {
        let mut count = 0;
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            if let Ok(node) = self.arena.get(id) {
                for child in &node.children {
                    match child.cached {
                        Cached::Leaf(_) => count += 1,
                        Cached::Node(n) => stack.push(n),
                        Cached::None => {}
                    }
                }
            }
        }
        count
    }

    /// The leaf containing `position` and the position its range starts at.
    ///
    /// `position == len()` resolves to the right-most leaf.
    pub fn get(&mut self, position: u64) -> StoreResult<(ChunkPointer, u64)> {
        let slot = self.locate(position)?.ok_or(StoreError::InvalidPosition {
            position,
            length: self.length,
        })?;
        let child = self.child(slot.node, slot.index)?;
        Ok((child.pointer, slot.start))
    }

    /// Bytes of the leaf containing `position` and the position its range starts at
    pub fn read_chunk(&mut self, position: u64) -> StoreResult<(Bytes, u64)> {
        let slot = self.locate(position)?.ok_or(StoreError::InvalidPosition {
            position,
            length: self.length,
        })?;
        Ok((self.read_leaf(slot.node, slot.index)?, slot.start))
    }

    /// The whole stream
    pub fn read_all(&mut self) -> StoreResult<Vec<u8>> {
        let mut out = Vec::with_capacity(self.length as usize);
        let mut position = 0;
        while position < self.length {
            let (bytes, start) = self.read_chunk(position)?;
            out.extend_from_slice(&bytes);
            position = start + bytes.len() as u64;
        }
        Ok(out)
    }

    /// Leaves from the one containing `start` to the end, with their start positions
    pub fn iterate(&mut self, start: u64) -> TreeIter<'_> {
        TreeIter {
            tree: self,
            position: start,
            done: false,
        }
    }

    /// Insert `data` as one new leaf at `position`, which must be a chunk boundary.
    #[instrument(skip(self, data), fields(len = data.len()))]
    pub fn insert(&mut self, data: &[u8], position: u64) -> StoreResult<()> {
        if position > self.length {
            return Err(StoreError::InvalidPosition {
                position,
                length: self.length,
            });
        }
        if data.is_empty() {
            return Ok(());
        }
        let length = checked_length(data.len() as u64)?;
        let (node, index) = match self.locate(position)? {
            None => {
                self.reset_empty_root()?;
                (self.root, 0)
            }
            Some(slot) if position == self.length => (slot.node, slot.index + 1),
            Some(slot) if slot.start == position => (slot.node, slot.index),
            Some(_) => return Err(StoreError::InvalidInsertPosition { position }),
        };
        self.check_growth(node, data.len() as u64)?;

        let put = self
            .accessor
            .put_chunk(data, &HashValue::of(data), self.config.compression)?;
        let key = self.new_key();
        self.arena.get_mut(node)?.children.insert(
            index,
            Child {
                pointer: ChunkPointer {
                    data_length: length,
                    level: 0,
                    box_pointer: put.pointer,
                },
                key,
                cached: Cached::Leaf(Bytes::copy_from_slice(data)),
            },
        );
        self.length += data.len() as u64;
        self.update_path(node)?;
        self.touch(key, node)?;
        trace!(position, present = put.was_present, "inserted leaf");
        Ok(())
    }

    /// Append `data` as one new leaf
    pub fn append(&mut self, data: &[u8]) -> StoreResult<()> {
        self.insert(data, self.length)
    }

    /// Remove the leaf starting at `position`, which must be exactly `length` bytes long.
    #[instrument(skip(self))]
    pub fn remove(&mut self, position: u64, length: u64) -> StoreResult<()> {
        let invalid = StoreError::InvalidPosition {
            position,
            length: self.length,
        };
        if position >= self.length {
            return Err(invalid);
        }
        let slot = self.locate(position)?.ok_or(invalid)?;
        if slot.start != position {
            return Err(StoreError::InvalidPosition {
                position,
                length: self.length,
            });
        }
        let actual = self.child(slot.node, slot.index)?.len();
        if actual != length {
            return Err(StoreError::DataLengthMismatch {
                position,
                expected: length,
                actual,
            });
        }

        let removed = self.arena.get_mut(slot.node)?.children.remove(slot.index);
        self.cache.evict(removed.key);
        self.length -= actual;
        self.update_path(slot.node)?;
        self.prune_empty(slot.node)?;
        trace!(position, length, "removed leaf");
        Ok(())
    }

    /// Remove and return the right-most leaf
    pub fn pop_last(&mut self) -> StoreResult<Option<Bytes>> {
        if self.length == 0 {
            return Ok(None);
        }
        let (bytes, start) = self.read_chunk(self.length - 1)?;
        self.remove(start, bytes.len() as u64)?;
        Ok(Some(bytes))
    }

    /// Write every dirty node bottom-up and then the root chunk.
    ///
    /// With `keep_cache` false every resident node and leaf is dropped afterwards.
    #[instrument(skip(self), fields(length = self.length))]
    pub fn flush(&mut self, keep_cache: bool) -> StoreResult<BoxPointer> {
        if let (false, Some(pointer)) = (self.is_dirty(), self.root_pointer) {
            if !keep_cache {
                self.drop_cache()?;
            }
            return Ok(pointer);
        }

        for level in 1..self.height {
            self.resplit_level(level)?;
            for id in self.nodes_at(level, true)? {
                self.write_node(id)?;
            }
        }
        self.settle_root()?;
        let pointer = self.write_root()?;

        if keep_cache {
            self.retrack()?;
        } else {
            self.drop_cache()?;
        }
        debug!(height = self.height, root = %pointer, "flushed container tree");
        Ok(pointer)
    }

    fn new_key(&mut self) -> ChildKey {
        self.next_key += 1;
        ChildKey(self.next_key)
    }

    fn wrap_children(&mut self, pointers: Vec<ChunkPointer>) -> Vec<Child> {
        pointers
            .into_iter()
            .map(|pointer| Child {
                pointer,
                key: self.new_key(),
                cached: Cached::None,
            })
            .collect()
    }

    fn child(&self, node: NodeId, index: usize) -> StoreResult<&Child> {
        self.arena
            .get(node)?
            .children
            .get(index)
            .ok_or_else(|| corrupted("child index out of range"))
    }

    fn child_mut(&mut self, node: NodeId, index: usize) -> StoreResult<&mut Child> {
        self.arena
            .get_mut(node)?
            .children
            .get_mut(index)
            .ok_or_else(|| corrupted("child index out of range"))
    }

    fn index_in_parent(&self, id: NodeId) -> StoreResult<(NodeId, usize)> {
        let parent = self
            .arena
            .get(id)?
            .parent
            .ok_or_else(|| corrupted("root has no parent"))?;
        let index = self
            .arena
            .get(parent)?
            .index_of_node(id)
            .ok_or_else(|| corrupted("node missing from its parent"))?;
        Ok((parent, index))
    }

    /// Descend to the leaf covering `position`; `None` for an empty tree.
    fn locate(&mut self, position: u64) -> StoreResult<Option<LeafSlot>> {
        if position > self.length {
            return Err(StoreError::InvalidPosition {
                position,
                length: self.length,
            });
        }
        let mut id = self.root;
        let mut start = 0u64;
        loop {
            let node = self.arena.get(id)?;
            let Some(last) = node.children.len().checked_sub(1) else {
                return Ok(None);
            };
            let mut index = last;
            let mut offset = start;
            for (i, child) in node.children.iter().enumerate() {
                if position < offset + child.len() || i == last {
                    index = i;
                    break;
                }
                offset += child.len();
            }
            start = offset;
            if node.level == 1 {
                return Ok(Some(LeafSlot {
                    node: id,
                    index,
                    start,
                }));
            }
            id = self.load_child(id, index, true)?;
        }
    }

    /// Resident id of the node behind `parent.children[index]`, reading it if needed.
    fn load_child(&mut self, parent: NodeId, index: usize, track: bool) -> StoreResult<NodeId> {
        let level = self.arena.get(parent)?.level;
        let child = self.child(parent, index)?;
        let (pointer, key) = (child.pointer, child.key);
        if let Cached::Node(id) = child.cached {
            if track {
                self.cache.record_hit();
                self.touch(key, parent)?;
            }
            return Ok(id);
        }
        if level < 2 {
            return Err(corrupted("a leaf is not an index node"));
        }

        let body = self.accessor.get_chunk(&pointer.box_pointer)?;
        let pointers = decode_body(&body, level - 2)?;
        if pointers.is_empty() {
            return Err(corrupted("empty index node"));
        }
        if node_hash(pointers.iter().map(|p| &p.box_pointer.data_hash))
            != pointer.box_pointer.data_hash
        {
            return Err(corrupted("index node does not match its hash"));
        }
        let sum: u64 = pointers.iter().map(|p| p.data_length as u64).sum();
        if sum != pointer.data_length as u64 {
            return Err(corrupted("index node lengths do not add up"));
        }

        let children = self.wrap_children(pointers);
        let id = self.arena.alloc(Node {
            level: level - 1,
            children,
            parent: Some(parent),
            dirty: false,
        });
        self.child_mut(parent, index)?.cached = Cached::Node(id);
        if track {
            self.cache.record_miss();
            self.touch(key, parent)?;
        }
        Ok(id)
    }

    fn read_leaf(&mut self, node: NodeId, index: usize) -> StoreResult<Bytes> {
        let child = self.child(node, index)?;
        let (pointer, key) = (child.pointer, child.key);
        if let Cached::Leaf(bytes) = &child.cached {
            let bytes = bytes.clone();
            self.cache.record_hit();
            self.touch(key, node)?;
            return Ok(bytes);
        }

        let data = self.accessor.get_chunk(&pointer.box_pointer)?;
        if data.len() as u64 != pointer.data_length as u64
            || HashValue::of(&data) != pointer.box_pointer.data_hash
        {
            return Err(corrupted("leaf does not match its pointer"));
        }
        let bytes = Bytes::from(data);
        self.child_mut(node, index)?.cached = Cached::Leaf(bytes.clone());
        self.cache.record_miss();
        self.touch(key, node)?;
        Ok(bytes)
    }

    fn touch(&mut self, key: ChildKey, parent: NodeId) -> StoreResult<()> {
        let evicted = self.cache.touch(key, parent);
        self.apply_evictions(evicted)
    }

    fn apply_evictions(&mut self, evicted: Vec<(ChildKey, NodeId)>) -> StoreResult<()> {
        for (key, parent) in evicted {
            if !self.arena.contains(parent) {
                continue;
            }
            let Some(index) = self.arena.get(parent)?.index_of_key(key) else {
                continue;
            };
            let cached = &self.child(parent, index)?.cached;
            let (leaf, node) = (
                matches!(cached, Cached::Leaf(_)),
                matches!(cached, Cached::Node(_)),
            );
            if leaf {
                self.child_mut(parent, index)?.cached = Cached::None;
            } else if node && self.unloadable(parent, index)? {
                self.unload(parent, index)?;
            }
            self.cascade_clean(parent)?;
        }
        Ok(())
    }

    /// Whether the node behind `parent.children[index]` may be dropped from memory
    fn unloadable(&self, parent: NodeId, index: usize) -> StoreResult<bool> {
        let child = self.child(parent, index)?;
        let Cached::Node(id) = child.cached else {
            return Ok(false);
        };
        let node = self.arena.get(id)?;
        let kept = self.cache.config().kept_metadata_levels;
        Ok(!node.dirty
            && self.height.saturating_sub(node.level) > kept
            && !self.cache.contains(child.key)
            && node.children.iter().all(|c| c.cached.is_none()))
    }

    fn unload(&mut self, parent: NodeId, index: usize) -> StoreResult<()> {
        let child = self.child_mut(parent, index)?;
        let cached = std::mem::replace(&mut child.cached, Cached::None);
        let key = child.key;
        if let Cached::Node(id) = cached {
            self.arena.free(id);
        }
        self.cache.evict(key);
        Ok(())
    }

    /// Unload clean ancestors left without resident children, from `id` upwards
    fn cascade_clean(&mut self, mut id: NodeId) -> StoreResult<()> {
        while self.arena.contains(id) && self.arena.get(id)?.parent.is_some() {
            let (parent, index) = self.index_in_parent(id)?;
            if !self.unloadable(parent, index)? {
                break;
            }
            self.unload(parent, index)?;
            id = parent;
        }
        Ok(())
    }

    /// Mark `id` and its ancestors dirty and refresh their lengths
    fn update_path(&mut self, mut id: NodeId) -> StoreResult<()> {
        loop {
            let node = self.arena.get_mut(id)?;
            node.dirty = true;
            if node.parent.is_none() {
                return Ok(());
            }
            let length = checked_length(node.data_length())?;
            let (parent, index) = self.index_in_parent(id)?;
            self.child_mut(parent, index)?.pointer.data_length = length;
            id = parent;
        }
    }

    /// Reject an insert that would overflow a subtree length on the path to `id`
    fn check_growth(&self, mut id: NodeId, extra: u64) -> StoreResult<()> {
        while self.arena.get(id)?.parent.is_some() {
            let (parent, index) = self.index_in_parent(id)?;
            checked_length(self.child(parent, index)?.len() + extra)?;
            id = parent;
        }
        Ok(())
    }

    /// Remove `id` and every ancestor left without children; the root is reset instead
    fn prune_empty(&mut self, mut id: NodeId) -> StoreResult<()> {
        while self.arena.get(id)?.children.is_empty() {
            if self.arena.get(id)?.parent.is_none() {
                return self.reset_empty_root();
            }
            let (parent, index) = self.index_in_parent(id)?;
            let removed = self.arena.get_mut(parent)?.children.remove(index);
            self.cache.evict(removed.key);
            self.arena.free(id);
            self.update_path(parent)?;
            id = parent;
        }
        Ok(())
    }

    fn reset_empty_root(&mut self) -> StoreResult<()> {
        let root = self.arena.get_mut(self.root)?;
        if root.children.is_empty() && root.level != 1 {
            root.level = 1;
            root.dirty = true;
            self.height = 1;
        }
        Ok(())
    }

    /// Resident nodes at `level` in stream order
    fn nodes_at(&self, level: u8, only_dirty: bool) -> StoreResult<Vec<NodeId>> {
        let mut out = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = self.arena.get(id)?;
            if node.level == level {
                if !only_dirty || node.dirty {
                    out.push(id);
                }
                continue;
            }
            if node.level < level {
                continue;
            }
            for child in node.children.iter().rev() {
                if let Cached::Node(n) = child.cached {
                    stack.push(n);
                }
            }
        }
        Ok(out)
    }

    /// The node following `id` at the same level, possibly under another parent
    fn next_at_level(&mut self, id: NodeId) -> StoreResult<Option<NodeId>> {
        let mut current = id;
        let mut depth = 0;
        loop {
            if self.arena.get(current)?.parent.is_none() {
                return Ok(None);
            }
            let (parent, index) = self.index_in_parent(current)?;
            if index + 1 < self.arena.get(parent)?.children.len() {
                current = self.load_child(parent, index + 1, false)?;
                break;
            }
            current = parent;
            depth += 1;
        }
        for _ in 0..depth {
            current = self.load_child(current, 0, false)?;
        }
        Ok(Some(current))
    }

    fn resplit_level(&mut self, level: u8) -> StoreResult<()> {
        let mut done = HashSet::new();
        for id in self.nodes_at(level, true)? {
            if done.contains(&id) || !self.arena.contains(id) {
                continue;
            }
            done.extend(self.resplit_run(id)?);
        }
        Ok(())
    }

    /// Re-split the children of `first` and as many following nodes as needed
    /// until the cut points line up with a clean node again.
    fn resplit_run(&mut self, first: NodeId) -> StoreResult<Vec<NodeId>> {
        let level = self.arena.get(first)?.level;
        let mut run = vec![first];
        let mut items = std::mem::take(&mut self.arena.get_mut(first)?.children);
        let mut splitter = ChunkSplitter::new(self.config.splitter);
        let mut cuts = Vec::new();
        let mut piece_start = 0;
        let mut fed = 0;
        loop {
            while fed < items.len() {
                if splitter.feed_child(items[fed].hash(), fed + 1 - piece_start) {
                    cuts.push(fed + 1);
                    piece_start = fed + 1;
                    splitter.reset();
                }
                fed += 1;
            }
            let aligned = piece_start == items.len();
            let last = run[run.len() - 1];
            let Some(next) = self.next_at_level(last)? else {
                break;
            };
            if aligned && !self.arena.get(next)?.dirty {
                break;
            }
            items.append(&mut self.arena.get_mut(next)?.children);
            run.push(next);
        }
        if piece_start < items.len() {
            cuts.push(items.len());
        }

        let mut pieces = Vec::with_capacity(cuts.len());
        let mut taken = 0;
        for end in cuts {
            let rest = items.split_off(end - taken);
            pieces.push(std::mem::replace(&mut items, rest));
            taken = end;
        }

        let mut touched = Vec::with_capacity(run.len().max(pieces.len()));
        let piece_count = pieces.len();
        for (i, piece) in pieces.into_iter().enumerate() {
            let id = match run.get(i) {
                Some(&id) => id,
                None => {
                    let previous = touched[i - 1];
                    let (parent, index) = self.index_in_parent(previous)?;
                    let id = self.arena.alloc(Node::new(level, Some(parent)));
                    let key = self.new_key();
                    self.arena.get_mut(parent)?.children.insert(
                        index + 1,
                        Child {
                            pointer: ChunkPointer {
                                level,
                                ..ChunkPointer::default()
                            },
                            key,
                            cached: Cached::Node(id),
                        },
                    );
                    id
                }
            };
            self.set_children(id, piece)?;
            self.update_path(id)?;
            touched.push(id);
        }
        for &leftover in run.iter().skip(piece_count) {
            self.prune_empty(leftover)?;
            touched.push(leftover);
        }
        trace!(level, nodes = run.len(), pieces = piece_count, "re-split run");
        Ok(touched)
    }

    fn set_children(&mut self, id: NodeId, children: Vec<Child>) -> StoreResult<()> {
        for child in &children {
            if let Cached::Node(n) = child.cached {
                self.arena.get_mut(n)?.parent = Some(id);
            }
        }
        let node = self.arena.get_mut(id)?;
        node.children = children;
        node.dirty = true;
        Ok(())
    }

    fn write_node(&mut self, id: NodeId) -> StoreResult<()> {
        let node = self.arena.get(id)?;
        let level = node.level;
        let hash = node_hash(node.children.iter().map(Child::hash));
        let length = checked_length(node.data_length())?;
        let body = encode_body(&node.pointers());
        let put = self
            .accessor
            .put_chunk(&body, &hash, self.config.compression)?;
        let (parent, index) = self.index_in_parent(id)?;
        self.child_mut(parent, index)?.pointer = ChunkPointer {
            data_length: length,
            level,
            box_pointer: put.pointer,
        };
        self.arena.get_mut(id)?.dirty = false;
        Ok(())
    }

    /// Grow the root while its children split into several nodes, then shrink
    /// while it has a single index child.
    fn settle_root(&mut self) -> StoreResult<()> {
        loop {
            let root = self.arena.get_mut(self.root)?;
            let level = root.level;
            let children = std::mem::take(&mut root.children);
            let mut pieces = split_children(self.config.splitter, children);
            if pieces.len() <= 1 {
                let children = pieces.pop().unwrap_or_default();
                self.set_children(self.root, children)?;
                break;
            }

            let new_root = self.arena.alloc(Node::new(level + 1, None));
            let mut written = Vec::with_capacity(pieces.len());
            for piece in pieces {
                let id = self.arena.alloc(Node::new(level, Some(new_root)));
                self.set_children(id, piece)?;
                let key = self.new_key();
                self.arena.get_mut(new_root)?.children.push(Child {
                    pointer: ChunkPointer {
                        level,
                        ..ChunkPointer::default()
                    },
                    key,
                    cached: Cached::Node(id),
                });
                written.push(id);
            }
            self.arena.free(self.root);
            self.root = new_root;
            self.height = level + 1;
            for id in written {
                self.write_node(id)?;
            }
            debug!(height = self.height, "container tree grew");
        }

        loop {
            let root = self.arena.get(self.root)?;
            if root.level <= 1 || root.children.len() != 1 {
                break;
            }
            let key = root.children[0].key;
            let child = self.load_child(self.root, 0, false)?;
            self.cache.evict(key);
            self.arena.free(self.root);
            self.arena.get_mut(child)?.parent = None;
            self.root = child;
            self.height = self.arena.get(child)?.level;
            debug!(height = self.height, "container tree shrank");
        }
        Ok(())
    }

    fn write_root(&mut self) -> StoreResult<BoxPointer> {
        let root = self.arena.get(self.root)?;
        let header = TreeHeader {
            level: root.level,
            config: self.config,
        };
        let hashes: Vec<HashValue> = root.children.iter().map(|c| *c.hash()).collect();
        let bytes = encode_root(&header, &root.pointers())?;
        let put = self
            .accessor
            .put_chunk(&bytes, &tree_hash(&hashes), CompressionType::None)?;
        self.arena.get_mut(self.root)?.dirty = false;
        self.root_pointer = Some(put.pointer);
        Ok(put.pointer)
    }

    /// Bring the recency list back in line with what is resident after a flush
    fn retrack(&mut self) -> StoreResult<()> {
        let mut evicted = Vec::new();
        let mut stack = vec![self.root];
        while let Some(id) = stack.pop() {
            let node = self.arena.get(id)?;
            for child in &node.children {
                if child.cached.is_none() {
                    continue;
                }
                if !self.cache.reparent(child.key, id) {
                    evicted.extend(self.cache.touch(child.key, id));
                }
                if let Cached::Node(n) = child.cached {
                    stack.push(n);
                }
            }
        }
        self.apply_evictions(evicted)
    }

    fn drop_cache(&mut self) -> StoreResult<()> {
        let mut stack = Vec::new();
        for child in &mut self.arena.get_mut(self.root)?.children {
            if let Cached::Node(n) = std::mem::replace(&mut child.cached, Cached::None) {
                stack.push(n);
            }
        }
        while let Some(id) = stack.pop() {
            if let Some(node) = self.arena.free(id) {
                stack.extend(node.children.iter().filter_map(|c| match c.cached {
                    Cached::Node(n) => Some(n),
                    _ => None,
                }));
            }
        }
        self.cache.clear();
        Ok(())
    }
}

/// Split a whole sequence of children from a fresh splitter
fn split_children(config: SplitterConfig, children: Vec<Child>) -> Vec<Vec<Child>> {
    let mut splitter = ChunkSplitter::new(config);
    let mut pieces = Vec::new();
    let mut current = Vec::new();
    for child in children {
        let cut = splitter.feed_child(child.hash(), current.len() + 1);
        current.push(child);
        if cut {
            pieces.push(std::mem::take(&mut current));
            splitter.reset();
        }
    }
    if !current.is_empty() {
        pieces.push(current);
    }
    pieces
}

/// Forward iterator over the leaves of a tree.
///
/// Each step descends from the root, so the iterator stays valid across cache evictions.
pub struct TreeIter<'a> {
    tree: &'a mut ContainerTree,
    position: u64,
    done: bool,
}

impl Iterator for TreeIter<'_> {
    type Item = StoreResult<(ChunkPointer, u64)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.position >= self.tree.len() {
            return None;
        }
        match self.tree.get(self.position) {
            Ok((pointer, start)) => {
                self.position = start + pointer.data_length as u64;
                Some(Ok((pointer, start)))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
