//! In-memory index nodes and the arena that owns them.

use bytes::Bytes;

use crate::cache::{ChildKey, NodeId};
use crate::chunk_pointer::{ChunkPointer, CHUNK_POINTER_LEN};
use crate::error::{StoreError, StoreResult};
use crate::hash::HashValue;
use crate::wire::WireReader;

/// Content resident for a child slot.
#[derive(Debug, Clone)]
pub(crate) enum Cached {
    None,
    Leaf(Bytes),
    Node(NodeId),
}

impl Cached {
    pub(crate) fn is_none(&self) -> bool {
        matches!(self, Cached::None)
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Child {
    pub pointer: ChunkPointer,
    pub key: ChildKey,
    pub cached: Cached,
}

impl Child {
    pub(crate) fn len(&self) -> u64 {
        self.pointer.data_length as u64
    }

    pub(crate) fn hash(&self) -> &HashValue {
        &self.pointer.box_pointer.data_hash
    }
}

#[derive(Debug)]
pub(crate) struct Node {
    pub level: u8,
    pub children: Vec<Child>,
    pub parent: Option<NodeId>,
    /// Children changed since the node was last written
    pub dirty: bool,
}

impl Node {
    pub(crate) fn new(level: u8, parent: Option<NodeId>) -> Self {
        Self {
            level,
            children: Vec::new(),
            parent,
            dirty: true,
        }
    }

    pub(crate) fn data_length(&self) -> u64 {
        self.children.iter().map(Child::len).sum()
    }

    /// Position of the child slot holding the loaded node `id`
    pub(crate) fn index_of_node(&self, id: NodeId) -> Option<usize> {
        self.children
            .iter()
            .position(|c| matches!(c.cached, Cached::Node(n) if n == id))
    }

    pub(crate) fn index_of_key(&self, key: ChildKey) -> Option<usize> {
        self.children.iter().position(|c| c.key == key)
    }

    pub(crate) fn pointers(&self) -> Vec<ChunkPointer> {
        self.children.iter().map(|c| c.pointer).collect()
    }
}

/// Hash of an index node's logical content: the concatenation of its children's data hashes.
pub fn node_hash<'a>(children: impl IntoIterator<Item = &'a HashValue>) -> HashValue {
    let mut hasher = blake3::Hasher::new();
    for hash in children {
        hasher.update(hash.as_bytes());
    }
    hasher.finalize().into()
}

/// Hash of a whole tree given the data hashes of the root's children
pub fn tree_hash(children: &[HashValue]) -> HashValue {
    match children {
        [only] => *only,
        _ => node_hash(children),
    }
}

/// Serialize a node body as a sequence of chunk pointers
pub fn encode_body(children: &[ChunkPointer]) -> Vec<u8> {
    let mut out = Vec::with_capacity(children.len() * CHUNK_POINTER_LEN);
    for child in children {
        child.write_to(&mut out);
    }
    out
}

/// Parse a node body whose children live at `child_level`
pub fn decode_body(bytes: &[u8], child_level: u8) -> StoreResult<Vec<ChunkPointer>> {
    if bytes.len() % CHUNK_POINTER_LEN != 0 {
        return Err(StoreError::Corrupted(format!(
            "node body of {} bytes is not a whole number of pointers",
            bytes.len()
        )));
    }
    let mut reader = WireReader::new(bytes);
    let mut children = Vec::with_capacity(bytes.len() / CHUNK_POINTER_LEN);
    while reader.remaining() > 0 {
        children.push(ChunkPointer::read_from(&mut reader, child_level)?);
    }
    Ok(children)
}

/// Slot arena for loaded nodes. Ids stay valid until the node is freed.
#[derive(Debug, Default)]
pub(crate) struct NodeArena {
    slots: Vec<Option<Node>>,
    free: Vec<NodeId>,
    live: usize,
}

impl NodeArena {
    pub(crate) fn alloc(&mut self, node: Node) -> NodeId {
        self.live += 1;
        match self.free.pop() {
            Some(id) => {
                self.slots[id] = Some(node);
                id
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        }
    }

    pub(crate) fn free(&mut self, id: NodeId) -> Option<Node> {
        let node = self.slots.get_mut(id)?.take()?;
        self.free.push(id);
        self.live -= 1;
        Some(node)
    }

    pub(crate) fn get(&self, id: NodeId) -> StoreResult<&Node> {
        self.slots
            .get(id)
            .and_then(Option::as_ref)
            .ok_or_else(|| dangling(id))
    }

    pub(crate) fn get_mut(&mut self, id: NodeId) -> StoreResult<&mut Node> {
        self.slots
            .get_mut(id)
            .and_then(Option::as_mut)
            .ok_or_else(|| dangling(id))
    }

    pub(crate) fn contains(&self, id: NodeId) -> bool {
        matches!(self.slots.get(id), Some(Some(_)))
    }

    pub(crate) fn live(&self) -> usize {
        self.live
    }
}

fn dangling(id: NodeId) -> StoreError {
    StoreError::Corrupted(format!("dangling node id {}", id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::box_pointer::BoxPointer;
    use crate::encryption::Iv;

    #[test]
    fn tree_hash_rules() {
        let a = HashValue::of(b"a");
        let b = HashValue::of(b"b");
        assert_eq!(tree_hash(&[]), HashValue::of(b""));
        assert_eq!(tree_hash(&[a]), a);
        let mut concat = a.as_bytes().to_vec();
        concat.extend_from_slice(b.as_bytes());
        assert_eq!(tree_hash(&[a, b]), HashValue::of(&concat));
    }

    #[test]
    fn body_parses_back() {
        let pointers: Vec<_> = (1..4u64)
            .map(|i| {
                let bp = BoxPointer::new(HashValue::of(&[i as u8]), HashValue::ZERO, Iv::ZERO);
                ChunkPointer::new(i * 7, 0, bp).unwrap()
            })
            .collect();
        assert_eq!(decode_body(&encode_body(&pointers), 0).unwrap(), pointers);
        assert!(decode_body(&[0u8; 5], 0).is_err());
    }

    #[test]
    fn arena_reuses_freed_slots() {
        let mut arena = NodeArena::default();
        let a = arena.alloc(Node::new(1, None));
        let b = arena.alloc(Node::new(1, Some(a)));
        assert_eq!(arena.live(), 2);
        arena.free(a);
        assert!(!arena.contains(a));
        assert!(arena.get(a).is_err());
        let c = arena.alloc(Node::new(2, None));
        assert_eq!(c, a);
        assert!(arena.contains(b));
        assert_eq!(arena.live(), 2);
    }
}
