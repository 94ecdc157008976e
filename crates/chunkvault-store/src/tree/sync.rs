//! Copying container trees between accessors box by box.
//!
//! Boxes are copied as stored bytes, so leaves are never decrypted; only index
//! nodes are opened to find their children. Children are copied before the node
//! that references them, so an interrupted copy never leaves a node whose
//! subtree is incomplete, and a node already present at the destination is
//! taken to have its whole subtree there.

use tracing::debug;

use crate::accessor::ChunkAccessor;
use crate::box_pointer::BoxPointer;
use crate::error::{StoreError, StoreResult};
use crate::hash::HashValue;
use crate::tree::header::decode_root;
use crate::tree::node::decode_body;

/// Boxes copied and skipped by a tree copy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    /// Boxes written to the destination
    pub copied: u64,
    /// Boxes the destination already had
    pub skipped: u64,
}

impl std::ops::AddAssign for CopyStats {
    fn add_assign(&mut self, other: Self) {
        self.copied += other.copied;
        self.skipped += other.skipped;
    }
}

/// Copy every box of the tree at `pointer` that `to` is missing.
pub fn copy_tree(
    from: &dyn ChunkAccessor,
    to: &dyn ChunkAccessor,
    pointer: &BoxPointer,
) -> StoreResult<CopyStats> {
    let mut stats = CopyStats::default();
    if to.has_box(&pointer.box_hash)? {
        stats.skipped += 1;
        return Ok(stats);
    }
    let (header, children) = decode_root(&from.get_chunk(pointer)?)?;
    for child in &children {
        copy_subtree(from, to, &child.box_pointer, child.level, &mut stats)?;
    }
    copy_box(from, to, &pointer.box_hash)?;
    stats.copied += 1;
    debug!(root = %pointer, height = header.level, copied = stats.copied, skipped = stats.skipped, "copied container tree");
    Ok(stats)
}

fn copy_subtree(
    from: &dyn ChunkAccessor,
    to: &dyn ChunkAccessor,
    pointer: &BoxPointer,
    level: u8,
    stats: &mut CopyStats,
) -> StoreResult<()> {
    if to.has_box(&pointer.box_hash)? {
        stats.skipped += 1;
        return Ok(());
    }
    if level > 0 {
        for child in decode_body(&from.get_chunk(pointer)?, level - 1)? {
            copy_subtree(from, to, &child.box_pointer, child.level, stats)?;
        }
    }
    copy_box(from, to, &pointer.box_hash)?;
    stats.copied += 1;
    Ok(())
}

/// Copy one stored box verbatim
pub fn copy_box(from: &dyn ChunkAccessor, to: &dyn ChunkAccessor, box_hash: &HashValue) -> StoreResult<()> {
    let bytes = from.get_box(box_hash)?;
    let written = to.put_box(&bytes)?;
    if written != *box_hash {
        return Err(StoreError::Corrupted(format!(
            "copied box {} stored as {}",
            box_hash, written
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::BoxedChunkAccessor;
    use crate::cache::CacheConfig;
    use crate::encryption::{CryptoConfig, EncryptionKey};
    use crate::splitter::SplitterConfig;
    use crate::store::ChunkStore;
    use crate::tree::{read_blob, write_blob, ContainerTree, TreeConfig};
    use std::sync::Arc;

    fn encrypted(name: &str) -> Arc<BoxedChunkAccessor> {
        Arc::new(BoxedChunkAccessor::new(
            &ChunkStore::in_memory(name),
            Some(CryptoConfig::new(EncryptionKey([7; 32]))),
        ))
    }

    fn config() -> TreeConfig {
        TreeConfig {
            splitter: SplitterConfig::FixedSize { block_size: 64 },
            ..TreeConfig::default()
        }
    }

    #[test]
    fn copied_tree_reads_back_at_destination() {
        let from = encrypted("from");
        let to = encrypted("to");
        let bytes: Vec<u8> = (0..20_000u32).map(|i| (i % 251) as u8).collect();
        let pointer = write_blob(from.clone(), &bytes, config()).unwrap();

        let stats = copy_tree(from.as_ref(), to.as_ref(), &pointer).unwrap();
        assert!(stats.copied > 1);
        assert_eq!(read_blob(to.clone(), &pointer).unwrap(), bytes);

        let again = copy_tree(from.as_ref(), to.as_ref(), &pointer).unwrap();
        assert_eq!(again, CopyStats { copied: 0, skipped: 1 });
    }

    #[test]
    fn shared_subtrees_are_skipped() {
        let from = encrypted("from");
        let to = encrypted("to");
        let base: Vec<u8> = (0..10_000u32).map(|i| (i * 7 % 256) as u8).collect();
        let first = write_blob(from.clone(), &base, config()).unwrap();
        copy_tree(from.as_ref(), to.as_ref(), &first).unwrap();

        let mut tree = ContainerTree::load(from.clone(), &first, CacheConfig::default()).unwrap();
        tree.append(b"one more leaf").unwrap();
        let second = tree.flush(false).unwrap();
        let stats = copy_tree(from.as_ref(), to.as_ref(), &second).unwrap();
        assert!(stats.skipped > 0);
        assert!(stats.copied < 20);
        assert_eq!(
            read_blob(to, &second).unwrap(),
            [base.as_slice(), b"one more leaf"].concat()
        );
    }
}
