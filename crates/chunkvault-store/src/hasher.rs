//! Canonical content hash of a byte stream, computed without storing anything.
//!
//! Produces exactly the data hash a container tree with the same splitter
//! configuration reports for the same bytes: leaves are hashed as the splitter
//! cuts them, and every index level is mirrored by a layer that hashes child
//! hashes and cuts them with its own splitter instance.

use std::io;

use crate::hash::HashValue;
use crate::splitter::{ChunkSplitter, SplitterConfig};

#[derive(Clone)]
struct Layer {
    splitter: ChunkSplitter,
    digest: blake3::Hasher,
    pending: usize,
    last: HashValue,
    emitted: u64,
}

impl Layer {
    fn new(config: SplitterConfig) -> Self {
        Self {
            splitter: ChunkSplitter::new(config),
            digest: blake3::Hasher::new(),
            pending: 0,
            last: HashValue::ZERO,
            emitted: 0,
        }
    }

    /// Add a child hash; returns the node hash when the node closes
    fn push(&mut self, hash: HashValue) -> Option<HashValue> {
        self.digest.update(hash.as_bytes());
        self.pending += 1;
        self.last = hash;
        if self.splitter.feed_child(&hash, self.pending) {
            Some(self.close())
        } else {
            None
        }
    }

    fn close(&mut self) -> HashValue {
        let hash = HashValue::from(self.digest.finalize());
        self.digest.reset();
        self.splitter.reset();
        self.pending = 0;
        self.emitted += 1;
        hash
    }
}

/// Streaming hasher mirroring container tree hashing.
#[derive(Clone)]
pub struct ContentHasher {
    config: SplitterConfig,
    splitter: ChunkSplitter,
    leaf: blake3::Hasher,
    leaf_len: u64,
    total: u64,
    layers: Vec<Layer>,
}

impl std::fmt::Debug for ContentHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContentHasher")
            .field("config", &self.config)
            .field("total", &self.total)
            .field("layers", &self.layers.len())
            .finish()
    }
}

impl ContentHasher {
    /// Hasher for trees using `config`
    pub fn new(config: SplitterConfig) -> Self {
        Self {
            config,
            splitter: ChunkSplitter::new(config),
            leaf: blake3::Hasher::new(),
            leaf_len: 0,
            total: 0,
            layers: Vec::new(),
        }
    }

    /// Feed bytes
    pub fn update(&mut self, mut data: &[u8]) {
        self.total += data.len() as u64;
        while !data.is_empty() {
            match self.splitter.find_boundary(data) {
                Some(n) => {
                    self.leaf.update(&data[..n]);
                    self.leaf_len += n as u64;
                    self.close_leaf();
                    data = &data[n..];
                }
                None => {
                    self.leaf.update(data);
                    self.leaf_len += data.len() as u64;
                    break;
                }
            }
        }
    }

    /// Bytes fed so far
    pub fn len(&self) -> u64 {
        self.total
    }

    /// Whether nothing was fed
    pub fn is_empty(&self) -> bool {
        self.total == 0
    }

    fn close_leaf(&mut self) {
        let hash = HashValue::from(self.leaf.finalize());
        self.leaf.reset();
        self.leaf_len = 0;
        self.splitter.reset();
        self.forward(0, hash);
    }

    /// Push a hash into layer `index`, cascading closed nodes upwards
    fn forward(&mut self, mut index: usize, hash: HashValue) {
        let mut carry = Some(hash);
        while let Some(hash) = carry {
            if index == self.layers.len() {
                self.layers.push(Layer::new(self.config));
            }
            carry = self.layers[index].push(hash);
            index += 1;
        }
    }

    /// Hash of everything fed so far
    pub fn digest(&self) -> HashValue {
        self.clone().finish()
    }

    /// Consume the hasher and return the hash
    pub fn finish(mut self) -> HashValue {
        if self.leaf_len > 0 {
            self.close_leaf();
        }
        let mut index = 0;
        loop {
            if index == self.layers.len() {
                return HashValue::of(b"");
            }
            let layer = &mut self.layers[index];
            if layer.emitted == 0 {
                return match layer.pending {
                    0 => HashValue::of(b""),
                    1 => layer.last,
                    _ => HashValue::from(layer.digest.finalize()),
                };
            }
            if layer.pending > 0 {
                let hash = layer.close();
                self.forward(index + 1, hash);
            }
            index += 1;
        }
    }
}

impl io::Write for ContentHasher {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::{BoxedChunkAccessor, ChunkAccessor};
    use crate::compression::CompressionType;
    use crate::store::ChunkStore;
    use crate::tree::{write_blob, TreeConfig};
    use proptest::prelude::*;
    use std::sync::Arc;

    fn tree_hash_of(splitter: SplitterConfig, data: &[u8]) -> HashValue {
        let accessor: Arc<dyn ChunkAccessor> =
            Arc::new(BoxedChunkAccessor::new(&ChunkStore::in_memory("hasher"), None));
        let config = TreeConfig {
            splitter,
            compression: CompressionType::Lz4,
        };
        write_blob(accessor, data, config).unwrap().data_hash
    }

    fn hash_of(splitter: SplitterConfig, data: &[u8]) -> HashValue {
        let mut hasher = ContentHasher::new(splitter);
        hasher.update(data);
        hasher.finish()
    }

    #[test]
    fn empty_stream_hashes_to_empty_string() {
        assert_eq!(hash_of(SplitterConfig::default(), b""), HashValue::of(b""));
    }

    #[test]
    fn single_chunk_is_its_own_hash() {
        assert_eq!(hash_of(SplitterConfig::default(), b"hello"), HashValue::of(b"hello"));
    }

    #[test]
    fn mirrors_multi_level_trees() {
        let data: Vec<u8> = (0..100_000u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 13) as u8).collect();
        for splitter in [
            SplitterConfig::FixedSize { block_size: 16 },
            SplitterConfig::FixedSize { block_size: 4096 },
            SplitterConfig::Rolling { target: 128, min: 32, max: 512 },
            SplitterConfig::default(),
        ] {
            assert_eq!(hash_of(splitter, &data), tree_hash_of(splitter, &data), "{:?}", splitter);
        }
    }

    #[test]
    fn digest_does_not_consume() {
        let mut hasher = ContentHasher::new(SplitterConfig::FixedSize { block_size: 8 });
        hasher.update(b"0123456789abcdef0123");
        let first = hasher.digest();
        assert_eq!(first, hasher.digest());
        hasher.update(b"more");
        assert_ne!(first, hasher.digest());
        assert_eq!(hasher.len(), 24);
    }

    #[test]
    fn write_impl_feeds_bytes() {
        use std::io::Write;
        let mut hasher = ContentHasher::new(SplitterConfig::default());
        hasher.write_all(b"via io::Write").unwrap();
        assert_eq!(hasher.finish(), hash_of(SplitterConfig::default(), b"via io::Write"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn prop_hash_mirrors_tree(
            data in prop::collection::vec(0u8..=255, 0..6_000),
            split in 1usize..64,
        ) {
            let splitter = SplitterConfig::Rolling { target: 64, min: 16, max: 256 };
            let mut hasher = ContentHasher::new(splitter);
            let cut = split.min(data.len());
            hasher.update(&data[..cut]);
            hasher.update(&data[cut..]);
            prop_assert_eq!(hasher.finish(), tree_hash_of(splitter, &data));
        }
    }
}
