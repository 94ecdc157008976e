//! Byte-stream adapters over a container tree.

use std::io::{self, Read, Seek, SeekFrom, Write};
use std::sync::Arc;

use bytes::Bytes;
use tracing::warn;

use crate::accessor::ChunkAccessor;
use crate::box_pointer::BoxPointer;
use crate::cache::CacheConfig;
use crate::error::StoreResult;
use crate::splitter::ChunkSplitter;
use crate::tree::{ContainerTree, TreeConfig};

fn io_error(e: crate::error::StoreError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e)
}

/// Appends a byte stream to a tree in content-defined chunks.
///
/// The last leaf of the tree is pulled back first so that appending continues
/// the chunking of the existing stream. Buffered bytes reach the tree on
/// [`ChunkedAppender::finish`], on `flush`, or when the appender is dropped.
pub struct ChunkedAppender<'a> {
    tree: &'a mut ContainerTree,
    splitter: ChunkSplitter,
    pending: Vec<u8>,
    // The tail leaf was written by `flush` and must be pulled back before more input
    reopen: bool,
}

impl<'a> ChunkedAppender<'a> {
    /// Start appending to `tree`
    pub fn new(tree: &'a mut ContainerTree) -> StoreResult<Self> {
        let splitter = ChunkSplitter::new(tree.config().splitter);
        let mut appender = Self {
            tree,
            splitter,
            pending: Vec::new(),
            reopen: true,
        };
        appender.pull_tail()?;
        Ok(appender)
    }

    fn pull_tail(&mut self) -> StoreResult<()> {
        self.reopen = false;
        if let Some(last) = self.tree.pop_last()? {
            self.feed(&last)?;
        }
        Ok(())
    }

    /// Feed bytes; complete chunks are appended to the tree
    pub fn push(&mut self, data: &[u8]) -> StoreResult<()> {
        if self.reopen {
            self.pull_tail()?;
        }
        self.feed(data)
    }

    fn feed(&mut self, mut data: &[u8]) -> StoreResult<()> {
        while !data.is_empty() {
            match self.splitter.find_boundary(data) {
                Some(n) => {
                    self.pending.extend_from_slice(&data[..n]);
                    self.emit()?;
                    data = &data[n..];
                }
                None => {
                    self.pending.extend_from_slice(data);
                    break;
                }
            }
        }
        Ok(())
    }

    fn emit(&mut self) -> StoreResult<()> {
        let chunk = std::mem::take(&mut self.pending);
        self.tree.append(&chunk)?;
        self.splitter.reset();
        Ok(())
    }

    /// Write the trailing partial chunk to the tree
    fn emit_pending(&mut self) -> StoreResult<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.emit()?;
        self.reopen = true;
        Ok(())
    }

    /// Append the trailing partial chunk
    pub fn finish(mut self) -> StoreResult<()> {
        self.emit_pending()
    }
}

impl Write for ChunkedAppender<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.push(buf).map_err(io_error)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.emit_pending().map_err(io_error)
    }
}

impl Drop for ChunkedAppender<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.emit_pending() {
            warn!("dropping {} buffered bytes: {}", self.pending.len(), e);
        }
    }
}

/// Reads a tree as a seekable byte stream.
pub struct ContainerReader<'a> {
    tree: &'a mut ContainerTree,
    position: u64,
    current: Option<(Bytes, u64)>,
}

impl<'a> ContainerReader<'a> {
    /// Read `tree` from the start
    pub fn new(tree: &'a mut ContainerTree) -> Self {
        Self {
            tree,
            position: 0,
            current: None,
        }
    }

    /// Current read position
    pub fn position(&self) -> u64 {
        self.position
    }
}

impl Read for ContainerReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || self.position >= self.tree.len() {
            return Ok(0);
        }
        let covers = |(bytes, start): &(Bytes, u64)| {
            *start <= self.position && self.position < start + bytes.len() as u64
        };
        if !self.current.as_ref().is_some_and(covers) {
            self.current = Some(self.tree.read_chunk(self.position).map_err(io_error)?);
        }
        let Some((bytes, start)) = &self.current else {
            return Ok(0);
        };
        let offset = (self.position - start) as usize;
        let n = buf.len().min(bytes.len() - offset);
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        self.position += n as u64;
        Ok(n)
    }
}

impl Seek for ContainerReader<'_> {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let target = match pos {
            SeekFrom::Start(p) => Some(p),
            SeekFrom::End(delta) => self.tree.len().checked_add_signed(delta),
            SeekFrom::Current(delta) => self.position.checked_add_signed(delta),
        };
        match target {
            Some(p) => {
                self.position = p;
                Ok(p)
            }
            None => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "seek before the start of the stream",
            )),
        }
    }
}

/// Store `bytes` as a new container tree and return its root pointer
pub fn write_blob(
    accessor: Arc<dyn ChunkAccessor>,
    bytes: &[u8],
    config: TreeConfig,
) -> StoreResult<BoxPointer> {
    let mut tree = ContainerTree::create(accessor, config, CacheConfig::default())?;
    let mut appender = ChunkedAppender::new(&mut tree)?;
    appender.push(bytes)?;
    appender.finish()?;
    tree.flush(false)
}

/// Read the whole stream of the tree at `pointer`
pub fn read_blob(accessor: Arc<dyn ChunkAccessor>, pointer: &BoxPointer) -> StoreResult<Vec<u8>> {
    ContainerTree::load(accessor, pointer, CacheConfig::default())?.read_all()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::accessor::BoxedChunkAccessor;
    use crate::compression::CompressionType;
    use crate::splitter::SplitterConfig;
    use crate::store::ChunkStore;

    fn accessor() -> Arc<dyn ChunkAccessor> {
        Arc::new(BoxedChunkAccessor::new(&ChunkStore::in_memory("stream"), None))
    }

    fn config() -> TreeConfig {
        TreeConfig {
            splitter: SplitterConfig::Rolling {
                target: 256,
                min: 64,
                max: 1024,
            },
            compression: CompressionType::Zstd,
        }
    }

    fn data(len: usize) -> Vec<u8> {
        let mut state = 0x2545_f491_4f6c_dd1du64;
        (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 24) as u8
            })
            .collect()
    }

    #[test]
    fn blob_roundtrip() {
        let acc = accessor();
        let bytes = data(50_000);
        let pointer = write_blob(acc.clone(), &bytes, config()).unwrap();
        assert_eq!(read_blob(acc, &pointer).unwrap(), bytes);
    }

    #[test]
    fn appending_in_pieces_matches_one_shot() {
        let acc = accessor();
        let bytes = data(30_000);
        let one_shot = write_blob(acc.clone(), &bytes, config()).unwrap();

        let mut tree = ContainerTree::create(acc.clone(), config(), CacheConfig::default()).unwrap();
        for part in bytes.chunks(7_001) {
            let mut appender = ChunkedAppender::new(&mut tree).unwrap();
            appender.write_all(part).unwrap();
            appender.finish().unwrap();
            tree.flush(true).unwrap();
        }
        assert_eq!(tree.flush(true).unwrap(), one_shot);
    }

    fn fixed(block_size: u32) -> TreeConfig {
        TreeConfig {
            splitter: SplitterConfig::FixedSize { block_size },
            compression: CompressionType::None,
        }
    }

    #[test]
    fn dropped_appender_keeps_tail_and_buffered_bytes() {
        let acc = accessor();
        let mut tree = ContainerTree::create(acc, fixed(4), CacheConfig::default()).unwrap();
        {
            let mut appender = ChunkedAppender::new(&mut tree).unwrap();
            appender.write_all(b"abcdef").unwrap();
            appender.finish().unwrap();
        }
        assert_eq!(tree.len(), 6);

        {
            let mut appender = ChunkedAppender::new(&mut tree).unwrap();
            appender.write_all(b"g").unwrap();
            appender.flush().unwrap();
        }
        assert_eq!(tree.len(), 7);
        assert_eq!(tree.read_all().unwrap(), b"abcdefg");

        {
            let mut appender = ChunkedAppender::new(&mut tree).unwrap();
            appender.write_all(b"hi").unwrap();
        }
        assert_eq!(tree.read_all().unwrap(), b"abcdefghi");

        {
            let _untouched = ChunkedAppender::new(&mut tree).unwrap();
        }
        assert_eq!(tree.read_all().unwrap(), b"abcdefghi");
    }

    #[test]
    fn writing_after_flush_keeps_chunk_boundaries() {
        let acc = accessor();
        let bytes = data(30_000);
        let one_shot = write_blob(acc.clone(), &bytes, config()).unwrap();

        let mut tree = ContainerTree::create(acc, config(), CacheConfig::default()).unwrap();
        let mut appender = ChunkedAppender::new(&mut tree).unwrap();
        for part in bytes.chunks(4_999) {
            appender.write_all(part).unwrap();
            appender.flush().unwrap();
        }
        drop(appender);
        assert_eq!(tree.flush(true).unwrap(), one_shot);
    }

    #[test]
    fn reader_reads_and_seeks() {
        let acc = accessor();
        let bytes = data(20_000);
        let pointer = write_blob(acc.clone(), &bytes, config()).unwrap();
        let mut tree = ContainerTree::load(acc, &pointer, CacheConfig::default()).unwrap();
        let mut reader = ContainerReader::new(&mut tree);

        let mut all = Vec::new();
        reader.read_to_end(&mut all).unwrap();
        assert_eq!(all, bytes);

        reader.seek(SeekFrom::Start(12_345)).unwrap();
        let mut buf = [0u8; 100];
        reader.read_exact(&mut buf).unwrap();
        assert_eq!(&buf[..], &bytes[12_345..12_445]);

        reader.seek(SeekFrom::End(-10)).unwrap();
        let mut tail = Vec::new();
        reader.read_to_end(&mut tail).unwrap();
        assert_eq!(tail, &bytes[bytes.len() - 10..]);
        assert!(reader.seek(SeekFrom::Current(-100_000)).is_err());
    }
}
