//! Backing collaborators of the chunk store: an ordered hash index and an
//! append-only pack of raw bytes, each with a file and an in-memory variant.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::hash::{HashValue, HASH_LEN};

/// Size of one index record: hash + u64 offset.
pub const INDEX_RECORD_LEN: usize = HASH_LEN + 8;
/// Size of the per-record header in the pack: hash + u32 length.
pub const PACK_HEADER_LEN: usize = HASH_LEN + 4;

/// Ordered map from content hash to pack offset.
pub trait HashIndex: Send {
    /// Offset of the record for `hash`, if indexed.
    fn get(&self, hash: &HashValue) -> Option<u64>;
    /// Record the offset of a newly appended pack record.
    fn put(&mut self, hash: HashValue, offset: u64) -> StoreResult<()>;
    /// All entries in hash order.
    fn entries(&self) -> Vec<(HashValue, u64)>;
    /// Number of indexed hashes.
    fn len(&self) -> usize;
    /// Whether the index is empty.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// Make every `put` so far durable.
    fn sync(&mut self) -> StoreResult<()>;
}

/// Append-only log of hashed byte records.
pub trait PackLog: Send {
    /// Append a record and return its offset.
    fn append(&mut self, hash: &HashValue, bytes: &[u8]) -> StoreResult<u64>;
    /// Read the record at `offset`, checking it was stored under `hash`.
    fn read(&mut self, offset: u64, hash: &HashValue) -> StoreResult<Vec<u8>>;
    /// Total bytes in the log.
    fn size(&self) -> u64;
    /// Make every append so far durable.
    fn sync(&mut self) -> StoreResult<()>;
}

/// In-memory index backed by a BTreeMap.
#[derive(Debug, Default)]
pub struct MemoryHashIndex {
    entries: BTreeMap<HashValue, u64>,
}

impl MemoryHashIndex {
    /// Create an empty index
    pub fn new() -> Self {
        Self::default()
    }
}

impl HashIndex for MemoryHashIndex {
    fn get(&self, hash: &HashValue) -> Option<u64> {
        self.entries.get(hash).copied()
    }

    fn put(&mut self, hash: HashValue, offset: u64) -> StoreResult<()> {
        self.entries.insert(hash, offset);
        Ok(())
    }

    fn entries(&self) -> Vec<(HashValue, u64)> {
        self.entries.iter().map(|(h, o)| (*h, *o)).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn sync(&mut self) -> StoreResult<()> {
        Ok(())
    }
}

/// Index persisted as an append-only file of `hash | offset` records, loaded into memory at open.
pub struct FileHashIndex {
    entries: BTreeMap<HashValue, u64>,
    file: File,
}

impl FileHashIndex {
    /// Open (and with `create`, create) the index file at `path`
    pub fn open(path: &Path, create: bool) -> StoreResult<Self> {
        if !create && !path.exists() {
            return Err(StoreError::NotFound(path.display().to_string()));
        }
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(create)
            .open(path)?;
        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let complete = raw.len() / INDEX_RECORD_LEN * INDEX_RECORD_LEN;
        if complete != raw.len() {
            warn!(
                path = %path.display(),
                trailing = raw.len() - complete,
                "dropping truncated index record"
            );
            file.set_len(complete as u64)?;
        }
        let mut entries = BTreeMap::new();
        for record in raw[..complete].chunks_exact(INDEX_RECORD_LEN) {
            let hash = HashValue::from_slice(&record[..HASH_LEN])?;
            let mut offset = [0u8; 8];
            offset.copy_from_slice(&record[HASH_LEN..]);
            entries.insert(hash, u64::from_le_bytes(offset));
        }
        debug!(path = %path.display(), entries = entries.len(), "loaded hash index");
        Ok(Self { entries, file })
    }
}

impl HashIndex for FileHashIndex {
    fn get(&self, hash: &HashValue) -> Option<u64> {
        self.entries.get(hash).copied()
    }

    fn put(&mut self, hash: HashValue, offset: u64) -> StoreResult<()> {
        let mut record = [0u8; INDEX_RECORD_LEN];
        record[..HASH_LEN].copy_from_slice(hash.as_bytes());
        record[HASH_LEN..].copy_from_slice(&offset.to_le_bytes());
        self.file.write_all(&record)?;
        self.entries.insert(hash, offset);
        Ok(())
    }

    fn entries(&self) -> Vec<(HashValue, u64)> {
        self.entries.iter().map(|(h, o)| (*h, *o)).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn sync(&mut self) -> StoreResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}

fn write_record(out: &mut Vec<u8>, hash: &HashValue, bytes: &[u8]) -> StoreResult<()> {
    let len = u32::try_from(bytes.len())
        .map_err(|_| StoreError::DataLengthOverflow(bytes.len() as u64))?;
    out.extend_from_slice(hash.as_bytes());
    out.extend_from_slice(&len.to_le_bytes());
    out.extend_from_slice(bytes);
    Ok(())
}

fn check_record_hash(offset: u64, stored: &[u8], hash: &HashValue) -> StoreResult<()> {
    if stored != hash.as_bytes() {
        return Err(StoreError::Corrupted(format!(
            "pack record at {} does not belong to {}",
            offset, hash
        )));
    }
    Ok(())
}

/// In-memory pack.
#[derive(Debug, Default)]
pub struct MemoryPackLog {
    data: Vec<u8>,
}

impl MemoryPackLog {
    /// Create an empty pack
    pub fn new() -> Self {
        Self::default()
    }
}

impl PackLog for MemoryPackLog {
    fn append(&mut self, hash: &HashValue, bytes: &[u8]) -> StoreResult<u64> {
        let offset = self.data.len() as u64;
        write_record(&mut self.data, hash, bytes)?;
        Ok(offset)
    }

    fn read(&mut self, offset: u64, hash: &HashValue) -> StoreResult<Vec<u8>> {
        let start = offset as usize;
        let header = self
            .data
            .get(start..start + PACK_HEADER_LEN)
            .ok_or_else(|| StoreError::Corrupted(format!("pack offset {} out of range", offset)))?;
        check_record_hash(offset, &header[..HASH_LEN], hash)?;
        let mut len = [0u8; 4];
        len.copy_from_slice(&header[HASH_LEN..]);
        let body_start = start + PACK_HEADER_LEN;
        let body_end = body_start + u32::from_le_bytes(len) as usize;
        self.data
            .get(body_start..body_end)
            .map(|b| b.to_vec())
            .ok_or_else(|| StoreError::Corrupted(format!("pack record at {} is truncated", offset)))
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn sync(&mut self) -> StoreResult<()> {
        Ok(())
    }
}

/// Pack persisted as a single append-only file.
pub struct FilePackLog {
    file: File,
    size: u64,
}

impl FilePackLog {
    /// Open (and with `create`, create) the pack file at `path`
    pub fn open(path: &Path, create: bool) -> StoreResult<Self> {
        if !create && !path.exists() {
            return Err(StoreError::NotFound(path.display().to_string()));
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(create)
            .truncate(false)
            .open(path)?;
        let size = file.metadata()?.len();
        Ok(Self { file, size })
    }
}

impl PackLog for FilePackLog {
    fn append(&mut self, hash: &HashValue, bytes: &[u8]) -> StoreResult<u64> {
        let offset = self.size;
        let mut record = Vec::with_capacity(PACK_HEADER_LEN + bytes.len());
        write_record(&mut record, hash, bytes)?;
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(&record)?;
        self.size += record.len() as u64;
        Ok(offset)
    }

    fn read(&mut self, offset: u64, hash: &HashValue) -> StoreResult<Vec<u8>> {
        if offset + PACK_HEADER_LEN as u64 > self.size {
            return Err(StoreError::Corrupted(format!(
                "pack offset {} beyond end {}",
                offset, self.size
            )));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        let mut header = [0u8; PACK_HEADER_LEN];
        self.file.read_exact(&mut header)?;
        check_record_hash(offset, &header[..HASH_LEN], hash)?;
        let mut len = [0u8; 4];
        len.copy_from_slice(&header[HASH_LEN..]);
        let len = u32::from_le_bytes(len) as usize;
        let mut body = vec![0u8; len];
        self.file.read_exact(&mut body)?;
        Ok(body)
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn sync(&mut self) -> StoreResult<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
