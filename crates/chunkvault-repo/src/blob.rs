//! Typed blobs: tagged records stored as container tree payloads.

use std::sync::Arc;

use chunkvault_store::wire::WireReader;
use chunkvault_store::{read_blob, write_blob, BoxPointer, ChunkAccessor, StoreError, TreeConfig};

use crate::directory::DirectoryBlob;
use crate::error::RepoResult;

/// Tag of a directory blob.
pub const TAG_DIRECTORY: u16 = 1;
/// Tag of a commit blob.
pub const TAG_COMMIT: u16 = 2;

/// A commit: the root directory tree, its parent commits and a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitBox {
    /// Root directory of the committed tree
    pub tree: BoxPointer,
    /// Parent commits, first parent first
    pub parents: Vec<BoxPointer>,
    /// Free-form message
    pub message: Vec<u8>,
}

impl CommitBox {
    /// Message as text, replacing invalid UTF-8
    pub fn message_text(&self) -> String {
        String::from_utf8_lossy(&self.message).into_owned()
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        self.tree.write_to(out);
        out.extend_from_slice(&(self.parents.len() as u32).to_le_bytes());
        for parent in &self.parents {
            parent.write_to(out);
        }
        out.extend_from_slice(&(self.message.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.message);
    }

    fn read_from(reader: &mut WireReader<'_>) -> RepoResult<Self> {
        let tree = BoxPointer::read_from(reader)?;
        let count = reader.u32()?;
        let mut parents = Vec::new();
        for _ in 0..count {
            parents.push(BoxPointer::read_from(reader)?);
        }
        let len = reader.u32()? as usize;
        let message = reader.bytes(len)?.to_vec();
        Ok(Self {
            tree,
            parents,
            message,
        })
    }
}

/// Any record the repository stores as a container tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TypedBlob {
    /// Directory listing
    Directory(DirectoryBlob),
    /// Commit
    Commit(CommitBox),
}

impl TypedBlob {
    /// Wire tag
    pub fn tag(&self) -> u16 {
        match self {
            TypedBlob::Directory(_) => TAG_DIRECTORY,
            TypedBlob::Commit(_) => TAG_COMMIT,
        }
    }

    /// Tag followed by the record body
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&self.tag().to_le_bytes());
        match self {
            TypedBlob::Directory(dir) => dir.write_to(&mut out),
            TypedBlob::Commit(commit) => commit.write_to(&mut out),
        }
        out
    }

    /// Parse a tagged record; trailing bytes are corruption
    pub fn decode(bytes: &[u8]) -> RepoResult<Self> {
        let mut reader = WireReader::new(bytes);
        let blob = match reader.u16()? {
            TAG_DIRECTORY => TypedBlob::Directory(DirectoryBlob::read_from(&mut reader)?),
            TAG_COMMIT => TypedBlob::Commit(CommitBox::read_from(&mut reader)?),
            other => {
                return Err(StoreError::UnsupportedFormat(format!("typed blob tag {}", other)).into())
            }
        };
        reader.finish()?;
        Ok(blob)
    }
}

/// Store a typed blob as a container tree
pub fn write_typed(
    accessor: Arc<dyn ChunkAccessor>,
    blob: &TypedBlob,
    config: TreeConfig,
) -> RepoResult<BoxPointer> {
    Ok(write_blob(accessor, &blob.encode(), config)?)
}

/// Load the typed blob stored at `pointer`
pub fn read_typed(accessor: Arc<dyn ChunkAccessor>, pointer: &BoxPointer) -> RepoResult<TypedBlob> {
    TypedBlob::decode(&read_blob(accessor, pointer)?)
}

/// Load a commit, failing if the blob holds anything else
pub fn read_commit(accessor: Arc<dyn ChunkAccessor>, pointer: &BoxPointer) -> RepoResult<CommitBox> {
    match read_typed(accessor, pointer)? {
        TypedBlob::Commit(commit) => Ok(commit),
        other => Err(unexpected(pointer, other.tag(), TAG_COMMIT)),
    }
}

/// Load a directory, failing if the blob holds anything else
pub fn read_directory(
    accessor: Arc<dyn ChunkAccessor>,
    pointer: &BoxPointer,
) -> RepoResult<DirectoryBlob> {
    match read_typed(accessor, pointer)? {
        TypedBlob::Directory(dir) => Ok(dir),
        other => Err(unexpected(pointer, other.tag(), TAG_DIRECTORY)),
    }
}

fn unexpected(pointer: &BoxPointer, found: u16, expected: u16) -> crate::RepoError {
    StoreError::Corrupted(format!(
        "blob {} has tag {}, expected {}",
        pointer.data_hash, found, expected
    ))
    .into()
}
