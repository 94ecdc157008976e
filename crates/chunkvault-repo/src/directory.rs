//! Directory blobs: the name → entry maps that make up a repository tree.
//!
//! Wire form (after the typed blob tag): `u64 dir count`, `u64 file count`, then
//! directory entries and file entries, each group sorted by name. An entry is a
//! `u32` name length, the UTF-8 name, an attribute byte saying which optional
//! sub-records follow, and those sub-records in bit order.

use std::collections::BTreeMap;

use chunkvault_store::wire::WireReader;
use chunkvault_store::{BoxPointer, StoreError};
use serde::{Deserialize, Serialize};

use crate::error::RepoResult;

const HAS_DATA: u8 = 0x01;
const HAS_ENCRYPTED_ATTRS: u8 = 0x02;
const HAS_ATTRS: u8 = 0x04;
const HAS_BASIC: u8 = 0x08;
const KNOWN_BITS: u8 = HAS_DATA | HAS_ENCRYPTED_ATTRS | HAS_ATTRS | HAS_BASIC;

/// Default mode recorded for files written through the working tree.
pub const DEFAULT_FILE_MODE: u32 = 0o644;

/// Size and mode kept inline in a file entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BasicFileAttrs {
    /// Length of the file content in bytes
    pub size: u64,
    /// Unix permission bits
    pub mode: u32,
}

/// One named entry of a directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    /// Entry name, a single path component
    pub name: String,
    /// File or subdirectory
    pub is_file: bool,
    /// Root of the content tree; `None` while the entry has unflushed changes
    pub data_pointer: Option<BoxPointer>,
    /// Attributes sealed for a narrower audience than the content
    pub encrypted_attrs: Option<BoxPointer>,
    /// Extended attributes blob
    pub attrs: Option<BoxPointer>,
    /// Inline file attributes
    pub basic: Option<BasicFileAttrs>,
}

impl DirEntry {
    /// A file entry
    pub fn file(name: &str, data_pointer: Option<BoxPointer>, size: u64) -> Self {
        Self {
            name: name.to_string(),
            is_file: true,
            data_pointer,
            encrypted_attrs: None,
            attrs: None,
            basic: Some(BasicFileAttrs {
                size,
                mode: DEFAULT_FILE_MODE,
            }),
        }
    }

    /// A subdirectory entry
    pub fn directory(name: &str, data_pointer: Option<BoxPointer>) -> Self {
        Self {
            name: name.to_string(),
            is_file: false,
            data_pointer,
            encrypted_attrs: None,
            attrs: None,
            basic: None,
        }
    }

    /// Whether the entry has changes not yet written
    pub fn is_dirty(&self) -> bool {
        self.data_pointer.is_none()
    }

    /// Same kind and same plaintext content. Dirty entries never compare equal.
    pub fn same_content(&self, other: &DirEntry) -> bool {
        match (&self.data_pointer, &other.data_pointer) {
            (Some(a), Some(b)) => self.is_file == other.is_file && a.same_data(b),
            _ => false,
        }
    }

    fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.name.len() as u32).to_le_bytes());
        out.extend_from_slice(self.name.as_bytes());
        let mut flags = 0u8;
        if self.data_pointer.is_some() {
            flags |= HAS_DATA;
        }
        if self.encrypted_attrs.is_some() {
            flags |= HAS_ENCRYPTED_ATTRS;
        }
        if self.attrs.is_some() {
            flags |= HAS_ATTRS;
        }
        if self.basic.is_some() {
            flags |= HAS_BASIC;
        }
        out.push(flags);
        for pointer in [&self.data_pointer, &self.encrypted_attrs, &self.attrs]
            .into_iter()
            .flatten()
        {
            pointer.write_to(out);
        }
        if let Some(basic) = &self.basic {
            out.extend_from_slice(&basic.size.to_le_bytes());
            out.extend_from_slice(&basic.mode.to_le_bytes());
        }
    }

    fn read_from(reader: &mut WireReader<'_>, is_file: bool) -> RepoResult<Self> {
        let len = reader.u32()? as usize;
        let name = String::from_utf8(reader.bytes(len)?.to_vec())
            .map_err(|_| StoreError::Corrupted("directory entry name is not UTF-8".into()))?;
        if !valid_name(&name) {
            return Err(StoreError::Corrupted(format!("invalid directory entry name {:?}", name)).into());
        }
        let flags = reader.u8()?;
        if flags & !KNOWN_BITS != 0 {
            return Err(StoreError::UnsupportedFormat(format!(
                "directory entry attribute bits {:#04x}",
                flags
            ))
            .into());
        }
        let mut pointer = |bit: u8| -> RepoResult<Option<BoxPointer>> {
            if flags & bit != 0 {
                Ok(Some(BoxPointer::read_from(reader)?))
            } else {
                Ok(None)
            }
        };
        let data_pointer = pointer(HAS_DATA)?;
        let encrypted_attrs = pointer(HAS_ENCRYPTED_ATTRS)?;
        let attrs = pointer(HAS_ATTRS)?;
        let basic = if flags & HAS_BASIC != 0 {
            Some(BasicFileAttrs {
                size: reader.u64()?,
                mode: reader.u32()?,
            })
        } else {
            None
        };
        Ok(Self {
            name,
            is_file,
            data_pointer,
            encrypted_attrs,
            attrs,
            basic,
        })
    }
}

/// Whether `name` can be a single path component
pub fn valid_name(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains('/')
}

/// Name-ordered map of directory entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DirectoryBlob {
    entries: BTreeMap<String, DirEntry>,
}

impl DirectoryBlob {
    /// An empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace an entry, returning the previous one
    pub fn insert(&mut self, entry: DirEntry) -> Option<DirEntry> {
        self.entries.insert(entry.name.clone(), entry)
    }

    /// Remove an entry by name
    pub fn remove(&mut self, name: &str) -> Option<DirEntry> {
        self.entries.remove(name)
    }

    /// Look up an entry
    pub fn get(&self, name: &str) -> Option<&DirEntry> {
        self.entries.get(name)
    }

    /// Look up an entry for modification
    pub fn get_mut(&mut self, name: &str) -> Option<&mut DirEntry> {
        self.entries.get_mut(name)
    }

    /// All entries in name order
    pub fn entries(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.values()
    }

    /// Subdirectory entries in name order
    pub fn directories(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.values().filter(|e| !e.is_file)
    }

    /// File entries in name order
    pub fn files(&self) -> impl Iterator<Item = &DirEntry> {
        self.entries.values().filter(|e| e.is_file)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the directory has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append the body (without the typed blob tag)
    pub fn write_to(&self, out: &mut Vec<u8>) {
        let dirs = self.directories().count() as u64;
        out.extend_from_slice(&dirs.to_le_bytes());
        out.extend_from_slice(&(self.entries.len() as u64 - dirs).to_le_bytes());
        for entry in self.directories().chain(self.files()) {
            entry.write_to(out);
        }
    }

    /// Read a body written by [`DirectoryBlob::write_to`]
    pub fn read_from(reader: &mut WireReader<'_>) -> RepoResult<Self> {
        let dirs = reader.u64()?;
        let files = reader.u64()?;
        let mut blob = Self::new();
        for index in 0..dirs.saturating_add(files) {
            let entry = DirEntry::read_from(reader, index >= dirs)?;
            let name = entry.name.clone();
            if blob.insert(entry).is_some() {
                return Err(StoreError::Corrupted(format!("duplicate directory entry {:?}", name)).into());
            }
        }
        Ok(blob)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chunkvault_store::{HashValue, Iv};

    fn pointer(seed: &[u8]) -> BoxPointer {
        BoxPointer::new(HashValue::of(seed), HashValue::of(&[seed, b"box"].concat()), Iv([3; 16]))
    }

    fn decode(bytes: &[u8]) -> RepoResult<DirectoryBlob> {
        let mut reader = WireReader::new(bytes);
        let blob = DirectoryBlob::read_from(&mut reader)?;
        reader.finish()?;
        Ok(blob)
    }

    #[test]
    fn test_directories_are_written_first() {
        let mut blob = DirectoryBlob::new();
        blob.insert(DirEntry::file("a", Some(pointer(b"a")), 5));
        blob.insert(DirEntry::directory("z", Some(pointer(b"z"))));
        let mut out = Vec::new();
        blob.write_to(&mut out);

        assert_eq!(&out[0..8], &1u64.to_le_bytes());
        assert_eq!(&out[8..16], &1u64.to_le_bytes());
        assert_eq!(&out[16..20], &1u32.to_le_bytes());
        assert_eq!(out[20], b'z');
        assert_eq!(out[21], HAS_DATA);
        assert_eq!(decode(&out).unwrap(), blob);
    }

    #[test]
    fn test_optional_records_follow_flags() {
        let mut entry = DirEntry::file("notes.txt", Some(pointer(b"n")), 12);
        entry.attrs = Some(pointer(b"attrs"));
        let mut blob = DirectoryBlob::new();
        blob.insert(entry.clone());
        blob.insert(DirEntry::file("dirty", None, 0));
        let mut out = Vec::new();
        blob.write_to(&mut out);

        let back = decode(&out).unwrap();
        assert_eq!(back.get("notes.txt"), Some(&entry));
        assert!(back.get("dirty").unwrap().is_dirty());
        assert_eq!(back.get("dirty").unwrap().basic.unwrap().mode, DEFAULT_FILE_MODE);
    }

    #[test]
    fn test_unknown_attribute_bits_rejected() {
        let mut out = Vec::new();
        out.extend_from_slice(&0u64.to_le_bytes());
        out.extend_from_slice(&1u64.to_le_bytes());
        out.extend_from_slice(&1u32.to_le_bytes());
        out.push(b'f');
        out.push(0x40);
        assert!(matches!(
            decode(&out),
            Err(crate::RepoError::Store(StoreError::UnsupportedFormat(_)))
        ));
    }

    #[test]
    fn test_truncated_and_duplicate_entries_rejected() {
        let mut blob = DirectoryBlob::new();
        blob.insert(DirEntry::directory("d", Some(pointer(b"d"))));
        let mut out = Vec::new();
        blob.write_to(&mut out);
        assert!(decode(&out[..out.len() - 1]).is_err());

        let entry_bytes = out[16..].to_vec();
        let mut doubled = Vec::new();
        doubled.extend_from_slice(&2u64.to_le_bytes());
        doubled.extend_from_slice(&0u64.to_le_bytes());
        doubled.extend_from_slice(&entry_bytes);
        doubled.extend_from_slice(&entry_bytes);
        assert!(decode(&doubled).is_err());
    }

    #[test]
    fn test_same_content_ignores_box_encoding() {
        let a = DirEntry::file("x", Some(pointer(b"same")), 4);
        let mut other = pointer(b"same");
        other.box_hash = HashValue::of(b"another key");
        let b = DirEntry::file("x", Some(other), 4);
        assert!(a.same_content(&b));
        assert!(!a.same_content(&DirEntry::directory("x", Some(pointer(b"same")))));
        assert!(!a.same_content(&DirEntry::file("x", None, 4)));
    }

    #[test]
    fn test_valid_names() {
        assert!(valid_name("file.txt"));
        assert!(!valid_name(""));
        assert!(!valid_name(".."));
        assert!(!valid_name("a/b"));
    }
}
