//! Append-only branch log at `<repo>/branches/<branch>/log`.
//!
//! Each record is `"<revision> <message>\n<change count>\n"` followed by that
//! many hex hash lines. The log is re-read sequentially on open; an incomplete
//! trailing record left by an interrupted append is cut off.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chunkvault_store::HashValue;
use tracing::{debug, warn};

use crate::directory::valid_name;
use crate::error::{RepoError, RepoResult};

/// One committed revision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    /// Revision number, strictly increasing from 1
    pub revision: u64,
    /// Opaque encoding of the commit pointer
    pub message: String,
    /// Chunk hashes written by the revision
    pub changes: Vec<HashValue>,
}

/// In-memory copy of a branch log plus its file.
#[derive(Debug)]
pub struct BranchLog {
    path: PathBuf,
    entries: Vec<LogEntry>,
}

impl BranchLog {
    /// Open (creating if needed) the log of `branch` in the repository at `repo_dir`
    pub fn open(repo_dir: &Path, branch: &str) -> RepoResult<Self> {
        if !valid_name(branch) {
            return Err(RepoError::InvalidPath(branch.to_string()));
        }
        let dir = repo_dir.join("branches").join(branch);
        fs::create_dir_all(&dir)?;
        let path = dir.join("log");
        let text = match fs::read(&path) {
            Ok(bytes) => String::from_utf8(bytes)
                .map_err(|_| RepoError::InvalidLogMessage("branch log is not UTF-8".into()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(e.into()),
        };
        let (entries, complete) = parse(&text)?;
        if complete < text.len() {
            warn!(
                path = %path.display(),
                dropped = text.len() - complete,
                "dropping incomplete trailing branch log record"
            );
            OpenOptions::new()
                .write(true)
                .open(&path)?
                .set_len(complete as u64)?;
        }
        debug!(path = %path.display(), revisions = entries.len(), "opened branch log");
        Ok(Self { path, entries })
    }

    /// Log file location
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All records, oldest first
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    /// Most recent record
    pub fn latest(&self) -> Option<&LogEntry> {
        self.entries.last()
    }

    /// Latest revision number, 0 when empty
    pub fn revision(&self) -> u64 {
        self.latest().map_or(0, |e| e.revision)
    }

    /// Append a record with the next revision number and sync it to disk
    pub fn append(&mut self, message: &str, changes: &[HashValue]) -> RepoResult<u64> {
        if message.is_empty() || message.contains('\n') {
            return Err(RepoError::InvalidLogMessage(
                "log message must be a single non-empty line".into(),
            ));
        }
        let entry = LogEntry {
            revision: self.revision() + 1,
            message: message.to_string(),
            changes: changes.to_vec(),
        };
        let mut record = format!("{} {}\n{}\n", entry.revision, entry.message, changes.len());
        for hash in changes {
            record.push_str(&hash.to_hex());
            record.push('\n');
        }
        let mut file: File = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(record.as_bytes())?;
        file.sync_data()?;
        let revision = entry.revision;
        self.entries.push(entry);
        Ok(revision)
    }
}

/// Parse complete records; returns them and the byte length they cover.
fn parse(text: &str) -> RepoResult<(Vec<LogEntry>, usize)> {
    let mut entries: Vec<LogEntry> = Vec::new();
    let mut rest = text;
    let mut complete = 0;
    loop {
        let mut cursor = rest;
        let Some(header) = take_line(&mut cursor) else {
            break;
        };
        let Some(count) = take_line(&mut cursor) else {
            break;
        };
        let (revision, message) = header
            .split_once(' ')
            .ok_or_else(|| bad_record(header))?;
        let revision: u64 = revision.parse().map_err(|_| bad_record(header))?;
        let count: usize = count.parse().map_err(|_| bad_record(count))?;
        let mut changes = Vec::with_capacity(count.min(1024));
        for _ in 0..count {
            match take_line(&mut cursor) {
                Some(line) => changes.push(HashValue::from_hex(line).map_err(|_| bad_record(line))?),
                None => break,
            }
        }
        if changes.len() < count {
            break;
        }
        if entries.last().is_some_and(|last| revision <= last.revision) {
            return Err(RepoError::InvalidLogMessage(format!(
                "revision {} out of order",
                revision
            )));
        }
        entries.push(LogEntry {
            revision,
            message: message.to_string(),
            changes,
        });
        complete += rest.len() - cursor.len();
        rest = cursor;
    }
    Ok((entries, complete))
}

/// Next newline-terminated line; `None` when only a partial line is left
fn take_line<'a>(cursor: &mut &'a str) -> Option<&'a str> {
    let (line, rest) = cursor.split_once('\n')?;
    *cursor = rest;
    Some(line)
}

fn bad_record(line: &str) -> RepoError {
    RepoError::InvalidLogMessage(format!("malformed branch log line {:?}", line))
}
