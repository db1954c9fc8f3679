//! Incremental reader for one append-only NDJSON log.
//!
//! The reader remembers how far into the file it has read and hands back only
//! lines that are complete (newline-terminated) since the previous poll. A
//! trailing fragment written mid-flush is buffered, not discarded, and is
//! emitted once its newline lands.
//!
//! # Truncation and rotation
//!
//! A file that shrinks below the read offset, that is replaced under the same
//! path (different inode on Unix), or whose leading bytes change, resets the
//! reader to offset 0 and reports [`ReadError::Truncated`]. The owner is
//! expected to discard everything derived from the old contents.
//!
//! # Backpressure
//!
//! Each poll reads at most `chunk_bytes`. Anything beyond that is left for
//! the next poll and [`LogReader::has_backlog`] reports it.

use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, warn};

use crate::error::ReadError;

/// Bytes of the file head remembered to detect in-place rewrites.
const HEAD_FINGERPRINT_BYTES: usize = 64;

/// Position of a reader within its file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Cursor {
    /// Bytes consumed up to the end of the last complete line.
    pub offset: u64,
    /// Complete lines handed out since the last reset.
    pub lines: u64,
}

/// Polling reader over a single log file.
#[derive(Debug)]
pub struct LogReader {
    path: PathBuf,
    /// Bytes read from the file, including the buffered fragment.
    read_offset: u64,
    /// Unterminated tail bytes awaiting their newline.
    pending: Vec<u8>,
    lines: u64,
    chunk_bytes: usize,
    backlog: bool,
    head: Vec<u8>,
    identity: Option<FileIdentity>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
fn file_identity(meta: &fs::Metadata) -> Option<FileIdentity> {
    use std::os::unix::fs::MetadataExt;
    Some(FileIdentity {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

#[cfg(not(unix))]
fn file_identity(_meta: &fs::Metadata) -> Option<FileIdentity> {
    None
}

impl LogReader {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            read_offset: 0,
            pending: Vec::new(),
            lines: 0,
            chunk_bytes: crate::DEFAULT_POLL_CHUNK_BYTES,
            backlog: false,
            head: Vec::new(),
            identity: None,
        }
    }

    /// Limit the bytes read per poll.
    pub fn with_chunk_bytes(mut self, chunk_bytes: usize) -> Self {
        self.chunk_bytes = chunk_bytes.max(1);
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn cursor(&self) -> Cursor {
        Cursor {
            offset: self.read_offset - self.pending.len() as u64,
            lines: self.lines,
        }
    }

    /// Whether the last poll stopped before end-of-file.
    pub fn has_backlog(&self) -> bool {
        self.backlog
    }

    /// Bytes buffered from an unterminated final line.
    pub fn pending_bytes(&self) -> usize {
        self.pending.len()
    }

    /// Forget all progress; the next poll starts at byte 0.
    pub fn reset(&mut self) {
        self.read_offset = 0;
        self.pending.clear();
        self.lines = 0;
        self.backlog = false;
        self.head.clear();
        self.identity = None;
    }

    fn unavailable(&self, source: std::io::Error) -> ReadError {
        ReadError::Unavailable {
            path: self.path.clone(),
            source,
        }
    }

    fn truncated(&mut self, current_size: u64) -> ReadError {
        let previous_offset = self.read_offset;
        warn!(
            path = %self.path.display(),
            previous_offset,
            current_size,
            "log truncated or rotated; resetting reader"
        );
        self.reset();
        ReadError::Truncated {
            path: self.path.clone(),
            previous_offset,
            current_size,
        }
    }

    /// Return complete lines appended since the previous poll.
    ///
    /// Lines have their `\n` (and any `\r`) stripped and are returned as raw
    /// bytes; decoding is left to [`parse_bytes`](crate::record::parse_bytes)
    /// so invalid UTF-8 is rejected per line.
    pub fn poll(&mut self) -> Result<Vec<Vec<u8>>, ReadError> {
        let meta = fs::metadata(&self.path).map_err(|e| self.unavailable(e))?;
        let size = meta.len();
        let identity = file_identity(&meta);

        if self.read_offset > 0 {
            if let (Some(prev), Some(cur)) = (self.identity, identity) {
                if prev != cur {
                    return Err(self.truncated(size));
                }
            }
            if size < self.read_offset {
                return Err(self.truncated(size));
            }
        }
        self.identity = identity;

        if size == self.read_offset {
            self.backlog = false;
            return Ok(Vec::new());
        }

        let mut file = File::open(&self.path).map_err(|e| self.unavailable(e))?;

        if !self.head.is_empty() && !self.head_matches(&mut file)? {
            return Err(self.truncated(size));
        }

        let to_read = (size - self.read_offset).min(self.chunk_bytes as u64);
        file.seek(SeekFrom::Start(self.read_offset))
            .map_err(|e| self.unavailable(e))?;
        let mut buf = Vec::with_capacity(to_read as usize);
        file.take(to_read)
            .read_to_end(&mut buf)
            .map_err(|e| self.unavailable(e))?;

        if self.head.len() < HEAD_FINGERPRINT_BYTES && self.read_offset == self.head.len() as u64 {
            let want = (HEAD_FINGERPRINT_BYTES - self.head.len()).min(buf.len());
            self.head.extend_from_slice(&buf[..want]);
        }

        self.read_offset += buf.len() as u64;
        self.backlog = self.read_offset < size;
        self.pending.extend_from_slice(&buf);

        let lines = self.drain_complete_lines();
        if !lines.is_empty() || self.backlog {
            debug!(
                path = %self.path.display(),
                offset = self.read_offset,
                lines = lines.len(),
                pending = self.pending.len(),
                backlog = self.backlog,
                "polled log"
            );
        }
        Ok(lines)
    }

    fn head_matches(&self, file: &mut File) -> Result<bool, ReadError> {
        let mut current = vec![0u8; self.head.len()];
        file.seek(SeekFrom::Start(0))
            .and_then(|_| file.read_exact(&mut current))
            .map_err(|e| self.unavailable(e))?;
        Ok(current == self.head)
    }

    fn drain_complete_lines(&mut self) -> Vec<Vec<u8>> {
        let Some(last_newline) = self.pending.iter().rposition(|b| *b == b'\n') else {
            return Vec::new();
        };
        let rest = self.pending.split_off(last_newline + 1);
        let complete = std::mem::replace(&mut self.pending, rest);

        let lines: Vec<Vec<u8>> = complete[..complete.len() - 1]
            .split(|b| *b == b'\n')
            .map(|raw| raw.strip_suffix(b"\r").unwrap_or(raw).to_vec())
            .collect();
        self.lines += lines.len() as u64;
        lines
    }
}
