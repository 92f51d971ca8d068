//! Archive stream and entry writer.
//!
//! # Stream
//! [`ArchiveStream`] owns the archive file handle.  Reads and seeks move a
//! single cursor; writes always land at the physical end of the file, so a
//! cursor left anywhere by a previous scan can never cause an overwrite.
//!
//! After every full scan the engine parks the cursor one byte before the
//! physical end (see [`ArchiveStream::park`]).  Callers may rely on that
//! position.
//!
//! # Writer
//! [`EntryWriter`] appends Entry blocks to a stream while keeping an
//! [`EntryIndex`] in step: it synthesises parent directory entries, refuses
//! names already present, and records every new block at the next index.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;

use crate::block::{serialize_archive_header, serialize_marker, EntryHeader, EntryKind, MARKER_SIGNATURE};
use crate::codec::pack_dos_datetime;
use crate::error::{ArchiveError, Result};
use crate::index::EntryIndex;

// ── Stream ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// Create or truncate, read + write.
    CreateTruncate,
    /// Existing file, read + append.
    Append,
    /// Existing file, read only.
    ReadOnly,
    /// Scratch file of a rewrite, read + write.
    Rewrite,
}

#[derive(Debug)]
pub struct ArchiveStream {
    file: File,
    path: PathBuf,
    mode: StreamMode,
}

impl ArchiveStream {
    pub fn open<P: AsRef<Path>>(path: P, mode: StreamMode) -> io::Result<Self> {
        let path = path.as_ref().to_owned();
        let mut opts = OpenOptions::new();
        match mode {
            StreamMode::CreateTruncate | StreamMode::Rewrite => {
                opts.read(true).write(true).create(true).truncate(true);
            }
            StreamMode::Append   => { opts.read(true).write(true); }
            StreamMode::ReadOnly => { opts.read(true); }
        }
        let file = opts.open(&path)?;
        Ok(Self { file, path, mode })
    }

    /// Wrap an already open handle (the scratch file of a rewrite).
    pub fn from_file(file: File, path: PathBuf, mode: StreamMode) -> Self {
        Self { file, path, mode }
    }

    pub fn path(&self) -> &Path { &self.path }

    pub fn mode(&self) -> StreamMode { self.mode }

    pub fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    pub fn position(&mut self) -> io::Result<u64> {
        self.file.stream_position()
    }

    pub fn at_end(&mut self) -> io::Result<bool> {
        Ok(self.position()? >= self.len()?)
    }

    pub fn rewind(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0)).map(|_| ())
    }

    pub fn seek_relative(&mut self, delta: i64) -> io::Result<u64> {
        self.file.seek(SeekFrom::Current(delta))
    }

    /// Seek to `back` bytes before the physical end (clamped at 0).
    pub fn seek_to_end(&mut self, back: u64) -> io::Result<u64> {
        let len = self.len()?;
        self.file.seek(SeekFrom::Start(len.saturating_sub(back)))
    }

    /// Post-scan cursor position: one byte before the physical end.
    pub fn park(&mut self) -> io::Result<()> {
        self.seek_to_end(1).map(|_| ())
    }

    /// Read exactly `n` bytes or fail with `UnexpectedEof`.
    pub fn read_exactly(&mut self, n: usize) -> io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        (&mut self.file).take(n as u64).read_to_end(&mut buf)?;
        if buf.len() < n {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, format!(
                "expected {n} bytes, found {}", buf.len()
            )));
        }
        Ok(buf)
    }

    /// Append `bytes` at the physical end of the file.
    pub fn write_all(&mut self, bytes: &[u8]) -> io::Result<()> {
        if self.mode == StreamMode::ReadOnly {
            return Err(read_only());
        }
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(bytes)
    }

    /// Copy the next `n` bytes verbatim to the end of `dst`.
    pub fn copy_to(&mut self, dst: &mut ArchiveStream, n: u64) -> io::Result<()> {
        if dst.mode == StreamMode::ReadOnly {
            return Err(read_only());
        }
        dst.file.seek(SeekFrom::End(0))?;
        let copied = io::copy(&mut (&mut self.file).take(n), &mut dst.file)?;
        if copied < n {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, format!(
                "expected {n} content bytes, found {copied}"
            )));
        }
        Ok(())
    }

    /// Cut the file at `len`, dropping anything after it.
    pub fn truncate(&mut self, len: u64) -> io::Result<()> {
        if self.mode == StreamMode::ReadOnly {
            return Err(read_only());
        }
        self.file.set_len(len)
    }

    /// Whether the file starts with the Marker signature.  Leaves the cursor
    /// at the start.
    pub fn has_marker(&mut self) -> io::Result<bool> {
        self.rewind()?;
        let mut head = [0u8; 7];
        let ok = match self.file.read_exact(&mut head) {
            Ok(())                                            => head == MARKER_SIGNATURE,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => false,
            Err(e)                                            => return Err(e),
        };
        self.rewind()?;
        Ok(ok)
    }

    /// Write the Marker and an empty ArchiveHeader.
    pub fn write_preamble(&mut self) -> io::Result<()> {
        self.write_all(&serialize_marker())?;
        self.write_all(&serialize_archive_header())
    }

    pub fn sync(&mut self) -> io::Result<()> {
        if self.mode == StreamMode::ReadOnly {
            return Ok(());
        }
        self.file.flush()?;
        self.file.sync_all()
    }
}

impl Read for ArchiveStream {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }
}

fn read_only() -> io::Error {
    io::Error::new(io::ErrorKind::PermissionDenied, "archive is read-only")
}

// ── Writer ───────────────────────────────────────────────────────────────────

/// Normalise a logical entry name: `\` becomes `/`, surrounding separators
/// are dropped.  Returns `None` when nothing is left.
pub fn normalize_name(name: &str) -> Option<String> {
    let name = name.replace('\\', "/");
    let trimmed = name.trim_matches('/');
    if trimmed.is_empty() { None } else { Some(trimmed.to_owned()) }
}

pub struct EntryWriter<'a> {
    stream: &'a mut ArchiveStream,
    index:  &'a mut EntryIndex,
    mtime:  Option<NaiveDateTime>,
}

impl<'a> EntryWriter<'a> {
    pub fn new(
        stream: &'a mut ArchiveStream,
        index:  &'a mut EntryIndex,
        mtime:  Option<NaiveDateTime>,
    ) -> Self {
        Self { stream, index, mtime }
    }

    /// Append a stored file entry, synthesising its parent directories.
    pub fn add_bytes(&mut self, name: &str, content: &[u8]) -> Result<()> {
        let stamp = pack_dos_datetime(self.mtime);
        self.add_bytes_stamped(name, content, stamp)
    }

    /// `add_bytes` with an explicit packed DOS timestamp.
    pub fn add_bytes_stamped(&mut self, name: &str, content: &[u8], stamp: u32) -> Result<()> {
        let name = normalize_name(name)
            .ok_or_else(|| ArchiveError::InvalidArgument("entry name is empty".into()))?;
        if content.is_empty() {
            return Err(ArchiveError::InvalidArgument(format!("content of '{name}' is empty")));
        }
        self.append_file(&name, content, stamp)
    }

    /// Append a file entry without the empty-content check.  Used when a
    /// rewrite re-stores an existing entry, which may legitimately be empty.
    pub fn append_file(&mut self, name: &str, content: &[u8], stamp: u32) -> Result<()> {
        let name = normalize_name(name)
            .ok_or_else(|| ArchiveError::InvalidArgument("entry name is empty".into()))?;
        if self.index.contains(&name) {
            return Err(ArchiveError::AlreadyExists(name));
        }

        // Validated before any parent directory is written.
        let mut block = EntryHeader::file(&name, content, stamp).serialize()?;
        block.extend_from_slice(content);

        if let Some((parent, _)) = name.rsplit_once('/') {
            // Top-level parents carry no separator and are never materialised.
            match self.add_directory(parent) {
                Ok(()) | Err(ArchiveError::InvalidArgument(_)) => {}
                Err(e) => return Err(e),
            }
        }
        self.stream.write_all(&block)?;
        log::debug!("appended '{}' ({} bytes) to {}", name, content.len(), self.stream.path().display());
        self.index.push(name, EntryKind::File);
        Ok(())
    }

    /// Append a Directory entry for every prefix of `name` not yet present.
    /// `name` must contain a separator.
    pub fn add_directory(&mut self, name: &str) -> Result<()> {
        let name = normalize_name(name)
            .ok_or_else(|| ArchiveError::InvalidArgument("directory name is empty".into()))?;
        if !name.contains('/') {
            return Err(ArchiveError::InvalidArgument(format!(
                "'{name}' has no separator and is not treated as a directory"
            )));
        }
        let stamp = pack_dos_datetime(self.mtime);
        let mut prefix = String::new();
        for part in name.split('/').filter(|p| !p.is_empty()) {
            if !prefix.is_empty() { prefix.push('/'); }
            prefix.push_str(part);
            self.add_directory_entry(&prefix, stamp)?;
        }
        Ok(())
    }

    /// Append a single Directory entry unless the name is already present.
    pub fn add_directory_entry(&mut self, name: &str, stamp: u32) -> Result<()> {
        if self.index.contains(name) {
            return Ok(());
        }
        let block = EntryHeader::directory(name, stamp).serialize()?;
        self.stream.write_all(&block)?;
        log::debug!("appended directory '{}'", name);
        self.index.push(name.to_owned(), EntryKind::Directory);
        Ok(())
    }
}
