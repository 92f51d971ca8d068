//! Rewrite protocol behind rename and delete.
//!
//! The format has no in-place update, so a mutation streams every retained
//! block into a scratch file next to the archive and then swaps it in.  The
//! protocol is a typestate chain:
//!
//! ```text
//! Rewriting::begin ──run──▶ Staged ──swap──▶ Swapped ──reopen──▶ (stream, index)
//! ```
//!
//! The original file is untouched until [`Staged::swap`].  Dropping a
//! `Rewriting` or `Staged` at any point deletes the scratch file and leaves
//! the archive byte-for-byte as it was.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use tempfile::NamedTempFile;

use crate::block::{Block, RawBlock, ReadOutcome, ARCHIVE_HEADER_TYPE, METHOD_STORE, PREFIX_SIZE};
use crate::error::{ArchiveError, Result};
use crate::index::{EntryIndex, Scanner};
use crate::io_stream::{ArchiveStream, EntryWriter, StreamMode};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteAction {
    /// Omit the target entry and its content.
    Delete,
    /// Re-add the target's content under a new, normalised name.
    Rename(String),
}

// ── Rewriting ────────────────────────────────────────────────────────────────

pub struct Rewriting<'a> {
    source: &'a mut ArchiveStream,
    temp:   NamedTempFile,
    out:    ArchiveStream,
    /// Copy of the source index; dedupes entries re-added by a rename.
    index:  EntryIndex,
    /// Timestamp for directories synthesised by a rename.
    mtime:  Option<NaiveDateTime>,
}

impl<'a> Rewriting<'a> {
    /// Create the scratch file and copy the Marker and ArchiveHeader into it.
    /// A read-only source is refused before anything is created.
    pub fn begin(
        source: &'a mut ArchiveStream,
        index:  &EntryIndex,
        mtime:  Option<NaiveDateTime>,
    ) -> Result<Self> {
        if source.mode() == StreamMode::ReadOnly {
            return Err(ArchiveError::Io(io::Error::new(
                io::ErrorKind::PermissionDenied,
                format!("{} is open read-only", source.path().display()),
            )));
        }
        let dir = match source.path().parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let temp = tempfile::Builder::new()
            .prefix(".rarchive-")
            .suffix(".tmp")
            .tempfile_in(&dir)?;
        let mut out = ArchiveStream::from_file(temp.reopen()?, temp.path().to_owned(), StreamMode::Rewrite);

        let copied = copy_preamble(source, &mut out);
        if copied.is_err() {
            source.park()?;
        }
        copied?;

        Ok(Self { source, temp, out, index: index.clone(), mtime })
    }

    /// Stream every block after the header into the scratch file, applying
    /// `action` to the file entry at logical index `target`.
    ///
    /// The source cursor is parked one byte before its end whether or not
    /// the run succeeds.
    pub fn run(self, target: usize, action: &RewriteAction) -> Result<Staged> {
        let Rewriting { source, temp, mut out, mut index, mtime } = self;
        let mut scanner = Scanner::resume(source);
        let streamed = stream_blocks(&mut scanner, &mut out, &mut index, mtime, target, action);
        scanner.finish()?;
        let applied = streamed?;

        if !applied {
            return Err(ArchiveError::NotFound(format!("no file entry at index {target}")));
        }
        out.sync()?;
        if !out.has_marker()? {
            return Err(ArchiveError::Format("rewritten archive lacks the marker signature".into()));
        }
        log::debug!("staged rewrite of entry {} in {}", target, temp.path().display());
        Ok(Staged { temp, out })
    }
}

fn copy_preamble(source: &mut ArchiveStream, out: &mut ArchiveStream) -> Result<()> {
    source.rewind()?;
    let marker = source.read_exactly(PREFIX_SIZE)?;
    out.write_all(&marker)?;
    match RawBlock::read(&mut *source)? {
        ReadOutcome::Block(raw) if raw.block_type() == ARCHIVE_HEADER_TYPE => {
            out.write_all(&raw.bytes)?;
            Ok(())
        }
        _ => Err(ArchiveError::Format(format!(
            "archive header of {} is missing or corrupt", source.path().display()
        ))),
    }
}

/// Copy every block into `out`, applying `action` to the file entry at
/// `target`.  Returns whether the target was met.
fn stream_blocks(
    scanner: &mut Scanner<'_>,
    out:     &mut ArchiveStream,
    index:   &mut EntryIndex,
    mtime:   Option<NaiveDateTime>,
    target:  usize,
    action:  &RewriteAction,
) -> Result<bool> {
    let mut applied = false;
    while let Some(scanned) = scanner.next_block()? {
        match &scanned.block {
            Block::Entry(header) if !header.is_directory() && scanned.index == target => {
                applied = true;
                match action {
                    RewriteAction::Delete => scanner.skip_content()?,
                    RewriteAction::Rename(new_name) => {
                        if header.method != METHOD_STORE {
                            return Err(ArchiveError::Format(format!(
                                "'{}' is compressed and cannot be re-stored", header.name
                            )));
                        }
                        let content = scanner.read_content(None)?;
                        EntryWriter::new(out, index, mtime)
                            .append_file(new_name, &content, header.mtime)?;
                    }
                }
            }
            _ => {
                out.write_all(&scanned.raw.bytes)?;
                scanner.copy_content(out)?;
            }
        }
    }
    Ok(applied)
}

// ── Staged ───────────────────────────────────────────────────────────────────

/// A fully written and validated scratch archive, not yet swapped in.
pub struct Staged {
    temp: NamedTempFile,
    out:  ArchiveStream,
}

impl Staged {
    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    /// Atomically move the scratch file over `target`.
    pub fn swap(self, target: &Path) -> Result<Swapped> {
        let Staged { temp, out } = self;
        drop(out);
        if let Ok(meta) = fs::metadata(target) {
            fs::set_permissions(temp.path(), meta.permissions())?;
        }
        temp.persist(target).map_err(|e| ArchiveError::Io(e.error))?;
        log::debug!("swapped rewritten archive into {}", target.display());
        Ok(Swapped { path: target.to_owned() })
    }
}

// ── Swapped ──────────────────────────────────────────────────────────────────

pub struct Swapped {
    path: PathBuf,
}

impl Swapped {
    /// Reopen the new archive for append and rebuild its index.
    pub fn reopen(self) -> Result<(ArchiveStream, EntryIndex)> {
        let mut stream = ArchiveStream::open(&self.path, StreamMode::Append)?;
        if !stream.has_marker()? {
            return Err(ArchiveError::Format(format!(
                "{} lost its marker signature", self.path.display()
            )));
        }
        let index = EntryIndex::rebuild(&mut stream)?;
        Ok((stream, index))
    }
}
