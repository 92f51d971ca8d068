//! High-level [`Archive`] API, the primary embedding surface.
//!
//! ```no_run
//! use rarchive::archive::{Archive, OpenMode};
//!
//! // Write
//! let mut ar = Archive::open("out.rar", OpenMode::CreateNew)?;
//! ar.add_bytes("docs/readme.txt", b"Hello, world!")?;
//!
//! // Read
//! let index = ar.get_index_by_name("docs/readme.txt")?;
//! assert_eq!(ar.get_content_by_index(index, 0)?, b"Hello, world!");
//! ar.close()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```
//!
//! Entries are addressed by logical index: the position of their block after
//! the preamble.  Directory entries and service blocks consume indices too,
//! so the file listing is sparse.  Rename and delete rebuild the archive and
//! renumber every later entry.

use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use chrono::NaiveDateTime;
use serde::Serialize;

use crate::block::{Block, EntryHeader, EntryKind, METHOD_STORE};
use crate::codec::{content_checksum, unpack_dos_datetime};
use crate::error::{ArchiveError, Result};
use crate::index::{EntryIndex, Scanner};
use crate::io_stream::{normalize_name, ArchiveStream, EntryWriter, StreamMode};
use crate::rewrite::{RewriteAction, Rewriting};

// ── ArchiveOptions ────────────────────────────────────────────────────────────

/// How [`Archive::open`] treats the file at the given path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OpenMode {
    /// Create a fresh archive; an existing file is opened for append instead.
    CreateNew,
    /// Truncate an existing file and write a fresh archive; a missing file
    /// is `NotFound`.
    ReplaceExisting,
    /// Open an existing archive for append, or read-only when the file is
    /// not writable.  A missing file is `NotFound`.
    #[default]
    AppendOrRead,
}

/// Configuration for [`Archive::open_with`].
#[derive(Debug, Clone, Default)]
pub struct ArchiveOptions {
    pub mode:  OpenMode,
    /// Timestamp stamped on new entries.  `None` uses the local clock.
    pub mtime: Option<NaiveDateTime>,
}

impl ArchiveOptions {
    pub fn with_mode(mode: OpenMode) -> Self {
        Self { mode, ..Self::default() }
    }
}

// ── EntryInfo ─────────────────────────────────────────────────────────────────

/// Full descriptor of one entry, as returned by [`Archive::entries`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntryInfo {
    pub index:       usize,
    pub name:        String,
    pub kind:        EntryKind,
    pub size:        u64,
    pub packed_size: u64,
    pub crc32:       u32,
    pub modified:    Option<NaiveDateTime>,
    pub host_os:     u8,
    pub attributes:  u32,
    pub stored:      bool,
}

impl EntryInfo {
    fn from_header(index: usize, h: &EntryHeader) -> Self {
        EntryInfo {
            index,
            name:        h.name.clone(),
            kind:        h.kind(),
            size:        h.unpacked_size,
            packed_size: h.packed_size,
            crc32:       h.crc32,
            modified:    unpack_dos_datetime(h.mtime),
            host_os:     h.host_os,
            attributes:  h.attributes,
            stored:      h.method == METHOD_STORE,
        }
    }

    pub fn is_directory(&self) -> bool {
        self.kind == EntryKind::Directory
    }
}

// ── Archive ───────────────────────────────────────────────────────────────────

pub struct Archive {
    path:    PathBuf,
    stream:  ArchiveStream,
    index:   EntryIndex,
    options: ArchiveOptions,
}

impl Archive {
    // ── Constructors ─────────────────────────────────────────────────────────

    pub fn open<P: AsRef<Path>>(path: P, mode: OpenMode) -> Result<Self> {
        Self::open_with(path, ArchiveOptions::with_mode(mode))
    }

    /// Shorthand for `open(path, OpenMode::CreateNew)`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        Self::open(path, OpenMode::CreateNew)
    }

    pub fn open_with<P: AsRef<Path>>(path: P, options: ArchiveOptions) -> Result<Self> {
        let path = path.as_ref().to_owned();
        let exists = path.is_file();

        let fresh = match (options.mode, exists) {
            (OpenMode::CreateNew, false) | (OpenMode::ReplaceExisting, true) => true,
            (OpenMode::CreateNew, true)  | (OpenMode::AppendOrRead, true)    => false,
            (OpenMode::ReplaceExisting, false) | (OpenMode::AppendOrRead, false) => {
                return Err(ArchiveError::NotFound(format!("archive {}", path.display())));
            }
        };

        if fresh {
            let mut stream = ArchiveStream::open(&path, StreamMode::CreateTruncate)?;
            stream.write_preamble()?;
            log::debug!("created archive {}", path.display());
            return Ok(Self { path, stream, index: EntryIndex::new(), options });
        }

        let mut stream = match ArchiveStream::open(&path, StreamMode::Append) {
            Ok(s) => s,
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                log::debug!("{} is not writable, opening read-only", path.display());
                ArchiveStream::open(&path, StreamMode::ReadOnly)?
            }
            Err(e) => return Err(e.into()),
        };
        if !stream.has_marker()? {
            return Err(ArchiveError::Format(format!(
                "{} does not start with the RAR marker", path.display()
            )));
        }
        let index = EntryIndex::rebuild(&mut stream)?;
        log::debug!("opened archive {} ({:?})", path.display(), stream.mode());
        Ok(Self { path, stream, index, options })
    }

    // ── Write ─────────────────────────────────────────────────────────────────

    /// Store the file at `disk_path`.  The archive path defaults to the disk
    /// path with separators normalised.
    pub fn add_file<P: AsRef<Path>>(&mut self, disk_path: P, archive_path: Option<&str>) -> Result<()> {
        let disk_path = disk_path.as_ref();
        if !disk_path.exists() {
            return Err(ArchiveError::NotFound(format!("{}", disk_path.display())));
        }
        if !disk_path.is_file() {
            return Err(ArchiveError::InvalidArgument(format!(
                "{} is not a regular file", disk_path.display()
            )));
        }
        let name = match archive_path {
            Some(name) if !name.is_empty() => name.to_owned(),
            _ => disk_path.to_string_lossy().replace('\\', "/"),
        };
        let content = fs::read(disk_path)?;
        self.add_bytes(&name, &content)
    }

    /// Store `content` under `name`, creating parent directory entries.
    pub fn add_bytes(&mut self, name: &str, content: &[u8]) -> Result<()> {
        self.writer()?.add_bytes(name, content)
    }

    /// Add a directory entry for every prefix of `name`.  `name` must
    /// contain a separator.
    pub fn add_directory(&mut self, name: &str) -> Result<()> {
        self.writer()?.add_directory(name)
    }

    /// Writer for the next append.  The first append after open cuts off a
    /// trailing end-of-archive block so new entries stay reachable.
    fn writer(&mut self) -> Result<EntryWriter<'_>> {
        if let Some(end) = self.index.take_data_end() {
            self.stream.truncate(end)?;
            log::debug!("cut {} at offset {} before appending", self.path.display(), end);
        }
        Ok(EntryWriter::new(&mut self.stream, &mut self.index, self.options.mtime))
    }

    // ── Index ─────────────────────────────────────────────────────────────────

    /// File entries only, keyed by logical index.
    pub fn list_entries(&self) -> BTreeMap<usize, String> {
        self.list_files_only()
    }

    pub fn list_files_only(&self) -> BTreeMap<usize, String> {
        self.index.list_files_only()
    }

    pub fn list_including_directories(&self) -> BTreeMap<usize, String> {
        self.index.list_including_directories()
    }

    /// Full header details of every entry, directories included.
    pub fn entries(&mut self) -> Result<Vec<EntryInfo>> {
        let mut scanner = Scanner::start(&mut self.stream)?;
        let mut collect = || -> Result<Vec<EntryInfo>> {
            let mut out = Vec::new();
            while let Some(scanned) = scanner.next_block()? {
                if let Block::Entry(header) = &scanned.block {
                    out.push(EntryInfo::from_header(scanned.index, header));
                }
            }
            Ok(out)
        };
        let entries = collect();
        scanner.finish()?;
        entries
    }

    pub fn get_name_by_index(&self, index: usize) -> Result<String> {
        self.index
            .file_name(index)
            .map(str::to_owned)
            .ok_or_else(|| ArchiveError::NotFound(format!("no file entry at index {index}")))
    }

    pub fn get_index_by_name(&self, name: &str) -> Result<usize> {
        let name = normalize_name(name)
            .ok_or_else(|| ArchiveError::InvalidArgument("entry name is empty".into()))?;
        self.index
            .file_index(&name)
            .ok_or(ArchiveError::NotFound(name))
    }

    /// Whether a file or directory entry named `name` exists.
    pub fn contains(&self, name: &str) -> bool {
        normalize_name(name).map_or(false, |n| self.index.contains(&n))
    }

    /// Number of file entries.
    pub fn len(&self) -> usize {
        self.index.file_count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    // ── Read ──────────────────────────────────────────────────────────────────

    /// Content of the file at `index`.  `length == 0` reads the whole entry
    /// and verifies its CRC; a positive length returns at most that many
    /// leading bytes unverified.
    pub fn get_content_by_index(&mut self, index: usize, length: usize) -> Result<Vec<u8>> {
        self.get_name_by_index(index)?;
        self.read_entry(|i, _| i == index, length)
    }

    pub fn get_content_by_name(&mut self, name: &str, length: usize) -> Result<Vec<u8>> {
        let index = self.get_index_by_name(name)?;
        self.read_entry(|i, _| i == index, length)
    }

    fn read_entry<F>(&mut self, wanted: F, length: usize) -> Result<Vec<u8>>
    where
        F: Fn(usize, &EntryHeader) -> bool,
    {
        let limit = if length == 0 { None } else { Some(length as u64) };
        let mut scanner = Scanner::start(&mut self.stream)?;
        let found = find_content(&mut scanner, wanted, limit);
        scanner.finish()?;

        let (data, crc, name) = found?;
        if limit.is_none() && content_checksum(&data) != crc {
            return Err(ArchiveError::Format(format!("checksum mismatch in '{name}'")));
        }
        Ok(data)
    }

    /// Extract into `dest`, creating it if necessary.  With `names`, only
    /// the listed entries are extracted.  Returns the number of files written.
    ///
    /// Entries whose path is absolute or climbs out of `dest` are skipped.
    pub fn extract_to<P: AsRef<Path>>(&mut self, dest: P, names: Option<&[&str]>) -> Result<usize> {
        let dest = dest.as_ref();
        fs::create_dir_all(dest)?;
        let wanted: Option<HashSet<String>> =
            names.map(|ns| ns.iter().filter_map(|n| normalize_name(n)).collect());

        let mut scanner = Scanner::start(&mut self.stream)?;
        let extracted = extract_blocks(&mut scanner, dest, wanted.as_ref());
        scanner.finish()?;
        let written = extracted?;
        log::debug!("extracted {} files from {} into {}", written, self.path.display(), dest.display());
        Ok(written)
    }

    pub fn extract_all<P: AsRef<Path>>(&mut self, dest: P) -> Result<usize> {
        self.extract_to(dest, None)
    }

    // ── Rewrite ───────────────────────────────────────────────────────────────

    pub fn rename_by_index(&mut self, index: usize, new_name: &str) -> Result<()> {
        let old = self.get_name_by_index(index)?;
        let new = normalize_name(new_name)
            .ok_or_else(|| ArchiveError::InvalidArgument("new name is empty".into()))?;
        if new == old {
            return Ok(());
        }
        if self.index.contains(&new) {
            return Err(ArchiveError::AlreadyExists(new));
        }
        self.rewrite(index, RewriteAction::Rename(new))
    }

    pub fn rename_by_name(&mut self, old_name: &str, new_name: &str) -> Result<()> {
        let index = self.get_index_by_name(old_name)?;
        self.rename_by_index(index, new_name)
    }

    pub fn delete_by_index(&mut self, index: usize) -> Result<()> {
        self.get_name_by_index(index)?;
        self.rewrite(index, RewriteAction::Delete)
    }

    pub fn delete_by_name(&mut self, name: &str) -> Result<()> {
        let index = self.get_index_by_name(name)?;
        self.delete_by_index(index)
    }

    fn rewrite(&mut self, target: usize, action: RewriteAction) -> Result<()> {
        let (stream, index) = Rewriting::begin(&mut self.stream, &self.index, self.options.mtime)?
            .run(target, &action)?
            .swap(&self.path)?
            .reopen()?;
        self.stream = stream;
        self.index = index;
        Ok(())
    }

    // ── Metadata ─────────────────────────────────────────────────────────────

    pub fn path(&self) -> &Path { &self.path }

    pub fn is_read_only(&self) -> bool {
        self.stream.mode() == StreamMode::ReadOnly
    }

    /// Current cursor of the underlying file.  After any scan this is one
    /// byte before the physical end.
    pub fn stream_position(&mut self) -> Result<u64> {
        Ok(self.stream.position()?)
    }

    pub fn flush(&mut self) -> Result<()> {
        Ok(self.stream.sync()?)
    }

    /// Flush and release the archive.
    pub fn close(mut self) -> Result<()> {
        self.flush()
    }
}

/// Content, CRC and name of the first stored file entry `wanted` accepts.
fn find_content<F>(scanner: &mut Scanner<'_>, wanted: F, limit: Option<u64>) -> Result<(Vec<u8>, u32, String)>
where
    F: Fn(usize, &EntryHeader) -> bool,
{
    while let Some(scanned) = scanner.next_block()? {
        let Block::Entry(header) = &scanned.block else { continue };
        if header.is_directory() || !wanted(scanned.index, header) {
            continue;
        }
        if header.method != METHOD_STORE {
            return Err(ArchiveError::Format(format!(
                "'{}' uses compression method {:#04x}", header.name, header.method
            )));
        }
        let data = scanner.read_content(limit)?;
        return Ok((data, header.crc32, header.name.clone()));
    }
    Err(ArchiveError::NotFound("entry vanished from the archive".into()))
}

fn extract_blocks(scanner: &mut Scanner<'_>, dest: &Path, wanted: Option<&HashSet<String>>) -> Result<usize> {
    let mut written = 0;
    while let Some(scanned) = scanner.next_block()? {
        let Block::Entry(header) = &scanned.block else { continue };
        if let Some(w) = wanted {
            if !w.contains(&header.name) { continue; }
        }
        let Some(rel) = safe_relative_path(&header.name) else {
            log::warn!("skipping unsafe entry path '{}'", header.name);
            continue;
        };
        let target = dest.join(rel);
        if header.is_directory() {
            fs::create_dir_all(&target)?;
            continue;
        }
        if header.method != METHOD_STORE {
            log::warn!("skipping compressed entry '{}'", header.name);
            continue;
        }
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = scanner.read_content(None)?;
        if content_checksum(&data) != header.crc32 {
            log::warn!("checksum mismatch in '{}'", header.name);
        }
        fs::write(&target, &data)?;
        written += 1;
    }
    Ok(written)
}

/// Relative extraction path for `name`, or `None` when it is absolute or
/// contains `..`.
fn safe_relative_path(name: &str) -> Option<PathBuf> {
    if name.starts_with('/') || name.contains(':') {
        return None;
    }
    let mut out = PathBuf::new();
    for part in name.split('/') {
        match part {
            "" | "." => continue,
            ".."     => return None,
            p        => out.push(p),
        }
    }
    if out.as_os_str().is_empty() { None } else { Some(out) }
}
