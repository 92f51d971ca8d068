//! Entry index: logical index → entry path, plus the set of known names.
//!
//! Indices are block positions after the preamble, so directories and
//! skipped service blocks consume an index even though only files are
//! addressable.  The index is rebuilt by a full scan on open and after every
//! rewrite; appends extend it in place.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;

use crate::block::{Block, EntryKind};
use crate::error::Result;
use crate::io_stream::ArchiveStream;

pub mod scanner;

pub use scanner::{skip_preamble, ScannedBlock, Scanner};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexedEntry {
    pub index: usize,
    pub name:  String,
    pub kind:  EntryKind,
}

#[derive(Debug, Clone, Default)]
pub struct EntryIndex {
    entries:    BTreeMap<usize, IndexedEntry>,
    seen:       HashSet<String>,
    next_index: usize,
    /// Where the last scan stopped, if trailing bytes (an end-of-archive
    /// block or a block cut short) follow it.
    data_end:   Option<u64>,
}

impl EntryIndex {
    /// Index of a freshly created archive.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scan `stream` from the preamble and index every Entry block.
    /// Leaves the cursor parked one byte before the end.
    pub fn rebuild(stream: &mut ArchiveStream) -> Result<Self> {
        let mut index = Self::new();
        let mut scanner = Scanner::start(stream)?;
        while let Some(scanned) = scanner.next_block()? {
            if let Block::Entry(header) = &scanned.block {
                let kind = header.kind();
                index.seen.insert(header.name.clone());
                index.entries.insert(scanned.index, IndexedEntry {
                    index: scanned.index,
                    name:  header.name.clone(),
                    kind,
                });
            }
        }
        index.next_index = scanner.blocks_seen();
        let end = scanner.end_offset();
        scanner.finish()?;
        let len = stream.len()?;
        index.data_end = end.filter(|&e| e < len);
        log::debug!("indexed {} ({} blocks, {} files)",
            stream.path().display(), index.next_index, index.file_count());
        Ok(index)
    }

    /// Record a block appended at the next index.  Returns that index.
    pub fn push(&mut self, name: String, kind: EntryKind) -> usize {
        let index = self.next_index;
        self.next_index += 1;
        self.seen.insert(name.clone());
        self.entries.insert(index, IndexedEntry { index, name, kind });
        index
    }

    /// Whether any entry, file or directory, already carries `name`.
    pub fn contains(&self, name: &str) -> bool {
        self.seen.contains(name)
    }

    pub fn get(&self, index: usize) -> Option<&IndexedEntry> {
        self.entries.get(&index)
    }

    pub fn file_name(&self, index: usize) -> Option<&str> {
        self.entries
            .get(&index)
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| e.name.as_str())
    }

    /// First file index carrying `name`.
    pub fn file_index(&self, name: &str) -> Option<usize> {
        self.entries
            .values()
            .find(|e| e.kind == EntryKind::File && e.name == name)
            .map(|e| e.index)
    }

    pub fn list_files_only(&self) -> BTreeMap<usize, String> {
        self.entries
            .values()
            .filter(|e| e.kind == EntryKind::File)
            .map(|e| (e.index, e.name.clone()))
            .collect()
    }

    pub fn list_including_directories(&self) -> BTreeMap<usize, String> {
        self.entries.values().map(|e| (e.index, e.name.clone())).collect()
    }

    pub fn entries(&self) -> impl Iterator<Item = &IndexedEntry> {
        self.entries.values()
    }

    pub fn file_count(&self) -> usize {
        self.entries.values().filter(|e| e.kind == EntryKind::File).count()
    }

    pub fn next_index(&self) -> usize {
        self.next_index
    }

    /// Offset of a trailing terminal or cut-short block that appends must
    /// cut off.
    pub fn take_data_end(&mut self) -> Option<u64> {
        self.data_end.take()
    }
}
