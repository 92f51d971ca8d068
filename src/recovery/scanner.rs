//! Block-health scanner: walk an archive without trusting its structure.
//!
//! # How it works
//!
//! The scanner checks the Marker signature, then reads forward block by
//! block.  Unlike the engine's scan it verifies every header checksum and
//! every stored file's CRC-32, and it does not stop at the first bad block:
//! after a header that fails its checksum it advances one byte at a time
//! until a header verifies again.  A run of unreadable bytes is reported as
//! a single `HeaderCorrupt` record.
//!
//! ## Block health
//!
//! - `Healthy`: header checksum valid, trailing bytes present, content CRC
//!   matches (stored files only)
//! - `HeaderCorrupt`: header checksum mismatch or undecodable header
//! - `ContentCorrupt`: header valid, stored content fails its CRC-32
//! - `Truncated`: the file ends inside the header or its trailing bytes
//!
//! ## Quality
//!
//! | Quality | Meaning |
//! |---------|---------|
//! | `Full` | Marker, ArchiveHeader and every block healthy |
//! | `Partial` | At least half of the blocks healthy |
//! | `Catastrophic` | Fewer than half healthy, or nothing readable |

use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;

use crate::block::{
    Block, BlockPrefix, EntryHeader, RawBlock, ARCHIVE_HEADER_TYPE, END_OF_ARCHIVE_TYPE,
    MARKER_SIGNATURE, METHOD_STORE, PREFIX_SIZE,
};
use crate::codec::content_checksum;

// ── Types ─────────────────────────────────────────────────────────────────────

/// The health verdict for one scanned block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockHealth {
    Healthy,
    /// Header checksum failed or the header does not decode.  `skipped` is
    /// the number of bytes stepped over before the next readable header.
    HeaderCorrupt { skipped: u64 },
    /// Stored content does not match the header's CRC-32.
    ContentCorrupt { expected: u32, actual: u32 },
    /// Fewer bytes follow than the block declares.
    Truncated { declared: u64, available: u64 },
}

impl BlockHealth {
    pub fn is_usable(&self) -> bool {
        matches!(self, BlockHealth::Healthy)
    }
}

/// Diagnostic record for one scanned block position.
#[derive(Debug, Clone)]
pub struct ScannedBlock {
    /// Absolute byte offset of the block header.
    pub offset:         u64,
    /// Type byte as read; meaningless for `HeaderCorrupt` records.
    pub block_type:     u8,
    /// Decoded entry header, for verified Entry blocks.
    pub entry:          Option<EntryHeader>,
    /// Absolute offset of the bytes trailing the header.
    pub content_offset: u64,
    pub health:         BlockHealth,
}

impl ScannedBlock {
    pub fn is_usable(&self) -> bool {
        self.health.is_usable()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryQuality {
    Full,
    Partial,
    Catastrophic,
}

/// Complete report produced by [`scan`].
#[derive(Debug)]
pub struct RecoveryReport {
    /// The file starts with the Marker signature.
    pub marker_ok:        bool,
    /// An intact ArchiveHeader follows the Marker.
    pub header_ok:        bool,
    pub total_scanned:    usize,
    pub healthy_blocks:   usize,
    pub corrupt_blocks:   usize,
    pub content_corrupt:  usize,
    pub truncated_blocks: usize,
    pub bytes_scanned:    u64,
    /// Per-block diagnostic records, in file order.
    pub block_log:        Vec<ScannedBlock>,
    /// Sum of unpacked sizes of healthy file entries.
    pub recoverable_bytes: u64,
    pub quality:          RecoveryQuality,
}

impl RecoveryReport {
    /// Percentage of blocks that are healthy (0.0–100.0).
    pub fn health_pct(&self) -> f64 {
        if self.total_scanned == 0 { return 100.0; }
        self.healthy_blocks as f64 / self.total_scanned as f64 * 100.0
    }

    pub fn is_intact(&self) -> bool {
        self.quality == RecoveryQuality::Full
    }

    /// Healthy file and directory entries, in file order.
    pub fn healthy_entries(&self) -> impl Iterator<Item = (&ScannedBlock, &EntryHeader)> {
        self.block_log
            .iter()
            .filter(|b| b.is_usable())
            .filter_map(|b| b.entry.as_ref().map(|e| (b, e)))
    }

    /// Summary line for display.
    pub fn summary(&self) -> String {
        format!(
            "{:?} recovery: {}/{} blocks healthy ({:.1}%), {} header-corrupt, \
             {} content-corrupt, {} truncated, {:.2} KiB recoverable",
            self.quality,
            self.healthy_blocks,
            self.total_scanned,
            self.health_pct(),
            self.corrupt_blocks,
            self.content_corrupt,
            self.truncated_blocks,
            self.recoverable_bytes as f64 / 1024.0,
        )
    }
}

// ── Scanner ───────────────────────────────────────────────────────────────────

/// Scan `reader` for readable blocks.
///
/// # Arguments
/// * `reader`: seekable stream positioned anywhere; will be rewound.
/// * `progress`: optional callback called after each block with
///   `(bytes_scanned, total_bytes)`.
///
/// Corrupt data never produces `Err`; it is encoded as [`BlockHealth`]
/// records.  Only genuine I/O errors propagate.
pub fn scan<R, F>(reader: &mut R, mut progress: Option<&mut F>) -> io::Result<RecoveryReport>
where
    R: Read + Seek,
    F: FnMut(u64, u64),
{
    let end = reader.seek(SeekFrom::End(0))?;
    reader.seek(SeekFrom::Start(0))?;

    let mut head = [0u8; PREFIX_SIZE];
    let marker_ok = end >= PREFIX_SIZE as u64
        && reader.read_exact(&mut head).is_ok()
        && head == MARKER_SIGNATURE;
    if !marker_ok {
        log::warn!("marker signature missing, scanning from offset 0");
    }

    let mut pos: u64 = if marker_ok { PREFIX_SIZE as u64 } else { 0 };
    let mut header_ok = false;
    let mut first_block = true;
    let mut block_log: Vec<ScannedBlock> = Vec::new();
    let mut corrupt_run: Option<usize> = None;

    while pos < end {
        match read_block(reader, pos, end)? {
            Probe::EndOfArchive => break,
            Probe::Short { declared, available } if corrupt_run.is_none() => {
                log::warn!("truncated block header at offset {}", pos);
                block_log.push(ScannedBlock {
                    offset:         pos,
                    block_type:     0,
                    entry:          None,
                    content_offset: end,
                    health:         BlockHealth::Truncated { declared, available },
                });
                break;
            }
            Probe::Short { .. } | Probe::Unreadable => {
                match corrupt_run {
                    Some(i) => {
                        if let BlockHealth::HeaderCorrupt { skipped } = &mut block_log[i].health {
                            *skipped += 1;
                        }
                    }
                    None => {
                        log::warn!("corrupt block header at offset {}", pos);
                        corrupt_run = Some(block_log.len());
                        block_log.push(ScannedBlock {
                            offset:         pos,
                            block_type:     0,
                            entry:          None,
                            content_offset: pos,
                            health:         BlockHealth::HeaderCorrupt { skipped: 1 },
                        });
                    }
                }
                first_block = false;
                pos += 1;
            }
            Probe::Valid { raw, block } => {
                corrupt_run = None;
                if first_block && raw.block_type() == ARCHIVE_HEADER_TYPE {
                    header_ok = true;
                }
                first_block = false;

                let content_offset = pos + raw.bytes.len() as u64;
                let declared = block.trailing_size();
                let available = end - content_offset;
                let entry = match &block {
                    Block::Entry(h) => Some(h.clone()),
                    _ => None,
                };

                let health = if available < declared {
                    BlockHealth::Truncated { declared, available }
                } else {
                    match &entry {
                        Some(h) if !h.is_directory() && h.method == METHOD_STORE => {
                            reader.seek(SeekFrom::Start(content_offset))?;
                            let mut data = Vec::new();
                            reader.by_ref().take(declared).read_to_end(&mut data)?;
                            let actual = content_checksum(&data);
                            if actual == h.crc32 {
                                BlockHealth::Healthy
                            } else {
                                BlockHealth::ContentCorrupt { expected: h.crc32, actual }
                            }
                        }
                        _ => BlockHealth::Healthy,
                    }
                };
                if let BlockHealth::ContentCorrupt { .. } = health {
                    log::warn!("content checksum mismatch in block at offset {}", pos);
                }
                let truncated = matches!(health, BlockHealth::Truncated { .. });

                block_log.push(ScannedBlock {
                    offset: pos,
                    block_type: raw.block_type(),
                    entry,
                    content_offset,
                    health,
                });
                if truncated {
                    log::warn!("block at offset {} runs past the end of the file", pos);
                    break;
                }
                pos = content_offset + declared;
            }
        }

        if let Some(ref mut cb) = progress {
            cb(pos.min(end), end);
        }
    }

    Ok(build_report(marker_ok, header_ok, end, block_log))
}

/// Convenience: scan the file at `path`.
pub fn scan_file(path: &Path) -> io::Result<RecoveryReport> {
    let mut f = std::fs::File::open(path)?;
    scan::<_, fn(u64, u64)>(&mut f, None)
}

enum Probe {
    Valid { raw: RawBlock, block: Block },
    /// Fewer bytes left than the header needs.
    Short { declared: u64, available: u64 },
    /// Checksum mismatch, impossible size or undecodable fields.
    Unreadable,
    EndOfArchive,
}

fn read_block<R: Read + Seek>(reader: &mut R, pos: u64, end: u64) -> io::Result<Probe> {
    let available = end - pos;
    if available < PREFIX_SIZE as u64 {
        return Ok(Probe::Short { declared: PREFIX_SIZE as u64, available });
    }
    reader.seek(SeekFrom::Start(pos))?;
    let mut head = [0u8; PREFIX_SIZE];
    reader.read_exact(&mut head)?;
    let prefix = BlockPrefix::parse(&head);
    if prefix.is_terminal() {
        return Ok(if prefix.block_type == END_OF_ARCHIVE_TYPE {
            Probe::EndOfArchive
        } else {
            Probe::Unreadable
        });
    }
    if (prefix.size as u64) > available {
        return Ok(Probe::Short { declared: prefix.size as u64, available });
    }
    let mut bytes = vec![0u8; prefix.size as usize];
    bytes[..PREFIX_SIZE].copy_from_slice(&head);
    reader.read_exact(&mut bytes[PREFIX_SIZE..])?;
    let raw = RawBlock { prefix, bytes };
    if !raw.checksum_ok() {
        return Ok(Probe::Unreadable);
    }
    match raw.classify() {
        Ok(block) => Ok(Probe::Valid { raw, block }),
        Err(_)    => Ok(Probe::Unreadable),
    }
}

fn build_report(marker_ok: bool, header_ok: bool, end: u64, block_log: Vec<ScannedBlock>) -> RecoveryReport {
    let total_scanned = block_log.len();
    let mut healthy_blocks = 0;
    let mut corrupt_blocks = 0;
    let mut content_corrupt = 0;
    let mut truncated_blocks = 0;
    let mut recoverable_bytes = 0;
    for b in &block_log {
        match &b.health {
            BlockHealth::Healthy => {
                healthy_blocks += 1;
                if let Some(e) = b.entry.as_ref().filter(|e| !e.is_directory()) {
                    recoverable_bytes += e.unpacked_size;
                }
            }
            BlockHealth::HeaderCorrupt { .. }  => corrupt_blocks += 1,
            BlockHealth::ContentCorrupt { .. } => content_corrupt += 1,
            BlockHealth::Truncated { .. }      => truncated_blocks += 1,
        }
    }

    let quality = if marker_ok && header_ok && healthy_blocks == total_scanned {
        RecoveryQuality::Full
    } else if total_scanned > 0 && healthy_blocks * 2 >= total_scanned {
        RecoveryQuality::Partial
    } else {
        RecoveryQuality::Catastrophic
    };

    RecoveryReport {
        marker_ok,
        header_ok,
        total_scanned,
        healthy_blocks,
        corrupt_blocks,
        content_corrupt,
        truncated_blocks,
        bytes_scanned: end,
        block_log,
        recoverable_bytes,
        quality,
    }
}
