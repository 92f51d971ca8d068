//! Damage detection and in-process repair.
//!
//! [`scan`] grades every block of an archive; [`repair`] copies the healthy
//! entries of a damaged archive into a fresh one.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::block::METHOD_STORE;
use crate::error::{ArchiveError, Result};
use crate::index::EntryIndex;
use crate::io_stream::{ArchiveStream, EntryWriter, StreamMode};

pub mod scanner;

pub use scanner::{scan, scan_file, BlockHealth, RecoveryQuality, RecoveryReport, ScannedBlock};

/// Outcome of [`repair`].
#[derive(Debug)]
pub struct Repaired {
    /// Scan of the source archive.
    pub report:          RecoveryReport,
    /// File entries written to the destination.
    pub recovered_files: usize,
    /// Healthy entries left out (compressed or duplicate names).
    pub skipped:         usize,
}

/// Write every healthy entry of `src` into a fresh archive at `dst`.
///
/// Entries keep their names and timestamps; parent directories are
/// re-synthesised.  `dst` is created or truncated.
pub fn repair(src: &Path, dst: &Path) -> Result<Repaired> {
    if src == dst {
        return Err(ArchiveError::InvalidArgument(
            "repair needs a destination distinct from the source".into(),
        ));
    }
    let mut input = File::open(src)?;
    let report = scan::<_, fn(u64, u64)>(&mut input, None)?;

    let mut out = ArchiveStream::open(dst, StreamMode::CreateTruncate)?;
    out.write_preamble()?;
    let mut index = EntryIndex::new();
    let mut recovered_files = 0;
    let mut skipped = 0;
    {
        let mut writer = EntryWriter::new(&mut out, &mut index, None);
        for (block, entry) in report.healthy_entries() {
            if entry.is_directory() {
                writer.add_directory_entry(&entry.name, entry.mtime)?;
                continue;
            }
            if entry.method != METHOD_STORE {
                log::warn!("'{}' is compressed, not recovered", entry.name);
                skipped += 1;
                continue;
            }
            input.seek(SeekFrom::Start(block.content_offset))?;
            let mut content = Vec::new();
            (&mut input).take(entry.packed_size).read_to_end(&mut content)?;
            if content.len() as u64 != entry.packed_size {
                log::warn!("'{}' lost content bytes since the scan, not recovered", entry.name);
                skipped += 1;
                continue;
            }
            match writer.append_file(&entry.name, &content, entry.mtime) {
                Ok(()) => recovered_files += 1,
                Err(ArchiveError::AlreadyExists(name)) => {
                    log::warn!("duplicate entry '{}' dropped", name);
                    skipped += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
    out.sync()?;
    log::debug!("repaired {} into {} ({} files)", src.display(), dst.display(), recovered_files);

    Ok(Repaired { report, recovered_files, skipped })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{Archive, OpenMode};
    use tempfile::tempdir;

    #[test]
    fn repair_keeps_healthy_entries_only() {
        let dir = tempdir().unwrap();
        let src = dir.path().join("broken.rar");
        let dst = dir.path().join("fixed.rar");

        let mut ar = Archive::create(&src).unwrap();
        ar.add_bytes("keep/one.txt", b"one").unwrap();
        ar.add_bytes("lost.txt", b"lost").unwrap();
        ar.add_bytes("two.txt", b"two").unwrap();
        let lost_at = ar.entries().unwrap()[1].index;
        assert_eq!(lost_at, 1);
        ar.close().unwrap();

        // Corrupt the content of "lost.txt": its bytes are the only "lost" run.
        let mut bytes = std::fs::read(&src).unwrap();
        let at = bytes.windows(4).rposition(|w| w == b"lost").unwrap();
        bytes[at] = b'L';
        std::fs::write(&src, &bytes).unwrap();

        let repaired = repair(&src, &dst).unwrap();
        assert_eq!(repaired.recovered_files, 2);
        assert_eq!(repaired.report.content_corrupt, 1);

        let mut fixed = Archive::open(&dst, OpenMode::AppendOrRead).unwrap();
        let names: Vec<String> = fixed.list_entries().into_values().collect();
        assert_eq!(names, ["keep/one.txt", "two.txt"]);
        assert_eq!(fixed.get_content_by_name("two.txt", 0).unwrap(), b"two");
    }

    #[test]
    fn repair_refuses_in_place() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("a.rar");
        Archive::create(&path).unwrap().close().unwrap();
        assert!(matches!(repair(&path, &path), Err(ArchiveError::InvalidArgument(_))));
    }
}
