use rarchive::archive::{Archive, ArchiveOptions, OpenMode};
use rarchive::codec::header_checksum;
use rarchive::error::ArchiveError;
use rarchive::recovery;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const END_OF_ARCHIVE: [u8; 7] = [0xC4, 0x3D, 0x7B, 0x00, 0x40, 0x07, 0x00];

fn names(ar: &Archive) -> Vec<(usize, String)> {
    ar.list_entries().into_iter().collect()
}

/// A 0x7A service block carrying `data` as ADD_SIZE bytes.
fn sub_block(data: &[u8]) -> Vec<u8> {
    let mut body = vec![0x7A, 0x00, 0x80, 11, 0];
    body.extend_from_slice(&(data.len() as u32).to_le_bytes());
    let mut out = header_checksum(&body).to_vec();
    out.extend(body);
    out.extend_from_slice(data);
    out
}

/// A stored entry header with LHD_LARGE set and the given size words.
/// No content follows it.
fn large_entry(name: &str, high: u32, low: u32) -> Vec<u8> {
    let size = (32 + 8 + name.len()) as u16;
    let mut body = vec![0x74, 0x00, 0x81];
    body.extend_from_slice(&size.to_le_bytes());
    body.extend_from_slice(&low.to_le_bytes());
    body.extend_from_slice(&low.to_le_bytes());
    body.push(0);
    body.extend_from_slice(&0u32.to_le_bytes());
    body.extend_from_slice(&0u32.to_le_bytes());
    body.extend_from_slice(&[20, 0x30]);
    body.extend_from_slice(&(name.len() as u16).to_le_bytes());
    body.extend_from_slice(&0x20u32.to_le_bytes());
    body.extend_from_slice(&high.to_le_bytes());
    body.extend_from_slice(&high.to_le_bytes());
    body.extend_from_slice(name.as_bytes());
    let mut out = header_checksum(&body).to_vec();
    out.extend(body);
    out
}

#[test]
fn test_concrete_scenario() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("t.rar");

    let mut ar = Archive::open(&path, OpenMode::CreateNew).unwrap();
    ar.add_bytes("docs/readme.txt", b"hello").unwrap();
    assert_eq!(names(&ar), [(0, "docs/readme.txt".to_owned())]);
    assert_eq!(ar.get_content_by_index(0, 0).unwrap(), b"hello");

    ar.delete_by_index(0).unwrap();
    assert!(ar.list_entries().is_empty());
    assert!(ar.list_including_directories().is_empty());
    ar.close().unwrap();

    // Marker + ArchiveHeader only.
    assert_eq!(fs::read(&path).unwrap().len(), 20);
}

#[test]
fn test_fresh_archive_bytes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.rar");
    Archive::create(&path).unwrap().close().unwrap();
    assert_eq!(
        fs::read(&path).unwrap(),
        [
            0x52, 0x61, 0x72, 0x21, 0x1A, 0x07, 0x00,
            0xCF, 0x90, 0x73, 0x00, 0x00, 0x0D, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        ]
    );
}

#[test]
fn test_roundtrip_after_reopen() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("r.rar");
    let files: Vec<(&str, &[u8])> = vec![
        ("alpha.txt",          b"Alpha file contents"),
        ("nested/beta.bin",    b"Beta file contents with different data"),
        ("x/y/z/gamma.txt",    b"Gamma"),
    ];

    let mut ar = Archive::create(&path).unwrap();
    for (name, data) in &files {
        ar.add_bytes(name, data).unwrap();
    }
    ar.close().unwrap();

    let mut ar = Archive::open(&path, OpenMode::AppendOrRead).unwrap();
    let listed: Vec<String> = ar.list_entries().into_values().collect();
    assert_eq!(listed, ["alpha.txt", "nested/beta.bin", "x/y/z/gamma.txt"]);
    for (name, data) in &files {
        assert_eq!(&ar.get_content_by_name(name, 0).unwrap(), data);
    }
    assert_eq!(ar.len(), 3);
    assert!(ar.contains("x/y"));
    assert!(!ar.contains("nested"));
}

#[test]
fn test_directory_synthesis_is_idempotent() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("d.rar");

    let mut ar = Archive::create(&path).unwrap();
    ar.add_bytes("a/b/c.txt", b"c").unwrap();
    ar.add_bytes("a/b/d.txt", b"d").unwrap();
    ar.close().unwrap();

    let ar = Archive::open(&path, OpenMode::AppendOrRead).unwrap();
    let all: Vec<String> = ar.list_including_directories().into_values().collect();
    assert_eq!(all, ["a", "a/b", "a/b/c.txt", "a/b/d.txt"]);
    // Files sit at sparse indices behind their directories.
    assert_eq!(names(&ar), [(2, "a/b/c.txt".to_owned()), (3, "a/b/d.txt".to_owned())]);
    assert!(ar.get_name_by_index(0).unwrap_err().is_not_found());
}

#[test]
fn test_delete_renumbers_later_entries() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("del.rar");

    let mut ar = Archive::create(&path).unwrap();
    for name in ["one.txt", "two.txt", "three.txt", "four.txt"] {
        ar.add_bytes(name, name.as_bytes()).unwrap();
    }
    ar.delete_by_index(2).unwrap();

    assert_eq!(ar.get_name_by_index(0).unwrap(), "one.txt");
    assert_eq!(ar.get_name_by_index(1).unwrap(), "two.txt");
    // Renumbered: the entry after the deleted one moves down.
    assert_eq!(ar.get_name_by_index(2).unwrap(), "four.txt");
    assert!(ar.get_name_by_index(3).unwrap_err().is_not_found());
    assert!(ar.get_content_by_name("three.txt", 0).unwrap_err().is_not_found());
    assert_eq!(ar.get_content_by_index(2, 0).unwrap(), b"four.txt");

    ar.delete_by_name("one.txt").unwrap();
    assert_eq!(names(&ar), [(0, "two.txt".to_owned()), (1, "four.txt".to_owned())]);
}

#[test]
fn test_rename_preserves_content() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("ren.rar");

    let mut ar = Archive::create(&path).unwrap();
    ar.add_bytes("old.txt", b"payload").unwrap();
    ar.add_bytes("other.txt", b"other").unwrap();
    ar.rename_by_name("old.txt", "new/dir/new.txt").unwrap();
    ar.close().unwrap();

    let mut ar = Archive::open(&path, OpenMode::AppendOrRead).unwrap();
    assert_eq!(ar.get_content_by_name("new/dir/new.txt", 0).unwrap(), b"payload");
    assert!(ar.get_content_by_name("old.txt", 0).unwrap_err().is_not_found());
    assert_eq!(ar.get_content_by_name("other.txt", 0).unwrap(), b"other");
    let all: Vec<String> = ar.list_including_directories().into_values().collect();
    // The renamed entry is re-added where the old one stood.
    assert_eq!(all, ["new", "new/dir", "new/dir/new.txt", "other.txt"]);
}

#[test]
fn test_rewrite_failure_leaves_archive_unchanged() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("safe.rar");

    let mut ar = Archive::create(&path).unwrap();
    ar.add_bytes("a.txt", b"a").unwrap();
    ar.add_bytes("b.txt", b"b").unwrap();
    ar.close().unwrap();
    let before = fs::read(&path).unwrap();

    let mut ar = Archive::open(&path, OpenMode::AppendOrRead).unwrap();
    assert!(matches!(ar.rename_by_name("a.txt", "b.txt"), Err(ArchiveError::AlreadyExists(_))));
    assert!(ar.delete_by_index(9).unwrap_err().is_not_found());
    assert!(matches!(ar.rename_by_index(0, "//"), Err(ArchiveError::InvalidArgument(_))));
    drop(ar);

    assert_eq!(fs::read(&path).unwrap(), before);
    assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
}

#[test]
fn test_open_rejects_non_archive_without_touching_it() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("notes.txt");
    fs::write(&path, b"plain text, not an archive").unwrap();

    for mode in [OpenMode::AppendOrRead, OpenMode::CreateNew] {
        let err = Archive::open(&path, mode).err().unwrap();
        assert!(err.is_format(), "{mode:?}: {err}");
    }
    assert_eq!(fs::read(&path).unwrap(), b"plain text, not an archive");

    let short = dir.path().join("short.rar");
    fs::write(&short, b"Rar").unwrap();
    assert!(Archive::open(&short, OpenMode::AppendOrRead).err().unwrap().is_format());
}

#[test]
fn test_open_modes() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("m.rar");

    assert!(Archive::open(&path, OpenMode::AppendOrRead).err().unwrap().is_not_found());
    assert!(Archive::open(&path, OpenMode::ReplaceExisting).err().unwrap().is_not_found());
    assert!(!path.exists());

    let mut ar = Archive::open(&path, OpenMode::CreateNew).unwrap();
    ar.add_bytes("keep.txt", b"keep").unwrap();
    ar.close().unwrap();

    // CreateNew on an existing archive appends.
    let mut ar = Archive::open(&path, OpenMode::CreateNew).unwrap();
    ar.add_bytes("more.txt", b"more").unwrap();
    assert_eq!(ar.len(), 2);
    ar.close().unwrap();

    let ar = Archive::open(&path, OpenMode::ReplaceExisting).unwrap();
    assert!(ar.is_empty());
    assert_eq!(fs::read(&path).unwrap().len(), 20);
}

#[test]
fn test_add_validation() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("v.rar");
    let mut ar = Archive::create(&path).unwrap();

    assert!(matches!(ar.add_bytes("", b"x"), Err(ArchiveError::InvalidArgument(_))));
    assert!(matches!(ar.add_bytes("empty.txt", b""), Err(ArchiveError::InvalidArgument(_))));
    ar.add_bytes("dup.txt", b"1").unwrap();
    assert!(matches!(ar.add_bytes("\\dup.txt", b"2"), Err(ArchiveError::AlreadyExists(_))));
    assert!(ar.add_file(dir.path().join("missing.bin"), None).unwrap_err().is_not_found());
    assert!(matches!(ar.add_directory("toplevel"), Err(ArchiveError::InvalidArgument(_))));
    assert_eq!(ar.len(), 1);
}

#[test]
fn test_add_file_from_disk() {
    let dir = tempdir().unwrap();
    let src = dir.path().join("input.dat");
    fs::write(&src, b"disk bytes").unwrap();
    let path = dir.path().join("f.rar");

    let mut ar = Archive::create(&path).unwrap();
    ar.add_file(&src, Some("stored\\as\\input.dat")).unwrap();
    assert_eq!(ar.get_index_by_name("stored/as/input.dat").unwrap(), 2);
    assert_eq!(ar.get_content_by_name("stored/as/input.dat", 0).unwrap(), b"disk bytes");
}

#[test]
fn test_cursor_parks_before_end_after_scan() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("c.rar");
    let mut ar = Archive::create(&path).unwrap();
    ar.add_bytes("x.txt", b"xyz").unwrap();
    ar.close().unwrap();

    let len = fs::metadata(&path).unwrap().len();
    let mut ar = Archive::open(&path, OpenMode::AppendOrRead).unwrap();
    assert_eq!(ar.stream_position().unwrap(), len - 1);
    ar.get_content_by_index(0, 1).unwrap();
    assert_eq!(ar.stream_position().unwrap(), len - 1);
}

#[test]
fn test_extract_writes_files_and_skips_unsafe_paths() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("x.rar");
    let out = dir.path().join("out");

    let mut ar = Archive::create(&path).unwrap();
    ar.add_bytes("top.txt", b"top").unwrap();
    ar.add_bytes("sub/deep/file.txt", b"deep").unwrap();
    ar.add_bytes("../escape.txt", b"nope").unwrap();

    assert_eq!(ar.extract_all(&out).unwrap(), 2);
    assert_eq!(fs::read(out.join("top.txt")).unwrap(), b"top");
    assert_eq!(fs::read(out.join("sub/deep/file.txt")).unwrap(), b"deep");
    assert!(!dir.path().join("escape.txt").exists());

    let only = dir.path().join("only");
    assert_eq!(ar.extract_to(&only, Some(&["top.txt"][..])).unwrap(), 1);
    assert!(only.join("top.txt").exists());
    assert!(!only.join("sub").exists());
}

#[test]
fn test_extract_creates_empty_directories() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("dirs.rar");
    let out = dir.path().join("out");

    let mut ar = Archive::create(&path).unwrap();
    ar.add_directory("a/b/c").unwrap();
    assert_eq!(ar.extract_all(&out).unwrap(), 0);
    assert!(out.join("a/b/c").is_dir());
    assert_eq!(fs::read_dir(out.join("a/b/c")).unwrap().count(), 0);
}

#[test]
fn test_oversized_declared_content_is_refused() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("huge.rar");
    Archive::create(&path).unwrap().close().unwrap();
    let mut bytes = fs::read(&path).unwrap();
    let preamble = bytes.len();
    // 1 TiB declared, nothing stored.
    bytes.extend(large_entry("f.txt", 0x100, 0));
    fs::write(&path, &bytes).unwrap();

    let mut ar = Archive::open(&path, OpenMode::AppendOrRead).unwrap();
    assert!(ar.list_entries().is_empty());
    assert!(ar.get_content_by_index(0, 0).unwrap_err().is_not_found());
    assert_eq!(ar.extract_all(dir.path().join("out")).unwrap(), 0);
    assert_eq!(ar.stream_position().unwrap(), bytes.len() as u64 - 1);

    let report = recovery::scan_file(&path).unwrap();
    assert_eq!(report.truncated_blocks, 1);

    // The dangling header is cut on the first append.
    ar.add_bytes("g.txt", b"g").unwrap();
    ar.close().unwrap();
    let mut ar = Archive::open(&path, OpenMode::AppendOrRead).unwrap();
    assert_eq!(names(&ar), [(0, "g.txt".to_owned())]);
    assert_eq!(ar.get_content_by_index(0, 0).unwrap(), b"g");
    assert!(fs::read(&path).unwrap().len() > preamble);
}

#[test]
fn test_maximal_declared_size_does_not_rewind_the_scan() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("max.rar");
    let mut ar = Archive::create(&path).unwrap();
    ar.add_bytes("ok.txt", b"ok").unwrap();
    ar.close().unwrap();
    let mut bytes = fs::read(&path).unwrap();
    bytes.extend(large_entry("bad.txt", u32::MAX, u32::MAX));
    bytes.extend_from_slice(b"trailing");
    fs::write(&path, &bytes).unwrap();

    let mut ar = Archive::open(&path, OpenMode::AppendOrRead).unwrap();
    assert_eq!(names(&ar), [(0, "ok.txt".to_owned())]);
    assert_eq!(ar.len(), 1);
    assert_eq!(ar.get_content_by_name("ok.txt", 0).unwrap(), b"ok");
    assert!(ar.get_content_by_name("bad.txt", 0).unwrap_err().is_not_found());
}

#[test]
fn test_end_of_archive_block_is_cut_before_append() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("eoa.rar");
    let mut ar = Archive::create(&path).unwrap();
    ar.add_bytes("first.txt", b"first").unwrap();
    ar.close().unwrap();

    let mut bytes = fs::read(&path).unwrap();
    bytes.extend_from_slice(&END_OF_ARCHIVE);
    fs::write(&path, &bytes).unwrap();

    let mut ar = Archive::open(&path, OpenMode::AppendOrRead).unwrap();
    assert_eq!(ar.len(), 1);
    ar.add_bytes("second.txt", b"second").unwrap();
    ar.close().unwrap();

    let mut ar = Archive::open(&path, OpenMode::AppendOrRead).unwrap();
    assert_eq!(names(&ar), [(0, "first.txt".to_owned()), (1, "second.txt".to_owned())]);
    assert_eq!(ar.get_content_by_name("second.txt", 0).unwrap(), b"second");
}

#[test]
fn test_service_blocks_take_an_index_and_survive_rewrite() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("svc.rar");
    let mut ar = Archive::create(&path).unwrap();
    ar.add_bytes("a.txt", b"a").unwrap();
    ar.close().unwrap();

    let mut bytes = fs::read(&path).unwrap();
    let service = sub_block(b"CMT");
    bytes.extend_from_slice(&service);
    fs::write(&path, &bytes).unwrap();

    let mut ar = Archive::open(&path, OpenMode::AppendOrRead).unwrap();
    ar.add_bytes("b.txt", b"b").unwrap();
    assert_eq!(names(&ar), [(0, "a.txt".to_owned()), (2, "b.txt".to_owned())]);

    ar.delete_by_name("a.txt").unwrap();
    assert_eq!(names(&ar), [(1, "b.txt".to_owned())]);
    let raw = fs::read(&path).unwrap();
    assert!(raw.windows(service.len()).any(|w| w == service.as_slice()));
}

#[test]
fn test_fixed_timestamp_is_reproducible() {
    let dir = tempdir().unwrap();
    let stamp = chrono::NaiveDate::from_ymd_opt(2001, 2, 3)
        .and_then(|d| d.and_hms_opt(4, 5, 6))
        .unwrap();
    let build = |p: &Path| {
        let mut ar = Archive::open_with(p, ArchiveOptions { mode: OpenMode::CreateNew, mtime: Some(stamp) })
            .unwrap();
        ar.add_bytes("a/b/c.txt", b"same").unwrap();
        ar.close().unwrap();
        fs::read(p).unwrap()
    };
    assert_eq!(build(&dir.path().join("1.rar")), build(&dir.path().join("2.rar")));
}

#[test]
fn test_verify_and_repair() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("v.rar");
    let fixed = dir.path().join("fixed.rar");

    let mut ar = Archive::create(&path).unwrap();
    ar.add_bytes("good.txt", b"good").unwrap();
    ar.add_bytes("bad.txt", b"bad!").unwrap();
    ar.close().unwrap();
    assert!(recovery::scan_file(&path).unwrap().is_intact());

    let mut bytes = fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] = b'?';
    fs::write(&path, &bytes).unwrap();
    assert!(!recovery::scan_file(&path).unwrap().is_intact());

    let repaired = recovery::repair(&path, &fixed).unwrap();
    assert_eq!(repaired.recovered_files, 1);
    let ar = Archive::open(&fixed, OpenMode::AppendOrRead).unwrap();
    assert_eq!(names(&ar), [(0, "good.txt".to_owned())]);
}

mod roundtrip {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn any_unique_entry_set_round_trips(
            files in prop::collection::hash_map(
                "[a-z]{1,8}(/[a-z]{1,8}){0,2}\\.bin",
                prop::collection::vec(any::<u8>(), 1..256),
                1..12,
            )
        ) {
            let dir = tempdir().unwrap();
            let path = dir.path().join("p.rar");
            let mut ar = Archive::create(&path).unwrap();
            for (name, data) in &files {
                ar.add_bytes(name, data).unwrap();
            }
            ar.close().unwrap();

            let mut ar = Archive::open(&path, OpenMode::AppendOrRead).unwrap();
            let listed: HashMap<String, Vec<u8>> = ar.list_entries()
                .into_values()
                .map(|name| {
                    let data = ar.get_content_by_name(&name, 0).unwrap();
                    (name, data)
                })
                .collect();
            prop_assert_eq!(listed, files);
        }
    }
}
