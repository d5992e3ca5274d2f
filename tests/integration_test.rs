use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use archivarius::hostfs::PosixHostFs;
use archivarius::{ArchiveAction, Catalogue, RestoreAction, Task, TestAction};

fn no_warnings() -> impl FnMut(String, String) {
    |header, message| panic!("unexpected warning {header}: {message}")
}

fn base_task(name: &str, archive: PathBuf, root: PathBuf) -> Task {
    Task {
        name: name.into(),
        archive_path: archive,
        root: Some(root),
        files_to_archive: Vec::new(),
        files_to_exclude: HashSet::new(),
        password: None,
        compress: false,
        process_acls: false,
        min_content_file_size: 0,
        max_storage_time: None,
    }
}

fn content_file_names(archive: &std::path::Path) -> HashSet<String> {
    fs::read_dir(archive)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with('c'))
        .collect()
}

/// S1 — fresh archive, one file: one snapshot, one content file sized
/// exactly to the source, and a byte-identical restore.
#[test]
fn fresh_archive_one_file_roundtrips() {
    let host = PosixHostFs;
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    let archive = tmp.path().join("archive");
    let dst = tmp.path().join("dst");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("a.txt"), b"abcd").unwrap();

    let task = base_task("t1", archive.clone(), src.clone());
    ArchiveAction::new(&host).run(&task, &mut no_warnings()).unwrap();

    let s_files: Vec<_> = fs::read_dir(&archive)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with('s'))
        .collect();
    let c_files = content_file_names(&archive);
    assert_eq!(s_files.len(), 1);
    assert_eq!(c_files.len(), 1);
    assert_eq!(
        fs::metadata(archive.join(c_files.iter().next().unwrap()))
            .unwrap()
            .len(),
        4
    );

    {
        let catalogue = Catalogue::open(&host, &archive, None, false).unwrap();
        assert_eq!(catalogue.num_states(), 1);
    }

    RestoreAction::new(&host)
        .run(&archive, None, &dst, 0, None, &mut no_warnings())
        .unwrap();
    assert_eq!(fs::read(dst.join("a.txt")).unwrap(), b"abcd");
}

/// S2 — running the same task again with nothing changed produces a new
/// snapshot but no new content file, and the ref count climbs to 2.
#[test]
fn incremental_unchanged_file_dedups() {
    let host = PosixHostFs;
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    let archive = tmp.path().join("archive");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("a.txt"), b"abcd").unwrap();

    let task = base_task("t1", archive.clone(), src.clone());
    let action = ArchiveAction::new(&host);
    action.run(&task, &mut no_warnings()).unwrap();
    action.run(&task, &mut no_warnings()).unwrap();

    assert_eq!(content_file_names(&archive).len(), 1, "no new content file should be written");

    let catalogue = Catalogue::open(&host, &archive, None, false).unwrap();
    assert_eq!(catalogue.num_states(), 2);
    let cref = catalogue.content_refs().next().unwrap();
    assert_eq!(cref.ref_count, 2);
}

/// S3 — one of two files changes; the new bytes land in a fresh content
/// file while the original stays put, leaving two distinct Content-Refs.
#[test]
fn changed_file_gets_its_own_content_ref() {
    let host = PosixHostFs;
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    let archive = tmp.path().join("archive");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("a.txt"), b"aaaa").unwrap();
    fs::write(src.join("b.txt"), b"bbbb").unwrap();

    let mut task = base_task("t1", archive.clone(), src.clone());
    task.min_content_file_size = 1024;
    let action = ArchiveAction::new(&host);
    action.run(&task, &mut no_warnings()).unwrap();

    let c_files_before = content_file_names(&archive);
    assert_eq!(c_files_before.len(), 1);

    std::thread::sleep(Duration::from_millis(1100));
    fs::write(src.join("b.txt"), b"BBBB-changed").unwrap();
    action.run(&task, &mut no_warnings()).unwrap();

    let c_files_after = content_file_names(&archive);
    assert_eq!(c_files_after.len(), 2, "changed file should land in a new content file");
    assert!(c_files_before.is_subset(&c_files_after), "original content file must survive");

    let catalogue = Catalogue::open(&host, &archive, None, false).unwrap();
    assert_eq!(catalogue.content_refs().count(), 2);
}

/// S5 — pruning drops snapshots older than `max_storage_time` from the
/// tail, but never the newest one.
#[test]
fn pruning_drops_old_snapshots_but_keeps_newest() {
    let host = PosixHostFs;
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    let archive = tmp.path().join("archive");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("a.txt"), b"abcd").unwrap();

    let mut task = base_task("t1", archive.clone(), src.clone());
    let action = ArchiveAction::new(&host);
    action.run(&task, &mut no_warnings()).unwrap();

    std::thread::sleep(Duration::from_millis(1100));
    action.run(&task, &mut no_warnings()).unwrap();

    task.max_storage_time = Some(Duration::from_secs(0));
    std::thread::sleep(Duration::from_millis(1100));
    action.run(&task, &mut no_warnings()).unwrap();

    let catalogue = Catalogue::open(&host, &archive, None, false).unwrap();
    assert_eq!(catalogue.num_states(), 1, "every snapshot but the newest should be pruned");
}

/// Encrypted round-trip: archive with a password, restore with the same
/// password, reject the wrong one.
#[test]
fn encrypted_archive_requires_correct_password() {
    let host = PosixHostFs;
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    let archive = tmp.path().join("archive");
    let dst = tmp.path().join("dst");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("secret.txt"), b"top secret bytes").unwrap();

    let mut task = base_task("t1", archive.clone(), src.clone());
    task.password = Some("hunter2".into());
    ArchiveAction::new(&host).run(&task, &mut no_warnings()).unwrap();

    let err = RestoreAction::new(&host).run(&archive, Some("wrong"), &dst, 0, None, &mut no_warnings());
    assert!(err.is_err());

    RestoreAction::new(&host)
        .run(&archive, Some("hunter2"), &dst, 0, None, &mut no_warnings())
        .unwrap();
    assert_eq!(fs::read(dst.join("secret.txt")).unwrap(), b"top secret bytes");
}

/// `test` (verify) passes clean on an archive produced normally, and
/// flags a content file whose bytes were tampered with after the fact.
#[test]
fn verify_detects_tampering() {
    let host = PosixHostFs;
    let tmp = tempfile::tempdir().unwrap();
    let src = tmp.path().join("src");
    let archive = tmp.path().join("archive");
    fs::create_dir_all(&src).unwrap();
    fs::write(src.join("a.txt"), b"some bytes to checksum").unwrap();

    let task = base_task("t1", archive.clone(), src.clone());
    ArchiveAction::new(&host).run(&task, &mut no_warnings()).unwrap();

    TestAction::new(&host).run(&archive, None, &mut no_warnings()).unwrap();

    let content_file = fs::read_dir(&archive)
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.file_name().unwrap().to_str().unwrap().starts_with('c'))
        .unwrap();
    let mut bytes = fs::read(&content_file).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    fs::write(&content_file, bytes).unwrap();

    let mut warnings = Vec::new();
    TestAction::new(&host)
        .run(&archive, None, &mut |h, m| warnings.push((h, m)))
        .unwrap();
    assert!(!warnings.is_empty());
}
