//! Lifecycle tests that run without a kernel device: the integrity check and
//! the status probes.

use chunkdrive::engine::{MetaDb, format_name, hash_file};
use chunkdrive::lifecycle::{check, status};
use chunkdrive::types::{DriveMeta, DriveStatus, FsType};
use chunkdrive::utils::Config;
use std::path::Path;
use tempfile::tempdir;

fn mtime_seconds(path: &Path) -> f64 {
    std::fs::metadata(path)
        .unwrap()
        .modified()
        .unwrap()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs_f64()
}

/// Build a drive directory with `contents.len()` chunks, a populated DB, and
/// a config pointing at the tempdirs.
fn make_drive(storage: &Path, mounts: &Path, name: &str, contents: &[&[u8]]) -> Config {
    let drive_dir = storage.join(name);
    std::fs::create_dir_all(&drive_dir).unwrap();

    let db = MetaDb::new(&drive_dir, name);
    db.initialize(&DriveMeta {
        chunk_size_mb: 1,
        total_chunks: contents.len() as u32,
        fs: FsType::Ext4,
    })
    .unwrap();

    for (index, content) in contents.iter().enumerate() {
        let tmp = drive_dir.join("staging");
        std::fs::write(&tmp, content).unwrap();
        let hash = hash_file(&tmp).unwrap();
        let filename = format_name(name, index as u32, &hash, 3);
        let path = drive_dir.join(&filename);
        std::fs::rename(&tmp, &path).unwrap();
        db.update_chunk(
            index as u32,
            &hash,
            &filename,
            content.len() as u64,
            mtime_seconds(&path),
        )
        .unwrap();
    }

    Config {
        storage_root: storage.to_path_buf(),
        mount_root: mounts.to_path_buf(),
    }
}

// --- check ---

#[test]
fn test_check_is_a_no_op_on_untouched_drive() {
    let storage = tempdir().unwrap();
    let mounts = tempdir().unwrap();
    let config = make_drive(storage.path(), mounts.path(), "d1", &[b"alpha", b"beta"]);

    assert_eq!(check(&config, "d1").unwrap(), (2, 0));
    // Idempotence: a second pass still reports nothing
    assert_eq!(check(&config, "d1").unwrap(), (2, 0));
}

#[test]
fn test_check_renames_changed_chunk_and_updates_db() {
    let storage = tempdir().unwrap();
    let mounts = tempdir().unwrap();
    let config = make_drive(storage.path(), mounts.path(), "d1", &[b"alpha", b"beta"]);
    let drive_dir = storage.path().join("d1");

    let db = MetaDb::new(&drive_dir, "d1");
    let old_row = db.get_chunks().unwrap()[0].clone();
    std::fs::write(
        drive_dir.join(&old_row.filename),
        b"alpha was overwritten with something longer",
    )
    .unwrap();

    let (_, updated) = check(&config, "d1").unwrap();
    assert_eq!(updated, 1);

    let new_row = db.get_chunks().unwrap()[0].clone();
    assert_ne!(new_row.hash, old_row.hash);
    assert_eq!(new_row.filename, format_name("d1", 0, &new_row.hash, 3));
    assert!(drive_dir.join(&new_row.filename).exists());
    assert!(!drive_dir.join(&old_row.filename).exists());

    // The on-disk name embeds the hash of the content at rest
    assert_eq!(
        hash_file(&drive_dir.join(&new_row.filename)).unwrap(),
        new_row.hash
    );

    // And the drive is quiescent again
    assert_eq!(check(&config, "d1").unwrap(), (2, 0));
}

#[test]
fn test_check_with_same_content_reports_no_update() {
    let storage = tempdir().unwrap();
    let mounts = tempdir().unwrap();
    let config = make_drive(storage.path(), mounts.path(), "d1", &[b"alpha"]);
    let drive_dir = storage.path().join("d1");

    // Rewrite identical content: the fingerprint may move, the hash cannot
    let row = MetaDb::new(&drive_dir, "d1").get_chunks().unwrap()[0].clone();
    std::thread::sleep(std::time::Duration::from_millis(20));
    std::fs::write(drive_dir.join(&row.filename), b"alpha").unwrap();

    let (_, updated) = check(&config, "d1").unwrap();
    assert_eq!(updated, 0);
    assert_eq!(check(&config, "d1").unwrap(), (1, 0));
}

#[test]
fn test_check_skips_missing_chunk_files() {
    let storage = tempdir().unwrap();
    let mounts = tempdir().unwrap();
    let config = make_drive(storage.path(), mounts.path(), "d1", &[b"alpha", b"beta"]);
    let drive_dir = storage.path().join("d1");

    let row = MetaDb::new(&drive_dir, "d1").get_chunks().unwrap()[0].clone();
    std::fs::remove_file(drive_dir.join(&row.filename)).unwrap();

    // Missing file is neither an error nor an update
    assert_eq!(check(&config, "d1").unwrap(), (1, 0));
}

#[test]
fn test_check_unknown_drive_fails() {
    let storage = tempdir().unwrap();
    let mounts = tempdir().unwrap();
    let config = Config {
        storage_root: storage.path().to_path_buf(),
        mount_root: mounts.path().to_path_buf(),
    };
    assert!(check(&config, "nope").is_err());
}

// --- status ---

#[test]
fn test_status_absent_then_idle() {
    let storage = tempdir().unwrap();
    let mounts = tempdir().unwrap();
    let config = Config {
        storage_root: storage.path().to_path_buf(),
        mount_root: mounts.path().to_path_buf(),
    };

    assert_eq!(status(&config, "d1"), DriveStatus::Absent);
    std::fs::create_dir_all(storage.path().join("d1")).unwrap();
    assert_eq!(status(&config, "d1"), DriveStatus::Idle);
}

#[test]
fn test_stale_pid_file_does_not_mean_serving() {
    let storage = tempdir().unwrap();
    let mounts = tempdir().unwrap();
    let config = Config {
        storage_root: storage.path().to_path_buf(),
        mount_root: mounts.path().to_path_buf(),
    };
    std::fs::create_dir_all(storage.path().join("d1")).unwrap();

    // A PID that cannot exist: way beyond pid_max
    std::fs::write(storage.path().join(".d1.pid"), "999999999\n").unwrap();
    assert_eq!(status(&config, "d1"), DriveStatus::Idle);

    // Garbage content is treated the same
    std::fs::write(storage.path().join(".d1.pid"), "not-a-pid\n").unwrap();
    assert_eq!(status(&config, "d1"), DriveStatus::Idle);
}
