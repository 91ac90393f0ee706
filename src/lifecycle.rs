//! Drive lifecycle: create, mount, umount, check, status.
//!
//! Orchestration sits on top of the leaves (chunk store, metadata DB, NBD
//! server, shell gateway) and owns the per-drive PID file. A drive moves
//! `absent -> idle` on create, `idle -> serving/mounted` while a detached
//! server holds the device, and back to `idle` on umount, which runs the
//! integrity check to reconcile chunk hashes after writes.

use anyhow::{Context, Result, bail};
use rayon::prelude::*;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::time::Duration;

use crate::engine::{MetaDb, chunks, hashing, progress};
use crate::types::{DriveMeta, DriveStatus, FsType};
use crate::utils::{Config, pidfile, shell};

/// Settle time between spawning a server and using the device.
const DEVICE_SETTLE: Duration = Duration::from_secs(1);

/// Stat fingerprint tolerance: mtimes within this window count as unchanged.
const MTIME_TOLERANCE: f64 = 1e-4;

pub fn drive_path(config: &Config, name: &str) -> PathBuf {
    config.storage_root.join(name)
}

pub fn exists_on_disk(config: &Config, name: &str) -> bool {
    drive_path(config, name).exists()
}

/// True when the drive's PID file names a live server process.
pub fn is_running(config: &Config, name: &str) -> bool {
    pidfile::read(&config.storage_root, name).is_some_and(pidfile::process_alive)
}

pub fn status(config: &Config, name: &str) -> DriveStatus {
    if !exists_on_disk(config, name) {
        DriveStatus::Absent
    } else if is_running(config, name) {
        DriveStatus::Serving
    } else {
        DriveStatus::Idle
    }
}

fn require_exists(config: &Config, name: &str) -> Result<PathBuf> {
    let path = drive_path(config, name);
    if !path.exists() {
        bail!("drive '{name}' not found at {}", path.display());
    }
    Ok(path)
}

fn require_not_running(config: &Config, name: &str) -> Result<()> {
    if is_running(config, name) {
        bail!("drive '{name}' is already being served");
    }
    Ok(())
}

/// Allocate a new drive and format a filesystem onto it.
///
/// Chunks are fallocated, hashed, and recorded; a transient NBD server is
/// spawned just long enough for `mkfs` to see a block device. A half-created
/// drive is left on disk for inspection when any step fails.
pub fn create(
    config: &Config,
    name: &str,
    size_mb: u64,
    chunk_mb: u64,
    fs: FsType,
    device: &str,
) -> Result<()> {
    if size_mb == 0 || chunk_mb == 0 {
        bail!("size and chunk must be positive");
    }
    if exists_on_disk(config, name) {
        bail!("drive '{name}' already exists");
    }

    let total_chunks = u32::try_from(size_mb.div_ceil(chunk_mb))
        .context("drive would need more than u32::MAX chunks")?;
    let path = drive_path(config, name);
    std::fs::create_dir_all(&path)
        .with_context(|| format!("create drive directory {}", path.display()))?;

    let db = MetaDb::new(&path, name);
    db.initialize(&DriveMeta {
        chunk_size_mb: chunk_mb,
        total_chunks,
        fs,
    })?;

    log::info!("allocating {total_chunks} chunks of {chunk_mb} MiB");
    let mut bar = progress::allocation_bar(total_chunks as usize);
    let mut on_progress = |_: u32| progress::tick(&mut bar);
    let records = chunks::create_initial(&path, name, total_chunks, chunk_mb, Some(&mut on_progress))?;

    // Stat fingerprints recorded now let the first check skip every chunk.
    for record in &records {
        let meta = std::fs::metadata(path.join(&record.filename))
            .with_context(|| format!("stat fresh chunk {}", record.filename))?;
        db.update_chunk(
            record.index,
            &record.hash,
            &record.filename,
            meta.len(),
            mtime_seconds(&meta),
        )?;
    }

    log::info!("formatting {device} as {fs}");
    let mut server = spawn_server(&path, name, chunk_mb, total_chunks, device, false)?;
    std::thread::sleep(DEVICE_SETTLE);

    let formatted = format_device(device, fs);

    // Tear the transient server down whether or not mkfs succeeded.
    let _ = shell::run(&["nbd-client", "-d", device], None, false);
    let _ = server.kill();
    let _ = server.wait();
    formatted?;

    fix_permissions(&config.storage_root, true)?;
    log::info!("drive '{name}' created ({size_mb} MB, {fs})");
    Ok(())
}

fn format_device(device: &str, fs: FsType) -> Result<()> {
    match fs {
        // -F: format even though the target looks unusual
        FsType::Ext4 => shell::run(&["mkfs.ext4", "-F", device], None, true)?,
        // -K skips discard (pointless on chunk files), single profiles since
        // there is exactly one underlying device
        FsType::Btrfs => shell::run(
            &["mkfs.btrfs", "-f", "-K", "-m", "single", "-d", "single", device],
            None,
            true,
        )?,
    };
    Ok(())
}

/// Start a detached server for the drive and mount its filesystem.
pub fn mount(config: &Config, name: &str, device: &str) -> Result<()> {
    let path = require_exists(config, name)?;
    require_not_running(config, name)?;

    let db = MetaDb::new(&path, name);
    let meta = db.load_meta()?;

    let server = spawn_server(&path, name, meta.chunk_size_mb, meta.total_chunks, device, true)?;
    let pid = server.id();
    pidfile::write(&config.storage_root, name, pid)?;

    std::thread::sleep(DEVICE_SETTLE);

    if let Err(e) = mount_filesystem(config, name, device, meta.fs) {
        pidfile::terminate(pid as i32);
        pidfile::remove(&config.storage_root, name);
        return Err(e).with_context(|| format!("mount drive '{name}'"));
    }

    log::info!("mounted '{name}' on {}", config.mount_root.join(name).display());
    Ok(())
}

fn mount_filesystem(config: &Config, name: &str, device: &str, fs: FsType) -> Result<()> {
    let target = config.mount_root.join(name);
    std::fs::create_dir_all(&target)
        .with_context(|| format!("create mount point {}", target.display()))?;
    let target_str = target.to_string_lossy();

    match fs {
        FsType::Btrfs => shell::run(
            &["mount", "-o", "compress=zstd", device, &target_str],
            None,
            true,
        )?,
        FsType::Ext4 => shell::run(&["mount", device, &target_str], None, true)?,
    };

    // 'user:' picks up the user's primary group
    if let Ok(sudo_user) = std::env::var("SUDO_USER") {
        shell::run(&["chown", &format!("{sudo_user}:"), &target_str], None, true)?;
    }
    Ok(())
}

/// Unmount, stop the server, and reconcile chunk hashes.
pub fn umount(config: &Config, name: &str, device: &str) -> Result<()> {
    let target = config.mount_root.join(name);
    let target_str = target.to_string_lossy();
    let _ = shell::run(&["umount", &target_str], None, false);

    if let Some(pid) = pidfile::read(&config.storage_root, name) {
        let _ = shell::run(&["nbd-client", "-d", device], None, false);
        pidfile::terminate(pid);
    }
    pidfile::remove(&config.storage_root, name);

    if target.exists()
        && let Ok(mut entries) = target.read_dir()
        && entries.next().is_none()
    {
        let _ = std::fs::remove_dir(&target);
    }

    check(config, name)?;
    log::info!("closed '{name}'");
    Ok(())
}

/// Rehash chunks whose stat fingerprint moved; rename the ones whose content
/// changed and refresh the metadata rows. Returns `(skipped, updated)`.
pub fn check(config: &Config, name: &str) -> Result<(usize, usize)> {
    let path = require_exists(config, name)?;
    let db = MetaDb::new(&path, name);
    let rows = db.get_chunks()?;
    let total_chunks: u32 = db
        .get_meta("total_chunks")?
        .context("metadata key 'total_chunks' missing")?
        .parse()
        .context("parse total_chunks")?;
    let pad = chunks::padding(total_chunks);

    let mut skipped = 0usize;
    let mut candidates = Vec::new();

    for row in rows {
        let file_path = path.join(&row.filename);
        let Ok(meta) = std::fs::metadata(&file_path) else {
            // Chunk file gone; nothing to reconcile against.
            continue;
        };
        let mtime = mtime_seconds(&meta);
        if (mtime - row.mtime).abs() < MTIME_TOLERANCE && meta.len() == row.size {
            skipped += 1;
            continue;
        }
        candidates.push((row, file_path));
    }

    let rehashed: Vec<_> = candidates
        .into_par_iter()
        .map(|(row, file_path)| {
            let hash = hashing::hash_file(&file_path)?;
            Ok((row, file_path, hash))
        })
        .collect::<Result<_>>()?;

    let mut updated = 0usize;
    for (row, file_path, new_hash) in rehashed {
        if new_hash != row.hash {
            let new_name = chunks::format_name(name, row.index, &new_hash, pad);
            let new_path = path.join(&new_name);
            std::fs::rename(&file_path, &new_path).with_context(|| {
                format!("rename {} -> {}", file_path.display(), new_path.display())
            })?;
            let meta = std::fs::metadata(&new_path)
                .with_context(|| format!("stat {}", new_path.display()))?;
            db.update_chunk(row.index, &new_hash, &new_name, meta.len(), mtime_seconds(&meta))?;
            log::info!("updated chunk {} -> {new_hash}", row.index);
            updated += 1;
        } else {
            // Content unchanged; refresh the fingerprint so the next check
            // skips it.
            let meta = std::fs::metadata(&file_path)
                .with_context(|| format!("stat {}", file_path.display()))?;
            db.update_chunk(
                row.index,
                &row.hash,
                &row.filename,
                meta.len(),
                mtime_seconds(&meta),
            )?;
        }
    }

    log::info!("check complete: {skipped} skipped, {updated} updated");
    Ok((skipped, updated))
}

/// Spawn an `internal-serve` child for the drive. Detached children get
/// their own session so the controlling shell returns immediately.
fn spawn_server(
    drive_dir: &Path,
    name: &str,
    chunk_mb: u64,
    total_chunks: u32,
    device: &str,
    detach: bool,
) -> Result<Child> {
    let exe = std::env::current_exe().context("locate current executable")?;
    let mut cmd = Command::new(exe);
    cmd.arg("internal-serve")
        .arg(drive_dir)
        .arg(name)
        .arg(chunk_mb.to_string())
        .arg(total_chunks.to_string())
        .arg(device)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());
    if detach {
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
    }
    cmd.spawn().context("spawn NBD server process")
}

/// `chown [-R] $SUDO_USER: path` when invoked under sudo, so the invoking
/// user keeps ownership of what root just wrote.
fn fix_permissions(path: &Path, recursive: bool) -> Result<()> {
    let Ok(sudo_user) = std::env::var("SUDO_USER") else {
        return Ok(());
    };
    let owner = format!("{sudo_user}:");
    let path_str = path.to_string_lossy();
    let mut argv = vec!["chown"];
    if recursive {
        argv.push("-R");
    }
    argv.push(&owner);
    argv.push(&path_str);
    shell::run(&argv, None, true)?;
    Ok(())
}

/// Modification time as floating-point seconds since epoch, matching the
/// REAL column in the chunks table.
fn mtime_seconds(meta: &std::fs::Metadata) -> f64 {
    meta.modified()
        .ok()
        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
