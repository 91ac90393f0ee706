//! On-disk chunk files: naming, allocation, directory scan.
//!
//! A chunk lives at `{drive}.{index}.{hash}.img` with the index zero-padded
//! and the hash embedded in the name. Content changes are reconciled by the
//! integrity check, which rehashes and renames.

use anyhow::{Context, Result, bail};
use std::collections::BTreeMap;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::path::Path;

use super::hashing::hash_file;
use crate::types::ChunkRecord;

/// Zero-pad width for chunk indices: at least 3 digits, more for large drives.
pub fn padding(total_chunks: u32) -> usize {
    let digits = total_chunks.saturating_sub(1).to_string().len();
    digits.max(3)
}

/// `{drive}.{index:0pad}.{hash}.img`
pub fn format_name(drive_name: &str, index: u32, hash: &str, padding: usize) -> String {
    format!("{drive_name}.{index:0padding$}.{hash}.img")
}

/// Extract the chunk index from a filename, or `None` when the entry is not
/// a chunk of this drive (wrong prefix/suffix, unparseable index).
pub fn parse_index(drive_name: &str, filename: &str) -> Option<u32> {
    let rest = filename.strip_prefix(drive_name)?.strip_prefix('.')?;
    if !filename.ends_with(".img") {
        return None;
    }
    rest.split('.').next()?.parse().ok()
}

/// Map `index -> filename` from the drive directory. Non-chunk entries and
/// unparseable indices are skipped.
pub fn scan_chunks(drive_dir: &Path, drive_name: &str) -> Result<BTreeMap<u32, String>> {
    let mut map = BTreeMap::new();
    let entries = std::fs::read_dir(drive_dir)
        .with_context(|| format!("read drive directory {}", drive_dir.display()))?;
    for entry in entries {
        let entry = entry.with_context(|| format!("read entry in {}", drive_dir.display()))?;
        let Ok(filename) = entry.file_name().into_string() else {
            continue;
        };
        if let Some(index) = parse_index(drive_name, &filename) {
            map.insert(index, filename);
        }
    }
    Ok(map)
}

/// Allocate, hash, and name every chunk of a new drive.
///
/// Each chunk is preallocated at full size into a `.tmp` file (failing when
/// space is unavailable), hashed, then renamed into place. `on_progress` is
/// called once per finished chunk.
pub fn create_initial(
    drive_dir: &Path,
    drive_name: &str,
    total_chunks: u32,
    chunk_size_mb: u64,
    mut on_progress: Option<&mut dyn FnMut(u32)>,
) -> Result<Vec<ChunkRecord>> {
    let pad = padding(total_chunks);
    let chunk_bytes = chunk_size_mb * 1024 * 1024;
    let mut chunks = Vec::with_capacity(total_chunks as usize);

    for index in 0..total_chunks {
        let tmp_path = drive_dir.join(format!("{drive_name}.{index:0pad$}.tmp"));
        let file = File::create(&tmp_path)
            .with_context(|| format!("create {}", tmp_path.display()))?;
        preallocate(&file, chunk_bytes)
            .with_context(|| format!("allocate {chunk_size_mb} MiB for {}", tmp_path.display()))?;
        drop(file);

        let hash = hash_file(&tmp_path)?;
        let filename = format_name(drive_name, index, &hash, pad);
        let final_path = drive_dir.join(&filename);
        if final_path.exists() {
            bail!("chunk rename collision: {} already exists", final_path.display());
        }
        std::fs::rename(&tmp_path, &final_path).with_context(|| {
            format!("rename {} -> {}", tmp_path.display(), final_path.display())
        })?;

        chunks.push(ChunkRecord {
            index,
            hash,
            filename,
        });
        if let Some(cb) = on_progress.as_deref_mut() {
            cb(index);
        }
    }

    Ok(chunks)
}

/// Reserve `len` bytes of real disk space (fallocate mode 0). Unlike a plain
/// truncate this fails up front when the filesystem cannot back the chunk.
fn preallocate(file: &File, len: u64) -> std::io::Result<()> {
    let ret = unsafe { libc::fallocate(file.as_raw_fd(), 0, 0, len as libc::off_t) };
    if ret != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}
