//! PID files under the storage root: the single-writer lock per drive.
//!
//! `.{name}.pid` exists while a detached server holds the drive; its content
//! plus a signal-0 liveness probe decides whether a drive counts as serving.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};

pub fn pid_path(storage_root: &Path, name: &str) -> PathBuf {
    storage_root.join(format!(".{name}.pid"))
}

pub fn write(storage_root: &Path, name: &str, pid: u32) -> Result<()> {
    let path = pid_path(storage_root, name);
    std::fs::write(&path, format!("{pid}\n"))
        .with_context(|| format!("write pid file {}", path.display()))
}

/// Read and parse the PID file. `None` when missing or unparseable.
pub fn read(storage_root: &Path, name: &str) -> Option<i32> {
    let raw = std::fs::read_to_string(pid_path(storage_root, name)).ok()?;
    raw.trim().parse().ok()
}

pub fn remove(storage_root: &Path, name: &str) {
    let _ = std::fs::remove_file(pid_path(storage_root, name));
}

/// True when `pid` names a live process we may signal (`kill(pid, 0)`).
pub fn process_alive(pid: i32) -> bool {
    unsafe { libc::kill(pid, 0) == 0 }
}

/// Send SIGTERM; ignores errors (process may already be gone).
pub fn terminate(pid: i32) {
    unsafe {
        libc::kill(pid, libc::SIGTERM);
    }
}
