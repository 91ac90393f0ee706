//! Public and internal types for the chunkdrive API.

use std::fmt;
use std::str::FromStr;

/// One freshly allocated chunk, as returned by initial allocation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChunkRecord {
    pub index: u32,
    /// xxh64 of the file contents, 16 lower-case hex chars.
    pub hash: String,
    /// Current on-disk file name (relative to the drive directory).
    pub filename: String,
}

/// One row of the `chunks` table.
///
/// `size` and `mtime` are the stat fingerprint observed when the row was last
/// written; the integrity check uses them to skip unchanged chunks without
/// rehashing.
#[derive(Clone, Debug, PartialEq)]
pub struct ChunkRow {
    pub index: u32,
    pub hash: String,
    pub filename: String,
    /// File size in bytes.
    pub size: u64,
    /// Modification time in floating-point seconds since epoch.
    pub mtime: f64,
}

/// Drive-level metadata stored in the `metadata` table at creation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DriveMeta {
    pub chunk_size_mb: u64,
    pub total_chunks: u32,
    pub fs: FsType,
}

/// Filesystem formatted onto the virtual device.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsType {
    Ext4,
    Btrfs,
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsType::Ext4 => write!(f, "ext4"),
            FsType::Btrfs => write!(f, "btrfs"),
        }
    }
}

impl FromStr for FsType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ext4" => Ok(FsType::Ext4),
            "btrfs" => Ok(FsType::Btrfs),
            other => anyhow::bail!("unsupported filesystem '{other}' (expected ext4 or btrfs)"),
        }
    }
}

/// Process-local view of a drive's lifecycle state.
///
/// `Serving` covers both the bare NBD-attached state and the mounted state;
/// distinguishing them would require parsing the mount table, which the
/// status probe deliberately avoids.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriveStatus {
    /// No directory under the storage root.
    Absent,
    /// On disk, no live server process.
    Idle,
    /// A server process from the PID file is alive.
    Serving,
}

impl fmt::Display for DriveStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DriveStatus::Absent => write!(f, "absent"),
            DriveStatus::Idle => write!(f, "idle"),
            DriveStatus::Serving => write!(f, "serving"),
        }
    }
}
