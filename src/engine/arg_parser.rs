use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::types::FsType;

/// Default NBD device; every drive operation can point elsewhere.
pub const DEFAULT_NBD_DEVICE: &str = "/dev/nbd0";

/// Chunk-backed virtual drives over NBD.
#[derive(Parser)]
#[command(name = "chunkdrive")]
#[command(about = "Present a directory of chunk files as a local block device.")]
pub struct Cli {
    /// Verbose output.
    #[arg(long, short = 'v', global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create a drive: allocate chunks, format the filesystem.
    Create {
        /// Drive name.
        name: String,

        /// Total size in MB.
        #[arg(long, short = 's')]
        size: u64,

        /// Chunk size in MB.
        #[arg(long, short = 'c', default_value = "500")]
        chunk: u64,

        /// Filesystem to format (ext4/btrfs).
        #[arg(long, short = 'f', default_value = "btrfs", value_parser = parse_fs)]
        fs: FsType,

        /// NBD device used while formatting.
        #[arg(long, default_value = DEFAULT_NBD_DEVICE)]
        device: String,
    },

    /// Start the NBD server for a drive and mount its filesystem.
    Mount {
        /// Drive name.
        name: String,

        /// NBD device to attach.
        #[arg(long, default_value = DEFAULT_NBD_DEVICE)]
        device: String,
    },

    /// Unmount a drive, stop its server, and reconcile chunk hashes.
    Umount {
        /// Drive name.
        name: String,

        /// NBD device the drive was attached to.
        #[arg(long, default_value = DEFAULT_NBD_DEVICE)]
        device: String,
    },

    /// Rehash changed chunks and update names and metadata.
    Check {
        /// Drive name.
        name: String,
    },

    /// Report whether a drive is absent, idle, or serving.
    Status {
        /// Drive name.
        name: String,
    },

    /// Run the NBD server in the foreground. Spawned by create and mount;
    /// not part of the public surface.
    #[command(hide = true)]
    InternalServe {
        path: PathBuf,
        name: String,
        chunk_mb: u64,
        total_chunks: u32,
        device: String,
    },
}

fn parse_fs(s: &str) -> Result<FsType, String> {
    s.parse().map_err(|e: anyhow::Error| e.to_string())
}
