//! Chunk content hashing.
//!
//! xxh64 (seed 0) rendered as 16 lower-case hex chars. The hash is embedded
//! in chunk file names, so it must be stable across runs and platforms.

use anyhow::{Context, Result};
use memmap2::Mmap;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use xxhash_rust::xxh64::Xxh64;

/// File size above which hashing uses memory-mapped I/O (bytes). 100 MiB.
pub const HASH_MMAP_THRESHOLD: u64 = 100 * 1024 * 1024;
/// Window size for streamed hashing below the mmap threshold (bytes). 4 MiB.
pub const HASH_WINDOW_SIZE: usize = 4 * 1024 * 1024;

/// Hash a file's entire contents. Streams in 4 MiB windows; large files go
/// through a memory map instead. Both paths produce identical digests.
pub fn hash_file(path: &Path) -> Result<String> {
    let file = File::open(path).with_context(|| format!("open {} for hashing", path.display()))?;
    let size = file
        .metadata()
        .with_context(|| format!("stat {}", path.display()))?
        .len();

    let mut hasher = Xxh64::new(0);
    if size > HASH_MMAP_THRESHOLD {
        let mmap = unsafe { Mmap::map(&file) }
            .with_context(|| format!("mmap {}", path.display()))?;
        hasher.update(&mmap);
    } else {
        let mut reader = file;
        let mut buffer = vec![0u8; HASH_WINDOW_SIZE];
        loop {
            let n = reader
                .read(&mut buffer)
                .with_context(|| format!("read {}", path.display()))?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }
    }

    Ok(format!("{:016x}", hasher.digest()))
}

/// Hash an in-memory buffer the same way `hash_file` would.
pub fn hash_bytes(data: &[u8]) -> String {
    format!("{:016x}", xxhash_rust::xxh64::xxh64(data, 0))
}
