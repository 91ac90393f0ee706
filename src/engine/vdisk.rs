//! The virtual disk: a flat byte-addressable view over the chunk files.
//!
//! Offsets translate to (chunk index, intra-chunk offset) by integer
//! division; file handles are held in a bounded LRU cache so drives with
//! thousands of chunks stay under the process fd limit. Not safe for
//! concurrent use; the NBD request loop owns one instance exclusively.

use anyhow::{Context, Result, bail};
use lru::LruCache;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::num::NonZeroUsize;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use super::chunks::scan_chunks;

/// Handle cache capacity. Eviction closes the oldest handle; durability
/// across eviction is the caller's job via [`VirtualDisk::sync`].
pub const DEFAULT_MAX_OPEN_FILES: usize = 64;

pub struct VirtualDisk {
    root: PathBuf,
    chunk_size: u64,
    total_size: u64,
    read_only: bool,
    /// index -> current filename, built once at startup.
    chunk_map: BTreeMap<u32, String>,
    open_files: LruCache<u32, File>,
    /// Count of file-open events, for the close log and eviction tests.
    opens: u64,
}

impl VirtualDisk {
    pub fn new(
        root: PathBuf,
        drive_name: &str,
        chunk_size_mb: u64,
        total_chunks: u32,
        read_only: bool,
    ) -> Result<Self> {
        Self::with_max_open(
            root,
            drive_name,
            chunk_size_mb,
            total_chunks,
            read_only,
            DEFAULT_MAX_OPEN_FILES,
        )
    }

    pub fn with_max_open(
        root: PathBuf,
        drive_name: &str,
        chunk_size_mb: u64,
        total_chunks: u32,
        read_only: bool,
        max_open_files: usize,
    ) -> Result<Self> {
        let chunk_map = scan_chunks(&root, drive_name)?;
        let chunk_size = chunk_size_mb * 1024 * 1024;
        let cap = NonZeroUsize::new(max_open_files).unwrap_or(NonZeroUsize::MIN);
        Ok(Self {
            root,
            chunk_size,
            total_size: chunk_size * total_chunks as u64,
            read_only,
            chunk_map,
            open_files: LruCache::new(cap),
            opens: 0,
        })
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    /// Read `length` bytes at `offset`, clamped to the device size. Regions a
    /// chunk file does not back yet (sparse holes past its EOF) come back as
    /// zeroes. Chunk boundaries are invisible to the caller.
    pub fn read(&mut self, offset: u64, length: u32) -> Result<Vec<u8>> {
        if offset >= self.total_size {
            return Ok(Vec::new());
        }
        let mut offset = offset;
        let mut remaining = (length as u64).min(self.total_size - offset);
        let mut out = Vec::with_capacity(remaining as usize);

        while remaining > 0 {
            let index = (offset / self.chunk_size) as u32;
            let in_chunk = offset % self.chunk_size;
            let n = remaining.min(self.chunk_size - in_chunk) as usize;

            let file = self.handle(index)?;
            let mut buf = vec![0u8; n];
            let mut filled = 0;
            while filled < n {
                match file.read_at(&mut buf[filled..], in_chunk + filled as u64) {
                    // EOF inside the logically-allocated region: the rest of
                    // buf stays zeroed
                    Ok(0) => break,
                    Ok(got) => filled += got,
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        return Err(e)
                            .with_context(|| format!("read chunk {index} at {in_chunk}"));
                    }
                }
            }
            out.extend_from_slice(&buf);

            offset += n as u64;
            remaining -= n as u64;
        }

        Ok(out)
    }

    /// Write `data` at `offset`, split across chunk files as needed.
    /// Unbuffered; durability requires [`Self::sync`].
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        if self.read_only {
            bail!("virtual disk is read-only");
        }
        let mut offset = offset;
        let mut data = data;

        while !data.is_empty() {
            let index = (offset / self.chunk_size) as u32;
            let in_chunk = offset % self.chunk_size;
            let n = (data.len() as u64).min(self.chunk_size - in_chunk) as usize;

            let file = self.handle(index)?;
            file.write_all_at(&data[..n], in_chunk)
                .with_context(|| format!("write chunk {index} at {in_chunk}"))?;

            offset += n as u64;
            data = &data[n..];
        }

        Ok(())
    }

    /// fsync every currently-open handle. Handles evicted before this call
    /// are not covered.
    pub fn sync(&mut self) -> Result<()> {
        for (index, file) in self.open_files.iter() {
            file.sync_all()
                .with_context(|| format!("fsync chunk {index}"))?;
        }
        Ok(())
    }

    /// Close all handles and clear the cache.
    pub fn close(&mut self) {
        log::debug!(
            "closing virtual disk: {} handles open, {} opens total",
            self.open_files.len(),
            self.opens
        );
        self.open_files.clear();
    }

    /// Number of currently-open handles.
    pub fn open_handles(&self) -> usize {
        self.open_files.len()
    }

    /// Count of file-open events since startup.
    pub fn opens(&self) -> u64 {
        self.opens
    }

    /// Fetch the handle for a chunk, opening it on a miss and evicting the
    /// least-recently-used handle when the cache is full. Access promotes.
    fn handle(&mut self, index: u32) -> Result<&File> {
        if !self.open_files.contains(&index) {
            let filename = self
                .chunk_map
                .get(&index)
                .with_context(|| format!("chunk {index} missing on disk"))?;
            let path = self.root.join(filename);
            let file = OpenOptions::new()
                .read(true)
                .write(!self.read_only)
                .open(&path)
                .with_context(|| format!("open chunk {}", path.display()))?;
            self.opens += 1;
            // push evicts the LRU entry when full; dropping it closes the fd
            self.open_files.push(index, file);
        }
        self.open_files
            .get(&index)
            .context("chunk handle vanished from cache")
    }
}
