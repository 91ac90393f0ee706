//! The per-drive metadata database.
//!
//! A single SQLite file next to the chunks, WAL journaling. Two tables: a
//! key/value `metadata` table and one row per chunk. Every operation opens
//! its own connection, runs one transaction, checkpoints the WAL, and
//! closes; the store is touched from short-lived CLI processes, not a
//! daemon.

use anyhow::{Context, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};

use crate::types::{ChunkRow, DriveMeta};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS metadata (
    key TEXT PRIMARY KEY,
    value TEXT
);
CREATE TABLE IF NOT EXISTS chunks (
    chunk_index INTEGER PRIMARY KEY,
    hash TEXT,
    filename TEXT,
    size INTEGER,
    mtime REAL
);
"#;

const WAL_PRAGMAS: &str = r#"
PRAGMA synchronous = NORMAL;
PRAGMA wal_autocheckpoint = 10000;
PRAGMA journal_size_limit = 67108864;
"#;

/// Handle on a drive's metadata DB (`{dir}/{name}.db`). Holds no connection;
/// see module docs.
pub struct MetaDb {
    db_path: PathBuf,
}

impl MetaDb {
    pub fn new(drive_dir: &Path, drive_name: &str) -> Self {
        Self {
            db_path: drive_dir.join(format!("{drive_name}.db")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    /// Create schema and store drive metadata.
    pub fn initialize(&self, meta: &DriveMeta) -> Result<()> {
        let mut conn = self.open()?;
        let tx = conn.transaction().context("begin transaction")?;
        {
            let mut stmt = tx
                .prepare("INSERT OR REPLACE INTO metadata (key, value) VALUES (?1, ?2)")
                .context("prepare metadata insert")?;
            stmt.execute(("chunk_size_mb", meta.chunk_size_mb.to_string()))
                .context("insert chunk_size_mb")?;
            stmt.execute(("total_chunks", meta.total_chunks.to_string()))
                .context("insert total_chunks")?;
            stmt.execute(("fs", meta.fs.to_string())).context("insert fs")?;
        }
        tx.commit().context("commit transaction")?;
        checkpoint(&conn)
    }

    /// Upsert one chunk row.
    pub fn update_chunk(
        &self,
        index: u32,
        hash: &str,
        filename: &str,
        size: u64,
        mtime: f64,
    ) -> Result<()> {
        let conn = self.open()?;
        conn.execute(
            "INSERT OR REPLACE INTO chunks (chunk_index, hash, filename, size, mtime) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
            (index, hash, filename, size as i64, mtime),
        )
        .with_context(|| format!("upsert chunk {index}"))?;
        checkpoint(&conn)
    }

    /// All chunk rows, ordered by index ascending.
    pub fn get_chunks(&self) -> Result<Vec<ChunkRow>> {
        let conn = self.open()?;
        let mut stmt = conn
            .prepare("SELECT chunk_index, hash, filename, size, mtime FROM chunks ORDER BY chunk_index ASC")
            .context("prepare chunks query")?;
        let rows = stmt
            .query_map([], |row| {
                let index: i64 = row.get(0)?;
                let hash: String = row.get(1)?;
                let filename: String = row.get(2)?;
                let size: Option<i64> = row.get(3)?;
                let mtime: Option<f64> = row.get(4)?;
                Ok(ChunkRow {
                    index: index.max(0) as u32,
                    hash,
                    filename,
                    size: size.unwrap_or(0).max(0) as u64,
                    mtime: mtime.unwrap_or(0.0),
                })
            })
            .context("query chunks table")?;
        let mut chunks = Vec::new();
        for row in rows {
            chunks.push(row.context("read chunk row")?);
        }
        Ok(chunks)
    }

    /// Value for a metadata key, or `None` when absent.
    pub fn get_meta(&self, key: &str) -> Result<Option<String>> {
        let conn = self.open()?;
        let value = conn
            .query_row("SELECT value FROM metadata WHERE key = ?1", [key], |row| {
                row.get::<_, String>(0)
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .with_context(|| format!("query metadata key '{key}'"))?;
        Ok(value)
    }

    /// The three drive-level keys, parsed. Fails when any is missing or
    /// malformed (a drive created by this tool always has all three).
    pub fn load_meta(&self) -> Result<DriveMeta> {
        let chunk_size_mb = self
            .require_meta("chunk_size_mb")?
            .parse()
            .context("parse chunk_size_mb")?;
        let total_chunks = self
            .require_meta("total_chunks")?
            .parse()
            .context("parse total_chunks")?;
        let fs = self.require_meta("fs")?.parse().context("parse fs")?;
        Ok(DriveMeta {
            chunk_size_mb,
            total_chunks,
            fs,
        })
    }

    fn require_meta(&self, key: &str) -> Result<String> {
        self.get_meta(key)?
            .with_context(|| format!("metadata key '{key}' missing from {}", self.db_path.display()))
    }

    /// Open or create the DB and ensure WAL mode + schema (idempotent).
    fn open(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)
            .with_context(|| format!("open database at {}", self.db_path.display()))?;
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))
            .with_context(|| format!("enable WAL at {}", self.db_path.display()))?;
        conn.execute_batch(WAL_PRAGMAS)
            .with_context(|| format!("set WAL pragmas at {}", self.db_path.display()))?;
        conn.execute_batch(SCHEMA)
            .with_context(|| format!("create schema at {}", self.db_path.display()))?;
        Ok(conn)
    }
}

/// Truncate the WAL so the `.db` file alone carries the durable state.
fn checkpoint(conn: &Connection) -> Result<()> {
    conn.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))
        .context("WAL checkpoint")?;
    Ok(())
}
