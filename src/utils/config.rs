//! Load the chunkdrive config file and resolve its paths.
//!
//! The file supplies two roots: where chunk directories live and where
//! filesystems get mounted. Both must be absolute or start with `~`; `~`
//! resolves against `$SUDO_USER`'s passwd entry when running under sudo, so
//! `sudo chunkdrive mount x` lands in the invoking user's home rather than
//! root's.

use anyhow::{Context, Result, bail};
use serde::Deserialize;
use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};

/// Default config location; override with `$CHUNKDRIVE_CONFIG`.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/chunkdrive.toml";

#[derive(Debug, Deserialize)]
struct ConfigFile {
    paths: PathsSection,
}

#[derive(Debug, Deserialize)]
struct PathsSection {
    storage_root: String,
    mount_root: String,
}

/// Resolved configuration, passed by value through constructors (no globals).
#[derive(Clone, Debug)]
pub struct Config {
    pub storage_root: PathBuf,
    pub mount_root: PathBuf,
}

impl Config {
    /// Load from `$CHUNKDRIVE_CONFIG` or the default location.
    pub fn load() -> Result<Self> {
        let path = std::env::var("CHUNKDRIVE_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_from(&path)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("read config at {}", path.display()))?;
        let file: ConfigFile = toml::from_str(&raw)
            .with_context(|| format!("parse config at {}", path.display()))?;
        Ok(Self {
            storage_root: resolve_path(&file.paths.storage_root)?,
            mount_root: resolve_path(&file.paths.mount_root)?,
        })
    }
}

/// Expand a leading `~` and require the result to be absolute.
pub fn resolve_path(raw: &str) -> Result<PathBuf> {
    if let Some(rest) = raw.strip_prefix('~') {
        let home = sudo_user_home()
            .or_else(|| std::env::var("HOME").ok().map(PathBuf::from))
            .context("cannot resolve '~': no SUDO_USER passwd entry and no HOME")?;
        return Ok(home.join(rest.trim_start_matches('/')));
    }
    let path = PathBuf::from(raw);
    if !path.is_absolute() {
        bail!("path must be absolute or start with ~: {raw}");
    }
    Ok(path)
}

/// Home directory of `$SUDO_USER` from the passwd database, if set.
fn sudo_user_home() -> Option<PathBuf> {
    let user = std::env::var("SUDO_USER").ok()?;
    let c_user = CString::new(user).ok()?;
    // getpwnam returns a pointer into static storage; copy out before returning
    let pw = unsafe { libc::getpwnam(c_user.as_ptr()) };
    if pw.is_null() {
        return None;
    }
    let dir = unsafe { CStr::from_ptr((*pw).pw_dir) };
    Some(PathBuf::from(dir.to_string_lossy().into_owned()))
}
