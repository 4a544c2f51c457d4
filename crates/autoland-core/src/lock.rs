//! Exclusive lock files for working directories.
//!
//! A pusher instance owns one numbered working directory at a time; the
//! classifier owns a single fixed one. Ownership is a `.lock` file created
//! with `create_new`, so two processes racing for the same directory
//! cannot both win. The lock file carries holder metadata for operators
//! chasing a stuck instance.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const LOCK_FILE: &str = ".lock";

/// Metadata stored in the lock file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub hostname: String,
    pub acquired_at: DateTime<Utc>,
}

/// Held lock; released on drop.
#[derive(Debug)]
pub struct LockFile {
    path: PathBuf,
    held: bool,
}

impl LockFile {
    /// Acquire the lock for `dir`, creating the directory if needed.
    /// Fails if another holder already has it.
    pub fn acquire(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating lock dir {}", dir.display()))?;
        let path = dir.join(LOCK_FILE);

        let info = LockInfo {
            pid: std::process::id(),
            hostname: gethostname::gethostname().to_string_lossy().to_string(),
            acquired_at: Utc::now(),
        };

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => {
                serde_json::to_writer_pretty(&file, &info).context("writing lock info")?;
                file.sync_all().context("syncing lock file")?;
                Ok(Self { path, held: true })
            }
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                match Self::read_info(dir) {
                    Ok(existing) => bail!(
                        "lock already held by pid {} on {} since {}",
                        existing.pid,
                        existing.hostname,
                        existing.acquired_at
                    ),
                    Err(_) => bail!("lock already held at {}", path.display()),
                }
            }
            Err(e) => {
                Err(e).with_context(|| format!("creating lock file {}", path.display()))
            }
        }
    }

    pub fn release(&mut self) -> Result<()> {
        if self.held && self.path.exists() {
            fs::remove_file(&self.path)
                .with_context(|| format!("removing lock file {}", self.path.display()))?;
        }
        self.held = false;
        Ok(())
    }

    pub fn is_locked(dir: &Path) -> bool {
        dir.join(LOCK_FILE).exists()
    }

    pub fn read_info(dir: &Path) -> Result<LockInfo> {
        let path = dir.join(LOCK_FILE);
        let content = fs::read_to_string(&path)
            .with_context(|| format!("reading lock file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("parsing lock JSON from {}", path.display()))
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        // Best effort; a crashed process leaves the file for the operator.
        let _ = self.release();
    }
}
