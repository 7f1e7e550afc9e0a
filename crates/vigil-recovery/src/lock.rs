//! The recovery lock: a filesystem sentinel that serializes recoveries.
//!
//! Presence is authoritative — nothing starts a recovery while a fresh lock
//! exists. The claim itself uses `O_EXCL` creation so two racing supervisors
//! cannot both win. A lock older than the TTL is abandoned and reclaimable.

use crate::RecoveryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use vigil_proc::fsio;

/// File name of the lock under the service data directory.
pub const RECOVERY_LOCK_FILE: &str = "recovery-in-progress";

/// A lock older than this is treated as abandoned.
pub const LOCK_TTL: Duration = Duration::from_secs(300);

/// Persisted lock body. Diagnostic only — presence is the lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockContents {
    pub level: u8,
    pub started: String,
    pub issues: Vec<String>,
}

/// Handle to the lock location.
#[derive(Debug, Clone)]
pub struct RecoveryLock {
    path: PathBuf,
    ttl: Duration,
}

impl RecoveryLock {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            path: data_dir.join(RECOVERY_LOCK_FILE),
            ttl: LOCK_TTL,
        }
    }

    pub fn with_ttl(data_dir: &Path, ttl: Duration) -> Self {
        Self {
            path: data_dir.join(RECOVERY_LOCK_FILE),
            ttl,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seconds since the lock was written, `None` when absent.
    ///
    /// Prefers the `started` timestamp in the body; falls back to file mtime
    /// when the body is unparseable.
    fn age_seconds(&self) -> Option<u64> {
        let raw = std::fs::read_to_string(&self.path).ok()?;

        let from_body = serde_json::from_str::<LockContents>(&raw)
            .ok()
            .and_then(|c| DateTime::parse_from_rfc3339(&c.started).ok())
            .map(|started| {
                (Utc::now() - started.with_timezone(&Utc))
                    .num_seconds()
                    .max(0) as u64
            });

        from_body.or_else(|| fsio::file_age_seconds(&self.path))
    }

    /// Whether a fresh lock is present. A stale lock found here is removed.
    pub fn is_busy(&self) -> bool {
        match self.age_seconds() {
            None => false,
            Some(age) if age < self.ttl.as_secs() => true,
            Some(age) => {
                warn!(age, "removing stale recovery lock");
                let _ = std::fs::remove_file(&self.path);
                false
            }
        }
    }

    /// Claim the lock. Fails with [`RecoveryError::BusyOrStale`] when a fresh
    /// lock exists or another claimant wins the race.
    pub fn acquire(&self, level: u8, issues: &[String]) -> Result<LockGuard, RecoveryError> {
        if self.is_busy() {
            debug!(path = %self.path.display(), "recovery lock busy");
            return Err(RecoveryError::BusyOrStale);
        }

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|_| RecoveryError::BusyOrStale)?;
        }

        // O_EXCL creation is the atomic claim; the body is diagnostic.
        let file = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path);

        match file {
            Ok(file) => {
                let contents = LockContents {
                    level,
                    started: Utc::now().to_rfc3339(),
                    issues: issues.to_vec(),
                };
                let body = serde_json::to_string(&contents).unwrap_or_default();
                use std::io::Write;
                let mut file = file;
                let _ = file.write_all(body.as_bytes());
                debug!(level, path = %self.path.display(), "recovery lock acquired");
                Ok(LockGuard {
                    path: self.path.clone(),
                })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(RecoveryError::BusyOrStale)
            }
            Err(e) => {
                warn!(error = %e, "failed to create recovery lock");
                Err(RecoveryError::BusyOrStale)
            }
        }
    }
}

/// RAII guard: the lock file is removed when this drops, so the lock is
/// released on every exit path, success or failure.
pub struct LockGuard {
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to release recovery lock");
            }
        }
    }
}
