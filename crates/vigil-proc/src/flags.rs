//! Single-file sentinel flags under the data directory.
//!
//! Presence is the signal; content is diagnostic: `<ISO8601> <detail>`.
//! Flags are created atomically (write-then-rename), observed, and removed —
//! never mutated in place.

use crate::fsio::atomic_write;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Parsed content of a flag file.
#[derive(Debug, Clone)]
pub struct FlagInfo {
    pub timestamp: Option<DateTime<Utc>>,
    pub detail: Option<String>,
    pub raw: String,
}

fn flag_path(data_dir: &Path, name: &str) -> PathBuf {
    data_dir.join(name)
}

/// Create (or replace) a flag with a timestamped body.
pub fn set(data_dir: &Path, name: &str, detail: &str) -> std::io::Result<()> {
    let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
    let body = if detail.is_empty() {
        format!("{timestamp}\n")
    } else {
        format!("{timestamp} {detail}\n")
    };
    debug!(flag = name, detail, "setting flag");
    atomic_write(&flag_path(data_dir, name), body.as_bytes())
}

/// Whether the flag exists.
pub fn is_set(data_dir: &Path, name: &str) -> bool {
    flag_path(data_dir, name).exists()
}

/// Read and parse a flag. `None` if absent.
pub fn read(data_dir: &Path, name: &str) -> Option<FlagInfo> {
    let raw = std::fs::read_to_string(flag_path(data_dir, name)).ok()?;
    let line = raw.lines().next().unwrap_or("").trim();
    let mut parts = line.splitn(2, ' ');

    let timestamp = parts
        .next()
        .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
        .map(|t| t.with_timezone(&Utc));
    let detail = parts.next().map(|d| d.to_string());

    Some(FlagInfo {
        timestamp,
        detail,
        raw: line.to_string(),
    })
}

/// Remove a flag. Returns `true` if it existed.
pub fn clear(data_dir: &Path, name: &str) -> bool {
    let path = flag_path(data_dir, name);
    match std::fs::remove_file(&path) {
        Ok(()) => {
            debug!(flag = name, "flag cleared");
            true
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
        Err(e) => {
            warn!(flag = name, error = %e, "failed to clear flag");
            false
        }
    }
}
