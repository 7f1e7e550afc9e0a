//! Filesystem helpers: mtime age, atomic writes, glob-pattern cleanup.

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{info, warn};

/// Age of a file in seconds since last modification. `None` when the file is
/// missing or unreadable — the caller treats that as infinitely old.
pub fn file_age_seconds(path: &Path) -> Option<u64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    match SystemTime::now().duration_since(modified) {
        Ok(age) => Some(age.as_secs()),
        // mtime in the future (clock skew): treat as just written.
        Err(_) => Some(0),
    }
}

/// Write-then-rename so readers never observe a partial file.
pub fn atomic_write(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let tmp = sibling_tmp_path(path);
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

fn sibling_tmp_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!(".{name}.tmp"))
}

/// Delete regular files in `dir` whose names match any of `patterns`
/// (glob syntax). Returns the count removed.
pub fn remove_matching(dir: &Path, patterns: &[String]) -> usize {
    let mut removed = 0;

    for pattern in patterns {
        let matcher = match glob::Pattern::new(pattern) {
            Ok(m) => m,
            Err(e) => {
                warn!(pattern, error = %e, "invalid lock-file pattern, skipping");
                continue;
            }
        };

        let Ok(entries) = std::fs::read_dir(dir) else {
            return removed;
        };

        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().to_string();
            if matcher.matches(&name) && entry.path().is_file() {
                match std::fs::remove_file(entry.path()) {
                    Ok(()) => {
                        removed += 1;
                        info!(file = %name, "cleared lock file");
                    }
                    Err(e) => warn!(file = %name, error = %e, "failed to clear lock file"),
                }
            }
        }
    }

    removed
}
