//! Crash correlation: an append-only start/crash event log plus a detector
//! that ties crash storms to a freshly-landed commit.
//!
//! Each event is one JSON line in `crash_history.jsonl`. Records are never
//! mutated; pruning rewrites the file without the expired lines. A corrupt
//! line is skipped on read, so a damaged log degrades to "no pattern
//! detected" rather than a false alarm.

#![forbid(unsafe_code)]

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, warn};
use vigil_proc::CommitInfo;
use vigil_proc::fsio::atomic_write;

/// File name of the event log under the service data directory.
pub const CRASH_HISTORY_FILE: &str = "crash_history.jsonl";

// ─── Events ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Start,
    Crash,
}

/// Commit age in seconds. Serializes as a JSON number, or the string `"inf"`
/// when the age is unknown (no repo, detached environment).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CommitAge(pub Option<f64>);

impl CommitAge {
    pub fn seconds(&self) -> Option<f64> {
        self.0
    }
}

impl From<&CommitInfo> for CommitAge {
    fn from(info: &CommitInfo) -> Self {
        Self(info.age_seconds.map(|a| a as f64))
    }
}

impl Serialize for CommitAge {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self.0 {
            Some(age) => serializer.serialize_f64(age),
            None => serializer.serialize_str("inf"),
        }
    }
}

impl<'de> Deserialize<'de> for CommitAge {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(f64),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(age) if age.is_finite() => Ok(Self(Some(age))),
            Raw::Number(_) => Ok(Self(None)),
            Raw::Text(s) if s == "inf" => Ok(Self(None)),
            Raw::Text(s) => Err(D::Error::custom(format!("bad commit age: {s}"))),
        }
    }
}

/// One start or crash event, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrashEvent {
    /// Epoch seconds at event time.
    pub timestamp: f64,
    pub event_type: EventKind,
    /// Short (8 hex) SHA of the supervised repo's HEAD, or `"unknown"`.
    pub commit_sha: String,
    pub commit_age_seconds: CommitAge,
    pub reason: Option<String>,
}

// ─── Thresholds ──────────────────────────────────────────────────────────────

/// Pattern-detection thresholds with environment overrides.
#[derive(Debug, Clone, Copy)]
pub struct CrashThresholds {
    /// Window for counting crashes (seconds).
    pub window_seconds: u64,
    /// Crashes inside the window needed to trigger detection.
    pub count_threshold: usize,
    /// Only commits younger than this are suspect (seconds).
    pub commit_age_threshold: u64,
}

impl Default for CrashThresholds {
    fn default() -> Self {
        Self {
            window_seconds: 1800,
            count_threshold: 3,
            commit_age_threshold: 3600,
        }
    }
}

impl CrashThresholds {
    /// Defaults overridden by `CRASH_WINDOW_SECONDS` / `CRASH_COUNT_THRESHOLD`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut thresholds = Self::default();
        if let Some(window) = parse_u64(lookup("CRASH_WINDOW_SECONDS")) {
            thresholds.window_seconds = window;
        }
        if let Some(count) = parse_u64(lookup("CRASH_COUNT_THRESHOLD")) {
            thresholds.count_threshold = count as usize;
        }
        thresholds
    }
}

fn parse_u64(value: Option<String>) -> Option<u64> {
    value?.trim().parse().ok()
}

// ─── Pattern detection result ────────────────────────────────────────────────

/// Outcome of [`CrashLog::detect_pattern`].
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub found: bool,
    /// The commit to blame — always the current HEAD, because escalation
    /// reverts walk backwards one step at a time.
    pub suspect_commit: Option<String>,
}

impl Pattern {
    pub fn none() -> Self {
        Self {
            found: false,
            suspect_commit: None,
        }
    }
}

// ─── CrashLog ────────────────────────────────────────────────────────────────

/// Handle to the append-only event log.
pub struct CrashLog {
    path: PathBuf,
    thresholds: CrashThresholds,
}

impl CrashLog {
    pub fn new(data_dir: &Path) -> Self {
        Self::with_thresholds(data_dir, CrashThresholds::from_env())
    }

    pub fn with_thresholds(data_dir: &Path, thresholds: CrashThresholds) -> Self {
        Self {
            path: data_dir.join(CRASH_HISTORY_FILE),
            thresholds,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn thresholds(&self) -> CrashThresholds {
        self.thresholds
    }

    /// Append a service-start event.
    pub fn log_start(&self, head: &CommitInfo) -> CrashEvent {
        self.append(EventKind::Start, head, None)
    }

    /// Append a crash event.
    pub fn log_crash(&self, head: &CommitInfo, reason: Option<&str>) -> CrashEvent {
        self.append(EventKind::Crash, head, reason.map(|r| r.to_string()))
    }

    fn append(&self, kind: EventKind, head: &CommitInfo, reason: Option<String>) -> CrashEvent {
        let event = CrashEvent {
            timestamp: now_epoch(),
            event_type: kind,
            commit_sha: head.sha.clone(),
            commit_age_seconds: CommitAge::from(head),
            reason,
        };

        if let Err(e) = self.append_line(&event) {
            warn!(path = %self.path.display(), error = %e, "failed to append crash event");
        }

        event
    }

    fn append_line(&self, event: &CrashEvent) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let line = serde_json::to_string(event).map_err(std::io::Error::other)?;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{line}")
    }

    /// Events inside the window, oldest first. Unparseable lines are skipped.
    pub fn recent_events(&self, window_seconds: u64) -> Vec<CrashEvent> {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return Vec::new();
        };

        let cutoff = now_epoch() - window_seconds as f64;
        raw.lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str::<CrashEvent>(line) {
                Ok(event) => Some(event),
                Err(e) => {
                    debug!(error = %e, "skipping unparseable event line");
                    None
                }
            })
            .filter(|event| event.timestamp >= cutoff)
            .collect()
    }

    /// Crash events inside the window.
    pub fn recent_crashes(&self, window_seconds: u64) -> Vec<CrashEvent> {
        self.recent_events(window_seconds)
            .into_iter()
            .filter(|e| e.event_type == EventKind::Crash)
            .collect()
    }

    /// Correlate recent crashes with the current HEAD.
    ///
    /// Fires iff the window holds at least `count_threshold` crashes, HEAD is
    /// younger than `commit_age_threshold`, and at least `count_threshold` of
    /// those crashes happened on HEAD.
    pub fn detect_pattern(&self, head: &CommitInfo) -> Pattern {
        let crashes = self.recent_crashes(self.thresholds.window_seconds);
        if crashes.len() < self.thresholds.count_threshold {
            return Pattern::none();
        }

        // An old commit means the storm is not code-correlated.
        match head.age_seconds {
            Some(age) if age <= self.thresholds.commit_age_threshold => {}
            _ => return Pattern::none(),
        }

        let on_head = crashes.iter().filter(|c| c.commit_sha == head.sha).count();
        if on_head >= self.thresholds.count_threshold {
            warn!(
                crashes = on_head,
                commit = %head.sha,
                commit_age = ?head.age_seconds,
                "crash pattern detected"
            );
            return Pattern {
                found: true,
                suspect_commit: Some(head.sha.clone()),
            };
        }

        Pattern::none()
    }

    /// Rewrite the log without events older than `max_age_seconds`.
    /// Returns the number of lines removed.
    pub fn prune(&self, max_age_seconds: u64) -> usize {
        let Ok(raw) = std::fs::read_to_string(&self.path) else {
            return 0;
        };

        let cutoff = now_epoch() - max_age_seconds as f64;
        let mut kept = Vec::new();
        let mut removed = 0usize;

        for line in raw.lines().filter(|l| !l.trim().is_empty()) {
            match serde_json::from_str::<CrashEvent>(line) {
                Ok(event) if event.timestamp >= cutoff => kept.push(line.to_string()),
                _ => removed += 1,
            }
        }

        if removed > 0 {
            let mut body = kept.join("\n");
            if !body.is_empty() {
                body.push('\n');
            }
            if let Err(e) = atomic_write(&self.path, body.as_bytes()) {
                warn!(path = %self.path.display(), error = %e, "failed to prune event log");
                return 0;
            }
            debug!(removed, kept = kept.len(), "pruned crash history");
        }

        removed
    }
}

fn now_epoch() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
