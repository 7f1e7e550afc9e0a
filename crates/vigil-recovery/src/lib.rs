//! Recovery escalation for the supervised service.
//!
//! Given a required level 1..5, the escalator runs the cheapest remedial
//! action that should restore the service, with guaranteed lock
//! acquire/release around every attempt:
//!
//! 1. Simple restart
//! 2. Kill stale processes + restart
//! 3. Clear sidecar locks + kill + restart
//! 4. Revert HEAD + level 3 (gated on the auto-revert flag)
//! 5. Alert a human with diagnostics — no automatic action

#![forbid(unsafe_code)]

pub mod alert;
pub mod lock;

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};
use vigil_crashlog::CrashLog;
use vigil_proc::ServiceHost;
use vigil_proc::flags;

pub use alert::{AlertLog, AlertRecord, AlertSeverity, AlertSink, AlertSummary, LogAlertSink};
pub use lock::{LOCK_TTL, LockContents, LockGuard, RECOVERY_LOCK_FILE, RecoveryLock};

/// Flag file permitting level-4 (revert-commit) recovery.
pub const AUTO_REVERT_FLAG: &str = "auto-revert-enabled";

#[derive(Debug, Error)]
pub enum RecoveryError {
    /// A fresh recovery lock is held by another invocation.
    #[error("recovery already in progress")]
    BusyOrStale,
}

/// Whether level-4 recovery is permitted.
///
/// The `AUTO_REVERT_ENABLED` environment variable, when present, overrides
/// the flag file.
pub fn auto_revert_enabled(data_dir: &Path) -> bool {
    match std::env::var("AUTO_REVERT_ENABLED") {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => flags::is_set(data_dir, AUTO_REVERT_FLAG),
    }
}

/// Delays used between and after recovery actions. Production defaults match
/// the service contract; tests shrink them to milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct RecoveryTiming {
    /// Pause between destructive action and restart.
    pub settle: Duration,
    /// How long to poll for the service after a restart.
    pub probe_window: Duration,
    /// Poll cadence within the probe window.
    pub probe_interval: Duration,
}

impl Default for RecoveryTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_secs(2),
            probe_window: Duration::from_secs(10),
            probe_interval: Duration::from_secs(1),
        }
    }
}

impl RecoveryTiming {
    /// Millisecond-scale timing for tests.
    pub fn fast() -> Self {
        Self {
            settle: Duration::from_millis(1),
            probe_window: Duration::from_millis(50),
            probe_interval: Duration::from_millis(5),
        }
    }
}

/// Result record for one escalator run.
#[derive(Debug, Clone, Serialize)]
pub struct RecoveryOutcome {
    /// Level actually executed (may exceed the requested level when the
    /// auto-revert gate escalates 4 → 5).
    pub level: u8,
    /// Levels 1–4: the service was observed running after the attempt.
    /// Level 5 never reports success.
    pub recovered: bool,
    /// Level 5 reached: the problem was handed to a human.
    pub handed_off: bool,
    pub killed: usize,
    pub cleared: usize,
    pub reverted: bool,
    pub issues: Vec<String>,
}

/// Executes recovery levels against a [`ServiceHost`], serialized by the
/// recovery lock.
pub struct Escalator {
    host: Arc<dyn ServiceHost>,
    crashlog: CrashLog,
    sink: Box<dyn AlertSink>,
    alert_to: String,
    lock: RecoveryLock,
    timing: RecoveryTiming,
    alert_log: AlertLog,
}

impl Escalator {
    pub fn new(
        host: Arc<dyn ServiceHost>,
        sink: Box<dyn AlertSink>,
        alert_to: impl Into<String>,
    ) -> Self {
        let data_dir = host.spec().data_dir.clone();
        Self {
            crashlog: CrashLog::new(&data_dir),
            lock: RecoveryLock::new(&data_dir),
            host,
            sink,
            alert_to: alert_to.into(),
            timing: RecoveryTiming::default(),
            alert_log: AlertLog::new(),
        }
    }

    pub fn with_timing(mut self, timing: RecoveryTiming) -> Self {
        self.timing = timing;
        self
    }

    pub fn lock(&self) -> &RecoveryLock {
        &self.lock
    }

    pub fn alert_log(&self) -> &AlertLog {
        &self.alert_log
    }

    /// Run recovery at `level`. Returns [`RecoveryError::BusyOrStale`] when a
    /// fresh lock is held; otherwise the lock is held for the duration and
    /// released on every exit path.
    pub fn execute(
        &mut self,
        level: u8,
        issues: &[String],
    ) -> Result<RecoveryOutcome, RecoveryError> {
        let level = level.clamp(1, 5);
        let _guard = self.lock.acquire(level, issues)?;

        info!(level, issues = ?issues, "executing recovery");
        let outcome = self.run_level(level, issues);

        if outcome.recovered {
            info!(level = outcome.level, "recovery successful");
        } else if outcome.handed_off {
            warn!(level = outcome.level, "recovery handed off to human");
        } else {
            warn!(level = outcome.level, "recovery failed");
        }

        Ok(outcome)
    }

    fn run_level(&mut self, level: u8, issues: &[String]) -> RecoveryOutcome {
        let mut outcome = RecoveryOutcome {
            level,
            recovered: false,
            handed_off: false,
            killed: 0,
            cleared: 0,
            reverted: false,
            issues: issues.to_vec(),
        };

        match level {
            1 => {
                self.restart();
                outcome.recovered = self.probe_running();
            }
            2 => {
                outcome.killed = self.host.kill_stale();
                std::thread::sleep(self.timing.settle);
                self.restart();
                outcome.recovered = self.probe_running();
            }
            3 => {
                outcome.killed = self.host.kill_stale();
                outcome.cleared = self.host.clear_locks();
                std::thread::sleep(self.timing.settle);
                self.restart();
                outcome.recovered = self.probe_running();
            }
            4 => {
                if !auto_revert_enabled(&self.host.spec().data_dir) {
                    warn!("auto-revert not enabled, escalating to level 5");
                    return self.run_level(5, issues);
                }

                outcome.killed = self.host.kill_stale();
                outcome.cleared = self.host.clear_locks();

                match self.host.revert_head() {
                    Ok(()) => {
                        outcome.reverted = true;
                        let message = format!(
                            "Auto-revert triggered for {}\n\nIssues: {}\n\nHEAD reverted to previous commit. Service restarting.",
                            self.host.spec().name,
                            issues.join(", "),
                        );
                        self.dispatch(AlertSeverity::Warning, &message);

                        std::thread::sleep(self.timing.settle);
                        self.restart();
                        outcome.recovered = self.probe_running();
                    }
                    Err(e) => {
                        warn!(error = %e, "revert failed, escalating to level 5");
                        return self.run_level(5, issues);
                    }
                }
            }
            _ => {
                let diagnostic = format!(
                    "Recovery failed for {}\n\nIssues:\n{}\n\nRecovery levels 1-4 exhausted.\nManual intervention required.",
                    self.host.spec().name,
                    issues
                        .iter()
                        .map(|i| format!("- {i}"))
                        .collect::<Vec<_>>()
                        .join("\n"),
                );
                self.dispatch(AlertSeverity::Critical, &diagnostic);

                let head = self.host.head_commit();
                self.crashlog
                    .log_crash(&head, Some("Recovery exhausted - alerting human"));

                outcome.level = 5;
                outcome.handed_off = true;
            }
        }

        outcome
    }

    fn restart(&self) {
        if !self.host.restart() {
            warn!(service = %self.host.spec().name, "service restart reported failure");
        }
    }

    /// Poll for a running service within the probe window.
    fn probe_running(&self) -> bool {
        let deadline = Instant::now() + self.timing.probe_window;
        loop {
            if self.host.status().running {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(self.timing.probe_interval);
        }
    }

    fn dispatch(&mut self, severity: AlertSeverity, message: &str) {
        let delivered = self.sink.send(&self.alert_to, message);
        self.alert_log
            .record(severity, &self.alert_to, message, delivered);
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
