//! The health watchdog: one tick = one health evaluation and at most one
//! recovery.
//!
//! Runs as a separate process from the service it guards, so it can observe
//! and recover from crashes the service cannot report itself. Designed for an
//! external scheduler invoking `--once` every 60 seconds; an internal loop
//! with the same cadence exists for development.

#![forbid(unsafe_code)]

use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};
use vigil_crashlog::CrashLog;
use vigil_proc::ServiceHost;
use vigil_recovery::{Escalator, RecoveryError, auto_revert_enabled};

/// Retention for the crash event log, pruned opportunistically on healthy ticks.
const EVENT_RETENTION_SECONDS: u64 = 86_400;

/// Soft cap on a single tick; an overrunning tick finishes its current
/// primitive and returns.
const TICK_SOFT_CAP: Duration = Duration::from_secs(30);

/// Crashes in the window at which the watchdog stops acting and alerts.
const ALERT_CRASH_COUNT: usize = 5;

// ─── Thresholds ──────────────────────────────────────────────────────────────

/// Watchdog cadence and freshness thresholds with environment overrides.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogThresholds {
    /// Seconds between ticks in loop mode.
    pub interval_seconds: u64,
    /// Log writes older than this are stale.
    pub log_staleness_seconds: u64,
}

impl Default for WatchdogThresholds {
    fn default() -> Self {
        Self {
            interval_seconds: 60,
            log_staleness_seconds: 300,
        }
    }
}

impl WatchdogThresholds {
    /// Defaults overridden by `WATCHDOG_INTERVAL_SECONDS` /
    /// `LOG_STALENESS_THRESHOLD_SECONDS`.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut thresholds = Self::default();
        if let Some(interval) = lookup("WATCHDOG_INTERVAL_SECONDS")
            .and_then(|v| v.trim().parse().ok())
        {
            thresholds.interval_seconds = interval;
        }
        if let Some(staleness) = lookup("LOG_STALENESS_THRESHOLD_SECONDS")
            .and_then(|v| v.trim().parse().ok())
        {
            thresholds.log_staleness_seconds = staleness;
        }
        thresholds
    }
}

// ─── Assessment ──────────────────────────────────────────────────────────────

/// One tick's health verdict. Produced, consumed by the escalator, discarded.
#[derive(Debug, Clone, Serialize)]
pub struct HealthAssessment {
    pub healthy: bool,
    pub process_running: bool,
    pub logs_fresh: bool,
    pub no_crash_pattern: bool,
    pub issues: Vec<String>,
    /// 0 = healthy, 1-5 = escalation level needed.
    pub recovery_level: u8,
}

/// Assess service health and pick the minimum recovery level.
pub fn assess(
    host: &dyn ServiceHost,
    crashlog: &CrashLog,
    thresholds: &WatchdogThresholds,
) -> HealthAssessment {
    let mut issues = Vec::new();
    let mut recovery_level: u8 = 0;

    let status = host.status();
    if !status.running {
        issues.push("service process not running".to_string());
        recovery_level = recovery_level.max(1);
    }

    let logs_fresh = matches!(
        host.log_age_seconds(),
        Some(age) if age < thresholds.log_staleness_seconds
    );
    if status.running && !logs_fresh {
        issues.push(format!(
            "service logs stale (no activity in {}+ seconds)",
            thresholds.log_staleness_seconds
        ));
        recovery_level = recovery_level.max(2);
    }

    let head = host.head_commit();
    let pattern = crashlog.detect_pattern(&head);
    if pattern.found {
        issues.push(format!(
            "crash pattern detected (commit: {})",
            pattern.suspect_commit.as_deref().unwrap_or("unknown")
        ));
        // Level 4 is gated: without auto-revert the ladder stops at 3.
        if auto_revert_enabled(&host.spec().data_dir) {
            recovery_level = recovery_level.max(4);
        } else {
            recovery_level = recovery_level.max(3);
        }
    }

    let recent = crashlog.recent_crashes(crashlog.thresholds().window_seconds);
    if recent.len() >= ALERT_CRASH_COUNT {
        issues.push(format!("{} crashes in last 30 minutes", recent.len()));
        recovery_level = recovery_level.max(5);
    }

    HealthAssessment {
        healthy: issues.is_empty(),
        process_running: status.running,
        logs_fresh,
        no_crash_pattern: !pattern.found,
        issues,
        recovery_level,
    }
}

// ─── Watchdog ────────────────────────────────────────────────────────────────

/// Outcome of a single watchdog tick.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickOutcome {
    /// A fresh recovery lock was present; nothing was done.
    Skipped,
    Healthy,
    Recovered { level: u8 },
    /// Level 5 reached — a human now owns the problem.
    HandedOff { level: u8 },
    Failed { level: u8 },
}

impl TickOutcome {
    /// Exit-code semantics: healthy or recovered (or deferring to an
    /// in-flight recovery) counts as success.
    pub fn is_ok(&self) -> bool {
        matches!(
            self,
            Self::Healthy | Self::Recovered { .. } | Self::Skipped
        )
    }
}

/// Drives assess → escalate → record on each tick.
pub struct Watchdog {
    host: Arc<dyn ServiceHost>,
    crashlog: CrashLog,
    escalator: Escalator,
    thresholds: WatchdogThresholds,
}

impl Watchdog {
    pub fn new(host: Arc<dyn ServiceHost>, escalator: Escalator) -> Self {
        let data_dir = host.spec().data_dir.clone();
        Self {
            crashlog: CrashLog::new(&data_dir),
            host,
            escalator,
            thresholds: WatchdogThresholds::from_env(),
        }
    }

    pub fn with_thresholds(mut self, thresholds: WatchdogThresholds) -> Self {
        self.thresholds = thresholds;
        self
    }

    pub fn thresholds(&self) -> &WatchdogThresholds {
        &self.thresholds
    }

    /// Assess without acting (the `--check-only` surface).
    pub fn check(&self) -> HealthAssessment {
        assess(self.host.as_ref(), &self.crashlog, &self.thresholds)
    }

    /// One health check cycle: assess, recover if needed, record.
    pub fn tick(&mut self) -> TickOutcome {
        let started = Instant::now();

        if self.escalator.lock().is_busy() {
            debug!("recovery in progress, skipping tick");
            return TickOutcome::Skipped;
        }

        let assessment = self.check();

        if assessment.healthy {
            debug!("service healthy");
            let pruned = self.crashlog.prune(EVENT_RETENTION_SECONDS);
            if pruned > 0 {
                debug!(pruned, "pruned old crash events");
            }
            return TickOutcome::Healthy;
        }

        warn!(
            issues = ?assessment.issues,
            level = assessment.recovery_level,
            "service unhealthy"
        );

        let outcome = match self
            .escalator
            .execute(assessment.recovery_level, &assessment.issues)
        {
            Ok(outcome) => outcome,
            Err(RecoveryError::BusyOrStale) => {
                debug!("lost recovery lock race, skipping tick");
                return TickOutcome::Skipped;
            }
        };

        let elapsed = started.elapsed();
        if elapsed > TICK_SOFT_CAP {
            warn!(elapsed_secs = elapsed.as_secs(), "tick exceeded soft cap");
        }

        if outcome.recovered {
            info!(level = outcome.level, "recovery successful");
            TickOutcome::Recovered {
                level: outcome.level,
            }
        } else if outcome.handed_off {
            TickOutcome::HandedOff {
                level: outcome.level,
            }
        } else {
            error!(level = outcome.level, "recovery failed");
            TickOutcome::Failed {
                level: outcome.level,
            }
        }
    }

    /// Continuous mode: tick, then sleep the configured interval, observing
    /// the shutdown flag between short sleeps so SIGTERM is honored promptly.
    /// A tick in progress when the flag flips completes before the loop exits.
    pub fn run_loop(&mut self, shutdown: &AtomicBool) {
        info!(
            interval = self.thresholds.interval_seconds,
            "starting watchdog loop"
        );

        while !shutdown.load(Ordering::Relaxed) {
            let outcome = self.tick();
            debug!(?outcome, "tick complete");

            let deadline =
                Instant::now() + Duration::from_secs(self.thresholds.interval_seconds);
            while Instant::now() < deadline {
                if shutdown.load(Ordering::Relaxed) {
                    info!("shutdown requested, stopping watchdog loop");
                    return;
                }
                std::thread::sleep(Duration::from_millis(250));
            }
        }

        info!("shutdown requested, stopping watchdog loop");
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
