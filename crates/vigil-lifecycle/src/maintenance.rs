//! Planned maintenance: mode transitions, service degradation, session
//! tracking, and a background duration monitor.
//!
//! Transition machine: `NORMAL → ENTERING → MAINTENANCE → EXITING → NORMAL`,
//! plus `EMERGENCY` which short-circuits the preparatory entry steps. A
//! failed entry rolls back in reverse; exit runs every step and accumulates
//! failures so as much service capacity as possible is restored.

use crate::tasks::{TaskRunReport, TaskRunner};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use uuid::Uuid;
use vigil_proc::fsio::atomic_write;

/// Monitor poll cadence.
const MONITOR_POLL: Duration = Duration::from_secs(1);

/// Bound on joining the monitor thread during EXITING.
const MONITOR_JOIN_BOUND: Duration = Duration::from_secs(5);

/// Warn when actual duration exceeds the estimate by this factor.
const OVERRUN_FACTOR: f64 = 1.5;

// ─── Mode ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceMode {
    Normal,
    Entering,
    Maintenance,
    Exiting,
    Emergency,
}

impl std::fmt::Display for MaintenanceMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Normal => "normal",
            Self::Entering => "entering",
            Self::Maintenance => "maintenance",
            Self::Exiting => "exiting",
            Self::Emergency => "emergency",
        };
        write!(f, "{s}")
    }
}

// ─── Service control seam ────────────────────────────────────────────────────

/// How designated services are degraded, stopped, restored, and probed
/// during a maintenance window. Implemented by the embedding application.
pub trait ServiceController: Send + Sync {
    /// Reduce a degradable service's capacity.
    fn degrade(&self, service: &str) -> bool;
    fn stop(&self, service: &str) -> bool;
    /// Restart a stopped service.
    fn restore(&self, service: &str) -> bool;
    /// Return a degraded service to full capacity.
    fn restore_level(&self, service: &str) -> bool;
    fn is_healthy(&self, service: &str) -> bool;
}

/// Which services fall into which bucket during maintenance.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MaintenancePlan {
    /// Must stay up throughout; validated on entry and exit.
    pub essential: Vec<String>,
    /// Reduced capacity during the window.
    pub degradable: Vec<String>,
    /// Stopped outright during the window.
    pub stoppable: Vec<String>,
    /// Task names whose failure aborts the remaining schedule.
    pub critical_tasks: Vec<String>,
}

// ─── Session records ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub id: Uuid,
    pub reason: String,
    pub started: DateTime<Utc>,
    pub ended: Option<DateTime<Utc>>,
    pub estimated_seconds: Option<u64>,
    pub actual_seconds: Option<u64>,
    pub emergency: bool,
    pub status: String,
    pub tasks_completed: usize,
    pub tasks_failed: usize,
}

/// Live session state while in maintenance.
#[derive(Debug, Clone)]
struct Session {
    id: Uuid,
    reason: String,
    started: DateTime<Utc>,
    estimated_seconds: Option<u64>,
    emergency: bool,
    tasks_completed: usize,
    tasks_failed: usize,
}

/// Status snapshot for operators (`status` surface).
#[derive(Debug, Clone, Serialize)]
pub struct MaintenanceStatus {
    pub mode: MaintenanceMode,
    pub reason: Option<String>,
    pub started: Option<DateTime<Utc>>,
    pub elapsed_seconds: Option<i64>,
    pub estimated_end: Option<DateTime<Utc>>,
    pub degraded: Vec<String>,
    pub stopped: Vec<String>,
    pub tasks_pending: usize,
}

// ─── Monitor ─────────────────────────────────────────────────────────────────

struct Monitor {
    stop: Arc<AtomicBool>,
    handle: std::thread::JoinHandle<()>,
}

// ─── Manager ─────────────────────────────────────────────────────────────────

pub struct MaintenanceManager {
    plan: MaintenancePlan,
    controller: Arc<dyn ServiceController>,
    mode: MaintenanceMode,
    session: Option<Session>,
    degraded: Vec<String>,
    stopped: Vec<String>,
    page_path: PathBuf,
    session_log: PathBuf,
    monitor: Option<Monitor>,
    pub tasks: TaskRunner,
}

impl MaintenanceManager {
    pub fn new(
        plan: MaintenancePlan,
        controller: Arc<dyn ServiceController>,
        data_dir: &Path,
    ) -> Self {
        let mut tasks = TaskRunner::new();
        let critical: Vec<&str> = plan.critical_tasks.iter().map(|s| s.as_str()).collect();
        tasks.set_critical(&critical);

        Self {
            plan,
            controller,
            mode: MaintenanceMode::Normal,
            session: None,
            degraded: Vec::new(),
            stopped: Vec::new(),
            page_path: data_dir.join("maintenance.html"),
            session_log: data_dir.join("maintenance_sessions.json"),
            monitor: None,
            tasks,
        }
    }

    pub fn mode(&self) -> MaintenanceMode {
        self.mode
    }

    /// Enter maintenance. Fails immediately when not in NORMAL mode; a step
    /// failure rolls everything back.
    pub fn enter(
        &mut self,
        reason: &str,
        estimated: Option<Duration>,
        emergency: bool,
    ) -> bool {
        if self.mode != MaintenanceMode::Normal {
            warn!(mode = %self.mode, "already in maintenance transition, entry refused");
            return false;
        }

        info!(reason, emergency, estimated = ?estimated, "entering maintenance mode");
        self.mode = if emergency {
            MaintenanceMode::Emergency
        } else {
            MaintenanceMode::Entering
        };
        self.session = Some(Session {
            id: Uuid::new_v4(),
            reason: reason.to_string(),
            started: Utc::now(),
            estimated_seconds: estimated.map(|d| d.as_secs()),
            emergency,
            tasks_completed: 0,
            tasks_failed: 0,
        });

        let steps: Vec<(&str, fn(&mut Self) -> bool)> = vec![
            ("activate maintenance page", Self::activate_page),
            ("notify maintenance start", Self::notify_start),
            ("degrade non-essential services", Self::degrade_services),
            ("stop non-essential services", Self::stop_services),
            ("validate essential services", Self::validate_essential),
            ("prepare maintenance workspace", Self::prepare_workspace),
        ];

        // Emergency maintenance skips the preparatory steps.
        let steps = if emergency { &steps[4..] } else { &steps[..] };

        for (name, step) in steps.iter().copied() {
            info!(step = name, "maintenance entry step");
            if !step(self) {
                error!(step = name, "maintenance entry step failed, rolling back");
                self.rollback_entry();
                return false;
            }
        }

        self.mode = MaintenanceMode::Maintenance;
        self.start_monitor();
        info!("maintenance mode active");
        true
    }

    /// Run the scheduled tasks. Only valid while in MAINTENANCE mode.
    pub fn execute_tasks(&mut self) -> Option<TaskRunReport> {
        if self.mode != MaintenanceMode::Maintenance {
            error!(mode = %self.mode, "tasks can only run during maintenance mode");
            return None;
        }

        if self.tasks.is_empty() {
            info!("no maintenance tasks scheduled");
            return Some(TaskRunReport::default());
        }

        let report = self.tasks.execute();
        if let Some(session) = &mut self.session {
            session.tasks_completed += report.completed;
            session.tasks_failed += report.failed;
        }
        Some(report)
    }

    /// Exit maintenance and restore normal operation. Every step runs even
    /// when an earlier one fails, so as much capacity as possible returns.
    pub fn exit(&mut self) -> bool {
        if !matches!(
            self.mode,
            MaintenanceMode::Maintenance | MaintenanceMode::Emergency
        ) {
            warn!(mode = %self.mode, "not in maintenance mode, exit refused");
            return false;
        }

        info!("exiting maintenance mode");
        self.mode = MaintenanceMode::Exiting;
        self.stop_monitor();

        let steps: Vec<(&str, fn(&mut Self) -> bool)> = vec![
            ("validate system health", Self::validate_essential),
            ("restore stopped services", Self::restore_stopped),
            ("restore degraded services", Self::restore_degraded),
            ("deactivate maintenance page", Self::deactivate_page),
            ("notify maintenance end", Self::notify_end),
            ("final validation", Self::final_validation),
        ];

        let mut success = true;
        for (name, step) in steps {
            info!(step = name, "maintenance exit step");
            if !step(self) {
                error!(step = name, "maintenance exit step failed");
                success = false;
            }
        }

        let ended = Utc::now();
        if let Some(session) = &self.session {
            let actual = (ended - session.started).num_seconds().max(0) as u64;
            if let Some(estimate) = session.estimated_seconds {
                if estimate > 0 && (actual as f64) > (estimate as f64) * OVERRUN_FACTOR {
                    warn!(
                        actual_seconds = actual,
                        estimated_seconds = estimate,
                        "maintenance overran its estimate by more than 50%"
                    );
                }
            }
            info!(duration_seconds = actual, success, "maintenance session complete");
        }

        self.record_session(ended, success);
        self.session = None;
        self.mode = MaintenanceMode::Normal;
        success
    }

    pub fn status(&self) -> MaintenanceStatus {
        let (reason, started, elapsed, estimated_end) = match &self.session {
            Some(session) => {
                let elapsed = (Utc::now() - session.started).num_seconds();
                let estimated_end = session
                    .estimated_seconds
                    .map(|secs| session.started + chrono::Duration::seconds(secs as i64));
                (
                    Some(session.reason.clone()),
                    Some(session.started),
                    Some(elapsed),
                    estimated_end,
                )
            }
            None => (None, None, None, None),
        };

        MaintenanceStatus {
            mode: self.mode,
            reason,
            started,
            elapsed_seconds: elapsed,
            estimated_end,
            degraded: self.degraded.clone(),
            stopped: self.stopped.clone(),
            tasks_pending: self.tasks.len(),
        }
    }

    /// Completed session history, most recent last.
    pub fn session_history(&self) -> Vec<SessionRecord> {
        std::fs::read_to_string(&self.session_log)
            .ok()
            .and_then(|raw| serde_json::from_str(&raw).ok())
            .unwrap_or_default()
    }

    // ── Entry steps ─────────────────────────────────────────────────────────

    fn activate_page(&mut self) -> bool {
        let reason = self
            .session
            .as_ref()
            .map(|s| s.reason.clone())
            .unwrap_or_default();
        let body = format!(
            "<!DOCTYPE html>\n<html><head><title>Maintenance</title></head>\n\
             <body><h1>Scheduled maintenance in progress</h1>\n\
             <p>{reason}</p></body></html>\n"
        );
        match atomic_write(&self.page_path, body.as_bytes()) {
            Ok(()) => {
                info!(page = %self.page_path.display(), "maintenance page activated");
                true
            }
            Err(e) => {
                error!(error = %e, "failed to activate maintenance page");
                false
            }
        }
    }

    fn deactivate_page(&mut self) -> bool {
        match std::fs::remove_file(&self.page_path) {
            Ok(()) => {
                info!("maintenance page deactivated");
                true
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => true,
            Err(e) => {
                error!(error = %e, "failed to deactivate maintenance page");
                false
            }
        }
    }

    fn notify_start(&mut self) -> bool {
        if let Some(session) = &self.session {
            info!(reason = %session.reason, "MAINTENANCE NOTIFICATION: started");
        }
        true
    }

    fn notify_end(&mut self) -> bool {
        if let Some(session) = &self.session {
            let minutes = (Utc::now() - session.started).num_seconds() as f64 / 60.0;
            info!(minutes, "MAINTENANCE NOTIFICATION: completed");
        }
        true
    }

    fn degrade_services(&mut self) -> bool {
        for service in self.plan.degradable.clone() {
            if self.controller.degrade(&service) {
                info!(service = %service, "service degraded");
                self.degraded.push(service);
            } else {
                error!(service = %service, "failed to degrade service");
            }
        }
        true
    }

    fn stop_services(&mut self) -> bool {
        for service in self.plan.stoppable.clone() {
            if self.controller.stop(&service) {
                info!(service = %service, "service stopped");
                self.stopped.push(service);
            } else {
                error!(service = %service, "failed to stop service");
            }
        }
        true
    }

    fn restore_stopped(&mut self) -> bool {
        let mut all_ok = true;
        // Reverse of stop order.
        for service in std::mem::take(&mut self.stopped).into_iter().rev() {
            if self.controller.restore(&service) {
                info!(service = %service, "service restored");
            } else {
                error!(service = %service, "failed to restore service");
                all_ok = false;
            }
        }
        all_ok
    }

    fn restore_degraded(&mut self) -> bool {
        let mut all_ok = true;
        for service in std::mem::take(&mut self.degraded).into_iter().rev() {
            if self.controller.restore_level(&service) {
                info!(service = %service, "service level restored");
            } else {
                error!(service = %service, "failed to restore service level");
                all_ok = false;
            }
        }
        all_ok
    }

    fn validate_essential(&mut self) -> bool {
        for service in &self.plan.essential {
            if !self.controller.is_healthy(service) {
                error!(service = %service, "essential service unhealthy");
                return false;
            }
        }
        true
    }

    fn prepare_workspace(&mut self) -> bool {
        let workspace = self
            .page_path
            .parent()
            .map(|p| p.join("maintenance"))
            .unwrap_or_else(|| PathBuf::from("maintenance"));
        match std::fs::create_dir_all(&workspace) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "failed to prepare maintenance workspace");
                false
            }
        }
    }

    fn final_validation(&mut self) -> bool {
        self.degraded.is_empty() && self.stopped.is_empty() && !self.page_path.exists()
    }

    fn rollback_entry(&mut self) {
        let _ = self.restore_stopped();
        let _ = self.restore_degraded();
        let _ = self.deactivate_page();
        self.session = None;
        self.mode = MaintenanceMode::Normal;
        info!("maintenance entry rolled back");
    }

    // ── Monitor thread ──────────────────────────────────────────────────────

    fn start_monitor(&mut self) {
        let Some(session) = &self.session else {
            return;
        };

        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let started = session.started;
        let estimate = session.estimated_seconds;
        let controller = Arc::clone(&self.controller);
        let essential = self.plan.essential.clone();

        let handle = std::thread::spawn(move || {
            let mut overrun_warned = false;
            while !stop_flag.load(Ordering::Relaxed) {
                if let Some(estimate) = estimate {
                    let elapsed = (Utc::now() - started).num_seconds().max(0) as f64;
                    if !overrun_warned && estimate > 0 && elapsed > estimate as f64 * OVERRUN_FACTOR
                    {
                        warn!(
                            elapsed_seconds = elapsed,
                            estimated_seconds = estimate,
                            "maintenance duration exceeded estimate significantly"
                        );
                        overrun_warned = true;
                    }
                }

                for service in &essential {
                    if !controller.is_healthy(service) {
                        error!(service = %service, "essential service failed during maintenance");
                    }
                }

                std::thread::sleep(MONITOR_POLL);
            }
        });

        self.monitor = Some(Monitor { stop, handle });
    }

    fn stop_monitor(&mut self) {
        let Some(monitor) = self.monitor.take() else {
            return;
        };

        monitor.stop.store(true, Ordering::Relaxed);

        let deadline = Instant::now() + MONITOR_JOIN_BOUND;
        while !monitor.handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("maintenance monitor did not stop within bound, detaching");
                return;
            }
            std::thread::sleep(Duration::from_millis(25));
        }
        let _ = monitor.handle.join();
    }

    // ── Session log ─────────────────────────────────────────────────────────

    fn record_session(&mut self, ended: DateTime<Utc>, success: bool) {
        let Some(session) = &self.session else {
            return;
        };

        let mut history = self.session_history();
        history.push(SessionRecord {
            id: session.id,
            reason: session.reason.clone(),
            started: session.started,
            ended: Some(ended),
            estimated_seconds: session.estimated_seconds,
            actual_seconds: Some((ended - session.started).num_seconds().max(0) as u64),
            emergency: session.emergency,
            status: if success { "completed" } else { "failed" }.to_string(),
            tasks_completed: session.tasks_completed,
            tasks_failed: session.tasks_failed,
        });

        match serde_json::to_vec_pretty(&history) {
            Ok(body) => {
                if let Err(e) = atomic_write(&self.session_log, &body) {
                    warn!(error = %e, "failed to persist maintenance session record");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize maintenance session record"),
        }
    }
}
