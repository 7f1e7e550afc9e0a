//! The update orchestrator: pull source, sync dependencies, verify the
//! environment, hand off to a service restart.
//!
//! Two calling conventions share one pipeline:
//! - **full** — human-invoked; all steps, restarts the service in-process.
//! - **cron** — unattended; minimal steps, never restarts the service, sets
//!   the `restart-requested` flag for the service to honor at a safe point.
//!
//! Critical dependency pins are never applied unattended: a cron run that
//! sees one changes sets `upgrade-pending` and leaves the environment alone.

#![forbid(unsafe_code)]

pub mod deps;
pub mod plan;
pub mod verify;

use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use vigil_proc::git::{GitRepo, PullOutcome};
use vigil_proc::{ServiceHost, flags};

pub use deps::{DepSyncOutcome, VersionCheck};
pub use plan::{ModelCheck, SyncCommand, UpdatePlan};
pub use verify::{ToolCheck, VerificationOutcome};

/// Flag: a critical dep change was detected; a human must apply it.
pub const UPGRADE_PENDING_FLAG: &str = "upgrade-pending";

/// Flag: commits were pulled; the service should restart cooperatively.
pub const RESTART_REQUESTED_FLAG: &str = "restart-requested";

/// Reason recorded when the critical-dep interlock engages.
pub const CRITICAL_UPGRADE_REASON: &str = "critical-dep-upgrade";

// ─── Configuration ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateMode {
    Full,
    Cron,
    Verify,
}

/// What this run does, derived from the calling convention.
#[derive(Debug, Clone)]
pub struct UpdateConfig {
    pub mode: UpdateMode,
    pub do_git_pull: bool,
    pub do_dep_sync: bool,
    pub do_service_restart: bool,
    pub do_verify: bool,
    /// Model + credentials probes (full/verify only).
    pub do_full_checks: bool,
    /// Sync even when no dependency file changed. Full mode forces this so a
    /// held critical upgrade can actually be applied by a human.
    pub force_dep_sync: bool,
}

impl UpdateConfig {
    pub fn full() -> Self {
        Self {
            mode: UpdateMode::Full,
            do_git_pull: true,
            do_dep_sync: true,
            do_service_restart: true,
            do_verify: true,
            do_full_checks: true,
            force_dep_sync: true,
        }
    }

    pub fn cron() -> Self {
        Self {
            mode: UpdateMode::Cron,
            do_git_pull: true,
            do_dep_sync: true,
            do_service_restart: false,
            do_verify: false,
            do_full_checks: false,
            force_dep_sync: false,
        }
    }

    pub fn verify_only() -> Self {
        Self {
            mode: UpdateMode::Verify,
            do_git_pull: false,
            do_dep_sync: false,
            do_service_restart: false,
            do_verify: true,
            do_full_checks: true,
            force_dep_sync: false,
        }
    }
}

// ─── Report ──────────────────────────────────────────────────────────────────

/// Git step summary with short SHAs for human and JSON output.
#[derive(Debug, Clone, Serialize)]
pub struct GitSummary {
    pub success: bool,
    pub before: String,
    pub after: String,
    pub commit_count: usize,
    pub commits: Vec<String>,
    pub stashed: bool,
    pub stash_restored: bool,
    pub error: Option<String>,
}

impl From<&PullOutcome> for GitSummary {
    fn from(pull: &PullOutcome) -> Self {
        Self {
            success: pull.success,
            before: short(&pull.before),
            after: short(&pull.after),
            commit_count: pull.commit_count(),
            commits: pull.commits.clone(),
            stashed: pull.stashed,
            stash_restored: pull.stash_restored,
            error: pull.error.clone(),
        }
    }
}

fn short(sha: &str) -> String {
    sha.chars().take(8).collect()
}

#[derive(Debug, Clone, Serialize)]
pub struct ServiceOutcome {
    pub running: bool,
    pub pid: Option<u32>,
}

/// Overall classification of an update run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    Success,
    Warning,
    Failure,
}

/// Composable result tree for one update run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateReport {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
    pub git: Option<GitSummary>,
    pub deps: Option<DepSyncOutcome>,
    pub versions: Vec<VersionCheck>,
    pub verification: Option<VerificationOutcome>,
    pub service: Option<ServiceOutcome>,
    /// Raw body of `upgrade-pending` when the interlock is engaged.
    pub upgrade_pending: Option<String>,
}

impl UpdateReport {
    pub fn status(&self) -> UpdateStatus {
        if !self.errors.is_empty() {
            UpdateStatus::Failure
        } else if !self.warnings.is_empty() {
            UpdateStatus::Warning
        } else {
            UpdateStatus::Success
        }
    }

    /// 0 only when every step succeeded without warnings.
    pub fn exit_code(&self) -> i32 {
        match self.status() {
            UpdateStatus::Success => 0,
            UpdateStatus::Warning | UpdateStatus::Failure => 1,
        }
    }
}

// ─── Flag helpers ────────────────────────────────────────────────────────────

/// Read the pending-upgrade flag, if present.
pub fn pending_upgrade(data_dir: &std::path::Path) -> Option<flags::FlagInfo> {
    flags::read(data_dir, UPGRADE_PENDING_FLAG)
}

pub fn set_upgrade_pending(data_dir: &std::path::Path, reason: &str) {
    if let Err(e) = flags::set(data_dir, UPGRADE_PENDING_FLAG, reason) {
        warn!(error = %e, "failed to set upgrade-pending flag");
    }
}

pub fn clear_upgrade_pending(data_dir: &std::path::Path) -> bool {
    flags::clear(data_dir, UPGRADE_PENDING_FLAG)
}

pub fn set_restart_requested(data_dir: &std::path::Path, commit_count: usize) {
    let detail = format!("{commit_count} commit(s)");
    if let Err(e) = flags::set(data_dir, RESTART_REQUESTED_FLAG, &detail) {
        warn!(error = %e, "failed to set restart-requested flag");
    }
}

// ─── Updater ─────────────────────────────────────────────────────────────────

/// Post-restart probe cadence.
#[derive(Debug, Clone, Copy)]
pub struct ProbeTiming {
    pub window: Duration,
    pub interval: Duration,
}

impl Default for ProbeTiming {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10),
            interval: Duration::from_secs(1),
        }
    }
}

impl ProbeTiming {
    pub fn fast() -> Self {
        Self {
            window: Duration::from_millis(50),
            interval: Duration::from_millis(5),
        }
    }
}

/// Runs the pull → dep-sync → verify → restart pipeline.
pub struct Updater {
    host: Arc<dyn ServiceHost>,
    repo: GitRepo,
    plan: UpdatePlan,
    probe: ProbeTiming,
}

impl Updater {
    pub fn new(host: Arc<dyn ServiceHost>, plan: UpdatePlan) -> Self {
        let repo = GitRepo::new(&host.spec().repo_dir);
        Self {
            host,
            repo,
            plan,
            probe: ProbeTiming::default(),
        }
    }

    pub fn with_probe(mut self, probe: ProbeTiming) -> Self {
        self.probe = probe;
        self
    }

    pub fn run(&self, config: &UpdateConfig) -> UpdateReport {
        let mut report = UpdateReport::default();
        let data_dir = self.host.spec().data_dir.clone();
        let mut pull: Option<PullOutcome> = None;

        // Step 1: git pull. A pull failure aborts — nothing downstream is
        // meaningful against unknown source state.
        if config.do_git_pull {
            info!("pulling latest changes");
            let outcome = self.repo.pull_ff();
            report.git = Some(GitSummary::from(&outcome));

            if !outcome.success {
                let error = outcome
                    .error
                    .clone()
                    .unwrap_or_else(|| "git pull failed".to_string());
                report.errors.push(error);
                return report;
            }

            if outcome.commit_count() == 0 {
                info!(head = %short(&outcome.after), "already up to date");
            } else {
                info!(commits = outcome.commit_count(), "pulled commits");
                for line in outcome.commits.iter().take(5) {
                    info!("  {line}");
                }
            }

            if outcome.stashed && !outcome.stash_restored {
                report
                    .warnings
                    .push("local changes stashed but failed to restore".to_string());
            }

            pull = Some(outcome);
        }

        // Step 2: surface a pending critical upgrade prominently.
        let pending = pending_upgrade(&data_dir);
        if let Some(info) = &pending {
            warn!(since = %info.raw, "critical dependency upgrade pending");
            report.upgrade_pending = Some(info.raw.clone());
            report
                .warnings
                .push(format!("critical upgrade pending: {}", info.raw));
        }

        // Step 3: dependency sync with the critical-dep interlock.
        let mut synced_ok = false;
        if config.do_dep_sync {
            let mut should_sync = config.force_dep_sync;

            if let Some(pull) = pull.as_ref().filter(|p| p.commit_count() > 0) {
                let changed = self.repo.changed_paths(&pull.before, &pull.after);

                if deps::dep_files_changed(&self.plan, &changed) {
                    let diff =
                        self.repo
                            .diff_scoped(&pull.before, &pull.after, &self.plan.pin_file);
                    let critical = deps::critical_changes(&diff, &self.plan.critical_deps);

                    if critical.is_empty() {
                        should_sync = true;
                    } else {
                        warn!(changes = ?critical, "critical dependency changes detected, holding sync");
                        set_upgrade_pending(&data_dir, CRITICAL_UPGRADE_REASON);
                        report.warnings.push(
                            "critical dependency change held for supervised upgrade".to_string(),
                        );
                        // An unattended run must not apply this, forced or not.
                        should_sync = false;
                    }
                }
            }

            if should_sync {
                info!("syncing dependencies");
                let outcome = deps::sync_dependencies(&self.plan, self.repo.dir());
                synced_ok = outcome.success;

                if !outcome.success {
                    report.warnings.push(format!(
                        "dep sync failed: {}",
                        outcome.error.as_deref().unwrap_or("unknown")
                    ));
                }
                report.deps = Some(outcome);

                report.versions = deps::verify_critical_versions(&self.plan, self.repo.dir());
                for check in report.versions.iter().filter(|v| !v.matches) {
                    report.warnings.push(format!(
                        "{} version mismatch: {} != {}",
                        check.package,
                        check.installed.as_deref().unwrap_or("absent"),
                        check.pinned.as_deref().unwrap_or("unpinned"),
                    ));
                }
            } else {
                debug!("no dependency changes, skipping sync");
            }
        }

        // Step 4: environment verification. Soft: warnings only.
        if config.do_verify {
            info!("verifying environment");
            let verification = verify::verify_environment(&self.plan, config.do_full_checks);
            report.warnings.extend(verification.warnings());
            report.verification = Some(verification);
        }

        // Step 5: restart in-process (full) or request one cooperatively (cron).
        if config.do_service_restart {
            info!("restarting service");
            if !self.host.restart() {
                report
                    .warnings
                    .push("service restart reported failure".to_string());
            }

            let running = self.probe_running();
            let status = self.host.status();
            if !running {
                report
                    .warnings
                    .push("service not running after restart".to_string());
            }
            report.service = Some(ServiceOutcome {
                running,
                pid: status.pid,
            });
        } else if let Some(pull) = pull.as_ref().filter(|p| p.commit_count() > 0) {
            info!(commits = pull.commit_count(), "requesting cooperative restart");
            set_restart_requested(&data_dir, pull.commit_count());
        }

        // The interlock is released only by a supervised run that actually
        // applied the change and verified the pins.
        if config.mode == UpdateMode::Full
            && pending.is_some()
            && synced_ok
            && report.versions.iter().all(|v| v.matches)
        {
            clear_upgrade_pending(&data_dir);
            info!("pending critical upgrade applied, flag cleared");
        }

        report
    }

    fn probe_running(&self) -> bool {
        let deadline = Instant::now() + self.probe.window;
        loop {
            if self.host.status().running {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(self.probe.interval);
        }
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
