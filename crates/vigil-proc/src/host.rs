//! The supervised-service seam.
//!
//! [`ServiceHost`] is the complete OS-facing surface that the watchdog,
//! escalator, and update orchestrator consume. Production uses
//! [`LocalServiceHost`]; tests swap in an in-memory stub.

use crate::fsio;
use crate::git::{CommitInfo, GitRepo};
use crate::procs;
use crate::service::ServiceManager;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Contract describing the supervised service: how to find it, where it
/// writes, and which sidecar files may be cleared at level 3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceSpec {
    /// Human name used in logs and alerts.
    pub name: String,
    /// Service-manager unit name.
    pub unit: String,
    /// Command-line substring identifying the service's processes.
    pub signature: String,
    /// Working tree of the service's source repository.
    pub repo_dir: PathBuf,
    /// Directory holding the event log, flags, and the recovery lock.
    pub data_dir: PathBuf,
    /// Log file whose mtime indicates liveness.
    pub log_path: PathBuf,
    /// Glob patterns of session/journal/WAL sidecar files cleared at level 3.
    pub lock_patterns: Vec<String>,
}

/// Point-in-time status of the supervised service process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub pid: Option<u32>,
    pub uptime_seconds: Option<u64>,
    pub memory_bytes: Option<u64>,
    pub supervised_installed: bool,
}

impl ServiceStatus {
    pub fn not_running(supervised_installed: bool) -> Self {
        Self {
            running: false,
            pid: None,
            uptime_seconds: None,
            memory_bytes: None,
            supervised_installed,
        }
    }
}

/// Everything a higher component may ask the OS about the supervised service.
pub trait ServiceHost: Send + Sync {
    fn spec(&self) -> &ServiceSpec;

    /// Process discovery plus per-PID stats.
    fn status(&self) -> ServiceStatus;

    /// Restart through the service manager. `false` on failure or when the
    /// unit is not installed.
    fn restart(&self) -> bool;

    /// SIGKILL every process matching the signature. Returns count killed.
    fn kill_stale(&self) -> usize;

    /// Delete sidecar lock files. Returns count removed.
    fn clear_locks(&self) -> usize;

    /// Seconds since the service log was last written; `None` when missing.
    fn log_age_seconds(&self) -> Option<u64>;

    /// HEAD of the supervised repository.
    fn head_commit(&self) -> CommitInfo;

    /// Revert HEAD one step (`git revert HEAD --no-edit`).
    fn revert_head(&self) -> Result<(), String>;
}

/// Production [`ServiceHost`] composing the primitive modules.
pub struct LocalServiceHost {
    spec: ServiceSpec,
    manager: Box<dyn ServiceManager>,
    repo: GitRepo,
}

impl LocalServiceHost {
    pub fn new(spec: ServiceSpec, manager: Box<dyn ServiceManager>) -> Self {
        let repo = GitRepo::new(&spec.repo_dir);
        Self {
            spec,
            manager,
            repo,
        }
    }

    pub fn repo(&self) -> &GitRepo {
        &self.repo
    }
}

impl ServiceHost for LocalServiceHost {
    fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    fn status(&self) -> ServiceStatus {
        let supervised_installed = self.manager.is_installed(&self.spec.unit);
        let pids = procs::find_pids_matching(&self.spec.signature);

        let Some(&pid) = pids.first() else {
            return ServiceStatus::not_running(supervised_installed);
        };

        let stats = procs::stats(pid);
        ServiceStatus {
            running: true,
            pid: Some(pid),
            uptime_seconds: stats.map(|s| s.uptime_seconds),
            memory_bytes: stats.map(|s| s.memory_bytes),
            supervised_installed,
        }
    }

    fn restart(&self) -> bool {
        self.manager.restart(&self.spec.unit)
    }

    fn kill_stale(&self) -> usize {
        procs::kill_matching(&self.spec.signature)
    }

    fn clear_locks(&self) -> usize {
        fsio::remove_matching(&self.spec.data_dir, &self.spec.lock_patterns)
    }

    fn log_age_seconds(&self) -> Option<u64> {
        fsio::file_age_seconds(&self.spec.log_path)
    }

    fn head_commit(&self) -> CommitInfo {
        self.repo.head_commit()
    }

    fn revert_head(&self) -> Result<(), String> {
        self.repo.revert_head()
    }
}
