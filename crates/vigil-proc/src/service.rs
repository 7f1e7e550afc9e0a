//! OS service-manager abstraction.
//!
//! The core only needs restart and an installed? probe on a named unit; the
//! platform-specific transport lives behind [`ServiceManager`].

use crate::exec::{CommandSpec, run};
use std::time::Duration;
use tracing::{info, warn};

/// Deadline for service-manager invocations.
const SERVICE_TIMEOUT: Duration = Duration::from_secs(60);

/// Install/restart/status surface of the OS-level service manager.
pub trait ServiceManager: Send + Sync {
    /// Whether the manager knows about this unit.
    fn is_installed(&self, unit: &str) -> bool;

    /// Restart the unit. No-op (returns `false`) when not installed.
    fn restart(&self, unit: &str) -> bool;
}

/// systemd implementation via `systemctl`.
#[derive(Debug, Clone, Default)]
pub struct SystemctlManager {
    /// Manage user units (`systemctl --user`) instead of system units.
    pub user: bool,
}

impl SystemctlManager {
    pub fn system() -> Self {
        Self { user: false }
    }

    pub fn user_scope() -> Self {
        Self { user: true }
    }

    fn systemctl(&self, args: &[&str]) -> CommandSpec {
        let mut full: Vec<&str> = Vec::with_capacity(args.len() + 1);
        if self.user {
            full.push("--user");
        }
        full.extend_from_slice(args);
        CommandSpec::new("systemctl", &full).timeout(SERVICE_TIMEOUT)
    }
}

impl ServiceManager for SystemctlManager {
    fn is_installed(&self, unit: &str) -> bool {
        matches!(
            run(&self.systemctl(&["cat", unit])),
            Ok(out) if out.success()
        )
    }

    fn restart(&self, unit: &str) -> bool {
        if !self.is_installed(unit) {
            warn!(unit, "unit not installed, skipping restart");
            return false;
        }

        match run(&self.systemctl(&["restart", unit])) {
            Ok(out) if out.success() => {
                info!(unit, "service restarted");
                true
            }
            Ok(out) => {
                warn!(unit, error = %out.combined(), "service restart failed");
                false
            }
            Err(e) => {
                warn!(unit, error = %e, "service restart failed");
                false
            }
        }
    }
}
