//! Shared wiring for the vigil executables: config loading and construction
//! of the host, alert sink, watchdog, and updater from one config.

#![forbid(unsafe_code)]

pub mod config;

use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use vigil_health::Watchdog;
use vigil_proc::exec::{CommandSpec, run};
use vigil_proc::{LocalServiceHost, ServiceHost, SystemctlManager};
use vigil_recovery::{AlertSink, Escalator, LogAlertSink};
use vigil_update::Updater;

pub use config::{AlertCommand, VigilConfig};

/// Alert budget: delivery must complete within this bound.
const ALERT_TIMEOUT: Duration = Duration::from_secs(30);

/// Production [`AlertSink`]: runs the configured command with the recipient
/// appended and the message on stdin.
pub struct ExecAlertSink {
    command: AlertCommand,
}

impl ExecAlertSink {
    pub fn new(command: AlertCommand) -> Self {
        Self { command }
    }
}

impl AlertSink for ExecAlertSink {
    fn send(&self, to: &str, message: &str) -> bool {
        let mut args: Vec<&str> = self.command.args.iter().map(|a| a.as_str()).collect();
        args.push(to);

        let spec = CommandSpec::new(&self.command.program, &args)
            .input(message)
            .timeout(ALERT_TIMEOUT);

        match run(&spec) {
            Ok(out) if out.success() => true,
            Ok(out) => {
                warn!(error = %out.combined(), "alert command failed");
                false
            }
            Err(e) => {
                warn!(error = %e, "alert command failed");
                false
            }
        }
    }
}

/// Build the production service host from config.
pub fn build_host(config: &VigilConfig) -> Arc<dyn ServiceHost> {
    let manager = if config.user_unit {
        SystemctlManager::user_scope()
    } else {
        SystemctlManager::system()
    };
    Arc::new(LocalServiceHost::new(
        config.service.clone(),
        Box::new(manager),
    ))
}

/// Build the alert sink from config; falls back to log-only delivery.
pub fn build_sink(config: &VigilConfig) -> Box<dyn AlertSink> {
    match &config.alert_command {
        Some(command) => Box::new(ExecAlertSink::new(command.clone())),
        None => Box::new(LogAlertSink),
    }
}

/// Assemble the watchdog with its escalator.
pub fn build_watchdog(config: &VigilConfig) -> Watchdog {
    let host = build_host(config);
    let escalator = Escalator::new(
        Arc::clone(&host),
        build_sink(config),
        config.alert_recipient.clone(),
    );
    Watchdog::new(host, escalator)
}

/// Assemble the update orchestrator.
pub fn build_updater(config: &VigilConfig) -> Updater {
    Updater::new(build_host(config), config.update.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_sink_success_and_failure() {
        // The recipient arrives as the last argument, the message on stdin.
        let passthrough = ExecAlertSink::new(AlertCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), "cat > /dev/null".to_string()],
        });
        assert!(passthrough.send("supervisor", "service down"));

        let failing = ExecAlertSink::new(AlertCommand {
            program: "false".to_string(),
            args: vec![],
        });
        assert!(!failing.send("supervisor", "service down"));

        // A missing binary is a failed delivery, not a panic.
        let missing = ExecAlertSink::new(AlertCommand {
            program: "no-such-alert-tool".to_string(),
            args: vec![],
        });
        assert!(!missing.send("supervisor", "service down"));
    }

    #[test]
    fn test_builders_from_default_config() {
        let config = VigilConfig::default();
        let host = build_host(&config);
        assert_eq!(host.spec().name, "bridge");
        let _watchdog = build_watchdog(&config);
        let _updater = build_updater(&config);
    }
}
