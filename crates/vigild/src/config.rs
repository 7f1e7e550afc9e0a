//! On-disk configuration for the vigil executables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;
use vigil_proc::ServiceSpec;
use vigil_update::UpdatePlan;

/// How alerts leave the host: a command receiving the recipient as its last
/// argument and the message on stdin.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertCommand {
    pub program: String,
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VigilConfig {
    pub service: ServiceSpec,
    /// Manage the unit in the user scope (`systemctl --user`).
    pub user_unit: bool,
    pub alert_recipient: String,
    /// Absent: alerts are logged only.
    pub alert_command: Option<AlertCommand>,
    pub update: UpdatePlan,
}

impl Default for VigilConfig {
    fn default() -> Self {
        Self {
            service: ServiceSpec {
                name: "bridge".to_string(),
                unit: "bridge.service".to_string(),
                signature: "bridge_main.py".to_string(),
                repo_dir: PathBuf::from("."),
                data_dir: PathBuf::from("data"),
                log_path: PathBuf::from("logs/bridge.log"),
                lock_patterns: vec![
                    "*.session-journal".to_string(),
                    "*.session-wal".to_string(),
                    "*.session-shm".to_string(),
                ],
            },
            user_unit: true,
            alert_recipient: "supervisor".to_string(),
            alert_command: None,
            update: UpdatePlan::default(),
        }
    }
}

impl VigilConfig {
    /// Load from a JSON file; a missing file yields the defaults.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(raw) => {
                let config = serde_json::from_str(&raw)
                    .map_err(|e| anyhow::anyhow!("invalid config {}: {e}", path.display()))?;
                debug!(path = %path.display(), "config loaded");
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no config file, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!("cannot read {}: {e}", path.display())),
        }
    }

    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_string_pretty(self)?;
        std::fs::write(path, body)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_config_uses_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = VigilConfig::load_or_default(&dir.path().join("vigil.json")).expect("load");
        assert_eq!(config.service.name, "bridge");
        assert!(config.alert_command.is_none());
    }

    #[test]
    fn test_config_roundtrip() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vigil.json");

        let mut config = VigilConfig::default();
        config.service.signature = "worker.py".to_string();
        config.alert_recipient = "oncall".to_string();
        config.save(&path).expect("save");

        let loaded = VigilConfig::load_or_default(&path).expect("load");
        assert_eq!(loaded.service.signature, "worker.py");
        assert_eq!(loaded.alert_recipient, "oncall");
    }

    #[test]
    fn test_partial_config_fills_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vigil.json");
        std::fs::write(&path, "{\"alert_recipient\": \"ops\"}").expect("write");

        let loaded = VigilConfig::load_or_default(&path).expect("load");
        assert_eq!(loaded.alert_recipient, "ops");
        assert_eq!(loaded.service.unit, "bridge.service");
    }

    #[test]
    fn test_invalid_config_is_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("vigil.json");
        std::fs::write(&path, "{ not json").expect("write");

        assert!(VigilConfig::load_or_default(&path).is_err());
    }
}
