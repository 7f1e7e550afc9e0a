//! The update plan: how the supervised service's packaging is synced and
//! verified. All of this is service contract, supplied at construction — the
//! orchestrator itself knows nothing about any particular package manager.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// One dependency-sync invocation. Commands are tried in order; the first
/// success wins and later ones are skipped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncCommand {
    /// Short label recorded in the result (`"uv"`, `"pip"`).
    pub label: String,
    pub program: String,
    pub args: Vec<String>,
}

impl SyncCommand {
    pub fn new(label: &str, program: &str, args: &[&str]) -> Self {
        Self {
            label: label.to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
        }
    }
}

/// Probe for the summarizer model (full mode only): run the command and
/// expect `expect` in its stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelCheck {
    pub program: String,
    pub args: Vec<String>,
    pub expect: String,
}

/// Everything the orchestrator needs to know about the service's packaging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePlan {
    /// Changed paths that trigger a dependency sync.
    pub dep_files: Vec<String>,
    /// File scanned for pinned critical-dependency changes.
    pub pin_file: String,
    /// Pinned dependencies whose upgrades must be supervised.
    pub critical_deps: Vec<String>,
    /// Preferred sync first, fallback after.
    pub sync_commands: Vec<SyncCommand>,
    /// Interpreter used to query installed package versions, relative to the
    /// service repo when not absolute.
    pub interpreter: PathBuf,
    /// Package name → import name, where they differ.
    pub import_overrides: HashMap<String, String>,
    /// External tools that must answer `--version` during verification.
    pub required_tools: Vec<String>,
    /// Summarizer model presence check (full mode).
    pub model_check: Option<ModelCheck>,
    /// OAuth credentials file that must parse as JSON (full mode).
    pub credentials_path: Option<PathBuf>,
}

impl Default for UpdatePlan {
    fn default() -> Self {
        Self {
            dep_files: vec![
                "pyproject.toml".to_string(),
                "uv.lock".to_string(),
                "requirements.txt".to_string(),
            ],
            pin_file: "pyproject.toml".to_string(),
            critical_deps: Vec::new(),
            sync_commands: vec![
                SyncCommand::new("uv", "uv", &["sync", "--all-extras"]),
                SyncCommand::new("pip", ".venv/bin/pip", &["install", "-e", "."]),
            ],
            interpreter: PathBuf::from(".venv/bin/python"),
            import_overrides: HashMap::new(),
            required_tools: vec!["git".to_string(), "uv".to_string()],
            model_check: None,
            credentials_path: None,
        }
    }
}

impl UpdatePlan {
    /// Import name used to query a package's installed version.
    pub fn import_name(&self, package: &str) -> String {
        self.import_overrides
            .get(package)
            .cloned()
            .unwrap_or_else(|| package.replace('-', "_"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_plan_dep_files() {
        let plan = UpdatePlan::default();
        assert!(plan.dep_files.contains(&"pyproject.toml".to_string()));
        assert!(plan.dep_files.contains(&"uv.lock".to_string()));
        assert_eq!(plan.sync_commands[0].label, "uv");
    }

    #[test]
    fn test_import_name_mapping() {
        let mut plan = UpdatePlan::default();
        plan.import_overrides
            .insert("agent-sdk".to_string(), "agentsdk".to_string());

        assert_eq!(plan.import_name("agent-sdk"), "agentsdk");
        assert_eq!(plan.import_name("some-package"), "some_package");
        assert_eq!(plan.import_name("plain"), "plain");
    }
}
