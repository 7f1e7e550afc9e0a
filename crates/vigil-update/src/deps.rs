//! Dependency sync and pinned-version verification.

use crate::plan::{SyncCommand, UpdatePlan};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};
use vigil_proc::exec::{CommandSpec, run};

/// Deadline for a single sync command.
const SYNC_TIMEOUT: Duration = Duration::from_secs(600);

/// Deadline for a version probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Result record of the dependency sync step.
#[derive(Debug, Clone, Serialize)]
pub struct DepSyncOutcome {
    pub success: bool,
    /// Label of the command that succeeded, or `"skipped"`.
    pub method: String,
    pub output: String,
    pub error: Option<String>,
}

impl DepSyncOutcome {
    pub fn skipped() -> Self {
        Self {
            success: true,
            method: "skipped".to_string(),
            output: String::new(),
            error: None,
        }
    }
}

/// Installed-vs-pinned comparison for one critical dependency.
#[derive(Debug, Clone, Serialize)]
pub struct VersionCheck {
    pub package: String,
    pub installed: Option<String>,
    pub pinned: Option<String>,
    pub matches: bool,
}

/// Whether any dependency file appears in the changed path set.
pub fn dep_files_changed(plan: &UpdatePlan, changed_paths: &[String]) -> bool {
    changed_paths
        .iter()
        .any(|path| plan.dep_files.iter().any(|dep| dep == path))
}

/// Added diff lines that touch a pinned critical dependency.
pub fn critical_changes(diff: &str, critical_deps: &[String]) -> Vec<String> {
    diff.lines()
        .filter(|line| line.starts_with('+') && line.contains("=="))
        .filter(|line| critical_deps.iter().any(|dep| line.contains(dep.as_str())))
        .map(|line| line.trim().to_string())
        .collect()
}

/// Run the sync commands in order; first success wins. Every failure's error
/// stream is carried in the result record.
pub fn sync_dependencies(plan: &UpdatePlan, repo_dir: &Path) -> DepSyncOutcome {
    let mut failures = Vec::new();

    for command in &plan.sync_commands {
        match run_sync_command(command, repo_dir) {
            Ok(output) => {
                info!(method = %command.label, "dependencies synced");
                return DepSyncOutcome {
                    success: true,
                    method: command.label.clone(),
                    output,
                    error: None,
                };
            }
            Err(error) => {
                warn!(method = %command.label, error = %error, "dep sync attempt failed");
                failures.push(format!("{}: {}", command.label, error));
            }
        }
    }

    DepSyncOutcome {
        success: false,
        method: plan
            .sync_commands
            .last()
            .map(|c| c.label.clone())
            .unwrap_or_else(|| "none".to_string()),
        output: String::new(),
        error: Some(failures.join("; ")),
    }
}

fn run_sync_command(command: &SyncCommand, repo_dir: &Path) -> Result<String, String> {
    let args: Vec<&str> = command.args.iter().map(|a| a.as_str()).collect();
    let spec = CommandSpec::new(&command.program, &args)
        .cwd(repo_dir)
        .timeout(SYNC_TIMEOUT);

    match run(&spec) {
        Ok(out) if out.success() => Ok(out.combined()),
        Ok(out) => Err(out.combined()),
        Err(e) => Err(e.to_string()),
    }
}

/// Pinned version of `package` from the plan's pin file, reading `==` pins.
pub fn pinned_version(plan: &UpdatePlan, repo_dir: &Path, package: &str) -> Option<String> {
    let content = std::fs::read_to_string(repo_dir.join(&plan.pin_file)).ok()?;

    for line in content.lines() {
        if line.contains(package) {
            if let Some((_, version)) = line.split_once("==") {
                let version = version
                    .trim()
                    .trim_end_matches(|c| c == '"' || c == ',' || c == '\'');
                if !version.is_empty() {
                    return Some(version.to_string());
                }
            }
        }
    }

    None
}

/// Installed version of `package`, asked of the service's own interpreter.
pub fn installed_version(plan: &UpdatePlan, repo_dir: &Path, package: &str) -> Option<String> {
    let interpreter = if plan.interpreter.is_absolute() {
        plan.interpreter.clone()
    } else {
        repo_dir.join(&plan.interpreter)
    };
    if !interpreter.exists() {
        return None;
    }

    let import = plan.import_name(package);
    let program = interpreter.to_string_lossy().to_string();
    let script = format!("import {import}; print({import}.__version__)");
    let spec = CommandSpec::new(program, &["-c", &script])
        .cwd(repo_dir)
        .timeout(PROBE_TIMEOUT);

    match run(&spec) {
        Ok(out) if out.success() => {
            let version = out.first_line();
            (!version.is_empty()).then_some(version)
        }
        _ => None,
    }
}

/// Compare installed versions of every critical dependency against its pin.
pub fn verify_critical_versions(plan: &UpdatePlan, repo_dir: &Path) -> Vec<VersionCheck> {
    plan.critical_deps
        .iter()
        .map(|package| {
            let installed = installed_version(plan, repo_dir, package);
            let pinned = pinned_version(plan, repo_dir, package);

            let matches = match (&installed, &pinned) {
                (Some(i), Some(p)) => i == p,
                (None, Some(_)) => false,
                _ => true,
            };

            VersionCheck {
                package: package.clone(),
                installed,
                pinned,
                matches,
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dep_files_changed() {
        let plan = UpdatePlan::default();
        assert!(dep_files_changed(
            &plan,
            &["src/main.py".to_string(), "uv.lock".to_string()]
        ));
        assert!(!dep_files_changed(&plan, &["src/main.py".to_string()]));
        assert!(!dep_files_changed(&plan, &[]));
    }

    #[test]
    fn test_critical_changes_detects_pin_bump() {
        let critical = vec!["telethon".to_string()];
        let diff = "\
--- a/pyproject.toml
+++ b/pyproject.toml
-    \"telethon==1.36.0\",
+    \"telethon==1.37.0\",
+    \"httpx==0.27.0\",
";
        let changes = critical_changes(diff, &critical);
        assert_eq!(changes, vec!["\"telethon==1.37.0\","]);
    }

    #[test]
    fn test_critical_changes_ignores_unpinned() {
        let critical = vec!["telethon".to_string()];
        let diff = "+    \"telethon>=1.36\",\n+# telethon notes\n";
        assert!(critical_changes(diff, &critical).is_empty());
    }

    #[test]
    fn test_sync_first_success_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut plan = UpdatePlan::default();
        plan.sync_commands = vec![
            SyncCommand::new("true", "true", &[]),
            SyncCommand::new("never", "false", &[]),
        ];

        let outcome = sync_dependencies(&plan, dir.path());
        assert!(outcome.success);
        assert_eq!(outcome.method, "true");
    }

    #[test]
    fn test_sync_falls_back_then_fails() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut plan = UpdatePlan::default();
        plan.sync_commands = vec![
            SyncCommand::new("a", "false", &[]),
            SyncCommand::new("b", "sh", &["-c", "echo broken >&2; exit 2"]),
        ];

        let outcome = sync_dependencies(&plan, dir.path());
        assert!(!outcome.success);
        let error = outcome.error.expect("error");
        assert!(error.contains("a:"));
        assert!(error.contains("broken"));
    }

    #[test]
    fn test_pinned_version_parsing() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("pyproject.toml"),
            "[project]\ndependencies = [\n    \"telethon==1.36.0\",\n    \"httpx\",\n]\n",
        )
        .expect("write");

        let plan = UpdatePlan::default();
        assert_eq!(
            pinned_version(&plan, dir.path(), "telethon").as_deref(),
            Some("1.36.0")
        );
        assert_eq!(pinned_version(&plan, dir.path(), "httpx"), None);
        assert_eq!(pinned_version(&plan, dir.path(), "absent"), None);
    }

    #[test]
    fn test_installed_version_missing_interpreter() {
        let dir = tempfile::tempdir().expect("tempdir");
        let plan = UpdatePlan::default();
        assert_eq!(installed_version(&plan, dir.path(), "telethon"), None);
    }

    #[test]
    fn test_verify_versions_unpinned_is_ok() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("pyproject.toml"), "[project]\n").expect("write");

        let mut plan = UpdatePlan::default();
        plan.critical_deps = vec!["telethon".to_string()];

        let checks = verify_critical_versions(&plan, dir.path());
        assert_eq!(checks.len(), 1);
        // No pin and no installed version: nothing to mismatch.
        assert!(checks[0].matches);
    }

    #[test]
    fn test_verify_versions_pin_without_install_mismatches() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("pyproject.toml"),
            "dependencies = [\"telethon==1.36.0\"]\n",
        )
        .expect("write");

        let mut plan = UpdatePlan::default();
        plan.critical_deps = vec!["telethon".to_string()];

        let checks = verify_critical_versions(&plan, dir.path());
        assert!(!checks[0].matches);
        assert_eq!(checks[0].pinned.as_deref(), Some("1.36.0"));
        assert_eq!(checks[0].installed, None);
    }
}
