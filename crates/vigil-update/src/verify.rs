//! Environment verification. All checks are soft: they produce warnings,
//! never roll anything back.

use crate::plan::{ModelCheck, UpdatePlan};
use serde::Serialize;
use std::path::Path;
use std::time::Duration;
use tracing::debug;
use vigil_proc::exec::{CommandSpec, run};

const CHECK_TIMEOUT: Duration = Duration::from_secs(10);
const MODEL_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of one verification probe.
#[derive(Debug, Clone, Serialize)]
pub struct ToolCheck {
    pub name: String,
    pub available: bool,
    pub version: Option<String>,
    pub error: Option<String>,
}

impl ToolCheck {
    fn missing(name: &str, error: String) -> Self {
        Self {
            name: name.to_string(),
            available: false,
            version: None,
            error: Some(error),
        }
    }
}

/// Aggregate verification record.
#[derive(Debug, Clone, Default, Serialize)]
pub struct VerificationOutcome {
    pub tools: Vec<ToolCheck>,
    pub model: Option<ToolCheck>,
    pub credentials: Option<ToolCheck>,
}

impl VerificationOutcome {
    /// Warnings to surface for anything that failed.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        for tool in &self.tools {
            if !tool.available {
                warnings.push(format!("required tool missing: {}", tool.name));
            }
        }
        if let Some(model) = &self.model {
            if !model.available {
                warnings.push(format!(
                    "summarizer model unavailable: {}",
                    model.error.as_deref().unwrap_or("not found")
                ));
            }
        }
        if let Some(credentials) = &self.credentials {
            if !credentials.available {
                warnings.push(format!(
                    "calendar credentials: {}",
                    credentials.error.as_deref().unwrap_or("unreadable")
                ));
            }
        }

        warnings
    }
}

/// Probe a tool with `--version`. A spawn failure means not installed.
pub fn check_tool(name: &str) -> ToolCheck {
    match run(&CommandSpec::new(name, &["--version"]).timeout(CHECK_TIMEOUT)) {
        Ok(out) if out.success() => {
            let version = out.first_line();
            ToolCheck {
                name: name.to_string(),
                available: true,
                version: (!version.is_empty()).then_some(version),
                error: None,
            }
        }
        Ok(out) => ToolCheck {
            name: name.to_string(),
            available: true,
            version: None,
            error: Some(out.combined()),
        },
        Err(e) => ToolCheck::missing(name, e.to_string()),
    }
}

/// Check the summarizer model is present (e.g. listed by the model runner).
pub fn check_model(check: &ModelCheck) -> ToolCheck {
    let args: Vec<&str> = check.args.iter().map(|a| a.as_str()).collect();
    let spec = CommandSpec::new(&check.program, &args).timeout(MODEL_CHECK_TIMEOUT);

    match run(&spec) {
        Ok(out) if out.success() && out.stdout.contains(&check.expect) => ToolCheck {
            name: format!("{} ({})", check.program, check.expect),
            available: true,
            version: Some(check.expect.clone()),
            error: None,
        },
        Ok(out) if out.success() => ToolCheck::missing(
            &check.program,
            format!("model {} not found", check.expect),
        ),
        Ok(out) => ToolCheck::missing(&check.program, out.combined()),
        Err(e) => ToolCheck::missing(&check.program, e.to_string()),
    }
}

/// OAuth credentials must at least parse as JSON.
pub fn check_credentials(path: &Path) -> ToolCheck {
    let name = "calendar-credentials";
    match std::fs::read_to_string(path) {
        Ok(raw) => match serde_json::from_str::<serde_json::Value>(&raw) {
            Ok(_) => ToolCheck {
                name: name.to_string(),
                available: true,
                version: None,
                error: None,
            },
            Err(e) => ToolCheck::missing(name, format!("invalid JSON: {e}")),
        },
        Err(e) => ToolCheck::missing(name, e.to_string()),
    }
}

/// Run the plan's verification checks. Model and credentials probes only run
/// in full mode.
pub fn verify_environment(plan: &UpdatePlan, full: bool) -> VerificationOutcome {
    let mut outcome = VerificationOutcome::default();

    for tool in &plan.required_tools {
        let check = check_tool(tool);
        debug!(tool = %check.name, available = check.available, "tool check");
        outcome.tools.push(check);
    }

    if full {
        outcome.model = plan.model_check.as_ref().map(check_model);
        outcome.credentials = plan.credentials_path.as_deref().map(check_credentials);
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_tool_present() {
        let check = check_tool("git");
        assert!(check.available);
        assert!(check.version.expect("version").contains("git"));
    }

    #[test]
    fn test_check_tool_missing() {
        let check = check_tool("no-such-tool-zzz");
        assert!(!check.available);
        assert!(check.error.is_some());
    }

    #[test]
    fn test_check_model_expectation() {
        let found = check_model(&ModelCheck {
            program: "echo".to_string(),
            args: vec!["qwen3:4b ready".to_string()],
            expect: "qwen3:4b".to_string(),
        });
        assert!(found.available);

        let missing = check_model(&ModelCheck {
            program: "echo".to_string(),
            args: vec!["nothing here".to_string()],
            expect: "qwen3:4b".to_string(),
        });
        assert!(!missing.available);
    }

    #[test]
    fn test_check_credentials() {
        let dir = tempfile::tempdir().expect("tempdir");

        let good = dir.path().join("ok.json");
        std::fs::write(&good, "{\"client_id\": \"x\"}").expect("write");
        assert!(check_credentials(&good).available);

        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{ nope").expect("write");
        assert!(!check_credentials(&bad).available);

        assert!(!check_credentials(&dir.path().join("absent.json")).available);
    }

    #[test]
    fn test_verify_environment_skips_full_checks_in_cron() {
        let mut plan = UpdatePlan::default();
        plan.required_tools = vec!["git".to_string()];
        plan.model_check = Some(ModelCheck {
            program: "echo".to_string(),
            args: vec!["x".to_string()],
            expect: "x".to_string(),
        });

        let cron = verify_environment(&plan, false);
        assert!(cron.model.is_none());

        let full = verify_environment(&plan, true);
        assert!(full.model.is_some());
    }

    #[test]
    fn test_warnings_for_missing_tool() {
        let mut plan = UpdatePlan::default();
        plan.required_tools = vec!["no-such-tool-zzz".to_string()];

        let outcome = verify_environment(&plan, false);
        let warnings = outcome.warnings();
        assert_eq!(warnings.len(), 1);
        assert!(warnings[0].contains("no-such-tool-zzz"));
    }
}
