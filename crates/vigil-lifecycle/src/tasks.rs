//! Scheduled maintenance tasks: a dependency-ordered runner with per-task
//! result records.
//!
//! Cycles degrade to insertion order with a warning rather than refusing to
//! run. A task named in the critical set aborts the remaining schedule when
//! it fails; everything after it is recorded as skipped.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::time::Instant;
use tracing::{error, info, warn};

/// Work to perform while in maintenance mode.
pub struct MaintenanceTask {
    pub name: String,
    pub description: String,
    pub estimated_secs: u64,
    pub depends_on: Vec<String>,
    run: Box<dyn FnMut() -> Result<String, String> + Send>,
}

impl MaintenanceTask {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        run: impl FnMut() -> Result<String, String> + Send + 'static,
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            estimated_secs: 0,
            depends_on: Vec::new(),
            run: Box::new(run),
        }
    }

    pub fn estimated(mut self, secs: u64) -> Self {
        self.estimated_secs = secs;
        self
    }

    pub fn depends_on(mut self, names: &[&str]) -> Self {
        self.depends_on = names.iter().map(|n| (*n).to_string()).collect();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Completed,
    Failed,
    Skipped,
}

/// Per-task result record.
#[derive(Debug, Clone, Serialize)]
pub struct TaskRecord {
    pub name: String,
    pub status: TaskStatus,
    pub duration_secs: f64,
    pub error: Option<String>,
    /// SHA-256 of the task's output, for cheap change detection across runs.
    pub output_digest: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskRunReport {
    pub records: Vec<TaskRecord>,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub aborted: bool,
    pub cycle_warning: bool,
}

impl TaskRunReport {
    pub fn success(&self) -> bool {
        self.failed == 0
    }

    /// Sum of estimated durations, for session planning.
    pub fn estimated_total(tasks: &[MaintenanceTask]) -> u64 {
        tasks.iter().map(|t| t.estimated_secs).sum()
    }
}

/// Executes a set of tasks in dependency order.
#[derive(Default)]
pub struct TaskRunner {
    tasks: Vec<MaintenanceTask>,
    critical: HashSet<String>,
}

impl TaskRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, task: MaintenanceTask) {
        info!(task = %task.name, "maintenance task added");
        self.tasks.push(task);
    }

    pub fn set_critical(&mut self, names: &[&str]) {
        self.critical = names.iter().map(|n| (*n).to_string()).collect();
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Topologically sorted indexes; `true` when a cycle (or a dependency on
    /// an unknown task) forced a fallback to insertion order.
    fn execution_order(&self) -> (Vec<usize>, bool) {
        let mut ordered: Vec<usize> = Vec::with_capacity(self.tasks.len());
        let mut done: HashSet<&str> = HashSet::new();
        let mut remaining: Vec<usize> = (0..self.tasks.len()).collect();
        let mut degraded = false;

        while !remaining.is_empty() {
            let ready: Vec<usize> = remaining
                .iter()
                .copied()
                .filter(|&i| {
                    self.tasks[i]
                        .depends_on
                        .iter()
                        .all(|dep| done.contains(dep.as_str()))
                })
                .collect();

            if ready.is_empty() {
                warn!("circular or missing task dependencies, falling back to insertion order");
                degraded = true;
                ordered.extend(remaining.iter().copied());
                break;
            }

            for i in ready {
                ordered.push(i);
                done.insert(self.tasks[i].name.as_str());
                remaining.retain(|&r| r != i);
            }
        }

        (ordered, degraded)
    }

    /// Run every task. A critical task's failure aborts the rest.
    pub fn execute(&mut self) -> TaskRunReport {
        let (order, cycle_warning) = self.execution_order();
        let mut report = TaskRunReport {
            cycle_warning,
            ..TaskRunReport::default()
        };

        let mut abort = false;
        for index in order {
            let name = self.tasks[index].name.clone();

            if abort {
                report.skipped += 1;
                report.records.push(TaskRecord {
                    name,
                    status: TaskStatus::Skipped,
                    duration_secs: 0.0,
                    error: None,
                    output_digest: None,
                });
                continue;
            }

            let task = &mut self.tasks[index];
            info!(task = %task.name, description = %task.description, "executing maintenance task");
            let started = Instant::now();
            let result = (task.run)();
            let duration_secs = started.elapsed().as_secs_f64();

            match result {
                Ok(output) => {
                    info!(task = %name, duration_secs, "task completed");
                    report.completed += 1;
                    report.records.push(TaskRecord {
                        name,
                        status: TaskStatus::Completed,
                        duration_secs,
                        error: None,
                        output_digest: Some(digest(&output)),
                    });
                }
                Err(e) => {
                    error!(task = %name, duration_secs, error = %e, "task failed");
                    report.failed += 1;
                    let critical = self.critical.contains(&name);
                    report.records.push(TaskRecord {
                        name: name.clone(),
                        status: TaskStatus::Failed,
                        duration_secs,
                        error: Some(e),
                        output_digest: None,
                    });

                    if critical {
                        error!(task = %name, "critical task failed, aborting remaining schedule");
                        report.aborted = true;
                        abort = true;
                    }
                }
            }
        }

        info!(
            completed = report.completed,
            failed = report.failed,
            skipped = report.skipped,
            "task execution finished"
        );
        report
    }
}

fn digest(output: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(output.as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ok_task(name: &str, log: Arc<parking_lot::Mutex<Vec<String>>>) -> MaintenanceTask {
        let label = name.to_string();
        MaintenanceTask::new(name, "test task", move || {
            log.lock().push(label.clone());
            Ok(format!("{label} done"))
        })
    }

    fn order_log() -> Arc<parking_lot::Mutex<Vec<String>>> {
        Arc::new(parking_lot::Mutex::new(Vec::new()))
    }

    #[test]
    fn test_dependency_order() {
        let log = order_log();
        let mut runner = TaskRunner::new();
        runner.add(ok_task("restore", Arc::clone(&log)).depends_on(&["backup", "vacuum"]));
        runner.add(ok_task("vacuum", Arc::clone(&log)).depends_on(&["backup"]));
        runner.add(ok_task("backup", Arc::clone(&log)));

        let report = runner.execute();
        assert!(report.success());
        assert!(!report.cycle_warning);
        assert_eq!(*log.lock(), vec!["backup", "vacuum", "restore"]);
    }

    #[test]
    fn test_cycle_degrades_to_insertion_order() {
        let log = order_log();
        let mut runner = TaskRunner::new();
        runner.add(ok_task("a", Arc::clone(&log)).depends_on(&["b"]));
        runner.add(ok_task("b", Arc::clone(&log)).depends_on(&["a"]));

        let report = runner.execute();
        assert!(report.cycle_warning);
        assert_eq!(report.completed, 2);
        assert_eq!(*log.lock(), vec!["a", "b"]);
    }

    #[test]
    fn test_noncritical_failure_continues() {
        let log = order_log();
        let mut runner = TaskRunner::new();
        runner.add(MaintenanceTask::new("flaky", "fails", || {
            Err("disk full".to_string())
        }));
        runner.add(ok_task("after", Arc::clone(&log)));

        let report = runner.execute();
        assert!(!report.success());
        assert_eq!(report.failed, 1);
        assert_eq!(report.completed, 1);
        assert!(!report.aborted);
        assert_eq!(*log.lock(), vec!["after"]);
    }

    #[test]
    fn test_critical_failure_aborts_remaining() {
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);

        let mut runner = TaskRunner::new();
        runner.add(MaintenanceTask::new("migrate", "critical step", || {
            Err("schema mismatch".to_string())
        }));
        runner.add(MaintenanceTask::new("cleanup", "after migrate", move || {
            ran_clone.fetch_add(1, Ordering::SeqCst);
            Ok("done".to_string())
        }));
        runner.set_critical(&["migrate"]);

        let report = runner.execute();
        assert!(report.aborted);
        assert_eq!(report.skipped, 1);
        assert_eq!(ran.load(Ordering::SeqCst), 0);
        assert_eq!(report.records[1].status, TaskStatus::Skipped);
    }

    #[test]
    fn test_output_digest_recorded() {
        let mut runner = TaskRunner::new();
        runner.add(MaintenanceTask::new("digesting", "", || {
            Ok("stable output".to_string())
        }));

        let report = runner.execute();
        let record = &report.records[0];
        let digest = record.output_digest.as_deref().expect("digest");
        assert_eq!(digest.len(), 64);

        // Same output, same digest on a fresh run.
        let mut runner2 = TaskRunner::new();
        runner2.add(MaintenanceTask::new("digesting", "", || {
            Ok("stable output".to_string())
        }));
        let report2 = runner2.execute();
        assert_eq!(
            report2.records[0].output_digest.as_deref(),
            Some(digest)
        );
    }

    #[test]
    fn test_estimated_total() {
        let tasks = vec![
            MaintenanceTask::new("a", "", || Ok(String::new())).estimated(30),
            MaintenanceTask::new("b", "", || Ok(String::new())).estimated(90),
        ];
        assert_eq!(TaskRunReport::estimated_total(&tasks), 120);
    }
}
