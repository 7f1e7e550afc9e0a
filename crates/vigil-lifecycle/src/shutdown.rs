//! Graceful shutdown: gate-close, bounded request drain, state persistence,
//! LIFO component stop, resource cleanup, and a final validation.
//!
//! The sequencer never short-circuits — every remaining step runs even when
//! an earlier one fails, so as many resources as possible are released.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};
use vigil_proc::fsio::atomic_write;
use vigil_proc::procs;

/// Soft per-component shutdown budget; exceeding it is logged, not fatal.
const COMPONENT_BUDGET: Duration = Duration::from_secs(5);

/// Bound on waiting for a registered thread to finish.
const THREAD_JOIN_BOUND: Duration = Duration::from_secs(5);

type Callback = Box<dyn FnMut() -> Result<(), String> + Send>;

// ─── Request tracking ────────────────────────────────────────────────────────

/// Shared set of in-flight request IDs, updated by the request-handling
/// layer and polled by the drain loop.
#[derive(Debug, Clone, Default)]
pub struct RequestTracker {
    inner: Arc<Mutex<HashSet<String>>>,
}

impl RequestTracker {
    pub fn register(&self, request_id: &str) {
        self.inner.lock().insert(request_id.to_string());
    }

    pub fn complete(&self, request_id: &str) {
        self.inner.lock().remove(request_id);
    }

    pub fn count(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.lock().iter().cloned().collect()
    }
}

// ─── Report ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: String,
    pub success: bool,
    pub duration_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ShutdownReport {
    pub success: bool,
    pub reason: String,
    pub duration_secs: f64,
    pub steps: Vec<StepRecord>,
    pub remaining_requests: usize,
}

impl ShutdownReport {
    pub fn exit_code(&self) -> i32 {
        if self.success { 0 } else { 1 }
    }
}

/// Best-effort state persisted for restart recovery.
#[derive(Debug, Clone, Serialize)]
struct PersistedState {
    shutdown_time: String,
    reason: String,
    active_components: Vec<String>,
    unfinished_requests: Vec<String>,
    memory_bytes: Option<u64>,
    thread_count: Option<usize>,
}

// ─── Manager ─────────────────────────────────────────────────────────────────

/// Orchestrates the shutdown sequence for a long-lived process.
pub struct ShutdownManager {
    data_dir: PathBuf,
    max_wait: Duration,
    drain_poll: Duration,
    requests: RequestTracker,
    gate_close: Option<Box<dyn FnMut() + Send>>,
    /// Registration order; stopped LIFO.
    components: Vec<(String, Callback)>,
    /// Database connections, open files — closed after components.
    resources: Vec<(String, Callback)>,
    threads: Vec<(String, JoinHandle<()>)>,
    initiated: bool,
}

impl ShutdownManager {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            max_wait: Duration::from_secs(30),
            drain_poll: Duration::from_secs(1),
            requests: RequestTracker::default(),
            gate_close: None,
            components: Vec::new(),
            resources: Vec::new(),
            threads: Vec::new(),
            initiated: false,
        }
    }

    /// Cap on the request drain.
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_drain_poll(mut self, poll: Duration) -> Self {
        self.drain_poll = poll;
        self
    }

    /// Caller-supplied "reject new requests" switch.
    pub fn on_gate_close(&mut self, gate: impl FnMut() + Send + 'static) {
        self.gate_close = Some(Box::new(gate));
    }

    /// Register a component with its shutdown callback. Components stop in
    /// reverse registration order.
    pub fn register_component(
        &mut self,
        name: &str,
        callback: impl FnMut() -> Result<(), String> + Send + 'static,
    ) {
        info!(component = name, "component registered for shutdown");
        self.components.push((name.to_string(), Box::new(callback)));
    }

    /// Register a resource (database connection, open file) closed after all
    /// components have stopped.
    pub fn register_resource(
        &mut self,
        name: &str,
        callback: impl FnMut() -> Result<(), String> + Send + 'static,
    ) {
        self.resources.push((name.to_string(), Box::new(callback)));
    }

    /// Register a worker thread to be joined during cleanup.
    pub fn register_thread(&mut self, name: &str, handle: JoinHandle<()>) {
        self.threads.push((name.to_string(), handle));
    }

    /// Handle for the request layer to report in-flight work.
    pub fn requests(&self) -> RequestTracker {
        self.requests.clone()
    }

    /// Run the full shutdown sequence.
    pub fn initiate(&mut self, reason: &str) -> ShutdownReport {
        if self.initiated {
            warn!("shutdown already in progress");
            return ShutdownReport {
                success: true,
                reason: reason.to_string(),
                duration_secs: 0.0,
                steps: Vec::new(),
                remaining_requests: self.requests.count(),
            };
        }
        self.initiated = true;

        info!(reason, "graceful shutdown initiated");
        let started = Instant::now();
        let mut steps: Vec<StepRecord> = Vec::new();

        run_step(&mut steps, "stop new requests", || {
            if let Some(gate) = self.gate_close.as_mut() {
                gate();
            }
            info!("new request acceptance stopped");
            true
        });

        run_step(&mut steps, "wait for active requests", || {
            self.drain_requests()
        });

        run_step(&mut steps, "save application state", || {
            self.persist_state(reason)
        });

        run_step(&mut steps, "stop components", || self.stop_components());

        run_step(&mut steps, "close resources", || self.close_resources());

        run_step(&mut steps, "join threads", || self.join_threads());

        run_step(&mut steps, "final validation", || {
            let remaining = self.requests.count();
            if remaining > 0 {
                error!(remaining, "requests still in flight at shutdown end");
            }
            remaining == 0 && self.threads.is_empty()
        });

        let duration_secs = started.elapsed().as_secs_f64();
        let success = steps.iter().all(|s| s.success);
        let report = ShutdownReport {
            success,
            reason: reason.to_string(),
            duration_secs,
            steps,
            remaining_requests: self.requests.count(),
        };

        self.write_shutdown_log(&report);

        if success {
            info!(duration_secs, "graceful shutdown completed");
        } else {
            error!(duration_secs, "shutdown completed with errors");
        }

        report
    }

    /// Skip the drain and kill child processes after a short grace period.
    /// Invoked only on re-signal or explicit operator command.
    pub fn force_shutdown(&self, grace: Duration) -> bool {
        let grace = grace.min(Duration::from_secs(2));
        warn!(grace_secs = grace.as_secs_f64(), "force shutdown initiated");

        let children = procs::child_pids();
        for pid in &children {
            procs::terminate(*pid);
        }

        std::thread::sleep(grace);

        let mut killed = 0;
        for pid in &children {
            if procs::stats(*pid).is_some() {
                procs::force_kill(*pid);
                killed += 1;
            }
        }

        warn!(
            children = children.len(),
            killed, "force shutdown completed"
        );
        true
    }

    // ── Steps ───────────────────────────────────────────────────────────────

    fn drain_requests(&self) -> bool {
        if self.requests.count() == 0 {
            info!("no active requests to wait for");
            return true;
        }

        info!(active = self.requests.count(), "waiting for active requests");
        let deadline = Instant::now() + self.max_wait;

        loop {
            if self.requests.count() == 0 {
                info!("all requests completed");
                return true;
            }
            if Instant::now() >= deadline {
                warn!(
                    remaining = self.requests.count(),
                    waited_secs = self.max_wait.as_secs_f64(),
                    "drain timed out, proceeding to force-close"
                );
                return false;
            }
            std::thread::sleep(self.drain_poll);
        }
    }

    fn persist_state(&self, reason: &str) -> bool {
        let stats = procs::stats(std::process::id());
        let state = PersistedState {
            shutdown_time: chrono::Utc::now().to_rfc3339(),
            reason: reason.to_string(),
            active_components: self.components.iter().map(|(n, _)| n.clone()).collect(),
            unfinished_requests: self.requests.ids(),
            memory_bytes: stats.map(|s| s.memory_bytes),
            thread_count: stats.and_then(|s| s.thread_count),
        };

        let path = self.data_dir.join("process_state").join("shutdown_state.json");
        match serde_json::to_vec_pretty(&state) {
            Ok(body) => match atomic_write(&path, &body) {
                Ok(()) => {
                    info!(path = %path.display(), "application state saved");
                    true
                }
                Err(e) => {
                    // Best effort: a failed save must not block the shutdown.
                    warn!(error = %e, "could not save application state");
                    true
                }
            },
            Err(e) => {
                warn!(error = %e, "could not serialize application state");
                true
            }
        }
    }

    fn stop_components(&mut self) -> bool {
        let mut all_ok = true;

        for (name, callback) in self.components.iter_mut().rev() {
            info!(component = %name, "stopping component");
            let started = Instant::now();
            let result = callback();
            let elapsed = started.elapsed();

            if elapsed > COMPONENT_BUDGET {
                warn!(
                    component = %name,
                    elapsed_secs = elapsed.as_secs_f64(),
                    "component exceeded its shutdown budget"
                );
            }

            if let Err(e) = result {
                error!(component = %name, error = %e, "component shutdown failed");
                all_ok = false;
            }
        }

        self.components.clear();
        all_ok
    }

    fn close_resources(&mut self) -> bool {
        let mut all_ok = true;

        for (name, callback) in self.resources.iter_mut() {
            if let Err(e) = callback() {
                error!(resource = %name, error = %e, "resource cleanup failed");
                all_ok = false;
            }
        }

        self.resources.clear();
        all_ok
    }

    fn join_threads(&mut self) -> bool {
        let mut all_ok = true;

        for (name, handle) in std::mem::take(&mut self.threads) {
            let deadline = Instant::now() + THREAD_JOIN_BOUND;
            while !handle.is_finished() {
                if Instant::now() >= deadline {
                    break;
                }
                std::thread::sleep(Duration::from_millis(25));
            }

            if handle.is_finished() {
                let _ = handle.join();
            } else {
                warn!(thread = %name, "thread did not stop within bound, detaching");
                all_ok = false;
            }
        }

        all_ok
    }

    fn write_shutdown_log(&self, report: &ShutdownReport) {
        let path = self.data_dir.join("shutdown_log.json");
        match serde_json::to_vec_pretty(report) {
            Ok(body) => {
                if let Err(e) = atomic_write(&path, &body) {
                    warn!(error = %e, "failed to write shutdown log");
                }
            }
            Err(e) => warn!(error = %e, "failed to serialize shutdown log"),
        }
    }
}

fn run_step(steps: &mut Vec<StepRecord>, name: &str, step: impl FnOnce() -> bool) {
    info!(step = name, "shutdown step");
    let started = Instant::now();
    let success = step();
    let duration_secs = started.elapsed().as_secs_f64();

    if success {
        info!(step = name, duration_secs, "step completed");
    } else {
        error!(step = name, duration_secs, "step failed");
    }

    steps.push(StepRecord {
        name: name.to_string(),
        success,
        duration_secs,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    fn fast_manager(dir: &Path) -> ShutdownManager {
        ShutdownManager::new(dir)
            .with_max_wait(Duration::from_millis(300))
            .with_drain_poll(Duration::from_millis(20))
    }

    #[test]
    fn test_clean_shutdown() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut mgr = fast_manager(dir.path());

        let gate = Arc::new(AtomicBool::new(false));
        let gate_clone = Arc::clone(&gate);
        mgr.on_gate_close(move || gate_clone.store(true, Ordering::SeqCst));

        let stopped = Arc::new(AtomicUsize::new(0));
        let s1 = Arc::clone(&stopped);
        mgr.register_component("store", move || {
            s1.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });

        let report = mgr.initiate("test shutdown");
        assert!(report.success);
        assert_eq!(report.exit_code(), 0);
        assert!(gate.load(Ordering::SeqCst));
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
        assert!(
            dir.path()
                .join("process_state")
                .join("shutdown_state.json")
                .exists()
        );
        assert!(dir.path().join("shutdown_log.json").exists());
    }

    #[test]
    fn test_components_stop_in_reverse_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut mgr = fast_manager(dir.path());

        let order = Arc::new(Mutex::new(Vec::new()));
        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            let label = name.to_string();
            mgr.register_component(name, move || {
                order.lock().push(label.clone());
                Ok(())
            });
        }

        mgr.initiate("ordering test");
        assert_eq!(*order.lock(), vec!["third", "second", "first"]);
    }

    #[test]
    fn test_drain_waits_for_requests() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut mgr = ShutdownManager::new(dir.path())
            .with_max_wait(Duration::from_secs(5))
            .with_drain_poll(Duration::from_millis(10));

        let tracker = mgr.requests();
        tracker.register("req-1");

        // Complete the request shortly after the drain starts.
        let completer = tracker.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(100));
            completer.complete("req-1");
        });

        let started = Instant::now();
        let report = mgr.initiate("drain test");
        handle.join().expect("join");

        assert!(report.success);
        assert!(started.elapsed() < Duration::from_secs(2));
        assert_eq!(report.remaining_requests, 0);
    }

    #[test]
    fn test_drain_bound_with_stuck_requests() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut mgr = fast_manager(dir.path());

        let tracker = mgr.requests();
        for i in 0..10 {
            tracker.register(&format!("stuck-{i}"));
        }

        let started = Instant::now();
        let report = mgr.initiate("stuck drain");
        let elapsed = started.elapsed();

        // Bounded: returns promptly after max_wait, not when requests finish.
        assert!(elapsed >= Duration::from_millis(300));
        assert!(elapsed < Duration::from_secs(2));
        assert!(!report.success);
        assert_eq!(report.remaining_requests, 10);

        let drain = report
            .steps
            .iter()
            .find(|s| s.name == "wait for active requests")
            .expect("drain step");
        assert!(!drain.success);
    }

    #[test]
    fn test_failing_component_does_not_halt_sequence() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut mgr = fast_manager(dir.path());

        let later_ran = Arc::new(AtomicBool::new(false));
        let later = Arc::clone(&later_ran);

        mgr.register_component("fine", move || {
            later.store(true, Ordering::SeqCst);
            Ok(())
        });
        mgr.register_component("broken", || Err("refuses to die".to_string()));

        let resource_closed = Arc::new(AtomicBool::new(false));
        let resource = Arc::clone(&resource_closed);
        mgr.register_resource("db", move || {
            resource.store(true, Ordering::SeqCst);
            Ok(())
        });

        let report = mgr.initiate("partial failure");

        // "broken" (registered last) fails first; "fine" and the resource
        // cleanup still run.
        assert!(!report.success);
        assert!(later_ran.load(Ordering::SeqCst));
        assert!(resource_closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_thread_join() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut mgr = fast_manager(dir.path());

        let handle = std::thread::spawn(|| {
            std::thread::sleep(Duration::from_millis(50));
        });
        mgr.register_thread("worker", handle);

        let report = mgr.initiate("thread join");
        assert!(report.success);
        let join = report
            .steps
            .iter()
            .find(|s| s.name == "join threads")
            .expect("join step");
        assert!(join.success);
    }

    #[test]
    fn test_reinitiate_is_noop() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut mgr = fast_manager(dir.path());

        let first = mgr.initiate("first");
        assert!(!first.steps.is_empty());

        let second = mgr.initiate("second");
        assert!(second.steps.is_empty());
    }

    #[test]
    fn test_persisted_state_contents() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut mgr = fast_manager(dir.path());
        mgr.register_component("bridge", || Ok(()));

        let tracker = mgr.requests();
        tracker.register("stuck");

        mgr.initiate("state capture");

        let raw = std::fs::read_to_string(
            dir.path().join("process_state").join("shutdown_state.json"),
        )
        .expect("read state");
        let state: serde_json::Value = serde_json::from_str(&raw).expect("parse");
        assert_eq!(state["reason"], "state capture");
        assert_eq!(state["unfinished_requests"][0], "stuck");
        assert_eq!(state["active_components"][0], "bridge");
        // Process metrics ride along for restart diagnostics; thread count
        // may be null where the platform hides threads, but the key exists.
        assert!(state.get("memory_bytes").is_some());
        assert!(state.get("thread_count").is_some());
    }
}
