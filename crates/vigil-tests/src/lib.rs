//! Shared fixtures for vigil integration tests: a scriptable service host
//! and a recording alert sink.

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use vigil_proc::{CommitInfo, ServiceHost, ServiceSpec, ServiceStatus};
use vigil_recovery::AlertSink;

/// In-memory [`ServiceHost`] whose observable state tests script directly.
pub struct ScriptedHost {
    spec: ServiceSpec,
    pub running: AtomicBool,
    /// Whether a restart brings the service up.
    pub restart_brings_up: AtomicBool,
    pub log_age: Mutex<Option<u64>>,
    pub head: Mutex<CommitInfo>,
    pub revert_ok: AtomicBool,
    pub restarts: AtomicUsize,
    pub kills: AtomicUsize,
    pub clears: AtomicUsize,
    pub reverts: AtomicUsize,
}

impl ScriptedHost {
    pub fn new(data_dir: &Path, running: bool) -> Self {
        Self::with_dirs(data_dir, data_dir, running)
    }

    pub fn with_dirs(repo_dir: &Path, data_dir: &Path, running: bool) -> Self {
        Self {
            spec: ServiceSpec {
                name: "bridge".to_string(),
                unit: "bridge.service".to_string(),
                signature: "bridge_main.py".to_string(),
                repo_dir: repo_dir.to_path_buf(),
                data_dir: data_dir.to_path_buf(),
                log_path: PathBuf::from("/tmp/bridge.log"),
                lock_patterns: vec!["*.session-wal".to_string()],
            },
            running: AtomicBool::new(running),
            restart_brings_up: AtomicBool::new(true),
            log_age: Mutex::new(Some(10)),
            head: Mutex::new(CommitInfo {
                sha: "abcdef12".to_string(),
                age_seconds: Some(600),
            }),
            revert_ok: AtomicBool::new(true),
            restarts: AtomicUsize::new(0),
            kills: AtomicUsize::new(0),
            clears: AtomicUsize::new(0),
            reverts: AtomicUsize::new(0),
        }
    }

    pub fn set_head(&self, sha: &str, age_seconds: Option<u64>) {
        *self.head.lock().expect("head lock") = CommitInfo {
            sha: sha.to_string(),
            age_seconds,
        };
    }

    pub fn set_log_age(&self, age: Option<u64>) {
        *self.log_age.lock().expect("log lock") = age;
    }
}

impl ServiceHost for ScriptedHost {
    fn spec(&self) -> &ServiceSpec {
        &self.spec
    }

    fn status(&self) -> ServiceStatus {
        let running = self.running.load(Ordering::SeqCst);
        ServiceStatus {
            running,
            pid: running.then_some(4242),
            uptime_seconds: running.then_some(120),
            memory_bytes: running.then_some(64 << 20),
            supervised_installed: true,
        }
    }

    fn restart(&self) -> bool {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        let up = self.restart_brings_up.load(Ordering::SeqCst);
        if up {
            self.running.store(true, Ordering::SeqCst);
        }
        up
    }

    fn kill_stale(&self) -> usize {
        self.kills.fetch_add(1, Ordering::SeqCst);
        let was_running = self.running.swap(false, Ordering::SeqCst);
        usize::from(was_running)
    }

    fn clear_locks(&self) -> usize {
        self.clears.fetch_add(1, Ordering::SeqCst);
        2
    }

    fn log_age_seconds(&self) -> Option<u64> {
        *self.log_age.lock().expect("log lock")
    }

    fn head_commit(&self) -> CommitInfo {
        self.head.lock().expect("head lock").clone()
    }

    fn revert_head(&self) -> Result<(), String> {
        self.reverts.fetch_add(1, Ordering::SeqCst);
        if self.revert_ok.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err("revert conflict".to_string())
        }
    }
}

/// Alert sink that remembers every message it delivered.
#[derive(Default)]
pub struct RecordingSink {
    pub messages: Mutex<Vec<(String, String)>>,
}

impl AlertSink for RecordingSink {
    fn send(&self, to: &str, message: &str) -> bool {
        self.messages
            .lock()
            .expect("messages lock")
            .push((to.to_string(), message.to_string()));
        true
    }
}

/// Sink wrapper so one recording sink can outlive the escalator that owns
/// its boxed clone.
pub struct SharedSink(pub std::sync::Arc<RecordingSink>);

impl AlertSink for SharedSink {
    fn send(&self, to: &str, message: &str) -> bool {
        self.0.send(to, message)
    }
}
