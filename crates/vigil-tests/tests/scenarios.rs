//! End-to-end recovery and update scenarios across the vigil crates:
//! - single restart of a dead service
//! - stale-log kill + restart
//! - crash storm on a fresh commit, with and without auto-revert
//! - recovery exhaustion handing off to a human
//! - cron update holding back a critical dependency change
//! - signal-driven graceful shutdown with a live request drain

use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use vigil_crashlog::{CRASH_HISTORY_FILE, CrashLog, EventKind};
use vigil_health::{TickOutcome, Watchdog, WatchdogThresholds};
use vigil_proc::exec::{CommandSpec, run};
use vigil_proc::{ServiceHost, flags};
use vigil_recovery::{AUTO_REVERT_FLAG, Escalator, RecoveryTiming};
use vigil_tests::{RecordingSink, ScriptedHost, SharedSink};
use vigil_update::{
    CRITICAL_UPGRADE_REASON, ProbeTiming, RESTART_REQUESTED_FLAG, UPGRADE_PENDING_FLAG,
    UpdateConfig, UpdatePlan, UpdateStatus, Updater,
};

// ─── Helpers ──────────────────────────────────────────────────────────────────

fn append_crash_at(dir: &Path, offset_secs: f64, sha: &str) {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("clock")
        .as_secs_f64();
    let line = format!(
        "{{\"timestamp\":{},\"event_type\":\"crash\",\"commit_sha\":\"{}\",\"commit_age_seconds\":60.0,\"reason\":null}}",
        now - offset_secs,
        sha
    );
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(CRASH_HISTORY_FILE))
        .expect("open");
    writeln!(file, "{line}").expect("write");
}

fn watchdog_with_sink(host: Arc<ScriptedHost>, sink: Arc<RecordingSink>) -> Watchdog {
    let escalator = Escalator::new(
        Arc::clone(&host) as Arc<dyn ServiceHost>,
        Box::new(SharedSink(sink)),
        "supervisor",
    )
    .with_timing(RecoveryTiming::fast());
    Watchdog::new(host, escalator).with_thresholds(WatchdogThresholds::default())
}

// ─── Scenario 1: single restart ──────────────────────────────────────────────

#[test]
fn test_scenario_single_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let host = Arc::new(ScriptedHost::new(dir.path(), false));
    let sink = Arc::new(RecordingSink::default());
    let mut watchdog = watchdog_with_sink(Arc::clone(&host), Arc::clone(&sink));

    let assessment = watchdog.check();
    assert_eq!(assessment.recovery_level, 1);

    let outcome = watchdog.tick();
    assert_eq!(outcome, TickOutcome::Recovered { level: 1 });

    assert_eq!(host.restarts.load(Ordering::SeqCst), 1);
    assert_eq!(host.kills.load(Ordering::SeqCst), 0);
    assert!(sink.messages.lock().expect("lock").is_empty());
    assert!(
        !dir.path().join("recovery-in-progress").exists(),
        "lock must be released after recovery"
    );
}

// ─── Scenario 2: stale logs ──────────────────────────────────────────────────

#[test]
fn test_scenario_stale_logs_kill_and_restart() {
    let dir = tempfile::tempdir().expect("tempdir");
    let host = Arc::new(ScriptedHost::new(dir.path(), true));
    host.set_log_age(Some(500));
    let sink = Arc::new(RecordingSink::default());
    let mut watchdog = watchdog_with_sink(Arc::clone(&host), sink);

    let assessment = watchdog.check();
    assert_eq!(assessment.recovery_level, 2);
    assert!(assessment.process_running);
    assert!(!assessment.logs_fresh);

    let outcome = watchdog.tick();
    assert_eq!(outcome, TickOutcome::Recovered { level: 2 });
    assert_eq!(host.kills.load(Ordering::SeqCst), 1);
    assert_eq!(host.restarts.load(Ordering::SeqCst), 1);
}

// ─── Scenario 3: crash storm on a fresh commit, auto-revert enabled ──────────

#[test]
fn test_scenario_crash_storm_with_auto_revert() {
    let dir = tempfile::tempdir().expect("tempdir");
    flags::set(dir.path(), AUTO_REVERT_FLAG, "").expect("flag");
    for offset in [100.0, 300.0, 600.0, 900.0] {
        append_crash_at(dir.path(), offset, "abcdef12");
    }

    let host = Arc::new(ScriptedHost::new(dir.path(), true));
    host.set_head("abcdef12", Some(600));
    let sink = Arc::new(RecordingSink::default());
    let mut watchdog = watchdog_with_sink(Arc::clone(&host), Arc::clone(&sink));

    let log = CrashLog::new(dir.path());
    let pattern = log.detect_pattern(&host.head_commit());
    assert!(pattern.found);
    assert_eq!(pattern.suspect_commit.as_deref(), Some("abcdef12"));

    let assessment = watchdog.check();
    assert_eq!(assessment.recovery_level, 4);

    let outcome = watchdog.tick();
    assert_eq!(outcome, TickOutcome::Recovered { level: 4 });
    assert_eq!(host.reverts.load(Ordering::SeqCst), 1);
    assert_eq!(host.kills.load(Ordering::SeqCst), 1);
    assert_eq!(host.clears.load(Ordering::SeqCst), 1);

    let messages = sink.messages.lock().expect("lock");
    assert_eq!(messages.len(), 1);
    assert!(messages[0].1.contains("Auto-revert triggered"));
}

// ─── Scenario 4: crash storm without auto-revert ─────────────────────────────

#[test]
fn test_scenario_crash_storm_without_auto_revert() {
    let dir = tempfile::tempdir().expect("tempdir");
    for offset in [100.0, 300.0, 600.0, 900.0] {
        append_crash_at(dir.path(), offset, "abcdef12");
    }

    let host = Arc::new(ScriptedHost::new(dir.path(), true));
    host.set_head("abcdef12", Some(600));
    let sink = Arc::new(RecordingSink::default());
    let mut watchdog = watchdog_with_sink(Arc::clone(&host), Arc::clone(&sink));

    let assessment = watchdog.check();
    assert_eq!(assessment.recovery_level, 3, "level 4 gated without the flag");

    let outcome = watchdog.tick();
    assert_eq!(outcome, TickOutcome::Recovered { level: 3 });
    assert_eq!(host.reverts.load(Ordering::SeqCst), 0);
    assert_eq!(host.clears.load(Ordering::SeqCst), 1);
    assert_eq!(host.restarts.load(Ordering::SeqCst), 1);
}

// ─── Scenario 5: exhaustion ──────────────────────────────────────────────────

#[test]
fn test_scenario_exhaustion_hands_off_to_human() {
    let dir = tempfile::tempdir().expect("tempdir");
    for offset in [50.0, 150.0, 300.0, 500.0, 800.0, 1200.0] {
        append_crash_at(dir.path(), offset, "abcdef12");
    }

    let host = Arc::new(ScriptedHost::new(dir.path(), true));
    host.set_head("abcdef12", Some(600));
    let sink = Arc::new(RecordingSink::default());
    let mut watchdog = watchdog_with_sink(Arc::clone(&host), Arc::clone(&sink));

    let assessment = watchdog.check();
    assert_eq!(assessment.recovery_level, 5);

    let outcome = watchdog.tick();
    assert_eq!(outcome, TickOutcome::HandedOff { level: 5 });
    assert_eq!(host.restarts.load(Ordering::SeqCst), 0, "no automatic action");

    let messages = sink.messages.lock().expect("lock");
    assert_eq!(messages.len(), 1);
    assert!(messages[0].1.contains("Manual intervention required"));

    let log = CrashLog::new(dir.path());
    let exhaustion: Vec<_> = log
        .recent_crashes(3600)
        .into_iter()
        .filter(|e| e.reason.as_deref() == Some("Recovery exhausted - alerting human"))
        .collect();
    assert_eq!(exhaustion.len(), 1);
    assert_eq!(exhaustion[0].event_type, EventKind::Crash);
}

// ─── Scenario 6: cron update with a critical dependency change ───────────────

fn git_ok(dir: &Path, args: &[&str]) {
    let out = run(&CommandSpec::new("git", args).cwd(dir)).expect("git");
    assert!(out.success(), "git {:?} failed: {}", args, out.combined());
}

fn commit_pyproject(dir: &Path, telethon_pin: &str, message: &str) {
    std::fs::write(
        dir.join("pyproject.toml"),
        format!("[project]\ndependencies = [\n    \"telethon=={telethon_pin}\",\n]\n"),
    )
    .expect("write");
    git_ok(dir, &["add", "."]);
    git_ok(dir, &["commit", "-q", "-m", message]);
}

#[test]
fn test_scenario_cron_update_holds_critical_dep() {
    let upstream = tempfile::tempdir().expect("tempdir");
    git_ok(upstream.path(), &["init", "-q", "-b", "main"]);
    git_ok(upstream.path(), &["config", "user.email", "ops@vigil.test"]);
    git_ok(upstream.path(), &["config", "user.name", "vigil tests"]);
    commit_pyproject(upstream.path(), "1.36.0", "initial");

    let clone = tempfile::tempdir().expect("tempdir");
    let out = run(&CommandSpec::new(
        "git",
        &[
            "clone",
            "-q",
            upstream.path().to_str().expect("path"),
            clone.path().to_str().expect("path"),
        ],
    ))
    .expect("clone");
    assert!(out.success(), "{}", out.combined());

    // Three upstream commits, one bumping the pinned critical dep.
    commit_pyproject(upstream.path(), "1.37.0", "bump telethon");
    std::fs::write(upstream.path().join("a.py"), "\n").expect("write");
    git_ok(upstream.path(), &["add", "."]);
    git_ok(upstream.path(), &["commit", "-q", "-m", "one"]);
    std::fs::write(upstream.path().join("b.py"), "\n").expect("write");
    git_ok(upstream.path(), &["add", "."]);
    git_ok(upstream.path(), &["commit", "-q", "-m", "two"]);

    let data = tempfile::tempdir().expect("tempdir");
    let host = Arc::new(ScriptedHost::with_dirs(clone.path(), data.path(), true));
    let data_dir = host.spec().data_dir.clone();

    let marker = data.path().join("synced");
    let mut plan = UpdatePlan::default();
    plan.critical_deps = vec!["telethon".to_string()];
    plan.required_tools = vec!["git".to_string()];
    plan.sync_commands = vec![vigil_update::SyncCommand::new(
        "marker",
        "touch",
        &[marker.to_str().expect("path")],
    )];

    let updater = Updater::new(Arc::clone(&host) as Arc<dyn ServiceHost>, plan)
        .with_probe(ProbeTiming::fast());

    let report = updater.run(&UpdateConfig::cron());

    // Dep sync skipped, interlock set, cooperative restart still requested.
    assert!(!marker.exists());
    let pending = flags::read(&data_dir, UPGRADE_PENDING_FLAG).expect("pending flag");
    assert_eq!(pending.detail.as_deref(), Some(CRITICAL_UPGRADE_REASON));

    let restart = flags::read(&data_dir, RESTART_REQUESTED_FLAG).expect("restart flag");
    assert_eq!(restart.detail.as_deref(), Some("3 commit(s)"));

    assert_eq!(report.status(), UpdateStatus::Warning);
    assert_eq!(report.exit_code(), 1);
    assert_eq!(host.restarts.load(Ordering::SeqCst), 0);
}

// ─── Scenario 7: signal-driven shutdown with a request drain ─────────────────

#[test]
fn test_scenario_signal_driven_shutdown() {
    use std::sync::atomic::AtomicBool;
    use std::time::Duration;
    use vigil_lifecycle::{ShutdownManager, ShutdownSignal};

    let dir = tempfile::tempdir().expect("tempdir");
    let mut manager = ShutdownManager::new(dir.path())
        .with_max_wait(Duration::from_secs(5))
        .with_drain_poll(Duration::from_millis(10));

    let gate_closed = Arc::new(AtomicBool::new(false));
    let gate = Arc::clone(&gate_closed);
    manager.on_gate_close(move || gate.store(true, Ordering::SeqCst));

    let order = Arc::new(std::sync::Mutex::new(Vec::new()));
    for name in ["store", "bridge-client", "poller"] {
        let order = Arc::clone(&order);
        let label = name.to_string();
        manager.register_component(name, move || {
            order.lock().expect("lock").push(label.clone());
            Ok(())
        });
    }

    // A request completes while the drain is polling.
    let requests = manager.requests();
    requests.register("msg-17");
    let completer = requests.clone();
    let worker = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(80));
        completer.complete("msg-17");
    });

    let signal = ShutdownSignal::manual();
    signal.trigger();
    assert!(signal.triggered());

    let report = manager.initiate("SIGTERM received");
    worker.join().expect("join");

    assert!(report.success);
    assert_eq!(report.exit_code(), 0);
    assert!(gate_closed.load(Ordering::SeqCst));
    // LIFO: last registered stops first.
    assert_eq!(
        *order.lock().expect("lock"),
        vec!["poller", "bridge-client", "store"]
    );
    assert!(
        dir.path()
            .join("process_state")
            .join("shutdown_state.json")
            .exists()
    );
}
