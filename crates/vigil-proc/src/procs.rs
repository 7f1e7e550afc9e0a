//! Process discovery by command-line signature, plus signal delivery.
//!
//! Discovery matches a substring against the full command line rather than a
//! PID file: stale PID files outlive crashes, a live command line does not.

use nix::sys::signal::{Signal, kill as nix_kill};
use nix::unistd::Pid;
use sysinfo::System;
use tracing::{debug, warn};

/// Per-PID stats for a discovered process.
#[derive(Debug, Clone, Copy)]
pub struct ProcStats {
    pub uptime_seconds: u64,
    pub memory_bytes: u64,
    /// `None` on platforms where the process table does not expose threads.
    pub thread_count: Option<usize>,
}

/// Find PIDs whose command line contains `pattern`.
///
/// The calling process is excluded so a supervisor whose own argv mentions
/// the service signature never matches itself.
pub fn find_pids_matching(pattern: &str) -> Vec<u32> {
    let mut sys = System::new_all();
    sys.refresh_all();

    let own_pid = std::process::id();
    let mut pids: Vec<u32> = sys
        .processes()
        .iter()
        .filter_map(|(pid, process)| {
            let cmdline = process
                .cmd()
                .iter()
                .map(|part| part.to_string_lossy())
                .collect::<Vec<_>>()
                .join(" ");
            let pid = pid.as_u32();
            (pid != own_pid && cmdline.contains(pattern)).then_some(pid)
        })
        .collect();
    pids.sort_unstable();
    pids
}

/// Stats for a single PID, `None` if it is gone.
pub fn stats(pid: u32) -> Option<ProcStats> {
    let mut sys = System::new_all();
    sys.refresh_all();
    let process = sys.process(sysinfo::Pid::from_u32(pid))?;
    Some(ProcStats {
        uptime_seconds: process.run_time(),
        memory_bytes: process.memory(),
        thread_count: process.tasks().map(|tasks| tasks.len()),
    })
}

/// Send a signal, swallowing not-found and not-permitted as no-ops.
pub fn send_signal(pid: u32, signal: Signal) {
    match nix_kill(Pid::from_raw(pid as i32), signal) {
        Ok(()) => debug!(pid, signal = %signal, "signal sent"),
        Err(nix::errno::Errno::ESRCH) | Err(nix::errno::Errno::EPERM) => {}
        Err(e) => warn!(pid, signal = %signal, error = %e, "signal delivery failed"),
    }
}

/// Polite termination request (SIGTERM).
pub fn terminate(pid: u32) {
    send_signal(pid, Signal::SIGTERM);
}

/// Immediate kill (SIGKILL).
pub fn force_kill(pid: u32) {
    send_signal(pid, Signal::SIGKILL);
}

/// SIGKILL every process matching `pattern`. Returns the count signalled.
pub fn kill_matching(pattern: &str) -> usize {
    let pids = find_pids_matching(pattern);
    for pid in &pids {
        send_signal(*pid, Signal::SIGKILL);
        debug!(pid, pattern, "killed stale process");
    }
    pids.len()
}

/// PIDs of direct and transitive children of this process.
pub fn child_pids() -> Vec<u32> {
    let mut sys = System::new_all();
    sys.refresh_all();

    let own = std::process::id();
    let mut children: Vec<u32> = Vec::new();
    let mut frontier = vec![own];

    while let Some(parent) = frontier.pop() {
        for (pid, process) in sys.processes() {
            if process.parent().map(|p| p.as_u32()) == Some(parent) {
                let pid = pid.as_u32();
                if !children.contains(&pid) {
                    children.push(pid);
                    frontier.push(pid);
                }
            }
        }
    }

    children
}
