//! Process, git, and filesystem primitives for vigil.
//!
//! This crate is the only layer that touches the OS: subprocess invocation,
//! PID discovery, signals, file sentinels, and git plumbing all live here.
//! Higher crates consume the [`host::ServiceHost`] trait, which makes them
//! fully testable with in-memory substitutes.

#![forbid(unsafe_code)]

pub mod exec;
pub mod flags;
pub mod fsio;
pub mod git;
pub mod host;
pub mod procs;
pub mod service;

use thiserror::Error;

/// Errors from the primitive layer.
///
/// Non-zero exit from a subprocess is NOT an error — callers read it from
/// [`exec::ExecOutput`]. Errors here are reserved for conditions the caller
/// must branch on: spawn failure, deadline expiry, raw I/O trouble.
#[derive(Debug, Error)]
pub enum ProcError {
    #[error("command `{command}` timed out after {timeout_secs}s")]
    Timeout { command: String, timeout_secs: u64 },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        source: std::io::Error,
    },

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type ProcResult<T> = Result<T, ProcError>;

pub use exec::{CommandSpec, ExecOutput, run};
pub use git::{CommitInfo, GitRepo, PullOutcome};
pub use host::{LocalServiceHost, ServiceHost, ServiceSpec, ServiceStatus};
pub use service::{ServiceManager, SystemctlManager};
