//! Synchronous subprocess execution with mandatory deadlines.
//!
//! Every call carries a timeout; expiry kills the child and surfaces
//! [`ProcError::Timeout`]. Non-zero exit is reported in the output record,
//! never as an error.

use crate::{ProcError, ProcResult};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Default deadline for primitive-level subprocess calls.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll interval while waiting for a child to exit.
const WAIT_POLL: Duration = Duration::from_millis(25);

/// A command to execute, built with the builder methods.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
    pub input: Option<String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            program: program.into(),
            args: args.iter().map(|a| (*a).to_string()).collect(),
            cwd: None,
            timeout: DEFAULT_TIMEOUT,
            input: None,
        }
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn input(mut self, text: impl Into<String>) -> Self {
        self.input = Some(text.into());
        self
    }

    /// Display form for logs and error messages.
    pub fn display(&self) -> String {
        if self.args.is_empty() {
            self.program.clone()
        } else {
            format!("{} {}", self.program, self.args.join(" "))
        }
    }
}

/// Captured result of a completed subprocess.
#[derive(Debug, Clone)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Stdout and stderr concatenated, trimmed.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr).trim().to_string()
    }

    /// First line of stdout, trimmed.
    pub fn first_line(&self) -> String {
        self.stdout.lines().next().unwrap_or("").trim().to_string()
    }
}

/// Run a command to completion, enforcing the given deadline.
///
/// Stdout and stderr are drained by reader threads so a chatty child can
/// never deadlock against a full pipe. If the deadline expires the child is
/// killed and [`ProcError::Timeout`] is returned.
pub fn run(spec: &CommandSpec) -> ProcResult<ExecOutput> {
    let mut command = Command::new(&spec.program);
    command
        .args(&spec.args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if spec.input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

    if let Some(dir) = &spec.cwd {
        command.current_dir(dir);
    }

    let mut child = command.spawn().map_err(|source| ProcError::Spawn {
        command: spec.display(),
        source,
    })?;

    if let Some(text) = &spec.input {
        if let Some(mut stdin) = child.stdin.take() {
            let bytes = text.clone().into_bytes();
            // Writer thread: the child may exit without reading; ignore EPIPE.
            thread::spawn(move || {
                let _ = stdin.write_all(&bytes);
            });
        }
    }

    let stdout_reader = child.stdout.take().map(spawn_reader);
    let stderr_reader = child.stderr.take().map(spawn_reader);

    let deadline = Instant::now() + spec.timeout;
    let status = loop {
        match child.try_wait()? {
            Some(status) => break status,
            None => {
                if Instant::now() >= deadline {
                    warn!(command = %spec.display(), timeout_secs = spec.timeout.as_secs(), "killing timed-out child");
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(ProcError::Timeout {
                        command: spec.display(),
                        timeout_secs: spec.timeout.as_secs(),
                    });
                }
                thread::sleep(WAIT_POLL);
            }
        }
    };

    let stdout = join_reader(stdout_reader);
    let stderr = join_reader(stderr_reader);
    let exit_code = status.code().unwrap_or(-1);

    debug!(command = %spec.display(), exit_code, "subprocess completed");

    Ok(ExecOutput {
        exit_code,
        stdout,
        stderr,
    })
}

fn spawn_reader<R: Read + Send + 'static>(mut source: R) -> thread::JoinHandle<String> {
    thread::spawn(move || {
        let mut buf = String::new();
        let _ = source.read_to_string(&mut buf);
        buf
    })
}

fn join_reader(handle: Option<thread::JoinHandle<String>>) -> String {
    handle
        .and_then(|h| h.join().ok())
        .unwrap_or_default()
}
