//! Signal handling for the cooperative loops.
//!
//! Handlers do no work: they flip a single flag that the loops observe.
//! Recovery and process primitives are never invoked from handler context.

use signal_hook::consts::{SIGHUP, SIGINT, SIGQUIT, SIGTERM};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// A flag set by SIGTERM / SIGINT / SIGQUIT / SIGHUP.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    flag: Arc<AtomicBool>,
}

impl ShutdownSignal {
    /// Register the flag for all shutdown signals.
    pub fn install() -> std::io::Result<Self> {
        let flag = Arc::new(AtomicBool::new(false));
        for signal in [SIGTERM, SIGINT, SIGQUIT, SIGHUP] {
            signal_hook::flag::register(signal, Arc::clone(&flag))?;
        }
        Ok(Self { flag })
    }

    /// A signal-free instance for embedding and tests.
    pub fn manual() -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn triggered(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
    }

    /// Trip the flag programmatically (operator command, tests).
    pub fn trigger(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    /// The underlying flag, for loops that take `&AtomicBool`.
    pub fn flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.flag)
    }
}
