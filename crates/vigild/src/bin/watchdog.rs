//! watchdog — external health monitor for the supervised service.
//!
//! Runs as a separate process (via the service manager's timer or cron) so it
//! can detect and recover from crashes the service cannot report itself.

use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use vigil_lifecycle::ShutdownSignal;
use vigild::VigilConfig;

#[derive(Parser)]
#[command(name = "watchdog")]
#[command(about = "Service health watchdog with escalating recovery")]
#[command(version)]
struct Cli {
    /// Run exactly one health check + recovery cycle (default).
    #[arg(long)]
    once: bool,

    /// Run continuously at the configured interval.
    #[arg(long, conflicts_with = "once")]
    r#loop: bool,

    /// Assess and print health, do not act.
    #[arg(long, conflicts_with_all = ["once", "loop"])]
    check_only: bool,

    /// Path to config file.
    #[arg(short, long, default_value = "vigil.json")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = VigilConfig::load_or_default(&cli.config)?;
    let host = hostname::get()
        .map(|h| h.to_string_lossy().to_string())
        .unwrap_or_else(|_| "unknown".to_string());
    info!(host = %host, service = %config.service.name, "watchdog starting");

    let mut watchdog = vigild::build_watchdog(&config);

    // A held-back critical upgrade deserves a nudge on every run.
    if let Some(pending) = vigil_update::pending_upgrade(&config.service.data_dir) {
        warn!(since = %pending.raw, "critical dependency upgrade pending, run update --full");
    }

    if cli.check_only {
        let assessment = watchdog.check();
        println!("Healthy: {}", assessment.healthy);
        println!("Process running: {}", assessment.process_running);
        println!("Logs fresh: {}", assessment.logs_fresh);
        println!("No crash pattern: {}", assessment.no_crash_pattern);
        if !assessment.issues.is_empty() {
            println!("Issues: {}", assessment.issues.join(", "));
        }
        println!("Recovery level: {}", assessment.recovery_level);
        std::process::exit(if assessment.healthy { 0 } else { 1 });
    }

    if cli.r#loop {
        let shutdown = ShutdownSignal::install()?;
        let flag = shutdown.flag();
        watchdog.run_loop(&flag);
        return Ok(());
    }

    // Single-shot mode for the external scheduler.
    let outcome = watchdog.tick();
    info!(?outcome, "health check complete");
    std::process::exit(if outcome.is_ok() { 0 } else { 1 });
}
