//! update — pull source, sync dependencies, verify the environment, and hand
//! off to a service restart.

use clap::{ArgGroup, Parser};
use std::path::PathBuf;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};
use vigil_update::{UpdateConfig, UpdateStatus};
use vigild::VigilConfig;

#[derive(Parser)]
#[command(name = "update")]
#[command(about = "Update orchestrator for the supervised service")]
#[command(version)]
#[command(group(ArgGroup::new("mode").required(true).args(["full", "cron", "verify"])))]
struct Cli {
    /// Full update: all steps, interactive, restarts the service.
    #[arg(long)]
    full: bool,

    /// Unattended update: minimal steps, requests a cooperative restart.
    #[arg(long)]
    cron: bool,

    /// Verify the environment only; mutate nothing.
    #[arg(long)]
    verify: bool,

    /// Machine-readable report on stdout.
    #[arg(long)]
    json: bool,

    /// Suppress progress output.
    #[arg(long)]
    quiet: bool,

    /// Path to config file.
    #[arg(short, long, default_value = "vigil.json")]
    config: PathBuf,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Keep stdout clean for JSON consumers; route logs through stderr
    // elsewhere only when progress output is wanted.
    if !cli.json && !cli.quiet {
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .init();
    }

    let config = VigilConfig::load_or_default(&cli.config)?;
    let updater = vigild::build_updater(&config);

    let update_config = if cli.full {
        UpdateConfig::full()
    } else if cli.cron {
        UpdateConfig::cron()
    } else {
        UpdateConfig::verify_only()
    };

    let report = updater.run(&update_config);

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else if !cli.quiet {
        match report.status() {
            UpdateStatus::Success => println!("[update] completed successfully"),
            UpdateStatus::Warning => {
                println!(
                    "[update] completed with {} warning(s)",
                    report.warnings.len()
                );
                for warning in &report.warnings {
                    println!("[update]   WARN: {warning}");
                }
            }
            UpdateStatus::Failure => {
                println!("[update] FAILED with {} error(s)", report.errors.len());
                for error in &report.errors {
                    println!("[update]   ERROR: {error}");
                }
            }
        }

        if let Some(git) = &report.git {
            println!("[update] HEAD: {}", git.after);
        }
    }

    std::process::exit(report.exit_code());
}
