//! CLI entry point for the repost-proof service
//!
//! Parses command line arguments, installs logging and runs the daemon until
//! SIGINT or SIGTERM.

use clap::Parser;
use repostproof::{Config, Daemon};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Repost-proof video transcoding service
#[derive(Parser, Debug)]
#[command(name = "repostproof")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file; defaults apply when it does not exist
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Skip startup checks (work dir, ffmpeg). For testing only.
    #[arg(long, default_value = "false")]
    skip_checks: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    tracing::info!(config = %args.config.display(), "repostproof starting");

    let config = match Config::load_or_default(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "failed to load configuration");
            return ExitCode::FAILURE;
        }
    };

    let daemon = if args.skip_checks {
        Daemon::new_without_checks(config)
    } else {
        Daemon::with_config(config)
    };

    let daemon = match daemon {
        Ok(daemon) => daemon,
        Err(e) => {
            tracing::error!(error = %e, "failed to initialize daemon");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = daemon.run().await {
        tracing::error!(error = %e, "daemon error");
        return ExitCode::FAILURE;
    }

    ExitCode::SUCCESS
}
