//! Daemon entry point: load the TOML config, launch logging, and run the
//! zone-transfer subsystem until a termination signal arrives.

use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::Parser;
use xferd::{manager, Config, FatalError};

#[derive(Parser)]
#[command(name = "xferd", about = "Zone-transfer subsystem of a DNSSEC signer")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "/etc/xferd.toml")]
    config: Utf8PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let config = match load_config(&args.config) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("xferd: {e}");
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = xferd::log::Logger::launch(&config.logging) {
        eprintln!("xferd: could not start logging: {e}");
        return ExitCode::FAILURE;
    }

    tracing::info!(config = %args.config, "starting");

    tokio::select! {
        result = manager::run(config) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "fatal error");
                return ExitCode::FAILURE;
            }
        }
        _ = wait_for_shutdown_signal() => {
            tracing::info!("received shutdown signal");
        }
    }

    ExitCode::SUCCESS
}

fn load_config(path: &Utf8PathBuf) -> Result<Config, FatalError> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| FatalError::with_source(format!("could not read {path}"), e))?;
    Config::from_toml_str(&text).map_err(|e| FatalError::with_source(format!("could not parse {path}"), e))
}

/// Waits for SIGTERM or SIGINT, whichever the platform delivers first; a
/// plain `ctrl_c()` would miss SIGTERM, which is how service managers
/// actually ask a daemon to stop.
#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut int = signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");

    tokio::select! {
        _ = term.recv() => {}
        _ = int.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
