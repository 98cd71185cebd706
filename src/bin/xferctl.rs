//! `xferctl`: a small CLI that speaks the control socket protocol to a
//! running `xferd`.

use std::process::ExitCode;

use camino::Utf8PathBuf;
use clap::{Parser, Subcommand};
use xferd::common::ansi::{eprintln, println, red};
use xferd::control;

#[derive(Parser)]
#[command(name = "xferctl", about = "Control a running xferd daemon")]
struct Args {
    /// Path to the daemon's control socket.
    #[arg(short, long, default_value = "/run/xferd/control.sock")]
    socket: Utf8PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Re-read each zone's on-disk journal.
    Reload,
    /// Immediately retry a zone's transfer, skipping its retry backoff.
    Retransfer { zone: String },
    /// Print the current serial and refresh timer state for one zone, or
    /// all zones if none is given.
    Status { zone: Option<String> },
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    let line = match &args.command {
        Command::Reload => "reload".to_string(),
        Command::Retransfer { zone } => format!("retransfer {zone}"),
        Command::Status { zone: Some(zone) } => format!("status {zone}"),
        Command::Status { zone: None } => "status".to_string(),
    };

    match control::send_command(&args.socket, &line).await {
        Ok(response) => {
            for line in &response.lines {
                if response.exit_code == 0 {
                    println!("{line}");
                } else {
                    eprintln!("{}", red(line));
                }
            }
            if response.exit_code == 0 {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            }
        }
        Err(e) => {
            eprintln!("{}: {}", red("xferctl"), e);
            ExitCode::FAILURE
        }
    }
}
