//! Terminal frontend for the drover copy engine.
//!
//! Reads a job list (the same JSON shape the desktop frontend persists),
//! runs the engine on a background thread, and renders the event stream as
//! a progress bar. Credential requests are answered from the terminal.

use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;
use std::thread;

use clap::{Args, Parser, Subcommand};
use crossbeam_channel::Receiver;
use drover_core::credentials::{CredentialRequest, CredentialSource, ShareCredentials};
use drover_core::engine::{CopyEngine, Summary};
use drover_core::events::EngineEvent;
use drover_core::planner::{CopyJob, OperationKind};
use drover_core::progress::human_bytes;
use drover_core::EngineConfig;
use eyre::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};

#[derive(Parser)]
#[command(name = "drover")]
#[command(about = "Copies backup job file sets between local paths and network shares")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Copy each job's sources to its destinations
    Backup(RunArgs),
    /// Copy each job's destinations back onto its sources
    Restore(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Path to a JSON job list: [{id, sources, destinations, selected}]
    #[arg(long)]
    jobs: PathBuf,
    /// Worker threads (default: min(logical CPUs, 8))
    #[arg(long)]
    workers: Option<usize>,
    /// Print a line per copied/skipped file
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    color_eyre::install()?;
    env_logger::init();

    let cli = Cli::parse();
    let (kind, args) = match cli.command {
        Commands::Backup(args) => (OperationKind::Backup, args),
        Commands::Restore(args) => (OperationKind::Restore, args),
    };

    let raw = fs::read_to_string(&args.jobs)
        .with_context(|| format!("reading job list {}", args.jobs.display()))?;
    let jobs: Vec<CopyJob> =
        serde_json::from_str(&raw).with_context(|| format!("parsing {}", args.jobs.display()))?;

    let mut config = EngineConfig::default();
    if let Some(workers) = args.workers {
        config.workers = workers.max(1);
    }

    let (credentials, requests) = CredentialSource::channel();
    thread::spawn(move || serve_credentials(requests));

    let (engine, events) = CopyEngine::new(config, credentials)?;
    let runner = thread::spawn(move || engine.run(&jobs, kind));

    render_events(events, args.verbose);
    let summary = runner
        .join()
        .map_err(|_| eyre::eyre!("engine thread panicked"))?;

    report(&summary);
    if summary.cancelled || summary.errors > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Drain engine events until the terminal one, driving the progress bar.
fn render_events(events: Receiver<EngineEvent>, verbose: bool) {
    let bar = ProgressBar::new(100);
    bar.set_style(
        ProgressStyle::with_template("{bar:40.cyan/blue} {pos:>3}% {msg}")
            .expect("static template"),
    );

    for event in events.iter() {
        match event {
            EngineEvent::FileCopied { source, bytes, .. } => {
                if verbose {
                    bar.println(format!("copied {source} ({})", human_bytes(bytes)));
                }
            }
            EngineEvent::FileSkipped { source, reason } => {
                if verbose {
                    bar.println(format!("skipped {source}: {reason}"));
                }
            }
            EngineEvent::FileError { source, message } => {
                bar.println(format!("error {source}: {message}"));
            }
            EngineEvent::ProgressUpdated { percent, status } => {
                bar.set_position(percent as u64);
                bar.set_message(status);
            }
            EngineEvent::SudoPasswordRequested => {
                // The prompt itself happens on the credential thread.
                bar.println("elevated privileges required for mounting");
            }
            EngineEvent::SmbErrorCancel => {
                bar.println("network share failure, cancelling remaining files");
            }
            EngineEvent::OperationCompleted => {
                break;
            }
        }
    }
    bar.finish_and_clear();
}

/// Answer engine credential requests from the terminal.
fn serve_credentials(requests: Receiver<CredentialRequest>) {
    for request in requests {
        match request {
            CredentialRequest::Share {
                server,
                share,
                reply,
            } => {
                eprintln!("credentials for //{server}/{share}");
                let username = prompt("  username: ");
                let password = prompt("  password: ");
                let domain = prompt("  domain (blank for none): ");
                let _ = reply.send(Some(ShareCredentials {
                    username,
                    password,
                    domain,
                }));
            }
            CredentialRequest::SudoPassword { reply } => {
                let password = prompt("sudo password: ");
                let _ = reply.send(if password.is_empty() {
                    None
                } else {
                    Some(password)
                });
            }
        }
    }
}

fn prompt(label: &str) -> String {
    eprint!("{label}");
    let _ = io::stderr().flush();
    let mut line = String::new();
    let _ = io::stdin().lock().read_line(&mut line);
    line.trim_end_matches(['\r', '\n']).to_string()
}

fn report(summary: &Summary) {
    let state = if summary.cancelled { "cancelled" } else { "completed" };
    println!(
        "{state}: {} copied, {} skipped, {} errors ({} of {}) in {:.2?}",
        summary.copied,
        summary.skipped,
        summary.errors,
        human_bytes(summary.processed_bytes),
        human_bytes(summary.total_bytes),
        summary.duration,
    );
}
