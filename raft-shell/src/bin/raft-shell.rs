//! Interactive shell over an in-process Raft cluster.
//!
//! Every member listed with `--peer` (or in the config file) is started in
//! this process; the bootstrap member campaigns so a leader exists quickly.
//! Command output goes to stdout, logs go to stderr (`RUST_LOG` controls them).
//!
//! ```bash
//! cargo run --bin raft-shell -- \
//!   --peer 1=127.0.0.1:7101,2=127.0.0.1:7102,3=127.0.0.1:7103
//!
//! cargo run --bin raft-shell -- -e "put k1 v1" -e "delete k1" -e "get k1"
//! ```

use std::io::{self, BufRead, IsTerminal, Write};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, ValueHint};
use tracing::{info, warn};

use raft_shell::cluster::ClusterConnectionManager;
use raft_shell::config::{PeerEntry, ShellConfig};
use raft_shell::runtime::{NodeHandle, spawn_node};
use raft_shell::shell::{CommandStatus, Dispatch, Dispatcher};

const PROMPT: &str = "raft> ";

#[derive(Parser, Debug)]
#[command(author, version, about = "Key-value shell over a Raft cluster")]
struct Args {
    /// TOML configuration file
    #[arg(long, short, value_hint = ValueHint::FilePath)]
    config: Option<PathBuf>,

    /// Comma-separated peer map: id=addr,id=addr,... (replaces the config file's peers)
    #[arg(long, value_delimiter = ',', value_hint = ValueHint::Other)]
    peer: Vec<String>,

    /// Member that campaigns at startup (defaults to the lowest id)
    #[arg(long)]
    bootstrap: Option<u64>,

    /// Bound on a single store operation, in milliseconds
    #[arg(long)]
    operation_timeout_ms: Option<u64>,

    /// Leader resolution rounds before a command reports failure
    #[arg(long)]
    connect_attempts: Option<u32>,

    /// Run these lines, then exit, instead of reading stdin
    #[arg(long = "execute", short = 'e')]
    execute: Vec<String>,
}

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(io::stderr)
        .try_init();
}

/// File values first, then command-line overrides.
fn load_config(args: &Args) -> Result<ShellConfig> {
    let mut config = match &args.config {
        Some(path) => ShellConfig::load(path)?,
        None => ShellConfig::default(),
    };
    if !args.peer.is_empty() {
        config.cluster.peers = args
            .peer
            .iter()
            .map(|entry| PeerEntry::parse(entry))
            .collect::<Result<_>>()?;
    }
    if let Some(bootstrap) = args.bootstrap {
        config.cluster.bootstrap = Some(bootstrap);
    }
    if let Some(timeout) = args.operation_timeout_ms {
        config.connection.operation_timeout_ms = timeout;
    }
    if let Some(attempts) = args.connect_attempts {
        config.connection.connect_attempts = attempts;
    }
    config.validate()?;
    Ok(config)
}

fn start_cluster(config: &ShellConfig) -> Result<Vec<NodeHandle>> {
    let topology = config.topology()?;
    let handles = topology
        .node_configs()
        .into_iter()
        .map(spawn_node)
        .collect::<Result<Vec<_>>>()?;

    let bootstrap = topology.bootstrap_id();
    if let Some(handle) = handles.iter().find(|handle| handle.id() == bootstrap) {
        handle.campaign()?;
    }
    info!(members = handles.len(), bootstrap, "cluster started");
    Ok(handles)
}

/// Runs every line through the dispatcher. Returns whether any command failed.
fn run_lines(
    dispatcher: &Dispatcher,
    lines: impl Iterator<Item = io::Result<String>>,
    interactive: bool,
) -> Result<bool> {
    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut any_failed = false;

    if interactive {
        write!(out, "{PROMPT}")?;
        out.flush()?;
    }
    for line in lines {
        let line = line.context("failed to read input")?;
        let trimmed = line.trim();
        if matches!(trimmed, "exit" | "quit") {
            break;
        }

        match dispatcher.dispatch_line(trimmed, &mut out)? {
            Dispatch::Ran {
                status:
                    CommandStatus::Failed(_)
                    | CommandStatus::UsageShown
                    | CommandStatus::UnknownTopic(_),
                ..
            }
            | Dispatch::Unknown(_) => any_failed = true,
            Dispatch::Ran { .. } | Dispatch::Empty => {}
        }

        if interactive {
            write!(out, "{PROMPT}")?;
        }
        out.flush()?;
    }
    Ok(any_failed)
}

fn main() -> Result<ExitCode> {
    init_tracing();

    let args = Args::parse();
    let config = load_config(&args)?;
    let handles = start_cluster(&config)?;

    let manager = ClusterConnectionManager::new(handles.iter().cloned(), config.connection.clone());
    let dispatcher = Dispatcher::new(Arc::new(manager));

    let result = if args.execute.is_empty() {
        let stdin = io::stdin();
        let interactive = stdin.is_terminal();
        run_lines(&dispatcher, stdin.lock().lines(), interactive)
    } else {
        run_lines(&dispatcher, args.execute.clone().into_iter().map(Ok), false)
    };

    for handle in &handles {
        if let Err(err) = handle.shutdown() {
            warn!(node_id = handle.id(), error = %err, "shutdown failed");
        }
    }

    Ok(if result? {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
