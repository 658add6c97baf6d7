//! treesync: Incremental, content-aware directory tree synchronization
//!
//! - Ordered walking with glob and .gitignore filtering
//! - Hard-link aware copies
//! - Differential rounds over any bidirectional byte stream
//! - BLAKE3 digests of everything written

mod debug_log;

use std::path::{Path, PathBuf};
use std::process::Stdio;

use clap::builder::styling::{AnsiColor, Effects};
use clap::{Parser, Subcommand, ValueEnum, builder::Styles};
use color_eyre::Result;
use color_eyre::eyre::{WrapErr, eyre};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use treesync_core::{ContentHashIndex, ContentMode, Snapshot, SyncConfig, format_listing};
use treesync_transport::{FramedReader, FramedWriter, Receiver, RoundSummary, Sender, copy_tree};

const STYLES: Styles = Styles::styled()
    .header(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .usage(AnsiColor::Green.on_default().effects(Effects::BOLD))
    .literal(AnsiColor::Cyan.on_default().effects(Effects::BOLD))
    .placeholder(AnsiColor::Cyan.on_default())
    .valid(AnsiColor::Green.on_default())
    .invalid(AnsiColor::Red.on_default());

#[derive(Parser)]
#[command(name = "treesync")]
#[command(version)]
#[command(styles = STYLES)]
#[command(about = "Incremental directory tree synchronization")]
#[command(long_about = r#"
treesync mirrors a directory tree to another location, transferring only
what changed since the last successful round.

Features:
  • Ordered walk     - deterministic listings, filtered by globs or .gitignore
  • Hard links       - shared storage in the source stays shared
  • Differential     - repeated rounds only move changed content
  • Any byte stream  - stdio, ssh, or anything that pipes

Examples:
  treesync walk ./project                           Print the ordered listing
  treesync copy ./project /backup/project           Local mirror
  treesync push ./project ssh host treesync receive /srv/project
"#)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Write a detailed trace log to the temp directory
    #[arg(long, global = true)]
    debug_log: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum WalkFormat {
    Listing,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the ordered listing of a directory
    Walk {
        /// Directory to walk
        path: PathBuf,

        /// Output format
        #[arg(short, long, value_enum, default_value = "listing")]
        format: WalkFormat,
    },

    /// Mirror a directory into another local directory
    Copy {
        /// Source directory
        source: PathBuf,

        /// Destination directory
        dest: PathBuf,

        /// Snapshot file enabling differential copies
        #[arg(long)]
        state: Option<PathBuf>,

        /// Retrieve file content inline instead of concurrently
        #[arg(long)]
        sync: bool,
    },

    /// Send a directory over stdin/stdout to a peer running `receive`
    Send {
        /// Source directory
        path: PathBuf,
    },

    /// Receive a directory over stdin/stdout from a peer running `send`
    Receive {
        /// Destination directory
        dest: PathBuf,

        /// Snapshot file enabling differential rounds across restarts
        #[arg(long)]
        state: Option<PathBuf>,

        /// Maximum concurrent content retrievals
        #[arg(short, long)]
        concurrency: Option<usize>,
    },

    /// Send a directory to a command that runs `receive`, e.g. over ssh
    Push {
        /// Source directory
        path: PathBuf,

        /// Command and arguments to spawn
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },

    /// Show version and build info
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();

    let session = debug_log::init(cli.verbose, cli.debug_log);
    if let Some(session) = &session {
        info!("Debug log: {}", session.log_path.display());
    }

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());

    match cli.command {
        Commands::Version => {
            eprintln!("treesync {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Walk { path, format } => {
            walk_command(&path, format, &cancel).await?;
        }
        Commands::Copy {
            source,
            dest,
            state,
            sync,
        } => {
            copy_command(&source, &dest, state.as_deref(), sync, &cancel).await?;
        }
        Commands::Send { path } => {
            send_command(&path, &cancel).await?;
        }
        Commands::Receive {
            dest,
            state,
            concurrency,
        } => {
            receive_command(&dest, state, concurrency, &cancel).await?;
        }
        Commands::Push { path, command } => {
            push_command(&path, &command, &cancel).await?;
        }
    }

    Ok(())
}

/// Cancel running rounds on Ctrl-C
fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                warn!("Interrupted, cancelling");
                cancel.cancel();
            }
            Err(e) => debug!("Failed to listen for Ctrl-C: {e}"),
        }
    });
}

async fn walk_command(path: &Path, format: WalkFormat, cancel: &CancellationToken) -> Result<()> {
    let config = SyncConfig::load(path)?;
    let walker = config.walker(path);
    let walk_cancel = cancel.clone();
    let stats = tokio::task::spawn_blocking(move || walker.collect(&walk_cancel)).await??;

    match format {
        WalkFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        WalkFormat::Listing => {
            for stat in &stats {
                println!("{}", format_listing(stat));
            }
        }
    }
    info!("{} entries", stats.len());
    Ok(())
}

async fn copy_command(
    source: &Path,
    dest: &Path,
    state: Option<&Path>,
    sync: bool,
    cancel: &CancellationToken,
) -> Result<()> {
    let config = SyncConfig::load(source)?;
    let previous = match state {
        Some(state) => Snapshot::load(state)?,
        None => Snapshot::empty(),
    };
    let mode = if sync {
        ContentMode::Sync
    } else {
        config.content_mode()
    };

    let snapshot = copy_tree(&config.walker(source), dest, &previous, mode, cancel).await?;
    if let Some(state) = state {
        snapshot.save(state)?;
    }
    info!("Mirrored {} entries", snapshot.len());
    Ok(())
}

async fn send_command(path: &Path, cancel: &CancellationToken) -> Result<()> {
    let config = SyncConfig::load(path)?;
    let sender = Sender::new(config.walker(path)).with_chunk_size(config.chunk_size);

    let mut tx = FramedWriter::new(tokio::io::stdout());
    let mut rx = FramedReader::new(tokio::io::stdin());
    sender.send(&mut tx, &mut rx, cancel).await?;
    Ok(())
}

async fn receive_command(
    dest: &Path,
    state: Option<PathBuf>,
    concurrency: Option<usize>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mode = ContentMode::Async {
        max_in_flight: concurrency.unwrap_or(treesync_core::config::DEFAULT_CONCURRENCY),
    };
    let mut receiver = Receiver::new(dest).with_mode(mode);
    if let Some(state) = state {
        receiver = receiver.with_state_file(state)?;
    }

    let index = std::sync::Arc::new(ContentHashIndex::new());
    receiver = receiver.with_observer(index.clone());

    let mut tx = FramedWriter::new(tokio::io::stdout());
    let mut rx = FramedReader::new(tokio::io::stdin());
    let summary = receiver.receive(&mut tx, &mut rx, cancel).await?;

    print_summary(&summary);
    debug!("Indexed {} entries", index.len());
    Ok(())
}

async fn push_command(path: &Path, command: &[String], cancel: &CancellationToken) -> Result<()> {
    let (program, args) = command
        .split_first()
        .ok_or_else(|| eyre!("no command given"))?;

    let config = SyncConfig::load(path)?;
    let sender = Sender::new(config.walker(path)).with_chunk_size(config.chunk_size);

    info!("Spawning {}", command.join(" "));
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .wrap_err_with(|| format!("failed to spawn {program}"))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| eyre!("child stdin not captured"))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| eyre!("child stdout not captured"))?;

    let mut tx = FramedWriter::new(stdin);
    let mut rx = FramedReader::new(stdout);
    let sent = sender.send(&mut tx, &mut rx, cancel).await;
    drop(tx);

    let status = child.wait().await?;
    let summary = sent?;
    if !status.success() {
        return Err(eyre!("{program} exited with {status}"));
    }

    info!(
        "Pushed {} entries, {} files ({} bytes)",
        summary.entries, summary.files_served, summary.bytes_sent
    );
    Ok(())
}

fn print_summary(summary: &RoundSummary) {
    for change in &summary.changes {
        debug!("{:?} {}", change.kind, change.path.display());
    }
    eprintln!(
        "{} added, {} deleted, {} files transferred",
        summary.added(),
        summary.deleted(),
        summary.requested.len()
    );
}
