//! ASV Daemon - Transcript indexer and live query server
//!
//! This binary tails agent transcript files into a SQLite index and serves
//! queries and live watch streams over HTTP.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! asvd serve
//!
//! # Serve on another port with a custom projects dir
//! asvd --port 9000 --projects-dir ~/work/transcripts serve
//!
//! # Show what a prune would delete, then delete it
//! asvd prune --date-to 2024-01-31 --max-messages 2
//! asvd prune --date-to 2024-01-31 --max-messages 2 --yes
//!
//! # Print index statistics
//! asvd status
//!
//! # Enable debug logging
//! RUST_LOG=asvd=debug asvd serve
//! ```
//!
//! # Signal Handling
//!
//! - SIGTERM/SIGINT: Graceful shutdown

use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args as ClapArgs, Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use asv_core::{parse_date, PruneFilter, SessionId};
use asvd::bus::NotificationBus;
use asvd::config::Config;
use asvd::deadline::Deadline;
use asvd::server::{ApiServer, AppState};
use asvd::store::{SessionStore, SqliteStore};
use asvd::tailer::{spawn_tailer, Tailer};

/// Time allowed for one-shot CLI queries against the database
const CLI_DEADLINE: Duration = Duration::from_secs(60);

/// ASV daemon - agent session transcript viewer backend
#[derive(Parser, Debug)]
#[command(name = "asvd", version, about)]
struct Args {
    /// Config file (default: $XDG_CONFIG_HOME/asv/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Address to bind
    #[arg(long, global = true)]
    host: Option<String>,

    /// Port to bind
    #[arg(long, global = true)]
    port: Option<u16>,

    /// Directory holding one subdirectory of transcripts per project
    #[arg(long, global = true)]
    projects_dir: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, global = true)]
    db_path: Option<PathBuf>,

    /// Machine label recorded on ingested sessions
    #[arg(long, global = true)]
    machine: Option<String>,

    /// Budget for bounded requests, in milliseconds
    #[arg(long, global = true)]
    write_timeout_ms: Option<u64>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Tail transcripts and serve the HTTP API (default)
    Serve,
    /// Delete sessions matching a filter
    Prune(PruneArgs),
    /// Print index statistics
    Status,
}

#[derive(ClapArgs, Debug)]
struct PruneArgs {
    /// Sessions started on this day (YYYY-MM-DD)
    #[arg(long)]
    date: Option<String>,

    /// Sessions started on or after this day
    #[arg(long)]
    date_from: Option<String>,

    /// Sessions started on or before this day
    #[arg(long)]
    date_to: Option<String>,

    #[arg(long)]
    min_messages: Option<u64>,

    #[arg(long)]
    max_messages: Option<u64>,

    #[arg(long)]
    project: Option<String>,

    #[arg(long)]
    machine: Option<String>,

    /// Actually delete; without this the candidates are only listed
    #[arg(long)]
    yes: bool,
}

impl PruneArgs {
    fn to_filter(&self) -> Result<PruneFilter> {
        let date = |field: &str, raw: &Option<String>| -> Result<_> {
            Ok(raw
                .as_deref()
                .map(|value| parse_date(field, value))
                .transpose()?)
        };
        Ok(PruneFilter {
            date: date("date", &self.date)?,
            date_from: date("date_from", &self.date_from)?,
            date_to: date("date_to", &self.date_to)?,
            min_messages: self.min_messages,
            max_messages: self.max_messages,
            project: self.project.clone(),
            machine: self.machine.clone(),
        })
    }
}

impl Args {
    /// Loads the config file and environment, then applies flags.
    fn resolve_config(&self) -> Result<Config> {
        let mut config = Config::load(self.config.as_deref()).context("Failed to load config")?;
        if let Some(host) = &self.host {
            config.host = host.clone();
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(dir) = &self.projects_dir {
            config.projects_dir = dir.clone();
        }
        if let Some(db) = &self.db_path {
            config.db_path = db.clone();
        }
        if let Some(machine) = &self.machine {
            config.machine = machine.clone();
        }
        if let Some(ms) = self.write_timeout_ms {
            config.write_timeout_ms = ms;
        }
        config.validate().context("Invalid configuration")?;
        Ok(config)
    }
}

fn init_tracing() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("asvd=info".parse()?)
                .add_directive("asv_core=info".parse()?)
                .add_directive("asv_protocol=info".parse()?),
        )
        .init();
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing()?;

    let config = args.resolve_config()?;

    match args.command.unwrap_or(Command::Serve) {
        Command::Serve => run_daemon(config).await,
        Command::Prune(prune) => run_prune(&config, &prune).await,
        Command::Status => run_status(&config).await,
    }
}

async fn run_daemon(config: Config) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "ASV daemon starting"
    );

    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;
    if !store.has_fts() {
        warn!("Full-text search unavailable, /search will answer 501");
    }
    let store: Arc<dyn SessionStore> = Arc::new(store);

    let cancel_token = CancellationToken::new();

    let shutdown_token = cancel_token.clone();
    tokio::spawn(async move {
        if let Err(e) = wait_for_shutdown_signal().await {
            error!(error = %e, "Error waiting for shutdown signal");
        }
        info!("Shutdown signal received");
        shutdown_token.cancel();
    });

    let bus = NotificationBus::new(config.watch_buffer);

    let mut tailer = Tailer::new(&config.projects_dir, store.clone(), bus.clone());
    if !config.machine.is_empty() {
        tailer = tailer.with_machine(config.machine.clone());
    }
    let tailer_handle = spawn_tailer(tailer, config.poll_interval(), cancel_token.clone());
    info!(projects_dir = %config.projects_dir.display(), "Tailer started");

    let state = AppState::new(
        store,
        bus.clone(),
        config.write_timeout(),
        cancel_token.clone(),
    );
    let addr = config.bind_addr();
    let server = ApiServer::bind(&addr, state)
        .await
        .with_context(|| format!("Failed to start server on {addr}"))?;

    let result = server.run(cancel_token.clone()).await;

    cancel_token.cancel();
    bus.shutdown();
    if let Err(e) = tailer_handle.await {
        warn!(error = %e, "Tailer task ended abnormally");
    }

    if let Err(e) = result {
        error!(error = %e, "Server error");
        return Err(e.into());
    }

    info!("ASV daemon stopped");
    Ok(())
}

async fn run_prune(config: &Config, args: &PruneArgs) -> Result<()> {
    let filter = args.to_filter()?;
    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;

    let candidates = store
        .find_prune_candidates(&filter, &Deadline::after(CLI_DEADLINE))
        .await?;

    if candidates.is_empty() {
        println!("No sessions match.");
        return Ok(());
    }

    for session in &candidates {
        let started = session
            .started_at
            .map(|ts| ts.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<40} {:<24} {:>16} {:>6} msgs",
            session.id.as_str(),
            session.project,
            started,
            session.message_count
        );
    }

    if !args.yes {
        println!(
            "{} session(s) would be deleted. Re-run with --yes to delete.",
            candidates.len()
        );
        return Ok(());
    }

    let ids: Vec<SessionId> = candidates.into_iter().map(|s| s.id).collect();
    // The filter is checked again at delete time; sessions that changed
    // since the listing (a live transcript grew) are kept.
    let deleted = store
        .prune_sessions(&filter, &ids, &Deadline::after(CLI_DEADLINE))
        .await?;
    let kept = (ids.len() as u64).saturating_sub(deleted);
    info!(deleted, kept, "Pruned sessions");
    println!("Deleted {deleted} session(s).");
    if kept > 0 {
        println!("{kept} session(s) no longer matched and were kept.");
    }
    Ok(())
}

async fn run_status(config: &Config) -> Result<()> {
    let store = SqliteStore::open(&config.db_path)
        .with_context(|| format!("Failed to open database {}", config.db_path.display()))?;
    let stats = store.stats(&Deadline::after(CLI_DEADLINE)).await?;

    println!("Database:     {}", config.db_path.display());
    println!("Projects dir: {}", config.projects_dir.display());
    println!("Listen:       http://{}", config.bind_addr());
    println!("Full-text:    {}", if store.has_fts() { "yes" } else { "no" });
    println!("Sessions:     {}", stats.session_count);
    println!("Messages:     {}", stats.message_count);
    println!("Projects:     {}", stats.project_count);
    println!("Machines:     {}", stats.machine_count);
    if let (Some(first), Some(last)) = (stats.earliest_session, stats.latest_session) {
        println!("Range:        {} .. {}", first.to_rfc3339(), last.to_rfc3339());
    }
    Ok(())
}

async fn wait_for_shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
