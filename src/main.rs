//! wabridge CLI entry point.
//!
//! Provides `start`, `status`, and `reset` subcommands for running the bridge,
//! inspecting persisted state, or wiping it to force re-pairing and re-sync.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

use wabridge::bridge::Bridge;
use wabridge::config::{runtime_paths, Config, RuntimePaths};
use wabridge::network::http::HttpNetworkClient;
use wabridge::session::CredentialStore;
use wabridge::store::Store;

/// wabridge: mirrors a WhatsApp account into SQLite and sends on behalf of an agent.
#[derive(Parser)]
#[command(name = "wabridge", version, about)]
struct Cli {
    /// Runtime directory (defaults to `~/.wabridge`).
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    /// Config file (defaults to `<home>/config.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Run the bridge until Ctrl-C.
    Start,
    /// Show credential presence and stored counts.
    Status,
    /// Delete the database and credential (forces re-pairing and re-sync).
    Reset {
        /// Also delete the downloaded media cache.
        #[arg(long)]
        media: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let paths = match &cli.home {
        Some(home) => RuntimePaths::under(home),
        None => runtime_paths()?,
    };
    let config_path = cli.config.clone().unwrap_or_else(|| paths.config_file.clone());

    match cli.command {
        Command::Start => handle_start(&paths, &config_path).await,
        Command::Status => handle_status(&paths, &config_path).await,
        Command::Reset { media } => handle_reset(&paths, media),
    }
}

/// Run the bridge service.
async fn handle_start(paths: &RuntimePaths, config_path: &Path) -> anyhow::Result<()> {
    std::fs::create_dir_all(&paths.root)
        .with_context(|| format!("failed to create {}", paths.root.display()))?;
    let _logging_guard = wabridge::logging::init_production(&paths.logs_dir)?;

    let config = Config::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;
    let client = Arc::new(HttpNetworkClient::new(&config.network));
    info!(sidecar = %client.base_url(), "starting wabridge");

    let bridge = Bridge::open(&config, paths, client).await?;

    if let Some(mut codes) = bridge.pairing_codes() {
        tokio::spawn(async move {
            while let Some(code) = codes.recv().await {
                println!("Scan with WhatsApp > Linked devices > Link a device:\n\n{code}\n");
            }
        });
    }

    let mut state = bridge.subscribe_state();
    tokio::select! {
        result = bridge.start() => {
            if let Err(e) = result {
                bridge.shutdown().await;
                return Err(e).context("failed to establish session");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("interrupted before the session came up");
            bridge.shutdown().await;
            return Ok(());
        }
    }

    loop {
        tokio::select! {
            changed = state.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = *state.borrow_and_update();
                println!("session: {current}");
                if let Some(e) = bridge.session().auth_failure() {
                    bridge.shutdown().await;
                    return Err(e).context("session lost; run `wabridge reset` and pair again");
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    let stats = bridge.ingest_stats();
    info!(
        applied = stats.applied(),
        duplicates = stats.duplicates(),
        failed = stats.failed(),
        "ingestion totals"
    );
    bridge.shutdown().await;
    Ok(())
}

/// Print a summary of persisted state.
async fn handle_status(paths: &RuntimePaths, config_path: &Path) -> anyhow::Result<()> {
    wabridge::logging::init_cli();
    let config = Config::load(config_path)
        .with_context(|| format!("failed to load {}", config_path.display()))?;

    let credentials = CredentialStore::new(&paths.credential_file);
    println!("runtime:    {}", paths.root.display());
    println!("sidecar:    {}", config.network.base_url);
    println!(
        "credential: {}",
        if credentials.exists() { "present" } else { "absent (will pair on start)" }
    );

    if !paths.database.exists() {
        println!("database:   absent");
        return Ok(());
    }
    let store = Store::open(&paths.database)
        .await
        .with_context(|| format!("failed to open {}", paths.database.display()))?;
    let stats = store.stats().await.context("failed to read database counts")?;
    println!("database:   {}", paths.database.display());
    println!("  chats:    {}", stats.chats);
    println!("  contacts: {}", stats.contacts);
    println!("  messages: {}", stats.messages);
    println!(
        "  media:    {} ({} downloaded)",
        stats.media, stats.media_downloaded
    );
    store.close().await;
    Ok(())
}

/// Remove the database (with its WAL files) and credential.
fn handle_reset(paths: &RuntimePaths, media: bool) -> anyhow::Result<()> {
    wabridge::logging::init_cli();

    let mut targets = vec![paths.database.clone()];
    for suffix in ["-wal", "-shm"] {
        let mut sidecar = paths.database.clone().into_os_string();
        sidecar.push(suffix);
        targets.push(PathBuf::from(sidecar));
    }
    targets.push(paths.credential_file.clone());

    for target in &targets {
        match std::fs::remove_file(target) {
            Ok(()) => println!("removed {}", target.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(e).with_context(|| format!("failed to remove {}", target.display()));
            }
        }
    }

    if media {
        match std::fs::remove_dir_all(&paths.media_dir) {
            Ok(()) => println!("removed {}", paths.media_dir.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, dir = %paths.media_dir.display(), "failed to remove media cache"),
        }
    }
    println!("reset complete; the next start pairs a new device and re-syncs history");
    Ok(())
}
