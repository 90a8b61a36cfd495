//! drive-sync: keep a vault directory in sync with a remote store.
//!
//! Uses drive-sync-core with the native filesystem, a notify-based watcher
//! and a directory-backed remote store.

use anyhow::{Context, Result, bail};
use clap::Parser;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use drive_sync_core::{
    EngineError, EngineMessage, EventBus, SyncConfig, SyncEngine, connect, initialize_vault,
    upload_all,
};
use drive_sync_daemon::{DirRemote, FileWatcher, NativeFs, subscribe_logging};
use std::sync::Arc;

#[derive(Parser, Debug)]
#[command(name = "drive-sync")]
#[command(about = "Vault <-> remote store sync daemon")]
struct Args {
    /// Path to the vault directory
    #[arg(short, long)]
    vault: PathBuf,

    /// Directory holding the remote store
    #[arg(short, long)]
    remote: PathBuf,

    /// JSON settings file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds between reconciliation passes
    #[arg(long)]
    poll_interval: Option<u64>,

    /// Pull binary files whenever they are opened
    #[arg(long)]
    auto_refresh_binary: bool,

    /// Remote vault name (defaults to the vault directory name)
    #[arg(long)]
    vault_name: Option<String>,

    /// Remote root folder holding all vaults
    #[arg(long)]
    root_folder: Option<String>,

    /// Create the remote vault from the local files, then sync
    #[arg(long, conflicts_with_all = ["upload_all", "download_all"])]
    init: bool,

    /// Replace the remote vault with the local files before syncing
    #[arg(long, conflicts_with = "download_all")]
    upload_all: bool,

    /// Replace the local files with the remote vault before syncing
    #[arg(long)]
    download_all: bool,

    /// Document to treat as open (checked for staleness on startup)
    #[arg(long)]
    open: Option<String>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

fn load_config(args: &Args, vault: &std::path::Path) -> Result<SyncConfig> {
    let mut config = match &args.config {
        Some(path) => SyncConfig::from_json_file(path)?,
        None => SyncConfig::default(),
    };

    if let Some(secs) = args.poll_interval {
        config.poll_interval_secs = secs;
    }
    if args.auto_refresh_binary {
        config.auto_refresh_binary = true;
    }
    if let Some(name) = &args.vault_name {
        config.vault_name = name.clone();
    }
    if let Some(root) = &args.root_folder {
        config.root_folder = root.clone();
    }
    if config.vault_name.is_empty() {
        config.vault_name = vault
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();
    }

    config.validate()?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Set up logging - respects RUST_LOG env var, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,drive_sync=debug"
    } else {
        "info,drive_sync=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let vault_path = args
        .vault
        .canonicalize()
        .with_context(|| format!("vault directory {:?} not found", args.vault))?;
    let config = load_config(&args, &vault_path)?;

    info!("Starting drive-sync");
    info!("Vault path: {:?}", vault_path);
    info!("Remote store: {:?}", args.remote);

    let fs = NativeFs::new(vault_path.clone());
    let remote = DirRemote::open(&args.remote).await?;

    let mut container_id = match connect(&remote, &config).await {
        Ok(id) if args.init => {
            bail!(
                "vault {} already exists remotely ({}); use --upload-all to replace it",
                config.vault_name,
                id
            );
        }
        Ok(id) => id,
        Err(EngineError::VaultNotFound(name)) if args.init => {
            info!("Initializing vault {}", name);
            let events = Arc::new(EventBus::new());
            let _notices = subscribe_logging(&events);
            initialize_vault(&fs, &remote, &config, &events).await?
        }
        Err(EngineError::VaultNotFound(name)) => {
            bail!("vault {} does not exist remotely; run with --init first", name);
        }
        Err(e) => return Err(e.into()),
    };

    if args.upload_all {
        let events = Arc::new(EventBus::new());
        let _notices = subscribe_logging(&events);
        container_id = upload_all(&fs, &remote, &config, &events, &container_id).await?;
    }

    let (engine, rx) = SyncEngine::new(fs, remote, config, container_id);
    let _notices = subscribe_logging(engine.events());

    if args.download_all {
        let (downloaded, failed) = engine.download_all().await?;
        info!("Downloaded {} file(s), {} failed", downloaded, failed);
    }

    let mut watcher = FileWatcher::new(vault_path)?;
    info!("File watcher started");

    let sender = engine.sender();
    if let Some(path) = args.open {
        if sender.send(EngineMessage::ActiveDocumentChanged(Some(path))).is_err() {
            warn!("Engine stopped before startup finished");
        }
    }

    let run = tokio::spawn(Arc::clone(&engine).run(rx));

    info!("Daemon running. Press Ctrl+C to stop.");

    loop {
        tokio::select! {
            Some(event) = watcher.event_rx().recv() => {
                if sender.send(EngineMessage::Local(event)).is_err() {
                    break;
                }
            }

            // Handle graceful shutdown
            _ = tokio::signal::ctrl_c() => {
                info!("Shutdown signal received");
                break;
            }
        }
    }

    if sender.send(EngineMessage::Shutdown).is_err() {
        warn!("Engine loop already stopped");
    }
    run.await?;

    info!("Shutting down");
    Ok(())
}
