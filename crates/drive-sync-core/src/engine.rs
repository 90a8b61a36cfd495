//! SyncEngine: one vault's synchronization session.
//!
//! The engine owns the local filesystem, the remote store and the replica
//! state. Work arrives as `EngineMessage`s on a single channel:
//!
//! 1. the poll interval produces `Tick` (a reconciliation pass)
//! 2. the local store's watcher produces `Local` notifications
//! 3. the upload scheduler's timer produces `DebounceElapsed`
//! 4. the host produces `ActiveDocumentChanged`, `PushDocument`, `PullDocument`
//!
//! `run` consumes the channel and spawns each message's handler, so handlers
//! suspend at I/O and interleave. Mutual exclusion between them comes only
//! from the markers in `ReplicaState`.

use crate::config::{ConfigError, SyncConfig};
use crate::debounce::DebounceSlot;
use crate::events::{EventBus, SyncEvent};
use crate::fs::{FileSystem, FsError, LocalEvent, list_files};
use crate::remote::{RemoteError, RemoteStore};
use crate::state::{EchoFilter, ReplicaState};

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Remote error: {0}")]
    Remote(#[from] RemoteError),

    #[error("Filesystem error: {0}")]
    Fs(#[from] FsError),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("No vault named {0} found on the remote store; initialize it first")]
    VaultNotFound(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;

/// Work items consumed by the engine loop.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineMessage {
    /// Run a reconciliation pass
    Tick,
    /// Local store notification
    Local(LocalEvent),
    /// The upload scheduler's quiet period elapsed for arm `generation`
    DebounceElapsed { generation: u64 },
    /// A document was opened (or everything was closed)
    ActiveDocumentChanged(Option<String>),
    /// Manually push a document's current content
    PushDocument(String),
    /// Manually pull a document's remote content
    PullDocument(String),
    /// Stop the loop
    Shutdown,
}

pub struct SyncEngine<F: FileSystem, R: RemoteStore> {
    pub(crate) fs: F,
    pub(crate) remote: R,
    pub(crate) config: SyncConfig,
    /// Remote container holding this vault
    pub(crate) container_id: String,
    pub(crate) state: Mutex<ReplicaState>,
    pub(crate) echoes: EchoFilter,
    pub(crate) debounce: DebounceSlot,
    events: Arc<EventBus>,
    tx: mpsc::UnboundedSender<EngineMessage>,
}

impl<F, R> SyncEngine<F, R>
where
    F: FileSystem + 'static,
    R: RemoteStore + 'static,
{
    /// Create an engine for the vault stored in `container_id`.
    ///
    /// Returns the engine and the receiving end of its message channel, to be
    /// passed to `run`.
    pub fn new(
        fs: F,
        remote: R,
        config: SyncConfig,
        container_id: impl Into<String>,
    ) -> (Arc<Self>, mpsc::UnboundedReceiver<EngineMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let engine = Self {
            fs,
            remote,
            config,
            container_id: container_id.into(),
            state: Mutex::new(ReplicaState::new()),
            echoes: EchoFilter::new(),
            debounce: DebounceSlot::new(),
            events: Arc::new(EventBus::new()),
            tx,
        };
        (Arc::new(engine), rx)
    }

    /// Sender for feeding notifications and commands into the loop.
    pub fn sender(&self) -> mpsc::UnboundedSender<EngineMessage> {
        self.tx.clone()
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    pub fn fs(&self) -> &F {
        &self.fs
    }

    pub fn remote(&self) -> &R {
        &self.remote
    }

    /// Read the replica state.
    pub fn inspect<T>(&self, f: impl FnOnce(&ReplicaState) -> T) -> T {
        f(&self.state())
    }

    pub(crate) fn state(&self) -> MutexGuard<'_, ReplicaState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify(&self, event: SyncEvent) {
        self.events.emit(event);
    }

    /// Report a failed operation to the user.
    pub(crate) fn report_failure(&self, operation: &str, path: Option<&str>, err: &EngineError) {
        tracing::error!("{} failed for {:?}: {}", operation, path, err);
        self.notify(SyncEvent::Failed {
            operation: operation.to_string(),
            path: path.map(str::to_string),
            message: err.to_string(),
        });
    }

    pub(crate) fn queue(&self, msg: EngineMessage) {
        // The engine holds a receiver-side handle through `run`; a closed
        // channel only means the loop has shut down.
        if self.tx.send(msg).is_err() {
            debug!("Engine loop stopped, dropping message");
        }
    }

    /// Re-fetch both listings and swap them in together.
    pub async fn refresh_listing(&self) -> Result<()> {
        let cloud = self.remote.list(&self.container_id).await?;
        let local = list_files(&self.fs).await?;
        self.state().replace_listing(cloud, local);
        Ok(())
    }

    /// Re-fetch only the remote listing.
    pub async fn refresh_remote_listing(&self) -> Result<()> {
        let cloud = self.remote.list(&self.container_id).await?;
        self.state().replace_cloud(cloud);
        Ok(())
    }

    /// Refresh the remote listing after a completed operation; a failure
    /// only delays the update until the next pass.
    pub(crate) async fn refresh_after(&self, operation: &str) {
        if let Err(e) = self.refresh_remote_listing().await {
            warn!("Listing refresh after {} failed: {}", operation, e);
        }
    }

    /// Process one message to completion. Returns false on `Shutdown`.
    pub async fn handle(&self, msg: EngineMessage) -> bool {
        match msg {
            EngineMessage::Tick => {
                self.reconcile().await;
            }
            EngineMessage::Local(event) => {
                self.route(event).await;
            }
            EngineMessage::DebounceElapsed { generation } => {
                self.flush_debounced(generation).await;
            }
            EngineMessage::ActiveDocumentChanged(path) => {
                self.state().set_active_document(path.clone());
                if let Some(path) = path {
                    if let Err(e) = self.check_staleness(&path, false).await {
                        self.report_failure("refresh", Some(&path), &e);
                    }
                }
            }
            EngineMessage::PushDocument(path) => {
                self.push_document(&path).await;
            }
            EngineMessage::PullDocument(path) => {
                self.pull_document(&path).await;
            }
            EngineMessage::Shutdown => {
                self.debounce.cancel();
                return false;
            }
        }
        true
    }

    /// Run the engine loop until `Shutdown`.
    ///
    /// The first tick fires immediately, giving the startup reconciliation.
    /// Overlapping ticks are dropped by the reconciliation guard.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<EngineMessage>) {
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        info!(
            "Sync engine running (poll every {}s)",
            self.config.poll_interval_secs
        );

        loop {
            let msg = tokio::select! {
                _ = ticker.tick() => EngineMessage::Tick,
                msg = rx.recv() => match msg {
                    Some(msg) => msg,
                    None => break,
                },
            };

            if msg == EngineMessage::Shutdown {
                self.debounce.cancel();
                break;
            }

            self.echoes.cleanup_expired();
            let engine = Arc::clone(&self);
            tokio::spawn(async move {
                engine.handle(msg).await;
            });
        }

        info!("Sync engine stopped");
    }
}

/// Find the top-level root container, creating it when missing.
pub async fn ensure_root<R: RemoteStore + ?Sized>(remote: &R, root_name: &str) -> Result<String> {
    if let Some(id) = remote.find_container(None, root_name).await? {
        return Ok(id);
    }
    info!("Creating remote root folder {}", root_name);
    Ok(remote.create_container(None, root_name).await?)
}

/// Startup sequence: locate this vault's container.
///
/// A missing vault is fatal for normal operation; the caller must initialize
/// it explicitly (see `bulk::initialize_vault`).
pub async fn connect<R: RemoteStore + ?Sized>(remote: &R, config: &SyncConfig) -> Result<String> {
    let root = ensure_root(remote, &config.root_folder).await?;
    match remote.find_container(Some(&root), &config.vault_name).await? {
        Some(id) => {
            debug!("Found vault {} ({})", config.vault_name, id);
            Ok(id)
        }
        None => Err(EngineError::VaultNotFound(config.vault_name.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;
    use crate::remote::InMemoryRemote;

    fn config() -> SyncConfig {
        SyncConfig {
            vault_name: "notes".into(),
            ..SyncConfig::default()
        }
    }

    #[tokio::test]
    async fn test_connect_creates_root_but_not_vault() {
        let remote = InMemoryRemote::new();

        let err = connect(&remote, &config()).await.unwrap_err();
        assert!(matches!(err, EngineError::VaultNotFound(ref name) if name == "notes"));

        // Root was created on the way
        assert!(remote.find_container(None, "obsidian").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_connect_finds_existing_vault() {
        let remote = InMemoryRemote::new();
        let root = remote.seed_container(None, "obsidian");
        let vault = remote.seed_container(Some(&root), "notes");

        assert_eq!(connect(&remote, &config()).await.unwrap(), vault);
    }

    #[tokio::test]
    async fn test_refresh_listing_replaces_both_snapshots() {
        let remote = Arc::new(InMemoryRemote::new());
        let vault = remote.seed_container(None, "notes");
        remote.seed_file(&vault, "a.md", b"a", chrono::Utc::now());
        let fs = Arc::new(InMemoryFs::new());
        fs.insert("b.md", b"b");

        let (engine, _rx) = SyncEngine::new(fs, remote, config(), vault);
        engine.refresh_listing().await.unwrap();

        assert_eq!(engine.inspect(|s| s.cloud_paths()), vec!["a.md"]);
        assert_eq!(engine.inspect(|s| s.local_paths().to_vec()), vec!["b.md"]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_loop() {
        let remote = Arc::new(InMemoryRemote::new());
        let vault = remote.seed_container(None, "notes");
        let (engine, rx) = SyncEngine::new(Arc::new(InMemoryFs::new()), remote, config(), vault);

        let sender = engine.sender();
        let handle = tokio::spawn(Arc::clone(&engine).run(rx));
        sender.send(EngineMessage::Shutdown).unwrap();

        handle.await.unwrap();
    }
}
