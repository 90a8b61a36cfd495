//! drive-sync-core: Bidirectional synchronization between a local vault and
//! a cloud object store.
//!
//! This crate provides the core functionality for:
//! - Reconciling the vault against the remote listing on a fixed interval
//! - Routing local change notifications to remote renames, uploads and deletes
//! - Debounced uploads of edited documents
//! - Pulling documents whose remote copy is newer than their sync stamp
//! - FileSystem and RemoteStore trait abstractions

pub mod bulk;
pub mod config;
pub mod debounce;
pub mod engine;
pub mod events;
pub mod fs;
pub mod naming;
pub mod reconcile;
pub mod remote;
pub mod router;
pub mod stamp;
pub mod staleness;
pub mod state;

pub use bulk::{initialize_vault, upload_all};
pub use config::{ConfigError, SyncConfig};
pub use engine::{EngineError, EngineMessage, SyncEngine, connect, ensure_root};
pub use events::{EventBus, EventLog, Subscription, SyncEvent};
pub use fs::{FileEntry, FileSystem, FsError, InMemoryFs, LocalEvent, list_files};
pub use reconcile::{ReconcilePlan, ReconcileReport};
pub use remote::{InMemoryRemote, RemoteCall, RemoteEntry, RemoteError, RemoteFile, RemoteStore};
pub use router::Classified;
pub use staleness::StalenessOutcome;
pub use state::{EchoFilter, PathState, ReplicaState};
