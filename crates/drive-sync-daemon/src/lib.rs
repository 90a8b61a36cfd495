//! drive-sync-daemon library: native adapters for the sync engine.
//!
//! Exposes the filesystem, watcher and directory-backed remote store so they
//! can be used from integration tests.

pub mod bucket;
pub mod native_fs;
pub mod notices;
pub mod watcher;

pub use bucket::DirRemote;
pub use native_fs::NativeFs;
pub use notices::subscribe_logging;
pub use watcher::FileWatcher;
