//! User-facing notices, rendered to the log.

use drive_sync_core::{EventBus, Subscription, SyncEvent};
use std::sync::Arc;
use tracing::{info, warn};

/// Log every engine event. Keep the returned subscription alive.
pub fn subscribe_logging(events: &Arc<EventBus>) -> Subscription {
    events.subscribe(|event| match event {
        SyncEvent::DownloadStarted { total } => {
            info!("Downloading {} file(s), this might take a while", total)
        }
        SyncEvent::Downloaded { path, index, total } => {
            info!("[{}/{}] Downloaded {}", index, total, path)
        }
        SyncEvent::DownloadComplete { total } => info!("Downloaded {} file(s)", total),
        SyncEvent::Uploaded { path } => info!("Uploaded {}", path),
        SyncEvent::AttachmentRenamed { from, file_name, .. } => warn!(
            "{} was renamed to {}; update links that point to it",
            from, file_name
        ),
        SyncEvent::Pushed { path } => info!("Pushed {}", path),
        SyncEvent::Pulled { path } => info!("Refreshed {} from the remote store", path),
        SyncEvent::Renamed { from, to } => info!("Renamed {} to {}", from, to),
        SyncEvent::Deleted { path } => info!("Deleted {}", path),
        SyncEvent::OrphanRemoved { path } => {
            info!("Removed {} (deleted on another device)", path)
        }
        SyncEvent::NotOnRemote { path } => warn!("{} is not on the remote store yet", path),
        SyncEvent::Progress { message } => info!("{}", message),
        SyncEvent::Failed {
            operation,
            path,
            message,
        } => match path {
            Some(path) => warn!("Could not {} {}: {}", operation, path, message),
            None => warn!("Could not {}: {}", operation, message),
        },
    })
}
