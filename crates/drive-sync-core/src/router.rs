//! Event router: turn local change notifications into remote operations.
//!
//! Routing happens in two steps. `classify` looks at the notification and
//! the replica state and decides what the change means; the matching
//! handler then performs it. Classification is pure so the decision table
//! can be tested on its own.

use crate::engine::{Result, SyncEngine};
use crate::events::SyncEvent;
use crate::fs::{FileSystem, LocalEvent};
use crate::naming::{file_name, has_synced_marker, insert_synced_marker, is_text_document, rebase};
use crate::remote::{RemoteEntry, RemoteStore};
use crate::stamp;
use crate::state::{PathState, ReplicaState};

use chrono::Utc;
use tracing::{debug, info, warn};

/// What a local notification means for the remote store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classified {
    /// Caused by the engine's own write; dropped
    Echo,
    /// A tracked file was renamed
    Rename { from: String, to: String },
    /// A folder holding tracked files was renamed
    FolderRename { from: String, to: String },
    /// A new file announced as a rename or a modify
    Masquerade { path: String },
    /// A new attachment that still needs its marker
    NewAttachment { path: String },
    /// A tracked file was deleted
    Delete { path: String },
    /// A folder holding tracked files was deleted
    FolderDelete { path: String },
    /// A tracked file's content changed
    Edit { path: String },
    /// Nothing to do
    Ignored,
}

/// Decide what a notification means, ignoring echoes.
pub fn classify(state: &ReplicaState, event: &LocalEvent) -> Classified {
    match event {
        LocalEvent::Renamed { from, to } => {
            if state.is_tracked(from) {
                Classified::Rename {
                    from: from.clone(),
                    to: to.clone(),
                }
            } else if !state.tracked_within(from).is_empty() {
                Classified::FolderRename {
                    from: from.clone(),
                    to: to.clone(),
                }
            } else {
                Classified::Masquerade { path: to.clone() }
            }
        }
        LocalEvent::Created { path } => {
            if !state.is_tracked(path) && !is_text_document(path) && !has_synced_marker(path) {
                Classified::NewAttachment { path: path.clone() }
            } else {
                // New notes arrive as a rename or modify once they have content
                Classified::Ignored
            }
        }
        LocalEvent::Deleted { path } => {
            if state.is_tracked(path) {
                Classified::Delete { path: path.clone() }
            } else if !state.tracked_within(path).is_empty() {
                Classified::FolderDelete { path: path.clone() }
            } else {
                Classified::Ignored
            }
        }
        LocalEvent::Modified { path } => {
            if state.is_tracked(path) {
                Classified::Edit { path: path.clone() }
            } else {
                Classified::Masquerade { path: path.clone() }
            }
        }
    }
}

impl<F, R> SyncEngine<F, R>
where
    F: FileSystem + 'static,
    R: RemoteStore + 'static,
{
    /// Classify a notification, dropping it when the engine caused it.
    pub fn classify(&self, event: &LocalEvent) -> Classified {
        if self.echoes.consume(event.path()) {
            return Classified::Echo;
        }
        classify(&self.state(), event)
    }

    /// Handle one local notification.
    pub async fn route(&self, event: LocalEvent) {
        let classified = self.classify(&event);
        debug!("{:?} classified as {:?}", event, classified);

        match classified {
            Classified::Echo | Classified::Ignored => {}
            Classified::Rename { from, to } => {
                self.rename_remote(&from, &to).await;
                self.refresh_after("rename").await;
            }
            Classified::FolderRename { from, to } => {
                let children = self.state().tracked_within(&from);
                for child in children {
                    if let Some(new_name) = rebase(&child.name, &from, &to) {
                        self.rename_remote(&child.name, &new_name).await;
                    }
                }
                self.refresh_after("folder rename").await;
            }
            Classified::Masquerade { path } => self.upload_new_note(&path).await,
            Classified::NewAttachment { path } => self.upload_attachment(&path).await,
            Classified::Delete { path } => {
                if self.delete_remote(&path).await {
                    self.refresh_after("delete").await;
                }
            }
            Classified::FolderDelete { path } => {
                let children = self.state().tracked_within(&path);
                let mut any = false;
                for child in children {
                    any |= self.delete_remote(&child.name).await;
                }
                if any {
                    self.refresh_after("folder delete").await;
                }
            }
            Classified::Edit { path } => self.record_edit(&path),
        }
    }

    /// Rename one tracked file remotely.
    ///
    /// Both names are held as `Renaming` while the remote call is in flight,
    /// so a concurrent pass neither re-downloads the old name nor treats the
    /// new one as an orphan. A name that is already busy is left to its owner.
    async fn rename_remote(&self, from: &str, to: &str) {
        let (id, claimed_from, claimed_to) = {
            let mut state = self.state();
            let Some(id) = state.remote_id(from) else {
                warn!("No remote id for {}, ignoring rename", from);
                return;
            };
            if state.path_state(from) == PathState::Renaming {
                debug!("{} is already being renamed", from);
                return;
            }
            let claimed_from = state.begin(from, PathState::Renaming).is_ok();
            let claimed_to = state.begin(to, PathState::Renaming).is_ok();
            state.rename_cloud(from, to);
            (id, claimed_from, claimed_to)
        };

        let result = self.remote.rename(&id, to).await;

        {
            let mut state = self.state();
            if claimed_from {
                state.finish_if(from, PathState::Renaming);
            }
            if claimed_to {
                state.finish_if(to, PathState::Renaming);
            }
        }

        match result {
            Ok(()) => {
                info!("Renamed {} -> {}", from, to);
                self.notify(SyncEvent::Renamed {
                    from: from.to_string(),
                    to: to.to_string(),
                });
            }
            Err(e) => self.report_failure("rename", Some(from), &e.into()),
        }
    }

    /// First upload of a note that is not tracked yet.
    pub(crate) async fn upload_new_note(&self, path: &str) {
        if !is_text_document(path) {
            debug!("{} is not a note, not uploading", path);
            return;
        }

        {
            let mut state = self.state();
            if state.is_tracked(path) {
                return;
            }
            match state.begin(path, PathState::Uploading) {
                Ok(()) => {}
                Err(PathState::Uploading) => {
                    // The in-flight upload re-checks this once it lands
                    state.mark_resync(path);
                    return;
                }
                Err(current) => {
                    debug!("{} is busy ({:?}), not uploading", path, current);
                    return;
                }
            }
        }

        let result = self.push_new_note(path).await;

        let repush = {
            let mut state = self.state();
            state.finish_if(path, PathState::Uploading);
            let pending = state.is_resync_pending(path);
            if result.is_err() {
                state.clear_resync(path);
            }
            pending && result.is_ok()
        };

        match result {
            Ok(()) => {
                info!("Uploaded {}", path);
                self.refresh_after("upload").await;
                self.notify(SyncEvent::Uploaded {
                    path: path.to_string(),
                });
                if repush {
                    self.schedule_upload(path);
                }
            }
            Err(e) => self.report_failure("upload", Some(path), &e),
        }
    }

    async fn push_new_note(&self, path: &str) -> Result<()> {
        let content = self.fs.read_text(path).await?;
        let bytes = match stamp::ensure_stamp(&content, Utc::now()) {
            Some(stamped) => {
                self.echoes.mark(path);
                self.fs.write(path, stamped.as_bytes()).await?;
                stamped.into_bytes()
            }
            None => content.into_bytes(),
        };

        let id = self.remote.put(path, &bytes, &self.container_id).await?;
        self.state().push_cloud(RemoteEntry {
            id,
            name: path.to_string(),
            modified_at: Utc::now(),
        });
        Ok(())
    }

    /// First upload of an attachment: rename it to carry the synced marker,
    /// then push it under the new name.
    pub(crate) async fn upload_attachment(&self, path: &str) {
        let synced = insert_synced_marker(path);
        {
            let mut state = self.state();
            if state.is_tracked(&synced) {
                debug!("{} already exists remotely", synced);
                return;
            }
            if let Err(current) = state.begin(&synced, PathState::Uploading) {
                debug!("{} is busy ({:?}), not uploading", synced, current);
                return;
            }
        }

        let result = self.push_attachment(path, &synced).await;
        self.state().finish_if(&synced, PathState::Uploading);

        match result {
            Ok(()) => {
                info!("Uploaded attachment {} as {}", path, synced);
                self.notify(SyncEvent::AttachmentRenamed {
                    from: path.to_string(),
                    to: synced.clone(),
                    file_name: file_name(&synced).to_string(),
                });
                self.refresh_after("upload").await;
            }
            Err(e) => self.report_failure("upload", Some(path), &e),
        }
    }

    async fn push_attachment(&self, path: &str, synced: &str) -> Result<()> {
        self.echoes.mark(synced);
        self.fs.rename(path, synced).await?;

        let bytes = self.fs.read(synced).await?;
        let id = self.remote.put(synced, &bytes, &self.container_id).await?;
        self.state().push_cloud(RemoteEntry {
            id,
            name: synced.to_string(),
            modified_at: Utc::now(),
        });
        Ok(())
    }

    /// Delete one tracked file remotely. Returns whether a remote call was
    /// made.
    async fn delete_remote(&self, path: &str) -> bool {
        let (id, claimed) = {
            let mut state = self.state();
            if state.remote_deletes_suppressed() {
                debug!("Remote deletes suppressed, keeping {}", path);
                return false;
            }
            let Some(id) = state.remote_id(path) else {
                warn!("No remote id for {}, ignoring delete", path);
                return false;
            };
            match state.begin(path, PathState::Deleting) {
                Ok(()) => (id, true),
                Err(PathState::Deleting) => {
                    debug!("{} is already being deleted", path);
                    return false;
                }
                // A push in flight loses; its update will fail on the gone id
                Err(_) => (id, false),
            }
        };

        let result = self.remote.delete(&id).await;
        if claimed {
            self.state().finish_if(path, PathState::Deleting);
        }

        match result {
            Ok(true) => {
                info!("Deleted {}", path);
                self.notify(SyncEvent::Deleted {
                    path: path.to_string(),
                });
            }
            Ok(false) => debug!("{} was already gone remotely", path),
            Err(e) => self.report_failure("delete", Some(path), &e.into()),
        }
        true
    }

    /// A tracked file changed: push it once the edits settle.
    fn record_edit(&self, path: &str) {
        let in_flight = {
            let mut state = self.state();
            state.mark_resync(path);
            matches!(
                state.path_state(path),
                PathState::Writing | PathState::Uploading
            )
        };
        if in_flight {
            debug!("{} has a push in flight, it will pick the edit up", path);
            return;
        }
        self.schedule_upload(path);
    }
}
