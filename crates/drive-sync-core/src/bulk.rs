//! Whole-vault operations and manual per-document commands.
//!
//! `initialize_vault` and `upload_all` run before an engine exists (there is
//! no vault container to attach one to yet). `download_all`,
//! `push_document` and `pull_document` run on a live engine.

use crate::config::SyncConfig;
use crate::engine::{Result, SyncEngine, ensure_root};
use crate::events::{EventBus, SyncEvent};
use crate::fs::{FileSystem, list_files};
use crate::naming::is_text_document;
use crate::remote::RemoteStore;
use crate::staleness::StalenessOutcome;
use crate::state::PathState;

use tracing::{debug, info, warn};

/// Create the vault container and upload every local file into it.
///
/// Files are pushed as they are: notes get their stamp on their first local
/// edit, attachments keep their names. Returns the new container id.
pub async fn initialize_vault<F, R>(
    fs: &F,
    remote: &R,
    config: &SyncConfig,
    events: &EventBus,
) -> Result<String>
where
    F: FileSystem + ?Sized,
    R: RemoteStore + ?Sized,
{
    let root = ensure_root(remote, &config.root_folder).await?;

    events.emit(SyncEvent::Progress {
        message: format!("Creating vault {}...", config.vault_name),
    });
    let vault = remote.create_container(Some(&root), &config.vault_name).await?;
    info!("Created vault {} ({})", config.vault_name, vault);

    let files = list_files(fs).await?;
    events.emit(SyncEvent::Progress {
        message: format!("Uploading {} file(s), this might take a while", files.len()),
    });
    for path in &files {
        let bytes = fs.read(path).await?;
        remote.put(path, &bytes, &vault).await?;
        debug!("Uploaded {}", path);
        events.emit(SyncEvent::Uploaded { path: path.clone() });
    }

    events.emit(SyncEvent::Progress {
        message: "Files uploaded".into(),
    });
    Ok(vault)
}

/// Replace the remote vault with the local one.
///
/// Deletes the existing container (and everything in it), then initializes
/// again. Returns the new container id.
pub async fn upload_all<F, R>(
    fs: &F,
    remote: &R,
    config: &SyncConfig,
    events: &EventBus,
    container_id: &str,
) -> Result<String>
where
    F: FileSystem + ?Sized,
    R: RemoteStore + ?Sized,
{
    events.emit(SyncEvent::Progress {
        message: "Clearing vault on the remote store...".into(),
    });
    if !remote.delete(container_id).await? {
        warn!("Vault container {} was already gone", container_id);
    }
    initialize_vault(fs, remote, config, events).await
}

impl<F, R> SyncEngine<F, R>
where
    F: FileSystem + 'static,
    R: RemoteStore + 'static,
{
    /// Replace the local vault with the remote one.
    ///
    /// Every local file is deleted, then every remote entry downloaded.
    /// Remote deletes stay suppressed throughout, so the local deletions are
    /// never mirrored. Returns the number of files downloaded and failed.
    pub async fn download_all(&self) -> Result<(usize, usize)> {
        self.notify(SyncEvent::Progress {
            message: "Clearing vault...".into(),
        });
        self.state().set_suppress_remote_deletes(true);

        let result = self.download_all_inner().await;

        self.state().set_suppress_remote_deletes(false);
        if let Err(e) = self.refresh_listing().await {
            warn!("Listing refresh after download all failed: {}", e);
        }
        result
    }

    async fn download_all_inner(&self) -> Result<(usize, usize)> {
        for path in list_files(&self.fs).await? {
            self.echoes.mark(&path);
            self.fs.delete(&path).await?;
        }

        self.refresh_remote_listing().await?;
        let entries = self.state().cloud().to_vec();
        let counts = self.download_entries(&entries).await;
        // download_entries lifts the suppression when its batch is done
        self.state().set_suppress_remote_deletes(true);
        Ok(counts)
    }

    /// Push a document's current content right away.
    ///
    /// An untracked document goes through the new-file flow instead.
    pub async fn push_document(&self, path: &str) {
        let id = self.state().remote_id(path);
        let Some(id) = id else {
            if is_text_document(path) {
                self.upload_new_note(path).await;
            } else {
                self.upload_attachment(path).await;
            }
            return;
        };

        {
            let mut state = self.state();
            if let Err(current) = state.begin(path, PathState::Writing) {
                debug!("{} is busy ({:?}), not pushing", path, current);
                return;
            }
            state.clear_resync(path);
        }

        let result = self.push_current(path, &id).await;

        // Edits made meanwhile were only marked; hand them to the debouncer
        let repush = {
            let mut state = self.state();
            state.finish_if(path, PathState::Writing);
            if result.is_err() {
                state.clear_resync(path);
            }
            result.is_ok() && state.is_resync_pending(path)
        };

        match result {
            Ok(()) => {
                info!("Pushed {}", path);
                self.notify(SyncEvent::Pushed {
                    path: path.to_string(),
                });
                if repush {
                    self.schedule_upload(path);
                }
            }
            Err(e) => self.report_failure("push", Some(path), &e),
        }
    }

    async fn push_current(&self, path: &str, id: &str) -> Result<()> {
        let bytes = self.fs.read(path).await?;
        self.remote.update(id, &bytes).await?;
        Ok(())
    }

    /// Replace a document's local content with the remote copy.
    pub async fn pull_document(&self, path: &str) {
        if !self.state().is_tracked(path) {
            info!("{} is not on the remote store", path);
            self.notify(SyncEvent::NotOnRemote {
                path: path.to_string(),
            });
            return;
        }

        match self.check_staleness(path, true).await {
            Ok(StalenessOutcome::ResyncPending) => {
                info!("{} has unpushed edits, not pulling", path)
            }
            Ok(outcome) => debug!("Pull of {} finished: {:?}", path, outcome),
            Err(e) => self.report_failure("pull", Some(path), &e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::InMemoryFs;
    use crate::remote::InMemoryRemote;
    use std::sync::Arc;

    fn config() -> SyncConfig {
        SyncConfig {
            vault_name: "notes".into(),
            ..SyncConfig::default()
        }
    }

    #[tokio::test]
    async fn test_initialize_uploads_every_file() {
        let fs = InMemoryFs::new();
        fs.insert("a.md", b"# A");
        fs.insert("img/photo.png", b"png");
        fs.insert(".obsidian/workspace.json", b"{}");
        let remote = InMemoryRemote::new();
        let events = Arc::new(EventBus::new());

        let vault = initialize_vault(&fs, &remote, &config(), &events).await.unwrap();

        assert_eq!(remote.names(&vault), vec!["a.md", "img/photo.png"]);
        // Content is pushed untouched
        assert_eq!(remote.content_of("a.md").unwrap(), b"# A");
        assert_eq!(
            crate::engine::connect(&remote, &config()).await.unwrap(),
            vault
        );
    }

    #[tokio::test]
    async fn test_upload_all_replaces_remote_vault() {
        let fs = InMemoryFs::new();
        fs.insert("keep.md", b"local");
        let remote = InMemoryRemote::new();
        let root = remote.seed_container(None, "obsidian");
        let old = remote.seed_container(Some(&root), "notes");
        remote.seed_file(&old, "stale.md", b"remote", chrono::Utc::now());
        let events = Arc::new(EventBus::new());

        let vault = upload_all(&fs, &remote, &config(), &events, &old).await.unwrap();

        assert_ne!(vault, old);
        assert_eq!(remote.names(&vault), vec!["keep.md"]);
        assert!(remote.names(&old).is_empty());
    }
}
