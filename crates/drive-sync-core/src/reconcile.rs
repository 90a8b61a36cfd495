//! Reconciliation loop: converge the vault toward the remote listing.
//!
//! Each pass re-fetches both listings and diffs them from scratch, so a file
//! that failed to download or delete is simply picked up again next time.
//! Local files that exist only locally are never uploaded here; new files
//! reach the remote store through the event router.

use crate::engine::{Result, SyncEngine};
use crate::events::SyncEvent;
use crate::fs::FileSystem;
use crate::naming::{has_synced_marker, is_text_document, parent_folder};
use crate::remote::{RemoteEntry, RemoteStore};
use crate::stamp;
use crate::state::{PathState, ReplicaState};

use std::collections::HashSet;
use tracing::{debug, info, warn};

/// What one pass intends to do, computed without I/O.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcilePlan {
    /// Remote entries with no local counterpart
    pub downloads: Vec<RemoteEntry>,
    /// Local paths with no remote counterpart
    pub orphans: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.downloads.is_empty() && self.orphans.is_empty()
    }
}

/// Outcome counts of a completed pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub downloaded: usize,
    pub deleted: usize,
    pub failed: usize,
    /// Orphans kept because they were never synced
    pub skipped: usize,
}

/// Diff the current snapshots.
///
/// Renaming and deleting paths are not downloaded; renaming paths and the
/// file being uploaded are never treated as orphans.
pub fn plan(state: &ReplicaState) -> ReconcilePlan {
    let local: HashSet<&str> = state.local_paths().iter().map(String::as_str).collect();

    let downloads = state
        .cloud()
        .iter()
        .filter(|entry| !local.contains(entry.name.as_str()))
        .filter(|entry| {
            !matches!(
                state.path_state(&entry.name),
                PathState::Renaming | PathState::Deleting
            )
        })
        .cloned()
        .collect();

    let uploading = state.uploading_path();
    let orphans = state
        .local_paths()
        .iter()
        .filter(|path| !state.is_tracked(path))
        .filter(|path| state.path_state(path) != PathState::Renaming)
        .filter(|path| uploading != Some(path.as_str()))
        .cloned()
        .collect();

    ReconcilePlan { downloads, orphans }
}

impl<F, R> SyncEngine<F, R>
where
    F: FileSystem + 'static,
    R: RemoteStore + 'static,
{
    /// Run one reconciliation pass.
    ///
    /// Returns `None` when another pass is already running or when a listing
    /// could not be fetched; the next tick tries again.
    pub async fn reconcile(&self) -> Option<ReconcileReport> {
        if !self.state().try_begin_reconcile() {
            debug!("Reconciliation already running, skipping tick");
            return None;
        }

        let result = self.reconcile_pass().await;

        {
            let mut state = self.state();
            state.set_suppress_remote_deletes(false);
            state.end_reconcile();
        }

        match result {
            Ok(report) => {
                if report != ReconcileReport::default() {
                    info!(
                        "Reconciled: {} downloaded, {} deleted, {} failed, {} kept",
                        report.downloaded, report.deleted, report.failed, report.skipped
                    );
                }
                Some(report)
            }
            Err(e) => {
                warn!("Reconciliation aborted: {}", e);
                None
            }
        }
    }

    async fn reconcile_pass(&self) -> Result<ReconcileReport> {
        self.refresh_listing().await?;
        let plan = plan(&self.state());
        let mut report = ReconcileReport::default();

        if !plan.downloads.is_empty() {
            let (downloaded, failed) = self.download_entries(&plan.downloads).await;
            report.downloaded = downloaded;
            report.failed += failed;
        }

        for path in &plan.orphans {
            match self.remove_orphan(path).await {
                Ok(true) => {
                    report.deleted += 1;
                    self.notify(SyncEvent::OrphanRemoved { path: path.clone() });
                }
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    self.report_failure("delete", Some(path), &e);
                }
            }
        }

        let active = self.state().active_document().map(str::to_string);
        if let Some(path) = active {
            if let Err(e) = self.check_staleness(&path, false).await {
                self.report_failure("refresh", Some(&path), &e);
            }
        }

        Ok(report)
    }

    /// Materialize a batch of remote entries locally.
    ///
    /// Remote deletes are suppressed for the whole batch. Returns the number
    /// of files downloaded and failed.
    pub(crate) async fn download_entries(&self, entries: &[RemoteEntry]) -> (usize, usize) {
        let total = entries.len();
        info!("Downloading {} file(s)", total);
        self.notify(SyncEvent::DownloadStarted { total });
        self.state().set_suppress_remote_deletes(true);

        let mut downloaded = 0;
        let mut failed = 0;
        for (index, entry) in entries.iter().enumerate() {
            match self.download(entry).await {
                Ok(()) => {
                    downloaded += 1;
                    self.notify(SyncEvent::Downloaded {
                        path: entry.name.clone(),
                        index: index + 1,
                        total,
                    });
                }
                Err(e) => {
                    failed += 1;
                    self.report_failure("download", Some(&entry.name), &e);
                }
            }
        }

        self.state().set_suppress_remote_deletes(false);
        self.notify(SyncEvent::DownloadComplete { total });
        (downloaded, failed)
    }

    async fn download(&self, entry: &RemoteEntry) -> Result<()> {
        let file = self.remote.get(&entry.id).await?;
        self.echoes.mark(&entry.name);
        self.materialize(&entry.name, &file.content, false).await?;
        debug!("Downloaded {}", entry.name);
        Ok(())
    }

    /// Put remote bytes on disk, creating the parent folder and retrying
    /// once if the first attempt fails.
    ///
    /// `overwrite` selects `write` (existing file) over `create` (new file).
    pub(crate) async fn materialize(&self, path: &str, content: &[u8], overwrite: bool) -> Result<()> {
        let first = if overwrite {
            self.fs.write(path, content).await
        } else {
            self.fs.create(path, content).await
        };
        let Err(e) = first else {
            return Ok(());
        };

        debug!("Writing {} failed ({}), creating parent and retrying", path, e);
        if let Some(parent) = parent_folder(path) {
            self.fs.mkdir(parent).await?;
        }
        if overwrite {
            self.fs.write(path, content).await?;
        } else {
            self.fs.create(path, content).await?;
        }
        Ok(())
    }

    /// Delete a local orphan if it was synced before. Returns whether it was
    /// deleted.
    ///
    /// Attachments count as synced when they carry the marker, notes when
    /// they still carry a stamp. Anything else was created locally and is
    /// waiting for its first upload.
    async fn remove_orphan(&self, path: &str) -> Result<bool> {
        let synced = if is_text_document(path) {
            let content = self.fs.read_text(path).await?;
            stamp::has_stamp(&content)
        } else {
            has_synced_marker(path)
        };
        if !synced {
            debug!("Keeping never-synced local file {}", path);
            return Ok(false);
        }

        // An upload may have claimed or finished the path meanwhile
        let claimed = {
            let state = self.state();
            state.is_tracked(path) || state.is_busy(path)
        };
        if claimed {
            debug!("{} was uploaded during the pass, keeping it", path);
            return Ok(false);
        }

        self.echoes.mark(path);
        self.fs.delete(path).await?;
        info!("Removed {} (deleted remotely)", path);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(id: &str, name: &str) -> RemoteEntry {
        RemoteEntry {
            id: id.into(),
            name: name.into(),
            modified_at: Utc::now(),
        }
    }

    fn state(cloud: &[(&str, &str)], local: &[&str]) -> ReplicaState {
        let mut state = ReplicaState::new();
        state.replace_listing(
            cloud.iter().map(|(id, name)| entry(id, name)).collect(),
            local.iter().map(|p| p.to_string()).collect(),
        );
        state
    }

    #[test]
    fn test_plan_diffs_both_ways() {
        let state = state(&[("1", "a.md"), ("2", "b.md")], &["b.md", "c.md"]);
        let plan = plan(&state);

        let names: Vec<&str> = plan.downloads.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["a.md"]);
        assert_eq!(plan.downloads[0].id, "1");
        assert_eq!(plan.orphans, vec!["c.md"]);
    }

    #[test]
    fn test_plan_empty_when_in_sync() {
        let state = state(&[("1", "a.md")], &["a.md"]);
        assert!(plan(&state).is_empty());
    }

    #[test]
    fn test_plan_skips_renaming_and_deleting_downloads() {
        let mut state = state(&[("1", "old.md"), ("2", "gone.md")], &[]);
        state.begin("old.md", PathState::Renaming).unwrap();
        state.begin("gone.md", PathState::Deleting).unwrap();

        assert!(plan(&state).downloads.is_empty());
    }

    #[test]
    fn test_plan_never_orphans_uploading_path() {
        let mut state = state(&[], &["new.md", "stale.md"]);
        state.begin("new.md", PathState::Uploading).unwrap();

        assert_eq!(plan(&state).orphans, vec!["stale.md"]);
    }

    #[test]
    fn test_plan_never_orphans_renaming_path() {
        let mut state = state(&[], &["moved.md"]);
        state.begin("moved.md", PathState::Renaming).unwrap();

        assert!(plan(&state).orphans.is_empty());
    }
}
