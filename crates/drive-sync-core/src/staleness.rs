//! Staleness detector: pull a document when the remote copy is newer.
//!
//! A note's own stamp says when this device last synced it. When the remote
//! store reports a modification noticeably after that instant, another
//! device pushed in between and the local copy is replaced.

use crate::engine::{Result, SyncEngine};
use crate::events::SyncEvent;
use crate::fs::FileSystem;
use crate::naming::is_text_document;
use crate::remote::RemoteStore;
use crate::stamp;

use tracing::{debug, info};

/// Result of one staleness check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StalenessOutcome {
    /// Local content was replaced by the remote copy
    Pulled,
    /// Local copy is current (or carries no stamp to compare)
    Fresh,
    /// The path has no remote copy
    NotTracked,
    /// Unpushed local edits exist; they win over the remote copy
    ResyncPending,
    /// Binary files are only pulled on request or with auto refresh enabled
    BinarySkipped,
}

impl<F, R> SyncEngine<F, R>
where
    F: FileSystem + 'static,
    R: RemoteStore + 'static,
{
    /// Check one document and pull it when stale.
    ///
    /// `forced` skips the timestamp comparison (a manual pull). Unpushed
    /// local edits win even then.
    pub async fn check_staleness(&self, path: &str, forced: bool) -> Result<StalenessOutcome> {
        let entry = {
            let state = self.state();
            let Some(entry) = state.remote_entry(path).cloned() else {
                return Ok(StalenessOutcome::NotTracked);
            };
            if state.is_resync_pending(path) {
                return Ok(StalenessOutcome::ResyncPending);
            }
            entry
        };

        let text = is_text_document(path);
        if !text && !forced && !self.config.auto_refresh_binary {
            return Ok(StalenessOutcome::BinarySkipped);
        }

        if text && !forced {
            let content = self.fs.read_text(path).await?;
            let Some(stamped_at) = stamp::extract_stamp(&content) else {
                debug!("{} carries no stamp, not comparing", path);
                return Ok(StalenessOutcome::Fresh);
            };
            if entry.modified_at <= stamped_at + self.config.stale_tolerance() {
                return Ok(StalenessOutcome::Fresh);
            }
            debug!(
                "{} is stale (remote {}, stamp {})",
                path, entry.modified_at, stamped_at
            );
        }

        let file = self.remote.get(&entry.id).await?;

        if self.state().is_resync_pending(path) {
            debug!("{} was edited during the fetch, keeping local edits", path);
            return Ok(StalenessOutcome::ResyncPending);
        }

        self.echoes.mark(path);
        self.materialize(path, &file.content, true).await?;

        info!("Pulled {}", path);
        self.notify(SyncEvent::Pulled {
            path: path.to_string(),
        });
        Ok(StalenessOutcome::Pulled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::fs::InMemoryFs;
    use crate::remote::InMemoryRemote;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use std::sync::Arc;

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 14, 17, 21, 0).unwrap()
    }

    fn note(ts: DateTime<Utc>, body: &str) -> String {
        stamp::apply_stamp(body, ts)
    }

    type Engine = SyncEngine<Arc<InMemoryFs>, Arc<InMemoryRemote>>;

    async fn setup(
        local: &[(&str, &str)],
        remote_files: &[(&str, &str, DateTime<Utc>)],
        config: SyncConfig,
    ) -> (Arc<Engine>, Arc<InMemoryFs>, Arc<InMemoryRemote>) {
        let fs = Arc::new(InMemoryFs::new());
        for (path, content) in local {
            fs.insert(path, content.as_bytes());
        }
        let remote = Arc::new(InMemoryRemote::new());
        let vault = remote.seed_container(None, "vault");
        for (name, content, modified_at) in remote_files {
            remote.seed_file(&vault, name, content.as_bytes(), *modified_at);
        }

        let (engine, _rx) = SyncEngine::new(Arc::clone(&fs), Arc::clone(&remote), config, vault);
        engine.refresh_listing().await.unwrap();
        (engine, fs, remote)
    }

    #[tokio::test]
    async fn test_newer_remote_is_pulled() {
        let local = note(t0(), "local");
        let newer = note(t0() + Duration::seconds(10), "remote");
        let (engine, fs, _) = setup(
            &[("a.md", local.as_str())],
            &[("a.md", newer.as_str(), t0() + Duration::seconds(10))],
            SyncConfig::default(),
        )
        .await;

        let outcome = engine.check_staleness("a.md", false).await.unwrap();

        assert_eq!(outcome, StalenessOutcome::Pulled);
        assert_eq!(fs.text("a.md").unwrap(), newer);
    }

    #[tokio::test]
    async fn test_within_tolerance_is_fresh() {
        let local = note(t0(), "local");
        let (engine, fs, remote) = setup(
            &[("a.md", local.as_str())],
            &[("a.md", "remote", t0() + Duration::milliseconds(2900))],
            SyncConfig::default(),
        )
        .await;

        let outcome = engine.check_staleness("a.md", false).await.unwrap();

        assert_eq!(outcome, StalenessOutcome::Fresh);
        assert_eq!(fs.text("a.md").unwrap(), local);
        assert!(!remote.calls().iter().any(|c| matches!(c, crate::remote::RemoteCall::Get { .. })));
    }

    #[tokio::test]
    async fn test_unstamped_note_is_not_pulled() {
        let (engine, _, _) = setup(
            &[("a.md", "no header")],
            &[("a.md", "remote", t0() + Duration::days(1))],
            SyncConfig::default(),
        )
        .await;

        assert_eq!(
            engine.check_staleness("a.md", false).await.unwrap(),
            StalenessOutcome::Fresh
        );
    }

    #[tokio::test]
    async fn test_pending_edits_win() {
        let local = note(t0(), "local");
        let (engine, fs, _) = setup(
            &[("a.md", local.as_str())],
            &[("a.md", "remote", t0() + Duration::minutes(5))],
            SyncConfig::default(),
        )
        .await;
        engine.state().mark_resync("a.md");

        let outcome = engine.check_staleness("a.md", false).await.unwrap();
        assert_eq!(outcome, StalenessOutcome::ResyncPending);

        // A manual pull does not override them either
        let outcome = engine.check_staleness("a.md", true).await.unwrap();
        assert_eq!(outcome, StalenessOutcome::ResyncPending);
        assert_eq!(fs.text("a.md").unwrap(), local);
    }

    #[tokio::test]
    async fn test_binary_only_pulled_when_forced_or_auto_refresh() {
        let (engine, fs, _) = setup(
            &[("img/photo-synced.png", "old")],
            &[("img/photo-synced.png", "new", t0())],
            SyncConfig::default(),
        )
        .await;

        assert_eq!(
            engine.check_staleness("img/photo-synced.png", false).await.unwrap(),
            StalenessOutcome::BinarySkipped
        );
        assert_eq!(
            engine.check_staleness("img/photo-synced.png", true).await.unwrap(),
            StalenessOutcome::Pulled
        );
        assert_eq!(fs.read("img/photo-synced.png").await.unwrap(), b"new");

        let auto = SyncConfig {
            auto_refresh_binary: true,
            ..SyncConfig::default()
        };
        let (engine, _, _) = setup(
            &[("photo-synced.png", "old")],
            &[("photo-synced.png", "new", t0())],
            auto,
        )
        .await;
        assert_eq!(
            engine.check_staleness("photo-synced.png", false).await.unwrap(),
            StalenessOutcome::Pulled
        );
    }

    #[tokio::test]
    async fn test_untracked_path() {
        let (engine, _, _) = setup(&[("a.md", "x")], &[], SyncConfig::default()).await;
        assert_eq!(
            engine.check_staleness("a.md", true).await.unwrap(),
            StalenessOutcome::NotTracked
        );
    }
}
