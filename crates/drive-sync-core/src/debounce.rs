//! Debounced upload scheduler.
//!
//! Editors emit a modify notification per keystroke burst. Edits are
//! coalesced behind one shared timer slot: every edit cancels the pending
//! timer and arms a new one, and only when the quiet period passes does the
//! engine stamp and push. The slot remembers every path queued since it last
//! fired, so switching files mid-burst never drops the first file's edit.

use crate::engine::{EngineMessage, Result, SyncEngine};
use crate::fs::FileSystem;
use crate::naming::is_text_document;
use crate::remote::RemoteStore;
use crate::stamp;
use crate::state::PathState;
use crate::events::SyncEvent;

use chrono::Utc;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

#[derive(Default)]
struct SlotInner {
    timer: Option<JoinHandle<()>>,
    /// Bumped on every arm; a timer only counts if it is the latest
    generation: u64,
    queued: Vec<String>,
}

/// The single timer slot.
#[derive(Default)]
pub struct DebounceSlot {
    inner: Mutex<SlotInner>,
}

impl DebounceSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `path` and (re)arm the timer for `delay` from now.
    ///
    /// When the timer fires it sends `DebounceElapsed` tagged with the
    /// generation it was armed for. Must be called inside a tokio runtime.
    pub fn arm(&self, path: &str, delay: Duration, tx: mpsc::UnboundedSender<EngineMessage>) {
        let deadline = Instant::now() + delay;
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        if !inner.queued.iter().any(|p| p == path) {
            inner.queued.push(path.to_string());
        }

        inner.generation += 1;
        let generation = inner.generation;
        inner.timer = Some(tokio::spawn(async move {
            tokio::time::sleep_until(deadline).await;
            // Receiver gone means the engine shut down
            let _ = tx.send(EngineMessage::DebounceElapsed { generation });
        }));
    }

    /// Drain the queue if `generation` is the latest arm.
    ///
    /// A stale generation (the slot was re-armed after that timer fired)
    /// yields nothing; the newer timer will deliver.
    pub fn take_due(&self, generation: u64) -> Vec<String> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if inner.generation != generation {
            return Vec::new();
        }
        inner.timer = None;
        std::mem::take(&mut inner.queued)
    }

    /// Cancel the pending timer and forget queued paths.
    pub fn cancel(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        inner.queued.clear();
    }

    pub fn is_armed(&self) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .timer
            .is_some()
    }

    pub fn queued(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .queued
            .clone()
    }
}

impl<F, R> SyncEngine<F, R>
where
    F: FileSystem + 'static,
    R: RemoteStore + 'static,
{
    /// Queue a tracked file for a debounced push.
    pub(crate) fn schedule_upload(&self, path: &str) {
        debug!("Scheduling upload of {}", path);
        self.debounce.arm(path, self.config.debounce(), self.sender());
    }

    /// Timer fired: flush every queued path in order.
    pub(crate) async fn flush_debounced(&self, generation: u64) {
        for path in self.debounce.take_due(generation) {
            self.flush(&path).await;
        }
    }

    /// Stamp and push one file, pushing again while edits keep arriving.
    pub async fn flush(&self, path: &str) {
        let id = {
            let mut state = self.state();
            let Some(id) = state.remote_id(path) else {
                debug!("{} is no longer tracked, dropping queued upload", path);
                state.clear_resync(path);
                return;
            };
            if let Err(current) = state.begin(path, PathState::Writing) {
                debug!("{} is busy ({:?}), skipping flush", path, current);
                // An in-flight push picks the edit up; a rename/delete supersedes it
                if !matches!(current, PathState::Writing | PathState::Uploading) {
                    state.clear_resync(path);
                }
                return;
            }
            id
        };

        let result = self.stamp_and_push(path, &id).await;

        // An edit landing after the last check only marked the path
        let repush = {
            let mut state = self.state();
            state.finish_if(path, PathState::Writing);
            if result.is_err() {
                state.clear_resync(path);
            }
            result.is_ok() && state.is_resync_pending(path)
        };

        match result {
            Ok(pushes) => {
                info!("Pushed {} ({} upload(s))", path, pushes);
                self.notify(SyncEvent::Pushed {
                    path: path.to_string(),
                });
                if repush {
                    self.schedule_upload(path);
                }
            }
            Err(e) => self.report_failure("upload", Some(path), &e),
        }
    }

    async fn stamp_and_push(&self, path: &str, id: &str) -> Result<usize> {
        if is_text_document(path) {
            let content = self.fs.read_text(path).await?;
            let stamped = stamp::apply_stamp(&content, Utc::now());
            self.echoes.mark(path);
            self.fs.write(path, stamped.as_bytes()).await?;
        }

        let mut pushes = 0;
        loop {
            self.state().clear_resync(path);
            let bytes = self.fs.read(path).await?;
            self.remote.update(id, &bytes).await?;
            pushes += 1;

            if !self.state().is_resync_pending(path) {
                break;
            }
            debug!("{} changed during push, pushing again", path);
        }
        Ok(pushes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_rearm_delivers_single_message() {
        let slot = DebounceSlot::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        slot.arm("a.md", Duration::from_millis(2250), tx.clone());
        tokio::time::sleep(Duration::from_millis(500)).await;
        slot.arm("a.md", Duration::from_millis(2250), tx.clone());

        let start = Instant::now();
        let msg = rx.recv().await.unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(2250));
        assert_eq!(msg, EngineMessage::DebounceElapsed { generation: 2 });
        assert_eq!(slot.take_due(2), vec!["a.md"]);

        // Nothing else was queued
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slot_keeps_every_queued_path() {
        let slot = DebounceSlot::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        slot.arm("a.md", Duration::from_millis(100), tx.clone());
        slot.arm("b.md", Duration::from_millis(100), tx.clone());
        slot.arm("a.md", Duration::from_millis(100), tx);

        let EngineMessage::DebounceElapsed { generation } = rx.recv().await.unwrap() else {
            panic!("expected DebounceElapsed");
        };
        assert_eq!(slot.take_due(generation), vec!["a.md", "b.md"]);
        assert!(!slot.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_generation_yields_nothing() {
        let slot = DebounceSlot::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        slot.arm("a.md", Duration::from_millis(100), tx.clone());
        slot.arm("a.md", Duration::from_millis(100), tx);

        assert!(slot.take_due(1).is_empty());
        assert_eq!(slot.queued(), vec!["a.md"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_clears_slot() {
        let slot = DebounceSlot::new();
        let (tx, mut rx) = mpsc::unbounded_channel();

        slot.arm("a.md", Duration::from_millis(100), tx);
        slot.cancel();

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(rx.try_recv().is_err());
        assert!(slot.queued().is_empty());
    }
}
