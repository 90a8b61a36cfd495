//! Replica state: what the engine currently believes exists on both sides.
//!
//! `ReplicaState` is owned by one `SyncEngine` and guarded by a plain mutex
//! that is never held across an `.await`. Every ordering guarantee between
//! the reconciliation loop, the event router and the upload scheduler comes
//! from the markers kept here.

use crate::remote::RemoteEntry;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::debug;

/// What the engine is currently doing with a path.
///
/// Paths absent from the tracker are `Idle`. A path holds exactly one state,
/// so it can never be renaming and deleting at the same time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathState {
    Idle,
    /// Remote rename in flight; the old name must not look remotely deleted
    Renaming,
    /// Remote delete in flight; the name must not be downloaded again
    Deleting,
    /// First push of a new file; the local copy must not look orphaned
    Uploading,
    /// The engine is stamping and pushing the file's content itself
    Writing,
}

#[derive(Debug, Default)]
pub struct ReplicaState {
    /// Last remote listing (plus entries appended/renamed since)
    cloud: Vec<RemoteEntry>,
    /// Last local enumeration
    local_paths: Vec<String>,
    path_states: HashMap<String, PathState>,
    /// Paths edited while a push of the same file was queued or in flight
    resync_pending: HashSet<String>,
    reconciling: bool,
    suppress_remote_deletes: bool,
    active_document: Option<String>,
}

impl ReplicaState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace both listings in one step.
    pub fn replace_listing(&mut self, cloud: Vec<RemoteEntry>, local_paths: Vec<String>) {
        self.cloud = cloud;
        self.local_paths = local_paths;
    }

    /// Replace only the remote listing.
    pub fn replace_cloud(&mut self, cloud: Vec<RemoteEntry>) {
        self.cloud = cloud;
    }

    pub fn cloud(&self) -> &[RemoteEntry] {
        &self.cloud
    }

    pub fn cloud_paths(&self) -> Vec<String> {
        self.cloud.iter().map(|e| e.name.clone()).collect()
    }

    pub fn local_paths(&self) -> &[String] {
        &self.local_paths
    }

    /// Whether the path is a known remote file.
    pub fn is_tracked(&self, path: &str) -> bool {
        self.cloud.iter().any(|e| e.name == path)
    }

    pub fn remote_entry(&self, path: &str) -> Option<&RemoteEntry> {
        self.cloud.iter().find(|e| e.name == path)
    }

    pub fn remote_id(&self, path: &str) -> Option<String> {
        self.remote_entry(path).map(|e| e.id.clone())
    }

    /// Tracked entries living under `folder/`.
    pub fn tracked_within(&self, folder: &str) -> Vec<RemoteEntry> {
        self.cloud
            .iter()
            .filter(|e| crate::naming::is_within(&e.name, folder))
            .cloned()
            .collect()
    }

    /// Record a freshly pushed file until the next listing picks it up.
    pub fn push_cloud(&mut self, entry: RemoteEntry) {
        self.cloud.retain(|e| e.name != entry.name);
        self.cloud.push(entry);
    }

    /// Substitute a renamed entry's name in place.
    pub fn rename_cloud(&mut self, old: &str, new: &str) {
        if let Some(entry) = self.cloud.iter_mut().find(|e| e.name == old) {
            entry.name = new.to_string();
        }
    }

    pub fn path_state(&self, path: &str) -> PathState {
        self.path_states
            .get(path)
            .copied()
            .unwrap_or(PathState::Idle)
    }

    /// Move an idle path into `state`.
    ///
    /// Returns the current state when the path is busy. `Uploading` is the
    /// exception on the "only one path" side: starting an upload releases
    /// whichever other path was uploading.
    pub fn begin(&mut self, path: &str, state: PathState) -> Result<(), PathState> {
        let current = self.path_state(path);
        if current != PathState::Idle {
            return Err(current);
        }
        if state == PathState::Uploading {
            if let Some(displaced) = self.uploading_path() {
                debug!("{} takes over the upload slot from {}", path, displaced);
            }
            self.path_states.retain(|_, s| *s != PathState::Uploading);
        }
        if state != PathState::Idle {
            self.path_states.insert(path.to_string(), state);
        }
        Ok(())
    }

    /// Return a path to `Idle`.
    pub fn finish(&mut self, path: &str) {
        self.path_states.remove(path);
    }

    /// Return a path to `Idle` only if it is still in `state`.
    ///
    /// An `Uploading` path may have been released by a newer upload and
    /// claimed for something else in the meantime.
    pub fn finish_if(&mut self, path: &str, state: PathState) {
        if self.path_state(path) == state {
            self.path_states.remove(path);
        }
    }

    pub fn is_busy(&self, path: &str) -> bool {
        self.path_state(path) != PathState::Idle
    }

    pub fn uploading_path(&self) -> Option<&str> {
        self.path_states
            .iter()
            .find(|(_, s)| **s == PathState::Uploading)
            .map(|(p, _)| p.as_str())
    }

    /// Paths currently in a given state.
    pub fn paths_in(&self, state: PathState) -> Vec<String> {
        self.path_states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn mark_resync(&mut self, path: &str) {
        self.resync_pending.insert(path.to_string());
    }

    pub fn clear_resync(&mut self, path: &str) {
        self.resync_pending.remove(path);
    }

    pub fn is_resync_pending(&self, path: &str) -> bool {
        self.resync_pending.contains(path)
    }

    /// Claim the reconciliation guard. False while another pass runs.
    pub fn try_begin_reconcile(&mut self) -> bool {
        if self.reconciling {
            return false;
        }
        self.reconciling = true;
        true
    }

    pub fn end_reconcile(&mut self) {
        self.reconciling = false;
    }

    pub fn is_reconciling(&self) -> bool {
        self.reconciling
    }

    pub fn set_suppress_remote_deletes(&mut self, suppress: bool) {
        self.suppress_remote_deletes = suppress;
    }

    pub fn remote_deletes_suppressed(&self) -> bool {
        self.suppress_remote_deletes
    }

    pub fn set_active_document(&mut self, path: Option<String>) {
        self.active_document = path;
    }

    pub fn active_document(&self) -> Option<&str> {
        self.active_document.as_deref()
    }
}

/// Tracks files the engine itself is about to touch locally.
///
/// The engine marks a path BEFORE writing, renaming or deleting it. When the
/// local store's notification for that change arrives, the router consumes
/// the mark and drops the notification instead of syncing it back.
///
/// Marks expire after `ECHO_TTL` so a notification that never arrives (or
/// was coalesced away) cannot suppress a later user edit.
#[derive(Clone)]
pub struct EchoFilter {
    /// Map of path -> when it was marked
    marks: Arc<Mutex<HashMap<String, Instant>>>,
}

/// Time-to-live for echo marks.
pub const ECHO_TTL: Duration = Duration::from_secs(5);

impl Default for EchoFilter {
    fn default() -> Self {
        Self {
            marks: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl EchoFilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a path as about to be changed by the engine.
    pub fn mark(&self, path: &str) {
        self.marks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path.to_string(), Instant::now());
    }

    /// Consume a mark (returns true once). Expired marks count as absent.
    pub fn consume(&self, path: &str) -> bool {
        let mut marks = self.marks.lock().unwrap_or_else(PoisonError::into_inner);
        matches!(marks.remove(path), Some(at) if at.elapsed() < ECHO_TTL)
    }

    /// Check a mark without consuming it.
    pub fn is_marked(&self, path: &str) -> bool {
        let marks = self.marks.lock().unwrap_or_else(PoisonError::into_inner);
        marks
            .get(path)
            .is_some_and(|at| at.elapsed() < ECHO_TTL)
    }

    /// Drop expired marks to keep the map bounded.
    pub fn cleanup_expired(&self) {
        let mut marks = self.marks.lock().unwrap_or_else(PoisonError::into_inner);
        marks.retain(|_, at| at.elapsed() < ECHO_TTL);
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

    #[test]
    fn test_path_holds_one_state() {
        let mut state = ReplicaState::new();
        state.begin("a.md", PathState::Renaming).unwrap();

        assert_eq!(
            state.begin("a.md", PathState::Deleting),
            Err(PathState::Renaming)
        );
        assert_eq!(state.path_state("a.md"), PathState::Renaming);

        state.finish("a.md");
        state.begin("a.md", PathState::Deleting).unwrap();
        assert_eq!(state.paths_in(PathState::Renaming), Vec::<String>::new());
        assert_eq!(state.paths_in(PathState::Deleting), vec!["a.md"]);
    }

    #[test]
    fn test_single_uploading_path() {
        let mut state = ReplicaState::new();
        state.begin("a.md", PathState::Uploading).unwrap();
        state.begin("b.md", PathState::Uploading).unwrap();

        assert_eq!(state.uploading_path(), Some("b.md"));
        assert_eq!(state.path_state("a.md"), PathState::Idle);

        // The released uploader finishing must not touch a newer claim
        state.begin("a.md", PathState::Writing).unwrap();
        state.finish_if("a.md", PathState::Uploading);
        assert_eq!(state.path_state("a.md"), PathState::Writing);
        assert!(state.is_busy("a.md"));
    }

    #[test]
    fn test_rename_cloud_substitutes_in_place() {
        let mut state = ReplicaState::new();
        state.replace_cloud(vec![entry("1", "a.md"), entry("2", "b.md")]);

        state.rename_cloud("a.md", "c.md");
        assert_eq!(state.cloud_paths(), vec!["c.md", "b.md"]);
        assert_eq!(state.remote_id("c.md").as_deref(), Some("1"));
        assert!(!state.is_tracked("a.md"));
    }

    #[test]
    fn test_tracked_within_folder() {
        let mut state = ReplicaState::new();
        state.replace_cloud(vec![
            entry("1", "notes/a.md"),
            entry("2", "notes/sub/b.md"),
            entry("3", "notes2/c.md"),
        ]);

        let names: Vec<String> = state
            .tracked_within("notes")
            .into_iter()
            .map(|e| e.name)
            .collect();
        assert_eq!(names, vec!["notes/a.md", "notes/sub/b.md"]);
    }

    #[test]
    fn test_reconcile_guard() {
        let mut state = ReplicaState::new();
        assert!(state.try_begin_reconcile());
        assert!(!state.try_begin_reconcile());
        state.end_reconcile();
        assert!(state.try_begin_reconcile());
    }

    #[test]
    fn test_echo_mark_consumed_once() {
        let echoes = EchoFilter::new();
        echoes.mark("a.md");

        assert!(echoes.is_marked("a.md"));
        assert!(echoes.consume("a.md"));
        assert!(!echoes.consume("a.md"));
        assert!(!echoes.consume("never-marked.md"));
    }
}
