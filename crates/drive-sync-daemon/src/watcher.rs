//! File watcher for vault changes.
//!
//! Raw notify events are grouped per path over a 200ms window and turned
//! into the engine's `LocalEvent` notifications. A save that shows up as a
//! create followed by several modifies becomes one event; a file that is
//! created and removed inside the window produces nothing.

use anyhow::Result;
use drive_sync_core::LocalEvent;
use drive_sync_core::naming::is_text_document;
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error};

const WINDOW: Duration = Duration::from_millis(200);

/// One raw change, with its path made vault-relative.
#[derive(Debug, Clone, PartialEq, Eq)]
enum RawChange {
    Created(String),
    Modified(String),
    Removed(String),
    Renamed { from: String, to: String },
    RenamedFrom(String),
    RenamedTo(String),
}

#[derive(Debug, Default)]
struct PathChanges {
    created: bool,
    modified: bool,
    removed: bool,
    rename_from: bool,
    rename_to: bool,
}

#[derive(Debug)]
enum Pending {
    Path(String),
    Rename { from: String, to: String },
}

/// Changes collected during one window, in arrival order.
#[derive(Debug, Default)]
struct Batch {
    order: Vec<Pending>,
    paths: HashMap<String, PathChanges>,
}

impl Batch {
    fn entry(&mut self, path: &str) -> &mut PathChanges {
        if !self.paths.contains_key(path) {
            self.order.push(Pending::Path(path.to_string()));
        }
        self.paths.entry(path.to_string()).or_default()
    }

    fn push(&mut self, change: RawChange) {
        match change {
            RawChange::Created(path) => self.entry(&path).created = true,
            RawChange::Modified(path) => self.entry(&path).modified = true,
            RawChange::Removed(path) => self.entry(&path).removed = true,
            RawChange::RenamedFrom(path) => self.entry(&path).rename_from = true,
            RawChange::RenamedTo(path) => self.entry(&path).rename_to = true,
            RawChange::Renamed { from, to } => self.order.push(Pending::Rename { from, to }),
        }
    }

    /// Resolve the window into notifications.
    ///
    /// `probe` reports whether a path exists now (`Some(is_dir)`) or not.
    fn drain(self, probe: impl Fn(&str) -> Option<bool>) -> Vec<LocalEvent> {
        let mut paired = std::collections::HashSet::new();
        for pending in &self.order {
            if let Pending::Rename { from, to } = pending {
                paired.insert(from.as_str());
                paired.insert(to.as_str());
            }
        }

        let mut events = Vec::new();
        for pending in &self.order {
            match pending {
                Pending::Rename { from, to } => events.push(LocalEvent::Renamed {
                    from: from.clone(),
                    to: to.clone(),
                }),
                Pending::Path(path) => {
                    let Some(changes) = self.paths.get(path) else {
                        continue;
                    };
                    let is_paired = paired.contains(path.as_str());
                    if let Some(event) = resolve(path, changes, is_paired, probe(path)) {
                        events.push(event);
                    }
                }
            }
        }
        events
    }
}

fn resolve(
    path: &str,
    changes: &PathChanges,
    is_paired: bool,
    current: Option<bool>,
) -> Option<LocalEvent> {
    let appeared = changes.created || (changes.rename_to && !is_paired);
    let vanished = changes.removed || (changes.rename_from && !is_paired);

    match current {
        // Folders are created implicitly by their files
        Some(true) => None,
        Some(false) => {
            if appeared && !vanished && !is_text_document(path) {
                Some(LocalEvent::Created {
                    path: path.to_string(),
                })
            } else if appeared || vanished || changes.modified {
                // New notes are reported as edits so they pick up their stamp
                Some(LocalEvent::Modified {
                    path: path.to_string(),
                })
            } else {
                None
            }
        }
        None => {
            if changes.created || (appeared && !vanished && !changes.modified) {
                None
            } else if vanished || changes.modified {
                Some(LocalEvent::Deleted {
                    path: path.to_string(),
                })
            } else {
                None
            }
        }
    }
}

/// Make a path vault-relative with `/` separators. Hidden entries (any
/// segment starting with `.`) are skipped.
fn relative(vault_path: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(vault_path).ok()?;
    let mut segments = Vec::new();
    for component in relative.components() {
        let segment = component.as_os_str().to_str()?;
        if segment.starts_with('.') {
            return None;
        }
        segments.push(segment);
    }
    if segments.is_empty() {
        return None;
    }
    Some(segments.join("/"))
}

fn translate(event: &notify::Event, vault_path: &Path) -> Vec<RawChange> {
    let rel = |p: &PathBuf| relative(vault_path, p);
    let each = |make: fn(String) -> RawChange| -> Vec<RawChange> {
        event.paths.iter().filter_map(rel).map(make).collect()
    };

    match event.kind {
        EventKind::Create(_) => each(RawChange::Created),
        EventKind::Remove(_) => each(RawChange::Removed),
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => {
            match (event.paths.first(), event.paths.get(1)) {
                (Some(from), Some(to)) => match (rel(from), rel(to)) {
                    (Some(from), Some(to)) => vec![RawChange::Renamed { from, to }],
                    // Moved into or out of a hidden folder
                    (Some(from), None) => vec![RawChange::Removed(from)],
                    (None, Some(to)) => vec![RawChange::Created(to)],
                    (None, None) => Vec::new(),
                },
                _ => Vec::new(),
            }
        }
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => each(RawChange::RenamedFrom),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => each(RawChange::RenamedTo),
        EventKind::Modify(ModifyKind::Metadata(_)) | EventKind::Access(_) => Vec::new(),
        _ => each(RawChange::Modified),
    }
}

fn probe(vault_path: &Path, path: &str) -> Option<bool> {
    std::fs::metadata(vault_path.join(path))
        .ok()
        .map(|m| m.is_dir())
}

async fn coalesce(
    vault_path: PathBuf,
    mut raw_rx: mpsc::UnboundedReceiver<RawChange>,
    event_tx: mpsc::UnboundedSender<LocalEvent>,
) {
    while let Some(first) = raw_rx.recv().await {
        let mut batch = Batch::default();
        batch.push(first);

        let deadline = Instant::now() + WINDOW;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                next = raw_rx.recv() => match next {
                    Some(change) => batch.push(change),
                    None => break,
                },
            }
        }

        for event in batch.drain(|path| probe(&vault_path, path)) {
            debug!("File event: {:?}", event);
            if event_tx.send(event).is_err() {
                return;
            }
        }
    }
}

/// File watcher that monitors the vault directory.
///
/// Must be created inside a tokio runtime.
pub struct FileWatcher {
    vault_path: PathBuf,
    /// Watcher handle (must keep alive)
    _watcher: RecommendedWatcher,
    event_rx: mpsc::UnboundedReceiver<LocalEvent>,
}

impl FileWatcher {
    pub fn new(vault_path: PathBuf) -> Result<Self> {
        // Canonicalize the path to resolve symlinks. On macOS, /var/folders/...
        // is actually /private/var/folders/..., and FSEvents needs the real path.
        let vault_path = vault_path.canonicalize().unwrap_or(vault_path);

        let (raw_tx, raw_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let callback_path = vault_path.clone();

        let mut watcher = notify::recommended_watcher(
            move |result: std::result::Result<notify::Event, notify::Error>| match result {
                Ok(event) => {
                    for change in translate(&event, &callback_path) {
                        if raw_tx.send(change).is_err() {
                            return;
                        }
                    }
                }
                Err(e) => error!("File watcher error: {}", e),
            },
        )?;
        watcher.watch(&vault_path, RecursiveMode::Recursive)?;

        tokio::spawn(coalesce(vault_path.clone(), raw_rx, event_tx));

        Ok(Self {
            vault_path,
            _watcher: watcher,
            event_rx,
        })
    }

    /// Get the receiver for file events.
    pub fn event_rx(&mut self) -> &mut mpsc::UnboundedReceiver<LocalEvent> {
        &mut self.event_rx
    }

    pub fn vault_path(&self) -> &Path {
        &self.vault_path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drain(changes: Vec<RawChange>, existing: &[(&str, bool)]) -> Vec<LocalEvent> {
        let mut batch = Batch::default();
        for change in changes {
            batch.push(change);
        }
        batch.drain(|path| {
            existing
                .iter()
                .find(|(p, _)| *p == path)
                .map(|(_, is_dir)| *is_dir)
        })
    }

    fn created(p: &str) -> RawChange {
        RawChange::Created(p.into())
    }

    fn modified(p: &str) -> RawChange {
        RawChange::Modified(p.into())
    }

    fn removed(p: &str) -> RawChange {
        RawChange::Removed(p.into())
    }

    #[test]
    fn test_new_note_is_reported_as_edit() {
        let events = drain(
            vec![created("a.md"), modified("a.md"), modified("a.md")],
            &[("a.md", false)],
        );
        assert_eq!(events, vec![LocalEvent::Modified { path: "a.md".into() }]);
    }

    #[test]
    fn test_new_attachment_is_reported_as_created() {
        let events = drain(
            vec![created("img/photo.png"), modified("img/photo.png")],
            &[("img/photo.png", false)],
        );
        assert_eq!(
            events,
            vec![LocalEvent::Created {
                path: "img/photo.png".into()
            }]
        );
    }

    #[test]
    fn test_short_lived_file_is_dropped() {
        let events = drain(vec![created("tmp.md"), modified("tmp.md"), removed("tmp.md")], &[]);
        assert!(events.is_empty());
    }

    #[test]
    fn test_atomic_save_is_an_edit() {
        let events = drain(vec![removed("a.md"), created("a.md")], &[("a.md", false)]);
        assert_eq!(events, vec![LocalEvent::Modified { path: "a.md".into() }]);
    }

    #[test]
    fn test_removed_file_is_deleted() {
        let events = drain(vec![removed("a.md")], &[]);
        assert_eq!(events, vec![LocalEvent::Deleted { path: "a.md".into() }]);
    }

    #[test]
    fn test_folders_are_not_reported_on_create() {
        let events = drain(vec![created("new"), created("new/a.md")], &[("new", true), ("new/a.md", false)]);
        assert_eq!(events, vec![LocalEvent::Modified { path: "new/a.md".into() }]);
    }

    #[test]
    fn test_paired_rename_ignores_its_sides() {
        let events = drain(
            vec![
                RawChange::RenamedFrom("old.md".into()),
                RawChange::RenamedTo("new.md".into()),
                RawChange::Renamed {
                    from: "old.md".into(),
                    to: "new.md".into(),
                },
            ],
            &[("new.md", false)],
        );
        assert_eq!(
            events,
            vec![LocalEvent::Renamed {
                from: "old.md".into(),
                to: "new.md".into()
            }]
        );
    }

    #[test]
    fn test_unpaired_rename_sides() {
        let events = drain(
            vec![
                RawChange::RenamedFrom("gone.md".into()),
                RawChange::RenamedTo("photo.png".into()),
            ],
            &[("photo.png", false)],
        );
        assert_eq!(
            events,
            vec![
                LocalEvent::Deleted {
                    path: "gone.md".into()
                },
                LocalEvent::Created {
                    path: "photo.png".into()
                },
            ]
        );
    }

    #[test]
    fn test_relative_skips_hidden_segments() {
        let vault = Path::new("/vault");
        assert_eq!(
            relative(vault, Path::new("/vault/notes/a.md")).as_deref(),
            Some("notes/a.md")
        );
        assert_eq!(relative(vault, Path::new("/vault/.obsidian/app.json")), None);
        assert_eq!(relative(vault, Path::new("/vault/notes/.a.md.swp")), None);
        assert_eq!(relative(vault, Path::new("/vault")), None);
        assert_eq!(relative(vault, Path::new("/elsewhere/a.md")), None);
    }
}
