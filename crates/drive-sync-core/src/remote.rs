//! RemoteStore trait abstraction for the cloud side of the vault.
//!
//! The remote store holds opaque blobs identified by an id and carrying a
//! full logical path as their name. Containers (folders) group the blobs of
//! one vault. The store is authoritative but only eventually consistent: a
//! listing taken right after a `put` may not contain the new entry yet.
//!
//! Implementations:
//! - `InMemoryRemote` - For testing, records every call
//! - `DirRemote` (in drive-sync-daemon) - Directory-backed store

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RemoteError {
    /// The call could not complete (network, credentials, server error).
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Remote object not found: {0}")]
    NotFound(String),

    #[error("Remote error: {0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, RemoteError>;

/// One blob in a remote listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteEntry {
    /// Opaque remote id
    pub id: String,
    /// Full vault-relative path
    pub name: String,
    /// Last modification time as reported by the store
    pub modified_at: DateTime<Utc>,
}

/// Content fetched with `RemoteStore::get`.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    /// Full vault-relative path the blob is stored under
    pub name: String,
    pub content: Vec<u8>,
}

/// Cloud object store as seen by the sync engine.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// List every blob inside a container.
    async fn list(&self, container_id: &str) -> Result<Vec<RemoteEntry>>;

    /// Download a blob.
    async fn get(&self, id: &str) -> Result<RemoteFile>;

    /// Upload a new blob under `path` into a container. Returns its id.
    async fn put(&self, path: &str, content: &[u8], container_id: &str) -> Result<String>;

    /// Replace the content of an existing blob.
    async fn update(&self, id: &str, content: &[u8]) -> Result<()>;

    /// Change the name (full path) of a blob.
    async fn rename(&self, id: &str, new_path: &str) -> Result<()>;

    /// Delete a blob or container. Returns true iff something was removed.
    async fn delete(&self, id: &str) -> Result<bool>;

    /// Create a container, optionally nested in `parent_id`. Returns its id.
    async fn create_container(&self, parent_id: Option<&str>, name: &str) -> Result<String>;

    /// Look up a container by name inside `parent_id` (or at the top level).
    async fn find_container(&self, parent_id: Option<&str>, name: &str) -> Result<Option<String>>;
}

#[async_trait]
impl<T: RemoteStore + ?Sized> RemoteStore for std::sync::Arc<T> {
    async fn list(&self, container_id: &str) -> Result<Vec<RemoteEntry>> {
        (**self).list(container_id).await
    }

    async fn get(&self, id: &str) -> Result<RemoteFile> {
        (**self).get(id).await
    }

    async fn put(&self, path: &str, content: &[u8], container_id: &str) -> Result<String> {
        (**self).put(path, content, container_id).await
    }

    async fn update(&self, id: &str, content: &[u8]) -> Result<()> {
        (**self).update(id, content).await
    }

    async fn rename(&self, id: &str, new_path: &str) -> Result<()> {
        (**self).rename(id, new_path).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        (**self).delete(id).await
    }

    async fn create_container(&self, parent_id: Option<&str>, name: &str) -> Result<String> {
        (**self).create_container(parent_id, name).await
    }

    async fn find_container(&self, parent_id: Option<&str>, name: &str) -> Result<Option<String>> {
        (**self).find_container(parent_id, name).await
    }
}

/// A call made against `InMemoryRemote`, for assertions in tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteCall {
    List,
    Get { id: String },
    Put { path: String },
    Update { id: String },
    Rename { id: String, new_path: String },
    Delete { id: String },
    CreateContainer { name: String },
    FindContainer { name: String },
}

impl RemoteCall {
    /// True for calls that change remote state.
    pub fn is_mutation(&self) -> bool {
        !matches!(
            self,
            RemoteCall::List | RemoteCall::Get { .. } | RemoteCall::FindContainer { .. }
        )
    }
}

#[derive(Debug, Clone)]
struct StoredBlob {
    name: String,
    container: String,
    content: Vec<u8>,
    modified_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct StoredContainer {
    parent: Option<String>,
    name: String,
}

#[derive(Default)]
struct RemoteInner {
    blobs: HashMap<String, StoredBlob>,
    containers: HashMap<String, StoredContainer>,
    next_id: u64,
}

/// In-memory remote store for testing.
///
/// Ids are sequential (`"1"`, `"2"`, ...) so tests can refer to them.
#[derive(Default)]
pub struct InMemoryRemote {
    inner: Mutex<RemoteInner>,
    calls: Mutex<Vec<RemoteCall>>,
    offline: AtomicBool,
}

impl InMemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a container directly, bypassing the call log.
    pub fn seed_container(&self, parent_id: Option<&str>, name: &str) -> String {
        let mut inner = self.lock();
        let id = Self::allocate_id(&mut inner);
        inner.containers.insert(
            id.clone(),
            StoredContainer {
                parent: parent_id.map(str::to_string),
                name: name.to_string(),
            },
        );
        id
    }

    /// Store a blob directly, bypassing the call log.
    pub fn seed_file(
        &self,
        container_id: &str,
        name: &str,
        content: &[u8],
        modified_at: DateTime<Utc>,
    ) -> String {
        let mut inner = self.lock();
        let id = Self::allocate_id(&mut inner);
        inner.blobs.insert(
            id.clone(),
            StoredBlob {
                name: name.to_string(),
                container: container_id.to_string(),
                content: content.to_vec(),
                modified_at,
            },
        );
        id
    }

    /// Override the modification time of a blob.
    pub fn set_modified_at(&self, id: &str, modified_at: DateTime<Utc>) {
        if let Some(blob) = self.lock().blobs.get_mut(id) {
            blob.modified_at = modified_at;
        }
    }

    /// Simulate a transport outage: every call fails while set.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Names of all blobs in a container, sorted.
    pub fn names(&self, container_id: &str) -> Vec<String> {
        let inner = self.lock();
        let mut names: Vec<String> = inner
            .blobs
            .values()
            .filter(|b| b.container == container_id)
            .map(|b| b.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Content of the blob currently stored under `name`.
    pub fn content_of(&self, name: &str) -> Option<Vec<u8>> {
        let inner = self.lock();
        inner
            .blobs
            .values()
            .find(|b| b.name == name)
            .map(|b| b.content.clone())
    }

    /// Every call made so far, oldest first.
    pub fn calls(&self) -> Vec<RemoteCall> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Only the calls that changed remote state.
    pub fn mutations(&self) -> Vec<RemoteCall> {
        self.calls().into_iter().filter(RemoteCall::is_mutation).collect()
    }

    pub fn clear_calls(&self) {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, RemoteInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn allocate_id(inner: &mut RemoteInner) -> String {
        inner.next_id += 1;
        inner.next_id.to_string()
    }

    fn record(&self, call: RemoteCall) -> Result<()> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(call);
        if self.offline.load(Ordering::SeqCst) {
            return Err(RemoteError::Transport("remote unreachable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteStore for InMemoryRemote {
    async fn list(&self, container_id: &str) -> Result<Vec<RemoteEntry>> {
        self.record(RemoteCall::List)?;
        let inner = self.lock();
        if !inner.containers.contains_key(container_id) {
            return Err(RemoteError::NotFound(container_id.to_string()));
        }
        let mut entries: Vec<RemoteEntry> = inner
            .blobs
            .iter()
            .filter(|(_, b)| b.container == container_id)
            .map(|(id, b)| RemoteEntry {
                id: id.clone(),
                name: b.name.clone(),
                modified_at: b.modified_at,
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn get(&self, id: &str) -> Result<RemoteFile> {
        self.record(RemoteCall::Get { id: id.to_string() })?;
        let inner = self.lock();
        inner
            .blobs
            .get(id)
            .map(|b| RemoteFile {
                name: b.name.clone(),
                content: b.content.clone(),
            })
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    async fn put(&self, path: &str, content: &[u8], container_id: &str) -> Result<String> {
        self.record(RemoteCall::Put {
            path: path.to_string(),
        })?;
        let mut inner = self.lock();
        if !inner.containers.contains_key(container_id) {
            return Err(RemoteError::NotFound(container_id.to_string()));
        }
        let id = Self::allocate_id(&mut inner);
        inner.blobs.insert(
            id.clone(),
            StoredBlob {
                name: path.to_string(),
                container: container_id.to_string(),
                content: content.to_vec(),
                modified_at: Utc::now(),
            },
        );
        Ok(id)
    }

    async fn update(&self, id: &str, content: &[u8]) -> Result<()> {
        self.record(RemoteCall::Update { id: id.to_string() })?;
        let mut inner = self.lock();
        let blob = inner
            .blobs
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        blob.content = content.to_vec();
        blob.modified_at = Utc::now();
        Ok(())
    }

    async fn rename(&self, id: &str, new_path: &str) -> Result<()> {
        self.record(RemoteCall::Rename {
            id: id.to_string(),
            new_path: new_path.to_string(),
        })?;
        let mut inner = self.lock();
        let blob = inner
            .blobs
            .get_mut(id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        blob.name = new_path.to_string();
        blob.modified_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        self.record(RemoteCall::Delete { id: id.to_string() })?;
        let mut inner = self.lock();
        if inner.blobs.remove(id).is_some() {
            return Ok(true);
        }
        if inner.containers.remove(id).is_some() {
            // Deleting a container takes its blobs with it
            inner.blobs.retain(|_, b| b.container != id);
            return Ok(true);
        }
        Ok(false)
    }

    async fn create_container(&self, parent_id: Option<&str>, name: &str) -> Result<String> {
        self.record(RemoteCall::CreateContainer {
            name: name.to_string(),
        })?;
        let mut inner = self.lock();
        let id = Self::allocate_id(&mut inner);
        inner.containers.insert(
            id.clone(),
            StoredContainer {
                parent: parent_id.map(str::to_string),
                name: name.to_string(),
            },
        );
        Ok(id)
    }

    async fn find_container(&self, parent_id: Option<&str>, name: &str) -> Result<Option<String>> {
        self.record(RemoteCall::FindContainer {
            name: name.to_string(),
        })?;
        let inner = self.lock();
        Ok(inner
            .containers
            .iter()
            .find(|(_, c)| c.name == name && c.parent.as_deref() == parent_id)
            .map(|(id, _)| id.clone()))
    }
}
