//! Directory-backed remote store.
//!
//! Lets several vaults on one machine (or on a shared mount) sync through a
//! plain directory. Layout:
//!
//! ```text
//! <root>/index.json    containers and blob metadata
//! <root>/blobs/<id>    blob content
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use drive_sync_core::remote::{RemoteEntry, RemoteError, RemoteFile, RemoteStore, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

const INDEX_FILE: &str = "index.json";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ContainerRecord {
    id: String,
    parent: Option<String>,
    name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlobRecord {
    id: String,
    container: String,
    name: String,
    modified_at: DateTime<Utc>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Index {
    containers: Vec<ContainerRecord>,
    blobs: Vec<BlobRecord>,
}

impl Index {
    fn has_container(&self, id: &str) -> bool {
        self.containers.iter().any(|c| c.id == id)
    }

    fn blob_mut(&mut self, id: &str) -> Result<&mut BlobRecord> {
        self.blobs
            .iter_mut()
            .find(|b| b.id == id)
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    /// A container and every container nested in it.
    fn subtree(&self, id: &str) -> Vec<String> {
        let mut ids = vec![id.to_string()];
        let mut i = 0;
        while i < ids.len() {
            let children = self
                .containers
                .iter()
                .filter(|c| c.parent.as_deref() == Some(ids[i].as_str()))
                .map(|c| c.id.clone())
                .collect::<Vec<_>>();
            ids.extend(children);
            i += 1;
        }
        ids
    }
}

fn transport(e: impl std::fmt::Display) -> RemoteError {
    RemoteError::Transport(e.to_string())
}

/// Remote store kept in a local directory.
///
/// All calls are serialized through the index lock.
pub struct DirRemote {
    root: PathBuf,
    index: Mutex<Index>,
}

impl DirRemote {
    /// Open (or create) a store rooted at `root`.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join("blobs"))
            .await
            .map_err(transport)?;

        let index_path = root.join(INDEX_FILE);
        let index = if fs::try_exists(&index_path).await.map_err(transport)? {
            let content = fs::read(&index_path).await.map_err(transport)?;
            serde_json::from_slice(&content)
                .map_err(|e| RemoteError::Other(format!("corrupt index: {}", e)))?
        } else {
            Index::default()
        };

        debug!("Opened remote store at {}", root.display());
        Ok(Self {
            root,
            index: Mutex::new(index),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn blob_path(&self, id: &str) -> PathBuf {
        self.root.join("blobs").join(id)
    }

    async fn save(&self, index: &Index) -> Result<()> {
        let content = serde_json::to_vec_pretty(index).map_err(|e| RemoteError::Other(e.to_string()))?;
        let tmp = self.root.join(format!("{}.tmp", INDEX_FILE));
        fs::write(&tmp, content).await.map_err(transport)?;
        fs::rename(&tmp, self.root.join(INDEX_FILE))
            .await
            .map_err(transport)
    }
}

#[async_trait]
impl RemoteStore for DirRemote {
    async fn list(&self, container_id: &str) -> Result<Vec<RemoteEntry>> {
        let index = self.index.lock().await;
        if !index.has_container(container_id) {
            return Err(RemoteError::NotFound(container_id.to_string()));
        }
        let mut entries: Vec<RemoteEntry> = index
            .blobs
            .iter()
            .filter(|b| b.container == container_id)
            .map(|b| RemoteEntry {
                id: b.id.clone(),
                name: b.name.clone(),
                modified_at: b.modified_at,
            })
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn get(&self, id: &str) -> Result<RemoteFile> {
        let index = self.index.lock().await;
        let name = index
            .blobs
            .iter()
            .find(|b| b.id == id)
            .map(|b| b.name.clone())
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
        let content = fs::read(self.blob_path(id)).await.map_err(transport)?;
        Ok(RemoteFile { name, content })
    }

    async fn put(&self, path: &str, content: &[u8], container_id: &str) -> Result<String> {
        let mut index = self.index.lock().await;
        if !index.has_container(container_id) {
            return Err(RemoteError::NotFound(container_id.to_string()));
        }
        let id = uuid::Uuid::new_v4().to_string();
        fs::write(self.blob_path(&id), content)
            .await
            .map_err(transport)?;
        index.blobs.push(BlobRecord {
            id: id.clone(),
            container: container_id.to_string(),
            name: path.to_string(),
            modified_at: Utc::now(),
        });
        self.save(&index).await?;
        Ok(id)
    }

    async fn update(&self, id: &str, content: &[u8]) -> Result<()> {
        let mut index = self.index.lock().await;
        index.blob_mut(id)?.modified_at = Utc::now();
        fs::write(self.blob_path(id), content)
            .await
            .map_err(transport)?;
        self.save(&index).await
    }

    async fn rename(&self, id: &str, new_path: &str) -> Result<()> {
        let mut index = self.index.lock().await;
        let blob = index.blob_mut(id)?;
        blob.name = new_path.to_string();
        blob.modified_at = Utc::now();
        self.save(&index).await
    }

    async fn delete(&self, id: &str) -> Result<bool> {
        let mut index = self.index.lock().await;

        let doomed: Vec<String> = if index.blobs.iter().any(|b| b.id == id) {
            vec![id.to_string()]
        } else if index.has_container(id) {
            let subtree = index.subtree(id);
            index.containers.retain(|c| !subtree.contains(&c.id));
            index
                .blobs
                .iter()
                .filter(|b| subtree.contains(&b.container))
                .map(|b| b.id.clone())
                .collect()
        } else {
            return Ok(false);
        };

        index.blobs.retain(|b| !doomed.contains(&b.id));
        self.save(&index).await?;
        for blob in &doomed {
            if let Err(e) = fs::remove_file(self.blob_path(blob)).await {
                debug!("Blob file {} already gone: {}", blob, e);
            }
        }
        Ok(true)
    }

    async fn create_container(&self, parent_id: Option<&str>, name: &str) -> Result<String> {
        let mut index = self.index.lock().await;
        let id = uuid::Uuid::new_v4().to_string();
        index.containers.push(ContainerRecord {
            id: id.clone(),
            parent: parent_id.map(str::to_string),
            name: name.to_string(),
        });
        self.save(&index).await?;
        Ok(id)
    }

    async fn find_container(&self, parent_id: Option<&str>, name: &str) -> Result<Option<String>> {
        let index = self.index.lock().await;
        Ok(index
            .containers
            .iter()
            .find(|c| c.name == name && c.parent.as_deref() == parent_id)
            .map(|c| c.id.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_container_delete_removes_nested_blobs() {
        let dir = TempDir::new().unwrap();
        let store = DirRemote::open(dir.path()).await.unwrap();

        let root = store.create_container(None, "obsidian").await.unwrap();
        let vault = store.create_container(Some(&root), "notes").await.unwrap();
        let blob = store.put("a.md", b"hello", &vault).await.unwrap();

        assert!(store.delete(&root).await.unwrap());

        assert!(store.find_container(None, "obsidian").await.unwrap().is_none());
        assert!(matches!(store.get(&blob).await, Err(RemoteError::NotFound(_))));
        assert!(!store.blob_path(&blob).exists());
        assert!(!store.delete(&root).await.unwrap());
    }

    #[tokio::test]
    async fn test_unknown_container_is_not_found() {
        let dir = TempDir::new().unwrap();
        let store = DirRemote::open(dir.path()).await.unwrap();

        assert!(matches!(store.list("nope").await, Err(RemoteError::NotFound(_))));
        assert!(matches!(
            store.put("a.md", b"x", "nope").await,
            Err(RemoteError::NotFound(_))
        ));
    }
}
