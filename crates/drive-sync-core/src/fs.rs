//! FileSystem trait abstraction for the local side of the vault.
//!
//! Implementations:
//! - `InMemoryFs` - For testing
//! - `NativeFs` (in drive-sync-daemon) - Uses tokio::fs
//!
//! Unlike a plain blob store, `create` and `write` never create missing parent
//! folders. Callers that materialize remote content handle `FsError::NotFound`
//! by creating the parent and retrying once.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("File not found: {0}")]
    NotFound(String),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Is a directory: {0}")]
    IsDirectory(String),

    #[error("IO error: {0}")]
    Io(String),
}

pub type Result<T> = std::result::Result<T, FsError>;

/// Directory entry
#[derive(Debug, Clone)]
pub struct FileEntry {
    /// File or directory name (not full path)
    pub name: String,
    /// Whether this is a directory
    pub is_dir: bool,
}

/// Change notification emitted by the local store.
///
/// Paths are vault-relative and use `/` as separator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    Created { path: String },
    Renamed { from: String, to: String },
    Deleted { path: String },
    Modified { path: String },
}

impl LocalEvent {
    /// The path the notification is about (the new path for renames).
    pub fn path(&self) -> &str {
        match self {
            LocalEvent::Created { path }
            | LocalEvent::Deleted { path }
            | LocalEvent::Modified { path } => path,
            LocalEvent::Renamed { to, .. } => to,
        }
    }
}

/// Platform-independent filesystem abstraction.
///
/// Implementations must be `Send + Sync`; the engine shares one instance
/// between its event loop, timer and reconciliation tasks.
#[async_trait]
pub trait FileSystem: Send + Sync {
    /// Read file contents
    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Read file contents as (lossy) UTF-8 text
    async fn read_text(&self, path: &str) -> Result<String> {
        let bytes = self.read(path).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Create a new file. Fails with `NotFound` when the parent folder is
    /// missing and with `AlreadyExists` when the path is taken.
    async fn create(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Overwrite (or create) a file. The parent folder must exist.
    async fn write(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Move a file to a new path. The destination parent must exist.
    async fn rename(&self, from: &str, to: &str) -> Result<()>;

    /// List directory contents
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>>;

    /// Delete file or empty directory
    async fn delete(&self, path: &str) -> Result<()>;

    /// Check if path exists
    async fn exists(&self, path: &str) -> Result<bool>;

    /// Create directory (and parents if needed)
    async fn mkdir(&self, path: &str) -> Result<()>;
}

/// Recursively enumerate every file in the vault, sorted by path.
///
/// Hidden files and directories (leading `.`) are skipped.
pub async fn list_files<F: FileSystem + ?Sized>(fs: &F) -> Result<Vec<String>> {
    let mut files = Vec::new();
    let mut dirs_to_visit = vec![String::new()]; // Start with root

    while let Some(dir) = dirs_to_visit.pop() {
        let entries = fs.list(&dir).await?;

        for entry in entries {
            if entry.name.starts_with('.') {
                continue;
            }

            let path = if dir.is_empty() {
                entry.name.clone()
            } else {
                format!("{}/{}", dir, entry.name)
            };

            if entry.is_dir {
                dirs_to_visit.push(path);
            } else {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

/// In-memory filesystem for testing
pub struct InMemoryFs {
    files: RwLock<HashMap<String, Vec<u8>>>,
    dirs: RwLock<HashSet<String>>,
}

impl InMemoryFs {
    pub fn new() -> Self {
        let mut dirs = HashSet::new();
        dirs.insert(String::new()); // Root directory
        Self {
            files: RwLock::new(HashMap::new()),
            dirs: RwLock::new(dirs),
        }
    }

    /// Seed a file, creating its parent folders. Test setup helper.
    pub fn insert(&self, path: &str, content: &[u8]) {
        let path = Self::normalize_path(path);
        let mut parent = Self::parent_path(&path);
        {
            let mut dirs = self.dirs.write().unwrap_or_else(PoisonError::into_inner);
            while let Some(dir) = parent {
                parent = Self::parent_path(&dir);
                dirs.insert(dir);
            }
        }
        self.put_file(path, content);
    }

    /// Snapshot of a file's contents as text, if present. Test helper.
    pub fn text(&self, path: &str) -> Option<String> {
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        files
            .get(&Self::normalize_path(path))
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
    }

    fn put_file(&self, path: String, content: &[u8]) {
        self.files
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path, content.to_vec());
    }

    fn has_dir(&self, path: &str) -> bool {
        self.dirs
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(path)
    }

    fn require_parent(&self, path: &str) -> Result<()> {
        match Self::parent_path(path) {
            Some(parent) if !self.has_dir(&parent) => Err(FsError::NotFound(parent)),
            _ => Ok(()),
        }
    }

    fn normalize_path(path: &str) -> String {
        path.trim_matches('/').to_string()
    }

    fn parent_path(path: &str) -> Option<String> {
        let normalized = Self::normalize_path(path);
        if normalized.is_empty() {
            None
        } else {
            match normalized.rfind('/') {
                Some(pos) => Some(normalized[..pos].to_string()),
                None => Some(String::new()),
            }
        }
    }
}

impl Default for InMemoryFs {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl FileSystem for InMemoryFs {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        let path = Self::normalize_path(path);
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        files
            .get(&path)
            .cloned()
            .ok_or_else(|| FsError::NotFound(path))
    }

    async fn create(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        self.require_parent(&path)?;
        if self.exists(&path).await? {
            return Err(FsError::AlreadyExists(path));
        }
        self.put_file(path, content);
        Ok(())
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        let path = Self::normalize_path(path);
        if self.has_dir(&path) {
            return Err(FsError::IsDirectory(path));
        }
        self.require_parent(&path)?;
        self.put_file(path, content);
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        let from = Self::normalize_path(from);
        let to = Self::normalize_path(to);
        self.require_parent(&to)?;

        let content = {
            let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
            files
                .remove(&from)
                .ok_or_else(|| FsError::NotFound(from.clone()))?
        };
        self.put_file(to, &content);
        Ok(())
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        let path = Self::normalize_path(path);
        let prefix = if path.is_empty() {
            String::new()
        } else {
            format!("{}/", path)
        };

        if !self.has_dir(&path) {
            return Err(FsError::NotFound(path));
        }

        let mut entries = Vec::new();
        let mut seen = HashSet::new();

        // Direct children only: anything left after the prefix must be a single segment
        let files = self.files.read().unwrap_or_else(PoisonError::into_inner);
        for file_path in files.keys() {
            if let Some(rest) = file_path.strip_prefix(&prefix) {
                if !rest.contains('/') && seen.insert(rest.to_string()) {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: false,
                    });
                }
            }
        }

        let dirs = self.dirs.read().unwrap_or_else(PoisonError::into_inner);
        for dir_path in dirs.iter() {
            if let Some(rest) = dir_path.strip_prefix(&prefix) {
                if !rest.is_empty() && !rest.contains('/') && seen.insert(rest.to_string()) {
                    entries.push(FileEntry {
                        name: rest.to_string(),
                        is_dir: true,
                    });
                }
            }
        }

        Ok(entries)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);

        // Try to delete as file first
        {
            let mut files = self.files.write().unwrap_or_else(PoisonError::into_inner);
            if files.remove(&path).is_some() {
                return Ok(());
            }
        }

        // Try to delete as directory
        {
            let mut dirs = self.dirs.write().unwrap_or_else(PoisonError::into_inner);
            if !path.is_empty() && dirs.remove(&path) {
                return Ok(());
            }
        }

        Err(FsError::NotFound(path))
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let path = Self::normalize_path(path);
        let in_files = self
            .files
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&path);
        Ok(in_files || self.has_dir(&path))
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        let path = Self::normalize_path(path);
        if path.is_empty() {
            return Ok(()); // Root always exists
        }

        // Create parent first
        if let Some(parent) = Self::parent_path(&path) {
            Box::pin(self.mkdir(&parent)).await?;
        }

        self.dirs
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path);
        Ok(())
    }
}

// Implement FileSystem for Arc<T> where T: FileSystem
// This lets tests keep a handle on the filesystem the engine owns
#[async_trait]
impl<T: FileSystem + ?Sized> FileSystem for std::sync::Arc<T> {
    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        (**self).read(path).await
    }

    async fn create(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).create(path, content).await
    }

    async fn write(&self, path: &str, content: &[u8]) -> Result<()> {
        (**self).write(path, content).await
    }

    async fn rename(&self, from: &str, to: &str) -> Result<()> {
        (**self).rename(from, to).await
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>> {
        (**self).list(path).await
    }

    async fn delete(&self, path: &str) -> Result<()> {
        (**self).delete(path).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        (**self).exists(path).await
    }

    async fn mkdir(&self, path: &str) -> Result<()> {
        (**self).mkdir(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_inmemory_fs_basic_operations() {
        let fs = InMemoryFs::new();

        fs.create("test.txt", b"hello world").await.unwrap();
        assert_eq!(fs.read("test.txt").await.unwrap(), b"hello world");
        assert!(fs.exists("test.txt").await.unwrap());
        assert!(!fs.exists("nonexistent.txt").await.unwrap());

        fs.delete("test.txt").await.unwrap();
        assert!(!fs.exists("test.txt").await.unwrap());
    }

    #[tokio::test]
    async fn test_create_requires_parent_folder() {
        let fs = InMemoryFs::new();

        let err = fs.create("a/b/c.md", b"content").await.unwrap_err();
        assert!(matches!(err, FsError::NotFound(ref p) if p == "a/b"));

        fs.mkdir("a/b").await.unwrap();
        fs.create("a/b/c.md", b"content").await.unwrap();
        assert!(fs.exists("a").await.unwrap());

        let err = fs.create("a/b/c.md", b"again").await.unwrap_err();
        assert!(matches!(err, FsError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn test_rename_moves_content() {
        let fs = InMemoryFs::new();
        fs.insert("img/photo.png", b"\x89PNG");

        fs.rename("img/photo.png", "img/photo-synced.png")
            .await
            .unwrap();

        assert!(!fs.exists("img/photo.png").await.unwrap());
        assert_eq!(fs.read("img/photo-synced.png").await.unwrap(), b"\x89PNG");
    }

    #[tokio::test]
    async fn test_list_files_recurses_and_skips_hidden() {
        let fs = InMemoryFs::new();
        fs.insert("b.md", b"b");
        fs.insert("notes/a.md", b"a");
        fs.insert("notes/deep/c.png", b"c");
        fs.insert(".obsidian/workspace.json", b"{}");

        let files = list_files(&fs).await.unwrap();
        assert_eq!(files, vec!["b.md", "notes/a.md", "notes/deep/c.png"]);
    }
}
