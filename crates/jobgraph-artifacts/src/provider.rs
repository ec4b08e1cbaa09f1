//! Artifact content backends.

use async_trait::async_trait;
use jobgraph_core::ports::ArtifactBackend;
use jobgraph_core::{Error, Result};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

/// Keeps content in process memory. Used for tests and single-shot runs.
#[derive(Default)]
pub struct MemoryBackend {
    entries: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }
}

#[async_trait]
impl ArtifactBackend for MemoryBackend {
    async fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        self.entries
            .write()
            .await
            .insert(key.to_string(), data.to_vec());
        Ok(())
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.entries.read().await.get(key).cloned())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries.write().await.remove(key);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory"
    }
}

/// Stores content as files under a root directory.
pub struct FilesystemBackend {
    root_dir: PathBuf,
}

impl FilesystemBackend {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root_dir
    }

    fn key_path(&self, key: &str) -> PathBuf {
        // Keys come from `content_key`, whose segments are already sanitized.
        key.split('/')
            .fold(self.root_dir.clone(), |path, segment| path.join(segment))
    }
}

#[async_trait]
impl ArtifactBackend for FilesystemBackend {
    async fn write(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.key_path(key);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                Error::Artifact(format!("Failed to create artifact dir: {}", e))
            })?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| Error::Artifact(format!("Failed to write artifact: {}", e)))
    }

    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match tokio::fs::read(self.key_path(key)).await {
            Ok(data) => Ok(Some(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Artifact(format!("Failed to read artifact: {}", e))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let path = self.key_path(key);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Artifact(format!("Failed to delete artifact: {}", e))),
        }
        // Best effort: drop the per-name directory once it is empty.
        if let Some(parent) = path.parent()
            && parent != self.root_dir
        {
            let _ = tokio::fs::remove_dir(parent).await;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend() {
        let backend = MemoryBackend::new();
        backend.write("a/1", b"one").await.unwrap();
        assert_eq!(backend.read("a/1").await.unwrap(), Some(b"one".to_vec()));
        backend.delete("a/1").await.unwrap();
        assert_eq!(backend.read("a/1").await.unwrap(), None);
        assert!(backend.is_empty().await);
    }

    #[tokio::test]
    async fn test_filesystem_backend() {
        let dir = tempfile::tempdir().unwrap();
        let backend = FilesystemBackend::new(dir.path());

        backend.write("dist/art_1", b"bytes").await.unwrap();
        assert!(dir.path().join("dist").join("art_1").exists());
        assert_eq!(
            backend.read("dist/art_1").await.unwrap(),
            Some(b"bytes".to_vec())
        );

        backend.delete("dist/art_1").await.unwrap();
        assert_eq!(backend.read("dist/art_1").await.unwrap(), None);
        assert!(!dir.path().join("dist").exists());

        // Deleting twice is fine
        backend.delete("dist/art_1").await.unwrap();
    }
}
