//! The artifact store.

use crate::keys::{content_digest, content_key};
use crate::provider::MemoryBackend;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use jobgraph_core::artifact::{ArtifactMetadata, ArtifactRef};
use jobgraph_core::ports::ArtifactBackend;
use jobgraph_core::run::InstanceKey;
use jobgraph_core::{ArtifactId, Error, Result};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

type Slot = Arc<Mutex<Option<ArtifactMetadata>>>;

/// Named artifacts with at most one live version per name.
///
/// Operations on the same name are serialized through a per-name mutex;
/// different names never contend. Content is written to the backend before
/// the new version becomes visible, and the previous version's content is
/// deleted once it has been replaced.
pub struct ArtifactStore {
    backend: Arc<dyn ArtifactBackend>,
    slots: DashMap<String, Slot>,
    default_retention: Option<Duration>,
}

impl ArtifactStore {
    pub fn new(backend: Arc<dyn ArtifactBackend>) -> Self {
        Self {
            backend,
            slots: DashMap::new(),
            default_retention: None,
        }
    }

    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    /// Retention applied when `put` is called without one. Without a default,
    /// such artifacts never expire.
    pub fn with_default_retention(mut self, retention: Duration) -> Self {
        self.default_retention = Some(retention);
        self
    }

    pub fn backend_name(&self) -> &str {
        self.backend.name()
    }

    fn slot(&self, name: &str) -> Slot {
        self.slots.entry(name.to_string()).or_default().clone()
    }

    fn existing_slot(&self, name: &str) -> Option<Slot> {
        self.slots.get(name).map(|entry| entry.value().clone())
    }

    /// Store `data` under `name`, replacing and invalidating any previous version.
    pub async fn put(
        &self,
        name: &str,
        producer: &InstanceKey,
        data: &[u8],
        retention: Option<Duration>,
    ) -> Result<ArtifactRef> {
        let slot = self.slot(name);
        let mut current = slot.lock().await;

        let id = ArtifactId::new();
        let handle = content_key(name, &id);
        self.backend.write(&handle, data).await?;

        let created_at = Utc::now();
        let metadata = ArtifactMetadata {
            id,
            name: name.to_string(),
            size_bytes: data.len() as u64,
            digest: content_digest(data),
            producer: producer.clone(),
            content_handle: handle,
            created_at,
            expires_at: retention
                .or(self.default_retention)
                .map(|retention| created_at + retention),
        };
        let reference = metadata.reference();

        if let Some(previous) = current.replace(metadata) {
            debug!(artifact = %name, previous = %previous.id, "Artifact overwritten");
            if let Err(e) = self.backend.delete(&previous.content_handle).await {
                warn!(artifact = %name, error = %e, "Failed to delete replaced artifact content");
            }
        }

        info!(
            artifact = %name,
            id = %reference.id,
            size_bytes = data.len(),
            producer = %producer,
            "Artifact stored"
        );
        Ok(reference)
    }

    /// Content of the live version of `name`.
    pub async fn get(&self, name: &str) -> Result<Vec<u8>> {
        self.load(name, None).await
    }

    /// Content of exactly the version `reference` points at. Fails with
    /// `ArtifactNotFound` once that version has been replaced or removed.
    pub async fn read(&self, reference: &ArtifactRef) -> Result<Vec<u8>> {
        self.load(&reference.name, Some(&reference.id)).await
    }

    async fn load(&self, name: &str, version: Option<&ArtifactId>) -> Result<Vec<u8>> {
        let not_found = || Error::ArtifactNotFound(name.to_string());
        let slot = self.existing_slot(name).ok_or_else(not_found)?;
        let current = slot.lock().await;

        let metadata = current.as_ref().ok_or_else(not_found)?;
        if version.is_some_and(|id| *id != metadata.id) {
            debug!(artifact = %name, "Stale artifact reference");
            return Err(not_found());
        }
        if metadata.is_expired(Utc::now()) {
            debug!(artifact = %name, "Artifact retention elapsed");
            return Err(not_found());
        }

        self.backend
            .read(&metadata.content_handle)
            .await?
            .ok_or_else(not_found)
    }

    pub async fn metadata(&self, name: &str) -> Option<ArtifactMetadata> {
        let slot = self.existing_slot(name)?;
        let current = slot.lock().await;
        current.clone()
    }

    /// Metadata of every tracked artifact, sorted by name.
    pub async fn list(&self) -> Vec<ArtifactMetadata> {
        let slots: Vec<Slot> = self.slots.iter().map(|e| e.value().clone()).collect();
        let mut artifacts = Vec::with_capacity(slots.len());
        for slot in slots {
            if let Some(metadata) = slot.lock().await.clone() {
                artifacts.push(metadata);
            }
        }
        artifacts.sort_by(|a, b| a.name.cmp(&b.name));
        artifacts
    }

    /// Remove `name`. Returns whether an artifact was live.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let Some(slot) = self.existing_slot(name) else {
            return Ok(false);
        };
        let mut current = slot.lock().await;
        let Some(metadata) = current.as_ref() else {
            return Ok(false);
        };
        self.backend.delete(&metadata.content_handle).await?;
        *current = None;
        info!(artifact = %name, "Artifact removed");
        Ok(true)
    }

    /// Evict every artifact whose retention window has elapsed at `now` and
    /// return the evicted names.
    ///
    /// An artifact whose content cannot be deleted stays listed and is retried
    /// by the next call; the remaining artifacts are still evicted.
    pub async fn expire(&self, now: DateTime<Utc>) -> Vec<String> {
        let slots: Vec<(String, Slot)> = self
            .slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();

        let mut evicted = Vec::new();
        for (name, slot) in slots {
            let mut current = slot.lock().await;
            let Some(metadata) = current.as_ref().filter(|m| m.is_expired(now)) else {
                continue;
            };
            let deleted = self.backend.delete(&metadata.content_handle).await;
            match deleted {
                Ok(()) => {
                    *current = None;
                    evicted.push(name);
                }
                Err(e) => warn!(artifact = %name, error = %e, "Failed to delete expired artifact"),
            }
        }

        evicted.sort();
        if !evicted.is_empty() {
            info!(count = evicted.len(), "Expired artifacts evicted");
        }
        evicted
    }
}
