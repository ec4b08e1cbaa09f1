//! Artifact references and metadata.

use crate::ids::ArtifactId;
use crate::run::InstanceKey;
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Handle to one specific version of a named artifact. Overwriting the name
/// invalidates every earlier reference.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactRef {
    pub name: String,
    pub id: ArtifactId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactMetadata {
    pub id: ArtifactId,
    pub name: String,
    pub size_bytes: u64,
    /// Hex-encoded sha256 of the content.
    pub digest: String,
    pub producer: InstanceKey,
    /// Backend key the content was written under.
    pub content_handle: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
}

impl ArtifactMetadata {
    pub fn reference(&self) -> ArtifactRef {
        ArtifactRef {
            name: self.name.clone(),
            id: self.id,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}
