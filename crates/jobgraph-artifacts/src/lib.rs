//! Artifact store for jobgraph runs.
//!
//! The store tracks which version of each named artifact is live, when it
//! expires and who produced it. Bytes live in an [`ArtifactBackend`]
//! (in memory or on the local filesystem).
//!
//! [`ArtifactBackend`]: jobgraph_core::ports::ArtifactBackend

pub mod keys;
pub mod provider;
pub mod store;

pub use keys::{content_digest, content_key, sanitize_key};
pub use provider::{FilesystemBackend, MemoryBackend};
pub use store::ArtifactStore;
