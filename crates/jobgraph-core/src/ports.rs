//! Port traits.
//!
//! These traits define the interfaces between the orchestrator and its external
//! collaborators: the process that runs a step, the storage that holds
//! artifact bytes, and whoever wants to watch a run progress.

use crate::events::RunEvent;
use crate::ids::RunId;
use crate::run::InstanceKey;
use crate::Result;
use async_trait::async_trait;
use indexmap::IndexMap;
use std::path::PathBuf;
use std::time::Duration;

/// A fully interpolated command, ready to hand to an executor.
#[derive(Debug, Clone)]
pub struct StepRequest {
    pub run_id: RunId,
    pub instance: InstanceKey,
    pub step: String,
    pub command: String,
    pub shell: String,
    pub env: IndexMap<String, String>,
    pub workspace: PathBuf,
    /// Time left before the instance deadline.
    pub timeout: Duration,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    pub exit_code: i32,
    pub stdout: String,
    /// `key=value` pairs the step reported.
    pub outputs: IndexMap<String, String>,
}

impl StepOutcome {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            outputs: IndexMap::new(),
        }
    }

    pub fn failure(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }

    pub fn with_output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }

    pub fn succeeded(&self) -> bool {
        self.exit_code == 0
    }
}

/// Runs one step to completion.
///
/// A non-zero exit code is returned as `Ok`; `Err` is reserved for failures
/// to run the step at all. Dropping the returned future must stop the step.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn execute(&self, request: &StepRequest) -> Result<StepOutcome>;
}

/// Byte storage behind the artifact store.
#[async_trait]
pub trait ArtifactBackend: Send + Sync {
    /// Store content under `key`, replacing any previous content.
    async fn write(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Returns `None` if nothing is stored under `key`.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>>;

    async fn delete(&self, key: &str) -> Result<()>;

    fn name(&self) -> &str;
}

/// Receives progress events.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn publish(&self, event: RunEvent) -> Result<()>;
}
