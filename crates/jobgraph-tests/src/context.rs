//! Test context wiring a scheduler to scripted collaborators.

use crate::helpers::{RecordingSink, ScriptedExecutor};
use jobgraph_artifacts::ArtifactStore;
use jobgraph_core::context::RunContext;
use jobgraph_core::pipeline::RunDefinition;
use jobgraph_core::run::RunResult;
use jobgraph_scheduler::{RunHandle, Scheduler, SchedulerConfig};
use std::path::Path;
use std::sync::Arc;
use tempfile::TempDir;

/// Scheduler with a scripted executor, an in-memory store, a recording event
/// sink and a scratch workspace.
///
/// Drop this to remove the workspace.
pub struct TestContext {
    pub executor: Arc<ScriptedExecutor>,
    pub events: Arc<RecordingSink>,
    pub store: Arc<ArtifactStore>,
    pub scheduler: Scheduler,
    workspace: TempDir,
}

impl TestContext {
    pub fn new(executor: ScriptedExecutor) -> Self {
        Self::with_store(executor, ArtifactStore::in_memory())
    }

    pub fn with_store(executor: ScriptedExecutor, store: ArtifactStore) -> Self {
        crate::init_test_logging();

        let workspace = tempfile::tempdir().expect("Failed to create workspace");
        let executor = Arc::new(executor);
        let events = Arc::new(RecordingSink::new());
        let store = Arc::new(store);
        let scheduler = Self::scheduler(&executor, &events, &store, workspace.path(), 4);

        Self {
            executor,
            events,
            store,
            scheduler,
            workspace,
        }
    }

    /// Rebuild the scheduler with a different worker limit.
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.scheduler = Self::scheduler(
            &self.executor,
            &self.events,
            &self.store,
            self.workspace.path(),
            max_workers,
        );
        self
    }

    fn scheduler(
        executor: &Arc<ScriptedExecutor>,
        events: &Arc<RecordingSink>,
        store: &Arc<ArtifactStore>,
        workspace: &Path,
        max_workers: usize,
    ) -> Scheduler {
        Scheduler::new(
            executor.clone(),
            store.clone(),
            SchedulerConfig {
                max_workers,
                workspace: workspace.to_path_buf(),
            },
        )
        .with_event_sink(events.clone())
    }

    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }

    /// Load and run a definition that is expected to be valid.
    pub async fn run(&self, definition: &RunDefinition, ctx: RunContext) -> RunResult {
        let plan = self
            .scheduler
            .load(definition)
            .expect("Run definition should be valid");
        self.scheduler.run(plan, ctx).await
    }

    pub fn spawn(&self, definition: &RunDefinition, ctx: RunContext) -> RunHandle {
        let plan = self
            .scheduler
            .load(definition)
            .expect("Run definition should be valid");
        self.scheduler.spawn(plan, ctx)
    }
}
