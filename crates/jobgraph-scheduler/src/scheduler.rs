//! Run coordination.
//!
//! One coordinator loop per run owns the state of every instance. Running
//! instances are tasks in a `JoinSet` that hand an [`InstanceOutcome`] back to
//! the loop; nothing else changes instance state.
//!
//! Worker slots are permits of one semaphore shared by a run and every run
//! nested in it. An instance that executes steps holds a permit while it runs.
//! A `workflow:` instance holds none, since its nested run takes permits for
//! its own instances.

use crate::instance::{InstanceContext, InstanceOutcome, InstanceRunner, publish};
use crate::plan::RunPlan;
use crate::queue::{QueueManager, QueuedInstance};
use chrono::Utc;
use futures::future::BoxFuture;
use indexmap::IndexMap;
use jobgraph_artifacts::ArtifactStore;
use jobgraph_core::context::RunContext;
use jobgraph_core::events::{
    InstanceStateChangedPayload, RunCompletedPayload, RunEvent, RunStartedPayload,
};
use jobgraph_core::expression::EvalScope;
use jobgraph_core::interpolation::interpolate;
use jobgraph_core::pipeline::{JobSpec, RunDefinition};
use jobgraph_core::ports::{EventSink, StepExecutor};
use jobgraph_core::run::{
    FailureDetail, FailureKind, InstanceReport, JobResult, JobStatus, MatrixAssignment, RunResult,
    RunStatus, Upstream,
};
use jobgraph_core::{ConfigurationError, Error, Result, RunId};
use jobgraph_trace::{RunAttributes, instance_span, run_span};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

/// Engine settings that do not come from the run definition.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Instances allowed to run at once when the definition sets no limit.
    pub max_workers: usize,
    /// Directory steps run in; upload paths and download targets resolve against it.
    pub workspace: PathBuf,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            workspace: PathBuf::from("."),
        }
    }
}

/// A run executing in the background.
pub struct RunHandle {
    token: CancellationToken,
    join: JoinHandle<RunResult>,
}

impl RunHandle {
    /// Request cancellation. Waiting instances are cancelled and running
    /// steps are stopped; the run then completes as `Cancelled`.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }

    pub async fn wait(self) -> Result<RunResult> {
        self.join
            .await
            .map_err(|e| Error::Internal(format!("Run task failed: {}", e)))
    }
}

/// Mutable state of one run, owned by its coordinator loop.
struct RunState {
    run_id: RunId,
    plan: Arc<RunPlan>,
    ctx: Arc<RunContext>,
    token: CancellationToken,
    job_tokens: HashMap<String, CancellationToken>,
    job_indices: HashMap<String, Vec<usize>>,
    reports: Vec<InstanceReport>,
    running_since: Vec<Option<Instant>>,
    /// Needs and env resolved when an instance became Ready.
    prepared: HashMap<usize, (IndexMap<String, Upstream>, IndexMap<String, String>)>,
    queue: QueueManager,
    slots: Arc<Semaphore>,
    /// Permit acquired while waiting, used by the next dispatch.
    spare: Option<OwnedSemaphorePermit>,
}

impl RunState {
    fn new(
        run_id: RunId,
        plan: Arc<RunPlan>,
        ctx: Arc<RunContext>,
        token: CancellationToken,
        max_workers: usize,
        slots: Arc<Semaphore>,
    ) -> Self {
        let mut queue = QueueManager::new(max_workers);
        let mut job_tokens = HashMap::new();
        let mut job_indices = HashMap::new();
        for (id, job) in &plan.definition().jobs {
            if let Some(limit) = job.matrix.as_ref().and_then(|m| m.max_parallel) {
                queue.set_job_limit(id.clone(), limit);
            }
            job_tokens.insert(id.clone(), token.child_token());
            job_indices.insert(id.clone(), plan.indices_of(id));
        }

        let reports = plan
            .instances()
            .iter()
            .map(|key| InstanceReport::new(key.clone(), JobStatus::Pending))
            .collect();

        Self {
            run_id,
            running_since: vec![None; plan.len()],
            plan,
            ctx,
            token,
            job_tokens,
            job_indices,
            reports,
            prepared: HashMap::new(),
            queue,
            slots,
            spare: None,
        }
    }

    fn is_workflow(&self, entry: &QueuedInstance) -> bool {
        self.plan.nested(&entry.job).is_some()
    }

    /// Whether an instance that executes steps could start if a permit were free.
    fn awaits_slot(&self) -> bool {
        self.queue.has_startable(|entry| !self.is_workflow(entry))
    }

    /// Aggregated upstream view of `needs`, or `None` while any instance of a
    /// dependency is still non-terminal.
    fn upstreams(&self, needs: &[String]) -> Option<IndexMap<String, Upstream>> {
        let mut upstreams = IndexMap::new();
        for dep in needs {
            let indices = self.job_indices.get(dep).map(Vec::as_slice).unwrap_or_default();
            let reports: Vec<&InstanceReport> = indices.iter().map(|&i| &self.reports[i]).collect();
            if reports.iter().any(|r| !r.status.is_terminal()) {
                return None;
            }

            let mut outputs = IndexMap::new();
            for report in reports.iter().filter(|r| r.status == JobStatus::Succeeded) {
                outputs.extend(report.outputs.clone());
            }
            upstreams.insert(
                dep.clone(),
                Upstream {
                    result: JobResult::aggregate(reports.iter().map(|r| r.status)),
                    outputs,
                },
            );
        }
        Some(upstreams)
    }

    fn run_status(&self) -> RunStatus {
        if self.token.is_cancelled() {
            return RunStatus::Cancelled;
        }
        let failed = self.reports.iter().any(|report| {
            report.status == JobStatus::Failed
                && !self
                    .plan
                    .job(report.key.job.as_str())
                    .is_some_and(|job| job.continue_on_error)
        });
        if failed {
            RunStatus::Failed
        } else {
            RunStatus::Succeeded
        }
    }
}

/// Definition env overlaid with job env, interpolated for one instance.
fn instance_env(
    definition: &RunDefinition,
    job: &JobSpec,
    ctx: &RunContext,
    matrix: &MatrixAssignment,
    needs: &IndexMap<String, Upstream>,
) -> IndexMap<String, String> {
    let scope = EvalScope::new(ctx).with_matrix(matrix).with_needs(needs);
    let mut env = IndexMap::new();
    for (key, value) in definition.env.iter().chain(job.env.iter()) {
        let rendered = interpolate(value, &scope).unwrap_or_else(|e| {
            warn!(job = %job.id, key = %key, error = %e, "Env value left uninterpolated");
            value.clone()
        });
        env.insert(key.clone(), rendered);
    }
    env
}

/// Schedules run plans onto a step executor.
#[derive(Clone)]
pub struct Scheduler {
    executor: Arc<dyn StepExecutor>,
    store: Arc<ArtifactStore>,
    events: Option<Arc<dyn EventSink>>,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        executor: Arc<dyn StepExecutor>,
        store: Arc<ArtifactStore>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            executor,
            store,
            events: None,
            config,
        }
    }

    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = Some(sink);
        self
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<ArtifactStore> {
        &self.store
    }

    /// Validate and expand a definition.
    pub fn load(&self, definition: &RunDefinition) -> std::result::Result<RunPlan, ConfigurationError> {
        RunPlan::build(definition)
    }

    /// Execute a plan to completion.
    pub async fn run(&self, plan: RunPlan, ctx: RunContext) -> RunResult {
        self.run_with_token(Arc::new(plan), Arc::new(ctx), CancellationToken::new())
            .await
    }

    /// Execute a plan until it completes or `token` is cancelled.
    pub async fn run_with_token(
        &self,
        plan: Arc<RunPlan>,
        ctx: Arc<RunContext>,
        token: CancellationToken,
    ) -> RunResult {
        self.coordinate(plan, ctx, token, None).await
    }

    /// Execute a plan on a background task.
    pub fn spawn(&self, plan: RunPlan, ctx: RunContext) -> RunHandle {
        let token = CancellationToken::new();
        let scheduler = self.clone();
        let run_token = token.clone();
        let join = tokio::spawn(async move {
            scheduler
                .run_with_token(Arc::new(plan), Arc::new(ctx), run_token)
                .await
        });
        RunHandle { token, join }
    }

    fn runner(&self) -> InstanceRunner {
        InstanceRunner::new(
            self.executor.clone(),
            self.store.clone(),
            self.config.workspace.clone(),
        )
        .with_events(self.events.clone())
    }

    /// Drive one run. `slots` is the semaphore of the enclosing run for nested
    /// runs, and `None` for a top-level run, which sizes its own.
    async fn coordinate(
        &self,
        plan: Arc<RunPlan>,
        ctx: Arc<RunContext>,
        token: CancellationToken,
        slots: Option<Arc<Semaphore>>,
    ) -> RunResult {
        let nested = slots.is_some();
        let run_id = RunId::new();
        let span = run_span(
            &RunAttributes::new()
                .run(run_id.to_string())
                .name(plan.name())
                .nested(nested),
        );
        self.drive(run_id, plan, ctx, token, slots)
            .instrument(span)
            .await
    }

    async fn drive(
        &self,
        run_id: RunId,
        plan: Arc<RunPlan>,
        ctx: Arc<RunContext>,
        token: CancellationToken,
        slots: Option<Arc<Semaphore>>,
    ) -> RunResult {
        let started_at = Utc::now();
        let clock = Instant::now();
        let nested = slots.is_some();
        let max_workers = plan
            .definition()
            .max_workers
            .unwrap_or(self.config.max_workers)
            .max(1);
        let slots = slots.unwrap_or_else(|| Arc::new(Semaphore::new(max_workers)));
        let mut state = RunState::new(run_id, plan.clone(), ctx, token.clone(), max_workers, slots);

        info!(
            run_id = %run_id,
            name = %plan.name(),
            instances = plan.len(),
            max_workers,
            "Run started"
        );
        publish(
            &self.events,
            RunEvent::RunStarted(RunStartedPayload {
                run_id,
                name: plan.name().to_string(),
                instances: plan.len(),
                started_at,
            }),
        )
        .await;

        let mut tasks: JoinSet<InstanceOutcome> = JoinSet::new();
        let mut task_index: HashMap<tokio::task::Id, usize> = HashMap::new();
        let mut cancel_applied = false;

        loop {
            if token.is_cancelled() && !cancel_applied {
                cancel_applied = true;
                self.cancel_waiting(&mut state).await;
            }

            self.resolve_pending(&mut state).await;
            loop {
                let permit = state
                    .spare
                    .take()
                    .or_else(|| state.slots.clone().try_acquire_owned().ok());
                let has_permit = permit.is_some();
                let Some(entry) = state
                    .queue
                    .dequeue_if(|entry| has_permit || plan.nested(&entry.job).is_some())
                else {
                    break;
                };
                let permit = if state.is_workflow(&entry) {
                    state.spare = permit;
                    None
                } else {
                    permit
                };
                self.dispatch(&mut state, entry, permit, &mut tasks, &mut task_index)
                    .await;
            }
            state.spare = None;

            let awaits_slot = state.awaits_slot();
            if tasks.is_empty() && !awaits_slot {
                break;
            }

            tokio::select! {
                permit = state.slots.clone().acquire_owned(), if awaits_slot => {
                    state.spare = permit.ok();
                }
                joined = tasks.join_next_with_id(), if !tasks.is_empty() => match joined {
                    Some(Ok((id, outcome))) => {
                        if let Some(index) = task_index.remove(&id) {
                            self.complete(&mut state, index, outcome).await;
                        }
                    }
                    Some(Err(e)) => match task_index.remove(&e.id()) {
                        Some(index) => {
                            error!(instance = %state.reports[index].key, error = %e, "Instance task failed");
                            let outcome = InstanceOutcome::new(JobStatus::Failed).with_failure(
                                FailureDetail::new(
                                    None,
                                    FailureKind::Executor,
                                    format!("Instance task failed: {}", e),
                                ),
                            );
                            self.complete(&mut state, index, outcome).await;
                        }
                        None => error!(error = %e, "Unknown task failed"),
                    },
                    None => {}
                },
                _ = token.cancelled(), if !cancel_applied => {}
            }
        }

        // Every dependency of a Pending instance is terminal once nothing runs,
        // so anything left over here is a scheduling defect.
        for index in 0..state.reports.len() {
            if !state.reports[index].status.is_terminal() {
                error!(instance = %state.reports[index].key, status = %state.reports[index].status, "Instance never settled");
                state.reports[index].failure = Some(FailureDetail::new(
                    None,
                    FailureKind::Cancelled,
                    "Instance could not be scheduled",
                ));
                self.transition(&mut state, index, JobStatus::Cancelled).await;
            }
        }

        let status = state.run_status();

        if !nested {
            let evicted = self.store.expire(Utc::now()).await;
            if !evicted.is_empty() {
                info!(run_id = %run_id, evicted = ?evicted, "Evicted expired artifacts");
            }
        }

        let finished_at = Utc::now();
        let duration_ms = clock.elapsed().as_millis() as u64;
        publish(
            &self.events,
            RunEvent::RunCompleted(RunCompletedPayload {
                run_id,
                status,
                duration_ms,
                completed_at: finished_at,
            }),
        )
        .await;
        info!(
            run_id = %run_id,
            status = %status,
            duration_ms,
            succeeded = state.reports.iter().filter(|r| r.status == JobStatus::Succeeded).count(),
            failed = state.reports.iter().filter(|r| r.status == JobStatus::Failed).count(),
            skipped = state.reports.iter().filter(|r| r.status == JobStatus::Skipped).count(),
            "Run finished"
        );

        RunResult {
            run_id,
            name: plan.name().to_string(),
            status,
            instances: state.reports,
            started_at,
            finished_at,
            duration_ms,
        }
    }

    /// Move Pending instances whose dependencies are all terminal to Ready or
    /// Skipped. Instances are in dependency order, so one pass settles every
    /// instance that can be settled now.
    async fn resolve_pending(&self, state: &mut RunState) {
        let plan = state.plan.clone();
        let ctx = state.ctx.clone();

        for (index, key) in plan.instances().iter().enumerate() {
            if state.reports[index].status != JobStatus::Pending {
                continue;
            }
            let Some(job) = plan.job(key.job.as_str()) else {
                continue;
            };
            let Some(needs) = state.upstreams(&job.needs) else {
                continue;
            };

            let env = instance_env(plan.definition(), job, &ctx, &key.matrix, &needs);
            let eligible = {
                let scope = EvalScope::new(&ctx)
                    .with_matrix(&key.matrix)
                    .with_env(&env)
                    .with_needs(&needs)
                    .with_run_cancelled(state.token.is_cancelled());
                plan.condition(key.job.as_str())
                    .is_some_and(|condition| condition.evaluate_condition(&scope))
            };

            if eligible {
                state.prepared.insert(index, (needs, env));
                state.queue.enqueue(QueuedInstance::new(index, key.job.as_str()));
                self.transition(state, index, JobStatus::Ready).await;
            } else {
                debug!(
                    instance = %key,
                    needs = ?needs.iter().map(|(job, up)| (job.as_str(), up.result.as_str())).collect::<Vec<_>>(),
                    "Condition not met, skipping"
                );
                self.transition(state, index, JobStatus::Skipped).await;
            }
        }
    }

    async fn dispatch(
        &self,
        state: &mut RunState,
        entry: QueuedInstance,
        permit: Option<OwnedSemaphorePermit>,
        tasks: &mut JoinSet<InstanceOutcome>,
        task_index: &mut HashMap<tokio::task::Id, usize>,
    ) {
        let plan = state.plan.clone();
        let index = entry.index;
        let key = plan.instances()[index].clone();
        let Some(job) = plan.job(key.job.as_str()) else {
            state.queue.complete(&entry.job);
            return;
        };

        let (needs, env) = state.prepared.remove(&index).unwrap_or_default();
        let cancel = state
            .job_tokens
            .get(key.job.as_str())
            .unwrap_or(&state.token)
            .child_token();
        let instance = InstanceContext {
            run_id: state.run_id,
            key: key.clone(),
            job: job.clone(),
            ctx: state.ctx.clone(),
            needs,
            env,
            deadline: Instant::now() + Duration::from_secs(job.timeout_seconds),
            cancel,
        };

        self.transition(state, index, JobStatus::Running).await;
        debug!(
            instance = %key,
            waited_ms = (Utc::now() - entry.queued_at).num_milliseconds(),
            running = state.queue.running(),
            "Instance dispatched"
        );

        let span = instance_span(
            &RunAttributes::new()
                .run(state.run_id.to_string())
                .instance(key.to_string()),
        );
        let handle = match plan.nested(key.job.as_str()) {
            Some(nested) => tasks.spawn(
                self.clone()
                    .run_nested(nested.clone(), instance, state.slots.clone())
                    .instrument(span),
            ),
            None => {
                let runner = self.runner();
                tasks.spawn(
                    async move {
                        let _permit = permit;
                        runner.run(instance).await
                    }
                    .instrument(span),
                )
            }
        };
        task_index.insert(handle.id(), index);
    }

    /// Run an embedded definition as a single instance. Returns a boxed future
    /// because the nested run goes back through the coordinator.
    fn run_nested(
        self,
        plan: Arc<RunPlan>,
        instance: InstanceContext,
        slots: Arc<Semaphore>,
    ) -> BoxFuture<'static, InstanceOutcome> {
        Box::pin(async move {
            let nested_jobs: Vec<String> = plan.definition().jobs.keys().cloned().collect();
            let run = self.coordinate(
                plan,
                instance.ctx.clone(),
                instance.cancel.clone(),
                Some(slots),
            );
            let result = match tokio::time::timeout_at(instance.deadline, run).await {
                Ok(result) => result,
                Err(_) => {
                    return InstanceOutcome::new(JobStatus::Cancelled).with_failure(
                        FailureDetail::new(
                            None,
                            FailureKind::Timeout,
                            Error::Timeout {
                                seconds: instance.job.timeout_seconds,
                            }
                            .to_string(),
                        ),
                    );
                }
            };

            let mut outcome = match result.status {
                RunStatus::Succeeded => {
                    let mut outcome = InstanceOutcome::new(JobStatus::Succeeded);
                    outcome.outputs = nested_outputs(&instance, &nested_jobs, &result);
                    outcome
                }
                RunStatus::Failed => InstanceOutcome::new(JobStatus::Failed).with_failure(
                    FailureDetail::new(
                        None,
                        FailureKind::StepExecution,
                        format!("Nested run '{}' failed", result.name),
                    ),
                ),
                RunStatus::Cancelled => InstanceOutcome::new(JobStatus::Cancelled).with_failure(
                    FailureDetail::new(
                        None,
                        FailureKind::Cancelled,
                        format!("Nested run '{}' was cancelled", result.name),
                    ),
                ),
            };
            outcome.nested = Some(Box::new(result));
            outcome
        })
    }

    async fn complete(&self, state: &mut RunState, index: usize, outcome: InstanceOutcome) {
        let job = state.reports[index].key.job.to_string();
        state.queue.complete(&job);

        let status = outcome.status;
        {
            let report = &mut state.reports[index];
            report.steps = outcome.steps;
            report.artifacts = outcome.artifacts;
            report.failure = outcome.failure;
            report.nested = outcome.nested;
            if status == JobStatus::Succeeded {
                report.outputs = outcome.outputs;
            }
        }
        self.transition(state, index, status).await;

        let fail_fast = state
            .plan
            .job(&job)
            .and_then(|spec| spec.matrix.as_ref())
            .is_some_and(|matrix| matrix.fail_fast);
        if status == JobStatus::Failed && fail_fast {
            self.fail_fast(state, &job).await;
        }
    }

    /// Cancel every non-terminal sibling of a failed matrix instance.
    async fn fail_fast(&self, state: &mut RunState, job: &str) {
        if let Some(token) = state.job_tokens.get(job) {
            token.cancel();
        }
        state.queue.remove_where(|entry| entry.job == job);

        let indices = state.job_indices.get(job).cloned().unwrap_or_default();
        let mut cancelled = 0;
        for index in indices {
            if matches!(
                state.reports[index].status,
                JobStatus::Pending | JobStatus::Ready
            ) {
                state.prepared.remove(&index);
                state.reports[index].failure = Some(FailureDetail::new(
                    None,
                    FailureKind::Cancelled,
                    "Cancelled after a sibling instance failed",
                ));
                self.transition(state, index, JobStatus::Cancelled).await;
                cancelled += 1;
            }
        }
        info!(job = %job, cancelled, "Fail-fast triggered");
    }

    /// Cancel every instance still waiting for dependencies or a slot.
    async fn cancel_waiting(&self, state: &mut RunState) {
        state.queue.remove_where(|_| true);
        for index in 0..state.reports.len() {
            if matches!(
                state.reports[index].status,
                JobStatus::Pending | JobStatus::Ready
            ) {
                state.prepared.remove(&index);
                state.reports[index].failure = Some(FailureDetail::new(
                    None,
                    FailureKind::Cancelled,
                    Error::Cancelled.to_string(),
                ));
                self.transition(state, index, JobStatus::Cancelled).await;
            }
        }
        info!(run_id = %state.run_id, "Run cancellation requested");
    }

    /// Apply a state change, rejecting transitions the state machine forbids.
    async fn transition(&self, state: &mut RunState, index: usize, next: JobStatus) -> bool {
        let now = Utc::now();
        let report = &mut state.reports[index];
        if !report.status.can_transition_to(next) {
            warn!(
                instance = %report.key,
                from = %report.status,
                to = %next,
                "Rejected state transition"
            );
            return false;
        }

        report.status = next;
        if next == JobStatus::Running {
            report.started_at = Some(now);
            state.running_since[index] = Some(Instant::now());
        } else if next.is_terminal() {
            report.finished_at = Some(now);
            report.duration_ms = state.running_since[index]
                .map(|since| since.elapsed().as_millis() as u64);
        }
        debug!(instance = %report.key, status = %next, "Instance state changed");

        let instance = report.key.clone();
        publish(
            &self.events,
            RunEvent::InstanceStateChanged(InstanceStateChangedPayload {
                run_id: state.run_id,
                instance,
                status: next,
                at: now,
            }),
        )
        .await;
        true
    }
}

/// Outputs of a `workflow:` job, with `needs.<job>` resolved against the nested run.
fn nested_outputs(
    instance: &InstanceContext,
    nested_jobs: &[String],
    result: &RunResult,
) -> IndexMap<String, String> {
    let upstreams: IndexMap<String, Upstream> = nested_jobs
        .iter()
        .filter_map(|job| {
            result.job_result(job).map(|outcome| {
                (
                    job.clone(),
                    Upstream {
                        result: outcome,
                        outputs: result.outputs_of(job),
                    },
                )
            })
        })
        .collect();
    let scope = EvalScope::new(&instance.ctx)
        .with_matrix(&instance.key.matrix)
        .with_env(&instance.env)
        .with_needs(&upstreams);

    let mut outputs = IndexMap::new();
    for (name, template) in &instance.job.outputs {
        match interpolate(template, &scope) {
            Ok(value) => {
                outputs.insert(name.clone(), value);
            }
            Err(e) => warn!(instance = %instance.key, output = %name, error = %e, "Output not captured"),
        }
    }
    outputs
}
