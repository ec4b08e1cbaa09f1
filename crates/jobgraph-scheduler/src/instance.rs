//! Execution of a single job instance.
//!
//! Steps run strictly in order. Every step, and every retry delay between
//! attempts, races the instance deadline and the instance's cancellation
//! token; losing that race drops the step future, which stops the step.

use indexmap::IndexMap;
use jobgraph_artifacts::ArtifactStore;
use jobgraph_core::artifact::ArtifactRef;
use jobgraph_core::context::RunContext;
use jobgraph_core::events::{RunEvent, StepCompletedPayload};
use jobgraph_core::expression::{EvalScope, Expression};
use jobgraph_core::interpolation::interpolate;
use jobgraph_core::pipeline::{
    ArtifactDownload, ArtifactUpload, JobSpec, RetryPolicy, StepAction, StepSpec,
};
use jobgraph_core::ports::{EventSink, StepExecutor, StepRequest};
use jobgraph_core::run::{
    FailureDetail, FailureKind, InstanceKey, JobStatus, RunResult, StepConclusion, StepReport,
    StepState, Upstream,
};
use jobgraph_core::{Error, RunId};
use jobgraph_trace::{RunAttributes, artifact_span, step_span};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, warn};

/// Everything the coordinator decides for an instance before it starts.
pub struct InstanceContext {
    pub run_id: RunId,
    pub key: InstanceKey,
    pub job: JobSpec,
    pub ctx: Arc<RunContext>,
    /// Aggregated results and outputs of the jobs this one needs.
    pub needs: IndexMap<String, Upstream>,
    /// Definition and job environment, already interpolated.
    pub env: IndexMap<String, String>,
    pub deadline: Instant,
    pub cancel: CancellationToken,
}

/// What a finished instance reports back to the coordinator.
#[derive(Debug, Clone)]
pub struct InstanceOutcome {
    pub status: JobStatus,
    pub steps: Vec<StepReport>,
    pub outputs: IndexMap<String, String>,
    pub artifacts: Vec<ArtifactRef>,
    pub failure: Option<FailureDetail>,
    pub nested: Option<Box<RunResult>>,
}

impl InstanceOutcome {
    pub(crate) fn new(status: JobStatus) -> Self {
        Self {
            status,
            steps: vec![],
            outputs: IndexMap::new(),
            artifacts: vec![],
            failure: None,
            nested: None,
        }
    }

    pub(crate) fn with_failure(mut self, failure: FailureDetail) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// Why a step stopped before it could finish.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interrupt {
    Cancelled,
    DeadlineElapsed,
}

#[derive(Debug, Default)]
struct StepDone {
    exit_code: Option<i32>,
    stdout: String,
    outputs: IndexMap<String, String>,
    artifact: Option<ArtifactRef>,
}

#[derive(Debug)]
struct StepFailure {
    kind: FailureKind,
    message: String,
    exit_code: Option<i32>,
}

impl StepFailure {
    fn executor(message: impl Into<String>) -> Self {
        Self {
            kind: FailureKind::Executor,
            message: message.into(),
            exit_code: None,
        }
    }
}

enum StepRun {
    Skipped,
    Succeeded { done: StepDone, attempts: u32 },
    Failed { failure: StepFailure, attempts: u32 },
    Interrupted { interrupt: Interrupt, attempts: u32 },
}

/// Race `future` against the instance deadline and cancellation.
async fn interruptible<F: Future>(
    cancel: &CancellationToken,
    deadline: Instant,
    future: F,
) -> Result<F::Output, Interrupt> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Interrupt::Cancelled),
        result = tokio::time::timeout_at(deadline, future) => {
            result.map_err(|_| Interrupt::DeadlineElapsed)
        }
    }
}

/// Delay before retry number `attempt` (1-based count of failed attempts).
fn retry_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let seconds = if policy.exponential_backoff {
        let factor = 2u64.saturating_pow(attempt.saturating_sub(1));
        policy.delay_seconds.saturating_mul(factor)
    } else {
        policy.delay_seconds
    };
    Duration::from_secs(seconds)
}

pub(crate) async fn publish(events: &Option<Arc<dyn EventSink>>, event: RunEvent) {
    if let Some(sink) = events
        && let Err(e) = sink.publish(event).await
    {
        warn!(error = %e, "Failed to publish run event");
    }
}

/// Runs the steps of one instance against the executor and artifact store.
#[derive(Clone)]
pub struct InstanceRunner {
    executor: Arc<dyn StepExecutor>,
    store: Arc<ArtifactStore>,
    events: Option<Arc<dyn EventSink>>,
    workspace: PathBuf,
}

impl InstanceRunner {
    pub fn new(
        executor: Arc<dyn StepExecutor>,
        store: Arc<ArtifactStore>,
        workspace: impl Into<PathBuf>,
    ) -> Self {
        Self {
            executor,
            store,
            events: None,
            workspace: workspace.into(),
        }
    }

    pub fn with_events(mut self, events: Option<Arc<dyn EventSink>>) -> Self {
        self.events = events;
        self
    }

    pub async fn run(&self, instance: InstanceContext) -> InstanceOutcome {
        let mut states: IndexMap<String, StepState> = IndexMap::new();
        let mut outcome = InstanceOutcome::new(JobStatus::Succeeded);

        for step in &instance.job.steps {
            if outcome.status == JobStatus::Cancelled {
                outcome.steps.push(StepReport {
                    name: step.name.clone(),
                    conclusion: StepConclusion::Skipped,
                    exit_code: None,
                    attempts: 0,
                    duration_ms: 0,
                });
                continue;
            }

            let span = step_span(
                &RunAttributes::new()
                    .run(instance.run_id.to_string())
                    .instance(instance.key.to_string())
                    .step(&step.name),
            );
            let started = Instant::now();
            let failed = outcome.status == JobStatus::Failed;
            let run = self
                .execute_step(&instance, step, &states, failed)
                .instrument(span)
                .await;
            let duration_ms = started.elapsed().as_millis() as u64;

            let (conclusion, exit_code, attempts) = match run {
                StepRun::Skipped => {
                    debug!(instance = %instance.key, step = %step.name, "Step condition not met");
                    states.insert(step.name.clone(), step_state(StepConclusion::Skipped));
                    (StepConclusion::Skipped, None, 0)
                }
                StepRun::Succeeded { done, attempts } => {
                    outcome.artifacts.extend(done.artifact);
                    states.insert(
                        step.name.clone(),
                        StepState {
                            outcome: StepConclusion::Success,
                            stdout: done.stdout,
                            outputs: done.outputs,
                        },
                    );
                    (StepConclusion::Success, done.exit_code, attempts)
                }
                StepRun::Failed { failure, attempts } => {
                    states.insert(step.name.clone(), step_state(StepConclusion::Failure));
                    if step.continue_on_error {
                        warn!(
                            instance = %instance.key,
                            step = %step.name,
                            error = %failure.message,
                            "Step failed, continuing"
                        );
                    } else if outcome.status == JobStatus::Succeeded {
                        outcome.status = JobStatus::Failed;
                        outcome.failure = Some(FailureDetail::new(
                            Some(step.name.clone()),
                            failure.kind,
                            failure.message,
                        ));
                    }
                    (StepConclusion::Failure, failure.exit_code, attempts)
                }
                StepRun::Interrupted { interrupt, attempts } => {
                    let (kind, message) = match interrupt {
                        Interrupt::Cancelled => {
                            (FailureKind::Cancelled, Error::Cancelled.to_string())
                        }
                        Interrupt::DeadlineElapsed => (
                            FailureKind::Timeout,
                            Error::Timeout {
                                seconds: instance.job.timeout_seconds,
                            }
                            .to_string(),
                        ),
                    };
                    // A cleanup step interrupted after a failure leaves the instance Failed.
                    if outcome.status == JobStatus::Succeeded {
                        outcome.status = JobStatus::Cancelled;
                        outcome.failure =
                            Some(FailureDetail::new(Some(step.name.clone()), kind, message));
                    }
                    (StepConclusion::Cancelled, None, attempts)
                }
            };

            let report = StepReport {
                name: step.name.clone(),
                conclusion,
                exit_code,
                attempts,
                duration_ms,
            };
            publish(
                &self.events,
                RunEvent::StepCompleted(StepCompletedPayload {
                    run_id: instance.run_id,
                    instance: instance.key.clone(),
                    step: report.name.clone(),
                    conclusion: report.conclusion,
                    exit_code: report.exit_code,
                    duration_ms: report.duration_ms,
                }),
            )
            .await;
            outcome.steps.push(report);
        }

        if outcome.status == JobStatus::Succeeded {
            outcome.outputs = job_outputs(&instance, &states);
        }

        info!(
            instance = %instance.key,
            status = %outcome.status,
            steps = outcome.steps.len(),
            "Instance finished"
        );
        outcome
    }

    fn scope<'a>(
        &self,
        instance: &'a InstanceContext,
        states: &'a IndexMap<String, StepState>,
        step_failed: bool,
    ) -> EvalScope<'a> {
        EvalScope::new(&instance.ctx)
            .with_matrix(&instance.key.matrix)
            .with_env(&instance.env)
            .with_needs(&instance.needs)
            .with_steps(states)
            .with_run_cancelled(instance.cancel.is_cancelled())
            .with_step_failed(step_failed)
            .for_steps()
    }

    /// Run one step. Once an earlier step has failed, only steps whose
    /// condition calls a status function and holds still run.
    async fn execute_step(
        &self,
        instance: &InstanceContext,
        step: &StepSpec,
        states: &IndexMap<String, StepState>,
        step_failed: bool,
    ) -> StepRun {
        let failed = |failure: StepFailure| StepRun::Failed {
            failure,
            attempts: 1,
        };

        match &step.condition {
            Some(condition) => match Expression::parse(condition) {
                Ok(expression) => {
                    let scope = self.scope(instance, states, step_failed);
                    if !expression.evaluate_condition(&scope) {
                        return StepRun::Skipped;
                    }
                }
                Err(e) => return failed(StepFailure::executor(e.to_string())),
            },
            None if step_failed => return StepRun::Skipped,
            None => {}
        }

        let action = match step.action(instance.key.job.as_str()) {
            Ok(action) => action,
            Err(e) => return failed(StepFailure::executor(e.to_string())),
        };

        let policy = step
            .retry
            .clone()
            .unwrap_or_else(|| RetryPolicy::attempts(1));
        let max_attempts = policy.max_attempts.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let result = interruptible(
                &instance.cancel,
                instance.deadline,
                self.attempt(instance, step, action, states, step_failed),
            )
            .await;

            match result {
                Err(interrupt) => {
                    return StepRun::Interrupted {
                        interrupt,
                        attempts: attempt,
                    };
                }
                Ok(Ok(done)) => {
                    return StepRun::Succeeded {
                        done,
                        attempts: attempt,
                    };
                }
                Ok(Err(failure)) if attempt < max_attempts => {
                    let delay = retry_delay(&policy, attempt);
                    warn!(
                        step = %step.name,
                        attempt,
                        max_attempts,
                        delay_secs = delay.as_secs(),
                        error = %failure.message,
                        "Step failed, retrying"
                    );
                    let sleep = tokio::time::sleep(delay);
                    if let Err(interrupt) =
                        interruptible(&instance.cancel, instance.deadline, sleep).await
                    {
                        return StepRun::Interrupted {
                            interrupt,
                            attempts: attempt,
                        };
                    }
                }
                Ok(Err(failure)) => {
                    return StepRun::Failed {
                        failure,
                        attempts: attempt,
                    };
                }
            }
        }
    }

    async fn attempt(
        &self,
        instance: &InstanceContext,
        step: &StepSpec,
        action: StepAction<'_>,
        states: &IndexMap<String, StepState>,
        step_failed: bool,
    ) -> Result<StepDone, StepFailure> {
        let scope = self.scope(instance, states, step_failed);
        match action {
            StepAction::Run { command, shell } => {
                self.run_command(instance, step, command, shell, &scope)
                    .await
            }
            StepAction::Upload(upload) => self.upload(instance, upload, &scope).await,
            StepAction::Download(download) => self.download(download, &scope).await,
        }
    }

    async fn run_command(
        &self,
        instance: &InstanceContext,
        step: &StepSpec,
        command: &str,
        shell: &str,
        scope: &EvalScope<'_>,
    ) -> Result<StepDone, StepFailure> {
        let command = render(command, scope)?;

        let mut env = instance.env.clone();
        for (key, value) in &step.env {
            env.insert(key.clone(), render(value, scope)?);
        }
        env.insert("JOBGRAPH_RUN_ID".to_string(), instance.run_id.to_string());
        env.insert("JOBGRAPH_JOB".to_string(), instance.key.job.to_string());
        env.insert("JOBGRAPH_STEP".to_string(), step.name.clone());

        let remaining = instance.deadline.saturating_duration_since(Instant::now());
        let step_limit = step.timeout_seconds.map(Duration::from_secs);
        let request = StepRequest {
            run_id: instance.run_id,
            instance: instance.key.clone(),
            step: step.name.clone(),
            command,
            shell: shell.to_string(),
            env,
            workspace: self.workspace.clone(),
            timeout: step_limit.map_or(remaining, |limit| limit.min(remaining)),
        };

        let execution = self.executor.execute(&request);
        let result = match step.timeout_seconds {
            Some(seconds) => {
                match tokio::time::timeout(Duration::from_secs(seconds), execution).await {
                    Ok(result) => result,
                    Err(_) => {
                        return Err(StepFailure {
                            kind: FailureKind::Timeout,
                            message: Error::Timeout { seconds }.to_string(),
                            exit_code: None,
                        });
                    }
                }
            }
            None => execution.await,
        };

        match result {
            Ok(outcome) if outcome.succeeded() => Ok(StepDone {
                exit_code: Some(outcome.exit_code),
                stdout: outcome.stdout,
                outputs: outcome.outputs,
                artifact: None,
            }),
            Ok(outcome) => Err(StepFailure {
                kind: FailureKind::StepExecution,
                message: Error::StepExecution {
                    step: step.name.clone(),
                    exit_code: outcome.exit_code,
                }
                .to_string(),
                exit_code: Some(outcome.exit_code),
            }),
            Err(e) => Err(StepFailure::executor(e.to_string())),
        }
    }

    async fn upload(
        &self,
        instance: &InstanceContext,
        upload: &ArtifactUpload,
        scope: &EvalScope<'_>,
    ) -> Result<StepDone, StepFailure> {
        let name = render(&upload.name, scope)?;
        let data = match (&upload.content, &upload.path) {
            (Some(content), _) => render(content, scope)?.into_bytes(),
            (None, Some(path)) => {
                let source = self.workspace.join(render(path, scope)?);
                tokio::fs::read(&source).await.map_err(|e| {
                    StepFailure::executor(format!(
                        "Failed to read upload source {}: {}",
                        source.display(),
                        e
                    ))
                })?
            }
            (None, None) => return Err(StepFailure::executor("Upload has no source")),
        };

        let retention = upload
            .retention_days
            .map(|days| chrono::Duration::days(i64::from(days)));
        let reference = self
            .store
            .put(&name, &instance.key, &data, retention)
            .instrument(artifact_span("put", &name))
            .await
            .map_err(|e| StepFailure::executor(e.to_string()))?;

        let mut outputs = IndexMap::new();
        outputs.insert("name".to_string(), name);
        outputs.insert("id".to_string(), reference.id.to_string());
        outputs.insert("size".to_string(), data.len().to_string());
        Ok(StepDone {
            exit_code: None,
            stdout: String::new(),
            outputs,
            artifact: Some(reference),
        })
    }

    async fn download(
        &self,
        download: &ArtifactDownload,
        scope: &EvalScope<'_>,
    ) -> Result<StepDone, StepFailure> {
        let name = render(&download.name, scope)?;
        let bytes = match self
            .store
            .get(&name)
            .instrument(artifact_span("get", &name))
            .await
        {
            Ok(bytes) => bytes,
            Err(Error::ArtifactNotFound(_)) if download.optional => {
                debug!(artifact = %name, "Optional artifact missing");
                return Ok(StepDone::default());
            }
            Err(e @ Error::ArtifactNotFound(_)) => {
                return Err(StepFailure {
                    kind: FailureKind::ArtifactNotFound,
                    message: e.to_string(),
                    exit_code: None,
                });
            }
            Err(e) => return Err(StepFailure::executor(e.to_string())),
        };

        if let Some(path) = &download.path {
            let target = self.workspace.join(render(path, scope)?);
            if let Some(parent) = target.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| StepFailure::executor(e.to_string()))?;
            }
            tokio::fs::write(&target, &bytes).await.map_err(|e| {
                StepFailure::executor(format!(
                    "Failed to write artifact to {}: {}",
                    target.display(),
                    e
                ))
            })?;
        }

        Ok(StepDone {
            exit_code: None,
            stdout: String::from_utf8_lossy(&bytes).into_owned(),
            outputs: IndexMap::new(),
            artifact: None,
        })
    }
}

fn render(template: &str, scope: &EvalScope<'_>) -> Result<String, StepFailure> {
    interpolate(template, scope).map_err(|e| StepFailure::executor(e.to_string()))
}

fn step_state(outcome: StepConclusion) -> StepState {
    StepState {
        outcome,
        stdout: String::new(),
        outputs: IndexMap::new(),
    }
}

fn job_outputs(
    instance: &InstanceContext,
    states: &IndexMap<String, StepState>,
) -> IndexMap<String, String> {
    let scope = EvalScope::new(&instance.ctx)
        .with_matrix(&instance.key.matrix)
        .with_env(&instance.env)
        .with_needs(&instance.needs)
        .with_steps(states);

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

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jobgraph_core::ports::StepOutcome;
    use jobgraph_core::run::JobResult;
    use pretty_assertions::assert_eq;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Answers each command through a closure and records what it saw.
    struct FnExecutor<F> {
        respond: F,
        commands: Mutex<Vec<String>>,
        calls: AtomicU32,
    }

    impl<F> FnExecutor<F>
    where
        F: Fn(&StepRequest, u32) -> StepOutcome + Send + Sync,
    {
        fn new(respond: F) -> Arc<Self> {
            Arc::new(Self {
                respond,
                commands: Mutex::new(vec![]),
                calls: AtomicU32::new(0),
            })
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl<F> StepExecutor for FnExecutor<F>
    where
        F: Fn(&StepRequest, u32) -> StepOutcome + Send + Sync,
    {
        async fn execute(&self, request: &StepRequest) -> jobgraph_core::Result<StepOutcome> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            self.commands.lock().unwrap().push(request.command.clone());
            if request.command.starts_with("sleep ") {
                let seconds: u64 = request.command[6..].parse().unwrap();
                tokio::time::sleep(Duration::from_secs(seconds)).await;
            }
            Ok((self.respond)(request, call))
        }
    }

    fn echo(request: &StepRequest, _call: u32) -> StepOutcome {
        match request.command.strip_prefix("fail ") {
            Some(code) => StepOutcome::failure(code.parse().unwrap()),
            None => StepOutcome::success(request.command.clone()).with_output("echoed", "yes"),
        }
    }

    fn runner(executor: Arc<dyn StepExecutor>, store: Arc<ArtifactStore>) -> InstanceRunner {
        InstanceRunner::new(executor, store, std::env::temp_dir())
    }

    fn context(job: JobSpec) -> InstanceContext {
        let key = InstanceKey::unmatrixed(job.id.as_str());
        let deadline = Instant::now() + Duration::from_secs(job.timeout_seconds);
        InstanceContext {
            run_id: RunId::new(),
            key,
            job,
            ctx: Arc::new(RunContext::builder().set("branch", "main").build()),
            needs: IndexMap::new(),
            env: IndexMap::new(),
            deadline,
            cancel: CancellationToken::new(),
        }
    }

    fn conclusions(outcome: &InstanceOutcome) -> Vec<StepConclusion> {
        outcome.steps.iter().map(|s| s.conclusion).collect()
    }

    #[tokio::test]
    async fn test_steps_see_earlier_outputs() {
        let executor = FnExecutor::new(echo);
        let job = JobSpec::new("build")
            .step(StepSpec::run("compile", "make ${{ ctx.branch }}"))
            .step(StepSpec::run(
                "report",
                "echo ${{ steps.compile.stdout }} ${{ steps.compile.outputs.echoed }}",
            ))
            .output("binary", "${{ steps.compile.stdout }}.bin");

        let outcome = runner(executor.clone(), Arc::new(ArtifactStore::in_memory()))
            .run(context(job))
            .await;

        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(
            executor.commands(),
            vec!["make main".to_string(), "echo make main yes".to_string()]
        );
        assert_eq!(outcome.outputs.get("binary").unwrap(), "make main.bin");
    }

    #[tokio::test]
    async fn test_failure_skips_remaining_steps() {
        let executor = FnExecutor::new(echo);
        let job = JobSpec::new("build")
            .step(StepSpec::run("compile", "fail 2"))
            .step(StepSpec::run("package", "tar"))
            .output("never", "x");

        let outcome = runner(executor.clone(), Arc::new(ArtifactStore::in_memory()))
            .run(context(job))
            .await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(
            conclusions(&outcome),
            vec![StepConclusion::Failure, StepConclusion::Skipped]
        );
        assert_eq!(outcome.steps[0].exit_code, Some(2));
        let failure = outcome.failure.unwrap();
        assert_eq!(failure.step.as_deref(), Some("compile"));
        assert_eq!(failure.kind, FailureKind::StepExecution);
        assert!(outcome.outputs.is_empty());
        assert_eq!(executor.commands().len(), 1);
    }

    #[tokio::test]
    async fn test_status_steps_run_after_failure() {
        let executor = FnExecutor::new(echo);
        let job = JobSpec::new("build")
            .step(StepSpec::run("compile", "fail 1"))
            .step(StepSpec::run("package", "tar"))
            .step(StepSpec::run("cleanup", "rm -rf target").when("always()"))
            .step(StepSpec::run("report", "report broken").when("failure() && ctx.branch == 'main'"))
            .step(StepSpec::run("publish", "publish").when("success()"))
            .step(StepSpec::run("notify", "notify").when("ctx.branch == 'main'"));

        let outcome = runner(executor.clone(), Arc::new(ArtifactStore::in_memory()))
            .run(context(job))
            .await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(
            executor.commands(),
            vec!["fail 1", "rm -rf target", "report broken"]
        );
        assert_eq!(
            conclusions(&outcome),
            vec![
                StepConclusion::Failure,
                StepConclusion::Skipped,
                StepConclusion::Success,
                StepConclusion::Success,
                StepConclusion::Skipped,
                StepConclusion::Skipped,
            ]
        );
        assert_eq!(outcome.failure.as_ref().unwrap().step.as_deref(), Some("compile"));
    }

    #[tokio::test]
    async fn test_failed_cleanup_keeps_first_failure() {
        let executor = FnExecutor::new(echo);
        let job = JobSpec::new("build")
            .step(StepSpec::run("compile", "fail 1"))
            .step(StepSpec::run("cleanup", "fail 3").when("always()"));

        let outcome = runner(executor, Arc::new(ArtifactStore::in_memory()))
            .run(context(job))
            .await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.failure.unwrap().step.as_deref(), Some("compile"));
    }

    #[tokio::test]
    async fn test_step_conditions_ignore_failed_upstream() {
        let executor = FnExecutor::new(echo);
        let job = JobSpec::new("notify")
            .needs(&["build"])
            .when("always()")
            .step(StepSpec::run("post", "post ${{ needs.build.result }}").when("ctx.branch == 'main'"))
            .step(StepSpec::run("escalate", "page").when("failure()"));
        let mut instance = context(job);
        instance.needs.insert(
            "build".to_string(),
            Upstream {
                result: JobResult::Failure,
                outputs: IndexMap::new(),
            },
        );

        let outcome = runner(executor.clone(), Arc::new(ArtifactStore::in_memory()))
            .run(instance)
            .await;

        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(executor.commands(), vec!["post failure"]);
    }

    #[tokio::test]
    async fn test_continue_on_error_step() {
        let executor = FnExecutor::new(echo);
        let job = JobSpec::new("lint")
            .step(StepSpec::run("clippy", "fail 1").continue_on_error(true))
            .step(StepSpec::run("note", "warned").when("steps.clippy.outcome == 'failure'"))
            .step(StepSpec::run("skipped", "never").when("steps.clippy.outcome == 'success'"));

        let outcome = runner(executor.clone(), Arc::new(ArtifactStore::in_memory()))
            .run(context(job))
            .await;

        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(
            conclusions(&outcome),
            vec![
                StepConclusion::Failure,
                StepConclusion::Success,
                StepConclusion::Skipped
            ]
        );
        assert!(outcome.failure.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_until_success() {
        let executor = FnExecutor::new(|request: &StepRequest, call: u32| {
            if call < 3 {
                StepOutcome::failure(1)
            } else {
                StepOutcome::success(request.command.clone())
            }
        });
        let policy = RetryPolicy {
            max_attempts: 3,
            delay_seconds: 5,
            exponential_backoff: true,
        };
        let job = JobSpec::new("flaky").step(StepSpec::run("test", "cargo test").retry(policy));

        let started = Instant::now();
        let outcome = runner(executor.clone(), Arc::new(ArtifactStore::in_memory()))
            .run(context(job))
            .await;

        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(outcome.steps[0].attempts, 3);
        // 5s after the first failure, 10s after the second.
        assert!(started.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_retry_is_bounded() {
        let executor = FnExecutor::new(echo);
        let job = JobSpec::new("flaky")
            .step(StepSpec::run("test", "fail 1").retry(RetryPolicy::attempts(2)));

        let outcome = runner(executor.clone(), Arc::new(ArtifactStore::in_memory()))
            .run(context(job))
            .await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.steps[0].attempts, 2);
        assert_eq!(executor.commands().len(), 2);
    }

    #[test]
    fn test_retry_delay() {
        let policy = RetryPolicy {
            max_attempts: 4,
            delay_seconds: 2,
            exponential_backoff: true,
        };
        assert_eq!(retry_delay(&policy, 1), Duration::from_secs(2));
        assert_eq!(retry_delay(&policy, 3), Duration::from_secs(8));

        let flat = RetryPolicy {
            exponential_backoff: false,
            ..policy
        };
        assert_eq!(retry_delay(&flat, 3), Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_deadline_cancels() {
        let executor = FnExecutor::new(echo);
        let job = JobSpec::new("slow")
            .timeout_seconds(1)
            .step(StepSpec::run("wait", "sleep 30"))
            .step(StepSpec::run("after", "echo"));

        let outcome = runner(executor, Arc::new(ArtifactStore::in_memory()))
            .run(context(job))
            .await;

        assert_eq!(outcome.status, JobStatus::Cancelled);
        assert_eq!(outcome.failure.as_ref().unwrap().kind, FailureKind::Timeout);
        assert_eq!(
            conclusions(&outcome),
            vec![StepConclusion::Cancelled, StepConclusion::Skipped]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_step_timeout_fails_step() {
        let executor = FnExecutor::new(echo);
        let mut step = StepSpec::run("wait", "sleep 30");
        step.timeout_seconds = Some(2);
        let job = JobSpec::new("slow").step(step);

        let outcome = runner(executor, Arc::new(ArtifactStore::in_memory()))
            .run(context(job))
            .await;

        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.failure.as_ref().unwrap().kind, FailureKind::Timeout);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_step() {
        let executor = FnExecutor::new(echo);
        let job = JobSpec::new("slow").step(StepSpec::run("wait", "sleep 30"));
        let instance = context(job);
        let token = instance.cancel.clone();

        let runner = runner(executor, Arc::new(ArtifactStore::in_memory()));
        let handle = tokio::spawn(async move { runner.run(instance).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();

        let outcome = handle.await.unwrap();
        assert_eq!(outcome.status, JobStatus::Cancelled);
        assert_eq!(outcome.failure.unwrap().kind, FailureKind::Cancelled);
    }

    #[tokio::test]
    async fn test_upload_then_download() {
        let executor = FnExecutor::new(echo);
        let store = Arc::new(ArtifactStore::in_memory());

        let producer = JobSpec::new("build")
            .step(StepSpec::run("compile", "binary-${{ ctx.branch }}"))
            .step(StepSpec::upload(
                "publish",
                ArtifactUpload::from_content("dist-${{ ctx.branch }}", "${{ steps.compile.stdout }}"),
            ));
        let produced = runner(executor.clone(), store.clone())
            .run(context(producer))
            .await;
        assert_eq!(produced.status, JobStatus::Succeeded);
        assert_eq!(produced.artifacts.len(), 1);
        assert_eq!(produced.artifacts[0].name, "dist-main");

        let consumer = JobSpec::new("deploy")
            .step(StepSpec::download("fetch", ArtifactDownload::named("dist-main")))
            .step(StepSpec::run("ship", "ship ${{ steps.fetch.stdout }}"));
        let consumed = runner(executor.clone(), store).run(context(consumer)).await;

        assert_eq!(consumed.status, JobStatus::Succeeded);
        assert_eq!(executor.commands().last().unwrap(), "ship binary-main");
    }

    #[tokio::test]
    async fn test_missing_artifact() {
        let executor = FnExecutor::new(echo);
        let store = Arc::new(ArtifactStore::in_memory());

        let job = JobSpec::new("deploy").step(StepSpec::download(
            "fetch",
            ArtifactDownload::named("dist"),
        ));
        let outcome = runner(executor.clone(), store.clone()).run(context(job)).await;
        assert_eq!(outcome.status, JobStatus::Failed);
        assert_eq!(outcome.failure.unwrap().kind, FailureKind::ArtifactNotFound);

        let mut optional = ArtifactDownload::named("dist");
        optional.optional = true;
        let job = JobSpec::new("deploy").step(StepSpec::download("fetch", optional));
        let outcome = runner(executor, store).run(context(job)).await;
        assert_eq!(outcome.status, JobStatus::Succeeded);
    }

    #[tokio::test]
    async fn test_upload_from_workspace_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("report.txt"), b"42 passed").unwrap();
        let store = Arc::new(ArtifactStore::in_memory());
        let runner = InstanceRunner::new(FnExecutor::new(echo), store.clone(), dir.path());

        let job = JobSpec::new("test").step(StepSpec::upload(
            "keep",
            ArtifactUpload::from_path("report", "report.txt"),
        ));
        let outcome = runner.run(context(job)).await;

        assert_eq!(outcome.status, JobStatus::Succeeded);
        assert_eq!(store.get("report").await.unwrap(), b"42 passed".to_vec());
    }
}
