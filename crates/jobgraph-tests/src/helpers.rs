//! Scripted collaborators and test utilities.

use async_trait::async_trait;
use indexmap::IndexMap;
use jobgraph_core::Result;
use jobgraph_core::events::RunEvent;
use jobgraph_core::ports::{EventSink, StepExecutor, StepOutcome, StepRequest};
use jobgraph_core::run::JobStatus;
use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// What the [`ScriptedExecutor`] does for one command.
#[derive(Debug, Clone, Default)]
pub struct Script {
    exit_code: i32,
    stdout: Option<String>,
    outputs: IndexMap<String, String>,
    delay: Duration,
    failures_before_success: u32,
}

impl Script {
    pub fn succeed() -> Self {
        Self::default()
    }

    pub fn fail(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }

    /// Fail with exit code 1 `failures` times, then behave as scripted.
    pub fn flaky(failures: u32) -> Self {
        Self {
            failures_before_success: failures,
            ..Self::default()
        }
    }

    pub fn stdout(mut self, stdout: impl Into<String>) -> Self {
        self.stdout = Some(stdout.into());
        self
    }

    pub fn output(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.outputs.insert(key.into(), value.into());
        self
    }

    /// Take `delay` before reporting, as a long-running command would.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

struct Running<'a>(&'a AtomicUsize);

impl Drop for Running<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// In-memory step executor driven by per-command scripts.
///
/// Unscripted commands succeed and echo the command as stdout.
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: HashMap<String, Script>,
    calls: Mutex<Vec<StepRequest>>,
    attempts: Mutex<HashMap<String, u32>>,
    running: AtomicUsize,
    peak: AtomicUsize,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(mut self, command: impl Into<String>, script: Script) -> Self {
        self.scripts.insert(command.into(), script);
        self
    }

    /// Every request received, in arrival order.
    pub fn calls(&self) -> Vec<StepRequest> {
        self.calls.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.calls().into_iter().map(|call| call.command).collect()
    }

    pub fn call_count(&self, command: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|call| call.command == command)
            .count()
    }

    /// Most requests that were in flight at the same time.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StepExecutor for ScriptedExecutor {
    async fn execute(&self, request: &StepRequest) -> Result<StepOutcome> {
        self.calls.lock().unwrap().push(request.clone());
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let count = attempts.entry(request.command.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let in_flight = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        let _running = Running(&self.running);
        self.peak.fetch_max(in_flight, Ordering::SeqCst);

        let script = self.scripts.get(&request.command).cloned().unwrap_or_default();
        if !script.delay.is_zero() {
            tokio::time::sleep(script.delay).await;
        }
        if attempt <= script.failures_before_success {
            return Ok(StepOutcome::failure(1));
        }

        Ok(StepOutcome {
            exit_code: script.exit_code,
            stdout: script.stdout.unwrap_or_else(|| request.command.clone()),
            outputs: script.outputs,
        })
    }
}

/// Event sink that keeps every event it receives.
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<RunEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<RunEvent> {
        self.events.lock().unwrap().clone()
    }

    /// State changes of the instance labelled `instance`, in order.
    pub fn transitions(&self, instance: &str) -> Vec<JobStatus> {
        self.events()
            .into_iter()
            .filter_map(|event| match event {
                RunEvent::InstanceStateChanged(payload) if payload.instance.to_string() == instance => {
                    Some(payload.status)
                }
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventSink for RecordingSink {
    async fn publish(&self, event: RunEvent) -> Result<()> {
        self.events.lock().unwrap().push(event);
        Ok(())
    }
}

/// Wait for a condition with timeout.
pub async fn wait_for<F, Fut>(timeout: Duration, interval: Duration, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if condition().await {
            return true;
        }
        tokio::time::sleep(interval).await;
    }
    false
}

/// Assert that a future completes within a timeout.
pub async fn assert_completes_within<F, T>(future: F, timeout: Duration) -> T
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(timeout, future)
        .await
        .expect("Operation timed out")
}
