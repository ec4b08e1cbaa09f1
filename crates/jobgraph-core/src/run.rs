//! Run and job instance state.

use crate::artifact::ArtifactRef;
use crate::ids::{JobId, RunId};
use crate::value::Value;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of one job instance.
///
/// ```text
/// Pending -> {Skipped | Ready} -> Running -> {Succeeded | Failed | Cancelled}
/// ```
///
/// Pending and Ready instances move straight to Cancelled when the run is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Skipped | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Ready)
                | (Pending, Skipped)
                | (Pending, Cancelled)
                | (Ready, Running)
                | (Ready, Cancelled)
                | (Running, Succeeded)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Ready => "ready",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Skipped => "skipped",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a job as seen by its dependents (`needs.<job>.result`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum JobResult {
    Success,
    Failure,
    Cancelled,
    Skipped,
}

impl JobResult {
    /// Fold the terminal states of a job's instances into one result.
    pub fn aggregate(statuses: impl IntoIterator<Item = JobStatus>) -> JobResult {
        let mut any_cancelled = false;
        let mut all_skipped = true;
        for status in statuses {
            match status {
                JobStatus::Failed => return JobResult::Failure,
                JobStatus::Cancelled => any_cancelled = true,
                _ => {}
            }
            all_skipped &= status == JobStatus::Skipped;
        }
        if any_cancelled {
            JobResult::Cancelled
        } else if all_skipped {
            JobResult::Skipped
        } else {
            JobResult::Success
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobResult::Success => "success",
            JobResult::Failure => "failure",
            JobResult::Cancelled => "cancelled",
            JobResult::Skipped => "skipped",
        }
    }
}

impl fmt::Display for JobResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a finished job exposes to its dependents.
#[derive(Debug, Clone, PartialEq)]
pub struct Upstream {
    pub result: JobResult,
    pub outputs: IndexMap<String, String>,
}

/// One concrete matrix combination, in axis declaration order.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(transparent)]
pub struct MatrixAssignment(IndexMap<String, Value>);

impl MatrixAssignment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, axis: impl Into<String>, value: Value) {
        self.0.insert(axis.into(), value);
    }

    pub fn get(&self, axis: &str) -> Option<&Value> {
        self.0.get(axis)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    /// True when every axis of `partial` is present here with an equal value.
    pub fn contains(&self, partial: &IndexMap<String, Value>) -> bool {
        partial
            .iter()
            .all(|(axis, value)| self.0.get(axis) == Some(value))
    }

    /// `a, 18` for `{os: a, node: 18}`.
    pub fn label(&self) -> String {
        self.0
            .values()
            .map(|v| v.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

impl From<IndexMap<String, Value>> for MatrixAssignment {
    fn from(map: IndexMap<String, Value>) -> Self {
        Self(map)
    }
}

impl<K: Into<String>, V: Into<Value>> FromIterator<(K, V)> for MatrixAssignment {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v.into())).collect())
    }
}

/// Identity of a job instance: the job plus its matrix assignment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InstanceKey {
    pub job: JobId,
    #[serde(default, skip_serializing_if = "MatrixAssignment::is_empty")]
    pub matrix: MatrixAssignment,
}

impl InstanceKey {
    pub fn new(job: JobId, matrix: MatrixAssignment) -> Self {
        Self { job, matrix }
    }

    pub fn unmatrixed(job: impl Into<String>) -> Self {
        Self::new(JobId::new(job), MatrixAssignment::new())
    }
}

impl fmt::Display for InstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.matrix.is_empty() {
            write!(f, "{}", self.job)
        } else {
            write!(f, "{} ({})", self.job, self.matrix.label())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, RunStatus::Succeeded)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunStatus::Succeeded => f.write_str("succeeded"),
            RunStatus::Failed => f.write_str("failed"),
            RunStatus::Cancelled => f.write_str("cancelled"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    StepExecution,
    Timeout,
    ArtifactNotFound,
    Executor,
    Cancelled,
}

/// Why an instance did not succeed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct FailureDetail {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step: Option<String>,
    pub kind: FailureKind,
    pub message: String,
}

impl FailureDetail {
    pub fn new(step: Option<String>, kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            step,
            kind,
            message: message.into(),
        }
    }
}

/// Conclusion of a single step (`steps.<name>.outcome`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum StepConclusion {
    Success,
    Failure,
    Skipped,
    Cancelled,
}

impl StepConclusion {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepConclusion::Success => "success",
            StepConclusion::Failure => "failure",
            StepConclusion::Skipped => "skipped",
            StepConclusion::Cancelled => "cancelled",
        }
    }
}

/// What later steps in the same instance can see of an earlier one.
#[derive(Debug, Clone, PartialEq)]
pub struct StepState {
    pub outcome: StepConclusion,
    pub stdout: String,
    pub outputs: IndexMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepReport {
    pub name: String,
    pub conclusion: StepConclusion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub attempts: u32,
    pub duration_ms: u64,
}

/// Terminal snapshot of one job instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InstanceReport {
    pub key: InstanceKey,
    pub status: JobStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub outputs: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureDetail>,
    /// Result of the embedded run for `workflow:` jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nested: Option<Box<RunResult>>,
}

impl InstanceReport {
    pub fn new(key: InstanceKey, status: JobStatus) -> Self {
        Self {
            key,
            status,
            started_at: None,
            finished_at: None,
            duration_ms: None,
            outputs: IndexMap::new(),
            artifacts: vec![],
            steps: vec![],
            failure: None,
            nested: None,
        }
    }
}

/// Read-only snapshot of a finished run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunResult {
    pub run_id: RunId,
    pub name: String,
    pub status: RunStatus,
    pub instances: Vec<InstanceReport>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
}

impl RunResult {
    pub fn instances_of<'a>(&'a self, job: &'a str) -> impl Iterator<Item = &'a InstanceReport> {
        self.instances
            .iter()
            .filter(move |i| i.key.job.as_str() == job)
    }

    /// The first instance of `job`; the only one for unmatrixed jobs.
    pub fn instance(&self, job: &str) -> Option<&InstanceReport> {
        self.instances.iter().find(|i| i.key.job.as_str() == job)
    }

    pub fn status_of(&self, job: &str) -> Option<JobStatus> {
        self.instance(job).map(|i| i.status)
    }

    pub fn job_result(&self, job: &str) -> Option<JobResult> {
        let mut statuses = self.instances_of(job).map(|i| i.status).peekable();
        statuses.peek()?;
        Some(JobResult::aggregate(statuses))
    }

    /// Outputs of every succeeded instance of `job`, merged in expansion order.
    pub fn outputs_of(&self, job: &str) -> IndexMap<String, String> {
        let mut merged = IndexMap::new();
        for instance in self
            .instances_of(job)
            .filter(|i| i.status == JobStatus::Succeeded)
        {
            merged.extend(instance.outputs.clone());
        }
        merged
    }

    pub fn count(&self, status: JobStatus) -> usize {
        self.instances.iter().filter(|i| i.status == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Ready));
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Skipped));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Running));
        assert!(!JobStatus::Skipped.can_transition_to(JobStatus::Ready));
        assert!(!JobStatus::Succeeded.can_transition_to(JobStatus::Failed));
        assert!(!JobStatus::Ready.can_transition_to(JobStatus::Skipped));
    }

    #[test]
    fn test_terminal_states() {
        assert!(JobStatus::Skipped.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
        assert!(!JobStatus::Ready.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
    }

    #[test]
    fn test_aggregate_result() {
        use JobStatus::*;
        assert_eq!(JobResult::aggregate([Succeeded, Succeeded]), JobResult::Success);
        assert_eq!(JobResult::aggregate([Succeeded, Cancelled, Failed]), JobResult::Failure);
        assert_eq!(JobResult::aggregate([Succeeded, Cancelled]), JobResult::Cancelled);
        assert_eq!(JobResult::aggregate([Skipped, Skipped]), JobResult::Skipped);
        assert_eq!(JobResult::aggregate([Skipped, Succeeded]), JobResult::Success);
    }

    #[test]
    fn test_assignment_partial_match() {
        let assignment: MatrixAssignment =
            [("os", Value::from("b")), ("node", Value::from(18)), ("arch", Value::from("x64"))]
                .into_iter()
                .collect();
        let mut partial = IndexMap::new();
        partial.insert("os".to_string(), Value::from("b"));
        partial.insert("node".to_string(), Value::from(18));
        assert!(assignment.contains(&partial));

        partial.insert("node".to_string(), Value::from(20));
        assert!(!assignment.contains(&partial));
    }

    #[test]
    fn test_instance_key_display() {
        let matrix: MatrixAssignment = [("os", "a"), ("node", "18")].into_iter().collect();
        assert_eq!(InstanceKey::new(JobId::new("test"), matrix).to_string(), "test (a, 18)");
        assert_eq!(InstanceKey::unmatrixed("build").to_string(), "build");
    }

    fn report(job: &str, os: Option<&str>, status: JobStatus) -> InstanceReport {
        let matrix: MatrixAssignment = os.into_iter().map(|os| ("os", os)).collect();
        InstanceReport::new(InstanceKey::new(JobId::new(job), matrix), status)
    }

    #[test]
    fn test_result_lookups() {
        let mut build = report("build", None, JobStatus::Succeeded);
        build.outputs.insert("binary".to_string(), "app".to_string());
        let mut linux = report("test", Some("linux"), JobStatus::Succeeded);
        linux.outputs.insert("coverage".to_string(), "81".to_string());
        let now = Utc::now();
        let result = RunResult {
            run_id: RunId::new(),
            name: "ci".to_string(),
            status: RunStatus::Succeeded,
            instances: vec![build, linux, report("test", Some("macos"), JobStatus::Skipped)],
            started_at: now,
            finished_at: now,
            duration_ms: 0,
        };

        // The looked-up report outlives the name it was found by.
        let found = {
            let name = String::from("build");
            result.instance(&name)
        };
        assert_eq!(found.map(|i| i.status), Some(JobStatus::Succeeded));
        assert!(result.instance("deploy").is_none());

        assert_eq!(result.instances_of("test").count(), 2);
        assert_eq!(result.job_result("test"), Some(JobResult::Success));
        assert_eq!(result.job_result("deploy"), None);
        assert_eq!(result.outputs_of("test")["coverage"], "81");
        assert_eq!(result.count(JobStatus::Skipped), 1);
    }
}
