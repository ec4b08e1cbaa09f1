//! Progress events emitted while a run executes.

use crate::ids::RunId;
use crate::run::{InstanceKey, JobStatus, RunStatus, StepConclusion};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    RunStarted(RunStartedPayload),
    InstanceStateChanged(InstanceStateChangedPayload),
    StepCompleted(StepCompletedPayload),
    RunCompleted(RunCompletedPayload),
}

impl RunEvent {
    /// Dotted subject, e.g. `run.<id>.instance.test (a, 18).running`.
    pub fn subject(&self) -> String {
        match self {
            RunEvent::RunStarted(p) => format!("run.{}.started", p.run_id),
            RunEvent::InstanceStateChanged(p) => {
                format!("run.{}.instance.{}.{}", p.run_id, p.instance, p.status)
            }
            RunEvent::StepCompleted(p) => {
                format!("run.{}.instance.{}.step.{}", p.run_id, p.instance, p.step)
            }
            RunEvent::RunCompleted(p) => format!("run.{}.completed", p.run_id),
        }
    }

    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::RunStarted(p) => p.run_id,
            RunEvent::InstanceStateChanged(p) => p.run_id,
            RunEvent::StepCompleted(p) => p.run_id,
            RunEvent::RunCompleted(p) => p.run_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunStartedPayload {
    pub run_id: RunId,
    pub name: String,
    pub instances: usize,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct InstanceStateChangedPayload {
    pub run_id: RunId,
    pub instance: InstanceKey,
    pub status: JobStatus,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepCompletedPayload {
    pub run_id: RunId,
    pub instance: InstanceKey,
    pub step: String,
    pub conclusion: StepConclusion,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunCompletedPayload {
    pub run_id: RunId,
    pub status: RunStatus,
    pub duration_ms: u64,
    pub completed_at: DateTime<Utc>,
}
