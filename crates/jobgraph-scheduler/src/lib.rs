//! Job graph planning and scheduling.
//!
//! A [`RunDefinition`](jobgraph_core::pipeline::RunDefinition) is validated and
//! expanded into a [`RunPlan`], which the [`Scheduler`] executes instance by
//! instance on a [`StepExecutor`](jobgraph_core::ports::StepExecutor).

pub mod dag;
pub mod instance;
pub mod matrix;
pub mod plan;
pub mod queue;
pub mod scheduler;
pub mod triggers;

pub use dag::{DagBuilder, JobDag};
pub use instance::{InstanceContext, InstanceOutcome, InstanceRunner};
pub use matrix::MatrixExpander;
pub use plan::RunPlan;
pub use queue::{QueueManager, QueuedInstance};
pub use scheduler::{RunHandle, Scheduler, SchedulerConfig};
pub use triggers::{TriggerEvent, TriggerResolver, parse_assignment};
