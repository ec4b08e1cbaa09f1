//! Console progress output.

use async_trait::async_trait;
use console::style;
use jobgraph_core::Result;
use jobgraph_core::events::RunEvent;
use jobgraph_core::ports::EventSink;
use jobgraph_core::run::{JobStatus, StepConclusion};

/// Prints instance and step progress to stderr.
pub struct ConsoleReporter;

#[async_trait]
impl EventSink for ConsoleReporter {
    async fn publish(&self, event: RunEvent) -> Result<()> {
        match event {
            RunEvent::RunStarted(payload) => {
                eprintln!(
                    "{} Run {} started ({} instances)",
                    style("▶").cyan(),
                    style(&payload.name).bold(),
                    payload.instances
                );
            }
            RunEvent::InstanceStateChanged(payload) => {
                let instance = payload.instance.to_string();
                match payload.status {
                    JobStatus::Running => eprintln!("  {} {}", style("▶").cyan(), instance),
                    JobStatus::Succeeded => eprintln!("  {} {}", style("✓").green(), instance),
                    JobStatus::Failed => eprintln!("  {} {}", style("✗").red(), style(instance).red()),
                    JobStatus::Skipped => {
                        eprintln!("  {} {}", style("○").dim(), style(format!("{} (skipped)", instance)).dim())
                    }
                    JobStatus::Cancelled => {
                        eprintln!("  {} {} (cancelled)", style("!").yellow(), instance)
                    }
                    JobStatus::Pending | JobStatus::Ready => {}
                }
            }
            RunEvent::StepCompleted(payload) => match payload.conclusion {
                StepConclusion::Failure => eprintln!(
                    "    {} {} exited with {}",
                    style("✗").red(),
                    payload.step,
                    payload.exit_code.map_or("no status".to_string(), |c| c.to_string())
                ),
                StepConclusion::Skipped | StepConclusion::Cancelled => eprintln!(
                    "    {} {}",
                    style("○").dim(),
                    style(format!("{} ({})", payload.step, payload.conclusion.as_str())).dim()
                ),
                StepConclusion::Success => eprintln!(
                    "    {} {} {}",
                    style("·").dim(),
                    payload.step,
                    style(format!("{}ms", payload.duration_ms)).dim()
                ),
            },
            RunEvent::RunCompleted(_) => {}
        }
        Ok(())
    }
}
