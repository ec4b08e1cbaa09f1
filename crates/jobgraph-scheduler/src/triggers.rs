//! Trigger resolution.
//!
//! A trigger event is turned into the run context once, before scheduling.

use indexmap::IndexMap;
use jobgraph_core::context::RunContext;
use jobgraph_core::value::Value;
use serde::{Deserialize, Serialize};

/// Event that starts a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TriggerEvent {
    Push {
        branch: String,
        #[serde(default)]
        sha: Option<String>,
        #[serde(default)]
        actor: Option<String>,
    },
    Tag {
        name: String,
        #[serde(default)]
        sha: Option<String>,
        #[serde(default)]
        actor: Option<String>,
    },
    PullRequest {
        number: u64,
        source_branch: String,
        target_branch: String,
        #[serde(default)]
        sha: Option<String>,
        #[serde(default)]
        actor: Option<String>,
    },
    Schedule {
        cron: String,
        branch: String,
    },
    Manual {
        branch: String,
        #[serde(default)]
        actor: Option<String>,
        #[serde(default)]
        inputs: IndexMap<String, Value>,
    },
}

impl TriggerEvent {
    pub fn push(branch: impl Into<String>) -> Self {
        TriggerEvent::Push {
            branch: branch.into(),
            sha: None,
            actor: None,
        }
    }

    pub fn tag(name: impl Into<String>) -> Self {
        TriggerEvent::Tag {
            name: name.into(),
            sha: None,
            actor: None,
        }
    }

    pub fn manual(branch: impl Into<String>) -> Self {
        TriggerEvent::Manual {
            branch: branch.into(),
            actor: None,
            inputs: IndexMap::new(),
        }
    }

    /// Value of `ctx.event`.
    pub fn event_name(&self) -> &'static str {
        match self {
            TriggerEvent::Push { .. } => "push",
            TriggerEvent::Tag { .. } => "tag",
            TriggerEvent::PullRequest { .. } => "pull_request",
            TriggerEvent::Schedule { .. } => "schedule",
            TriggerEvent::Manual { .. } => "workflow_dispatch",
        }
    }
}

/// Builds the run context for a trigger event.
#[derive(Debug, Default)]
pub struct TriggerResolver {
    overrides: Vec<(String, Value)>,
}

impl TriggerResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Extra `key=value` facts; these win over anything derived from the event.
    pub fn with_overrides<I, K, V>(mut self, overrides: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        self.overrides
            .extend(overrides.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn resolve(&self, event: &TriggerEvent) -> RunContext {
        let builder = RunContext::builder().set("event", event.event_name());
        let builder = match event {
            TriggerEvent::Push { branch, sha, actor } => builder
                .set("branch", branch.as_str())
                .set("ref", format!("refs/heads/{}", branch))
                .extend(optional("sha", sha))
                .extend(optional("actor", actor)),
            TriggerEvent::Tag { name, sha, actor } => builder
                .set("tag", name.as_str())
                .set("ref", format!("refs/tags/{}", name))
                .extend(optional("sha", sha))
                .extend(optional("actor", actor)),
            TriggerEvent::PullRequest {
                number,
                source_branch,
                target_branch,
                sha,
                actor,
            } => builder
                .set("branch", source_branch.as_str())
                .set("ref", format!("refs/pull/{}/merge", number))
                .set("head_ref", source_branch.as_str())
                .set("base_ref", target_branch.as_str())
                .set("pr_number", *number as f64)
                .extend(optional("sha", sha))
                .extend(optional("actor", actor)),
            TriggerEvent::Schedule { cron, branch } => builder
                .set("schedule", cron.as_str())
                .set("branch", branch.as_str())
                .set("ref", format!("refs/heads/{}", branch)),
            TriggerEvent::Manual {
                branch,
                actor,
                inputs,
            } => inputs
                .iter()
                .fold(builder, |builder, (name, value)| {
                    builder.input(name, value.clone())
                })
                .set("branch", branch.as_str())
                .set("ref", format!("refs/heads/{}", branch))
                .extend(optional("actor", actor)),
        };

        builder.extend(self.overrides.iter().cloned()).build()
    }
}

fn optional(key: &str, value: &Option<String>) -> Option<(String, Value)> {
    value
        .as_ref()
        .map(|v| (key.to_string(), Value::from(v.as_str())))
}

/// Parse a `key=value` assignment. `true`/`false` become booleans and numeric
/// text becomes a number; anything else stays a string.
pub fn parse_assignment(assignment: &str) -> Result<(String, Value), String> {
    let (key, raw) = assignment
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", assignment))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", assignment));
    }
    Ok((key.to_string(), parse_scalar(raw)))
}

fn parse_scalar(raw: &str) -> Value {
    match raw {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        _ => match raw.parse::<f64>() {
            Ok(number) if number.is_finite() && !raw.trim().is_empty() => Value::Number(number),
            _ => Value::String(raw.to_string()),
        },
    }
}
