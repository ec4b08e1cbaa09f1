//! Span creation for run operations.

use tracing::{Level, Span, span};

/// Attributes shared by the spans of one run.
#[derive(Debug, Default, Clone)]
pub struct RunAttributes {
    pub run_id: Option<String>,
    pub run_name: Option<String>,
    pub instance: Option<String>,
    pub step_name: Option<String>,
    pub nested: bool,
}

impl RunAttributes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run(mut self, id: impl Into<String>) -> Self {
        self.run_id = Some(id.into());
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.run_name = Some(name.into());
        self
    }

    pub fn instance(mut self, instance: impl Into<String>) -> Self {
        self.instance = Some(instance.into());
        self
    }

    pub fn step(mut self, name: impl Into<String>) -> Self {
        self.step_name = Some(name.into());
        self
    }

    pub fn nested(mut self, nested: bool) -> Self {
        self.nested = nested;
        self
    }
}

/// Create a span for a run.
pub fn run_span(attrs: &RunAttributes) -> Span {
    span!(
        Level::INFO,
        "run.execute",
        run.id = attrs.run_id.as_deref().unwrap_or(""),
        run.name = attrs.run_name.as_deref().unwrap_or(""),
        run.nested = attrs.nested,
    )
}

/// Create a span for a job instance.
pub fn instance_span(attrs: &RunAttributes) -> Span {
    span!(
        Level::INFO,
        "instance.execute",
        run.id = attrs.run_id.as_deref().unwrap_or(""),
        instance = attrs.instance.as_deref().unwrap_or(""),
    )
}

/// Create a span for a step.
pub fn step_span(attrs: &RunAttributes) -> Span {
    span!(
        Level::INFO,
        "step.execute",
        run.id = attrs.run_id.as_deref().unwrap_or(""),
        instance = attrs.instance.as_deref().unwrap_or(""),
        step.name = attrs.step_name.as_deref().unwrap_or(""),
    )
}

/// Create a span for artifact operations.
pub fn artifact_span(operation: &str, name: &str) -> Span {
    span!(
        Level::DEBUG,
        "artifact.operation",
        operation = operation,
        artifact.name = name,
    )
}
