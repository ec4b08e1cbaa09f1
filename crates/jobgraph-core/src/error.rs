//! Error types for jobgraph.

use thiserror::Error;

/// A defect in a run definition. Always fatal and always raised before any
/// job instance starts.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigurationError {
    #[error("Run definition has no jobs")]
    EmptyRun,

    #[error("Invalid run definition: {0}")]
    InvalidDefinition(String),

    #[error("Cycle detected in job dependencies: {}", cycle.join(" -> "))]
    CyclicDependency { cycle: Vec<String> },

    #[error("Job '{job}' depends on unknown job '{dependency}'")]
    UnknownDependency { job: String, dependency: String },

    #[error("Job '{job}' depends on itself")]
    SelfDependency { job: String },

    #[error("Malformed expression in {location}: '{expression}': {message}")]
    MalformedExpression {
        location: String,
        expression: String,
        message: String,
    },

    #[error("Matrix of job '{job}' excludes undeclared axis '{axis}'")]
    UndeclaredMatrixAxis { job: String, axis: String },

    #[error("Matrix axis '{axis}' of job '{job}' has no values")]
    EmptyMatrixAxis { job: String, axis: String },

    #[error("Step '{step}' of job '{job}' must declare exactly one of run, upload or download")]
    InvalidStepAction { job: String, step: String },

    #[error("Upload step '{step}' of job '{job}' must declare exactly one of path or content")]
    InvalidUploadSource { job: String, step: String },
}

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    #[error("Step '{step}' failed with exit code {exit_code}")]
    StepExecution { step: String, exit_code: i32 },

    #[error("Timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("Artifact not found: {0}")]
    ArtifactNotFound(String),

    #[error("Artifact backend error: {0}")]
    Artifact(String),

    #[error("Step executor error: {0}")]
    Executor(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
