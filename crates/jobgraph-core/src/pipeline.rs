//! Run definition types.
//!
//! These types represent the user-authored run definition document: a mapping
//! of job id to job specification. They round-trip losslessly through YAML and
//! JSON.

use crate::error::ConfigurationError;
use crate::ids::JobId;
use crate::value::Value;
use indexmap::IndexMap;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RunDefinition {
    #[serde(default = "default_version")]
    pub version: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Worker limit for this run; the scheduler's configured limit applies when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_workers: Option<usize>,
    /// Environment shared by every job. Job and step `env` take precedence.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
    #[serde(deserialize_with = "deserialize_jobs")]
    pub jobs: IndexMap<String, JobSpec>,
}

fn default_version() -> String {
    "1".to_string()
}

fn deserialize_jobs<'de, D>(deserializer: D) -> Result<IndexMap<String, JobSpec>, D::Error>
where
    D: Deserializer<'de>,
{
    let mut jobs = IndexMap::<String, JobSpec>::deserialize(deserializer)?;
    for (id, job) in jobs.iter_mut() {
        job.id = JobId::new(id.clone());
    }
    Ok(jobs)
}

impl RunDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            version: default_version(),
            name: name.into(),
            description: None,
            max_workers: None,
            env: IndexMap::new(),
            jobs: IndexMap::new(),
        }
    }

    /// Add a job, keyed by its id.
    pub fn job(mut self, job: JobSpec) -> Self {
        self.jobs.insert(job.id.to_string(), job);
        self
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigurationError> {
        serde_yaml::from_str(content)
            .map_err(|e| ConfigurationError::InvalidDefinition(e.to_string()))
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigurationError> {
        serde_json::from_str(content)
            .map_err(|e| ConfigurationError::InvalidDefinition(e.to_string()))
    }

    pub fn to_yaml(&self) -> crate::Result<String> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn get(&self, id: &str) -> Option<&JobSpec> {
        self.jobs.get(id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct JobSpec {
    /// Filled from the key of the `jobs` mapping.
    #[serde(skip)]
    pub id: JobId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, alias = "depends_on", skip_serializing_if = "Vec::is_empty")]
    pub needs: Vec<String>,
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub matrix: Option<MatrixSpec>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub steps: Vec<StepSpec>,
    #[serde(default = "default_job_timeout")]
    pub timeout_seconds: u64,
    /// Output name to expression, evaluated once the instance succeeds.
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub outputs: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
    /// A failed instance of this job does not fail the run.
    #[serde(default, skip_serializing_if = "is_false")]
    pub continue_on_error: bool,
    /// Nested run definition executed in place of steps.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<Box<RunDefinition>>,
}

fn default_job_timeout() -> u64 {
    3600
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl JobSpec {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: JobId::new(id),
            name: None,
            needs: vec![],
            condition: None,
            matrix: None,
            steps: vec![],
            timeout_seconds: default_job_timeout(),
            outputs: IndexMap::new(),
            env: IndexMap::new(),
            continue_on_error: false,
            workflow: None,
        }
    }

    pub fn needs(mut self, deps: &[&str]) -> Self {
        self.needs = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn step(mut self, step: StepSpec) -> Self {
        self.steps.push(step);
        self
    }

    pub fn matrix(mut self, matrix: MatrixSpec) -> Self {
        self.matrix = Some(matrix);
        self
    }

    pub fn output(mut self, name: impl Into<String>, expression: impl Into<String>) -> Self {
        self.outputs.insert(name.into(), expression.into());
        self
    }

    pub fn timeout_seconds(mut self, seconds: u64) -> Self {
        self.timeout_seconds = seconds;
        self
    }

    pub fn continue_on_error(mut self, value: bool) -> Self {
        self.continue_on_error = value;
        self
    }

    pub fn workflow(mut self, definition: RunDefinition) -> Self {
        self.workflow = Some(Box::new(definition));
        self
    }

    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or(self.id.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct StepSpec {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(default = "default_shell")]
    pub shell: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload: Option<ArtifactUpload>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download: Option<ArtifactDownload>,
    #[serde(rename = "if", default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    #[serde(default, skip_serializing_if = "IndexMap::is_empty")]
    pub env: IndexMap<String, String>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub continue_on_error: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,
}

fn default_shell() -> String {
    "bash".to_string()
}

/// The single action a step performs.
#[derive(Debug, Clone, Copy)]
pub enum StepAction<'a> {
    Run { command: &'a str, shell: &'a str },
    Upload(&'a ArtifactUpload),
    Download(&'a ArtifactDownload),
}

impl StepSpec {
    fn blank(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            run: None,
            shell: default_shell(),
            upload: None,
            download: None,
            condition: None,
            env: IndexMap::new(),
            continue_on_error: false,
            retry: None,
            timeout_seconds: None,
        }
    }

    pub fn run(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            run: Some(command.into()),
            ..Self::blank(name)
        }
    }

    pub fn upload(name: impl Into<String>, upload: ArtifactUpload) -> Self {
        Self {
            upload: Some(upload),
            ..Self::blank(name)
        }
    }

    pub fn download(name: impl Into<String>, download: ArtifactDownload) -> Self {
        Self {
            download: Some(download),
            ..Self::blank(name)
        }
    }

    pub fn when(mut self, condition: impl Into<String>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn continue_on_error(mut self, value: bool) -> Self {
        self.continue_on_error = value;
        self
    }

    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    /// Resolve the step's action, rejecting steps with zero or several actions.
    pub fn action(&self, job: &str) -> Result<StepAction<'_>, ConfigurationError> {
        match (&self.run, &self.upload, &self.download) {
            (Some(command), None, None) => Ok(StepAction::Run {
                command,
                shell: &self.shell,
            }),
            (None, Some(upload), None) => {
                if upload.path.is_some() == upload.content.is_some() {
                    return Err(ConfigurationError::InvalidUploadSource {
                        job: job.to_string(),
                        step: self.name.clone(),
                    });
                }
                Ok(StepAction::Upload(upload))
            }
            (None, None, Some(download)) => Ok(StepAction::Download(download)),
            _ => Err(ConfigurationError::InvalidStepAction {
                job: job.to_string(),
                step: self.name.clone(),
            }),
        }
    }
}

/// Publish bytes to the artifact store under `name`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactUpload {
    pub name: String,
    /// File in the workspace to upload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Inline content, usually an interpolation such as `${{ steps.build.stdout }}`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retention_days: Option<u32>,
}

impl ArtifactUpload {
    pub fn from_content(name: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            content: Some(content.into()),
            retention_days: None,
        }
    }

    pub fn from_path(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: Some(path.into()),
            content: None,
            retention_days: None,
        }
    }
}

/// Fetch an artifact. The content becomes the step's stdout and, when `path`
/// is set, is also written into the workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactDownload {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// A missing artifact leaves the step successful.
    #[serde(default, skip_serializing_if = "is_false")]
    pub optional: bool,
}

impl ArtifactDownload {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: None,
            optional: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_delay")]
    pub delay_seconds: u64,
    #[serde(default = "default_true")]
    pub exponential_backoff: bool,
}

fn default_max_attempts() -> u32 {
    1
}

fn default_delay() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

impl RetryPolicy {
    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay_seconds: 0,
            exponential_backoff: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct MatrixSpec {
    /// Axis name to candidate values, in declaration order.
    #[serde(default, alias = "dimensions")]
    pub axes: IndexMap<String, Vec<Value>>,
    /// Partial assignments; any combination containing one is dropped.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude: Vec<IndexMap<String, Value>>,
    /// Extra assignments appended after exclusions are applied.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include: Vec<IndexMap<String, Value>>,
    /// Cancel the remaining instances of the job once one fails.
    #[serde(default, skip_serializing_if = "is_false")]
    pub fail_fast: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_parallel: Option<usize>,
}

impl MatrixSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn axis<V: Into<Value>>(mut self, name: impl Into<String>, values: Vec<V>) -> Self {
        self.axes
            .insert(name.into(), values.into_iter().map(Into::into).collect());
        self
    }

    pub fn exclude<V: Into<Value>>(mut self, tuple: Vec<(&str, V)>) -> Self {
        self.exclude.push(
            tuple
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.into()))
                .collect(),
        );
        self
    }

    pub fn include<V: Into<Value>>(mut self, tuple: Vec<(&str, V)>) -> Self {
        self.include.push(
            tuple
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.into()))
                .collect(),
        );
        self
    }
}
