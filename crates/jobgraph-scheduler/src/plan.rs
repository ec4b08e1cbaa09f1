//! Load-time validation and expansion of a run definition.

use crate::dag::{DagBuilder, JobDag};
use crate::matrix::MatrixExpander;
use jobgraph_core::expression::{Expression, ExpressionError};
use jobgraph_core::interpolation::Template;
use jobgraph_core::pipeline::{JobSpec, RunDefinition, StepAction};
use jobgraph_core::run::{InstanceKey, MatrixAssignment};
use jobgraph_core::{ConfigurationError, JobId};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

/// Condition applied to jobs that declare none.
pub const DEFAULT_CONDITION: &str = "success()";

/// A validated run definition with every job expanded into its instances.
///
/// Instances are listed job by job in dependency order, and in expansion order
/// within a job. Nothing in a plan changes once it is built.
#[derive(Debug)]
pub struct RunPlan {
    definition: Arc<RunDefinition>,
    dag: JobDag,
    instances: Vec<InstanceKey>,
    conditions: HashMap<String, Expression>,
    nested: HashMap<String, Arc<RunPlan>>,
}

impl RunPlan {
    /// Validate `definition` and expand it. Any defect is reported here, before
    /// a single instance could start.
    pub fn build(definition: &RunDefinition) -> Result<Self, ConfigurationError> {
        let dag = DagBuilder::new().build(definition)?;
        let expander = MatrixExpander::new();

        for (key, value) in &definition.env {
            parse_template(&format!("env.{}", key), value)?;
        }

        let mut conditions = HashMap::new();
        let mut nested = HashMap::new();
        for (id, job) in &definition.jobs {
            validate_job(id, job)?;
            if let Some(matrix) = &job.matrix {
                expander.validate(id, matrix)?;
            }

            let source = job.condition.as_deref().unwrap_or(DEFAULT_CONDITION);
            let condition = parse_expression(&format!("jobs.{}.if", id), source)?;
            if let Some(dependency) = condition
                .needs_references()
                .into_iter()
                .find(|dep| !job.needs.contains(dep))
            {
                return Err(ConfigurationError::UnknownDependency {
                    job: id.clone(),
                    dependency,
                });
            }
            conditions.insert(id.clone(), condition);

            if let Some(workflow) = &job.workflow {
                nested.insert(id.clone(), Arc::new(RunPlan::build(workflow)?));
            }
        }

        let mut instances = Vec::new();
        for id in dag.topological_order() {
            let assignments = match definition.get(id).and_then(|job| job.matrix.as_ref()) {
                Some(matrix) => expander.expand(matrix),
                None => vec![MatrixAssignment::new()],
            };
            instances.extend(
                assignments
                    .into_iter()
                    .map(|matrix| InstanceKey::new(JobId::new(id), matrix)),
            );
        }

        Ok(Self {
            definition: Arc::new(definition.clone()),
            dag,
            instances,
            conditions,
            nested,
        })
    }

    pub fn definition(&self) -> &Arc<RunDefinition> {
        &self.definition
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn dag(&self) -> &JobDag {
        &self.dag
    }

    pub fn instances(&self) -> &[InstanceKey] {
        &self.instances
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Plan indices of the instances of `job`.
    pub fn indices_of(&self, job: &str) -> Vec<usize> {
        self.instances
            .iter()
            .enumerate()
            .filter(|(_, key)| key.job.as_str() == job)
            .map(|(index, _)| index)
            .collect()
    }

    pub fn job(&self, job: &str) -> Option<&JobSpec> {
        self.definition.get(job)
    }

    /// The gate condition of `job`, `success()` when it declares none.
    pub fn condition(&self, job: &str) -> Option<&Expression> {
        self.conditions.get(job)
    }

    /// The plan of the run embedded by a `workflow:` job.
    pub fn nested(&self, job: &str) -> Option<&Arc<RunPlan>> {
        self.nested.get(job)
    }
}

fn malformed(location: &str, source: &str, err: ExpressionError) -> ConfigurationError {
    ConfigurationError::MalformedExpression {
        location: location.to_string(),
        expression: source.to_string(),
        message: err.to_string(),
    }
}

fn parse_expression(location: &str, source: &str) -> Result<Expression, ConfigurationError> {
    Expression::parse(source).map_err(|e| malformed(location, source, e))
}

fn parse_template(location: &str, source: &str) -> Result<(), ConfigurationError> {
    Template::parse(source)
        .map(|_| ())
        .map_err(|e| malformed(location, source, e))
}

fn validate_job(id: &str, job: &JobSpec) -> Result<(), ConfigurationError> {
    if job.workflow.is_some() && !job.steps.is_empty() {
        return Err(ConfigurationError::InvalidDefinition(format!(
            "job '{}' declares both steps and a workflow",
            id
        )));
    }

    for (key, value) in &job.env {
        parse_template(&format!("jobs.{}.env.{}", id, key), value)?;
    }
    for (name, value) in &job.outputs {
        parse_template(&format!("jobs.{}.outputs.{}", id, name), value)?;
    }

    let mut seen = HashSet::new();
    for step in &job.steps {
        if !seen.insert(step.name.as_str()) {
            return Err(ConfigurationError::InvalidDefinition(format!(
                "job '{}' has more than one step named '{}'",
                id, step.name
            )));
        }

        let location = |field: &str| format!("jobs.{}.steps.{}.{}", id, step.name, field);
        if let Some(condition) = &step.condition {
            parse_expression(&location("if"), condition)?;
        }
        for (key, value) in &step.env {
            parse_template(&location(&format!("env.{}", key)), value)?;
        }

        match step.action(id)? {
            StepAction::Run { command, .. } => parse_template(&location("run"), command)?,
            StepAction::Upload(upload) => {
                parse_template(&location("upload.name"), &upload.name)?;
                if let Some(path) = &upload.path {
                    parse_template(&location("upload.path"), path)?;
                }
                if let Some(content) = &upload.content {
                    parse_template(&location("upload.content"), content)?;
                }
            }
            StepAction::Download(download) => {
                parse_template(&location("download.name"), &download.name)?;
                if let Some(path) = &download.path {
                    parse_template(&location("download.path"), path)?;
                }
            }
        }
    }
    Ok(())
}
