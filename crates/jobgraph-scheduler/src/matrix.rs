//! Matrix expansion for parallel job instances.

use jobgraph_core::ConfigurationError;
use jobgraph_core::pipeline::MatrixSpec;
use jobgraph_core::run::MatrixAssignment;

/// Expander for matrix configurations.
pub struct MatrixExpander;

impl MatrixExpander {
    pub fn new() -> Self {
        Self
    }

    /// Reject matrices that cannot be expanded faithfully.
    pub fn validate(&self, job: &str, matrix: &MatrixSpec) -> Result<(), ConfigurationError> {
        if let Some((axis, _)) = matrix.axes.iter().find(|(_, values)| values.is_empty()) {
            return Err(ConfigurationError::EmptyMatrixAxis {
                job: job.to_string(),
                axis: axis.clone(),
            });
        }
        for exclusion in &matrix.exclude {
            if let Some(axis) = exclusion.keys().find(|k| !matrix.axes.contains_key(*k)) {
                return Err(ConfigurationError::UndeclaredMatrixAxis {
                    job: job.to_string(),
                    axis: axis.clone(),
                });
            }
        }
        Ok(())
    }

    /// Expand into concrete assignments.
    ///
    /// Order is the cartesian product in axis declaration order, first axis
    /// most significant. Exclusions remove every combination that contains
    /// them; includes are appended afterwards.
    pub fn expand(&self, matrix: &MatrixSpec) -> Vec<MatrixAssignment> {
        let mut combinations = self.generate_combinations(matrix);

        combinations.retain(|combo| !matrix.exclude.iter().any(|ex| combo.contains(ex)));

        for include in &matrix.include {
            let assignment = MatrixAssignment::from(include.clone());
            if !combinations.contains(&assignment) {
                combinations.push(assignment);
            }
        }

        combinations
    }

    fn generate_combinations(&self, matrix: &MatrixSpec) -> Vec<MatrixAssignment> {
        let mut result = vec![MatrixAssignment::new()];

        for (axis, values) in &matrix.axes {
            let mut next = Vec::with_capacity(result.len() * values.len());
            for combo in &result {
                for value in values {
                    let mut extended = combo.clone();
                    extended.insert(axis.clone(), value.clone());
                    next.push(extended);
                }
            }
            result = next;
        }

        result
    }
}

impl Default for MatrixExpander {
    fn default() -> Self {
        Self::new()
    }
}
