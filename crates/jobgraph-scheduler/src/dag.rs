//! DAG resolution for job dependencies.

use jobgraph_core::ConfigurationError;
use jobgraph_core::pipeline::RunDefinition;
use petgraph::Direction;
use petgraph::algo::{tarjan_scc, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::HashMap;

/// Directed acyclic graph of job ids; an edge points from a dependency to its dependent.
#[derive(Debug, Clone)]
pub struct JobDag {
    graph: DiGraph<String, ()>,
    name_to_index: HashMap<String, NodeIndex>,
}

impl JobDag {
    /// Jobs with no dependencies.
    pub fn roots(&self) -> Vec<&str> {
        self.graph
            .node_indices()
            .filter(|&idx| {
                self.graph
                    .neighbors_directed(idx, Direction::Incoming)
                    .count()
                    == 0
            })
            .filter_map(|idx| self.graph.node_weight(idx).map(String::as_str))
            .collect()
    }

    /// Jobs that depend directly on `job`.
    pub fn successors(&self, job: &str) -> Vec<&str> {
        self.neighbors(job, Direction::Outgoing)
    }

    /// Jobs that `job` depends on directly.
    pub fn predecessors(&self, job: &str) -> Vec<&str> {
        self.neighbors(job, Direction::Incoming)
    }

    fn neighbors(&self, job: &str, direction: Direction) -> Vec<&str> {
        self.name_to_index
            .get(job)
            .map(|&idx| {
                self.graph
                    .neighbors_directed(idx, direction)
                    .filter_map(|n| self.graph.node_weight(n).map(String::as_str))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Jobs in dependency order. Ties keep definition order.
    pub fn topological_order(&self) -> Vec<&str> {
        // Kahn's algorithm over node indices, which follow definition order.
        let mut in_degree: Vec<usize> = self
            .graph
            .node_indices()
            .map(|idx| self.graph.neighbors_directed(idx, Direction::Incoming).count())
            .collect();
        let mut order = Vec::with_capacity(in_degree.len());
        let mut emitted = vec![false; in_degree.len()];
        while order.len() < in_degree.len() {
            let Some(next) = self
                .graph
                .node_indices()
                .find(|idx| !emitted[idx.index()] && in_degree[idx.index()] == 0)
            else {
                break;
            };
            emitted[next.index()] = true;
            for succ in self.graph.neighbors_directed(next, Direction::Outgoing) {
                in_degree[succ.index()] -= 1;
            }
            order.push(self.graph[next].as_str());
        }
        order
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn contains(&self, job: &str) -> bool {
        self.name_to_index.contains_key(job)
    }
}

/// Builder for constructing job DAGs.
pub struct DagBuilder;

impl DagBuilder {
    pub fn new() -> Self {
        Self
    }

    /// Build a DAG from a run definition, rejecting unknown, self and cyclic dependencies.
    pub fn build(&self, definition: &RunDefinition) -> Result<JobDag, ConfigurationError> {
        if definition.jobs.is_empty() {
            return Err(ConfigurationError::EmptyRun);
        }

        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        for id in definition.jobs.keys() {
            let idx = graph.add_node(id.clone());
            name_to_index.insert(id.clone(), idx);
        }

        for (id, job) in &definition.jobs {
            let job_idx = name_to_index[id];
            for dep in &job.needs {
                if dep == id {
                    return Err(ConfigurationError::SelfDependency { job: id.clone() });
                }
                let dep_idx = name_to_index.get(dep).ok_or_else(|| {
                    ConfigurationError::UnknownDependency {
                        job: id.clone(),
                        dependency: dep.clone(),
                    }
                })?;
                graph.update_edge(*dep_idx, job_idx, ());
            }
        }

        if toposort(&graph, None).is_err() {
            return Err(ConfigurationError::CyclicDependency {
                cycle: find_cycle(&graph),
            });
        }

        Ok(JobDag {
            graph,
            name_to_index,
        })
    }
}

impl Default for DagBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Members of the first non-trivial strongly connected component.
fn find_cycle(graph: &DiGraph<String, ()>) -> Vec<String> {
    let mut cycle: Vec<String> = tarjan_scc(graph)
        .into_iter()
        .find(|component| component.len() > 1)
        .map(|component| component.iter().map(|&idx| graph[idx].clone()).collect())
        .unwrap_or_default();
    cycle.sort();
    cycle
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobgraph_core::pipeline::JobSpec;

    fn definition(jobs: Vec<JobSpec>) -> RunDefinition {
        jobs.into_iter()
            .fold(RunDefinition::new("test"), |def, job| def.job(job))
    }

    #[test]
    fn test_linear_dag() {
        let def = definition(vec![
            JobSpec::new("build"),
            JobSpec::new("test").needs(&["build"]),
            JobSpec::new("deploy").needs(&["test"]),
        ]);

        let dag = DagBuilder::new().build(&def).unwrap();

        assert_eq!(dag.roots(), vec!["build"]);
        assert_eq!(dag.topological_order(), vec!["build", "test", "deploy"]);
        assert_eq!(dag.predecessors("deploy"), vec!["test"]);
    }

    #[test]
    fn test_parallel_dag() {
        let def = definition(vec![
            JobSpec::new("build"),
            JobSpec::new("test-unit").needs(&["build"]),
            JobSpec::new("test-integration").needs(&["build"]),
            JobSpec::new("deploy").needs(&["test-unit", "test-integration"]),
        ]);

        let dag = DagBuilder::new().build(&def).unwrap();

        assert_eq!(dag.successors("build").len(), 2);
        assert_eq!(dag.predecessors("deploy").len(), 2);
        assert_eq!(dag.topological_order().last(), Some(&"deploy"));
    }

    #[test]
    fn test_order_respects_dependencies_over_definition_order() {
        let def = definition(vec![
            JobSpec::new("deploy").needs(&["build"]),
            JobSpec::new("build"),
        ]);
        let dag = DagBuilder::new().build(&def).unwrap();
        assert_eq!(dag.topological_order(), vec!["build", "deploy"]);
    }

    #[test]
    fn test_cycle_detected() {
        let def = definition(vec![
            JobSpec::new("a").needs(&["c"]),
            JobSpec::new("b").needs(&["a"]),
            JobSpec::new("c").needs(&["b"]),
            JobSpec::new("d"),
        ]);

        let err = DagBuilder::new().build(&def).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::CyclicDependency {
                cycle: vec!["a".into(), "b".into(), "c".into()]
            }
        );
    }

    #[test]
    fn test_unknown_and_self_dependency() {
        let unknown = definition(vec![JobSpec::new("a").needs(&["ghost"])]);
        assert!(matches!(
            DagBuilder::new().build(&unknown),
            Err(ConfigurationError::UnknownDependency { .. })
        ));

        let selfish = definition(vec![JobSpec::new("a").needs(&["a"])]);
        assert_eq!(
            DagBuilder::new().build(&selfish).unwrap_err(),
            ConfigurationError::SelfDependency { job: "a".into() }
        );
    }

    #[test]
    fn test_empty_run() {
        assert_eq!(
            DagBuilder::new().build(&RunDefinition::new("empty")).unwrap_err(),
            ConfigurationError::EmptyRun
        );
    }
}
