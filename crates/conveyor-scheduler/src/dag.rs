//! Stage graph resolution.
//!
//! Jobs are nodes. A job with `needs` depends on exactly those jobs; a job
//! without `needs` depends on every job of every earlier stage.

use conveyor_core::pipeline::{Job, PipelineDefinition};
use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::EdgeRef;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DagError {
    #[error("Cycle detected in job dependencies")]
    CycleDetected,
    #[error("Job '{job}' needs unknown job '{need}'")]
    UnknownNeed { job: String, need: String },
    #[error("Job '{job}' needs '{need}', which is not in an earlier stage")]
    NeedNotInEarlierStage { job: String, need: String },
    #[error("Empty pipeline")]
    EmptyPipeline,
    #[error(transparent)]
    Definition(#[from] conveyor_core::Error),
}

impl From<DagError> for conveyor_core::Error {
    fn from(err: DagError) -> Self {
        match err {
            DagError::Definition(inner) => inner,
            other => conveyor_core::Error::PipelineValidation(other.to_string()),
        }
    }
}

/// Why one job waits for another.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeKind {
    /// Implicit ordering on an earlier stage.
    Stage,
    /// Explicit `needs` entry.
    Need { artifacts: bool, optional: bool },
}

/// A node in the stage graph.
#[derive(Debug, Clone)]
pub struct DagNode {
    pub stage_index: usize,
    pub job: Job,
}

#[derive(Debug, Clone)]
pub struct Dependency<'a> {
    pub job: &'a Job,
    pub kind: EdgeKind,
}

/// Directed acyclic graph of the jobs of one pipeline.
#[derive(Debug, Clone)]
pub struct StageGraph {
    stages: Vec<String>,
    graph: DiGraph<DagNode, EdgeKind>,
    name_to_index: HashMap<String, NodeIndex>,
    order: Vec<NodeIndex>,
}

impl StageGraph {
    /// Validate a definition and build its graph.
    pub fn build(definition: &PipelineDefinition) -> Result<Self, DagError> {
        let jobs = definition.validate()?;
        if jobs.is_empty() {
            return Err(DagError::EmptyPipeline);
        }

        let mut graph = DiGraph::new();
        let mut name_to_index = HashMap::new();

        for job in jobs {
            let stage_index = definition
                .stage_index(&job.stage)
                .ok_or_else(|| conveyor_core::Error::PipelineValidation(job.stage.clone()))?;
            let name = job.name.clone();
            let idx = graph.add_node(DagNode { stage_index, job });
            name_to_index.insert(name, idx);
        }

        let nodes: Vec<NodeIndex> = graph.node_indices().collect();
        for &idx in &nodes {
            let node = &graph[idx];
            let stage_index = node.stage_index;
            let name = node.job.name.clone();

            match node.job.needs.clone() {
                Some(needs) => {
                    for need in needs {
                        let dep_idx = *name_to_index.get(&need.job).ok_or_else(|| {
                            DagError::UnknownNeed {
                                job: name.clone(),
                                need: need.job.clone(),
                            }
                        })?;
                        if graph[dep_idx].stage_index >= stage_index {
                            return Err(DagError::NeedNotInEarlierStage {
                                job: name.clone(),
                                need: need.job.clone(),
                            });
                        }
                        graph.add_edge(
                            dep_idx,
                            idx,
                            EdgeKind::Need {
                                artifacts: need.artifacts,
                                optional: need.optional,
                            },
                        );
                    }
                }
                None => {
                    for &other in &nodes {
                        if graph[other].stage_index < stage_index {
                            graph.add_edge(other, idx, EdgeKind::Stage);
                        }
                    }
                }
            }
        }

        let order = toposort(&graph, None).map_err(|_| DagError::CycleDetected)?;

        Ok(Self {
            stages: definition.stages.clone(),
            graph,
            name_to_index,
            order,
        })
    }

    pub fn stages(&self) -> &[String] {
        &self.stages
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn job(&self, name: &str) -> Option<&Job> {
        self.name_to_index.get(name).map(|&idx| &self.graph[idx].job)
    }

    /// Jobs in declaration order.
    pub fn jobs(&self) -> Vec<&Job> {
        self.graph.node_indices().map(|idx| &self.graph[idx].job).collect()
    }

    /// Jobs in dependency order.
    pub fn topological_order(&self) -> Vec<&Job> {
        self.order.iter().map(|&idx| &self.graph[idx].job).collect()
    }

    /// Jobs of a stage, in declaration order.
    pub fn jobs_in_stage(&self, stage: &str) -> Vec<&Job> {
        self.graph
            .node_indices()
            .map(|idx| &self.graph[idx].job)
            .filter(|job| job.stage == stage)
            .collect()
    }

    /// Jobs that must be terminal before `name` may start.
    pub fn dependencies(&self, name: &str) -> Vec<Dependency<'_>> {
        self.edges(name, Direction::Incoming)
    }

    /// Jobs waiting on `name`.
    pub fn dependents(&self, name: &str) -> Vec<Dependency<'_>> {
        self.edges(name, Direction::Outgoing)
    }

    fn edges(&self, name: &str, direction: Direction) -> Vec<Dependency<'_>> {
        let Some(&idx) = self.name_to_index.get(name) else {
            return Vec::new();
        };
        let mut deps: Vec<(NodeIndex, Dependency<'_>)> = self
            .graph
            .edges_directed(idx, direction)
            .map(|edge| {
                let other = match direction {
                    Direction::Incoming => edge.source(),
                    Direction::Outgoing => edge.target(),
                };
                (
                    other,
                    Dependency {
                        job: &self.graph[other].job,
                        kind: *edge.weight(),
                    },
                )
            })
            .collect();
        deps.sort_by_key(|(other, _)| other.index());
        deps.into_iter().map(|(_, dep)| dep).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn definition(jobs: &str) -> PipelineDefinition {
        let yaml = format!("name: test\nstages: [build, test, deploy]\njobs:\n{jobs}");
        PipelineDefinition::from_yaml(&yaml).unwrap()
    }

    fn names(deps: Vec<Dependency<'_>>) -> Vec<String> {
        deps.into_iter().map(|d| d.job.name.clone()).collect()
    }

    const JOBS: &str = r#"
  - { name: compile, stage: build, script: [make] }
  - { name: lint, stage: build, script: [make lint] }
  - { name: unit, stage: test, script: [make test] }
  - { name: deploy, stage: deploy, script: [./deploy.sh], needs: [compile] }
"#;

    #[test]
    fn test_implicit_stage_edges() {
        let graph = StageGraph::build(&definition(JOBS)).unwrap();
        assert_eq!(names(graph.dependencies("unit")), vec!["compile", "lint"]);
        assert!(graph.dependencies("compile").is_empty());
        assert_eq!(graph.dependencies("unit")[0].kind, EdgeKind::Stage);
    }

    #[test]
    fn test_needs_replace_stage_edges() {
        let graph = StageGraph::build(&definition(JOBS)).unwrap();
        let deps = graph.dependencies("deploy");
        assert_eq!(names(deps.clone()), vec!["compile"]);
        assert_eq!(
            deps[0].kind,
            EdgeKind::Need {
                artifacts: true,
                optional: false
            }
        );
        assert_eq!(names(graph.dependents("compile")), vec!["unit", "deploy"]);
    }

    #[test]
    fn test_topological_order() {
        let graph = StageGraph::build(&definition(JOBS)).unwrap();
        let order: Vec<_> = graph.topological_order().iter().map(|j| j.name.clone()).collect();
        let pos = |n: &str| order.iter().position(|o| o == n).unwrap();
        assert!(pos("compile") < pos("unit"));
        assert!(pos("lint") < pos("unit"));
        assert!(pos("compile") < pos("deploy"));
        assert_eq!(graph.jobs_in_stage("build").len(), 2);
    }

    #[test]
    fn test_unknown_need() {
        let jobs = r#"
  - { name: compile, stage: build, script: [make] }
  - { name: deploy, stage: deploy, script: [x], needs: [package] }
"#;
        assert!(matches!(
            StageGraph::build(&definition(jobs)),
            Err(DagError::UnknownNeed { .. })
        ));
    }

    #[test]
    fn test_need_on_same_stage() {
        let jobs = r#"
  - { name: compile, stage: build, script: [make] }
  - { name: lint, stage: build, script: [x], needs: [compile] }
"#;
        assert!(matches!(
            StageGraph::build(&definition(jobs)),
            Err(DagError::NeedNotInEarlierStage { .. })
        ));
    }

    #[test]
    fn test_definition_errors_pass_through() {
        let jobs = r#"
  - { name: compile, stage: package, script: [make] }
"#;
        let err = StageGraph::build(&definition(jobs)).unwrap_err();
        assert!(matches!(err, DagError::Definition(_)));
        assert!(matches!(
            conveyor_core::Error::from(err),
            conveyor_core::Error::PipelineValidation(_)
        ));
    }

    #[test]
    fn test_empty_needs_has_no_dependencies() {
        let jobs = r#"
  - { name: compile, stage: build, script: [make] }
  - { name: docs, stage: deploy, script: [x], needs: [] }
"#;
        let graph = StageGraph::build(&definition(jobs)).unwrap();
        assert!(graph.dependencies("docs").is_empty());
    }
}
