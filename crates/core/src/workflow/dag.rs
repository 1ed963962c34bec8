use crate::error::DagError;
use crate::step::StepDescriptor;
use crate::types::DagSpec;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::{Bfs, Reversed, Topo};
use petgraph::Direction;
use std::collections::HashMap;
use std::sync::Arc;

/// Dependency graph of the steps in a DAG
///
/// Edges point from a dependency to its dependent. Node indices follow the
/// declaration order of the steps.
pub struct StepGraph {
    graph: DiGraph<Arc<StepDescriptor>, ()>,
    step_indices: HashMap<String, NodeIndex>,
}

impl StepGraph {
    /// Build and validate the graph for a DAG
    pub fn build(dag: &DagSpec) -> Result<Self, DagError> {
        let mut graph = DiGraph::new();
        let mut step_indices = HashMap::new();

        for step in &dag.steps {
            step.validate()?;
            if step_indices.contains_key(&step.name) {
                return Err(DagError::DuplicateStep(step.name.clone()));
            }
            let node = graph.add_node(step.clone());
            step_indices.insert(step.name.clone(), node);
        }

        for step in &dag.steps {
            let step_idx = step_indices[&step.name];
            for dep in &step.depends {
                let dep_idx =
                    step_indices
                        .get(dep)
                        .ok_or_else(|| DagError::UnknownDependency {
                            step: step.name.clone(),
                            dependency: dep.clone(),
                        })?;

                // Repeated entries in `depends` collapse into one edge
                graph.update_edge(*dep_idx, step_idx, ());
            }
        }

        if petgraph::algo::is_cyclic_directed(&graph) {
            return Err(DagError::Cycle);
        }

        Ok(Self {
            graph,
            step_indices,
        })
    }

    pub fn len(&self) -> usize {
        self.graph.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node_indices(&self) -> impl Iterator<Item = NodeIndex> + '_ {
        self.graph.node_indices()
    }

    pub fn step(&self, node: NodeIndex) -> &Arc<StepDescriptor> {
        &self.graph[node]
    }

    pub fn index_of(&self, name: &str) -> Option<NodeIndex> {
        self.step_indices.get(name).copied()
    }

    /// Get steps in topological order (dependencies first)
    pub fn topological_order(&self) -> Vec<Arc<StepDescriptor>> {
        let mut topo = Topo::new(&self.graph);
        let mut steps = Vec::new();

        while let Some(node) = topo.next(&self.graph) {
            steps.push(self.graph[node].clone());
        }

        steps
    }

    /// Node indices of the direct dependencies of a node
    pub fn dependency_nodes(&self, node: NodeIndex) -> Vec<NodeIndex> {
        self.graph
            .neighbors_directed(node, Direction::Incoming)
            .collect()
    }

    /// Get the direct dependencies of a step
    pub fn dependencies(&self, name: &str) -> Option<Vec<String>> {
        let node = self.index_of(name)?;
        Some(
            self.dependency_nodes(node)
                .into_iter()
                .map(|n| self.graph[n].name.clone())
                .collect(),
        )
    }

    /// Get the steps that directly depend on the given step
    pub fn dependents(&self, name: &str) -> Option<Vec<String>> {
        let node = self.index_of(name)?;
        Some(
            self.graph
                .neighbors_directed(node, Direction::Outgoing)
                .map(|n| self.graph[n].name.clone())
                .collect(),
        )
    }

    /// Get every step downstream of the given step
    pub fn transitive_dependents(&self, name: &str) -> Option<Vec<String>> {
        let start = self.index_of(name)?;
        let mut bfs = Bfs::new(&self.graph, start);
        let mut names = Vec::new();
        while let Some(node) = bfs.next(&self.graph) {
            if node != start {
                names.push(self.graph[node].name.clone());
            }
        }
        Some(names)
    }

    /// Get every step upstream of the given step
    pub fn transitive_dependencies(&self, name: &str) -> Option<Vec<String>> {
        let start = self.index_of(name)?;
        let reversed = Reversed(&self.graph);
        let mut bfs = Bfs::new(reversed, start);
        let mut names = Vec::new();
        while let Some(node) = bfs.next(reversed) {
            if node != start {
                names.push(self.graph[node].name.clone());
            }
        }
        Some(names)
    }

    /// Get all steps with no dependencies (can start immediately)
    pub fn entry_steps(&self) -> Vec<Arc<StepDescriptor>> {
        self.graph
            .node_indices()
            .filter(|&n| {
                self.graph
                    .neighbors_directed(n, Direction::Incoming)
                    .next()
                    .is_none()
            })
            .map(|n| self.graph[n].clone())
            .collect()
    }
}
