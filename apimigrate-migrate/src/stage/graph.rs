//! Stage dependency graph.
//!
//! Nodes are stage indices into [`StagesConfig::stages`]; an edge runs from a
//! dependency to its dependent. The graph is validated once, at construction.

use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap};

use petgraph::Direction;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use petgraph::visit::Dfs;

use super::config::StagesConfig;
use crate::error::{MigrateResult, MigrationError};

/// Which part of the graph a command runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageSelection {
    /// First stage, in topological order.
    pub from: Option<String>,
    /// Last stage, in topological order.
    pub to: Option<String>,
    /// Run only this stage.
    pub stage: Option<String>,
}

impl StageSelection {
    /// Every stage.
    pub fn all() -> Self {
        Self::default()
    }

    /// A single stage.
    pub fn only(stage: impl Into<String>) -> Self {
        Self {
            stage: Some(stage.into()),
            ..Self::default()
        }
    }
}

/// Validated stage dependency graph.
#[derive(Debug, Clone)]
pub struct StageGraph {
    names: Vec<String>,
    index: HashMap<String, usize>,
    graph: DiGraphMap<usize, ()>,
    order: Vec<usize>,
}

impl StageGraph {
    /// Build the graph. Duplicate names, unknown dependencies or imports,
    /// and cycles are rejected.
    pub fn new(config: &StagesConfig) -> MigrateResult<Self> {
        let mut index = HashMap::new();
        let mut graph = DiGraphMap::new();
        for (i, stage) in config.stages.iter().enumerate() {
            if index.insert(stage.name.clone(), i).is_some() {
                return Err(MigrationError::DuplicateStage(stage.name.clone()));
            }
            graph.add_node(i);
        }

        for (i, stage) in config.stages.iter().enumerate() {
            for dep in &stage.depends_on {
                let &d = index.get(dep).ok_or_else(|| {
                    MigrationError::StageNotFound(format!("{dep} (dependency of {})", stage.name))
                })?;
                if d == i {
                    return Err(MigrationError::StageCycle(stage.name.clone()));
                }
                graph.add_edge(d, i, ());
            }
            for import in &stage.env_from_stages {
                if !index.contains_key(&import.stage) {
                    return Err(MigrationError::StageNotFound(format!(
                        "{} (env import of {})",
                        import.stage, stage.name
                    )));
                }
            }
        }

        if let Err(cycle) = toposort(&graph, None) {
            let name = config.stages[cycle.node_id()].name.clone();
            return Err(MigrationError::StageCycle(name));
        }

        let names = config.stages.iter().map(|s| s.name.clone()).collect();
        let order = stable_order(&graph, config.stages.len());
        Ok(Self {
            names,
            index,
            graph,
            order,
        })
    }

    /// Number of stages.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    /// Check if there are no stages.
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Stage name by index.
    pub fn name(&self, index: usize) -> &str {
        &self.names[index]
    }

    /// Stage index by name.
    pub fn index_of(&self, name: &str) -> MigrateResult<usize> {
        self.index
            .get(name)
            .copied()
            .ok_or_else(|| MigrationError::StageNotFound(name.to_string()))
    }

    /// All stage indices in topological order. Ties keep declaration order.
    pub fn order(&self) -> &[usize] {
        &self.order
    }

    /// Stage names in topological order.
    pub fn ordered_names(&self) -> Vec<&str> {
        self.order.iter().map(|&i| self.name(i)).collect()
    }

    /// Direct dependencies of a stage.
    pub fn dependencies(&self, index: usize) -> Vec<usize> {
        let mut deps: Vec<_> = self
            .graph
            .neighbors_directed(index, Direction::Incoming)
            .collect();
        deps.sort_unstable();
        deps
    }

    /// Every stage that depends on `index`, directly or not.
    pub fn transitive_dependents(&self, index: usize) -> BTreeSet<usize> {
        let mut found = BTreeSet::new();
        let mut dfs = Dfs::new(&self.graph, index);
        while let Some(node) = dfs.next(&self.graph) {
            if node != index {
                found.insert(node);
            }
        }
        found
    }

    /// Apply a selection, returning stage indices in topological order.
    pub fn select(&self, selection: &StageSelection) -> MigrateResult<Vec<usize>> {
        if let Some(stage) = &selection.stage {
            return Ok(vec![self.index_of(stage)?]);
        }

        let position = |name: &str| -> MigrateResult<usize> {
            let index = self.index_of(name)?;
            Ok(self
                .order
                .iter()
                .position(|&i| i == index)
                .unwrap_or_default())
        };
        let start = match &selection.from {
            Some(name) => position(name)?,
            None => 0,
        };
        let end = match &selection.to {
            Some(name) => position(name)?,
            None => self.order.len().saturating_sub(1),
        };
        if self.order.is_empty() || start > end {
            return Ok(Vec::new());
        }
        Ok(self.order[start..=end].to_vec())
    }

    /// Group selected stages into waves. A stage's wave is one past the
    /// deepest of its dependencies, so stages in one wave never depend on
    /// each other.
    pub fn waves(&self, selected: &[usize]) -> Vec<Vec<usize>> {
        let mut depth = vec![0usize; self.names.len()];
        for &node in &self.order {
            depth[node] = self
                .dependencies(node)
                .into_iter()
                .map(|d| depth[d] + 1)
                .max()
                .unwrap_or(0);
        }

        let mut waves: Vec<Vec<usize>> = Vec::new();
        for &node in selected {
            let level = depth[node];
            if waves.len() <= level {
                waves.resize_with(level + 1, Vec::new);
            }
            waves[level].push(node);
        }
        waves.retain(|w| !w.is_empty());
        waves
    }
}

/// Kahn's algorithm, always taking the lowest declared index that is ready.
fn stable_order(graph: &DiGraphMap<usize, ()>, count: usize) -> Vec<usize> {
    let mut indegree: Vec<usize> = (0..count)
        .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
        .collect();
    let mut ready: BinaryHeap<Reverse<usize>> = (0..count)
        .filter(|&n| indegree[n] == 0)
        .map(Reverse)
        .collect();

    let mut order = Vec::with_capacity(count);
    while let Some(Reverse(node)) = ready.pop() {
        order.push(node);
        for next in graph.neighbors_directed(node, Direction::Outgoing) {
            indegree[next] -= 1;
            if indegree[next] == 0 {
                ready.push(Reverse(next));
            }
        }
    }
    order
}
