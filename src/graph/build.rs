//! Dependency graph construction.
//!
//! Pure functions that turn declared stacks into a validated DAG. Nothing here
//! touches the backend.

use std::collections::{HashMap, HashSet};

use super::{GraphError, Result};
use crate::types::{StackName, StackSpec};

/// Validated dependency graph.
///
/// INVARIANT: acyclic, every dependency resolves to a declared stack, and
/// stack names are unique. Only [`build`] constructs one.
#[derive(Debug, Clone)]
pub struct DependencyGraph {
    /// Specs in declaration order.
    specs: Vec<StackSpec>,

    index: HashMap<StackName, usize>,

    /// `dependencies[i]` holds the indices stack `i` depends on, deduplicated,
    /// in the order first declared.
    dependencies: Vec<Vec<usize>>,
}

impl DependencyGraph {
    /// Specs in declaration order.
    pub fn specs(&self) -> &[StackSpec] {
        &self.specs
    }

    pub fn len(&self) -> usize {
        self.specs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.specs.is_empty()
    }

    pub fn get(&self, name: &StackName) -> Option<&StackSpec> {
        self.index.get(name).map(|&i| &self.specs[i])
    }

    /// Declaration index of a stack.
    pub fn position(&self, name: &StackName) -> Option<usize> {
        self.index.get(name).copied()
    }

    /// Direct dependencies of a stack, by declaration index.
    pub(crate) fn dependency_indices(&self, index: usize) -> &[usize] {
        &self.dependencies[index]
    }

    /// Direct dependencies of a stack.
    pub fn dependencies(&self, name: &StackName) -> impl Iterator<Item = &StackName> {
        self.index
            .get(name)
            .into_iter()
            .flat_map(|&i| self.dependencies[i].iter())
            .map(|&d| &self.specs[d].name)
    }
}

/// Builds a dependency graph from declared stacks.
///
/// # Errors
///
/// - `DuplicateStack`: two stacks share a name
/// - `UnknownDependency`: a `depends_on` entry names no declared stack
/// - `CyclicDependency`: the dependencies form a cycle
pub fn build(specs: Vec<StackSpec>) -> Result<DependencyGraph> {
    let mut index = HashMap::with_capacity(specs.len());
    for (i, spec) in specs.iter().enumerate() {
        if index.insert(spec.name.clone(), i).is_some() {
            return Err(GraphError::DuplicateStack(spec.name.clone()));
        }
    }

    let mut dependencies = Vec::with_capacity(specs.len());
    for spec in &specs {
        let mut seen = HashSet::new();
        let mut deps = Vec::with_capacity(spec.depends_on.len());
        for dependency in &spec.depends_on {
            let &d = index
                .get(dependency)
                .ok_or_else(|| GraphError::UnknownDependency {
                    stack: spec.name.clone(),
                    dependency: dependency.clone(),
                })?;
            if seen.insert(d) {
                deps.push(d);
            }
        }
        dependencies.push(deps);
    }

    if let Some(cycle) = detect_cycle(&dependencies) {
        return Err(GraphError::CyclicDependency {
            cycle: cycle.into_iter().map(|i| specs[i].name.clone()).collect(),
        });
    }

    Ok(DependencyGraph {
        specs,
        index,
        dependencies,
    })
}

/// Detects a cycle in the dependency edges.
///
/// Returns the stacks on the first cycle found, in traversal order, starting
/// with the stack the back edge points to. Roots and edges are visited in
/// declaration order, so the result is deterministic.
///
/// Uses depth-first search with three-color marking:
/// - White: not yet visited
/// - Gray: on the current DFS path
/// - Black: fully explored
///
/// An edge to a gray node closes a cycle.
fn detect_cycle(dependencies: &[Vec<usize>]) -> Option<Vec<usize>> {
    #[derive(Clone, Copy, PartialEq, Eq)]
    enum Color {
        White,
        Gray,
        Black,
    }

    fn dfs(
        node: usize,
        dependencies: &[Vec<usize>],
        colors: &mut [Color],
        path: &mut Vec<usize>,
    ) -> Option<Vec<usize>> {
        colors[node] = Color::Gray;
        path.push(node);

        for &dep in &dependencies[node] {
            match colors[dep] {
                Color::Gray => {
                    let pos = path.iter().position(|&p| p == dep)?;
                    return Some(path[pos..].to_vec());
                }
                Color::White => {
                    if let Some(cycle) = dfs(dep, dependencies, colors, path) {
                        return Some(cycle);
                    }
                }
                Color::Black => {}
            }
        }

        path.pop();
        colors[node] = Color::Black;
        None
    }

    let mut colors = vec![Color::White; dependencies.len()];
    for root in 0..dependencies.len() {
        if colors[root] == Color::White {
            let mut path = Vec::new();
            if let Some(cycle) = dfs(root, dependencies, &mut colors, &mut path) {
                return Some(cycle);
            }
        }
    }
    None
}
