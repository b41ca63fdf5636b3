//! Deployment planning.
//!
//! A plan is a topological order of the dependency graph: for every edge
//! `A depends on B`, B precedes A. Among stacks that are ready at the same
//! time, the one declared first goes first, so the same declarations always
//! produce the same plan.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};

use super::build::{DependencyGraph, build};
use super::{GraphError, Result};
use crate::types::{Run, StackName, StackSpec, StackState};

/// An ordered list of stacks to deploy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeploymentPlan {
    stacks: Vec<StackSpec>,
}

/// Orders a validated graph for deployment (Kahn's algorithm).
pub fn plan(graph: &DependencyGraph) -> DeploymentPlan {
    let n = graph.len();
    let mut unmet: Vec<usize> = (0..n).map(|i| graph.dependency_indices(i).len()).collect();
    let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); n];
    for i in 0..n {
        for &d in graph.dependency_indices(i) {
            dependents[d].push(i);
        }
    }

    let mut ready: BinaryHeap<Reverse<usize>> = (0..n)
        .filter(|&i| unmet[i] == 0)
        .map(Reverse)
        .collect();
    let mut order = Vec::with_capacity(n);

    while let Some(Reverse(i)) = ready.pop() {
        order.push(i);
        for &j in &dependents[i] {
            unmet[j] -= 1;
            if unmet[j] == 0 {
                ready.push(Reverse(j));
            }
        }
    }

    // The graph is acyclic, so every stack becomes ready exactly once.
    debug_assert_eq!(order.len(), n);

    DeploymentPlan {
        stacks: order.into_iter().map(|i| graph.specs()[i].clone()).collect(),
    }
}

impl DeploymentPlan {
    /// Builds and plans declared stacks in one step.
    pub fn from_specs(specs: Vec<StackSpec>) -> Result<Self> {
        Ok(plan(&build(specs)?))
    }

    /// Stacks in deployment order.
    pub fn stacks(&self) -> &[StackSpec] {
        &self.stacks
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }

    pub fn names(&self) -> impl Iterator<Item = &StackName> {
        self.stacks.iter().map(|s| &s.name)
    }

    pub fn get(&self, name: &StackName) -> Option<&StackSpec> {
        self.stacks.iter().find(|s| &s.name == name)
    }

    pub fn position(&self, name: &StackName) -> Option<usize> {
        self.stacks.iter().position(|s| &s.name == name)
    }

    /// The order in which a failed run's stacks are rolled back.
    ///
    /// This is the reverse of the plan, restricted to stacks the run left in
    /// `DEPLOYED`. Stacks that were never attempted, or whose own deploy
    /// failed, are not part of it.
    pub fn rollback_order(&self, run: &Run) -> Vec<StackName> {
        self.stacks
            .iter()
            .rev()
            .filter(|s| run.record(&s.name).is_some_and(|r| r.state == StackState::Deployed))
            .map(|s| s.name.clone())
            .collect()
    }

    /// Stacks in teardown order (reverse of the plan).
    pub fn teardown_order(&self) -> impl Iterator<Item = &StackSpec> {
        self.stacks.iter().rev()
    }

    /// Groups stacks by topological level.
    ///
    /// Level 0 holds stacks without dependencies; every other stack sits one
    /// level above its deepest dependency. Stacks within a level keep plan
    /// order and do not depend on each other.
    pub fn levels(&self) -> Vec<Vec<StackName>> {
        let mut level_of: HashMap<&StackName, usize> = HashMap::with_capacity(self.len());
        let mut levels: Vec<Vec<StackName>> = Vec::new();

        for spec in &self.stacks {
            let level = spec
                .depends_on
                .iter()
                .filter_map(|d| level_of.get(d))
                .map(|l| l + 1)
                .max()
                .unwrap_or(0);
            level_of.insert(&spec.name, level);
            if levels.len() <= level {
                levels.resize_with(level + 1, Vec::new);
            }
            levels[level].push(spec.name.clone());
        }
        levels
    }

    /// The sub-plan that deploys `targets` together with everything they
    /// transitively depend on, in the original plan order.
    pub fn restrict(&self, targets: &[StackName]) -> Result<DeploymentPlan> {
        let mut keep: HashSet<&StackName> = HashSet::new();
        let mut stack: Vec<&StackName> = Vec::new();

        for target in targets {
            let spec = self
                .get(target)
                .ok_or_else(|| GraphError::UnknownStack(target.clone()))?;
            stack.push(&spec.name);
        }

        while let Some(name) = stack.pop() {
            if !keep.insert(name) {
                continue;
            }
            if let Some(spec) = self.get(name) {
                stack.extend(spec.depends_on.iter());
            }
        }

        Ok(DeploymentPlan {
            stacks: self
                .stacks
                .iter()
                .filter(|s| keep.contains(&s.name))
                .cloned()
                .collect(),
        })
    }

    /// The sub-plan that removes `targets` together with every stack that
    /// transitively depends on them, in the original plan order.
    pub fn restrict_dependents(&self, targets: &[StackName]) -> Result<DeploymentPlan> {
        let mut keep: HashSet<&StackName> = HashSet::new();
        for target in targets {
            let spec = self
                .get(target)
                .ok_or_else(|| GraphError::UnknownStack(target.clone()))?;
            keep.insert(&spec.name);
        }

        // Dependencies precede dependents, so one forward pass is enough.
        for spec in &self.stacks {
            if spec.depends_on.iter().any(|d| keep.contains(d)) {
                keep.insert(&spec.name);
            }
        }

        Ok(DeploymentPlan {
            stacks: self
                .stacks
                .iter()
                .filter(|s| keep.contains(&s.name))
                .cloned()
                .collect(),
        })
    }
}
