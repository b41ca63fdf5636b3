//! Dependency graph and deployment planning.
//!
//! - [`build`] validates declared stacks into a [`DependencyGraph`]
//! - [`plan`] orders the graph for deployment
//!
//! Both are pure: planning errors surface before any backend call is made.

pub mod build;
pub mod plan;

use thiserror::Error;

use crate::types::StackName;

pub use build::{DependencyGraph, build};
pub use plan::{DeploymentPlan, plan};

/// Errors detected while building or planning the stack graph.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GraphError {
    /// Two stacks were declared with the same name.
    #[error("stack {0} is declared more than once")]
    DuplicateStack(StackName),

    /// A `depends_on` entry names no declared stack.
    #[error("stack {stack} depends on unknown stack {dependency}")]
    UnknownDependency {
        stack: StackName,
        dependency: StackName,
    },

    /// The dependencies form a cycle.
    #[error("dependency cycle: {}", format_cycle(.cycle))]
    CyclicDependency { cycle: Vec<StackName> },

    /// A requested target is not in the plan.
    #[error("unknown stack {0}")]
    UnknownStack(StackName),
}

/// Result type for graph operations.
pub type Result<T> = std::result::Result<T, GraphError>;

fn format_cycle(cycle: &[StackName]) -> String {
    let mut parts: Vec<&str> = cycle.iter().map(|n| n.as_str()).collect();
    if let Some(first) = parts.first().copied() {
        parts.push(first);
    }
    parts.join(" -> ")
}
