//! stackline - dependency-ordered deployment of infrastructure stacks with
//! automatic rollback.
//!
//! The library plans an application's stacks from their declared
//! dependencies, deploys them one at a time through a [`backend::StackBackend`],
//! journals every transition to a durable [`ledger`], and rolls back the
//! stacks a failed run deployed.

pub mod backend;
pub mod bundle;
pub mod config;
pub mod driver;
pub mod graph;
pub mod ledger;
pub mod orchestrator;
pub mod summary;
pub mod types;

#[cfg(test)]
pub(crate) mod test_utils;
