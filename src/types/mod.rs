//! Core domain types: stack specifications, runs and per-stack records.

pub mod ids;
pub mod run;
pub mod spec;

pub use ids::{BundleId, RunId, StackName, TemplateRef};
pub use run::{
    FailureCause, InvalidTransition, Run, RunKind, RunState, StackRunRecord, StackState,
};
pub use spec::StackSpec;
