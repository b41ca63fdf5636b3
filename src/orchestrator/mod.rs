//! Run orchestration.
//!
//! A deploy run walks the plan in order and stops at the first stack that
//! fails. It then rolls back every stack it left `DEPLOYED`, newest first,
//! restoring each to its last known-good spec:
//!
//! ```text
//! deploy A -> deploy B -> deploy C (fails)
//!                              |
//!              roll back B <---+
//!              roll back A
//! ```
//!
//! The run ends in exactly one of:
//!
//! | state                        | meaning                                   |
//! |------------------------------|-------------------------------------------|
//! | `SUCCEEDED`                  | every stack deployed; release updated     |
//! | `FAILED_ROLLED_BACK`         | failed, every deployed stack restored     |
//! | `FAILED_ROLLBACK_INCOMPLETE` | failed, some stacks need manual attention |
//!
//! Teardown runs delete stacks in reverse plan order and end `SUCCEEDED` or
//! `TEARDOWN_INCOMPLETE`.

pub mod engine;


pub use engine::{Orchestrator, OrchestratorError, OrchestratorOptions, Result};
