//! Run and per-stack record types.
//!
//! A [`Run`] is one orchestrated deployment (or teardown) of a plan. It holds
//! one [`StackRunRecord`] per planned stack, in plan order. Records only move
//! along the edges allowed by [`StackState::can_transition_to`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::ids::{BundleId, RunId, StackName};
use super::spec::StackSpec;

/// Lifecycle state of one stack within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StackState {
    /// Not attempted yet.
    Pending,
    Deploying,
    Deployed,
    DeployFailed,
    RollingBack,
    RolledBack,
    RollbackFailed,

    // Teardown runs only.
    Deleting,
    Deleted,
    DeleteFailed,
    /// Skipped by teardown because the stack is marked to be kept.
    Retained,
}

impl StackState {
    pub fn name(&self) -> &'static str {
        match self {
            StackState::Pending => "PENDING",
            StackState::Deploying => "DEPLOYING",
            StackState::Deployed => "DEPLOYED",
            StackState::DeployFailed => "DEPLOY_FAILED",
            StackState::RollingBack => "ROLLING_BACK",
            StackState::RolledBack => "ROLLED_BACK",
            StackState::RollbackFailed => "ROLLBACK_FAILED",
            StackState::Deleting => "DELETING",
            StackState::Deleted => "DELETED",
            StackState::DeleteFailed => "DELETE_FAILED",
            StackState::Retained => "RETAINED",
        }
    }

    /// Checks if a transition from this state to the target state is valid.
    ///
    /// Valid transitions:
    /// - Pending -> Deploying -> Deployed | DeployFailed
    /// - Deployed -> RollingBack -> RolledBack | RollbackFailed
    /// - Pending -> Deleting -> Deleted | DeleteFailed
    /// - Pending -> Retained
    pub fn can_transition_to(&self, target: StackState) -> bool {
        use StackState::*;
        matches!(
            (self, target),
            (Pending, Deploying)
                | (Deploying, Deployed)
                | (Deploying, DeployFailed)
                | (Deployed, RollingBack)
                | (RollingBack, RolledBack)
                | (RollingBack, RollbackFailed)
                | (Pending, Deleting)
                | (Deleting, Deleted)
                | (Deleting, DeleteFailed)
                | (Pending, Retained)
        )
    }

    /// Returns true while a backend operation is outstanding for the stack.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            StackState::Deploying | StackState::RollingBack | StackState::Deleting
        )
    }

    /// Returns true for states that require a recorded [`FailureCause`].
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            StackState::DeployFailed | StackState::RollbackFailed | StackState::DeleteFailed
        )
    }
}

impl fmt::Display for StackState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Why a stack operation failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureCause {
    /// The backend refused a mutating call outright.
    Rejected { message: String },

    /// The backend reported a failed terminal status.
    BackendFailure {
        status: String,
        reason: Option<String>,
    },

    /// The operation did not reach a terminal status in time.
    Timeout { waited_secs: u64 },

    /// Transient backend errors persisted past the retry budget.
    RetriesExhausted { attempts: u32, message: String },

    /// The operator cancelled the operation.
    Cancelled,

    /// Rollback could not determine a state to restore.
    NoKnownGoodState,

    /// The stack vanished from the backend while being deployed.
    StackMissing,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::Rejected { message } => write!(f, "rejected by backend: {}", message),
            FailureCause::BackendFailure { status, reason } => match reason {
                Some(reason) => write!(f, "backend reported {}: {}", status, reason),
                None => write!(f, "backend reported {}", status),
            },
            FailureCause::Timeout { waited_secs } => {
                write!(f, "timed out after {}s", waited_secs)
            }
            FailureCause::RetriesExhausted { attempts, message } => {
                write!(f, "gave up after {} attempts: {}", attempts, message)
            }
            FailureCause::Cancelled => f.write_str("cancelled by operator"),
            FailureCause::NoKnownGoodState => {
                f.write_str("no known-good state to restore and the stack predates this run")
            }
            FailureCause::StackMissing => f.write_str("stack disappeared from the backend"),
        }
    }
}

/// A transition that [`StackState::can_transition_to`] rejects.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid transition for stack {stack}: {from} -> {to}")]
pub struct InvalidTransition {
    pub stack: StackName,
    pub from: StackState,
    pub to: StackState,
}

/// Per-stack state within one run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackRunRecord {
    pub stack: StackName,

    /// Physical backend name.
    pub stack_name: String,

    pub state: StackState,

    /// When the first backend operation for this stack began.
    pub started_at: Option<DateTime<Utc>>,

    pub updated_at: DateTime<Utc>,

    /// When the stack last settled in a non-in-flight state.
    pub finished_at: Option<DateTime<Utc>>,

    pub last_error: Option<FailureCause>,

    /// Backend-assigned identifier (e.g. a CloudFormation stack ARN).
    pub backend_id: Option<String>,

    #[serde(default)]
    pub outputs: BTreeMap<String, String>,

    /// Whether the stack existed before this run touched it. `None` until observed.
    pub existed_before: Option<bool>,

    /// Whether this run issued a mutating call against the stack.
    #[serde(default)]
    pub mutated: bool,
}

impl StackRunRecord {
    pub fn new(spec: &StackSpec) -> Self {
        StackRunRecord {
            stack: spec.name.clone(),
            stack_name: spec.stack_name.clone(),
            state: StackState::Pending,
            started_at: None,
            updated_at: Utc::now(),
            finished_at: None,
            last_error: None,
            backend_id: None,
            outputs: BTreeMap::new(),
            existed_before: None,
            mutated: false,
        }
    }

    /// Moves the record to `to`, stamping timestamps.
    pub fn transition(&mut self, to: StackState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(to) {
            return Err(InvalidTransition {
                stack: self.stack.clone(),
                from: self.state,
                to,
            });
        }

        let now = Utc::now();
        self.state = to;
        self.updated_at = now;
        if to.is_in_flight() {
            self.started_at.get_or_insert(now);
            self.finished_at = None;
        } else {
            self.finished_at = Some(now);
        }
        Ok(())
    }

    /// True for a failed deploy that may have left the backend mid-operation:
    /// the run issued a mutating call, then stopped waiting before the
    /// backend reported an outcome.
    pub fn is_unsettled(&self) -> bool {
        self.state == StackState::DeployFailed
            && self.mutated
            && matches!(
                self.last_error,
                Some(
                    FailureCause::Timeout { .. }
                        | FailureCause::Cancelled
                        | FailureCause::RetriesExhausted { .. }
                )
            )
    }

    /// Moves the record to a failure state and records the cause.
    pub fn fail(&mut self, to: StackState, cause: FailureCause) -> Result<(), InvalidTransition> {
        debug_assert!(to.is_failure());
        self.transition(to)?;
        self.last_error = Some(cause);
        Ok(())
    }
}

/// What a run does to its stacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunKind {
    Deploy,
    Teardown,
}

impl fmt::Display for RunKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunKind::Deploy => f.write_str("deploy"),
            RunKind::Teardown => f.write_str("teardown"),
        }
    }
}

/// Overall state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunState {
    InProgress,

    /// Every stack reached its goal state.
    Succeeded,

    /// A stack failed and every stack deployed earlier was rolled back.
    FailedRolledBack,

    /// A stack failed and at least one stack could not be rolled back.
    /// Requires manual intervention.
    FailedRollbackIncomplete,

    /// A teardown stopped at a stack it could not delete.
    TeardownIncomplete,
}

impl RunState {
    pub fn name(&self) -> &'static str {
        match self {
            RunState::InProgress => "IN_PROGRESS",
            RunState::Succeeded => "SUCCEEDED",
            RunState::FailedRolledBack => "FAILED_ROLLED_BACK",
            RunState::FailedRollbackIncomplete => "FAILED_ROLLBACK_INCOMPLETE",
            RunState::TeardownIncomplete => "TEARDOWN_INCOMPLETE",
        }
    }

    pub fn is_finished(&self) -> bool {
        !matches!(self, RunState::InProgress)
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One orchestrated run over a plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub kind: RunKind,
    pub bundle: Option<BundleId>,
    pub state: RunState,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,

    /// One record per planned stack, in plan order.
    pub records: Vec<StackRunRecord>,

    /// The stack whose failure stopped forward progress.
    pub failed_stack: Option<StackName>,

    /// Whether the operator aborted the run.
    #[serde(default)]
    pub aborted: bool,
}

impl Run {
    /// Creates an in-progress run with every stack pending.
    pub fn new(id: RunId, kind: RunKind, bundle: Option<BundleId>, specs: &[StackSpec]) -> Self {
        Run {
            id,
            kind,
            bundle,
            state: RunState::InProgress,
            started_at: Utc::now(),
            finished_at: None,
            records: specs.iter().map(StackRunRecord::new).collect(),
            failed_stack: None,
            aborted: false,
        }
    }

    pub fn record(&self, stack: &StackName) -> Option<&StackRunRecord> {
        self.records.iter().find(|r| &r.stack == stack)
    }

    pub fn record_mut(&mut self, stack: &StackName) -> Option<&mut StackRunRecord> {
        self.records.iter_mut().find(|r| &r.stack == stack)
    }

    /// Stacks currently `DEPLOYED`, in plan order.
    pub fn deployed(&self) -> impl Iterator<Item = &StackName> {
        self.records
            .iter()
            .filter(|r| r.state == StackState::Deployed)
            .map(|r| &r.stack)
    }

    /// Stacks whose backend state may not match any known-good state.
    ///
    /// For a failed or interrupted run these are stacks still `DEPLOYED`,
    /// stacks whose rollback or deletion failed, stacks left mid-operation,
    /// and failed deploys the backend may still be working on (see
    /// [`StackRunRecord::is_unsettled`]). A succeeded run has none.
    pub fn inconsistent_stacks(&self) -> Vec<StackName> {
        if self.state == RunState::Succeeded {
            return Vec::new();
        }
        self.records
            .iter()
            .filter(|r| {
                r.state.is_in_flight()
                    || r.is_unsettled()
                    || matches!(
                        r.state,
                        StackState::Deployed | StackState::RollbackFailed | StackState::DeleteFailed
                    )
            })
            .map(|r| r.stack.clone())
            .collect()
    }

    /// Sets the start time of the run and of every record not yet touched.
    pub fn stamp_start(&mut self, ts: DateTime<Utc>) {
        self.started_at = ts;
        for record in self.records.iter_mut().filter(|r| r.state == StackState::Pending) {
            record.updated_at = ts;
        }
    }

    /// Marks the run finished.
    pub fn finish(&mut self, state: RunState) {
        self.state = state;
        self.finished_at = Some(Utc::now());
    }

    pub fn is_success(&self) -> bool {
        self.state == RunState::Succeeded
    }
}
