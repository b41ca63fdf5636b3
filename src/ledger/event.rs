//! Ledger event types.
//!
//! Each run has its own JSON Lines log. Every line is one [`RunEvent`] with a
//! per-run sequence number and a UTC timestamp.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{BundleId, RunId, RunKind, RunState, StackName, StackRunRecord, StackSpec};

/// One line of a run log.
///
/// The payload is flattened into the event object:
/// ```json
/// {"seq":3,"ts":"2024-01-15T10:00:00Z","type":"stack_transition","record":{...}}
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunEvent {
    pub seq: u64,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub payload: RunEventPayload,
}

impl RunEvent {
    pub fn new(seq: u64, payload: RunEventPayload) -> Self {
        RunEvent {
            seq,
            ts: Utc::now(),
            payload,
        }
    }

    /// Returns true if the event must be on disk before the run proceeds.
    pub fn is_critical(&self) -> bool {
        self.payload.is_critical()
    }
}

/// Event payloads, internally tagged: `{"type": "run_started", ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEventPayload {
    /// First event of every run. Carries the full plan so the run can be
    /// reconstructed, and restored from, without the original config.
    RunStarted {
        run_id: RunId,
        kind: RunKind,
        bundle: Option<BundleId>,
        plan: Vec<StackSpec>,
    },

    /// Snapshot of a stack record immediately after a state transition.
    StackTransition { record: StackRunRecord },

    /// A raw backend status observed while polling. Diagnostic only.
    BackendStatus { stack: StackName, status: String },

    /// Last event of a finished run.
    RunFinished {
        state: RunState,
        failed_stack: Option<StackName>,
        aborted: bool,
        inconsistent: Vec<StackName>,
    },
}

impl RunEventPayload {
    pub fn is_critical(&self) -> bool {
        !matches!(self, RunEventPayload::BackendStatus { .. })
    }

    pub fn name(&self) -> &'static str {
        match self {
            RunEventPayload::RunStarted { .. } => "run_started",
            RunEventPayload::StackTransition { .. } => "stack_transition",
            RunEventPayload::BackendStatus { .. } => "backend_status",
            RunEventPayload::RunFinished { .. } => "run_finished",
        }
    }
}
