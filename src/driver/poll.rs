//! Polling a stack operation to completion.
//!
//! [`PollState::observe`] is a pure transition function: given the time
//! elapsed since the operation was submitted and the latest describe result,
//! it decides whether to wait again, and for how long, or what the operation
//! ended as. The async loop that sleeps and calls the backend lives in the
//! driver.
//!
//! # Poll interval
//!
//! `initial_interval + growth * sqrt(elapsed_secs)`, capped at
//! `max_interval`. With the defaults (4s, 2.5s, 30s) a stack is checked every
//! few seconds during the first minute and every 30 seconds after about
//! two minutes.

use std::time::Duration;

use crate::backend::{BackendError, StackPhase, StackStatus};
use crate::types::FailureCause;

const DEFAULT_INITIAL_INTERVAL_MS: u64 = 4_000;
const DEFAULT_GROWTH_MS: u64 = 2_500;
const DEFAULT_MAX_INTERVAL_SECS: u64 = 30;
const DEFAULT_TIMEOUT_SECS: u64 = 3_600;
const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 5;

#[derive(Debug, Clone, PartialEq)]
pub struct PollConfig {
    pub initial_interval: Duration,

    /// Added per square root of elapsed seconds.
    pub growth: Duration,

    pub max_interval: Duration,

    /// Total time allowed for the operation.
    pub timeout: Duration,

    /// Transient describe failures tolerated in a row.
    pub max_consecutive_errors: u32,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl PollConfig {
    pub fn new() -> Self {
        PollConfig {
            initial_interval: Duration::from_millis(DEFAULT_INITIAL_INTERVAL_MS),
            growth: Duration::from_millis(DEFAULT_GROWTH_MS),
            max_interval: Duration::from_secs(DEFAULT_MAX_INTERVAL_SECS),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT_SECS),
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
        }
    }

    /// Wait before the next describe call, `elapsed` into the operation.
    pub fn interval_for(&self, elapsed: Duration) -> Duration {
        let secs = self.initial_interval.as_secs_f64()
            + self.growth.as_secs_f64() * elapsed.as_secs_f64().sqrt();
        Duration::from_secs_f64(secs.min(self.max_interval.as_secs_f64()))
    }
}

/// What the poll loop is waiting for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOperation {
    /// A create or update carrying this fingerprint.
    Deploy { fingerprint: String },
    /// A deletion.
    Delete,
    /// Whatever operation is already running, to any terminal status.
    Settle,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PollDecision {
    Wait(Duration),
    /// The operation reached a terminal status (success for deploys).
    Finished(StackStatus),
    /// The stack no longer exists.
    Gone,
    Failed(FailureCause),
}

#[derive(Debug, Clone)]
pub struct PollState {
    config: PollConfig,
    operation: PollOperation,
    consecutive_errors: u32,
}

impl PollState {
    pub fn new(config: PollConfig, operation: PollOperation) -> Self {
        PollState {
            config,
            operation,
            consecutive_errors: 0,
        }
    }

    pub fn operation(&self) -> &PollOperation {
        &self.operation
    }

    /// Decides the next step from one describe result.
    pub fn observe(
        &mut self,
        elapsed: Duration,
        observation: Result<Option<StackStatus>, BackendError>,
    ) -> PollDecision {
        let status = match observation {
            Ok(status) => {
                self.consecutive_errors = 0;
                status
            }
            Err(e) if !e.is_transient() => {
                return PollDecision::Failed(FailureCause::Rejected { message: e.message });
            }
            Err(e) => {
                self.consecutive_errors += 1;
                if self.consecutive_errors >= self.config.max_consecutive_errors {
                    return PollDecision::Failed(FailureCause::RetriesExhausted {
                        attempts: self.consecutive_errors,
                        message: e.message,
                    });
                }
                return self.wait(elapsed);
            }
        };

        let Some(status) = status else {
            return match self.operation {
                PollOperation::Deploy { .. } => PollDecision::Failed(FailureCause::StackMissing),
                PollOperation::Delete | PollOperation::Settle => PollDecision::Gone,
            };
        };

        match (status.phase, &self.operation) {
            (StackPhase::InProgress, _) => self.wait(elapsed),
            (StackPhase::Success, PollOperation::Deploy { fingerprint }) => {
                match status.fingerprint.as_deref() {
                    // Still the previous definition; the update has not shown up yet.
                    Some(seen) if seen != fingerprint => self.wait(elapsed),
                    _ => PollDecision::Finished(status),
                }
            }
            (StackPhase::Success, PollOperation::Delete) => self.wait(elapsed),
            (StackPhase::Success | StackPhase::Failure, PollOperation::Settle) => {
                PollDecision::Finished(status)
            }
            (StackPhase::Failure, _) => PollDecision::Failed(FailureCause::BackendFailure {
                status: status.raw_status,
                reason: status.reason,
            }),
        }
    }

    fn wait(&self, elapsed: Duration) -> PollDecision {
        if elapsed >= self.config.timeout {
            return PollDecision::Failed(FailureCause::Timeout {
                waited_secs: elapsed.as_secs(),
            });
        }
        PollDecision::Wait(self.config.interval_for(elapsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::BTreeMap;

    fn status(phase: StackPhase, raw: &str, fingerprint: Option<&str>) -> StackStatus {
        StackStatus {
            phase,
            raw_status: raw.to_string(),
            stack_id: Some("id".to_string()),
            reason: None,
            outputs: BTreeMap::new(),
            fingerprint: fingerprint.map(str::to_string),
        }
    }

    fn deploy(fingerprint: &str) -> PollState {
        PollState::new(
            PollConfig::new(),
            PollOperation::Deploy {
                fingerprint: fingerprint.to_string(),
            },
        )
    }

    // ─── Interval ───

    #[test]
    fn interval_starts_at_initial_and_caps() {
        let config = PollConfig::new();
        assert_eq!(config.interval_for(Duration::ZERO), Duration::from_secs(4));
        assert_eq!(
            config.interval_for(Duration::from_secs(16)),
            Duration::from_secs(14)
        );
        assert_eq!(
            config.interval_for(Duration::from_secs(3600)),
            Duration::from_secs(30)
        );
    }

    // ─── Deploy ───

    #[test]
    fn in_progress_waits() {
        let mut state = deploy("f1");
        let decision = state.observe(
            Duration::ZERO,
            Ok(Some(status(StackPhase::InProgress, "UPDATE_IN_PROGRESS", Some("f0")))),
        );
        assert_eq!(decision, PollDecision::Wait(Duration::from_secs(4)));
    }

    #[test]
    fn success_with_matching_fingerprint_finishes() {
        let mut state = deploy("f1");
        let done = status(StackPhase::Success, "UPDATE_COMPLETE", Some("f1"));
        assert_eq!(
            state.observe(Duration::from_secs(30), Ok(Some(done.clone()))),
            PollDecision::Finished(done)
        );
    }

    #[test]
    fn success_with_stale_fingerprint_keeps_waiting() {
        let mut state = deploy("f1");
        let stale = status(StackPhase::Success, "UPDATE_COMPLETE", Some("f0"));
        assert!(matches!(
            state.observe(Duration::ZERO, Ok(Some(stale))),
            PollDecision::Wait(_)
        ));
    }

    #[test]
    fn success_without_fingerprint_finishes() {
        let mut state = deploy("f1");
        let done = status(StackPhase::Success, "CREATE_COMPLETE", None);
        assert!(matches!(
            state.observe(Duration::ZERO, Ok(Some(done))),
            PollDecision::Finished(_)
        ));
    }

    #[test]
    fn failure_status_fails_with_reason() {
        let mut state = deploy("f1");
        let mut failed = status(StackPhase::Failure, "UPDATE_ROLLBACK_COMPLETE", Some("f0"));
        failed.reason = Some("Bucket already exists".to_string());

        assert_eq!(
            state.observe(Duration::ZERO, Ok(Some(failed))),
            PollDecision::Failed(FailureCause::BackendFailure {
                status: "UPDATE_ROLLBACK_COMPLETE".to_string(),
                reason: Some("Bucket already exists".to_string()),
            })
        );
    }

    #[test]
    fn vanished_stack_during_deploy_is_missing() {
        let mut state = deploy("f1");
        assert_eq!(
            state.observe(Duration::ZERO, Ok(None)),
            PollDecision::Failed(FailureCause::StackMissing)
        );
    }

    #[test]
    fn timeout_after_limit() {
        let mut state = deploy("f1");
        let running = status(StackPhase::InProgress, "CREATE_IN_PROGRESS", None);
        assert_eq!(
            state.observe(Duration::from_secs(3600), Ok(Some(running))),
            PollDecision::Failed(FailureCause::Timeout { waited_secs: 3600 })
        );
    }

    #[test]
    fn terminal_status_at_deadline_still_counts() {
        let mut state = deploy("f1");
        let done = status(StackPhase::Success, "CREATE_COMPLETE", Some("f1"));
        assert!(matches!(
            state.observe(Duration::from_secs(7200), Ok(Some(done))),
            PollDecision::Finished(_)
        ));
    }

    // ─── Errors ───

    #[test]
    fn consecutive_transient_errors_exhaust() {
        let mut state = deploy("f1");
        for _ in 0..4 {
            assert!(matches!(
                state.observe(Duration::ZERO, Err(BackendError::transient("Rate exceeded"))),
                PollDecision::Wait(_)
            ));
        }
        assert_eq!(
            state.observe(Duration::ZERO, Err(BackendError::transient("Rate exceeded"))),
            PollDecision::Failed(FailureCause::RetriesExhausted {
                attempts: 5,
                message: "Rate exceeded".to_string(),
            })
        );
    }

    #[test]
    fn successful_describe_resets_error_count() {
        let mut state = deploy("f1");
        let running = status(StackPhase::InProgress, "CREATE_IN_PROGRESS", None);
        for _ in 0..3 {
            for _ in 0..4 {
                state.observe(Duration::ZERO, Err(BackendError::transient("Rate exceeded")));
            }
            assert!(matches!(
                state.observe(Duration::ZERO, Ok(Some(running.clone()))),
                PollDecision::Wait(_)
            ));
        }
    }

    #[test]
    fn permanent_describe_error_fails() {
        let mut state = deploy("f1");
        assert!(matches!(
            state.observe(Duration::ZERO, Err(BackendError::permanent("AccessDenied"))),
            PollDecision::Failed(FailureCause::Rejected { .. })
        ));
    }

    // ─── Delete and settle ───

    #[test]
    fn delete_finishes_when_gone() {
        let mut state = PollState::new(PollConfig::new(), PollOperation::Delete);
        let deleting = status(StackPhase::InProgress, "DELETE_IN_PROGRESS", None);
        assert!(matches!(
            state.observe(Duration::ZERO, Ok(Some(deleting))),
            PollDecision::Wait(_)
        ));
        assert_eq!(state.observe(Duration::from_secs(5), Ok(None)), PollDecision::Gone);
    }

    #[test]
    fn delete_failed_is_failure() {
        let mut state = PollState::new(PollConfig::new(), PollOperation::Delete);
        let failed = status(StackPhase::Failure, "DELETE_FAILED", None);
        assert!(matches!(
            state.observe(Duration::ZERO, Ok(Some(failed))),
            PollDecision::Failed(FailureCause::BackendFailure { .. })
        ));
    }

    #[test]
    fn settle_accepts_any_terminal_status() {
        let mut state = PollState::new(PollConfig::new(), PollOperation::Settle);
        let failed = status(StackPhase::Failure, "UPDATE_ROLLBACK_COMPLETE", None);
        assert!(matches!(
            state.observe(Duration::ZERO, Ok(Some(failed))),
            PollDecision::Finished(_)
        ));
    }

    // ─── Property Tests ───

    proptest! {
        #[test]
        fn interval_is_capped_and_non_decreasing(
            a in 0u64..100_000,
            b in 0u64..100_000,
        ) {
            let config = PollConfig::new();
            let (lo, hi) = (a.min(b), a.max(b));
            let short = config.interval_for(Duration::from_secs(lo));
            let long = config.interval_for(Duration::from_secs(hi));

            prop_assert!(short <= long);
            prop_assert!(long <= config.max_interval);
            prop_assert!(short >= config.initial_interval.min(config.max_interval));
        }
    }
}
