//! Deploy, rollback and delete for a single stack.

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::poll::{PollConfig, PollDecision, PollOperation, PollState};
use super::{DriverConfig, Journal, Result};
use crate::backend::{
    DeployRequest, RetryResult, StackBackend, StackPhase, StackStatus, retry_with_backoff,
};
use crate::types::{FailureCause, StackRunRecord, StackSpec, StackState};

/// How a poll loop ended.
#[derive(Debug)]
enum Settled {
    Finished(StackStatus),
    Gone,
    Failed(FailureCause),
}

/// Maps a retried call to its value or the failure it stands for.
fn into_cause<T>(result: RetryResult<T>) -> std::result::Result<T, FailureCause> {
    match result {
        RetryResult::Success(value) => Ok(value),
        RetryResult::ExhaustedRetries {
            last_error,
            attempts,
        } => Err(FailureCause::RetriesExhausted {
            attempts,
            message: last_error.message,
        }),
        RetryResult::PermanentError(e) => Err(FailureCause::Rejected { message: e.message }),
        RetryResult::Cancelled => Err(FailureCause::Cancelled),
    }
}

/// Drives stacks through their lifecycle against a backend.
pub struct StackDriver<B> {
    backend: B,
    config: DriverConfig,
}

impl<B: StackBackend> StackDriver<B> {
    pub fn new(backend: B, config: DriverConfig) -> Self {
        StackDriver { backend, config }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &DriverConfig {
        &self.config
    }

    /// Deploys `spec`, moving `record` from `PENDING` to `DEPLOYED` or
    /// `DEPLOY_FAILED`.
    ///
    /// A stack that already matches `spec` is left untouched.
    #[instrument(skip_all, fields(stack = %spec.name))]
    pub async fn deploy(
        &self,
        spec: &StackSpec,
        record: &mut StackRunRecord,
        journal: &mut impl Journal,
        cancel: &CancellationToken,
    ) -> Result<StackState> {
        enter(record, StackState::Deploying, journal)?;
        info!(stack_name = %spec.stack_name, "deploying stack");
        let fingerprint = spec.fingerprint();

        let mut current = match self.describe(spec, cancel).await {
            Ok(status) => status,
            Err(cause) => return settle_failed(record, StackState::DeployFailed, cause, journal),
        };
        record.existed_before = Some(current.is_some());

        if let Some(status) = &current
            && status.phase == StackPhase::InProgress
        {
            info!(status = %status.raw_status, "waiting for running operation to finish");
            current = match self
                .wait(spec, PollOperation::Settle, &self.config.deploy_poll, journal, cancel)
                .await?
            {
                Settled::Finished(status) => Some(status),
                Settled::Gone => None,
                Settled::Failed(cause) => {
                    return settle_failed(record, StackState::DeployFailed, cause, journal);
                }
            };
        }

        if let Some(status) = &current
            && status.phase == StackPhase::Success
            && status.fingerprint.as_deref() == Some(fingerprint.as_str())
        {
            info!("stack already up to date");
            record.backend_id = status.stack_id.clone();
            record.outputs = status.outputs.clone();
            return settle(record, StackState::Deployed, journal);
        }

        let request = DeployRequest::from_spec(spec);
        record.mutated = true;
        let submitted = retry_with_backoff(self.config.retry, self.config.call_timeout, cancel, || {
            self.backend.create_or_update(&request)
        })
        .await;
        let handle = match into_cause(submitted) {
            Ok(handle) => handle,
            Err(cause) => return settle_failed(record, StackState::DeployFailed, cause, journal),
        };
        if handle.stack_id.is_some() {
            record.backend_id = handle.stack_id;
        }

        if handle.no_op {
            debug!("backend reported nothing to update");
            if let Some(status) = current {
                record.backend_id = record.backend_id.take().or(status.stack_id);
                record.outputs = status.outputs;
            }
            return settle(record, StackState::Deployed, journal);
        }

        let operation = PollOperation::Deploy { fingerprint };
        match self
            .wait(spec, operation, &self.config.deploy_poll, journal, cancel)
            .await?
        {
            Settled::Finished(status) => {
                record.backend_id = status.stack_id.or(record.backend_id.take());
                record.outputs = status.outputs;
                settle(record, StackState::Deployed, journal)
            }
            Settled::Gone => settle_failed(
                record,
                StackState::DeployFailed,
                FailureCause::StackMissing,
                journal,
            ),
            Settled::Failed(cause) => settle_failed(record, StackState::DeployFailed, cause, journal),
        }
    }

    /// Returns a `DEPLOYED` stack to its state before the run.
    ///
    /// `prior` is the last known-good spec of the same physical stack, if any.
    #[instrument(skip_all, fields(stack = %spec.name))]
    pub async fn rollback(
        &self,
        spec: &StackSpec,
        prior: Option<&StackSpec>,
        record: &mut StackRunRecord,
        journal: &mut impl Journal,
        cancel: &CancellationToken,
    ) -> Result<StackState> {
        enter(record, StackState::RollingBack, journal)?;
        warn!(stack_name = %spec.stack_name, "rolling back stack");

        if !record.mutated {
            info!("run did not change the stack; nothing to undo");
            return settle(record, StackState::RolledBack, journal);
        }

        if let Some(prior) = prior {
            let prior_fingerprint = prior.fingerprint();
            if prior_fingerprint == spec.fingerprint() {
                info!("known-good definition is unchanged; nothing to undo");
                return settle(record, StackState::RolledBack, journal);
            }

            info!("restoring known-good definition");
            let request = DeployRequest::from_spec(prior);
            let submitted =
                retry_with_backoff(self.config.retry, self.config.call_timeout, cancel, || {
                    self.backend.create_or_update(&request)
                })
                .await;
            let handle = match into_cause(submitted) {
                Ok(handle) => handle,
                Err(cause) => {
                    return settle_failed(record, StackState::RollbackFailed, cause, journal);
                }
            };
            if handle.no_op {
                return settle(record, StackState::RolledBack, journal);
            }

            let operation = PollOperation::Deploy {
                fingerprint: prior_fingerprint,
            };
            return match self
                .wait(spec, operation, &self.config.rollback_poll, journal, cancel)
                .await?
            {
                Settled::Finished(status) => {
                    record.outputs = status.outputs;
                    settle(record, StackState::RolledBack, journal)
                }
                Settled::Gone => settle_failed(
                    record,
                    StackState::RollbackFailed,
                    FailureCause::StackMissing,
                    journal,
                ),
                Settled::Failed(cause) => {
                    settle_failed(record, StackState::RollbackFailed, cause, journal)
                }
            };
        }

        if record.existed_before == Some(false) {
            info!("stack was created by this run; deleting it");
            return match self.remove(spec, &self.config.rollback_poll, journal, cancel).await? {
                Ok(()) => {
                    record.outputs.clear();
                    settle(record, StackState::RolledBack, journal)
                }
                Err(cause) => settle_failed(record, StackState::RollbackFailed, cause, journal),
            };
        }

        settle_failed(
            record,
            StackState::RollbackFailed,
            FailureCause::NoKnownGoodState,
            journal,
        )
    }

    /// Deletes a stack, moving `record` from `PENDING` to `DELETED` or
    /// `DELETE_FAILED`. An absent stack counts as deleted.
    #[instrument(skip_all, fields(stack = %spec.name))]
    pub async fn delete(
        &self,
        spec: &StackSpec,
        record: &mut StackRunRecord,
        journal: &mut impl Journal,
        cancel: &CancellationToken,
    ) -> Result<StackState> {
        enter(record, StackState::Deleting, journal)?;
        info!(stack_name = %spec.stack_name, "deleting stack");

        let current = match self.describe(spec, cancel).await {
            Ok(status) => status,
            Err(cause) => return settle_failed(record, StackState::DeleteFailed, cause, journal),
        };
        record.existed_before = Some(current.is_some());
        if current.is_none() {
            info!("stack does not exist");
            return settle(record, StackState::Deleted, journal);
        }

        match self.remove(spec, &self.config.rollback_poll, journal, cancel).await? {
            Ok(()) => {
                record.outputs.clear();
                settle(record, StackState::Deleted, journal)
            }
            Err(cause) => settle_failed(record, StackState::DeleteFailed, cause, journal),
        }
    }

    async fn describe(
        &self,
        spec: &StackSpec,
        cancel: &CancellationToken,
    ) -> std::result::Result<Option<StackStatus>, FailureCause> {
        into_cause(
            retry_with_backoff(self.config.retry, self.config.call_timeout, cancel, || {
                self.backend.describe_status(&spec.stack_name)
            })
            .await,
        )
    }

    /// Issues a delete and polls until the stack is gone.
    async fn remove(
        &self,
        spec: &StackSpec,
        poll: &PollConfig,
        journal: &mut impl Journal,
        cancel: &CancellationToken,
    ) -> Result<std::result::Result<(), FailureCause>> {
        let submitted = retry_with_backoff(self.config.retry, self.config.call_timeout, cancel, || {
            self.backend.rollback_or_delete(&spec.stack_name)
        })
        .await;
        if let Err(cause) = into_cause(submitted) {
            return Ok(Err(cause));
        }

        Ok(
            match self.wait(spec, PollOperation::Delete, poll, journal, cancel).await? {
                Settled::Gone => Ok(()),
                Settled::Failed(cause) => Err(cause),
                Settled::Finished(status) => Err(FailureCause::BackendFailure {
                    status: status.raw_status,
                    reason: status.reason,
                }),
            },
        )
    }

    /// Polls the stack until [`PollState`] reaches a decision other than
    /// waiting. Every new raw status is journaled as progress.
    async fn wait(
        &self,
        spec: &StackSpec,
        operation: PollOperation,
        config: &PollConfig,
        journal: &mut impl Journal,
        cancel: &CancellationToken,
    ) -> Result<Settled> {
        let started = Instant::now();
        let mut state = PollState::new(config.clone(), operation);
        let mut last_status: Option<String> = None;

        loop {
            let observation = tokio::select! {
                biased;

                _ = cancel.cancelled() => return Ok(Settled::Failed(FailureCause::Cancelled)),
                result = tokio::time::timeout(
                    self.config.call_timeout,
                    self.backend.describe_status(&spec.stack_name),
                ) => result.unwrap_or_else(|_| {
                    Err(crate::backend::BackendError::transient("describe call timed out"))
                }),
            };

            if let Ok(Some(status)) = &observation
                && last_status.as_deref() != Some(status.raw_status.as_str())
            {
                debug!(status = %status.raw_status, "stack status changed");
                journal.progress(&spec.name, &status.raw_status)?;
                last_status = Some(status.raw_status.clone());
            }

            match state.observe(started.elapsed(), observation) {
                PollDecision::Wait(delay) => {
                    debug!(?delay, "waiting before next status check");
                    tokio::select! {
                        biased;

                        _ = cancel.cancelled() => return Ok(Settled::Failed(FailureCause::Cancelled)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                PollDecision::Finished(status) => return Ok(Settled::Finished(status)),
                PollDecision::Gone => return Ok(Settled::Gone),
                PollDecision::Failed(cause) => return Ok(Settled::Failed(cause)),
            }
        }
    }
}

fn enter(record: &mut StackRunRecord, to: StackState, journal: &mut impl Journal) -> Result<()> {
    record.transition(to)?;
    journal.transition(record)?;
    Ok(())
}

fn settle(
    record: &mut StackRunRecord,
    to: StackState,
    journal: &mut impl Journal,
) -> Result<StackState> {
    record.transition(to)?;
    journal.transition(record)?;
    info!(state = %to, "stack settled");
    Ok(to)
}

fn settle_failed(
    record: &mut StackRunRecord,
    to: StackState,
    cause: FailureCause,
    journal: &mut impl Journal,
) -> Result<StackState> {
    warn!(state = %to, cause = %cause, "stack operation failed");
    record.fail(to, cause)?;
    journal.transition(record)?;
    Ok(to)
}
