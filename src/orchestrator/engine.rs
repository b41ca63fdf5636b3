//! The run orchestrator.
//!
//! `Orchestrator` owns a [`Run`] from creation to completion. It deploys the
//! plan one stack at a time, journals every transition to the ledger, and on
//! failure rolls back the stacks the run deployed, newest first.

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::backend::StackBackend;
use crate::driver::{DriverError, Journal, StackDriver};
use crate::graph::DeploymentPlan;
use crate::ledger::{LedgerError, LedgerStore, RunEventPayload};
use crate::types::{
    BundleId, FailureCause, InvalidTransition, Run, RunId, RunKind, RunState, StackName,
    StackRunRecord, StackState,
};

/// Errors that stop a run before it reaches a final state.
///
/// Both variants carry the run as it stood when it was abandoned, marked
/// incomplete so that it is never mistaken for a success.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("run {} abandoned: ledger write failed: {source}", run.id)]
    Ledger {
        run: Box<Run>,
        #[source]
        source: LedgerError,
    },

    #[error("run {} abandoned: {source}", run.id)]
    Transition {
        run: Box<Run>,
        #[source]
        source: InvalidTransition,
    },
}

impl OrchestratorError {
    pub fn run(&self) -> &Run {
        match self {
            OrchestratorError::Ledger { run, .. } | OrchestratorError::Transition { run, .. } => {
                run
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorOptions {
    /// Roll back deployed stacks when a run fails.
    pub rollback: bool,

    /// Let teardown delete stacks marked `retain`.
    pub delete_retained: bool,
}

impl Default for OrchestratorOptions {
    fn default() -> Self {
        OrchestratorOptions {
            rollback: true,
            delete_retained: false,
        }
    }
}

impl OrchestratorOptions {
    /// Reads `STACKLINE_NO_ROLLBACK` and `STACKLINE_DELETE_ALL`. Each is
    /// enabled by `1`, `true` or `yes`.
    pub fn from_env() -> Self {
        OrchestratorOptions {
            rollback: !env_flag("STACKLINE_NO_ROLLBACK"),
            delete_retained: env_flag("STACKLINE_DELETE_ALL"),
        }
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| is_truthy(&v))
        .unwrap_or(false)
}

pub(super) fn is_truthy(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes")
}

/// Writes record transitions of one run to the ledger.
struct RunJournal<'a, L> {
    ledger: &'a mut L,
    run: &'a RunId,
}

impl<L: LedgerStore> Journal for RunJournal<'_, L> {
    fn transition(&mut self, record: &StackRunRecord) -> std::result::Result<(), LedgerError> {
        self.ledger.append(
            self.run,
            RunEventPayload::StackTransition {
                record: record.clone(),
            },
        )?;
        Ok(())
    }

    fn progress(&mut self, stack: &StackName, status: &str) -> std::result::Result<(), LedgerError> {
        self.ledger.append(
            self.run,
            RunEventPayload::BackendStatus {
                stack: stack.clone(),
                status: status.to_string(),
            },
        )?;
        Ok(())
    }
}

/// Executes deployment and teardown runs.
///
/// Two cancellation tokens control an in-flight run:
/// - `abort` stops forward progress; the run then rolls back as if the
///   current stack had failed.
/// - `force` interrupts rollback and teardown waits.
pub struct Orchestrator<B, L> {
    driver: StackDriver<B>,
    ledger: L,
    options: OrchestratorOptions,
    abort: CancellationToken,
    force: CancellationToken,
}

impl<B: StackBackend, L: LedgerStore> Orchestrator<B, L> {
    pub fn new(driver: StackDriver<B>, ledger: L, options: OrchestratorOptions) -> Self {
        Orchestrator {
            driver,
            ledger,
            options,
            abort: CancellationToken::new(),
            force: CancellationToken::new(),
        }
    }

    pub fn abort_token(&self) -> CancellationToken {
        self.abort.clone()
    }

    pub fn force_token(&self) -> CancellationToken {
        self.force.clone()
    }

    pub fn ledger(&self) -> &L {
        &self.ledger
    }

    pub fn driver(&self) -> &StackDriver<B> {
        &self.driver
    }

    /// Deploys every stack of `plan` in order.
    ///
    /// Returns the finished run. A failed run is still `Ok`; its state says
    /// whether rollback completed. `Err` means the run could not be journaled
    /// and was abandoned.
    pub async fn execute(&mut self, plan: &DeploymentPlan, bundle: Option<BundleId>) -> Result<Run> {
        let mut run = Run::new(RunId::generate(), RunKind::Deploy, bundle, plan.stacks());
        match self.drive_deploy(&mut run, plan).await {
            Ok(()) => Ok(run),
            Err(e) => Err(abandon(run, e)),
        }
    }

    /// Deletes every stack of `plan`, dependents first, stopping at the first
    /// failure. Stacks marked `retain` are skipped unless
    /// [`OrchestratorOptions::delete_retained`] is set.
    pub async fn teardown(&mut self, plan: &DeploymentPlan) -> Result<Run> {
        let mut run = Run::new(RunId::generate(), RunKind::Teardown, None, plan.stacks());
        match self.drive_teardown(&mut run, plan).await {
            Ok(()) => Ok(run),
            Err(e) => Err(abandon(run, e)),
        }
    }

    #[instrument(skip_all, fields(run = %run.id))]
    async fn drive_deploy(
        &mut self,
        run: &mut Run,
        plan: &DeploymentPlan,
    ) -> std::result::Result<(), DriverError> {
        let run_id = run.id.clone();
        let mut release = self.ledger.release()?;
        let started = self.ledger.append(
            &run_id,
            RunEventPayload::RunStarted {
                run_id: run_id.clone(),
                kind: RunKind::Deploy,
                bundle: run.bundle.clone(),
                plan: plan.stacks().to_vec(),
            },
        )?;
        run.stamp_start(started.ts);
        info!(stacks = plan.len(), bundle = ?run.bundle, "deploy run started");

        let mut journal = RunJournal {
            ledger: &mut self.ledger,
            run: &run_id,
        };

        for (index, spec) in plan.stacks().iter().enumerate() {
            if self.abort.is_cancelled() {
                warn!("run aborted by operator");
                run.aborted = true;
                break;
            }
            let record = &mut run.records[index];
            let state = self
                .driver
                .deploy(spec, record, &mut journal, &self.abort)
                .await?;
            if state == StackState::DeployFailed {
                if record.last_error == Some(FailureCause::Cancelled) {
                    run.aborted = true;
                }
                run.failed_stack = Some(spec.name.clone());
                break;
            }
        }

        let all_deployed = run.records.iter().all(|r| r.state == StackState::Deployed);
        let final_state = if all_deployed {
            RunState::Succeeded
        } else if !self.options.rollback {
            warn!("rollback disabled; leaving deployed stacks in place");
            RunState::FailedRollbackIncomplete
        } else {
            let order = plan.rollback_order(run);
            warn!(stacks = order.len(), "rolling back run");
            let mut complete = true;
            for name in &order {
                let Some(index) = plan.position(name) else {
                    continue;
                };
                let spec = &plan.stacks()[index];
                let prior = release
                    .get(name)
                    .filter(|prior| prior.stack_name == spec.stack_name);
                let state = self
                    .driver
                    .rollback(spec, prior, &mut run.records[index], &mut journal, &self.force)
                    .await?;
                complete &= state == StackState::RolledBack;
            }
            let unsettled: Vec<&StackName> = run
                .records
                .iter()
                .filter(|r| r.is_unsettled())
                .map(|r| &r.stack)
                .collect();
            if !unsettled.is_empty() {
                warn!(
                    ?unsettled,
                    "failed stacks were left mid-operation in the backend"
                );
            }
            if complete && unsettled.is_empty() {
                RunState::FailedRolledBack
            } else {
                RunState::FailedRollbackIncomplete
            }
        };

        if final_state == RunState::Succeeded {
            release.record_success(&run_id, plan.stacks());
            self.ledger.write_release(&release)?;
        }
        self.finish(run, final_state)
    }

    #[instrument(skip_all, fields(run = %run.id))]
    async fn drive_teardown(
        &mut self,
        run: &mut Run,
        plan: &DeploymentPlan,
    ) -> std::result::Result<(), DriverError> {
        let run_id = run.id.clone();
        let mut release = self.ledger.release()?;
        let started = self.ledger.append(
            &run_id,
            RunEventPayload::RunStarted {
                run_id: run_id.clone(),
                kind: RunKind::Teardown,
                bundle: None,
                plan: plan.stacks().to_vec(),
            },
        )?;
        run.stamp_start(started.ts);
        info!(stacks = plan.len(), "teardown run started");

        let mut journal = RunJournal {
            ledger: &mut self.ledger,
            run: &run_id,
        };

        for spec in plan.teardown_order() {
            if self.abort.is_cancelled() || self.force.is_cancelled() {
                warn!("teardown aborted by operator");
                run.aborted = true;
                break;
            }
            let Some(index) = plan.position(&spec.name) else {
                continue;
            };
            if spec.retain && !self.options.delete_retained {
                info!(stack = %spec.name, "retaining stack");
                let record = &mut run.records[index];
                record.transition(StackState::Retained)?;
                journal.transition(record)?;
                continue;
            }
            let state = self
                .driver
                .delete(spec, &mut run.records[index], &mut journal, &self.force)
                .await?;
            if state == StackState::DeleteFailed {
                run.failed_stack = Some(spec.name.clone());
                break;
            }
        }

        let deleted: Vec<StackName> = run
            .records
            .iter()
            .filter(|r| r.state == StackState::Deleted)
            .map(|r| r.stack.clone())
            .collect();
        if !deleted.is_empty() {
            release.forget(&run_id, &deleted);
            self.ledger.write_release(&release)?;
        }

        let settled = run
            .records
            .iter()
            .all(|r| matches!(r.state, StackState::Deleted | StackState::Retained));
        let final_state = if settled {
            RunState::Succeeded
        } else {
            RunState::TeardownIncomplete
        };
        self.finish(run, final_state)
    }

    fn finish(&mut self, run: &mut Run, state: RunState) -> std::result::Result<(), DriverError> {
        run.finish(state);
        let inconsistent = run.inconsistent_stacks();
        let finished = self.ledger.append(
            &run.id,
            RunEventPayload::RunFinished {
                state,
                failed_stack: run.failed_stack.clone(),
                aborted: run.aborted,
                inconsistent: inconsistent.clone(),
            },
        )?;
        run.finished_at = Some(finished.ts);

        match state {
            RunState::Succeeded => info!(state = %state, "run finished"),
            RunState::FailedRolledBack => warn!(
                state = %state,
                failed_stack = ?run.failed_stack,
                "run failed; all deployed stacks rolled back"
            ),
            _ => error!(
                state = %state,
                ?inconsistent,
                "run finished incomplete; manual intervention required"
            ),
        }
        Ok(())
    }
}

/// Marks a run that could not be journaled as incomplete.
fn abandon(mut run: Run, error: DriverError) -> OrchestratorError {
    let state = match run.kind {
        RunKind::Deploy => RunState::FailedRollbackIncomplete,
        RunKind::Teardown => RunState::TeardownIncomplete,
    };
    run.finish(state);
    error!(run = %run.id, error = %error, "run abandoned; no further backend calls will be made");

    let run = Box::new(run);
    match error {
        DriverError::Journal(source) => OrchestratorError::Ledger { run, source },
        DriverError::InvalidTransition(source) => OrchestratorError::Transition { run, source },
    }
}
