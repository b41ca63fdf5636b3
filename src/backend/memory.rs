//! In-memory stack backend.
//!
//! Stacks live in a map keyed by physical stack name. Each mutating call is
//! answered by the next scripted [`Outcome`] for that stack (default
//! [`Outcome::Succeed`]) and then reports "in progress" for a configurable
//! number of describe calls before settling. Used by `deploy --rehearse` and by
//! the engine tests.

use std::collections::{BTreeMap, HashMap, VecDeque};

use tokio::sync::Mutex;

use super::{
    BackendError, DeployRequest, OperationHandle, StackBackend, StackPhase, StackStatus,
};

/// Scripted result of one mutating call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The operation runs and completes.
    Succeed,
    /// The operation runs and ends in a failure status with this reason.
    Fail(String),
    /// The call itself is refused with a permanent error.
    Reject(String),
    /// The operation starts and never finishes.
    Hang,
}

/// A recorded backend call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendCall {
    Deploy { stack: String, fingerprint: String },
    Describe { stack: String },
    Delete { stack: String },
}

impl BackendCall {
    pub fn stack(&self) -> &str {
        match self {
            BackendCall::Deploy { stack, .. }
            | BackendCall::Describe { stack }
            | BackendCall::Delete { stack } => stack,
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self, BackendCall::Describe { .. })
    }
}

#[derive(Debug, Clone)]
enum Settle {
    Deployed { fingerprint: String },
    DeployFailed { reason: String, created: bool },
    Deleted,
    DeleteFailed { reason: String },
    Never,
}

#[derive(Debug, Clone)]
struct MemoryStack {
    id: String,
    raw_status: String,
    phase: StackPhase,
    fingerprint: Option<String>,
    reason: Option<String>,
    outputs: BTreeMap<String, String>,
    /// Describe calls left before `pending` is applied.
    polls_left: u32,
    pending: Option<Settle>,
}

#[derive(Debug, Default)]
struct State {
    stacks: HashMap<String, MemoryStack>,
    deploy_script: HashMap<String, VecDeque<Outcome>>,
    delete_script: HashMap<String, VecDeque<Outcome>>,
    transient_failures: HashMap<String, u32>,
    calls: Vec<BackendCall>,
    next_id: u64,
}

/// Scriptable in-memory [`StackBackend`].
#[derive(Debug)]
pub struct MemoryBackend {
    state: Mutex<State>,
    polls_per_operation: u32,
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        MemoryBackend {
            state: Mutex::new(State::default()),
            polls_per_operation: 1,
        }
    }

    /// Number of describe calls that report "in progress" after each
    /// accepted operation.
    pub fn with_polls_per_operation(mut self, polls: u32) -> Self {
        self.polls_per_operation = polls;
        self
    }

    /// Seeds an existing, healthy stack.
    pub fn with_stack(mut self, stack_name: &str, fingerprint: &str) -> Self {
        let state = self.state.get_mut();
        state.next_id += 1;
        let id = format!("stack/{}/{}", stack_name, state.next_id);
        state.stacks.insert(
            stack_name.to_string(),
            MemoryStack {
                id,
                raw_status: "CREATE_COMPLETE".to_string(),
                phase: StackPhase::Success,
                fingerprint: Some(fingerprint.to_string()),
                reason: None,
                outputs: BTreeMap::new(),
                polls_left: 0,
                pending: None,
            },
        );
        self
    }

    /// Queues outcomes for successive create/update calls on a stack.
    pub fn script_deploy(
        mut self,
        stack_name: &str,
        outcomes: impl IntoIterator<Item = Outcome>,
    ) -> Self {
        self.state
            .get_mut()
            .deploy_script
            .entry(stack_name.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    /// Queues outcomes for successive delete calls on a stack.
    pub fn script_delete(
        mut self,
        stack_name: &str,
        outcomes: impl IntoIterator<Item = Outcome>,
    ) -> Self {
        self.state
            .get_mut()
            .delete_script
            .entry(stack_name.to_string())
            .or_default()
            .extend(outcomes);
        self
    }

    /// Makes the next `count` calls touching a stack fail transiently.
    pub fn fail_transiently(mut self, stack_name: &str, count: u32) -> Self {
        self.state
            .get_mut()
            .transient_failures
            .insert(stack_name.to_string(), count);
        self
    }

    pub async fn calls(&self) -> Vec<BackendCall> {
        self.state.lock().await.calls.clone()
    }

    /// Number of create/update/delete calls issued for a stack.
    pub async fn mutating_calls(&self, stack_name: &str) -> usize {
        self.state
            .lock()
            .await
            .calls
            .iter()
            .filter(|c| c.is_mutating() && c.stack() == stack_name)
            .count()
    }

    /// Fingerprint currently recorded on a stack, if it exists.
    pub async fn fingerprint(&self, stack_name: &str) -> Option<String> {
        self.state
            .lock()
            .await
            .stacks
            .get(stack_name)
            .and_then(|s| s.fingerprint.clone())
    }

    pub async fn exists(&self, stack_name: &str) -> bool {
        self.state.lock().await.stacks.contains_key(stack_name)
    }
}

impl State {
    fn take_transient(&mut self, stack_name: &str) -> Result<(), BackendError> {
        if let Some(left) = self.transient_failures.get_mut(stack_name)
            && *left > 0
        {
            *left -= 1;
            return Err(BackendError::transient("Rate exceeded"));
        }
        Ok(())
    }

    fn next_outcome(script: &mut HashMap<String, VecDeque<Outcome>>, stack_name: &str) -> Outcome {
        script
            .get_mut(stack_name)
            .and_then(|q| q.pop_front())
            .unwrap_or(Outcome::Succeed)
    }
}

impl StackBackend for MemoryBackend {
    async fn create_or_update(
        &self,
        request: &DeployRequest,
    ) -> Result<OperationHandle, BackendError> {
        let mut state = self.state.lock().await;
        let name = request.stack_name.clone();
        state.calls.push(BackendCall::Deploy {
            stack: name.clone(),
            fingerprint: request.fingerprint.clone(),
        });
        state.take_transient(&name)?;

        if let Some(existing) = state.stacks.get(&name) {
            if existing.pending.is_some() {
                return Err(BackendError::permanent(format!(
                    "stack {} is in {} state and can not be updated",
                    name, existing.raw_status
                )));
            }
            if existing.phase == StackPhase::Success
                && existing.fingerprint.as_deref() == Some(request.fingerprint.as_str())
            {
                return Ok(OperationHandle {
                    stack_id: Some(existing.id.clone()),
                    no_op: true,
                });
            }
        }

        let outcome = State::next_outcome(&mut state.deploy_script, &name);
        let created = !state.stacks.contains_key(&name);
        let settle = match outcome {
            Outcome::Reject(message) => return Err(BackendError::permanent(message)),
            Outcome::Succeed => Settle::Deployed {
                fingerprint: request.fingerprint.clone(),
            },
            Outcome::Fail(reason) => Settle::DeployFailed { reason, created },
            Outcome::Hang => Settle::Never,
        };

        state.next_id += 1;
        let fresh_id = format!("stack/{}/{}", name, state.next_id);
        let polls_left = self.polls_per_operation;
        let stack = state.stacks.entry(name).or_insert_with(|| MemoryStack {
            id: fresh_id,
            raw_status: String::new(),
            phase: StackPhase::InProgress,
            fingerprint: None,
            reason: None,
            outputs: BTreeMap::new(),
            polls_left: 0,
            pending: None,
        });
        stack.raw_status = if created {
            "CREATE_IN_PROGRESS"
        } else {
            "UPDATE_IN_PROGRESS"
        }
        .to_string();
        stack.phase = StackPhase::InProgress;
        stack.reason = None;
        stack.polls_left = polls_left;
        stack.pending = Some(settle);

        Ok(OperationHandle {
            stack_id: Some(stack.id.clone()),
            no_op: false,
        })
    }

    async fn describe_status(&self, stack_name: &str) -> Result<Option<StackStatus>, BackendError> {
        let mut state = self.state.lock().await;
        state.calls.push(BackendCall::Describe {
            stack: stack_name.to_string(),
        });
        state.take_transient(stack_name)?;

        let Some(stack) = state.stacks.get_mut(stack_name) else {
            return Ok(None);
        };

        let mut gone = false;
        if stack.pending.is_some() {
            if stack.polls_left > 0 {
                stack.polls_left -= 1;
            } else {
                match stack.pending.take() {
                    Some(Settle::Deployed { fingerprint }) => {
                        stack.raw_status = if stack.raw_status == "CREATE_IN_PROGRESS" {
                            "CREATE_COMPLETE"
                        } else {
                            "UPDATE_COMPLETE"
                        }
                        .to_string();
                        stack.phase = StackPhase::Success;
                        stack.outputs.insert("Fingerprint".to_string(), fingerprint.clone());
                        stack.fingerprint = Some(fingerprint);
                    }
                    Some(Settle::DeployFailed { reason, created }) => {
                        stack.raw_status = if created {
                            "ROLLBACK_COMPLETE"
                        } else {
                            "UPDATE_ROLLBACK_COMPLETE"
                        }
                        .to_string();
                        stack.phase = StackPhase::Failure;
                        stack.reason = Some(reason);
                    }
                    Some(Settle::DeleteFailed { reason }) => {
                        stack.raw_status = "DELETE_FAILED".to_string();
                        stack.phase = StackPhase::Failure;
                        stack.reason = Some(reason);
                    }
                    Some(Settle::Deleted) => gone = true,
                    Some(Settle::Never) => stack.pending = Some(Settle::Never),
                    None => {}
                }
            }
        }

        if gone {
            state.stacks.remove(stack_name);
            return Ok(None);
        }
        Ok(Some(StackStatus {
            phase: stack.phase,
            raw_status: stack.raw_status.clone(),
            stack_id: Some(stack.id.clone()),
            reason: stack.reason.clone(),
            outputs: stack.outputs.clone(),
            fingerprint: stack.fingerprint.clone(),
        }))
    }

    async fn rollback_or_delete(&self, stack_name: &str) -> Result<OperationHandle, BackendError> {
        let mut state = self.state.lock().await;
        state.calls.push(BackendCall::Delete {
            stack: stack_name.to_string(),
        });
        state.take_transient(stack_name)?;

        if !state.stacks.contains_key(stack_name) {
            return Ok(OperationHandle::default());
        }

        let settle = match State::next_outcome(&mut state.delete_script, stack_name) {
            Outcome::Reject(message) => return Err(BackendError::permanent(message)),
            Outcome::Succeed => Settle::Deleted,
            Outcome::Fail(reason) => Settle::DeleteFailed { reason },
            Outcome::Hang => Settle::Never,
        };

        let polls_left = self.polls_per_operation;
        let Some(stack) = state.stacks.get_mut(stack_name) else {
            return Ok(OperationHandle::default());
        };
        stack.raw_status = "DELETE_IN_PROGRESS".to_string();
        stack.phase = StackPhase::InProgress;
        stack.reason = None;
        stack.polls_left = polls_left;
        stack.pending = Some(settle);

        Ok(OperationHandle {
            stack_id: Some(stack.id.clone()),
            no_op: false,
        })
    }
}
