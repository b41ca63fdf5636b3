//! The stack backend seam.
//!
//! The engine never provisions anything itself. It asks a [`StackBackend`] to
//! create, update, describe and remove stacks, and supervises the results.
//!
//! Implementations:
//! - [`CloudFormationCli`]: drives CloudFormation through the `aws` CLI
//! - [`MemoryBackend`]: scriptable in-memory backend for rehearsals and tests

pub mod command;
pub mod error;
pub mod memory;
pub mod retry;

use std::collections::BTreeMap;
use std::future::Future;

use crate::types::{StackSpec, TemplateRef};

pub use command::CloudFormationCli;
pub use error::{BackendError, BackendErrorKind};
pub use memory::{BackendCall, MemoryBackend, Outcome};
pub use retry::{RetryConfig, RetryResult, retry_with_backoff};

/// Tag under which the deployed spec fingerprint is stored on the stack.
pub const FINGERPRINT_TAG: &str = "stackline:fingerprint";

/// Coarse classification of a backend stack status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StackPhase {
    /// An operation is still running.
    InProgress,
    /// The last operation completed and the stack is usable.
    Success,
    /// The last operation failed (including backend-side rollbacks).
    Failure,
}

/// What the backend reports about an existing stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackStatus {
    pub phase: StackPhase,

    /// Backend-native status string, e.g. `UPDATE_ROLLBACK_COMPLETE`.
    pub raw_status: String,

    pub stack_id: Option<String>,

    pub reason: Option<String>,

    pub outputs: BTreeMap<String, String>,

    /// Fingerprint of the spec the stack was last deployed from, if recorded.
    pub fingerprint: Option<String>,
}

/// A create-or-update request derived from a [`StackSpec`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeployRequest {
    pub stack_name: String,
    pub template: TemplateRef,
    pub parameters: BTreeMap<String, String>,
    pub tags: BTreeMap<String, String>,
    pub fingerprint: String,
}

impl DeployRequest {
    pub fn from_spec(spec: &StackSpec) -> Self {
        DeployRequest {
            stack_name: spec.stack_name.clone(),
            template: spec.template.clone(),
            parameters: spec.parameters.clone(),
            tags: spec.tags.clone(),
            fingerprint: spec.fingerprint(),
        }
    }
}

/// Acknowledgement of a mutating call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationHandle {
    pub stack_id: Option<String>,

    /// The backend found nothing to change; there is no operation to wait for.
    pub no_op: bool,
}

/// A stack provisioning backend.
///
/// Calls may be slow, may fail transiently, and may be retried by the caller,
/// so `create_or_update` and `rollback_or_delete` must tolerate being issued
/// again for an operation that already happened.
pub trait StackBackend: Send + Sync {
    /// Creates the stack if absent, otherwise updates it in place.
    fn create_or_update(
        &self,
        request: &DeployRequest,
    ) -> impl Future<Output = Result<OperationHandle, BackendError>> + Send;

    /// Describes a stack. `Ok(None)` means the stack does not exist.
    fn describe_status(
        &self,
        stack_name: &str,
    ) -> impl Future<Output = Result<Option<StackStatus>, BackendError>> + Send;

    /// Starts deleting the stack. Deleting an absent stack succeeds.
    fn rollback_or_delete(
        &self,
        stack_name: &str,
    ) -> impl Future<Output = Result<OperationHandle, BackendError>> + Send;
}

impl<B: StackBackend> StackBackend for &B {
    fn create_or_update(
        &self,
        request: &DeployRequest,
    ) -> impl Future<Output = Result<OperationHandle, BackendError>> + Send {
        (**self).create_or_update(request)
    }

    fn describe_status(
        &self,
        stack_name: &str,
    ) -> impl Future<Output = Result<Option<StackStatus>, BackendError>> + Send {
        (**self).describe_status(stack_name)
    }

    fn rollback_or_delete(
        &self,
        stack_name: &str,
    ) -> impl Future<Output = Result<OperationHandle, BackendError>> + Send {
        (**self).rollback_or_delete(stack_name)
    }
}
