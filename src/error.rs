//! Top-level error taxonomy for the durable execution core.
//!
//! Each variant corresponds to one of the error *kinds* the engine must be
//! able to surface distinctly to callers, independent of the concrete type
//! that produced it. Narrower errors (`StoreError`, `ExecutorError`,
//! `RegistryError`, `DebuggerError`) convert into this enum at the point
//! where they cross into application-facing code.

use uuid::Uuid;

use crate::debug::DebuggerError;
use crate::engine::registry::RegistryError;
use crate::persistence::StoreError;

/// Application-facing error kind for the durable execution core.
#[derive(Debug, thiserror::Error)]
pub enum DbosError {
    /// Configuration or schema setup failed; fatal at process start.
    #[error("initialization failed: {0}")]
    Initialization(String),

    /// Invocation targets an unknown operation symbol.
    #[error("operation not registered: {0}")]
    NotRegistered(#[from] RegistryError),

    /// Duplicate-key collision on OperationOutputs: a racing identical
    /// invocation, or a determinism violation in the user body.
    #[error("workflow conflict for {workflow_uuid} at function_id {function_id}")]
    WorkflowConflict { workflow_uuid: Uuid, function_id: i64 },

    /// A `workflow_uuid` was reused with a different name/class/config than
    /// the first recorded invocation.
    #[error("conflicting workflow invocation for {0}: name/class/config mismatch")]
    ConflictingWorkflow(Uuid),

    /// `setEvent` called twice with the same key.
    #[error("duplicate workflow event for {workflow_uuid} key {key}")]
    DuplicateWorkflowEvent { workflow_uuid: Uuid, key: String },

    /// `recovery_attempts` exceeded `maxRecoveryAttempts`; terminal.
    #[error("workflow {0} exceeded max recovery attempts and was moved to the dead-letter queue")]
    DeadLetterQueue(Uuid),

    /// Observed by an in-flight body after a cancellation request.
    #[error("workflow {0} was cancelled")]
    WorkflowCancelled(Uuid),

    /// Replay diverged from the recorded stream.
    #[error("debugger error: {0}")]
    Debugger(#[from] DebuggerError),

    /// HTTP-shaped application error, propagated but not interpreted by the
    /// core.
    #[error("response error ({status}): {message}")]
    Response { status: u16, message: String },

    /// HTTP-shaped authorization error, propagated but not interpreted by
    /// the core.
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// An underlying system database failure that doesn't fit a more
    /// specific kind above.
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DbosError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DbosError::Store(StoreError::SerializationFailure))
    }
}
