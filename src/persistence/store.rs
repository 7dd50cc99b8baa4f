//! `SystemDatabase` trait definition — the System Database (SDB).

use async_trait::async_trait;
use uuid::Uuid;

use super::entities::{
    Identity, NotificationRow, OperationOutputRow, WorkflowFilter, WorkflowStatusRow,
    WorkflowStatusValue,
};

/// Error type for system database operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("workflow not found: {0}")]
    WorkflowNotFound(Uuid),

    /// Duplicate-key collision on OperationOutputs (write-once violation).
    #[error("operation output already recorded for {workflow_uuid} fid {function_id}")]
    OperationConflict { workflow_uuid: Uuid, function_id: i64 },

    /// `workflow_uuid` reused with different name/class/config.
    #[error("conflicting workflow: {0}")]
    ConflictingWorkflow(Uuid),

    /// `setEvent` called twice with the same key.
    #[error("duplicate workflow event for {workflow_uuid} key {key}")]
    DuplicateEvent { workflow_uuid: Uuid, key: String },

    /// PG 40001: the calling UDB/SDB transaction should be retried.
    #[error("serialization failure, retry the transaction")]
    SerializationFailure,

    #[error("database error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            match db_err.code().as_deref() {
                Some("40001") => return StoreError::SerializationFailure,
                _ => {}
            }
        }
        StoreError::Database(err.to_string())
    }
}

/// Snapshot of a workflow's status as returned by `getWorkflowStatus`.
#[derive(Debug, Clone)]
pub struct WorkflowStatusSnapshot {
    pub status: WorkflowStatusValue,
    pub name: String,
    pub identity: Identity,
    pub request: Option<String>,
}

/// Either a recorded terminal result, or the sentinel "no result yet".
#[derive(Debug, Clone)]
pub enum CheckedWorkflowOutput {
    Success(String),
    Error(String),
    Pending,
}

/// Durable, ordered, concurrency-safe storage for workflow status, recorded
/// step outputs, notifications, and workflow events.
///
/// Implementations must be safe to share across many concurrently running
/// workflow bodies (`Send + Sync + 'static`).
#[async_trait]
pub trait SystemDatabase: Send + Sync + 'static {
    /// Insert WorkflowStatus PENDING and WorkflowInputs if absent, in one
    /// SDB transaction; return the row's *committed* inputs (first writer
    /// wins).
    async fn init_workflow_status(
        &self,
        workflow_uuid: Uuid,
        name: &str,
        class_name: Option<&str>,
        config_name: Option<&str>,
        identity: &Identity,
        request: Option<&str>,
        executor_id: &str,
        application_version: Option<&str>,
        args: &str,
    ) -> Result<String, StoreError>;

    /// Read the status row; return the recorded SUCCESS output, the
    /// recorded ERROR payload, or `Pending` if not yet terminal/missing.
    async fn check_workflow_output(
        &self,
        workflow_uuid: Uuid,
    ) -> Result<CheckedWorkflowOutput, StoreError>;

    /// Defer a terminal SUCCESS status/output write to the in-memory
    /// buffer; flushed later by `flush_workflow_status_buffer`.
    async fn buffer_workflow_status(
        &self,
        workflow_uuid: Uuid,
        output: Option<String>,
    ) -> Result<(), StoreError>;

    /// Flush all buffered terminal status writes to the database.
    async fn flush_workflow_status_buffer(&self) -> Result<(), StoreError>;

    /// Upsert an ERROR row; write-once (ignored if already terminal).
    async fn record_workflow_error(&self, workflow_uuid: Uuid, error: &str)
    -> Result<(), StoreError>;

    async fn check_operation_output(
        &self,
        workflow_uuid: Uuid,
        function_id: i64,
    ) -> Result<Option<OperationOutputRow>, StoreError>;

    async fn record_operation_output(
        &self,
        workflow_uuid: Uuid,
        function_id: i64,
        output: &str,
        txn_snapshot: Option<&str>,
        txn_id: Option<&str>,
    ) -> Result<(), StoreError>;

    async fn record_operation_error(
        &self,
        workflow_uuid: Uuid,
        function_id: i64,
        error: &str,
    ) -> Result<(), StoreError>;

    /// Insert one Notifications row and the OperationOutputs row in a
    /// single SDB transaction.
    async fn send(
        &self,
        sender_uuid: Uuid,
        function_id: i64,
        destination_uuid: Uuid,
        message: &str,
        topic: &str,
    ) -> Result<(), StoreError>;

    /// DELETE the oldest Notifications row for (destination, topic) and
    /// return its payload, or `None` if the queue is empty.
    async fn recv_poll(
        &self,
        destination_uuid: Uuid,
        topic: &str,
    ) -> Result<Option<NotificationRow>, StoreError>;

    /// Assert no prior value for (workflow_uuid, key), then insert both the
    /// event row and its OperationOutputs row.
    async fn set_event(
        &self,
        workflow_uuid: Uuid,
        function_id: i64,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError>;

    /// Read a single value from WorkflowEvents, if present.
    async fn get_event_value(
        &self,
        target_uuid: Uuid,
        key: &str,
    ) -> Result<Option<String>, StoreError>;

    async fn get_pending_workflows(&self, executor_id: &str) -> Result<Vec<Uuid>, StoreError>;

    async fn get_workflow_status(
        &self,
        workflow_uuid: Uuid,
    ) -> Result<WorkflowStatusSnapshot, StoreError>;

    /// Read the recorded WorkflowInputs for a UUID without touching
    /// `recovery_attempts`, used by `executeWorkflowUUID` (tests/admin/debug).
    async fn get_workflow_inputs(&self, workflow_uuid: Uuid) -> Result<Option<String>, StoreError>;

    /// Block (internally) until the workflow reaches a terminal status,
    /// then return its recorded output or error.
    async fn get_workflow_result(
        &self,
        workflow_uuid: Uuid,
    ) -> Result<CheckedWorkflowOutput, StoreError>;

    async fn get_workflows(&self, filter: WorkflowFilter) -> Result<Vec<WorkflowStatusRow>, StoreError>;

    /// Set status to CANCELLED if non-terminal and reset recovery_attempts
    /// to 0.
    async fn cancel_workflow(&self, workflow_uuid: Uuid) -> Result<(), StoreError>;

    /// Increment `recovery_attempts`; if it now exceeds `max_recovery_attempts`,
    /// mark RETRIES_EXCEEDED and return `Ok(None)`. Otherwise return the
    /// recorded inputs for re-invocation.
    async fn start_recovery_attempt(
        &self,
        workflow_uuid: Uuid,
        max_recovery_attempts: i64,
    ) -> Result<Option<String>, StoreError>;

    /// Bring the SDB schema up to date (idempotent).
    async fn ensure_schema(&self) -> Result<(), StoreError>;
}
