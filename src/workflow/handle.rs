//! The Handle interface: `getWorkflowUUID`, `getStatus`, `getResult`.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::error::DbosError;
use crate::persistence::{CheckedWorkflowOutput, SystemDatabase};

use super::status::WorkflowStatus;

/// A handle to a started workflow, bound to its `workflow_uuid`.
///
/// `getResult` blocks (asynchronously) until the workflow reaches a
/// terminal state, polling the store and re-reading before concluding —
/// the same "always re-read from the DB" rule the notification dispatcher
/// follows.
pub struct WorkflowHandle<R> {
    workflow_uuid: Uuid,
    store: Arc<dyn SystemDatabase>,
    poll_interval: std::time::Duration,
    _marker: PhantomData<R>,
}

impl<R: DeserializeOwned> WorkflowHandle<R> {
    pub fn new(workflow_uuid: Uuid, store: Arc<dyn SystemDatabase>) -> Self {
        Self {
            workflow_uuid,
            store,
            poll_interval: std::time::Duration::from_millis(50),
            _marker: PhantomData,
        }
    }

    pub fn get_workflow_uuid(&self) -> Uuid {
        self.workflow_uuid
    }

    pub async fn get_status(&self) -> Result<Option<WorkflowStatus>, DbosError> {
        match self.store.get_workflow_status(self.workflow_uuid).await {
            Ok(snapshot) => Ok(Some(snapshot.status)),
            Err(crate::persistence::StoreError::WorkflowNotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Block until terminal; propagate the recorded error, or deserialize
    /// and return the recorded output.
    pub async fn get_result(&self) -> Result<R, DbosError> {
        loop {
            match self.store.get_workflow_result(self.workflow_uuid).await? {
                CheckedWorkflowOutput::Success(output) => {
                    return Ok(serde_json::from_str(&output)?);
                }
                CheckedWorkflowOutput::Error(error) => {
                    return Err(serde_json::from_str::<DehydratedError>(&error)
                        .map(DehydratedError::into_dbos_error)
                        .unwrap_or(DbosError::Initialization(error)));
                }
                CheckedWorkflowOutput::Pending => {
                    tokio::time::sleep(self.poll_interval).await;
                }
            }
        }
    }
}

/// Errors recorded in `WorkflowStatus.error`/`OperationOutputs.error` are
/// stored as JSON so they survive the round trip through TEXT columns;
/// this is the shape the engine serializes workflow-body errors into.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct DehydratedError {
    pub message: String,
    #[serde(default)]
    pub retryable: bool,
}

impl DehydratedError {
    pub fn from_dbos_error(error: &DbosError) -> Self {
        Self { message: error.to_string(), retryable: error.is_retryable() }
    }

    pub fn into_dbos_error(self) -> DbosError {
        DbosError::Response { status: 500, message: self.message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemorySystemDatabase;

    #[tokio::test]
    async fn get_result_returns_deserialized_success() {
        let store: Arc<dyn SystemDatabase> = Arc::new(InMemorySystemDatabase::new());
        let uuid = Uuid::new_v4();
        let identity = crate::persistence::Identity::default();
        store
        .init_workflow_status(uuid, "wf", None, None, &identity, None, "local", None, "[]")
        .await
        .unwrap();
        store.buffer_workflow_status(uuid, Some("42".to_string())).await.unwrap();
        store.flush_workflow_status_buffer().await.unwrap();

        let handle: WorkflowHandle<i64> = WorkflowHandle::new(uuid, store);
        assert_eq!(handle.get_result().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn get_status_reports_pending_before_completion() {
        let store: Arc<dyn SystemDatabase> = Arc::new(InMemorySystemDatabase::new());
        let uuid = Uuid::new_v4();
        let identity = crate::persistence::Identity::default();
        store
        .init_workflow_status(uuid, "wf", None, None, &identity, None, "local", None, "[]")
        .await
        .unwrap();

        let handle: WorkflowHandle<i64> = WorkflowHandle::new(uuid, store);
        assert_eq!(handle.get_status().await.unwrap(), Some(WorkflowStatus::Pending));
    }

    #[tokio::test]
    async fn get_result_deserializes_recorded_dehydrated_error() {
        let store: Arc<dyn SystemDatabase> = Arc::new(InMemorySystemDatabase::new());
        let uuid = Uuid::new_v4();
        let identity = crate::persistence::Identity::default();
        store
        .init_workflow_status(uuid, "wf", None, None, &identity, None, "local", None, "[]")
        .await
        .unwrap();
        let payload = DehydratedError::from_dbos_error(&DbosError::Store(
            crate::persistence::StoreError::SerializationFailure,
        ));
        let payload_json = serde_json::to_string(&payload).unwrap();
        assert!(payload.retryable);
        store.record_workflow_error(uuid, &payload_json).await.unwrap();

        let handle: WorkflowHandle<i64> = WorkflowHandle::new(uuid, store);
        let err = handle.get_result().await.unwrap_err();
        assert!(matches!(err, DbosError::Response { status: 500, .. }));
        assert_eq!(err.to_string(), "response error (500): serialization failure, retry the transaction");
    }
}
