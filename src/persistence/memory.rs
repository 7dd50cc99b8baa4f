//! In-memory `SystemDatabase`, used by unit tests and the debug context's
//! scratch state. Not suitable for crash recovery since nothing survives
//! process exit.

use std::collections::HashMap;
use std::collections::VecDeque;

use async_trait::async_trait;
use parking_lot::RwLock;
use uuid::Uuid;

use super::entities::{
    Identity, NotificationRow, OperationOutputRow, WorkflowFilter, WorkflowStatusRow,
    WorkflowStatusValue,
};
use super::store::{CheckedWorkflowOutput, StoreError, SystemDatabase, WorkflowStatusSnapshot};

#[derive(Debug, Clone)]
struct WorkflowState {
    status: WorkflowStatusRow,
    inputs: Option<String>,
    operations: HashMap<i64, OperationOutputRow>,
    buffered_output: Option<Option<String>>,
}

#[derive(Default)]
struct Inner {
    workflows: HashMap<Uuid, WorkflowState>,
    notifications: HashMap<(Uuid, String), VecDeque<NotificationRow>>,
    events: HashMap<(Uuid, String), String>,
}

/// An in-memory stand-in for the Postgres-backed system database.
pub struct InMemorySystemDatabase {
    inner: RwLock<Inner>,
}

impl InMemorySystemDatabase {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    /// Test/introspection helper: number of workflow rows currently held.
    pub fn workflow_count(&self) -> usize {
        self.inner.read().workflows.len()
    }

    /// Test/introspection helper: clear all state.
    pub fn clear(&self) {
        *self.inner.write() = Inner::default();
    }

    fn now_millis() -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

impl Default for InMemorySystemDatabase {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SystemDatabase for InMemorySystemDatabase {
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
    ) -> Result<String, StoreError> {
        let mut inner = self.inner.write();
        let now = Self::now_millis();

        if let Some(existing) = inner.workflows.get(&workflow_uuid) {
            if existing.status.name != name
                || existing.status.class_name.as_deref() != class_name
                || existing.status.config_name.as_deref() != config_name
            {
                return Err(StoreError::ConflictingWorkflow(workflow_uuid));
            }
        }

        let state = inner.workflows.entry(workflow_uuid).or_insert_with(|| WorkflowState {
                status: WorkflowStatusRow {
                    workflow_uuid,
                    status: WorkflowStatusValue::Pending,
                    name: name.to_string(),
                    class_name: class_name.map(str::to_string),
                    config_name: config_name.map(str::to_string),
                    authenticated_user: identity.authenticated_user.clone(),
                    assumed_role: identity.assumed_role.clone(),
                    authenticated_roles: if identity.authenticated_roles.is_empty() {
                        None
                    } else {
                        Some(identity.authenticated_roles.join(","))
                    },
                    request: request.map(str::to_string),
                    output: None,
                    error: None,
                    executor_id: executor_id.to_string(),
                    application_version: application_version.map(str::to_string),
                    created_at: now,
                    updated_at: now,
                    recovery_attempts: 0,
                },
                inputs: None,
                operations: HashMap::new(),
                buffered_output: None,
            });
        if state.inputs.is_none() {
            state.inputs = Some(args.to_string());
        }
        Ok(state.inputs.clone().unwrap())
    }

    async fn check_workflow_output(
        &self,
        workflow_uuid: Uuid,
    ) -> Result<CheckedWorkflowOutput, StoreError> {
        let inner = self.inner.read();
        let state = inner
        .workflows
        .get(&workflow_uuid)
        .ok_or(StoreError::WorkflowNotFound(workflow_uuid))?;
        Ok(match state.status.status {
                WorkflowStatusValue::Success => {
                    CheckedWorkflowOutput::Success(state.status.output.clone().unwrap_or_default())
                }
                WorkflowStatusValue::Error => {
                    CheckedWorkflowOutput::Error(state.status.error.clone().unwrap_or_default())
                }
                _ => CheckedWorkflowOutput::Pending,
            })
    }

    async fn buffer_workflow_status(
        &self,
        workflow_uuid: Uuid,
        output: Option<String>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let state = inner
        .workflows
        .get_mut(&workflow_uuid)
        .ok_or(StoreError::WorkflowNotFound(workflow_uuid))?;
        state.buffered_output = Some(output);
        Ok(())
    }

    async fn flush_workflow_status_buffer(&self) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let now = Self::now_millis();
        for state in inner.workflows.values_mut() {
            if let Some(output) = state.buffered_output.take() {
                if !state.status.status.is_terminal() {
                    state.status.status = WorkflowStatusValue::Success;
                    state.status.output = output;
                    state.status.updated_at = now;
                }
            }
        }
        Ok(())
    }

    async fn record_workflow_error(
        &self,
        workflow_uuid: Uuid,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let state = inner
        .workflows
        .get_mut(&workflow_uuid)
        .ok_or(StoreError::WorkflowNotFound(workflow_uuid))?;
        if !state.status.status.is_terminal() {
            state.status.status = WorkflowStatusValue::Error;
            state.status.error = Some(error.to_string());
            state.status.updated_at = Self::now_millis();
        }
        Ok(())
    }

    async fn check_operation_output(
        &self,
        workflow_uuid: Uuid,
        function_id: i64,
    ) -> Result<Option<OperationOutputRow>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .workflows
            .get(&workflow_uuid)
            .and_then(|s| s.operations.get(&function_id))
            .cloned())
    }

    async fn record_operation_output(
        &self,
        workflow_uuid: Uuid,
        function_id: i64,
        output: &str,
        txn_snapshot: Option<&str>,
        txn_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let now = Self::now_millis();
        let state = inner
        .workflows
        .get_mut(&workflow_uuid)
        .ok_or(StoreError::WorkflowNotFound(workflow_uuid))?;
        if state.operations.contains_key(&function_id) {
            return Err(StoreError::OperationConflict { workflow_uuid, function_id });
        }
        state.operations.insert(
            function_id,
            OperationOutputRow {
                workflow_uuid,
                function_id,
                output: Some(output.to_string()),
                error: None,
                txn_snapshot: txn_snapshot.map(str::to_string),
                txn_id: txn_id.map(str::to_string),
                created_at: now,
            },
        );
        Ok(())
    }

    async fn record_operation_error(
        &self,
        workflow_uuid: Uuid,
        function_id: i64,
        error: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let now = Self::now_millis();
        let state = inner
        .workflows
        .get_mut(&workflow_uuid)
        .ok_or(StoreError::WorkflowNotFound(workflow_uuid))?;
        if state.operations.contains_key(&function_id) {
            return Err(StoreError::OperationConflict { workflow_uuid, function_id });
        }
        state.operations.insert(
            function_id,
            OperationOutputRow {
                workflow_uuid,
                function_id,
                output: None,
                error: Some(error.to_string()),
                txn_snapshot: None,
                txn_id: None,
                created_at: now,
            },
        );
        Ok(())
    }

    async fn send(
        &self,
        sender_uuid: Uuid,
        function_id: i64,
        destination_uuid: Uuid,
        message: &str,
        topic: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let now = Self::now_millis();

        {
            let state = inner
            .workflows
            .get(&sender_uuid)
            .ok_or(StoreError::WorkflowNotFound(sender_uuid))?;
            if state.operations.contains_key(&function_id) {
                return Err(StoreError::OperationConflict { workflow_uuid: sender_uuid, function_id });
            }
        }

        // Enqueue the message and record the OAOO entry together, matching
        // `PostgresSystemDatabase::send`'s single co-committed transaction:
        // without the operations row, replay would re-enqueue the message
        // instead of short-circuiting on the recorded output.
        inner
        .notifications
        .entry((destination_uuid, topic.to_string()))
        .or_default()
        .push_back(NotificationRow {
                destination_uuid,
                topic: topic.to_string(),
                message: message.to_string(),
                created_at: chrono::Utc::now(),
            });

        inner
        .workflows
        .get_mut(&sender_uuid)
        .expect("checked present above")
        .operations
        .insert(
            function_id,
            OperationOutputRow {
                workflow_uuid: sender_uuid,
                function_id,
                output: Some("true".to_string()),
                error: None,
                txn_snapshot: None,
                txn_id: None,
                created_at: now,
            },
        );
        Ok(())
    }

    async fn recv_poll(
        &self,
        destination_uuid: Uuid,
        topic: &str,
    ) -> Result<Option<NotificationRow>, StoreError> {
        let mut inner = self.inner.write();
        Ok(inner
            .notifications
            .get_mut(&(destination_uuid, topic.to_string()))
            .and_then(|q| q.pop_front()))
    }

    async fn set_event(
        &self,
        workflow_uuid: Uuid,
        function_id: i64,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let now = Self::now_millis();

        {
            let state = inner
            .workflows
            .get(&workflow_uuid)
            .ok_or(StoreError::WorkflowNotFound(workflow_uuid))?;
            if state.operations.contains_key(&function_id) {
                return Err(StoreError::OperationConflict { workflow_uuid, function_id });
            }
        }

        let k = (workflow_uuid, key.to_string());
        if inner.events.contains_key(&k) {
            return Err(StoreError::DuplicateEvent {
                    workflow_uuid,
                    key: key.to_string(),
                });
        }
        inner.events.insert(k, value.to_string());

        // Record the OAOO entry alongside the event, matching
        // `PostgresSystemDatabase::set_event`'s co-committed transaction:
        // without it, replay would call `set_event` again instead of
        // short-circuiting on the recorded output, and a second identical
        // call would wrongly surface DuplicateWorkflowEvent.
        inner
        .workflows
        .get_mut(&workflow_uuid)
        .expect("checked present above")
        .operations
        .insert(
            function_id,
            OperationOutputRow {
                workflow_uuid,
                function_id,
                output: Some("true".to_string()),
                error: None,
                txn_snapshot: None,
                txn_id: None,
                created_at: now,
            },
        );
        Ok(())
    }

    async fn get_event_value(
        &self,
        target_uuid: Uuid,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        let inner = self.inner.read();
        Ok(inner.events.get(&(target_uuid, key.to_string())).cloned())
    }

    async fn get_pending_workflows(&self, executor_id: &str) -> Result<Vec<Uuid>, StoreError> {
        let inner = self.inner.read();
        Ok(inner
            .workflows
            .values()
            .filter(|s| s.status.status == WorkflowStatusValue::Pending && s.status.executor_id == executor_id)
            .map(|s| s.status.workflow_uuid)
            .collect())
    }

    async fn get_workflow_status(
        &self,
        workflow_uuid: Uuid,
    ) -> Result<WorkflowStatusSnapshot, StoreError> {
        let inner = self.inner.read();
        let state = inner
        .workflows
        .get(&workflow_uuid)
        .ok_or(StoreError::WorkflowNotFound(workflow_uuid))?;
        Ok(WorkflowStatusSnapshot {
                status: state.status.status,
                name: state.status.name.clone(),
                identity: Identity {
                    authenticated_user: state.status.authenticated_user.clone(),
                    assumed_role: state.status.assumed_role.clone(),
                    authenticated_roles: state
                    .status
                    .authenticated_roles
                    .clone()
                    .map(|r| r.split(',').map(str::to_string).collect())
                    .unwrap_or_default(),
                },
                request: state.status.request.clone(),
            })
    }

    async fn get_workflow_result(
        &self,
        workflow_uuid: Uuid,
    ) -> Result<CheckedWorkflowOutput, StoreError> {
        // No blocking wait in the in-memory store: tests poll directly.
        self.check_workflow_output(workflow_uuid).await
    }

    async fn get_workflow_inputs(&self, workflow_uuid: Uuid) -> Result<Option<String>, StoreError> {
        let inner = self.inner.read();
        Ok(inner.workflows.get(&workflow_uuid).and_then(|s| s.inputs.clone()))
    }

    async fn get_workflows(&self, filter: WorkflowFilter) -> Result<Vec<WorkflowStatusRow>, StoreError> {
        let inner = self.inner.read();
        let mut rows: Vec<WorkflowStatusRow> = inner
        .workflows
        .values()
        .map(|s| s.status.clone())
        .filter(|row| filter.status.map(|s| s == row.status).unwrap_or(true))
        .filter(|row| filter.name.as_deref().map(|n| n == row.name).unwrap_or(true))
        .filter(|row| {
                filter
                .authenticated_user
                .as_deref()
                .map(|u| row.authenticated_user.as_deref() == Some(u))
                .unwrap_or(true)
            })
        .collect();
        rows.sort_by_key(|r| r.created_at);
        if let Some(limit) = filter.limit {
            rows.truncate(limit.max(0) as usize);
        }
        Ok(rows)
    }

    async fn cancel_workflow(&self, workflow_uuid: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write();
        let state = inner
        .workflows
        .get_mut(&workflow_uuid)
        .ok_or(StoreError::WorkflowNotFound(workflow_uuid))?;
        if !state.status.status.is_terminal() {
            state.status.status = WorkflowStatusValue::Cancelled;
            state.status.recovery_attempts = 0;
            state.status.updated_at = Self::now_millis();
        }
        Ok(())
    }

    async fn start_recovery_attempt(
        &self,
        workflow_uuid: Uuid,
        max_recovery_attempts: i64,
    ) -> Result<Option<String>, StoreError> {
        let mut inner = self.inner.write();
        let state = inner
        .workflows
        .get_mut(&workflow_uuid)
        .ok_or(StoreError::WorkflowNotFound(workflow_uuid))?;
        state.status.recovery_attempts += 1;
        if state.status.recovery_attempts > max_recovery_attempts {
            state.status.status = WorkflowStatusValue::RetriesExceeded;
            state.status.updated_at = Self::now_millis();
            return Ok(None);
        }
        Ok(state.inputs.clone())
    }

    async fn ensure_schema(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> Identity {
        Identity::default()
    }

    #[tokio::test]
    async fn init_workflow_status_is_first_writer_wins() {
        let db = InMemorySystemDatabase::new();
        let uuid = Uuid::new_v4();
        let first = db
        .init_workflow_status(uuid, "wf", None, None, &identity(), None, "local", None, "[1]")
        .await
        .unwrap();
        let second = db
        .init_workflow_status(uuid, "wf", None, None, &identity(), None, "local", None, "[2]")
        .await
        .unwrap();
        assert_eq!(first, "[1]");
        assert_eq!(second, "[1]");
    }

    #[tokio::test]
    async fn init_workflow_status_rejects_a_different_name_under_the_same_uuid() {
        let db = InMemorySystemDatabase::new();
        let uuid = Uuid::new_v4();
        db.init_workflow_status(uuid, "wfA", None, None, &identity(), None, "local", None, "[]")
        .await
        .unwrap();
        let err = db
        .init_workflow_status(uuid, "wfB", None, None, &identity(), None, "local", None, "[]")
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::ConflictingWorkflow(_)));
    }

    #[tokio::test]
    async fn operation_output_is_write_once() {
        let db = InMemorySystemDatabase::new();
        let uuid = Uuid::new_v4();
        db.init_workflow_status(uuid, "wf", None, None, &identity(), None, "local", None, "[]")
        .await
        .unwrap();
        db.record_operation_output(uuid, 0, "\"a\"", None, None).await.unwrap();
        let err = db
        .record_operation_output(uuid, 0, "\"b\"", None, None)
        .await
        .unwrap_err();
        assert!(matches!(err, StoreError::OperationConflict {.. }));
    }

    #[tokio::test]
    async fn set_event_rejects_duplicate_key() {
        let db = InMemorySystemDatabase::new();
        let uuid = Uuid::new_v4();
        db.init_workflow_status(uuid, "wf", None, None, &identity(), None, "local", None, "[]")
        .await
        .unwrap();
        db.set_event(uuid, 0, "k1", "\"v1\"").await.unwrap();
        let err = db.set_event(uuid, 1, "k1", "\"v2\"").await.unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEvent {.. }));
        assert_eq!(db.get_event_value(uuid, "k1").await.unwrap(), Some("\"v1\"".to_string()));
    }

    #[tokio::test]
    async fn send_and_recv_are_fifo() {
        let db = InMemorySystemDatabase::new();
        let dest = Uuid::new_v4();
        db.init_workflow_status(dest, "wf", None, None, &identity(), None, "local", None, "[]")
        .await
        .unwrap();
        db.send(dest, 0, dest, "\"m1\"", "T").await.unwrap();
        db.send(dest, 1, dest, "\"m2\"", "T").await.unwrap();
        let first = db.recv_poll(dest, "T").await.unwrap().unwrap();
        let second = db.recv_poll(dest, "T").await.unwrap().unwrap();
        assert_eq!(first.message, "\"m1\"");
        assert_eq!(second.message, "\"m2\"");
        assert!(db.recv_poll(dest, "T").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn send_records_an_operation_output_so_replay_does_not_resend() {
        let db = InMemorySystemDatabase::new();
        let sender = Uuid::new_v4();
        let dest = Uuid::new_v4();
        db.init_workflow_status(sender, "wf", None, None, &identity(), None, "local", None, "[]")
        .await
        .unwrap();
        db.send(sender, 0, dest, "\"m1\"", "T").await.unwrap();

        let recorded = db.check_operation_output(sender, 0).await.unwrap();
        assert!(recorded.is_some(), "send must co-record an OperationOutputs row so replay short-circuits");

        // A second identical send at the same function_id is a conflict,
        // not a silent re-send — the caller (`WorkflowContext::send`)
        // never reaches this in practice because it probes first, but the
        // store must still enforce write-once per (workflow_uuid, fid).
        let err = db.send(sender, 0, dest, "\"m2\"", "T").await.unwrap_err();
        assert!(matches!(err, StoreError::OperationConflict {.. }));
        assert_eq!(db.recv_poll(dest, "T").await.unwrap().unwrap().message, "\"m1\"");
    }

    #[tokio::test]
    async fn set_event_records_an_operation_output_so_replay_does_not_reject_it() {
        let db = InMemorySystemDatabase::new();
        let uuid = Uuid::new_v4();
        db.init_workflow_status(uuid, "wf", None, None, &identity(), None, "local", None, "[]")
        .await
        .unwrap();
        db.set_event(uuid, 0, "k1", "\"v1\"").await.unwrap();

        let recorded = db.check_operation_output(uuid, 0).await.unwrap();
        assert!(recorded.is_some(), "set_event must co-record an OperationOutputs row so replay short-circuits");
    }

    #[tokio::test]
    async fn recovery_attempts_past_max_goes_to_dead_letter() {
        let db = InMemorySystemDatabase::new();
        let uuid = Uuid::new_v4();
        db.init_workflow_status(uuid, "wf", None, None, &identity(), None, "local", None, "[]")
        .await
        .unwrap();
        assert!(db.start_recovery_attempt(uuid, 1).await.unwrap().is_some());
        assert!(db.start_recovery_attempt(uuid, 1).await.unwrap().is_none());
        let status = db.get_workflow_status(uuid).await.unwrap();
        assert_eq!(status.status, WorkflowStatusValue::RetriesExceeded);
    }
}
