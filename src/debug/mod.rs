//! Debug/Replay Context: re-executes a recorded workflow against a
//! previously recorded OperationOutputs stream. Every step probes
//! OperationOutputs and **must** find a recorded row; missing rows produce
//! [`DebuggerError::MissingRecordedOutput`]. Non-replayable effects (send,
//! setEvent) never fire — the recorded outcome is returned. Read-only
//! transactions re-run and are checked for a JSON-equal match against the
//! recorded output (a mismatch only warns; it does not fail the replay).

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Postgres, Transaction};
use tracing::warn;
use uuid::Uuid;

use crate::error::DbosError;
use crate::persistence::{OperationOutputRow, SystemDatabase};
use crate::reliability::RetryPolicy;
use crate::udb::{TransactionConfig, UserDatabaseAdapter};
use crate::workflow::{StepDriver, WorkflowHandle};

#[derive(Debug, thiserror::Error)]
pub enum DebuggerError {
    #[error("cannot find recorded output for {workflow_uuid} at function_id {function_id}")]
    MissingRecordedOutput { workflow_uuid: Uuid, function_id: i64 },
}

/// Re-executes a recorded workflow. Constructed from an existing
/// `workflow_uuid`; shares the `function_id` allocation discipline with
/// [`crate::workflow::WorkflowContext`] but never performs a real side
/// effect and never falls back to executing a step body when no recorded
/// row exists — that is an error, not a cache miss.
pub struct DebugWorkflowContext {
    workflow_uuid: Uuid,
    store: Arc<dyn SystemDatabase>,
    udb: Option<Arc<UserDatabaseAdapter>>,
    function_id: std::sync::atomic::AtomicI64,
}

impl DebugWorkflowContext {
    pub fn new(workflow_uuid: Uuid, store: Arc<dyn SystemDatabase>) -> Self {
        Self {
            workflow_uuid,
            store,
            udb: None,
            function_id: std::sync::atomic::AtomicI64::new(0),
        }
    }

    /// Attach a UDB adapter so read-only transaction steps can be re-run
    /// against the live database for a divergence check, matching
    /// [`crate::workflow::WorkflowContext`]'s own `udb` field. Without one,
    /// read-only transactions fall back to returning the recorded output
    /// unchecked.
    pub fn with_udb(mut self, udb: Arc<UserDatabaseAdapter>) -> Self {
        self.udb = Some(udb);
        self
    }

    pub fn workflow_uuid(&self) -> Uuid {
        self.workflow_uuid
    }

    fn next_function_id(&self) -> i64 {
        self.function_id.fetch_add(1, std::sync::atomic::Ordering::SeqCst)
    }

    async fn require_recorded(&self, fid: i64) -> Result<OperationOutputRow, DebuggerError> {
        self.store
        .check_operation_output(self.workflow_uuid, fid)
        .await
        .map_err(|_| DebuggerError::MissingRecordedOutput { workflow_uuid: self.workflow_uuid, function_id: fid })?
        .ok_or(DebuggerError::MissingRecordedOutput { workflow_uuid: self.workflow_uuid, function_id: fid })
    }

    /// A non-replayable step (transaction, communicator, child workflow,
    /// sleep): return the recorded value without ever invoking the user's
    /// body.
    pub async fn replay_step<T: DeserializeOwned>(&self) -> Result<T, DebuggerError> {
        let fid = self.next_function_id();
        let row = self.require_recorded(fid).await?;
        let output = row.output.ok_or(DebuggerError::MissingRecordedOutput {
                workflow_uuid: self.workflow_uuid,
                function_id: fid,
            })?;
        serde_json::from_str(&output).map_err(|_| DebuggerError::MissingRecordedOutput {
                workflow_uuid: self.workflow_uuid,
                function_id: fid,
            })
    }

    /// A read-only transaction step: re-run `body` and compare its output
    /// against the recorded value; a mismatch only warns.
    pub async fn replay_read_only<F, Fut, T>(&self, body: F) -> Result<T, DebuggerError>
    where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = T>,
    T: Serialize + DeserializeOwned,
    {
        let fid = self.next_function_id();
        let row = self.require_recorded(fid).await?;
        let recorded = row.output.ok_or(DebuggerError::MissingRecordedOutput {
                workflow_uuid: self.workflow_uuid,
                function_id: fid,
            })?;

        let fresh = body().await;
        let fresh_json = serde_json::to_string(&fresh).unwrap_or_default();
        if fresh_json != recorded {
            warn!(
                workflow_uuid = %self.workflow_uuid,
                function_id = fid,
                recorded,
                fresh_json,
                "replay divergence: re-executed read-only transaction did not match recorded output"
            );
        }
        serde_json::from_str(&recorded).map_err(|_| DebuggerError::MissingRecordedOutput {
                workflow_uuid: self.workflow_uuid,
                function_id: fid,
            })
    }

    /// Non-replayable send/setEvent: never fires; returns the recorded
    /// outcome (typically `()`), consuming one function_id for parity with
    /// [`crate::workflow::WorkflowContext`].
    pub async fn skip_non_replayable(&self) -> Result<(), DebuggerError> {
        let fid = self.next_function_id();
        self.require_recorded(fid).await?;
        Ok(())
    }
}

/// Drives a [`DebugWorkflowContext`] through the same step calls a workflow
/// body makes against a live [`crate::workflow::WorkflowContext`]. A body
/// written against `impl StepDriver` instead of the concrete context can run
/// unmodified in either mode.
#[async_trait]
impl StepDriver for DebugWorkflowContext {
    async fn transaction<F, Fut, T>(&self, config: TransactionConfig, body: F) -> Result<T, DbosError>
    where
    F: Fn(&mut Transaction<'static, Postgres>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, DbosError>> + Send,
    T: Serialize + DeserializeOwned + Send + Sync,
    {
        let fid = self.next_function_id();
        let row = self.require_recorded(fid).await.map_err(DbosError::from)?;
        let recorded = row.output.ok_or_else(|| {
                DbosError::from(DebuggerError::MissingRecordedOutput { workflow_uuid: self.workflow_uuid, function_id: fid })
            })?;

        if config.read_only {
            if let Some(udb) = &self.udb {
                if let Ok(mut tx) = udb.begin(config).await {
                    if let Ok(fresh) = body(&mut tx).await {
                        tx.rollback().await.ok();
                        let fresh_json = serde_json::to_string(&fresh).unwrap_or_default();
                        if fresh_json != recorded {
                            warn!(
                                workflow_uuid = %self.workflow_uuid,
                                function_id = fid,
                                recorded,
                                fresh_json,
                                "replay divergence: re-executed read-only transaction did not match recorded output"
                            );
                        }
                    } else {
                        tx.rollback().await.ok();
                    }
                }
            }
        }

        serde_json::from_str(&recorded).map_err(|_| {
            DbosError::from(DebuggerError::MissingRecordedOutput { workflow_uuid: self.workflow_uuid, function_id: fid })
        })
    }

    async fn communicator<F, Fut, T>(&self, _policy: &RetryPolicy, f: F) -> Result<T, DbosError>
    where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, DbosError>> + Send,
    T: Serialize + DeserializeOwned + Send + Sync,
    {
        let _ = f; // external calls never re-fire during replay
        self.replay_step().await.map_err(DbosError::from)
    }

    async fn send(&self, _destination_uuid: Uuid, _message: &str, _topic: Option<&str>) -> Result<(), DbosError> {
        self.skip_non_replayable().await.map_err(DbosError::from)
    }

    async fn recv(&self, _topic: Option<&str>, _timeout: Duration) -> Result<Option<String>, DbosError> {
        self.replay_step().await.map_err(DbosError::from)
    }

    async fn set_event(&self, _key: &str, _value: &str) -> Result<(), DbosError> {
        self.skip_non_replayable().await.map_err(DbosError::from)
    }

    async fn get_event(
        &self,
        _target_uuid: Uuid,
        _key: &str,
        _timeout: Duration,
    ) -> Result<Option<String>, DbosError> {
        self.replay_step().await.map_err(DbosError::from)
    }

    async fn sleep(&self, _duration: Duration) -> Result<(), DbosError> {
        self.skip_non_replayable().await.map_err(DbosError::from)
    }

    async fn start_child_workflow<O: DeserializeOwned + Send + 'static>(
        &self,
        _name: &str,
        _args: serde_json::Value,
    ) -> Result<WorkflowHandle<O>, DbosError> {
        let fid = self.next_function_id();
        let row = self.require_recorded(fid).await.map_err(DbosError::from)?;
        let recorded = row.output.ok_or_else(|| {
                DbosError::from(DebuggerError::MissingRecordedOutput { workflow_uuid: self.workflow_uuid, function_id: fid })
            })?;
        let child_uuid: Uuid = recorded.parse().map_err(|_| {
                DbosError::from(DebuggerError::MissingRecordedOutput { workflow_uuid: self.workflow_uuid, function_id: fid })
            })?;
        Ok(WorkflowHandle::new(child_uuid, Arc::clone(&self.store)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{Identity, InMemorySystemDatabase};

    #[tokio::test]
    async fn missing_recorded_row_is_an_error() {
        let store: Arc<dyn SystemDatabase> = Arc::new(InMemorySystemDatabase::new());
        let workflow_uuid = Uuid::new_v4();
        store
        .init_workflow_status(workflow_uuid, "wf", None, None, &Identity::default(), None, "local", None, "[]")
        .await
        .unwrap();
        let ctx = DebugWorkflowContext::new(workflow_uuid, store);
        let err = ctx.replay_step::<i64>().await.unwrap_err();
        assert!(matches!(err, DebuggerError::MissingRecordedOutput {.. }));
    }

    #[tokio::test]
    async fn replay_step_returns_recorded_value_without_side_effects() {
        let store: Arc<dyn SystemDatabase> = Arc::new(InMemorySystemDatabase::new());
        let workflow_uuid = Uuid::new_v4();
        store
        .init_workflow_status(workflow_uuid, "wf", None, None, &Identity::default(), None, "local", None, "[]")
        .await
        .unwrap();
        store.record_operation_output(workflow_uuid, 0, "42", None, None).await.unwrap();

        let ctx = DebugWorkflowContext::new(workflow_uuid, store);
        let value: i64 = ctx.replay_step().await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn replay_read_only_warns_but_returns_recorded_on_mismatch() {
        let store: Arc<dyn SystemDatabase> = Arc::new(InMemorySystemDatabase::new());
        let workflow_uuid = Uuid::new_v4();
        store
        .init_workflow_status(workflow_uuid, "wf", None, None, &Identity::default(), None, "local", None, "[]")
        .await
        .unwrap();
        store.record_operation_output(workflow_uuid, 0, "1", None, None).await.unwrap();

        let ctx = DebugWorkflowContext::new(workflow_uuid, store);
        let value: i64 = ctx.replay_read_only(|| async { 2 }).await.unwrap();
        assert_eq!(value, 1, "recorded value wins even though the re-executed body diverged");
    }
}
