//! The Workflow Context: drives sequential execution of one
//! workflow invocation, assigning `function_id`s and enforcing OAOO by
//! consulting the System Database before executing each step.

use std::future::Future;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::{Postgres, Transaction};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::engine::notify::NotificationDispatcher;
use crate::engine::registry::IsolationLevel;
use crate::error::DbosError;
use crate::persistence::{Identity, OperationOutputRow, StoreError, SystemDatabase, NULL_TOPIC};
use crate::reliability::RetryPolicy;
use crate::udb::{TransactionConfig, UdbError, UserDatabaseAdapter};

use super::handle::{DehydratedError, WorkflowHandle};

/// The step-execution surface shared by live workflow bodies and the
/// debug/replay context (spec §4.5). [`WorkflowContext`] performs each step
/// for real, recording its output under OAOO; [`crate::debug::DebugWorkflowContext`]
/// never performs a side effect and returns the recorded output for the same
/// call, so a test or debugging tool can drive either implementation through
/// an identical sequence of step calls.
#[async_trait]
pub trait StepDriver: Send + Sync {
    async fn transaction<F, Fut, T>(&self, config: TransactionConfig, body: F) -> Result<T, DbosError>
    where
    F: Fn(&mut Transaction<'static, Postgres>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, DbosError>> + Send,
    T: Serialize + DeserializeOwned + Send + Sync;

    async fn communicator<F, Fut, T>(&self, policy: &RetryPolicy, f: F) -> Result<T, DbosError>
    where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, DbosError>> + Send,
    T: Serialize + DeserializeOwned + Send + Sync;

    async fn send(&self, destination_uuid: Uuid, message: &str, topic: Option<&str>) -> Result<(), DbosError>;

    async fn recv(&self, topic: Option<&str>, timeout: Duration) -> Result<Option<String>, DbosError>;

    async fn set_event(&self, key: &str, value: &str) -> Result<(), DbosError>;

    async fn get_event(
        &self,
        target_uuid: Uuid,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, DbosError>;

    async fn sleep(&self, duration: Duration) -> Result<(), DbosError>;

    async fn start_child_workflow<O: DeserializeOwned + Send + 'static>(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<WorkflowHandle<O>, DbosError>;
}

/// Per-invocation state machine driving one workflow body.
///
/// `function_id` starts at 0 and is incremented strictly in program order;
/// replays must allocate the same sequence of IDs for the OAOO decision to
/// be deterministic — this is the user's obligation, not something
/// the context can enforce by itself.
pub struct WorkflowContext {
    workflow_uuid: Uuid,
    store: Arc<dyn SystemDatabase>,
    udb: Option<Arc<UserDatabaseAdapter>>,
    dispatcher: Arc<NotificationDispatcher>,
    function_id: AtomicI64,
    identity: Identity,
    request: Option<String>,
    cancelled: std::sync::Arc<std::sync::atomic::AtomicBool>,
    /// Set by the executor that spawned this context, so `start_child_workflow`
    /// can invoke a child through it. Absent in contexts built directly by
    /// tests that don't exercise child workflows.
    executor: Option<std::sync::Weak<crate::engine::Executor>>,
}

impl WorkflowContext {
    pub fn new(
        workflow_uuid: Uuid,
        store: Arc<dyn SystemDatabase>,
        udb: Option<Arc<UserDatabaseAdapter>>,
        dispatcher: Arc<NotificationDispatcher>,
        identity: Identity,
        request: Option<String>,
    ) -> Self {
        Self {
            workflow_uuid,
            store,
            udb,
            dispatcher,
            function_id: AtomicI64::new(0),
            identity,
            request,
            cancelled: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            executor: None,
        }
    }

    pub fn with_executor(mut self, executor: std::sync::Weak<crate::engine::Executor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Share this context's cancellation flag with the caller, so an
    /// external `cancelWorkflow(uuid)` can flip it and have the in-flight
    /// body observe the cancellation at its next suspension point (spec
    /// §5). Replaces the context's own freshly-created flag with `flag`.
    pub fn with_cancellation_flag(mut self, flag: Arc<std::sync::atomic::AtomicBool>) -> Self {
        self.cancelled = flag;
        self
    }

    /// The shared cancellation flag backing this context's
    /// `check_cancelled` probes, so the executor that spawned this context
    /// can retain a handle to flip it from `cancel_workflow`.
    pub fn cancellation_flag(&self) -> Arc<std::sync::atomic::AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    pub fn workflow_uuid(&self) -> Uuid {
        self.workflow_uuid
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Recorded verbatim and re-presented to the replayed body on recovery.
    pub fn request(&self) -> Option<&str> {
        self.request.as_deref()
    }

    pub fn next_function_id(&self) -> i64 {
        self.function_id.fetch_add(1, Ordering::SeqCst)
    }

    pub fn mark_cancelled(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check_cancelled(&self) -> Result<(), DbosError> {
        if self.is_cancelled() {
            return Err(DbosError::WorkflowCancelled(self.workflow_uuid));
        }
        Ok(())
    }

    fn deserialize_recorded<T: DeserializeOwned>(row: &OperationOutputRow) -> Result<Option<T>, DbosError> {
        if let Some(output) = &row.output {
            return Ok(Some(serde_json::from_str(output)?));
        }
        if let Some(error) = &row.error {
            return Err(DbosError::Response { status: 500, message: error.clone() });
        }
        Ok(None)
    }

    pub fn handle<R: DeserializeOwned>(&self, workflow_uuid: Uuid) -> WorkflowHandle<R> {
        WorkflowHandle::new(workflow_uuid, Arc::clone(&self.store))
    }
}

#[async_trait]
impl StepDriver for WorkflowContext {
    // ------------------------------------------------------------------
    // Transaction step
    // ------------------------------------------------------------------

    /// Run `body` inside a UDB transaction, co-committing its effects with
    /// the OperationOutputs row.
    #[instrument(skip(self, body), fields(%self.workflow_uuid))]
    async fn transaction<F, Fut, T>(
        &self,
        config: TransactionConfig,
        body: F,
    ) -> Result<T, DbosError>
    where
    F: Fn(&mut Transaction<'static, Postgres>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, DbosError>> + Send,
    T: Serialize + DeserializeOwned + Send + Sync,
    {
        self.check_cancelled()?;
        let fid = self.next_function_id();

        if let Some(row) = self.store.check_operation_output(self.workflow_uuid, fid).await? {
            if let Some(value) = Self::deserialize_recorded::<T>(&row)? {
                debug!(fid, "transaction short-circuited by recorded output");
                return Ok(value);
            }
        }

        let udb = self
        .udb
        .as_ref()
        .ok_or_else(|| DbosError::Initialization("no UDB adapter configured".to_string()))?;

        let max_attempts = 2; // one retry on serialization failure/duplicate key
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut tx = udb.begin(config).await.map_err(udb_error_to_dbos)?;

            let result = body(&mut tx).await;
            let value = match result {
                Ok(value) => value,
                Err(e) => {
                    tx.rollback().await.ok();
                    return Err(e);
                }
            };

            if config.read_only {
                // Read-only transactions skip the output insert but still
                // probed above; they may be safely re-executed.
                tx.rollback().await.ok();
                return Ok(value);
            }

            let output = serde_json::to_string(&value)?;
            let insert_result = sqlx::query(
                "INSERT INTO dbos.operation_outputs (workflow_uuid, function_id, output, created_at) \
                VALUES ($1, $2, $3, $4)",
            )
            .bind(self.workflow_uuid.to_string())
            .bind(fid as i32)
            .bind(&output)
            .bind(chrono::Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await;

            match insert_result {
                Ok(_) => match tx.commit().await {
                    Ok(()) => return Ok(value),
                    Err(e) => {
                        let dbos_err = udb_error_to_dbos(UdbError::from(e));
                        if dbos_err.is_retryable() && attempt < max_attempts {
                            warn!(fid, attempt, "serialization failure committing transaction, retrying");
                            continue;
                        }
                        return Err(dbos_err);
                    }
                },
                Err(sqlx::Error::Database(ref db_err)) if db_err.code().as_deref() == Some("23505") => {
                    tx.rollback().await.ok();
                    if attempt < max_attempts {
                        warn!(fid, attempt, "duplicate operation output, retrying transaction");
                        continue;
                    }
                    return Err(DbosError::WorkflowConflict { workflow_uuid: self.workflow_uuid, function_id: fid });
                }
                Err(e) => {
                    tx.rollback().await.ok();
                    let dbos_err = udb_error_to_dbos(UdbError::from(e));
                    if dbos_err.is_retryable() && attempt < max_attempts {
                        warn!(fid, attempt, "serialization failure, retrying transaction");
                        continue;
                    }
                    return Err(dbos_err);
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // Communicator step
    // ------------------------------------------------------------------

    /// Run an idempotent external call with the configured retry policy.
    /// `retriesAllowed=false` is `RetryPolicy::no_retry()`.
    #[instrument(skip(self, f, policy), fields(%self.workflow_uuid))]
    async fn communicator<F, Fut, T>(
        &self,
        policy: &RetryPolicy,
        f: F,
    ) -> Result<T, DbosError>
    where
    F: Fn() -> Fut + Send + Sync,
    Fut: Future<Output = Result<T, DbosError>> + Send,
    T: Serialize + DeserializeOwned + Send + Sync,
    {
        self.check_cancelled()?;
        let fid = self.next_function_id();

        if let Some(row) = self.store.check_operation_output(self.workflow_uuid, fid).await? {
            if let Some(value) = Self::deserialize_recorded::<T>(&row)? {
                return Ok(value);
            }
        }

        let mut attempt = 1;
        loop {
            match f().await {
                Ok(value) => {
                    let output = serde_json::to_string(&value)?;
                    self.store
                    .record_operation_output(self.workflow_uuid, fid, &output, None, None)
                    .await?;
                    return Ok(value);
                }
                Err(e) => {
                    let retryable = policy.should_retry(None) && policy.has_attempts_remaining(attempt);
                    if !retryable {
                        let payload = serde_json::to_string(&DehydratedError::from_dbos_error(&e))
                        .unwrap_or_else(|_| e.to_string());
                        self.store
                        .record_operation_error(self.workflow_uuid, fid, &payload)
                        .await?;
                        return Err(e);
                    }
                    let delay = policy.delay_for_attempt(attempt + 1);
                    warn!(fid, attempt, ?delay, "communicator attempt failed, retrying");
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    // ------------------------------------------------------------------
    // send / recv
    // ------------------------------------------------------------------

    /// Atomically enqueue a message and record the send under OAOO.
    #[instrument(skip(self, message), fields(%self.workflow_uuid, %destination_uuid))]
    async fn send(
        &self,
        destination_uuid: Uuid,
        message: &str,
        topic: Option<&str>,
    ) -> Result<(), DbosError> {
        self.check_cancelled()?;
        let fid = self.next_function_id();
        if self.store.check_operation_output(self.workflow_uuid, fid).await?.is_some() {
            return Ok(());
        }
        let topic = topic.unwrap_or(NULL_TOPIC);
        self.store
        .send(self.workflow_uuid, fid, destination_uuid, message, topic)
        .await?;
        Ok(())
    }

    /// Receive the next message for `topic`, waiting up to `timeout` if the
    /// queue is currently empty.
    #[instrument(skip(self), fields(%self.workflow_uuid))]
    async fn recv(&self, topic: Option<&str>, timeout: Duration) -> Result<Option<String>, DbosError> {
        self.check_cancelled()?;
        let fid = self.next_function_id();
        if let Some(row) = self.store.check_operation_output(self.workflow_uuid, fid).await? {
            return Ok(row.output);
        }

        let topic = topic.unwrap_or(NULL_TOPIC);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            let notified = self.dispatcher.register(self.workflow_uuid, topic);
            if let Some(row) = self.store.recv_poll(self.workflow_uuid, topic).await? {
                self.store
                .record_operation_output(self.workflow_uuid, fid, &row.message, None, None)
                .await?;
                return Ok(Some(row.message));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                // Timeout is itself a recorded outcome: null is stored so replay doesn't re-wait.
                self.store
                .record_operation_output(self.workflow_uuid, fid, "null", None, None)
                .await?;
                return Ok(None);
            }

            let remaining = deadline - now;
            let _ = tokio::time::timeout(remaining, notified.notified()).await;
            // Spurious wakeups are fine: the loop re-reads before concluding.
        }
    }

    // ------------------------------------------------------------------
    // setEvent / getEvent
    // ------------------------------------------------------------------

    /// Publish `(key, value)` at most once for this workflow.
    #[instrument(skip(self, value), fields(%self.workflow_uuid, key))]
    async fn set_event(&self, key: &str, value: &str) -> Result<(), DbosError> {
        self.check_cancelled()?;
        let fid = self.next_function_id();
        if self.store.check_operation_output(self.workflow_uuid, fid).await?.is_some() {
            return Ok(());
        }
        match self.store.set_event(self.workflow_uuid, fid, key, value).await {
            Ok(()) => Ok(()),
            Err(StoreError::DuplicateEvent { workflow_uuid, key }) => {
                Err(DbosError::DuplicateWorkflowEvent { workflow_uuid, key })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read a value set by `target_uuid` via `setEvent`, waiting up to
    /// `timeout`.
    #[instrument(skip(self), fields(%self.workflow_uuid, %target_uuid, key))]
    async fn get_event(
        &self,
        target_uuid: Uuid,
        key: &str,
        timeout: Duration,
    ) -> Result<Option<String>, DbosError> {
        self.check_cancelled()?;
        let fid = self.next_function_id();
        if let Some(row) = self.store.check_operation_output(self.workflow_uuid, fid).await? {
            return Ok(row.output);
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.dispatcher.register(target_uuid, key);
            if let Some(value) = self.store.get_event_value(target_uuid, key).await? {
                self.store
                .record_operation_output(self.workflow_uuid, fid, &value, None, None)
                .await?;
                return Ok(Some(value));
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                self.store
                .record_operation_output(self.workflow_uuid, fid, "null", None, None)
                .await?;
                return Ok(None);
            }

            let remaining = deadline - now;
            let _ = tokio::time::timeout(remaining, notified.notified()).await;
        }
    }

    // ------------------------------------------------------------------
    // sleep
    // ------------------------------------------------------------------

    /// Record the scheduled wake time on first execution; on replay, sleep
    /// only the remaining duration so total wall time stays bounded by the
    /// original intent.
    #[instrument(skip(self), fields(%self.workflow_uuid))]
    async fn sleep(&self, duration: Duration) -> Result<(), DbosError> {
        self.check_cancelled()?;
        let fid = self.next_function_id();
        let wake_at = if let Some(row) = self.store.check_operation_output(self.workflow_uuid, fid).await? {
            row.output
            .and_then(|s| s.parse::<i64>().ok())
            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis())
        } else {
            let wake_at = chrono::Utc::now().timestamp_millis() + duration.as_millis() as i64;
            self.store
            .record_operation_output(self.workflow_uuid, fid, &wake_at.to_string(), None, None)
            .await?;
            wake_at
        };

        let now = chrono::Utc::now().timestamp_millis();
        if wake_at > now {
            tokio::time::sleep(Duration::from_millis((wake_at - now) as u64)).await;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Child workflow
    // ------------------------------------------------------------------

    /// Start a child workflow under a deterministic UUID derived from this
    /// context's `workflow_uuid` and the step's `function_id`, so replay
    /// binds to the same child instead of starting a new one. The OAOO
    /// entry at `fid` records the child's UUID, not a return value.
    #[instrument(skip(self, args), fields(%self.workflow_uuid))]
    async fn start_child_workflow<O: DeserializeOwned + Send + 'static>(
        &self,
        name: &str,
        args: serde_json::Value,
    ) -> Result<WorkflowHandle<O>, DbosError> {
        self.check_cancelled()?;
        let fid = self.next_function_id();

        if let Some(row) = self.store.check_operation_output(self.workflow_uuid, fid).await? {
            if let Some(recorded) = row.output {
                let child_uuid: Uuid = recorded.parse().map_err(|_| {
                    DbosError::Initialization(format!(
                        "corrupt child workflow uuid recorded at fid {fid} for {}",
                        self.workflow_uuid
                    ))
                })?;
                return Ok(self.handle(child_uuid));
            }
        }

        let child_uuid = Uuid::new_v5(&self.workflow_uuid, fid.to_string().as_bytes());
        let executor = self
        .executor
        .as_ref()
        .and_then(|executor| executor.upgrade())
        .ok_or_else(|| {
            DbosError::Initialization("no executor bound to this context for child workflow invocation".to_string())
        })?;

        let handle = executor
        .workflow::<O>(name, Some(child_uuid), self.identity.clone(), self.request.clone(), args)
        .await
        .map_err(executor_error_to_dbos)?;

        self.store
        .record_operation_output(self.workflow_uuid, fid, &child_uuid.to_string(), None, None)
        .await?;

        Ok(handle)
    }
}

fn udb_error_to_dbos(err: UdbError) -> DbosError {
    match err {
        UdbError::SerializationFailure => DbosError::Store(StoreError::SerializationFailure),
        UdbError::Database(msg) => DbosError::Store(StoreError::Database(msg)),
    }
}

fn executor_error_to_dbos(err: crate::engine::ExecutorError) -> DbosError {
    use crate::engine::ExecutorError;
    match err {
        ExecutorError::Dbos(e) => e,
        ExecutorError::Registry(e) => DbosError::NotRegistered(e),
        ExecutorError::UnknownWorkflow(name) => {
            DbosError::Initialization(format!("child workflow not registered: {name}"))
        }
        ExecutorError::NoStoredProcedureRunner => {
            DbosError::Initialization("no stored procedure runner registered".to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemorySystemDatabase;

    fn new_context(store: Arc<dyn SystemDatabase>) -> WorkflowContext {
        WorkflowContext::new(
            Uuid::new_v4(),
            store,
            None,
            Arc::new(NotificationDispatcher::new()),
            Identity::default(),
            None,
        )
    }

    #[tokio::test]
    async fn function_ids_increment_sequentially() {
        let store = Arc::new(InMemorySystemDatabase::new());
        let ctx = new_context(store);
        assert_eq!(ctx.next_function_id(), 0);
        assert_eq!(ctx.next_function_id(), 1);
        assert_eq!(ctx.next_function_id(), 2);
    }

    #[tokio::test]
    async fn communicator_short_circuits_on_recorded_output() {
        let store: Arc<dyn SystemDatabase> = Arc::new(InMemorySystemDatabase::new());
        let workflow_uuid = Uuid::new_v4();
        store
        .init_workflow_status(workflow_uuid, "wf", None, None, &Identity::default(), None, "local", None, "[]")
        .await
        .unwrap();
        let ctx = WorkflowContext::new(
            workflow_uuid,
            Arc::clone(&store),
            None,
            Arc::new(NotificationDispatcher::new()),
            Identity::default(),
            None,
        );

        let calls = std::sync::atomic::AtomicU32::new(0);
        let policy = RetryPolicy::no_retry();
        let result: i64 = ctx
        .communicator(&policy, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(7) }
            })
        .await
        .unwrap();
        assert_eq!(result, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        // Replay: new context, same workflow_uuid, fid 0 reused.
        let ctx2 = WorkflowContext::new(
            workflow_uuid,
            Arc::clone(&store),
            None,
            Arc::new(NotificationDispatcher::new()),
            Identity::default(),
            None,
        );
        let result2: i64 = ctx2
        .communicator(&policy, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Ok(999) }
            })
        .await
        .unwrap();
        assert_eq!(result2, 7, "replay must return the recorded output, not re-execute");
        assert_eq!(calls.load(Ordering::SeqCst), 1, "recorded step must not re-execute");
    }

    #[tokio::test]
    async fn send_then_recv_round_trips_a_message() {
        let store: Arc<dyn SystemDatabase> = Arc::new(InMemorySystemDatabase::new());
        let workflow_uuid = Uuid::new_v4();
        store
        .init_workflow_status(workflow_uuid, "wf", None, None, &Identity::default(), None, "local", None, "[]")
        .await
        .unwrap();
        let dispatcher = Arc::new(NotificationDispatcher::new());
        let ctx = WorkflowContext::new(
            workflow_uuid,
            Arc::clone(&store),
            None,
            Arc::clone(&dispatcher),
            Identity::default(),
            None,
        );

        ctx.send(workflow_uuid, "\"m1\"", Some("T")).await.unwrap();
        let received = ctx.recv(Some("T"), Duration::from_millis(50)).await.unwrap();
        assert_eq!(received, Some("\"m1\"".to_string()));
    }

    #[tokio::test]
    async fn set_event_twice_is_rejected() {
        let store: Arc<dyn SystemDatabase> = Arc::new(InMemorySystemDatabase::new());
        let workflow_uuid = Uuid::new_v4();
        store
        .init_workflow_status(workflow_uuid, "wf", None, None, &Identity::default(), None, "local", None, "[]")
        .await
        .unwrap();
        let ctx = WorkflowContext::new(
            workflow_uuid,
            Arc::clone(&store),
            None,
            Arc::new(NotificationDispatcher::new()),
            Identity::default(),
            None,
        );

        ctx.set_event("k1", "\"v1\"").await.unwrap();
        let err = ctx.set_event("k1", "\"v2\"").await.unwrap_err();
        assert!(matches!(err, DbosError::DuplicateWorkflowEvent {.. }));
    }

    #[tokio::test]
    async fn cancelled_context_rejects_new_steps() {
        let store: Arc<dyn SystemDatabase> = Arc::new(InMemorySystemDatabase::new());
        let ctx = new_context(store);
        ctx.mark_cancelled();
        let err = ctx.set_event("k", "\"v\"").await.unwrap_err();
        assert!(matches!(err, DbosError::WorkflowCancelled(_)));
    }
}
