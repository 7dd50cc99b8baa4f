//! The Executor: maintains the operation registry; starts, resumes,
//! and retrieves workflows; owns the output buffer and the recovery loop.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::RwLock as PLRwLock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::config::ExecutorConfig;
use crate::error::DbosError;
use crate::persistence::{Identity, StoreError, SystemDatabase};
use crate::udb::UserDatabaseAdapter;
use crate::workflow::{DehydratedError, StepDriver, WorkflowContext, WorkflowHandle};

use super::buffer::StatusWriteBuffer;
use super::notify::NotificationDispatcher;
use super::registry::{OperationConfig, OperationKind, OperationRegistry, RegistryError};

type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

/// A type-erased workflow body: takes the constructed context and the
/// deserialized (but still dynamically-typed) input, returns a
/// dynamically-typed output. Registration (`Executor::register`) is the
/// generic-typed surface users call; this is what it compiles down to,
/// mirroring the factory-closure pattern used for workflow-type lookup
/// elsewhere in this codebase's lineage.
pub type WorkflowBody =
Arc<dyn Fn(WorkflowContext, serde_json::Value) -> BoxFuture<Result<serde_json::Value, DbosError>> + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("workflow {0} is not registered")]
    UnknownWorkflow(String),

    #[error("no stored procedure runner is registered")]
    NoStoredProcedureRunner,

    #[error(transparent)]
    Dbos(#[from] DbosError),
}

/// Optional alternative backend for the `StoredProcedure` operation kind.
/// No runner ships with this crate; a deployment that
/// wants to dispatch registered-stored-procedure-kind operations into an
/// actual Postgres stored procedure call provides one via
/// [`Executor::register_stored_procedure_runner`].
pub trait StoredProcedureRunner: Send + Sync {
    fn run(&self, name: &str, args: serde_json::Value) -> BoxFuture<Result<serde_json::Value, DbosError>>;
}

/// Orchestrates workflow, transaction, and communicator invocations.
pub struct Executor {
    store: Arc<dyn SystemDatabase>,
    udb: PLRwLock<Option<Arc<UserDatabaseAdapter>>>,
    dispatcher: Arc<NotificationDispatcher>,
    config: ExecutorConfig,
    workflows: PLRwLock<HashMap<String, WorkflowBody>>,
    registry: PLRwLock<OperationRegistry>,
    stored_procedure_runner: PLRwLock<Option<Arc<dyn StoredProcedureRunner>>>,
    buffer: Arc<StatusWriteBuffer>,
    /// Cancellation flags for workflow bodies currently running in this
    /// process, keyed by `workflow_uuid`. `cancel_workflow` flips the flag
    /// here (in addition to the durable CANCELLED status write) so an
    /// in-flight body observes it at its next suspension point; entries are
    /// removed once the body completes.
    cancellations: PLRwLock<HashMap<Uuid, Arc<AtomicBool>>>,
    background_tasks: AsyncMutex<Vec<JoinHandle<()>>>,
    /// Set once the executor is wrapped by [`Executor::new`], so contexts it
    /// spawns can invoke child workflows back through it.
    self_handle: std::sync::OnceLock<std::sync::Weak<Executor>>,
}

impl Executor {
    /// Construct an executor and wrap it so it can hand spawned
    /// [`WorkflowContext`]s a way to start child workflows through itself.
    pub fn new(store: Arc<dyn SystemDatabase>, config: ExecutorConfig) -> Arc<Self> {
        let executor = Arc::new(Self {
            store,
            udb: PLRwLock::new(None),
            dispatcher: Arc::new(NotificationDispatcher::new()),
            config,
            workflows: PLRwLock::new(HashMap::new()),
            registry: PLRwLock::new(OperationRegistry::new()),
            stored_procedure_runner: PLRwLock::new(None),
            buffer: Arc::new(StatusWriteBuffer::new()),
            cancellations: PLRwLock::new(HashMap::new()),
            background_tasks: AsyncMutex::new(Vec::new()),
            self_handle: std::sync::OnceLock::new(),
        });
        executor.self_handle.set(Arc::downgrade(&executor)).ok();
        executor
    }

    /// Attach the user-database adapter transactions run against. Takes
    /// `Arc<Self>` since [`Executor::new`] already hands back a shared
    /// handle.
    pub fn with_udb(self: Arc<Self>, udb: Arc<UserDatabaseAdapter>) -> Arc<Self> {
        *self.udb.write() = Some(udb);
        self
    }

    /// Register the backend that dispatches `StoredProcedure`-kind
    /// operations. Without one, invoking such an
    /// operation fails with [`ExecutorError::NoStoredProcedureRunner`].
    pub fn register_stored_procedure_runner(&self, runner: Arc<dyn StoredProcedureRunner>) {
        *self.stored_procedure_runner.write() = Some(runner);
    }

    /// Dispatch to the registered stored-procedure runner, if any.
    pub async fn stored_procedure(&self, name: &str, args: serde_json::Value) -> Result<serde_json::Value, ExecutorError> {
        let runner = self
        .stored_procedure_runner
        .read()
        .clone()
        .ok_or(ExecutorError::NoStoredProcedureRunner)?;
        Ok(runner.run(name, args).await?)
    }

    pub fn store(&self) -> &Arc<dyn SystemDatabase> {
        &self.store
    }

    /// A [`crate::debug::DebugWorkflowContext`] bound to this executor's
    /// store (and UDB, if attached), for replaying `workflow_uuid`'s
    /// recorded step history (spec §4.5). A workflow body written against
    /// `impl StepDriver` rather than the concrete [`WorkflowContext`] can be
    /// driven by this context directly, with every step short-circuited to
    /// its recorded output instead of re-executed.
    pub fn debug_context(&self, workflow_uuid: Uuid) -> crate::debug::DebugWorkflowContext {
        let ctx = crate::debug::DebugWorkflowContext::new(workflow_uuid, Arc::clone(&self.store));
        match self.udb.read().clone() {
            Some(udb) => ctx.with_udb(udb),
            None => ctx,
        }
    }

    /// The operation registry backing `register`/`register_with_config` —
    /// exposed so callers can inspect a registered operation's kind,
    /// isolation level, or required roles (spec §4.1's Registry).
    pub fn registry(&self) -> &PLRwLock<OperationRegistry> {
        &self.registry
    }

    pub fn executor_id(&self) -> &str {
        &self.config.executor_id
    }

    /// Register a workflow body under `name`. `F` receives a
    /// [`WorkflowContext`] and the typed input `I`, returning `O`.
    /// Equivalent to `register_with_config` with `OperationKind::Workflow`
    /// and a default [`OperationConfig`].
    pub fn register<I, O, F, Fut>(&self, name: impl Into<String>, f: F)
    where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(WorkflowContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, DbosError>> + Send + 'static,
    {
        self.register_with_config(name, OperationKind::Workflow, OperationConfig::default(), Vec::new(), f);
    }

    /// Register a workflow body under `name`, recording its kind,
    /// configuration (isolation level, read-only, retry policy), and
    /// required roles in the operation registry (spec §4.1) alongside the
    /// body closure. `workflow`/`execute_workflow_uuid`/
    /// `recover_pending_workflows` consult the registry as the
    /// authoritative "is this operation registered" check.
    pub fn register_with_config<I, O, F, Fut>(
        &self,
        name: impl Into<String>,
        kind: OperationKind,
        config: OperationConfig,
        required_roles: Vec<String>,
        f: F,
    ) where
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(WorkflowContext, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O, DbosError>> + Send + 'static,
    {
        let name = name.into();
        let body: WorkflowBody = Arc::new(move |ctx, value| {
                match serde_json::from_value::<I>(value) {
                    Ok(input) => {
                        let inner = f(ctx, input);
                        Box::pin(async move {
                                let output = inner.await?;
                                Ok(serde_json::to_value(output)?)
                            }) as BoxFuture<Result<serde_json::Value, DbosError>>
                    }
                    Err(e) => Box::pin(async move { Err(DbosError::Serialization(e)) })
                    as BoxFuture<Result<serde_json::Value, DbosError>>,
                }
            });
        self.registry.write().register_dynamic(name.clone(), kind, config, required_roles);
        self.workflows.write().insert(name, body);
    }

    fn resolve_uuid(workflow_uuid: Option<Uuid>) -> Uuid {
        workflow_uuid.unwrap_or_else(Uuid::new_v4)
    }

    /// `workflow(op, params, args) → Handle<R>`. Resolves the
    /// `workflow_uuid`, atomically records the input, spawns the body, and
    /// returns immediately without awaiting completion.
    #[instrument(skip(self, args, identity, request))]
    pub async fn workflow<O: DeserializeOwned + Send + 'static>(
        &self,
        name: &str,
        workflow_uuid: Option<Uuid>,
        identity: Identity,
        request: Option<String>,
        args: serde_json::Value,
    ) -> Result<WorkflowHandle<O>, ExecutorError> {
        self.registry.read().lookup_by_name(name).map_err(|_| ExecutorError::UnknownWorkflow(name.to_string()))?;
        let body = {
            let workflows = self.workflows.read();
            workflows
            .get(name)
            .cloned()
            .ok_or_else(|| ExecutorError::UnknownWorkflow(name.to_string()))?
        };

        let workflow_uuid = Self::resolve_uuid(workflow_uuid);
        let args_json = serde_json::to_string(&args).map_err(DbosError::from)?;

        let committed_inputs = self
        .store
        .init_workflow_status(
            workflow_uuid,
            name,
            None,
            None,
            &identity,
            request.as_deref(),
            &self.config.executor_id,
            self.config.application_version.as_deref(),
            &args_json,
        )
        .await
        .map_err(|e| match e {
            // `workflow_uuid` was already committed under a different
            // name/class/config — never run this (wrong) body against
            // the first-committed inputs.
            StoreError::ConflictingWorkflow(uuid) => DbosError::ConflictingWorkflow(uuid),
            other => DbosError::from(other),
        })?;
        let committed_args: serde_json::Value =
        serde_json::from_str(&committed_inputs).map_err(DbosError::from)?;

        self.spawn_workflow_body(workflow_uuid, identity, request, body, committed_args);

        Ok(WorkflowHandle::new(workflow_uuid, Arc::clone(&self.store)))
    }

    fn spawn_workflow_body(
        &self,
        workflow_uuid: Uuid,
        identity: Identity,
        request: Option<String>,
        body: WorkflowBody,
        args: serde_json::Value,
    ) {
        let store = Arc::clone(&self.store);
        let udb = self.udb.read().clone();
        let dispatcher = Arc::clone(&self.dispatcher);
        let buffer = Arc::clone(&self.buffer);
        let executor = self.self_handle.get().cloned();

        let cancel_flag = Arc::new(AtomicBool::new(false));
        self.cancellations.write().insert(workflow_uuid, Arc::clone(&cancel_flag));
        let self_weak = executor.clone();

        tokio::spawn(async move {
                let mut ctx = WorkflowContext::new(workflow_uuid, Arc::clone(&store), udb, dispatcher, identity, request)
                .with_cancellation_flag(cancel_flag);
                if let Some(executor) = executor {
                    ctx = ctx.with_executor(executor);
                }
                match body(ctx, args).await {
                    Ok(output) => {
                        let output_json = serde_json::to_string(&output).unwrap_or_default();
                        buffer.buffer(workflow_uuid, Some(output_json));
                        info!(%workflow_uuid, "workflow completed");
                    }
                    Err(DbosError::WorkflowCancelled(_)) => {
                        info!(%workflow_uuid, "workflow observed cancellation");
                    }
                    Err(e) => {
                        warn!(%workflow_uuid, error = %e, "workflow body returned an error");
                        let payload = serde_json::to_string(&DehydratedError::from_dbos_error(&e))
                            .unwrap_or_else(|_| e.to_string());
                        if let Err(store_err) = store.record_workflow_error(workflow_uuid, &payload).await {
                            error!(%workflow_uuid, error = %store_err, "failed to record workflow error");
                        }
                    }
                }
                if let Some(executor) = self_weak.and_then(|w| w.upgrade()) {
                    executor.cancellations.write().remove(&workflow_uuid);
                }
            });
    }

    /// `transaction(op, params, args) → R`: synthesize a
    /// single-step temp workflow and await its completion.
    pub async fn transaction<O: DeserializeOwned + Send + 'static>(
        &self,
        name: &str,
        identity: Identity,
        args: serde_json::Value,
    ) -> Result<O, ExecutorError> {
        let handle: WorkflowHandle<O> = self.workflow(name, None, identity, None, args).await?;
        Ok(handle.get_result().await.map_err(DbosError::from)?)
    }

    /// `external(op, params, args) → R`: same convenience wrapper
    /// for Communicator-shaped temp workflows.
    pub async fn external<O: DeserializeOwned + Send + 'static>(
        &self,
        name: &str,
        identity: Identity,
        args: serde_json::Value,
    ) -> Result<O, ExecutorError> {
        self.transaction(name, identity, args).await
    }

    /// `retrieveWorkflow(uuid) → Handle<R>`.
    pub fn retrieve_workflow<O: DeserializeOwned + Send + 'static>(&self, workflow_uuid: Uuid) -> WorkflowHandle<O> {
        WorkflowHandle::new(workflow_uuid, Arc::clone(&self.store))
    }

    /// `getWorkflows(filter)`.
    pub async fn get_workflows(
        &self,
        filter: crate::persistence::WorkflowFilter,
    ) -> Result<Vec<crate::persistence::WorkflowStatusRow>, ExecutorError> {
        Ok(self.store.get_workflows(filter).await.map_err(DbosError::from)?)
    }

    /// `cancelWorkflow(uuid)`: set status to CANCELLED
    /// if non-terminal and reset `recovery_attempts`. If the workflow is
    /// currently running in this process, also flips its in-memory
    /// cancellation flag so the body observes `WorkflowCancelled` at its
    /// next suspension point (spec §5) instead of running to completion.
    pub async fn cancel_workflow(&self, workflow_uuid: Uuid) -> Result<(), ExecutorError> {
        self.store.cancel_workflow(workflow_uuid).await.map_err(DbosError::from)?;
        if let Some(flag) = self.cancellations.read().get(&workflow_uuid) {
            flag.store(true, std::sync::atomic::Ordering::SeqCst);
        }
        Ok(())
    }

    /// `executeWorkflowUUID(uuid)`: replay a specific workflow by
    /// UUID, used by tests, the admin surface, and recovery.
    #[instrument(skip(self))]
    pub async fn execute_workflow_uuid<O: DeserializeOwned + Send + 'static>(
        &self,
        workflow_uuid: Uuid,
    ) -> Result<WorkflowHandle<O>, ExecutorError> {
        let snapshot = self.store.get_workflow_status(workflow_uuid).await.map_err(DbosError::from)?;
        let inputs = self
        .store
        .get_workflow_inputs(workflow_uuid)
        .await
        .map_err(DbosError::from)?
        .unwrap_or_else(|| "null".to_string());
        let args: serde_json::Value = serde_json::from_str(&inputs).map_err(DbosError::from)?;

        self.registry
        .read()
        .lookup_by_name(&snapshot.name)
        .map_err(|_| ExecutorError::UnknownWorkflow(snapshot.name.clone()))?;
        let body = {
            let workflows = self.workflows.read();
            workflows
            .get(&snapshot.name)
            .cloned()
            .ok_or_else(|| ExecutorError::UnknownWorkflow(snapshot.name.clone()))?
        };

        self.spawn_workflow_body(workflow_uuid, snapshot.identity, snapshot.request, body, args);
        Ok(WorkflowHandle::new(workflow_uuid, Arc::clone(&self.store)))
    }

    /// `recoverPendingWorkflows(executorIDs?) → [Handle…]`.
    #[instrument(skip(self))]
    pub async fn recover_pending_workflows(
        &self,
        executor_ids: Option<Vec<String>>,
    ) -> Result<Vec<WorkflowHandle<serde_json::Value>>, ExecutorError> {
        let executor_ids = executor_ids.unwrap_or_else(|| vec![self.config.executor_id.clone()]);
        let mut handles = Vec::new();

        for executor_id in executor_ids {
            let pending = self.store.get_pending_workflows(&executor_id).await.map_err(DbosError::from)?;
            for workflow_uuid in pending {
                let inputs = match self
                .store
                .start_recovery_attempt(workflow_uuid, self.config.max_recovery_attempts)
                .await
                .map_err(DbosError::from)?
                {
                    None => {
                        warn!(%workflow_uuid, "workflow exceeded max recovery attempts, moved to dead-letter queue");
                        continue;
                    }
                    Some(inputs) => inputs,
                };

                let snapshot = self.store.get_workflow_status(workflow_uuid).await.map_err(DbosError::from)?;
                let args: serde_json::Value = serde_json::from_str(&inputs).map_err(DbosError::from)?;
                self.registry
                .read()
                .lookup_by_name(&snapshot.name)
                .map_err(|_| ExecutorError::UnknownWorkflow(snapshot.name.clone()))?;
                let body = {
                    let workflows = self.workflows.read();
                    workflows
                    .get(&snapshot.name)
                    .cloned()
                    .ok_or_else(|| ExecutorError::UnknownWorkflow(snapshot.name.clone()))?
                };

                self.spawn_workflow_body(workflow_uuid, snapshot.identity, snapshot.request, body, args);
                handles.push(WorkflowHandle::new(workflow_uuid, Arc::clone(&self.store)));
            }
        }

        Ok(handles)
    }

    /// Bring the SDB schema up to date; connect the notification listener;
    /// start background tasks (status buffer flush). Call before accepting
    /// any workflow invocations.
    #[instrument(skip(self, database_url))]
    pub async fn init(&self, database_url: Option<&str>) -> Result<(), ExecutorError> {
        self.store.ensure_schema().await.map_err(DbosError::from)?;

        let mut tasks = self.background_tasks.lock().await;
        tasks.push(
            self.buffer
            .spawn_flush_loop(Arc::clone(&self.store), self.config.status_buffer_flush_interval),
        );

        if let Some(database_url) = database_url {
            match self.dispatcher.listen(database_url).await {
                Ok(handle) => tasks.push(handle),
                Err(e) => {
                    error!(error = %e, "failed to start notification listener");
                    return Err(DbosError::Initialization(e.to_string()).into());
                }
            }
        }

        info!(executor_id = %self.config.executor_id, "executor initialized");
        Ok(())
    }

    /// Graceful shutdown: stop background tasks and flush any remaining
    /// buffered status writes.
    #[instrument(skip(self))]
    pub async fn destroy(&self) {
        let mut tasks = self.background_tasks.lock().await;
        for task in tasks.drain(..) {
            task.abort();
        }
        self.buffer.flush(self.store.as_ref()).await;
        info!("executor destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::InMemorySystemDatabase;

    fn executor() -> Arc<Executor> {
        Executor::new(Arc::new(InMemorySystemDatabase::new()), ExecutorConfig::default())
    }

    #[tokio::test]
    async fn duplicate_submission_is_idempotent() {
        let exec = executor();
        exec.register("incrementAndInsert", |_ctx, input: i64| async move { Ok(input + 1) });

        let uuid = Uuid::new_v4();
        let h1: WorkflowHandle<i64> = exec
        .workflow("incrementAndInsert", Some(uuid), Identity::default(), None, serde_json::json!(1))
        .await
        .unwrap();
        let h2: WorkflowHandle<i64> = exec
        .workflow("incrementAndInsert", Some(uuid), Identity::default(), None, serde_json::json!(2))
        .await
        .unwrap();

        assert_eq!(h1.get_result().await.unwrap(), 2);
        assert_eq!(h2.get_result().await.unwrap(), 2, "second submission observes first-committed input");
    }

    #[tokio::test]
    async fn reusing_a_uuid_under_a_different_name_is_rejected() {
        let exec = executor();
        exec.register("incrementAndInsert", |_ctx, input: i64| async move { Ok(input + 1) });
        exec.register("decrementAndInsert", |_ctx, input: i64| async move { Ok(input - 1) });

        let uuid = Uuid::new_v4();
        let _h1: WorkflowHandle<i64> = exec
        .workflow("incrementAndInsert", Some(uuid), Identity::default(), None, serde_json::json!(1))
        .await
        .unwrap();

        let result: Result<WorkflowHandle<i64>, _> =
        exec.workflow("decrementAndInsert", Some(uuid), Identity::default(), None, serde_json::json!(1)).await;
        assert!(matches!(result, Err(ExecutorError::Dbos(DbosError::ConflictingWorkflow(_)))));
    }

    #[tokio::test]
    async fn unregistered_workflow_is_an_error() {
        let exec = executor();
        let result: Result<WorkflowHandle<i64>, _> =
        exec.workflow("doesNotExist", None, Identity::default(), None, serde_json::json!(null)).await;
        assert!(matches!(result, Err(ExecutorError::UnknownWorkflow(_))));
    }

    #[tokio::test]
    async fn recover_pending_workflows_requeues_pending_for_executor() {
        let exec = executor();
        exec.register("echo", |_ctx, input: i64| async move { Ok(input) });

        let uuid = Uuid::new_v4();
        exec.store()
        .init_workflow_status(uuid, "echo", None, None, &Identity::default(), None, "local", None, "7")
        .await
        .unwrap();

        let handles = exec.recover_pending_workflows(Some(vec!["local".to_string()])).await.unwrap();
        assert_eq!(handles.len(), 1);
        assert_eq!(handles[0].get_workflow_uuid(), uuid);
    }

    #[tokio::test]
    async fn recover_pending_workflows_ignores_other_executors() {
        let exec = executor();
        exec.register("echo", |_ctx, input: i64| async move { Ok(input) });

        let uuid = Uuid::new_v4();
        exec.store()
        .init_workflow_status(uuid, "echo", None, None, &Identity::default(), None, "remote-1", None, "7")
        .await
        .unwrap();

        let handles = exec.recover_pending_workflows(Some(vec!["local".to_string()])).await.unwrap();
        assert!(handles.is_empty());
    }

    #[tokio::test]
    async fn child_workflow_binds_to_a_deterministic_uuid_and_runs_once() {
        let exec = executor();
        exec.register("child", |_ctx, input: i64| async move { Ok(input * 2) });
        exec.register("parent", |ctx, input: i64| async move {
            let handle: WorkflowHandle<i64> =
            ctx.start_child_workflow("child", serde_json::json!(input)).await?;
            handle.get_result().await
        });

        let uuid = Uuid::new_v4();
        let handle: WorkflowHandle<i64> = exec
        .workflow("parent", Some(uuid), Identity::default(), None, serde_json::json!(5))
        .await
        .unwrap();

        assert_eq!(handle.get_result().await.unwrap(), 10);

        let child_fid = 0;
        let child_uuid = uuid::Uuid::new_v5(&uuid, child_fid.to_string().as_bytes());
        let recorded = exec
        .store()
        .check_operation_output(uuid, child_fid)
        .await
        .unwrap()
        .expect("parent's OAOO entry for the child step must be recorded");
        assert_eq!(recorded.output.as_deref(), Some(child_uuid.to_string().as_str()));
    }

    #[tokio::test]
    async fn register_records_kind_and_config_in_the_registry() {
        let exec = executor();
        exec.register_with_config(
            "chargeCard",
            OperationKind::Transaction,
            OperationConfig { read_only: false, ..Default::default() },
            vec!["billing-admin".to_string()],
            |_ctx, input: i64| async move { Ok(input) },
        );

        let entry = exec.registry().read().lookup_by_name("chargeCard").unwrap().clone();
        assert_eq!(entry.kind, OperationKind::Transaction);
        assert_eq!(entry.required_roles, vec!["billing-admin".to_string()]);

        // Plain `register` defaults to Workflow with no required roles.
        exec.register("echo", |_ctx, input: i64| async move { Ok(input) });
        let echo_entry = exec.registry().read().lookup_by_name("echo").unwrap().clone();
        assert_eq!(echo_entry.kind, OperationKind::Workflow);
    }

    #[tokio::test]
    async fn unregistered_name_is_rejected_even_if_no_body_was_ever_inserted() {
        let exec = executor();
        let result: Result<WorkflowHandle<i64>, _> =
        exec.workflow("neverRegistered", None, Identity::default(), None, serde_json::json!(1)).await;
        assert!(matches!(result, Err(ExecutorError::UnknownWorkflow(name)) if name == "neverRegistered"));
    }

    #[tokio::test]
    async fn cancel_workflow_stops_an_in_flight_body_at_its_next_suspension_point() {
        let exec = executor();
        let reached_second_step = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let reached = Arc::clone(&reached_second_step);

        exec.register("cancellable", move |ctx, _: ()| {
            let reached = Arc::clone(&reached);
            async move {
                ctx.sleep(std::time::Duration::from_millis(30)).await?;
                // Cancellation is observed here, at the next suspension
                // point, not mid-sleep.
                ctx.sleep(std::time::Duration::from_millis(30)).await?;
                reached.store(true, std::sync::atomic::Ordering::SeqCst);
                Ok(())
            }
        });

        let uuid = Uuid::new_v4();
        let _handle: WorkflowHandle<()> = exec
        .workflow("cancellable", Some(uuid), Identity::default(), None, serde_json::json!(null))
        .await
        .unwrap();

        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        exec.cancel_workflow(uuid).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(
            !reached_second_step.load(std::sync::atomic::Ordering::SeqCst),
            "body must not proceed past the suspension point following cancellation"
        );
    }

    #[tokio::test]
    async fn debug_context_replays_a_completed_workflows_steps_without_side_effects() {
        let exec = executor();
        let calls = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let calls_for_body = Arc::clone(&calls);
        exec.register("audited", move |ctx, input: i64| {
            let calls = Arc::clone(&calls_for_body);
            async move {
                let policy = crate::reliability::RetryPolicy::no_retry();
                let calls = Arc::clone(&calls);
                ctx.communicator(&policy, move || {
                    let calls = Arc::clone(&calls);
                    async move {
                        calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        Ok(input * 2)
                    }
                })
                .await
            }
        });

        let uuid = Uuid::new_v4();
        let handle: WorkflowHandle<i64> = exec
        .workflow("audited", Some(uuid), Identity::default(), None, serde_json::json!(21))
        .await
        .unwrap();
        assert_eq!(handle.get_result().await.unwrap(), 42);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Drive the same step sequence through the debug context. The
        // communicator step must short-circuit to the recorded output
        // instead of invoking the body a second time.
        let debug_ctx = exec.debug_context(uuid);
        let policy = crate::reliability::RetryPolicy::no_retry();
        let replayed: i64 = debug_ctx
        .communicator(&policy, || async { panic!("must not re-execute during replay") })
        .await
        .unwrap();
        assert_eq!(replayed, 42);
        assert_eq!(
            calls.load(std::sync::atomic::Ordering::SeqCst),
            1,
            "debug replay must not invoke the communicator body"
        );
    }
}
