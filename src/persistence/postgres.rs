//! Postgres-backed `SystemDatabase`.
//!
//! Uses raw `sqlx::query()` against the bit-exact schema in [`super::schema`]
//! rather than the compile-time-checked `query!` macro, since the schema is
//! brought up at runtime by `ensure_schema` and there is no `DATABASE_URL`
//! available at build time for this crate.

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::{error, instrument};
use uuid::Uuid;

use super::entities::{
    Identity, NotificationRow, OperationOutputRow, WorkflowFilter, WorkflowStatusRow,
    WorkflowStatusValue,
};
use super::schema::{self, NOTIFICATION_CHANNEL};
use super::store::{CheckedWorkflowOutput, StoreError, SystemDatabase, WorkflowStatusSnapshot};

/// A `SystemDatabase` backed by a PostgreSQL connection pool.
pub struct PostgresSystemDatabase {
    pool: PgPool,
}

impl PostgresSystemDatabase {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

fn parse_status(s: &str) -> WorkflowStatusValue {
    WorkflowStatusValue::from_db_str(s).unwrap_or(WorkflowStatusValue::Pending)
}

#[async_trait]
impl SystemDatabase for PostgresSystemDatabase {
    #[instrument(skip(self, identity, args), fields(%workflow_uuid))]
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
        let mut tx = self.pool.begin().await.map_err(|e| {
                error!(error = %e, "failed to begin init_workflow_status transaction");
                StoreError::from(e)
            })?;
        let now = now_millis();
        let roles = if identity.authenticated_roles.is_empty() {
            None
        } else {
            Some(identity.authenticated_roles.join(","))
        };

        sqlx::query(
            r#"
            INSERT INTO dbos.workflow_status
            (workflow_uuid, status, name, class_name, config_name,
                authenticated_user, assumed_role, authenticated_roles, request,
                executor_id, application_version, created_at, updated_at, recovery_attempts)
            VALUES ($1, 'PENDING', $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11, 0)
            ON CONFLICT (workflow_uuid) DO NOTHING
            "#,
        )
        .bind(workflow_uuid.to_string())
        .bind(name)
        .bind(class_name)
        .bind(config_name)
        .bind(&identity.authenticated_user)
        .bind(&identity.assumed_role)
        .bind(&roles)
        .bind(request)
        .bind(executor_id)
        .bind(application_version)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        // `workflow_uuid` may have already been committed by a prior call
        // (first writer wins). Reject a second call under a different
        // name/class/config rather than silently dispatching to whichever
        // body the caller happens to be running.
        let committed = sqlx::query(
            "SELECT name, class_name, config_name FROM dbos.workflow_status WHERE workflow_uuid = $1",
        )
        .bind(workflow_uuid.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::from)?;
        let committed_name: String = committed.get("name");
        let committed_class: Option<String> = committed.get("class_name");
        let committed_config: Option<String> = committed.get("config_name");
        if committed_name != name
            || committed_class.as_deref() != class_name
            || committed_config.as_deref() != config_name
        {
            return Err(StoreError::ConflictingWorkflow(workflow_uuid));
        }

        sqlx::query(
            r#"
            INSERT INTO dbos.workflow_inputs (workflow_uuid, inputs)
            VALUES ($1, $2)
            ON CONFLICT (workflow_uuid) DO NOTHING
            "#,
        )
        .bind(workflow_uuid.to_string())
        .bind(args)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        let row = sqlx::query("SELECT inputs FROM dbos.workflow_inputs WHERE workflow_uuid = $1")
        .bind(workflow_uuid.to_string())
        .fetch_one(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(row.get::<String, _>("inputs"))
    }

    #[instrument(skip(self), fields(%workflow_uuid))]
    async fn check_workflow_output(
        &self,
        workflow_uuid: Uuid,
    ) -> Result<CheckedWorkflowOutput, StoreError> {
        let row = sqlx::query(
            "SELECT status, output, error FROM dbos.workflow_status WHERE workflow_uuid = $1",
        )
        .bind(workflow_uuid.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?
        .ok_or(StoreError::WorkflowNotFound(workflow_uuid))?;

        let status = parse_status(row.get::<&str, _>("status"));
        Ok(match status {
                WorkflowStatusValue::Success => {
                    CheckedWorkflowOutput::Success(row.get::<Option<String>, _>("output").unwrap_or_default())
                }
                WorkflowStatusValue::Error => {
                    CheckedWorkflowOutput::Error(row.get::<Option<String>, _>("error").unwrap_or_default())
                }
                _ => CheckedWorkflowOutput::Pending,
            })
    }

    #[instrument(skip(self, output), fields(%workflow_uuid))]
    async fn buffer_workflow_status(
        &self,
        workflow_uuid: Uuid,
        output: Option<String>,
    ) -> Result<(), StoreError> {
        // Buffering itself lives in `engine::buffer::StatusWriteBuffer`; the
        // store only exposes the eventual flush as a real write.
        self.flush_one_status(workflow_uuid, output).await
    }

    #[instrument(skip(self))]
    async fn flush_workflow_status_buffer(&self) -> Result<(), StoreError> {
        // Flushing is driven by `engine::buffer::StatusWriteBuffer`, which
        // calls `flush_one_status` per buffered entry; nothing to do here
        // when there is no separate in-process buffer.
        Ok(())
    }

    #[instrument(skip(self, error), fields(%workflow_uuid))]
    async fn record_workflow_error(
        &self,
        workflow_uuid: Uuid,
        error: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE dbos.workflow_status
            SET status = 'ERROR', error = $2, updated_at = $3
            WHERE workflow_uuid = $1
            AND status NOT IN ('SUCCESS', 'ERROR', 'CANCELLED', 'RETRIES_EXCEEDED')
            "#,
        )
        .bind(workflow_uuid.to_string())
        .bind(error)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    #[instrument(skip(self), fields(%workflow_uuid, function_id))]
    async fn check_operation_output(
        &self,
        workflow_uuid: Uuid,
        function_id: i64,
    ) -> Result<Option<OperationOutputRow>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT workflow_uuid, function_id, output, error, txn_snapshot, txn_id, created_at
            FROM dbos.operation_outputs
            WHERE workflow_uuid = $1 AND function_id = $2
            "#,
        )
        .bind(workflow_uuid.to_string())
        .bind(function_id as i32)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(row.map(|row| OperationOutputRow {
                    workflow_uuid,
                    function_id,
                    output: row.get("output"),
                    error: row.get("error"),
                    txn_snapshot: row.get("txn_snapshot"),
                    txn_id: row.get("txn_id"),
                    created_at: row.get("created_at"),
                }))
    }

    #[instrument(skip(self, output), fields(%workflow_uuid, function_id))]
    async fn record_operation_output(
        &self,
        workflow_uuid: Uuid,
        function_id: i64,
        output: &str,
        txn_snapshot: Option<&str>,
        txn_id: Option<&str>,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO dbos.operation_outputs
            (workflow_uuid, function_id, output, txn_snapshot, txn_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(workflow_uuid.to_string())
        .bind(function_id as i32)
        .bind(output)
        .bind(txn_snapshot)
        .bind(txn_id)
        .bind(now_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(ref db_err)) if db_err.code().as_deref() == Some("23505") => {
                Err(StoreError::OperationConflict { workflow_uuid, function_id })
            }
            Err(e) => Err(StoreError::from(e)),
        }
    }

    #[instrument(skip(self, error), fields(%workflow_uuid, function_id))]
    async fn record_operation_error(
        &self,
        workflow_uuid: Uuid,
        function_id: i64,
        error: &str,
    ) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO dbos.operation_outputs
            (workflow_uuid, function_id, error, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(workflow_uuid.to_string())
        .bind(function_id as i32)
        .bind(error)
        .bind(now_millis())
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(ref db_err)) if db_err.code().as_deref() == Some("23505") => {
                Err(StoreError::OperationConflict { workflow_uuid, function_id })
            }
            Err(e) => Err(StoreError::from(e)),
        }
    }

    #[instrument(skip(self, message), fields(%sender_uuid, %destination_uuid, function_id))]
    async fn send(
        &self,
        sender_uuid: Uuid,
        function_id: i64,
        destination_uuid: Uuid,
        message: &str,
        topic: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        sqlx::query(
            "INSERT INTO dbos.notifications (destination_uuid, topic, message) VALUES ($1, $2, $3)",
        )
        .bind(destination_uuid.to_string())
        .bind(topic)
        .bind(message)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        sqlx::query(
            r#"
            INSERT INTO dbos.operation_outputs (workflow_uuid, function_id, output, created_at)
            VALUES ($1, $2, 'true', $3)
            "#,
        )
        .bind(sender_uuid.to_string())
        .bind(function_id as i32)
        .bind(now_millis())
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }

    #[instrument(skip(self), fields(%destination_uuid))]
    async fn recv_poll(
        &self,
        destination_uuid: Uuid,
        topic: &str,
    ) -> Result<Option<NotificationRow>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        let row = sqlx::query(
            r#"
            SELECT destination_uuid, topic, message, created_at
            FROM dbos.notifications
            WHERE destination_uuid = $1 AND topic = $2
            ORDER BY created_at ASC
            LIMIT 1
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(destination_uuid.to_string())
        .bind(topic)
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        let Some(row) = row else {
            tx.commit().await.map_err(StoreError::from)?;
            return Ok(None);
        };

        let message: String = row.get("message");
        let created_at: chrono::DateTime<chrono::Utc> = row.get("created_at");

        sqlx::query(
            r#"
            DELETE FROM dbos.notifications
            WHERE destination_uuid = $1 AND topic = $2 AND created_at = $3
            "#,
        )
        .bind(destination_uuid.to_string())
        .bind(topic)
        .bind(created_at)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        tx.commit().await.map_err(StoreError::from)?;

        Ok(Some(NotificationRow {
                    destination_uuid,
                    topic: topic.to_string(),
                    message,
                    created_at,
                }))
    }

    #[instrument(skip(self, value), fields(%workflow_uuid, key))]
    async fn set_event(
        &self,
        workflow_uuid: Uuid,
        function_id: i64,
        key: &str,
        value: &str,
    ) -> Result<(), StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        let result = sqlx::query(
            "INSERT INTO dbos.workflow_events (workflow_uuid, key, value) VALUES ($1, $2, $3)",
        )
        .bind(workflow_uuid.to_string())
        .bind(key)
        .bind(value)
        .execute(&mut *tx)
        .await;

        if let Err(sqlx::Error::Database(ref db_err)) = result {
            if db_err.code().as_deref() == Some("23505") {
                return Err(StoreError::DuplicateEvent {
                        workflow_uuid,
                        key: key.to_string(),
                    });
            }
        }
        result.map_err(StoreError::from)?;

        sqlx::query(
            "INSERT INTO dbos.operation_outputs (workflow_uuid, function_id, output, created_at) VALUES ($1, $2, 'true', $3)",
        )
        .bind(workflow_uuid.to_string())
        .bind(function_id as i32)
        .bind(now_millis())
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        tx.commit().await.map_err(StoreError::from)?;
        Ok(())
    }

    #[instrument(skip(self), fields(%target_uuid, key))]
    async fn get_event_value(
        &self,
        target_uuid: Uuid,
        key: &str,
    ) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT value FROM dbos.workflow_events WHERE workflow_uuid = $1 AND key = $2")
        .bind(target_uuid.to_string())
        .bind(key)
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    #[instrument(skip(self))]
    async fn get_pending_workflows(&self, executor_id: &str) -> Result<Vec<Uuid>, StoreError> {
        let rows = sqlx::query(
            "SELECT workflow_uuid FROM dbos.workflow_status WHERE status = 'PENDING' AND executor_id = $1",
        )
        .bind(executor_id)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        rows.into_iter()
        .map(|row| {
                row.get::<String, _>("workflow_uuid")
                .parse::<Uuid>()
                .map_err(|e| StoreError::Serialization(e.to_string()))
            })
        .collect()
    }

    #[instrument(skip(self), fields(%workflow_uuid))]
    async fn get_workflow_status(
        &self,
        workflow_uuid: Uuid,
    ) -> Result<WorkflowStatusSnapshot, StoreError> {
        let row = sqlx::query(
            "SELECT status, name, authenticated_user, assumed_role, authenticated_roles, request \
            FROM dbos.workflow_status WHERE workflow_uuid = $1",
        )
        .bind(workflow_uuid.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?
        .ok_or(StoreError::WorkflowNotFound(workflow_uuid))?;

        let roles: Option<String> = row.get("authenticated_roles");
        Ok(WorkflowStatusSnapshot {
                status: parse_status(row.get::<&str, _>("status")),
                name: row.get("name"),
                identity: Identity {
                    authenticated_user: row.get("authenticated_user"),
                    assumed_role: row.get("assumed_role"),
                    authenticated_roles: roles
                    .map(|r| r.split(',').map(str::to_string).collect())
                    .unwrap_or_default(),
                },
                request: row.get("request"),
            })
    }

    #[instrument(skip(self), fields(%workflow_uuid))]
    async fn get_workflow_result(
        &self,
        workflow_uuid: Uuid,
    ) -> Result<CheckedWorkflowOutput, StoreError> {
        // The engine's notification dispatcher wakes waiters on terminal
        // status writes; here we simply re-read rather than trust any
        // in-memory result, since the write may have come from another process.
        self.check_workflow_output(workflow_uuid).await
    }

    #[instrument(skip(self), fields(%workflow_uuid))]
    async fn get_workflow_inputs(&self, workflow_uuid: Uuid) -> Result<Option<String>, StoreError> {
        let row = sqlx::query("SELECT inputs FROM dbos.workflow_inputs WHERE workflow_uuid = $1")
        .bind(workflow_uuid.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(row.map(|r| r.get::<String, _>("inputs")))
    }

    #[instrument(skip(self, filter))]
    async fn get_workflows(&self, filter: WorkflowFilter) -> Result<Vec<WorkflowStatusRow>, StoreError> {
        let limit = filter.limit.unwrap_or(100);
        let rows = sqlx::query(
            r#"
            SELECT workflow_uuid, status, name, class_name, config_name, authenticated_user,
            assumed_role, authenticated_roles, request, output, error, executor_id,
            application_version, created_at, updated_at, recovery_attempts
            FROM dbos.workflow_status
            WHERE ($1::text IS NULL OR status = $1)
            AND ($2::text IS NULL OR name = $2)
            AND ($3::text IS NULL OR authenticated_user = $3)
            AND ($4::text IS NULL OR application_version = $4)
            AND ($5::bigint IS NULL OR created_at >= $5)
            AND ($6::bigint IS NULL OR created_at <= $6)
            ORDER BY created_at DESC
            LIMIT $7
            "#,
        )
        .bind(filter.status.map(|s| s.as_db_str()))
        .bind(&filter.name)
        .bind(&filter.authenticated_user)
        .bind(&filter.application_version)
        .bind(filter.start_time)
        .bind(filter.end_time)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(StoreError::from)?;

        Ok(rows
            .into_iter()
            .map(|row| WorkflowStatusRow {
                    workflow_uuid: row
                    .get::<String, _>("workflow_uuid")
                    .parse()
                    .unwrap_or_default(),
                    status: parse_status(row.get::<&str, _>("status")),
                    name: row.get("name"),
                    class_name: row.get("class_name"),
                    config_name: row.get("config_name"),
                    authenticated_user: row.get("authenticated_user"),
                    assumed_role: row.get("assumed_role"),
                    authenticated_roles: row.get("authenticated_roles"),
                    request: row.get("request"),
                    output: row.get("output"),
                    error: row.get("error"),
                    executor_id: row.get("executor_id"),
                    application_version: row.get("application_version"),
                    created_at: row.get("created_at"),
                    updated_at: row.get("updated_at"),
                    recovery_attempts: row.get("recovery_attempts"),
                })
            .collect())
    }

    #[instrument(skip(self), fields(%workflow_uuid))]
    async fn cancel_workflow(&self, workflow_uuid: Uuid) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE dbos.workflow_status
            SET status = 'CANCELLED', recovery_attempts = 0, updated_at = $2
            WHERE workflow_uuid = $1
            AND status NOT IN ('SUCCESS', 'ERROR', 'CANCELLED', 'RETRIES_EXCEEDED')
            "#,
        )
        .bind(workflow_uuid.to_string())
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }

    #[instrument(skip(self), fields(%workflow_uuid, max_recovery_attempts))]
    async fn start_recovery_attempt(
        &self,
        workflow_uuid: Uuid,
        max_recovery_attempts: i64,
    ) -> Result<Option<String>, StoreError> {
        let mut tx = self.pool.begin().await.map_err(StoreError::from)?;

        let row = sqlx::query(
            "SELECT recovery_attempts FROM dbos.workflow_status WHERE workflow_uuid = $1 FOR UPDATE",
        )
        .bind(workflow_uuid.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from)?
        .ok_or(StoreError::WorkflowNotFound(workflow_uuid))?;

        let attempts: i64 = row.get::<i64, _>("recovery_attempts") + 1;

        if attempts > max_recovery_attempts {
            sqlx::query(
                "UPDATE dbos.workflow_status SET status = 'RETRIES_EXCEEDED', recovery_attempts = $2, updated_at = $3 WHERE workflow_uuid = $1",
            )
            .bind(workflow_uuid.to_string())
            .bind(attempts)
            .bind(now_millis())
            .execute(&mut *tx)
            .await
            .map_err(StoreError::from)?;
            tx.commit().await.map_err(StoreError::from)?;
            return Ok(None);
        }

        sqlx::query("UPDATE dbos.workflow_status SET recovery_attempts = $2 WHERE workflow_uuid = $1")
        .bind(workflow_uuid.to_string())
        .bind(attempts)
        .execute(&mut *tx)
        .await
        .map_err(StoreError::from)?;

        let inputs = sqlx::query("SELECT inputs FROM dbos.workflow_inputs WHERE workflow_uuid = $1")
        .bind(workflow_uuid.to_string())
        .fetch_optional(&mut *tx)
        .await
        .map_err(StoreError::from)?
        .map(|r| r.get::<String, _>("inputs"));

        tx.commit().await.map_err(StoreError::from)?;
        Ok(inputs)
    }

    #[instrument(skip(self))]
    async fn ensure_schema(&self) -> Result<(), StoreError> {
        schema::ensure_schema(&self.pool).await
    }
}

impl PostgresSystemDatabase {
    async fn flush_one_status(&self, workflow_uuid: Uuid, output: Option<String>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE dbos.workflow_status
            SET status = 'SUCCESS', output = $2, updated_at = $3
            WHERE workflow_uuid = $1
            AND status NOT IN ('SUCCESS', 'ERROR', 'CANCELLED', 'RETRIES_EXCEEDED')
            "#,
        )
        .bind(workflow_uuid.to_string())
        .bind(output)
        .bind(now_millis())
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;
        Ok(())
    }
}

/// Channel name re-exported for the notification dispatcher.
pub const LISTEN_CHANNEL: &str = NOTIFICATION_CHANNEL;

#[cfg(test)]
mod tests {
    // Integration tests require a live PostgreSQL database and are gated
    // behind `DATABASE_URL`; see tests/postgres_integration.rs.
}
