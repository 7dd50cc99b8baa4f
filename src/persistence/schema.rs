//! Bit-exact SDB schema and the two notification triggers.
//!
//! No separate migrations directory is used; the schema is brought up to
//! date idempotently by `Executor::init()` issuing this DDL directly, the
//! same way the rest of this crate issues raw `sqlx::query()` rather than
//! compile-time-checked queries or `sqlx::migrate!`.

use sqlx::PgPool;

use super::store::StoreError;

pub const SCHEMA_SQL: &str = r#"
CREATE SCHEMA IF NOT EXISTS dbos;

CREATE TABLE IF NOT EXISTS dbos.workflow_status (
    workflow_uuid TEXT PRIMARY KEY,
    status TEXT NOT NULL,
    name TEXT NOT NULL,
    class_name TEXT,
    config_name TEXT,
    authenticated_user TEXT,
    assumed_role TEXT,
    authenticated_roles TEXT,
    request TEXT,
    output TEXT,
    error TEXT,
    executor_id TEXT NOT NULL,
    application_version TEXT,
    created_at BIGINT NOT NULL,
    updated_at BIGINT NOT NULL,
    recovery_attempts BIGINT NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS workflow_status_executor_id_idx
ON dbos.workflow_status (executor_id, status);

CREATE TABLE IF NOT EXISTS dbos.workflow_inputs (
    workflow_uuid TEXT PRIMARY KEY REFERENCES dbos.workflow_status (workflow_uuid),
    inputs TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS dbos.operation_outputs (
    workflow_uuid TEXT NOT NULL,
    function_id INT NOT NULL,
    output TEXT,
    error TEXT,
    txn_snapshot TEXT,
    txn_id TEXT,
    created_at BIGINT NOT NULL,
    PRIMARY KEY (workflow_uuid, function_id)
);

CREATE TABLE IF NOT EXISTS dbos.notifications (
    destination_uuid TEXT NOT NULL,
    topic TEXT NOT NULL,
    message TEXT NOT NULL,
    created_at TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS notifications_destination_topic_idx
ON dbos.notifications (destination_uuid, topic, created_at);

CREATE TABLE IF NOT EXISTS dbos.workflow_events (
    workflow_uuid TEXT NOT NULL,
    key TEXT NOT NULL,
    value TEXT NOT NULL,
    PRIMARY KEY (workflow_uuid, key)
);

CREATE OR REPLACE FUNCTION dbos.notify_notifications() RETURNS trigger AS $$
BEGIN
PERFORM pg_notify('dbos_notifications_channel', NEW.destination_uuid || '::' || NEW.topic);
RETURN NEW;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS dbos_notifications_notify_trigger ON dbos.notifications;
CREATE TRIGGER dbos_notifications_notify_trigger
AFTER INSERT ON dbos.notifications
FOR EACH ROW EXECUTE FUNCTION dbos.notify_notifications();

CREATE OR REPLACE FUNCTION dbos.notify_workflow_events() RETURNS trigger AS $$
BEGIN
PERFORM pg_notify('dbos_notifications_channel', NEW.workflow_uuid || '::' || NEW.key);
RETURN NEW;
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS dbos_workflow_events_notify_trigger ON dbos.workflow_events;
CREATE TRIGGER dbos_workflow_events_notify_trigger
AFTER INSERT ON dbos.workflow_events
FOR EACH ROW EXECUTE FUNCTION dbos.notify_workflow_events();
"#;

/// The single channel both triggers publish on.
pub const NOTIFICATION_CHANNEL: &str = "dbos_notifications_channel";

#[tracing::instrument(skip(pool))]
pub async fn ensure_schema(pool: &PgPool) -> Result<(), StoreError> {
    // `raw_sql` sends the whole script as one multi-statement batch, which
    // is required here since the trigger functions contain embedded
    // semicolons inside their `$$`-quoted bodies.
    sqlx::raw_sql(SCHEMA_SQL).execute(pool).await?;
    Ok(())
}
