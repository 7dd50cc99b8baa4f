//! Row types for the five entities of the system database schema.
//!
//! These mirror the SDB schema column-for-column; timestamps on
//! `workflow_status` and `operation_outputs` are epoch milliseconds stored
//! as `BIGINT` rather than `TIMESTAMPTZ` for those two tables.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// `status` column of `dbos.workflow_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum WorkflowStatusValue {
    Pending,
    Success,
    Error,
    Cancelled,
    RetriesExceeded,
}

impl WorkflowStatusValue {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            WorkflowStatusValue::Success
            | WorkflowStatusValue::Error
            | WorkflowStatusValue::Cancelled
            | WorkflowStatusValue::RetriesExceeded
        )
    }

    pub fn as_db_str(self) -> &'static str {
        match self {
            WorkflowStatusValue::Pending => "PENDING",
            WorkflowStatusValue::Success => "SUCCESS",
            WorkflowStatusValue::Error => "ERROR",
            WorkflowStatusValue::Cancelled => "CANCELLED",
            WorkflowStatusValue::RetriesExceeded => "RETRIES_EXCEEDED",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(Self::Pending),
            "SUCCESS" => Some(Self::Success),
            "ERROR" => Some(Self::Error),
            "CANCELLED" => Some(Self::Cancelled),
            "RETRIES_EXCEEDED" => Some(Self::RetriesExceeded),
            _ => None,
        }
    }
}

impl std::fmt::Display for WorkflowStatusValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_db_str())
    }
}

/// The identity a workflow body executes under.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Identity {
    pub authenticated_user: Option<String>,
    pub assumed_role: Option<String>,
    pub authenticated_roles: Vec<String>,
}

/// A row of `dbos.workflow_status`.
#[derive(Debug, Clone)]
pub struct WorkflowStatusRow {
    pub workflow_uuid: Uuid,
    pub status: WorkflowStatusValue,
    pub name: String,
    pub class_name: Option<String>,
    pub config_name: Option<String>,
    pub authenticated_user: Option<String>,
    pub assumed_role: Option<String>,
    pub authenticated_roles: Option<String>,
    /// Opaque JSON, recorded verbatim and re-presented on recovery.
    pub request: Option<String>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub executor_id: String,
    pub application_version: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub recovery_attempts: i64,
}

/// A row of `dbos.workflow_inputs`.
#[derive(Debug, Clone)]
pub struct WorkflowInputsRow {
    pub workflow_uuid: Uuid,
    pub inputs: String,
}

/// A row of `dbos.operation_outputs`.
#[derive(Debug, Clone)]
pub struct OperationOutputRow {
    pub workflow_uuid: Uuid,
    pub function_id: i64,
    pub output: Option<String>,
    pub error: Option<String>,
    pub txn_snapshot: Option<String>,
    pub txn_id: Option<String>,
    pub created_at: i64,
}

/// A row of `dbos.notifications`.
#[derive(Debug, Clone)]
pub struct NotificationRow {
    pub destination_uuid: Uuid,
    pub topic: String,
    pub message: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// A row of `dbos.workflow_events`.
#[derive(Debug, Clone)]
pub struct WorkflowEventRow {
    pub workflow_uuid: Uuid,
    pub key: String,
    pub value: String,
}

/// Sentinel topic used to represent a `null` topic argument to send/recv,
/// since the physical primary key column cannot itself be `NULL`.
pub const NULL_TOPIC: &str = "__dbos_null_topic__";

/// Filter for `getWorkflows`.
#[derive(Debug, Clone, Default)]
pub struct WorkflowFilter {
    pub status: Option<WorkflowStatusValue>,
    pub name: Option<String>,
    pub authenticated_user: Option<String>,
    pub application_version: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub limit: Option<i64>,
}
