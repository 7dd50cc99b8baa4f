//! The admin surface: `getWorkflows`, `cancelWorkflow`,
//! `recoverPendingWorkflows`, exposed both as plain async functions on
//! [`Executor`] (already defined there) and as an `axum` router with
//! `utoipa` schemas.
//!
//! HTTP request routing for the application's own API is out of scope for
//! this crate; this router exists because workflow management still needs
//! to be reachable out-of-band (by an operator, a dashboard, a CLI).

use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::engine::{Executor, ExecutorError};
use crate::persistence::{WorkflowFilter, WorkflowStatusValue};

/// Shared state for the admin router.
#[derive(Clone)]
pub struct AdminState {
    pub executor: Arc<Executor>,
}

/// Query parameters for `GET /workflows`.
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListWorkflowsParams {
    pub status: Option<String>,
    pub name: Option<String>,
    pub authenticated_user: Option<String>,
    pub application_version: Option<String>,
    pub start_time: Option<i64>,
    pub end_time: Option<i64>,
    pub limit: Option<i64>,
}

/// A single workflow's status, as returned by the admin surface.
#[derive(Debug, Serialize, ToSchema)]
pub struct WorkflowStatusDto {
    pub workflow_uuid: Uuid,
    pub status: String,
    pub name: String,
    pub class_name: Option<String>,
    pub config_name: Option<String>,
    pub authenticated_user: Option<String>,
    pub executor_id: String,
    pub application_version: Option<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub recovery_attempts: i64,
    pub output: Option<String>,
    pub error: Option<String>,
}

impl From<crate::persistence::WorkflowStatusRow> for WorkflowStatusDto {
    fn from(row: crate::persistence::WorkflowStatusRow) -> Self {
        Self {
            workflow_uuid: row.workflow_uuid,
            status: row.status.as_db_str().to_string(),
            name: row.name,
            class_name: row.class_name,
            config_name: row.config_name,
            authenticated_user: row.authenticated_user,
            executor_id: row.executor_id,
            application_version: row.application_version,
            created_at: row.created_at,
            updated_at: row.updated_at,
            recovery_attempts: row.recovery_attempts,
            output: row.output,
            error: row.error,
        }
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RecoverPendingWorkflowsRequest {
    #[serde(default)]
    pub executor_ids: Option<Vec<String>>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct RecoveredWorkflowDto {
    pub workflow_uuid: Uuid,
}

fn executor_error_status(err: &ExecutorError) -> StatusCode {
    match err {
        ExecutorError::UnknownWorkflow(_) => StatusCode::NOT_FOUND,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// `GET /workflows` — `getWorkflows(filter)`.
#[utoipa::path(
        get,
        path = "/workflows",
        params(
            ("status" = Option<String>, Query, description = "Filter by status (PENDING, SUCCESS, ERROR, CANCELLED, RETRIES_EXCEEDED)"),
            ("name" = Option<String>, Query, description = "Filter by workflow name"),
            ("authenticated_user" = Option<String>, Query, description = "Filter by authenticated user"),
            ("application_version" = Option<String>, Query, description = "Filter by application version"),
            ("start_time" = Option<i64>, Query, description = "Epoch-millis lower bound on created_at"),
            ("end_time" = Option<i64>, Query, description = "Epoch-millis upper bound on created_at"),
            ("limit" = Option<i64>, Query, description = "Max number of results")
        ),
        responses(
            (status = 200, description = "Matching workflows", body = Vec<WorkflowStatusDto>),
            (status = 500, description = "Internal server error")
        ),
        tag = "admin"
    )]
pub async fn list_workflows(
    State(state): State<AdminState>,
    Query(params): Query<ListWorkflowsParams>,
) -> Result<Json<Vec<WorkflowStatusDto>>, StatusCode> {
    let filter = WorkflowFilter {
        status: params.status.as_deref().and_then(WorkflowStatusValue::from_db_str),
        name: params.name,
        authenticated_user: params.authenticated_user,
        application_version: params.application_version,
        start_time: params.start_time,
        end_time: params.end_time,
        limit: params.limit,
    };

    let rows = state.executor.get_workflows(filter).await.map_err(|e| {
            tracing::error!(error = %e, "failed to list workflows");
            executor_error_status(&e)
        })?;

    Ok(Json(rows.into_iter().map(WorkflowStatusDto::from).collect()))
}

/// `POST /workflows/:workflow_uuid/cancel` — `cancelWorkflow(uuid)`.
#[utoipa::path(
        post,
        path = "/workflows/{workflow_uuid}/cancel",
        params(("workflow_uuid" = Uuid, Path, description = "Workflow UUID to cancel")),
        responses(
            (status = 204, description = "Workflow cancelled"),
            (status = 500, description = "Internal server error")
        ),
        tag = "admin"
    )]
pub async fn cancel_workflow(
    State(state): State<AdminState>,
    Path(workflow_uuid): Path<Uuid>,
) -> Result<StatusCode, StatusCode> {
    state.executor.cancel_workflow(workflow_uuid).await.map_err(|e| {
            tracing::error!(%workflow_uuid, error = %e, "failed to cancel workflow");
            executor_error_status(&e)
        })?;
    Ok(StatusCode::NO_CONTENT)
}

/// `POST /workflows/recover` — `recoverPendingWorkflows(executorIDs?)`.
#[utoipa::path(
        post,
        path = "/workflows/recover",
        request_body = RecoverPendingWorkflowsRequest,
        responses(
            (status = 200, description = "Workflows resumed", body = Vec<RecoveredWorkflowDto>),
            (status = 500, description = "Internal server error")
        ),
        tag = "admin"
    )]
pub async fn recover_pending_workflows(
    State(state): State<AdminState>,
    Json(body): Json<RecoverPendingWorkflowsRequest>,
) -> Result<Json<Vec<RecoveredWorkflowDto>>, StatusCode> {
    let handles = state
    .executor
    .recover_pending_workflows(body.executor_ids)
    .await
    .map_err(|e| {
            tracing::error!(error = %e, "failed to recover pending workflows");
            executor_error_status(&e)
        })?;

    Ok(Json(
            handles
            .into_iter()
            .map(|h| RecoveredWorkflowDto { workflow_uuid: h.get_workflow_uuid() })
            .collect(),
        ))
}

#[derive(utoipa::OpenApi)]
#[openapi(
        paths(list_workflows, cancel_workflow, recover_pending_workflows),
        components(schemas(
                WorkflowStatusDto,
                RecoverPendingWorkflowsRequest,
                RecoveredWorkflowDto
            )),
        tags((name = "admin", description = "Workflow management endpoints"))
    )]
pub struct AdminApiDoc;

/// Build the admin router: workflow listing, cancellation, and recovery,
/// reachable by an operator or a dashboard independent of the host
/// application's own HTTP surface.
pub fn admin_router(executor: Arc<Executor>) -> Router {
    let state = AdminState { executor };
    Router::new()
    .route("/workflows", get(list_workflows))
    .route("/workflows/:workflow_uuid/cancel", post(cancel_workflow))
    .route("/workflows/recover", post(recover_pending_workflows))
    .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutorConfig;
    use crate::persistence::{Identity, InMemorySystemDatabase};
    use std::sync::Arc;

    fn build_executor() -> Arc<Executor> {
        Executor::new(Arc::new(InMemorySystemDatabase::new()), ExecutorConfig::default())
    }

    #[tokio::test]
    async fn list_workflows_reflects_started_workflow() {
        let exec = build_executor();
        exec.register("echo", |_ctx, input: i64| async move { Ok(input) });
        let uuid = Uuid::new_v4();
        let _h: crate::workflow::WorkflowHandle<i64> = exec
        .workflow("echo", Some(uuid), Identity::default(), None, serde_json::json!(1))
        .await
        .unwrap();

        let state = AdminState { executor: Arc::clone(&exec) };
        let rows = list_workflows(State(state), Query(ListWorkflowsParams {
                    status: None,
                    name: None,
                    authenticated_user: None,
                    application_version: None,
                    start_time: None,
                    end_time: None,
                    limit: None,
                }))
        .await
        .unwrap();
        assert!(rows.0.iter().any(|r| r.workflow_uuid == uuid));
    }

    #[tokio::test]
    async fn cancel_workflow_marks_cancelled() {
        let exec = build_executor();
        exec.register("sleepy", |_ctx, _input: ()| async move {
                futures::future::pending::<()>().await;
                Ok(())
            });
        let uuid = Uuid::new_v4();
        let _h: crate::workflow::WorkflowHandle<()> = exec
        .workflow("sleepy", Some(uuid), Identity::default(), None, serde_json::json!(null))
        .await
        .unwrap();

        let state = AdminState { executor: Arc::clone(&exec) };
        let status = cancel_workflow(State(state), Path(uuid)).await.unwrap();
        assert_eq!(status, StatusCode::NO_CONTENT);

        let snapshot = exec.store().get_workflow_status(uuid).await.unwrap();
        assert_eq!(snapshot.status, WorkflowStatusValue::Cancelled);
    }
}
