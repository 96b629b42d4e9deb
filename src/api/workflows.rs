/// Workflow management REST API endpoints
///
/// CRUD for workflow definitions with hot-reload: every change compiles the
/// graph, updates the registry and reinstalls the workflow's cron schedule.
/// A definition with a cycle or dangling edge is rejected with 400.

use crate::{
    error::GraphError,
    queue::JobQueue,
    runtime::{engine::WorkflowExecutor, scheduler::CronSchedulerService},
    workflow::{events::EventRegistry, registry::WorkflowRegistry, storage::WorkflowStorage, types::Workflow},
};
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::Json,
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

/// Application state containing shared resources
#[derive(Clone)]
pub struct AppState {
    pub storage: WorkflowStorage,
    /// Hot-reload registry of compiled workflows
    pub registry: Arc<WorkflowRegistry>,
    pub events: Arc<EventRegistry>,
    pub scheduler: Arc<CronSchedulerService>,
    pub executor: Arc<WorkflowExecutor>,
    pub queue: Arc<JobQueue>,
}

/// Error body: `{ "error": "..." }`
pub type ApiError = (StatusCode, Json<Value>);

pub fn api_error(status: StatusCode, message: impl std::fmt::Display) -> ApiError {
    (status, Json(json!({ "error": message.to_string() })))
}

/// Response for workflow creation/update operations
#[derive(Debug, Serialize)]
pub struct WorkflowResponse {
    pub id: String,
    pub message: String,
}

/// Request body for workflow creation
#[derive(Debug, Deserialize)]
pub struct CreateWorkflowRequest {
    pub workflow: Workflow,
}

pub fn create_workflow_routes() -> Router<AppState> {
    Router::new()
        .route("/api/workflows", post(create_workflow).get(list_workflows))
        .route(
            "/api/workflows/{id}",
            get(get_workflow).put(update_workflow).delete(delete_workflow),
        )
}

/// POST /api/workflows
/// Body: { "workflow": { "id": "...", "name": "...", "userId": "...", "nodes": [...], "edges": [...] } }
async fn create_workflow(
    State(state): State<AppState>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let workflow = payload.workflow;
    validate(&workflow)?;

    match state.storage.get_workflow(&workflow.id).await {
        Ok(Some(_)) => {
            return Err(api_error(
                StatusCode::CONFLICT,
                format!("workflow '{}' already exists", workflow.id),
            ))
        }
        Ok(None) => {}
        Err(e) => return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e)),
    }

    let name = workflow.name.clone();
    let id = install(&state, workflow).await?;
    tracing::info!("🔥 Created workflow: {} ({})", id, name);

    Ok(Json(WorkflowResponse {
        message: format!("Workflow '{}' created successfully", name),
        id,
    }))
}

/// GET /api/workflows
async fn list_workflows(State(state): State<AppState>) -> Result<Json<Value>, ApiError> {
    match state.storage.list_workflows().await {
        Ok(workflows) => Ok(Json(json!({ "workflows": workflows }))),
        Err(e) => {
            tracing::error!("Failed to list workflows: {}", e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
        }
    }
}

/// GET /api/workflows/{id}
async fn get_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Workflow>, ApiError> {
    match state.storage.get_workflow(&id).await {
        Ok(Some(workflow)) => Ok(Json(workflow)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, format!("workflow not found: {}", id))),
        Err(e) => {
            tracing::error!("Failed to get workflow {}: {}", id, e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
        }
    }
}

/// PUT /api/workflows/{id}
async fn update_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<CreateWorkflowRequest>,
) -> Result<Json<WorkflowResponse>, ApiError> {
    let mut workflow = payload.workflow;
    workflow.id = id.clone();
    validate(&workflow)?;

    match state.storage.get_workflow(&id).await {
        Ok(Some(_)) => {}
        Ok(None) => return Err(api_error(StatusCode::NOT_FOUND, format!("workflow not found: {}", id))),
        Err(e) => return Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e)),
    }

    let name = workflow.name.clone();
    install(&state, workflow).await?;

    Ok(Json(WorkflowResponse {
        id,
        message: format!("Workflow '{}' updated successfully", name),
    }))
}

/// DELETE /api/workflows/{id}
///
/// Running executions keep their compiled copy and finish normally.
async fn delete_workflow(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    state.scheduler.remove_workflow_schedule(&id).await;

    match state.registry.remove_workflow(&id).await {
        Ok(true) => {
            tracing::info!("🗑️ Deleted workflow: {}", id);
            Ok(Json(json!({ "message": "Workflow deleted successfully" })))
        }
        Ok(false) => Err(api_error(StatusCode::NOT_FOUND, format!("workflow not found: {}", id))),
        Err(e) => {
            tracing::error!("Failed to delete workflow {}: {}", id, e);
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
        }
    }
}

fn validate(workflow: &Workflow) -> Result<(), ApiError> {
    if workflow.id.is_empty() || workflow.name.is_empty() || workflow.user_id.is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "id, name and userId are required"));
    }
    Ok(())
}

/// Compile + persist + publish, then (re)schedule
async fn install(state: &AppState, workflow: Workflow) -> Result<String, ApiError> {
    let compiled = state.registry.upsert_workflow(workflow).await.map_err(|e| {
        if e.downcast_ref::<GraphError>().is_some() {
            api_error(StatusCode::BAD_REQUEST, e)
        } else {
            tracing::error!("Failed to save workflow: {}", e);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, e)
        }
    })?;

    if let Err(e) = state
        .scheduler
        .add_or_update_workflow_schedule(&compiled.workflow)
        .await
    {
        return Err(api_error(
            StatusCode::BAD_REQUEST,
            format!("invalid schedule for workflow '{}': {}", compiled.workflow.id, e),
        ));
    }

    Ok(compiled.workflow.id.clone())
}
