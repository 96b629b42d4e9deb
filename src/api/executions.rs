/// Execution and job REST API endpoints
///
/// Event definitions, run start/inspection/cancellation and read access to
/// the job queue.

use crate::{
    api::workflows::{api_error, ApiError, AppState},
    error::ExecutorError,
    queue::types::{Job, JobStats, StatsFilter},
    runtime::records::ExecutionDetail,
    workflow::events::EventDefinition,
};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::Json,
    routing::{get, post, put},
    Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

pub fn create_execution_routes() -> Router<AppState> {
    Router::new()
        .route("/api/events/{id}", put(put_event).delete(delete_event))
        .route("/api/workflows/{id}/runs", post(start_run))
        .route("/api/executions/{id}", get(get_execution))
        .route("/api/executions/{id}/cancel", post(cancel_execution))
        .route("/api/jobs/stats", get(job_stats))
        .route("/api/jobs/{id}", get(get_job))
}

/// Run request body; both fields optional
#[derive(Debug, Default, Deserialize)]
pub struct StartRunRequest {
    #[serde(default)]
    pub input: Value,
}

/// PUT /api/events/{id}
///
/// Stores a new version of the definition; in-flight jobs keep the payload
/// they were built with.
async fn put_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(mut event): Json<EventDefinition>,
) -> Result<Json<EventDefinition>, ApiError> {
    event.id = id;
    if !event.spec.is_object() {
        return Err(api_error(StatusCode::BAD_REQUEST, "event spec must be a JSON object"));
    }

    let stored = state.events.upsert(event).await.map_err(|e| {
        tracing::error!("Failed to save event: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e)
    })?;
    Ok(Json((*stored).clone()))
}

/// DELETE /api/events/{id}
async fn delete_event(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    match state.events.remove(&id).await {
        Ok(true) => Ok(Json(json!({ "message": "Event deleted successfully" }))),
        Ok(false) => Err(api_error(StatusCode::NOT_FOUND, format!("event not found: {}", id))),
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e)),
    }
}

/// POST /api/workflows/{id}/runs
/// Body: { "input": { ... } }
///
/// Returns as soon as the roots are submitted; poll the execution for progress.
async fn start_run(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Option<Json<StartRunRequest>>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let input = body.map(|Json(request)| request.input).unwrap_or_default();

    let handle = state
        .executor
        .run(&id, input)
        .await
        .map_err(executor_error)?;

    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "executionId": handle.execution_id(), "workflowId": id })),
    ))
}

/// GET /api/executions/{id}
async fn get_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ExecutionDetail>, ApiError> {
    state
        .executor
        .get_execution(&id)
        .await
        .map(Json)
        .map_err(executor_error)
}

/// POST /api/executions/{id}/cancel
async fn cancel_execution(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, ApiError> {
    let cancelled = state.executor.cancel(&id).await.map_err(executor_error)?;
    Ok(Json(json!({ "executionId": id, "cancelled": cancelled })))
}

/// GET /api/jobs/stats?userId=&workflowExecutionId=&jobType=
async fn job_stats(
    State(state): State<AppState>,
    Query(filter): Query<StatsFilter>,
) -> Result<Json<JobStats>, ApiError> {
    state
        .queue
        .stats(&filter)
        .await
        .map(Json)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e))
}

/// GET /api/jobs/{id}
async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Job>, ApiError> {
    match state.queue.get_job(&id).await {
        Ok(Some(job)) => Ok(Json(job)),
        Ok(None) => Err(api_error(StatusCode::NOT_FOUND, format!("job not found: {}", id))),
        Err(e) => Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e)),
    }
}

fn executor_error(e: ExecutorError) -> ApiError {
    let status = match &e {
        ExecutorError::WorkflowNotFound(_) | ExecutorError::ExecutionNotFound(_) => StatusCode::NOT_FOUND,
        ExecutorError::MissingEvent { .. } | ExecutorError::Graph(_) | ExecutorError::Payload { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        _ => {
            tracing::error!("Executor error: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    api_error(status, e)
}
