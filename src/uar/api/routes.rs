use crate::error::RunFault;
use crate::uar::{
    api::{sse::build_sse_response, ws::ws_handler},
    domain::runs::{OwnerType, RunHandle, RunRecord},
    runtime::manager::{DispatchMode, DispatchRequest, Dispatched, RunManager},
};
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

pub fn build_router() -> Router<Arc<RunManager>> {
    Router::new()
        .route("/runs", post(create_run))
        .route("/runs/active", get(active_runs))
        .route("/runs/{id}", get(get_run))
        .route("/runs/{id}/cancel", post(cancel_run))
        .route("/runs/{id}/pause", post(pause_run))
        .route("/runs/{id}/resume", post(resume_run))
        .route("/runs/{id}/stream", get(stream_run))
        .route("/workflows", get(list_workflows))
        .route("/ws", get(ws_handler))
}

#[derive(Debug, Deserialize)]
struct CreateRunRequest {
    owner_type: OwnerType,
    owner_id: String,
    input: String,
    #[serde(default)]
    stream: bool,
    #[serde(default)]
    background: bool,
    #[serde(default)]
    run_id: Option<String>,
    #[serde(default)]
    session_id: Option<String>,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    additional_data: Value,
    #[serde(default)]
    timeout_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
struct BackgroundResponse {
    #[serde(flatten)]
    handle: RunHandle,
    stream_url: String,
}

async fn create_run(
    State(manager): State<Arc<RunManager>>,
    Json(req): Json<CreateRunRequest>,
) -> Result<Response, RunFault> {
    let mode = DispatchMode::from_flags(req.stream, req.background)?;
    let request = DispatchRequest {
        owner_type: req.owner_type,
        owner_id: req.owner_id,
        input: req.input,
        mode,
        run_id: req.run_id,
        session_id: req.session_id,
        user_id: req.user_id,
        additional_data: req.additional_data,
        timeout: req.timeout_secs.map(Duration::from_secs),
    };

    Ok(match manager.dispatch(request).await? {
        Dispatched::Completed(record) => Json(record).into_response(),
        // Closing the connection drops the stream, which cancels the run.
        Dispatched::Stream(events) => build_sse_response(events).into_response(),
        Dispatched::Background(handle) => {
            let stream_url = format!("/api/uar/runs/{}/stream", handle.run_id);
            (
                StatusCode::ACCEPTED,
                Json(BackgroundResponse { handle, stream_url }),
            )
                .into_response()
        }
    })
}

async fn get_run(
    State(manager): State<Arc<RunManager>>,
    Path(run_id): Path<String>,
) -> Result<Json<RunRecord>, RunFault> {
    manager
        .get_run(&run_id)
        .await?
        .map(Json)
        .ok_or(RunFault::NotFound(run_id))
}

async fn active_runs(State(manager): State<Arc<RunManager>>) -> Json<Vec<RunRecord>> {
    Json(manager.active_runs().await)
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
}

async fn cancel_run(
    State(manager): State<Arc<RunManager>>,
    Path(run_id): Path<String>,
) -> Result<Json<CancelResponse>, RunFault> {
    let cancelled = manager.cancel(&run_id).await?;
    Ok(Json(CancelResponse { cancelled }))
}

async fn pause_run(
    State(manager): State<Arc<RunManager>>,
    Path(run_id): Path<String>,
) -> Result<Json<RunRecord>, RunFault> {
    manager.pause(&run_id).await.map(Json)
}

async fn resume_run(
    State(manager): State<Arc<RunManager>>,
    Path(run_id): Path<String>,
) -> Result<Json<RunRecord>, RunFault> {
    manager.resume(&run_id).await.map(Json)
}

/// Follow a run from its first event. Observers never cancel the run.
async fn stream_run(
    State(manager): State<Arc<RunManager>>,
    Path(run_id): Path<String>,
) -> Result<impl IntoResponse, RunFault> {
    let subscription = manager
        .events()
        .subscribe(&run_id, 0)
        .ok_or(RunFault::NotFound(run_id))?;
    Ok(build_sse_response(subscription.into_stream()))
}

async fn list_workflows(State(manager): State<Arc<RunManager>>) -> Json<Vec<String>> {
    Json(manager.workflow_names())
}
