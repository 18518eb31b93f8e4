use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde_json::json;

use super::super::{
    AutoRestartRequest, CreateJobRequest, DependencyRequest, IPCServer, ScriptQuery,
};
use crate::store::OwnerId;
use crate::supervisor::{StopOutcome, SupervisorError};

/// GET /api/stats - 전체 통계
pub async fn stats(State(state): State<IPCServer>) -> Result<impl IntoResponse, SupervisorError> {
    let stats = state.supervisor.stats()?;
    Ok(Json(json!({ "success": true, "stats": stats })))
}

/// GET /api/owners/:owner/jobs - 소유자의 작업 목록
pub async fn list_jobs(
    Path(owner): Path<OwnerId>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let jobs = state.supervisor.list_jobs(owner)?;
    Ok(Json(json!({ "success": true, "jobs": jobs })))
}

/// POST /api/owners/:owner/jobs - 작업 생성
pub async fn create_job(
    Path(owner): Path<OwnerId>,
    State(state): State<IPCServer>,
    Json(req): Json<CreateJobRequest>,
) -> Result<impl IntoResponse, SupervisorError> {
    let job = state
        .supervisor
        .create_job(owner, &req.name, req.username.as_deref())?;
    Ok((StatusCode::CREATED, Json(json!({ "success": true, "job": job }))))
}

/// GET /api/owners/:owner/jobs/:name - 작업 상태
pub async fn job_status(
    Path((owner, name)): Path<(OwnerId, String)>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let status = state.supervisor.job_status(owner, &name)?;
    Ok(Json(json!({ "success": true, "job": status })))
}

/// PUT /api/owners/:owner/jobs/:name/script?filename=.. - 스크립트 업로드
pub async fn submit_script(
    Path((owner, name)): Path<(OwnerId, String)>,
    Query(query): Query<ScriptQuery>,
    State(state): State<IPCServer>,
    body: Bytes,
) -> Result<impl IntoResponse, SupervisorError> {
    if body.is_empty() {
        return Err(SupervisorError::InvalidScript("empty upload".into()));
    }
    let entry = state
        .supervisor
        .submit_script(owner, &name, &body, &query.filename)
        .await?;
    Ok(Json(json!({
        "success": true,
        "entry": entry.file_name().map(|n| n.to_string_lossy().to_string()),
    })))
}

/// POST /api/owners/:owner/jobs/:name/start
pub async fn start_job(
    Path((owner, name)): Path<(OwnerId, String)>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    state.supervisor.request_start(owner, &name).await?;
    Ok(Json(json!({ "success": true, "state": "running" })))
}

/// POST /api/owners/:owner/jobs/:name/stop
pub async fn stop_job(
    Path((owner, name)): Path<(OwnerId, String)>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let outcome = state.supervisor.request_stop(owner, &name).await?;
    Ok(Json(json!({
        "success": true,
        "outcome": outcome,
        "was_running": outcome == StopOutcome::Stopped,
    })))
}

/// DELETE /api/owners/:owner/jobs/:name
pub async fn delete_job(
    Path((owner, name)): Path<(OwnerId, String)>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    state.supervisor.request_delete(owner, &name).await?;
    Ok(Json(json!({ "success": true })))
}

/// PUT /api/owners/:owner/jobs/:name/auto-restart
pub async fn set_auto_restart(
    Path((owner, name)): Path<(OwnerId, String)>,
    State(state): State<IPCServer>,
    Json(req): Json<AutoRestartRequest>,
) -> Result<impl IntoResponse, SupervisorError> {
    state
        .supervisor
        .set_auto_restart(owner, &name, req.enabled)
        .await?;
    Ok(Json(json!({ "success": true, "auto_restart": req.enabled })))
}

/// GET /api/owners/:owner/jobs/:name/logs
pub async fn read_logs(
    Path((owner, name)): Path<(OwnerId, String)>,
    State(state): State<IPCServer>,
) -> Result<impl IntoResponse, SupervisorError> {
    let logs = state.supervisor.read_logs(owner, &name).await?;
    Ok(Json(json!({ "success": true, "logs": logs })))
}

/// POST /api/owners/:owner/jobs/:name/dependencies
pub async fn install_dependency(
    Path((owner, name)): Path<(OwnerId, String)>,
    State(state): State<IPCServer>,
    Json(req): Json<DependencyRequest>,
) -> Result<impl IntoResponse, SupervisorError> {
    state
        .supervisor
        .install_dependency(owner, &name, &req.package)
        .await?;
    Ok(Json(json!({ "success": true, "package": req.package.trim() })))
}
