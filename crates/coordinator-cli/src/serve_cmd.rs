//! The coordinator's HTTP API (SPEC_FULL §6): the surface a worker process
//! (`coordinator-agent`) talks to, plus a `/status` snapshot and a
//! `/cleanup` hook for on-demand recovery.
//!
//! Router/`AppError`/CORS scaffold and the `tower::ServiceExt::oneshot` test
//! style are kept from this codebase's original dashboard server; every
//! route and handler is new, grounded on
//! `original_source/.../main.py`'s Flask routes for request/response shape.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tower_http::cors::CorsLayer;

use coordinator_db::models::{Phase, Task, TaskStatus, Worker};
use coordinator_db::queries::{
    merge_queue as queue_db, phases as phase_db, tasks as task_db, workers as worker_db,
};

use coordinator_core::claim;
use coordinator_core::notify::Notifier;
use coordinator_core::recovery;
use coordinator_core::state::TaskStateMachine;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::NOT_FOUND, message: msg.into() }
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self { status: StatusCode::BAD_REQUEST, message: msg.into() }
    }

    pub fn internal(err: anyhow::Error) -> Self {
        Self { status: StatusCode::INTERNAL_SERVER_ERROR, message: format!("{err:#}") }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    pool: PgPool,
    notifier: Arc<Notifier>,
    substrate: &'static str,
    agent_timeout_secs: u64,
}

// ---------------------------------------------------------------------------
// Request/response types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(rename = "sessionTag")]
    session_tag: String,
}

#[derive(Debug, Serialize)]
struct RegisterResponse {
    #[serde(rename = "agentId")]
    agent_id: String,
    config: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct AgentIdRequest {
    #[serde(rename = "agentId")]
    agent_id: String,
}

#[derive(Debug, Serialize)]
struct HeartbeatResponse {
    success: bool,
    events: Vec<coordinator_core::notify::TaskEvent>,
}

#[derive(Debug, Serialize)]
struct ClaimResponse {
    task: Option<Task>,
    role: Option<String>,
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CompleteRequest {
    #[serde(rename = "agentId")]
    agent_id: String,
    #[serde(rename = "taskId")]
    task_id: String,
    success: bool,
    #[serde(rename = "prRef", default)]
    pr_ref: Option<String>,
    #[serde(rename = "branchName", default)]
    branch_name: Option<String>,
}

#[derive(Debug, Serialize)]
struct StatusResponse {
    workers: Vec<Worker>,
    tasks: Vec<Task>,
    phases: Vec<Phase>,
    merge_queue_depth: i64,
}

#[derive(Debug, Serialize)]
struct CleanupResponse {
    orphaned_tasks_reset: u64,
    phase_recomputed: bool,
    resumed_phase: Option<String>,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Default liveness timeout used by `/cleanup`'s on-demand sweep when the
/// caller does not override it via `build_router_with_timeout`.
const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 180;

pub fn build_router(pool: PgPool, notifier: Arc<Notifier>) -> Router {
    build_router_with_timeout(pool, notifier, DEFAULT_AGENT_TIMEOUT_SECS)
}

pub fn build_router_with_timeout(pool: PgPool, notifier: Arc<Notifier>, agent_timeout_secs: u64) -> Router {
    let state = AppState { pool, notifier, substrate: "postgres", agent_timeout_secs };

    Router::new()
        .route("/health", get(health))
        .route("/agent/register", post(register))
        .route("/agent/heartbeat", post(heartbeat))
        .route("/agent/unregister", post(unregister))
        .route("/task/claim", post(claim_task))
        .route("/task/complete", post(complete_task))
        .route("/status", get(status))
        .route("/cleanup", post(cleanup))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

pub async fn run_serve(
    pool: PgPool,
    notifier: Arc<Notifier>,
    bind: &str,
    port: u16,
    agent_timeout_secs: u64,
) -> Result<()> {
    let app = build_router_with_timeout(pool, notifier, agent_timeout_secs);
    let addr: SocketAddr = format!("{bind}:{port}").parse()?;
    tracing::info!("coordinator serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).with_graceful_shutdown(shutdown_signal()).await?;
    tracing::info!("coordinator serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "substrate": state.substrate,
        "timestamp": Utc::now(),
    }))
}

async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<Json<RegisterResponse>, AppError> {
    let worker = coordinator_core::worker_registry::register(&state.pool, &req.session_tag)
        .await
        .map_err(AppError::internal)?;

    Ok(Json(RegisterResponse {
        agent_id: worker.id,
        config: serde_json::json!({ "heartbeatIntervalSecs": 30 }),
    }))
}

async fn heartbeat(
    State(state): State<AppState>,
    Json(req): Json<AgentIdRequest>,
) -> Result<Json<HeartbeatResponse>, AppError> {
    let ok = coordinator_core::worker_registry::heartbeat(&state.pool, &req.agent_id)
        .await
        .map_err(AppError::internal)?;

    if !ok {
        return Err(AppError::not_found(format!("agent {} is not registered", req.agent_id)));
    }

    let events = state.notifier.drain_pending(&state.pool, &req.agent_id).await.map_err(AppError::internal)?;
    Ok(Json(HeartbeatResponse { success: true, events }))
}

async fn unregister(
    State(state): State<AppState>,
    Json(req): Json<AgentIdRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    coordinator_core::worker_registry::unregister(&state.pool, &req.agent_id)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(serde_json::json!({ "success": true })))
}

async fn claim_task(
    State(state): State<AppState>,
    Json(req): Json<AgentIdRequest>,
) -> Result<Json<ClaimResponse>, AppError> {
    let worker = worker_db::get_worker(&state.pool, &req.agent_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("agent {} is not registered", req.agent_id)))?;
    let _ = worker;

    if phase_db::get_current_phase(&state.pool).await.map_err(AppError::internal)?.is_none() {
        return Ok(Json(ClaimResponse { task: None, role: None, reason: Some("no_active_phase".to_string()) }));
    }

    match claim::claim_next_task(&state.pool, &req.agent_id).await.map_err(AppError::internal)? {
        Some(task) => {
            let role = claim::role_for_type(task.task_type);
            worker_db::set_worker_working(&state.pool, &req.agent_id, &task.id, role)
                .await
                .map_err(AppError::internal)?;
            Ok(Json(ClaimResponse { task: Some(task), role: Some(role.to_string()), reason: None }))
        }
        None => Ok(Json(ClaimResponse { task: None, role: None, reason: Some("no_tasks_available".to_string()) })),
    }
}

async fn complete_task(
    State(state): State<AppState>,
    Json(req): Json<CompleteRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    let task = task_db::get_task(&state.pool, &req.task_id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("task {} not found", req.task_id)))?;

    if task.assigned_to.as_deref() != Some(req.agent_id.as_str()) {
        return Err(AppError::bad_request(format!(
            "task {} is not assigned to agent {}",
            req.task_id, req.agent_id
        )));
    }

    // A worker may be resubmitting after a merge-queue bounce (conflict or
    // test failure) rather than completing a fresh claim, in which case the
    // task is parked at `conflict`/`test_failed` rather than `in_progress`.
    // Pass it back through `in_progress` first so the final edge is valid.
    if matches!(task.status, TaskStatus::Conflict | TaskStatus::TestFailed | TaskStatus::MergeFailed) {
        TaskStateMachine::transition(&state.pool, &req.task_id, task.status, TaskStatus::InProgress)
            .await
            .map_err(AppError::internal)?;
    }

    let to_status = if req.success { TaskStatus::Done } else { TaskStatus::Failed };
    TaskStateMachine::transition(&state.pool, &req.task_id, TaskStatus::InProgress, to_status)
        .await
        .map_err(AppError::internal)?;

    if req.success {
        if let Some(branch) = &req.branch_name {
            task_db::set_branch_and_pr(&state.pool, &req.task_id, Some(branch.as_str()), req.pr_ref.as_deref())
                .await
                .map_err(AppError::internal)?;
        }
        if let Some(pr_ref) = &req.pr_ref {
            let branch = req.branch_name.clone().unwrap_or_default();
            queue_db::enqueue(&state.pool, &req.task_id, &branch, Some(pr_ref.as_str()), &req.agent_id)
                .await
                .map_err(AppError::internal)?;
        }
    } else {
        coordinator_core::state::TaskStateMachine::block_with_propagation(&state.pool, &req.task_id, "worker reported failure")
            .await
            .ok();
    }

    worker_db::set_worker_idle(&state.pool, &req.agent_id, req.success).await.map_err(AppError::internal)?;

    Ok(Json(serde_json::json!({ "success": true })))
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, AppError> {
    let workers = worker_db::list_workers(&state.pool).await.map_err(AppError::internal)?;
    let tasks = task_db::list_all_tasks(&state.pool).await.map_err(AppError::internal)?;
    let phases = phase_db::list_phases(&state.pool).await.map_err(AppError::internal)?;
    let merge_queue_depth = queue_db::count_queue(&state.pool).await.map_err(AppError::internal)?;

    Ok(Json(StatusResponse { workers, tasks, phases, merge_queue_depth }))
}

async fn cleanup(State(state): State<AppState>) -> Result<Json<CleanupResponse>, AppError> {
    let timeout = chrono::Duration::seconds(state.agent_timeout_secs as i64);
    let report = recovery::recover(&state.pool, false, timeout).await.map_err(AppError::internal)?;
    Ok(Json(CleanupResponse {
        orphaned_tasks_reset: report.orphaned_tasks_reset,
        phase_recomputed: report.phase_recomputed,
        resumed_phase: report.resumed_phase,
    }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use sqlx::PgPool;
    use tower::ServiceExt;

    use coordinator_core::notify::Notifier;
    use coordinator_db::models::TaskType;
    use coordinator_db::queries::tasks::{NewTask, insert_task_if_absent};
    use coordinator_test_utils::{create_test_db, drop_test_db};

    fn notifier() -> std::sync::Arc<Notifier> {
        std::sync::Arc::new(Notifier::new())
    }

    async fn send_json(pool: PgPool, method: &str, uri: &str, body: serde_json::Value) -> axum::response::Response {
        let app = super::build_router(pool, notifier());
        app.oneshot(
            Request::builder()
                .method(method)
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap()
    }

    async fn send_get(pool: PgPool, uri: &str) -> axum::response::Response {
        let app = super::build_router(pool, notifier());
        app.oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap()).await.unwrap()
    }

    async fn body_json(response: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), 1_048_576).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let (pool, db_name) = create_test_db().await;

        let resp = send_get(pool.clone(), "/health").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["status"], "ok");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn register_mints_an_agent_id() {
        let (pool, db_name) = create_test_db().await;

        let resp = send_json(pool.clone(), "POST", "/agent/register", serde_json::json!({ "sessionTag": "cli" })).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert!(json["agentId"].as_str().unwrap().starts_with("worker-"));

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn heartbeat_for_unknown_agent_is_not_found() {
        let (pool, db_name) = create_test_db().await;

        let resp = send_json(pool.clone(), "POST", "/agent/heartbeat", serde_json::json!({ "agentId": "worker-999" })).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn claim_with_no_active_phase_reports_reason() {
        let (pool, db_name) = create_test_db().await;

        let reg = send_json(pool.clone(), "POST", "/agent/register", serde_json::json!({ "sessionTag": "cli" })).await;
        let agent_id = body_json(reg).await["agentId"].as_str().unwrap().to_string();

        let resp = send_json(pool.clone(), "POST", "/task/claim", serde_json::json!({ "agentId": agent_id })).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert!(json["task"].is_null());
        assert_eq!(json["reason"], "no_active_phase");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn claim_returns_an_eligible_task_once_phased() {
        let (pool, db_name) = create_test_db().await;

        insert_task_if_absent(
            &pool,
            &NewTask {
                id: "t1".to_string(),
                title: "Task one".to_string(),
                description: "do it".to_string(),
                acceptance_criteria: None,
                task_type: TaskType::Development,
                priority: 0,
            },
        )
        .await
        .unwrap();
        coordinator_db::queries::phases::replace_phases(&pool, &[("phase-1".to_string(), vec!["t1".to_string()])])
            .await
            .unwrap();
        coordinator_db::queries::phases::set_phase_active(&pool, 1).await.unwrap();

        let reg = send_json(pool.clone(), "POST", "/agent/register", serde_json::json!({ "sessionTag": "cli" })).await;
        let agent_id = body_json(reg).await["agentId"].as_str().unwrap().to_string();

        let resp = send_json(pool.clone(), "POST", "/task/claim", serde_json::json!({ "agentId": agent_id })).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["task"]["id"], "t1");
        assert_eq!(json["role"], "developer");

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn complete_task_enqueues_a_merge_request_on_success_with_pr() {
        let (pool, db_name) = create_test_db().await;

        insert_task_if_absent(
            &pool,
            &NewTask {
                id: "t1".to_string(),
                title: "Task one".to_string(),
                description: "do it".to_string(),
                acceptance_criteria: None,
                task_type: TaskType::Development,
                priority: 0,
            },
        )
        .await
        .unwrap();
        coordinator_db::queries::phases::replace_phases(&pool, &[("phase-1".to_string(), vec!["t1".to_string()])])
            .await
            .unwrap();
        coordinator_db::queries::phases::set_phase_active(&pool, 1).await.unwrap();

        let reg = send_json(pool.clone(), "POST", "/agent/register", serde_json::json!({ "sessionTag": "cli" })).await;
        let agent_id = body_json(reg).await["agentId"].as_str().unwrap().to_string();
        send_json(pool.clone(), "POST", "/task/claim", serde_json::json!({ "agentId": agent_id })).await;

        let resp = send_json(
            pool.clone(),
            "POST",
            "/task/complete",
            serde_json::json!({
                "agentId": agent_id,
                "taskId": "t1",
                "success": true,
                "prRef": "https://example.com/pr/1",
                "branchName": format!("{agent_id}/task-t1"),
            }),
        )
        .await;
        assert_eq!(resp.status(), StatusCode::OK);

        let depth = coordinator_db::queries::merge_queue::count_queue(&pool).await.unwrap();
        assert_eq!(depth, 1);

        pool.close().await;
        drop_test_db(&db_name).await;
    }

    #[tokio::test]
    async fn status_reports_workers_tasks_and_phases() {
        let (pool, db_name) = create_test_db().await;

        let resp = send_get(pool.clone(), "/status").await;
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert!(json["workers"].as_array().is_some());
        assert!(json["tasks"].as_array().is_some());
        assert!(json["phases"].as_array().is_some());

        pool.close().await;
        drop_test_db(&db_name).await;
    }
}
