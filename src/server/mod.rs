//! HTTP 控制面（feature = "server"）
//!
//! 薄封装：提交任务、查询 Run 状态投影、审批放行/拒绝、健康检查。
//! 不含任何控制面逻辑，全部转发给编排器与审批代理。
//! 网络契约：默认仅绑定 loopback；绑定外部地址必须配置 auth token，
//! 且所有接口都要求携带 x-hive-token 头。

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path as AxumPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::core::{Orchestrator, RunId, TaskRequest};

pub struct ServerState {
    pub orchestrator: Arc<Orchestrator>,
    pub task_tx: mpsc::UnboundedSender<TaskRequest>,
    pub auth_token: Option<String>,
}

fn authorized(state: &ServerState, headers: &HeaderMap) -> bool {
    match &state.auth_token {
        None => true,
        Some(expected) => headers
            .get("x-hive-token")
            .and_then(|v| v.to_str().ok())
            .map(|got| got == expected)
            .unwrap_or(false),
    }
}

#[derive(Deserialize)]
struct SubmitTask {
    intent: String,
    #[serde(default)]
    metadata: std::collections::BTreeMap<String, serde_json::Value>,
}

async fn submit_task(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<SubmitTask>,
) -> Result<(StatusCode, Json<serde_json::Value>), StatusCode> {
    if !authorized(&state, &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let mut request = TaskRequest::new(body.intent);
    request.metadata = body.metadata;
    let run_id = request.run_id.clone();
    let task_id = request.task_id.clone();
    state
        .task_tx
        .send(request)
        .map_err(|_| StatusCode::SERVICE_UNAVAILABLE)?;
    Ok((
        StatusCode::ACCEPTED,
        Json(serde_json::json!({"run_id": run_id, "task_id": task_id})),
    ))
}

async fn run_state(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    AxumPath(run_id): AxumPath<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if !authorized(&state, &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let run_id = RunId(run_id);
    match state.orchestrator.run_state(&run_id) {
        Ok(run_state) => Ok(Json(serde_json::json!({
            "run_id": run_id,
            "state": run_state,
        }))),
        Err(_) => Err(StatusCode::NOT_FOUND),
    }
}

#[derive(Deserialize)]
struct ApprovalBody {
    grant: bool,
    #[serde(default)]
    reason: Option<String>,
}

async fn resolve_approval(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    AxumPath(run_id): AxumPath<String>,
    Json(body): Json<ApprovalBody>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if !authorized(&state, &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let run_id = RunId(run_id);
    let resolved = if body.grant {
        state.orchestrator.approvals().grant(&run_id)
    } else {
        state.orchestrator.approvals().deny(
            &run_id,
            body.reason.unwrap_or_else(|| "denied by reviewer".to_string()),
        )
    };
    if resolved {
        Ok(Json(serde_json::json!({"resolved": true})))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn pending_approvals(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if !authorized(&state, &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(Json(serde_json::json!({
        "pending": state.orchestrator.approvals().pending(),
    })))
}

async fn cancel_run(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    AxumPath(run_id): AxumPath<String>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if !authorized(&state, &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let cancelled = state.orchestrator.cancel_run(&RunId(run_id));
    Ok(Json(serde_json::json!({"cancelled": cancelled})))
}

async fn healthz(State(state): State<Arc<ServerState>>) -> Json<serde_json::Value> {
    let audit_ok = state.orchestrator.audit().records().is_ok();
    Json(serde_json::json!({
        "status": if audit_ok { "ok" } else { "degraded" },
    }))
}

pub fn routes(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/tasks", post(submit_task))
        .route("/runs/:run_id", get(run_state))
        .route("/runs/:run_id/approval", post(resolve_approval))
        .route("/runs/:run_id/cancel", post(cancel_run))
        .route("/approvals", get(pending_approvals))
        .route("/healthz", get(healthz))
        .with_state(state)
}

/// 启动 HTTP 面。绑定非 loopback 地址而未配置 auth token 时拒绝启动。
pub async fn serve(bind: &str, state: Arc<ServerState>) -> anyhow::Result<()> {
    let addr: SocketAddr = bind.parse()?;
    if !addr.ip().is_loopback() && state.auth_token.is_none() {
        anyhow::bail!(
            "refusing to bind {addr}: non-loopback bind requires server.auth_token (and TLS at the proxy)"
        );
    }
    let app = routes(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "control surface listening");
    axum::serve(listener, app).await?;
    Ok(())
}
