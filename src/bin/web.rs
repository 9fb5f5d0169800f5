//! Concierge HTTP 入口
//!
//! 启动: cargo run --bin concierge-web --features web
//! 监听地址取 `server.bind`（默认 127.0.0.1:5000），可通过 CONCIERGE__SERVER__BIND 覆盖。
//! 会话由调用方传入 session_id（请求体或查询参数）标识，不使用 Cookie。

#![cfg(feature = "web")]

use std::sync::Arc;

use axum::{
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::sync::CancellationToken;

use concierge::auth::{AuthFlow, AuthFlowError, CredentialState};
use concierge::config::load_config;
use concierge::{build_components, observability, OrchestrationPipeline};

struct AppState {
    pipeline: Arc<OrchestrationPipeline>,
    auth: Arc<AuthFlow>,
}

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
    #[serde(default)]
    session_id: Option<String>,
}

#[derive(Serialize)]
struct ChatResponse {
    response: String,
    session_id: String,
}

#[derive(Deserialize)]
struct SessionQuery {
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

fn session_or_new(session_id: Option<String>) -> String {
    session_id
        .filter(|s| !s.trim().is_empty())
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
}

fn bad_request(body: serde_json::Value) -> Response {
    (StatusCode::BAD_REQUEST, Json(body)).into_response()
}

/// POST /api/chat：输入校验与错误映射都在 Pipeline 内完成，这里总是 200
async fn api_chat(State(state): State<Arc<AppState>>, Json(req): Json<ChatRequest>) -> Json<ChatResponse> {
    let session_id = session_or_new(req.session_id);

    // 客户端断开时 axum 会丢弃本 future，guard 随之触发取消
    let cancel = CancellationToken::new();
    let _guard = cancel.clone().drop_guard();
    let response = state
        .pipeline
        .process_user_message(&req.message, &session_id, &cancel)
        .await;

    Json(ChatResponse { response, session_id })
}

/// GET /auth/login?session_id=...：重定向到身份提供方
async fn auth_login(State(state): State<Arc<AppState>>, Query(q): Query<SessionQuery>) -> Response {
    let session_id = session_or_new(q.session_id);
    match state.auth.begin_login(&session_id).await {
        Ok(url) => Redirect::to(&url).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to build authorization URL");
            (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({ "error": "login unavailable" })))
                .into_response()
        }
    }
}

/// GET /auth/callback：校验 state、换取令牌，成功后回到首页
async fn auth_callback(State(state): State<Arc<AppState>>, Query(q): Query<CallbackQuery>) -> Response {
    if let Some(error) = q.error.filter(|e| !e.is_empty()) {
        return bad_request(json!({ "error": error, "description": q.error_description }));
    }
    let Some(code) = q.code.filter(|c| !c.is_empty()) else {
        return bad_request(json!({ "error": "No authorization code received" }));
    };
    let state_param = q.state.unwrap_or_default();

    match state.auth.complete_login(&state_param, &code).await {
        Ok(session_id) => {
            tracing::info!(session_id, "Login completed");
            Redirect::to(&format!("/?session_id={session_id}")).into_response()
        }
        Err(AuthFlowError::InvalidState) => bad_request(json!({ "error": "Invalid state parameter" })),
        Err(e) => {
            tracing::warn!(error = %e, "Token acquisition failed");
            bad_request(json!({ "error": "Token acquisition failed" }))
        }
    }
}

/// POST /auth/logout?session_id=...
async fn auth_logout(State(state): State<Arc<AppState>>, Query(q): Query<SessionQuery>) -> Json<serde_json::Value> {
    if let Some(session_id) = q.session_id.filter(|s| !s.is_empty()) {
        state.auth.logout(&session_id).await;
    }
    Json(json!({ "message": "Logged out successfully" }))
}

/// GET /auth/status?session_id=...
async fn auth_status(State(state): State<Arc<AppState>>, Query(q): Query<SessionQuery>) -> Json<serde_json::Value> {
    let status = match q.session_id.filter(|s| !s.is_empty()) {
        Some(session_id) => state.auth.status(&session_id).await,
        None => CredentialState::Absent,
    };
    Json(json!({
        "isAuthenticated": matches!(status, CredentialState::Valid | CredentialState::Expiring),
        "status": status,
    }))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    observability::init();

    let cfg = load_config(None)?;
    let components = build_components(&cfg)?;
    let state = Arc::new(AppState {
        pipeline: components.pipeline,
        auth: components.auth,
    });

    let app = Router::new()
        .route("/api/chat", post(api_chat))
        .route("/auth/login", get(auth_login))
        .route("/auth/callback", get(auth_callback))
        .route("/auth/logout", post(auth_logout))
        .route("/auth/status", get(auth_status))
        .route("/health", get(|| async { Json(json!({ "status": "healthy" })) }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&cfg.server.bind).await?;
    tracing::info!("Concierge Web: http://{}", cfg.server.bind);
    axum::serve(listener, app).await?;

    Ok(())
}
