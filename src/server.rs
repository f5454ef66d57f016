//! HTTP server.
//!
//! A thin JSON surface over the assistant, the rebuild orchestrator and the
//! escalation workflow.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/chat` | Answer one query |
//! | `POST` | `/admin/rebuild` | Full reindex and atomic swap |
//! | `GET`  | `/admin/status` | Active generation metadata |
//! | `GET`  | `/admin/escalations` | Escalated queries, optional `?status=` filter |
//! | `POST` | `/admin/escalations/{id}` | Update status and remarks |
//! | `GET`  | `/admin/stats` | Initiated / finished counts |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Error Contract
//!
//! Admin endpoints return:
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "status is required" } }
//! ```
//!
//! `/chat` keeps the chat client's contract: `{"answer": "..."}` on success,
//! `{"error": "Query and email are required"}` (400), or
//! `{"error": "An internal server error occurred"}` (500). A provider
//! failure never produces either trigger string.
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted so the browser chat
//! client can be served from a different origin.

use axum::{
    extract::{Path, Query as QueryParams, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::assistant::{Assistant, INTERNAL_ERROR_MESSAGE};
use crate::error::{EscalationLogError, IndexBuildError};
use crate::escalation::EscalationStats;
use crate::models::{EscalationRecord, EscalationStatus, Query, Requester};
use crate::rebuild::{IndexManager, IndexStatus, RebuildReport};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    pub assistant: Arc<Assistant>,
    pub index: Arc<IndexManager>,
    pub documents_root: Arc<PathBuf>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/chat", post(handle_chat))
        .route("/admin/rebuild", post(handle_rebuild))
        .route("/admin/status", get(handle_status))
        .route("/admin/escalations", get(handle_list_escalations))
        .route("/admin/escalations/{id}", post(handle_update_escalation))
        .route("/admin/stats", get(handle_stats))
        .route("/health", get(handle_health))
        .layer(cors)
        .with_state(state)
}

/// Bind to `bind` and serve until the process is terminated.
pub async fn run_server(bind: &str, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(addr = %listener.local_addr()?, "campus assistant listening");
    axum::serve(listener, app).await?;
    Ok(())
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Internal error type that converts into an Axum HTTP response.
#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code.to_string(),
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request",
        message: message.into(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal",
        message: message.into(),
    }
}

impl From<EscalationLogError> for AppError {
    fn from(err: EscalationLogError) -> Self {
        match err {
            EscalationLogError::NotFound(id) => AppError {
                status: StatusCode::NOT_FOUND,
                code: "not_found",
                message: format!("escalation {} not found", id),
            },
            other => {
                tracing::error!(error = %other, "escalation log error");
                internal("escalation log unavailable")
            }
        }
    }
}

// ============ POST /chat ============

#[derive(Debug, Deserialize)]
struct ChatRequest {
    query: Option<String>,
    user_name: Option<String>,
    email: Option<String>,
    phone_number: Option<String>,
}

#[derive(Serialize)]
struct ChatResponse {
    answer: String,
}

#[derive(Serialize)]
struct ChatError {
    error: &'static str,
}

/// Validate a chat request. Query text and email are required.
fn chat_query(req: ChatRequest) -> Option<Query> {
    let text = req.query.filter(|q| !q.trim().is_empty())?;
    let email = req.email.filter(|e| !e.trim().is_empty())?;
    Some(Query {
        text,
        requester: Requester {
            name: req.user_name,
            email: Some(email),
            phone: req.phone_number,
        },
    })
}

async fn handle_chat(State(state): State<AppState>, Json(req): Json<ChatRequest>) -> Response {
    let Some(query) = chat_query(req) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ChatError {
                error: "Query and email are required",
            }),
        )
            .into_response();
    };

    match state.assistant.handle(&query).await {
        Ok(reply) => Json(ChatResponse {
            answer: reply.answer,
        })
        .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "chat query failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ChatError {
                    error: INTERNAL_ERROR_MESSAGE,
                }),
            )
                .into_response()
        }
    }
}

// ============ Admin ============

async fn handle_rebuild(State(state): State<AppState>) -> Result<Json<RebuildReport>, AppError> {
    state
        .index
        .rebuild(&state.documents_root)
        .await
        .map(Json)
        .map_err(rebuild_failed)
}

/// Details stay in the log; the response only says the rebuild failed.
fn rebuild_failed(err: IndexBuildError) -> AppError {
    tracing::error!(error = %err, "rebuild failed; previous index remains active");
    internal("Failed to rebuild index; the previous index remains active")
}

async fn handle_status(State(state): State<AppState>) -> Json<IndexStatus> {
    Json(state.index.status())
}

#[derive(Debug, Deserialize)]
struct ListParams {
    status: Option<String>,
}

async fn handle_list_escalations(
    State(state): State<AppState>,
    QueryParams(params): QueryParams<ListParams>,
) -> Result<Json<Vec<EscalationRecord>>, AppError> {
    let status = params
        .status
        .map(|s| s.parse::<EscalationStatus>())
        .transpose()
        .map_err(bad_request)?;
    let records = state.assistant.escalation_log().list(status).await?;
    Ok(Json(records))
}

#[derive(Debug, Deserialize)]
struct UpdateRequest {
    status: Option<String>,
    remarks: Option<String>,
}

#[derive(Serialize)]
struct UpdateResponse {
    status: &'static str,
    message: &'static str,
}

async fn handle_update_escalation(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Json(req): Json<UpdateRequest>,
) -> Result<Json<UpdateResponse>, AppError> {
    let (Some(status), Some(remarks)) = (req.status, req.remarks) else {
        return Err(bad_request("Status and remarks are required"));
    };
    let status = status.parse::<EscalationStatus>().map_err(bad_request)?;
    state
        .assistant
        .escalation_log()
        .update_status(id, status, &remarks)
        .await?;
    Ok(Json(UpdateResponse {
        status: "success",
        message: "Query updated",
    }))
}

async fn handle_stats(State(state): State<AppState>) -> Result<Json<EscalationStats>, AppError> {
    Ok(Json(state.assistant.escalation_log().stats().await?))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
