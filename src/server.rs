//! HTTP tool server.
//!
//! Exposes the stored analyses to agents and wraps Gemini function calling
//! in a chat endpoint. Every tool is dispatched through the same
//! [`ToolRegistry`].
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Status, version, tool count. Bearer token required when `server.token` is set |
//! | `GET`  | `/tools/list` | Registered tools with parameter schemas |
//! | `POST` | `/tools/{name}` | Validate parameters (JSON object; empty body = none) and run a tool |
//! | `POST` | `/chat` | `{ "message" }` → `{ "response", "tool_calls" }` |
//!
//! # Error contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! The `/health` bearer check is a shared-secret gate for local use, not
//! an authentication scheme; run behind a proxy for anything exposed.
//!
//! Codes: `bad_request` (400), `unauthorized` (401), `not_found` (404),
//! `timeout` (408), `rate_limited` (429), `tool_error` (500),
//! `internal` (500), `upstream` (502).

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sha2::{Digest, Sha256};
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::error::Error;
use crate::gemini::{ChatReply, GeminiClient};
use crate::tools::{validate_params, ToolContext, ToolInfo, ToolRegistry};

/// Shared state for every handler.
#[derive(Clone)]
pub struct AppState {
    pub tools: Arc<ToolRegistry>,
    pub ctx: ToolContext,
    pub gemini: Arc<GeminiClient>,
    pub system_prompt: String,
    /// Expected bearer token for `/health`.
    pub token: Option<String>,
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/{name}", post(handle_tool_call))
        .route("/chat", post(handle_chat))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Serve on an already-bound listener until the process exits.
pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    let addr = listener.local_addr()?;
    tracing::info!(%addr, tools = state.tools.len(), "tool server started");
    println!("Tool server listening on http://{}", addr);
    for t in state.tools.tools() {
        println!("  POST /tools/{}: {}", t.name(), t.description());
    }
    axum::serve(listener, router(state)).await?;
    Ok(())
}

/// Bind `bind` and serve.
pub async fn run_server(bind: &str, state: AppState) -> anyhow::Result<()> {
    let listener = TcpListener::bind(bind).await?;
    serve(listener, state).await
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

#[derive(Debug)]
struct AppError {
    status: StatusCode,
    code: &'static str,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
        }
    }
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

impl From<Error> for AppError {
    fn from(err: Error) -> Self {
        let message = err.to_string();
        match err {
            Error::InvalidInput(_) => AppError::new(StatusCode::BAD_REQUEST, "bad_request", message),
            Error::RateLimited(_) => {
                AppError::new(StatusCode::TOO_MANY_REQUESTS, "rate_limited", message)
            }
            Error::Upstream(_) if message.contains("timed out") => {
                AppError::new(StatusCode::REQUEST_TIMEOUT, "timeout", message)
            }
            Error::Upstream(_) => AppError::new(StatusCode::BAD_GATEWAY, "upstream", message),
            _ => AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message),
        }
    }
}

impl From<JsonRejection> for AppError {
    fn from(rejection: JsonRejection) -> Self {
        AppError::new(StatusCode::BAD_REQUEST, "bad_request", rejection.body_text())
    }
}

/// Map a tool failure onto an HTTP error.
///
/// Crate errors keep their own mapping; plain messages are classified by
/// wording.
fn classify_tool_error(tool_name: &str, err: anyhow::Error) -> AppError {
    let err = match err.downcast::<Error>() {
        Ok(e) => {
            let mut app = AppError::from(e);
            app.message = format!("{}: {}", tool_name, app.message);
            return app;
        }
        Err(err) => err,
    };

    let msg = format!("{}: {}", tool_name, err);
    if msg.contains("no stored record") || msg.contains("not found") {
        AppError::new(StatusCode::NOT_FOUND, "not_found", msg)
    } else if msg.contains("must not be empty") || msg.contains("must be") {
        AppError::new(StatusCode::BAD_REQUEST, "bad_request", msg)
    } else {
        AppError::new(StatusCode::INTERNAL_SERVER_ERROR, "tool_error", msg)
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    tools: usize,
}

async fn handle_health(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<HealthResponse>, AppError> {
    if let Some(expected) = state.token.as_deref() {
        let presented = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "));
        if !presented.is_some_and(|p| tokens_match(p, expected)) {
            return Err(AppError::new(
                StatusCode::UNAUTHORIZED,
                "unauthorized",
                "invalid or missing bearer token",
            ));
        }
    }

    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        tools: state.tools.len(),
    }))
}

/// Compare fixed-length digests so the time taken does not depend on where
/// the tokens differ or on their lengths.
fn tokens_match(presented: &str, expected: &str) -> bool {
    let a = Sha256::digest(presented.as_bytes());
    let b = Sha256::digest(expected.as_bytes());
    a.iter().zip(b.iter()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    Json(ToolListResponse {
        tools: state.tools.infos(),
    })
}

// ============ POST /tools/{name} ============

async fn handle_tool_call(
    State(state): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> Result<Json<Value>, AppError> {
    let tool = state.tools.find(&name).ok_or_else(|| {
        AppError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no tool registered with name: {}", name),
        )
    })?;

    // An empty body means "no parameters".
    let params: Value = if body.iter().all(u8::is_ascii_whitespace) {
        Value::Null
    } else {
        serde_json::from_slice(&body).map_err(|e| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "bad_request",
                format!("request body is not valid JSON: {}", e),
            )
        })?
    };

    let params = validate_params(&tool.parameters_schema(), &params)
        .map_err(|e| AppError::new(StatusCode::BAD_REQUEST, "bad_request", e.to_string()))?;

    let result = tool
        .execute(params, &state.ctx)
        .await
        .map_err(|e| classify_tool_error(&name, e))?;

    Ok(Json(json!({ "result": result })))
}

// ============ POST /chat ============

#[derive(Deserialize)]
struct ChatRequest {
    message: String,
}

async fn handle_chat(
    State(state): State<AppState>,
    req: Result<Json<ChatRequest>, JsonRejection>,
) -> Result<Json<ChatReply>, AppError> {
    let Json(req) = req?;
    if req.message.trim().is_empty() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "bad_request",
            "message must not be empty",
        ));
    }

    let reply = state
        .gemini
        .chat(&req.message, &state.system_prompt, &state.tools, &state.ctx)
        .await?;
    Ok(Json(reply))
}
