//! HTTP server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `POST` | `/api/chat` | Chat, single reply |
//! | `POST` | `/api/chat/stream` | Chat, Server-Sent Events |
//! | `POST` | `/api/rag/ingest` | Chunk, redact, embed and store documents |
//! | `POST` | `/api/rag/query` | Ranked hits for a question |
//! | `POST` | `/api/rag/eval` | Recall@k and p95 latency over a labeled set |
//! | `POST` | `/api/rag/agent` | One-step retrieval agent |
//! | `GET` `POST` | `/api/sessions` | List / create sessions |
//! | `GET` `DELETE` | `/api/sessions/{id}` | Session detail / delete |
//! | `POST` | `/api/sessions/{id}/messages` | Append a message |
//! | `PUT`  | `/api/sessions/{id}/memory` | Set the session memory note |
//! | `GET`  | `/api/sessions/{id}/export?format=json\|md` | Download a session |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "Missing JSON body or 'message' field" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `payload_too_large` (413),
//! `service_unavailable` (503, circuit breaker open), `internal` (500).
//!
//! # Streaming
//!
//! `/api/chat/stream` emits `data:` frames: `{"request_id"}` first, then one
//! `{"token"}` per token, then `{"done": true}`. A failure ends the stream
//! with `{"error", "done": true}`. Validation errors are returned as plain
//! JSON errors before the stream opens.
//!
//! # Request IDs
//!
//! Every response carries `x-request-id`, echoed from the request or
//! generated. The same id appears in the access log line.

use axum::{
    body::Bytes,
    extract::{Path, Query, Request, State},
    http::{header, HeaderName, HeaderValue, StatusCode},
    middleware::{self, Next},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post, put},
    Extension, Json, Router,
};
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{Any, CorsLayer};
use uuid::Uuid;

use crate::agent::{run_agent, AgentRequest, AgentResponse, ToolContext, ToolRegistry};
use crate::chat::{parse_request, ChatError, ChatResponse, ChatService, ChatValidationError};
use crate::config::Config;
use crate::ingest::{IngestRequest, IngestResponse};
use crate::llm::{LlmClient, LlmError, OpenAiChat};
use crate::models::{Message, Role, Session, SessionDetail, SessionSummary};
use crate::rag::{EvalRequest, EvalResponse, QueryRequest, QueryResponse, RagEngine};
use crate::sessions::{ExportFormat, SessionError, SessionStore};
use crate::vector_store::StoreError;
use crate::{db, migrate};

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const SERVICE_UNAVAILABLE: &str = "Service temporarily unavailable";

/// Shared application state passed to all route handlers via Axum's `State` extractor.
#[derive(Clone)]
pub struct AppState {
    config: Arc<Config>,
    engine: Arc<RagEngine>,
    chat: ChatService,
    sessions: SessionStore,
    tools: Arc<ToolRegistry>,
}

impl AppState {
    pub fn new(config: Config, engine: Arc<RagEngine>, llm: LlmClient, sessions: SessionStore) -> Self {
        let chat = ChatService::new(config.chat.clone(), llm, Arc::clone(&engine), sessions.clone());
        Self {
            config: Arc::new(config),
            engine,
            chat,
            sessions,
            tools: Arc::new(ToolRegistry::with_builtins()),
        }
    }

    /// Wire the production stack: SQLite sessions, the configured embedding
    /// backend and the OpenAI chat backend.
    pub async fn from_config(config: &Config) -> anyhow::Result<Self> {
        let pool = db::connect(config).await?;
        migrate::run_migrations(&pool).await?;
        let engine = Arc::new(RagEngine::from_config(config)?);
        let llm = LlmClient::from_config(&config.llm, Arc::new(OpenAiChat::from_config(&config.llm)?));
        Ok(Self::new(config.clone(), engine, llm, SessionStore::new(pool)))
    }

    pub fn engine(&self) -> &Arc<RagEngine> {
        &self.engine
    }
}

/// The full route table with CORS and request-id middleware applied.
pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/api/chat", post(handle_chat))
        .route("/api/chat/stream", post(handle_chat_stream))
        .route("/api/rag/ingest", post(handle_ingest))
        .route("/api/rag/query", post(handle_query))
        .route("/api/rag/eval", post(handle_eval))
        .route("/api/rag/agent", post(handle_agent))
        .route("/api/sessions", get(handle_list_sessions).post(handle_create_session))
        .route(
            "/api/sessions/{id}",
            get(handle_get_session).delete(handle_delete_session),
        )
        .route("/api/sessions/{id}/messages", post(handle_append_message))
        .route("/api/sessions/{id}/memory", put(handle_set_memory))
        .route("/api/sessions/{id}/export", get(handle_export_session))
        .layer(middleware::from_fn(request_context))
        .layer(cors)
        .with_state(state)
}

/// Starts the HTTP server on `[server].bind` and runs until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let state = AppState::from_config(config).await?;
    state.engine.ensure_store().await?;

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    tracing::info!(
        bind = %config.server.bind,
        embedding = state.engine.model_name(),
        "server listening"
    );
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("shutting down");
}

// ============ Request context ============

/// The id of the request being handled, inserted by the middleware.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

async fn request_context(mut req: Request, next: Next) -> Response {
    let request_id = req
        .headers()
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty() && v.len() <= 128)
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    req.extensions_mut().insert(RequestId(request_id.clone()));

    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let started = Instant::now();

    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }

    tracing::info!(
        event = "http.access",
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started.elapsed().as_millis() as u64,
        request_id = %request_id,
        "request"
    );
    response
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
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::BAD_REQUEST,
        code: "bad_request".to_string(),
        message: message.into(),
    }
}

fn not_found(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::NOT_FOUND,
        code: "not_found".to_string(),
        message: message.into(),
    }
}

fn payload_too_large(message: impl Into<String>) -> AppError {
    AppError {
        status: StatusCode::PAYLOAD_TOO_LARGE,
        code: "payload_too_large".to_string(),
        message: message.into(),
    }
}

fn service_unavailable() -> AppError {
    AppError {
        status: StatusCode::SERVICE_UNAVAILABLE,
        code: "service_unavailable".to_string(),
        message: SERVICE_UNAVAILABLE.to_string(),
    }
}

fn internal(message: impl Into<String>) -> AppError {
    let message = message.into();
    tracing::error!(error = %message, "request failed");
    AppError {
        status: StatusCode::INTERNAL_SERVER_ERROR,
        code: "internal".to_string(),
        message,
    }
}

impl From<ChatValidationError> for AppError {
    fn from(err: ChatValidationError) -> Self {
        match err {
            ChatValidationError::TooLarge => payload_too_large(err.to_string()),
            _ => bad_request(err.to_string()),
        }
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        internal(err.to_string())
    }
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound(_) => not_found("Session not found"),
            other => internal(other.to_string()),
        }
    }
}

impl From<LlmError> for AppError {
    fn from(err: LlmError) -> Self {
        if err.is_circuit_open() {
            service_unavailable()
        } else {
            internal(err.to_string())
        }
    }
}

impl From<ChatError> for AppError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::Session(e) => e.into(),
            ChatError::Llm(e) => e.into(),
            ChatError::Store(e) => e.into(),
        }
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        internal(err.to_string())
    }
}

/// Lenient JSON body: an empty body means "all defaults".
fn parse_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, AppError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| bad_request(format!("invalid JSON body: {}", e)))
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ Chat ============

async fn handle_chat(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Result<Json<ChatResponse>, AppError> {
    let input = parse_request(&body, state.chat.config())?;
    match state.chat.reply(&input).await {
        Ok(reply) => Ok(Json(ChatResponse { reply })),
        Err(err) => {
            if matches!(&err, ChatError::Llm(e) if e.is_circuit_open()) {
                tracing::warn!(event = "chat.circuit_open", request_id = %request_id, model = %input.model, "rejected while breaker open");
            }
            Err(err.into())
        }
    }
}

fn frame(payload: serde_json::Value) -> Event {
    Event::default().data(payload.to_string())
}

async fn handle_chat_stream(
    State(state): State<AppState>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    body: Bytes,
) -> Result<Response, AppError> {
    let input = parse_request(&body, state.chat.config())?;
    let mut tokens = state.chat.stream(&input, &request_id).await?;

    let events = async_stream::stream! {
        yield Ok::<Event, Infallible>(frame(serde_json::json!({ "request_id": request_id })));
        while let Some(item) = tokens.next().await {
            match item {
                Ok(token) => yield Ok(frame(serde_json::json!({ "token": token }))),
                Err(err) => {
                    let message = if err.is_circuit_open() {
                        SERVICE_UNAVAILABLE.to_string()
                    } else {
                        err.to_string()
                    };
                    yield Ok(frame(serde_json::json!({ "error": message, "done": true })));
                    return;
                }
            }
        }
        yield Ok(frame(serde_json::json!({ "done": true })));
    };

    let headers = [(HeaderName::from_static("x-accel-buffering"), "no")];
    Ok((headers, Sse::new(events).keep_alive(KeepAlive::default())).into_response())
}

// ============ RAG ============

async fn handle_ingest(State(state): State<AppState>, body: Bytes) -> Result<Json<IngestResponse>, AppError> {
    let request: IngestRequest = parse_body(&body)?;
    Ok(Json(state.engine.ingest(request).await?))
}

async fn handle_query(State(state): State<AppState>, body: Bytes) -> Result<Json<QueryResponse>, AppError> {
    let request: QueryRequest = parse_body(&body)?;
    let question = request.question.as_deref().unwrap_or_default();
    let hits = state.engine.query(question, &request.params(&state.engine)).await?;
    Ok(Json(QueryResponse { ok: true, hits }))
}

async fn handle_eval(State(state): State<AppState>, body: Bytes) -> Result<Json<EvalResponse>, AppError> {
    let request: EvalRequest = parse_body(&body)?;
    let k = request.k.unwrap_or(state.config.retrieval.default_k);
    let metrics = state.engine.eval(&request.queries, k).await?;
    Ok(Json(EvalResponse { ok: true, metrics }))
}

async fn handle_agent(State(state): State<AppState>, body: Bytes) -> Result<Json<AgentResponse>, AppError> {
    let request: AgentRequest = parse_body(&body)?;
    let k = request.k.unwrap_or(state.config.retrieval.default_k);
    let ctx = ToolContext::new(Arc::clone(&state.engine));
    let result = run_agent(&request.goal, k, &state.tools, &ctx).await?;
    Ok(Json(AgentResponse { ok: true, result }))
}

// ============ Sessions ============

#[derive(Debug, Default, Deserialize)]
struct CreateSessionRequest {
    #[serde(default)]
    title: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct AppendMessageRequest {
    #[serde(default)]
    role: String,
    #[serde(default)]
    content: String,
    #[serde(default)]
    tokens: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
struct MemoryRequest {
    #[serde(default)]
    memory: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ExportQuery {
    #[serde(default)]
    format: Option<String>,
}

async fn handle_list_sessions(State(state): State<AppState>) -> Result<Json<Vec<SessionSummary>>, AppError> {
    Ok(Json(state.sessions.list().await?))
}

async fn handle_create_session(State(state): State<AppState>, body: Bytes) -> Result<Json<Session>, AppError> {
    let request: CreateSessionRequest = parse_body(&body)?;
    let title = request
        .title
        .as_deref()
        .map(str::trim)
        .filter(|t| !t.is_empty());
    Ok(Json(state.sessions.create(title).await?))
}

async fn handle_get_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<SessionDetail>, AppError> {
    Ok(Json(state.sessions.detail(&id).await?))
}

async fn handle_delete_session(State(state): State<AppState>, Path(id): Path<String>) -> Result<StatusCode, AppError> {
    if state.sessions.delete(&id).await? {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("Session not found"))
    }
}

async fn handle_append_message(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<(StatusCode, Json<Message>), AppError> {
    let request: AppendMessageRequest = parse_body(&body)?;
    let role = Role::parse(&request.role).ok_or_else(|| bad_request("role must be 'user' or 'assistant'"))?;
    if request.content.trim().is_empty() {
        return Err(bad_request("content must not be empty"));
    }
    let message = state
        .sessions
        .append_message(&id, role, &request.content, request.tokens)
        .await?;
    Ok((StatusCode::CREATED, Json(message)))
}

async fn handle_set_memory(
    State(state): State<AppState>,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<Json<Session>, AppError> {
    let request: MemoryRequest = parse_body(&body)?;
    let memory = request
        .memory
        .as_deref()
        .map(str::trim)
        .filter(|m| !m.is_empty());
    Ok(Json(state.sessions.set_memory(&id, memory).await?))
}

async fn handle_export_session(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<ExportQuery>,
) -> Result<Response, AppError> {
    let raw = query.format.as_deref().unwrap_or("json");
    let format = ExportFormat::parse(raw).ok_or_else(|| bad_request("format must be 'json' or 'md'"))?;
    let export = state.sessions.export(&id, format).await?;

    let disposition = format!("attachment; filename=\"{}\"", export.filename);
    Ok((
        [
            (header::CONTENT_TYPE, export.content_type.to_string()),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        export.body,
    )
        .into_response())
}
