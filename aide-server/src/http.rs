//! Aide HTTP REST API
//!
//! Axum-based HTTP server exposing the personal-assistant surface.
//!
//! Architecture: each JSON endpoint has a thin axum handler that delegates to
//! a pure inner function returning `(StatusCode, serde_json::Value)`. The
//! inner functions are directly testable without axum dispatch machinery.
//! `/chat` is the exception: it returns a raw streaming response with the
//! resolved session id in the `X-Session-Id` header.
//!
//! Endpoints:
//! - GET  /health              — health check with DB status
//! - GET  /version             — server version info
//! - POST /register            — create a user (409 on duplicate)
//! - POST /login               — verify credentials
//! - GET  /sessions/:username  — ordered session list for a user
//! - POST /chat                — streamed chat turn
//! - POST /analyze             — buffered PDF analysis (multipart)

use std::sync::Arc;

use aide_core::config::HttpConfig;
use axum::body::Body;
use axum::extract::{DefaultBodyLimit, Multipart, Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use sqlx::PgPool;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::auth;
use crate::store;
use crate::subsystems::analyze::{self, AnalyzeError};
use crate::subsystems::orchestrate::{self, ChatDeps, ChatError, ConverseParams};

/// Out-of-band channel for the resolved session id on `/chat`.
pub const SESSION_ID_HEADER: &str = "x-session-id";

/// Build the Axum router with all endpoints.
pub fn build_router(state: Arc<ChatDeps>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/version", get(version_handler))
        .route("/register", post(register_handler))
        .route("/login", post(login_handler))
        .route("/sessions/:username", get(sessions_handler))
        .route("/chat", post(chat_handler))
        .route("/analyze", post(analyze_handler))
        // Extracted document text can be large; the default 2 MiB is too tight.
        .layer(DefaultBodyLimit::max(32 * 1024 * 1024))
        .with_state(state)
}

/// Start the HTTP server on the configured address.
/// Gracefully shuts down when the broadcast shutdown signal fires.
pub async fn start_http_server(
    deps: Arc<ChatDeps>,
    http: &HttpConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", http.host, http.port);
    let app = build_router(deps);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("Aide HTTP API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            tracing::info!("HTTP server shutting down...");
        })
        .await?;

    Ok(())
}

// ============================================================================
// Request DTOs
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    pub username: String,
    pub prompt: String,
    pub model: Option<String>,
    pub session_id: Option<Uuid>,
    /// `use_kb` is the historical field name some clients still send.
    #[serde(default, alias = "use_kb")]
    pub use_retrieval: bool,
}

// ============================================================================
// Inner (directly testable) business logic functions
// ============================================================================

/// Inner health check — queries DB and returns (status_code, json_body).
pub async fn health_inner(pool: &PgPool) -> (StatusCode, serde_json::Value) {
    match aide_core::db::health_check(pool).await {
        Ok(version) => (
            StatusCode::OK,
            serde_json::json!({
                "status": "healthy",
                "version": env!("CARGO_PKG_VERSION"),
                "postgresql": version,
            }),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            serde_json::json!({
                "status": "unhealthy",
                "error": e.to_string(),
            }),
        ),
    }
}

/// Inner version — returns version info (pure, no IO).
pub fn version_inner() -> serde_json::Value {
    serde_json::json!({
        "version": env!("CARGO_PKG_VERSION"),
        "protocol": "aide/1",
    })
}

/// Inner register — hash the password and create the user; 409 on conflict.
pub async fn register_inner(
    pool: &PgPool,
    req: CredentialsRequest,
) -> (StatusCode, serde_json::Value) {
    let username = req.username.trim();
    if username.is_empty() || req.password.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            serde_json::json!({
                "error": "Usuario y contraseña son obligatorios",
                "status": "error",
            }),
        );
    }

    let hash = match auth::hash_password(&req.password) {
        Ok(h) => h,
        Err(e) => {
            tracing::error!(error = %e, "Password hashing failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": "Error interno", "status": "error" }),
            );
        }
    };

    match store::create_user(pool, username, &hash).await {
        Ok(true) => (
            StatusCode::OK,
            serde_json::json!({ "message": "Usuario registrado exitosamente" }),
        ),
        Ok(false) => (
            StatusCode::CONFLICT,
            serde_json::json!({ "error": "El usuario ya existe", "status": "error" }),
        ),
        Err(e) => {
            tracing::error!(error = %e, "User insert failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": "Error interno", "status": "error" }),
            )
        }
    }
}

/// Inner login — constant shape for both unknown user and bad password.
pub async fn login_inner(
    pool: &PgPool,
    req: CredentialsRequest,
) -> (StatusCode, serde_json::Value) {
    let unauthorized = || {
        (
            StatusCode::UNAUTHORIZED,
            serde_json::json!({ "error": "Credenciales inválidas", "status": "error" }),
        )
    };

    let user = match store::get_user(pool, req.username.trim()).await {
        Ok(Some(u)) => u,
        Ok(None) => return unauthorized(),
        Err(e) => {
            tracing::error!(error = %e, "User lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": "Error interno", "status": "error" }),
            );
        }
    };

    if auth::verify_password(&req.password, &user.password_hash) {
        (
            StatusCode::OK,
            serde_json::json!({ "message": "Login exitoso", "username": user.username }),
        )
    } else {
        unauthorized()
    }
}

/// Inner session list — 404 for unknown users, ordered-by-creation entries
/// with NULL titles rendered as the configured default.
pub async fn sessions_inner(
    pool: &PgPool,
    default_title: &str,
    username: &str,
) -> (StatusCode, serde_json::Value) {
    let user = match store::get_user(pool, username).await {
        Ok(Some(u)) => u,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                serde_json::json!({ "error": "Usuario no encontrado", "status": "error" }),
            );
        }
        Err(e) => {
            tracing::error!(error = %e, "User lookup failed");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": "Error interno", "status": "error" }),
            );
        }
    };

    match store::list_sessions(pool, user.id).await {
        Ok(sessions) => {
            let entries: Vec<serde_json::Value> = sessions
                .into_iter()
                .map(|s| {
                    serde_json::json!({
                        "id": s.id,
                        "description": s.title.unwrap_or_else(|| default_title.to_string()),
                        "created_at": s.created_at,
                    })
                })
                .collect();
            (StatusCode::OK, serde_json::Value::Array(entries))
        }
        Err(e) => {
            tracing::error!(error = %e, "Session list failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": "Error interno", "status": "error" }),
            )
        }
    }
}

// ============================================================================
// Axum handler wrappers (thin — delegate to inner functions)
// ============================================================================

pub async fn health_handler(State(state): State<Arc<ChatDeps>>) -> impl IntoResponse {
    let (status, body) = health_inner(&state.pool).await;
    (status, Json(body))
}

pub async fn version_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(version_inner()))
}

pub async fn register_handler(
    State(state): State<Arc<ChatDeps>>,
    Json(req): Json<CredentialsRequest>,
) -> impl IntoResponse {
    let (status, body) = register_inner(&state.pool, req).await;
    (status, Json(body))
}

pub async fn login_handler(
    State(state): State<Arc<ChatDeps>>,
    Json(req): Json<CredentialsRequest>,
) -> impl IntoResponse {
    let (status, body) = login_inner(&state.pool, req).await;
    (status, Json(body))
}

pub async fn sessions_handler(
    State(state): State<Arc<ChatDeps>>,
    Path(username): Path<String>,
) -> impl IntoResponse {
    let (status, body) = sessions_inner(&state.pool, &state.chat.default_title, &username).await;
    (status, Json(body))
}

/// `/chat` — resolves the session, then hands the body over to the
/// orchestrator's producer stream. The session id rides the response header
/// so a client that started without one can continue the conversation.
pub async fn chat_handler(
    State(state): State<Arc<ChatDeps>>,
    Json(req): Json<ChatRequest>,
) -> Response {
    let params = ConverseParams {
        username: req.username,
        prompt: req.prompt,
        model: req.model,
        session_id: req.session_id,
        use_retrieval: req.use_retrieval,
    };

    match orchestrate::converse(&state, params).await {
        Ok(conversation) => {
            let session_id = conversation.session_id.to_string();
            let built = Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
                .header(SESSION_ID_HEADER, &session_id)
                .body(Body::from_stream(conversation.stream));
            match built {
                Ok(response) => response,
                Err(e) => {
                    tracing::error!(error = %e, "Failed to build streaming response");
                    json_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        serde_json::json!({ "error": "Error interno", "status": "error" }),
                    )
                }
            }
        }
        Err(ChatError::UnknownUser) => json_response(
            StatusCode::UNAUTHORIZED,
            serde_json::json!({ "error": "Usuario no encontrado", "status": "error" }),
        ),
        Err(ChatError::ForeignSession) => json_response(
            StatusCode::FORBIDDEN,
            serde_json::json!({ "error": "La sesión pertenece a otro usuario", "status": "error" }),
        ),
        Err(ChatError::EmptyPrompt) => json_response(
            StatusCode::BAD_REQUEST,
            serde_json::json!({ "error": "El mensaje no puede estar vacío", "status": "error" }),
        ),
        Err(ChatError::Database(e)) => {
            tracing::error!(error = %e, "Chat turn failed before streaming");
            json_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                serde_json::json!({ "error": "Error interno", "status": "error" }),
            )
        }
    }
}

/// `/analyze` — multipart with a `file` part (PDF, text extracted upstream)
/// plus optional `model` and `query` fields. Validation rejections happen
/// before any backend call.
pub async fn analyze_handler(
    State(state): State<Arc<ChatDeps>>,
    mut multipart: Multipart,
) -> impl IntoResponse {
    let mut filename: Option<String> = None;
    let mut content_type: Option<String> = None;
    let mut text: Option<String> = None;
    let mut model: Option<String> = None;
    let mut query: Option<String> = None;

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({
                        "error": format!("Petición multipart inválida: {}", e),
                        "status": "error",
                    })),
                );
            }
        };

        let name = field.name().unwrap_or_default().to_string();
        let read = async {
            match name.as_str() {
                "file" => {
                    filename = field.file_name().map(str::to_string);
                    content_type = field.content_type().map(str::to_string);
                    let bytes = field.bytes().await?;
                    text = Some(String::from_utf8_lossy(&bytes).into_owned());
                }
                "model" => model = Some(field.text().await?),
                "query" => query = Some(field.text().await?),
                _ => {}
            }
            Ok::<(), axum::extract::multipart::MultipartError>(())
        };

        if let Err(e) = read.await {
            return (
                StatusCode::BAD_REQUEST,
                Json(serde_json::json!({
                    "error": format!("Petición multipart inválida: {}", e),
                    "status": "error",
                })),
            );
        }
    }

    let (Some(filename), Some(text)) = (filename, text) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "error": "Falta el archivo en la petición",
                "status": "error",
            })),
        );
    };

    let model = model
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| state.chat.default_model.clone());

    match analyze::analyze_document(
        &state.ollama,
        &model,
        &filename,
        content_type.as_deref(),
        &text,
        query.as_deref(),
    )
    .await
    {
        Ok(result) => (StatusCode::OK, Json(result)),
        Err(e @ (AnalyzeError::NotPdf | AnalyzeError::EmptyText)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string(), "status": "error" })),
        ),
        Err(AnalyzeError::Backend(e)) => {
            tracing::error!(error = %e, "Document analysis failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(serde_json::json!({
                    "error": orchestrate::user_facing_error(&e, &model),
                    "status": "error",
                })),
            )
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn json_response(status: StatusCode, body: serde_json::Value) -> Response {
    (status, Json(body)).into_response()
}
