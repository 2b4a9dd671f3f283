//! HTTP server exposing the advisor to mobile and web clients.

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Multipart, Query as QueryParams, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Extension, Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tower_http::{services::ServeDir, timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, instrument, warn};

use crate::{
    auth::{auth_middleware, AuthManager, Claims},
    capability::CapabilityHealth,
    coordinator::Strategy,
    error::OrchestrationError,
    middleware::{
        create_body_limit_layer, create_cors_layer, create_rate_limiter, rate_limit_middleware,
        security_headers_middleware, AppRateLimiter,
    },
    orchestrator::Orchestrator,
    query::{Media, Query},
    settings::Settings,
    storage::{ConversationRecord, ConversationStore, MediaStore},
};

const DEFAULT_MIME: &str = "image/jpeg";

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<Orchestrator>,
    pub auth_manager: Arc<AuthManager>,
    pub rate_limiter: Arc<AppRateLimiter>,
    pub conversations: ConversationStore,
    pub media: Arc<MediaStore>,
    pub settings: Arc<Settings>,
}

impl AppState {
    pub fn new(settings: Settings, orchestrator: Orchestrator, conversations: ConversationStore) -> Result<Self> {
        Ok(Self {
            orchestrator: Arc::new(orchestrator),
            auth_manager: Arc::new(AuthManager::from_config(&settings.security)?),
            rate_limiter: create_rate_limiter(&settings.security),
            conversations,
            media: Arc::new(MediaStore::new(&settings.storage, &settings.server)),
            settings: Arc::new(settings),
        })
    }
}

/// Handler failures mapped to status codes.
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("storage failure: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("advisor failure: {0}")]
    Coordinator(#[from] OrchestrationError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Coordinator(_) => StatusCode::BAD_GATEWAY,
        };
        if status.is_server_error() {
            error!("{}", self);
        }
        (status, Json(json!({ "detail": self.to_string() }))).into_response()
    }
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    version: &'static str,
    coordinator: String,
    strategy: Strategy,
    engine: String,
    uptime_seconds: u64,
    capabilities: Vec<CapabilityHealth>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SimpleResponse {
    pub response: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub query: Option<String>,
    pub response: String,
    pub timestamp: String,
    pub model_used: String,
    pub image_url: Option<String>,
    pub image_filename: Option<String>,
}

impl From<ConversationRecord> for HistoryEntry {
    fn from(record: ConversationRecord) -> Self {
        Self {
            query: record.query,
            response: record.response,
            timestamp: record.timestamp.to_rfc3339(),
            model_used: record.model_used,
            image_url: record.image_url,
            image_filename: record.image_filename,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HistoryResponse {
    pub history: Vec<HistoryEntry>,
}

#[derive(Deserialize)]
struct HistoryParams {
    #[serde(default = "default_history_limit")]
    limit: usize,
}

fn default_history_limit() -> usize {
    50
}

/// Create the HTTP router with all endpoints and security middleware
pub fn create_router(state: AppState) -> Router {
    let security = &state.settings.security;
    let cors_layer = create_cors_layer(security);
    let max_body = security.max_request_size_mb;
    let request_timeout = Duration::from_secs(state.settings.server.request_timeout_seconds);

    let public_routes = Router::new()
        .route("/api/ping", get(ping))
        .route("/health", get(health_check))
        .nest_service("/media", ServeDir::new(state.media.root()));

    let protected_routes = Router::new()
        .route("/api/simple", post(simple))
        .route("/api/chat-history", get(chat_history))
        .layer(middleware::from_fn_with_state(
            state.auth_manager.clone(),
            auth_middleware,
        ));

    let mut app = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .with_state(state.clone());

    if security.enable_rate_limiting {
        app = app.layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit_middleware,
        ));
    }

    app.layer(TimeoutLayer::new(request_timeout))
        .layer(middleware::from_fn(security_headers_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer)
        .layer(DefaultBodyLimit::disable())
        .layer(create_body_limit_layer(max_body))
}

async fn ping() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok", "message": "API is up and running!" }))
}

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let health = state.orchestrator.health();
    Json(HealthResponse {
        status: "healthy",
        version: env!("CARGO_PKG_VERSION"),
        coordinator: health.coordinator,
        strategy: health.strategy,
        engine: health.engine,
        uptime_seconds: health.uptime_seconds,
        capabilities: health.capabilities,
    })
}

struct Upload {
    mime_type: String,
    filename: Option<String>,
    data: Vec<u8>,
}

/// Content type of the part, else a guess from the file name, else JPEG.
fn resolve_mime(content_type: Option<&str>, filename: Option<&str>) -> String {
    content_type
        .filter(|ct| !ct.is_empty() && *ct != "application/octet-stream")
        .map(str::to_string)
        .or_else(|| {
            filename
                .and_then(|f| mime_guess::from_path(f).first())
                .map(|m| m.essence_str().to_string())
        })
        .unwrap_or_else(|| DEFAULT_MIME.to_string())
}

async fn read_form(mut multipart: Multipart) -> Result<(Option<String>, Option<Upload>), ApiError> {
    let bad = |e: axum::extract::multipart::MultipartError| ApiError::BadRequest(e.to_string());
    let mut text = None;
    let mut upload = None;

    while let Some(field) = multipart.next_field().await.map_err(bad)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "query" => {
                let value = field.text().await.map_err(bad)?;
                if !value.trim().is_empty() {
                    text = Some(value);
                }
            }
            "image" => {
                let filename = field.file_name().map(str::to_string);
                let mime_type = resolve_mime(field.content_type(), filename.as_deref());
                let data = field.bytes().await.map_err(bad)?;
                if data.is_empty() {
                    return Err(ApiError::BadRequest("Uploaded image is empty".to_string()));
                }
                upload = Some(Upload {
                    mime_type,
                    filename,
                    data: data.to_vec(),
                });
            }
            other => warn!("Ignoring unexpected form field '{}'", other),
        }
    }
    Ok((text, upload))
}

#[instrument(skip(state, claims, multipart), fields(user = %claims.sub))]
async fn simple(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    multipart: Multipart,
) -> Result<Json<SimpleResponse>, ApiError> {
    let (text, upload) = read_form(multipart).await?;
    if text.is_none() && upload.is_none() {
        return Err(ApiError::BadRequest(
            "Either a query or an image must be provided".to_string(),
        ));
    }

    let filename = upload.as_ref().and_then(|u| u.filename.clone());
    let media = upload.map(|u| Media::new(u.mime_type, u.data));
    let query = Query {
        text: text.clone(),
        media: media.clone(),
    };
    let response = state.orchestrator.handle(query).await?;

    // Only answered uploads are kept.
    let mut stored = None;
    if let Some(media) = media {
        let saved = state
            .media
            .save(&claims.sub, &media.mime_type, &media.data, filename.as_deref())
            .await
            .map_err(ApiError::Storage)?;
        stored = Some(saved);
    }

    let record = ConversationRecord {
        user_id: claims.sub.clone(),
        query: text,
        response: response.clone(),
        timestamp: Utc::now(),
        model_used: state.settings.llm.model.clone(),
        strategy: state.orchestrator.strategy().to_string(),
        image_url: stored.as_ref().map(|s| s.url.clone()),
        image_filename: stored.map(|s| s.filename),
    };
    state
        .conversations
        .append(&record)
        .await
        .map_err(ApiError::Storage)?;

    Ok(Json(SimpleResponse { response }))
}

#[instrument(skip(state, claims, params), fields(user = %claims.sub))]
async fn chat_history(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    QueryParams(params): QueryParams<HistoryParams>,
) -> Result<Json<HistoryResponse>, ApiError> {
    let history = state
        .conversations
        .history(&claims.sub, params.limit)
        .map_err(ApiError::Storage)?;
    Ok(Json(HistoryResponse {
        history: history.into_iter().map(HistoryEntry::from).collect(),
    }))
}

/// Start the HTTP server and wait for shutdown signal
pub async fn serve(settings: Settings, addr: Option<SocketAddr>) -> Result<()> {
    let addr: SocketAddr = match addr {
        Some(addr) => addr,
        None => settings
            .bind_addr()
            .parse()
            .with_context(|| format!("Invalid server address: {}", settings.bind_addr()))?,
    };

    let orchestrator = Orchestrator::new(&settings).context("Orchestrator initialization failed")?;
    let conversations = ConversationStore::open(&settings.storage.db_path)?;
    let state = AppState::new(settings, orchestrator, conversations)?;
    let app = create_router(state);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(wait_for_shutdown())
        .await
        .context("HTTP server error")?;

    info!("HTTP server shutdown complete");
    Ok(())
}

/// Wait for SIGTERM or Ctrl+C
async fn wait_for_shutdown() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
            (Ok(mut sigterm), Ok(mut sigint)) => {
                tokio::select! {
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down gracefully"),
                    _ = sigint.recv() => info!("Received SIGINT (Ctrl+C), shutting down gracefully"),
                }
            }
            _ => {
                warn!("Failed to install signal handlers; waiting for Ctrl+C");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received Ctrl+C, shutting down gracefully");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mime_falls_back_to_filename_then_jpeg() {
        assert_eq!(resolve_mime(Some("image/png"), Some("leaf.jpg")), "image/png");
        assert_eq!(resolve_mime(Some("application/octet-stream"), Some("leaf.png")), "image/png");
        assert_eq!(resolve_mime(None, Some("leaf.webp")), "image/webp");
        assert_eq!(resolve_mime(None, None), "image/jpeg");
    }

    #[test]
    fn errors_map_to_status_codes() {
        assert_eq!(
            ApiError::BadRequest("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::Storage(anyhow::anyhow!("disk full")).into_response().status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::from(OrchestrationError::ToolLoopExhausted { rounds: 8 })
                .into_response()
                .status(),
            StatusCode::BAD_GATEWAY
        );
    }
}
