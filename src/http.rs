//! HTTP surface: two-phase submit + server-sent progress stream.
//!
//! | Method | Path                                   | Body / reply                              |
//! |--------|----------------------------------------|-------------------------------------------|
//! | POST   | `/api/narrations`                      | job JSON → `{ "requestId": … }`           |
//! | GET    | `/api/narrations/stream?requestId=…`   | `text/event-stream` of progress events    |
//! | GET    | `/health`                              | `{ "status": "ok" }`                      |
//!
//! Every SSE `data:` payload is exactly one of `{ "status" }`, `{ "error" }`
//! or `{ "title", "audioBase64" }`.  The stream ends right after an `error`
//! or result payload.

use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::StatusCode,
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio_stream::{wrappers::ReceiverStream, Stream, StreamExt};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::{
    config::Settings,
    job::{JobRegistry, NewJob},
    pipeline::Narrator,
    progress::{self, ProgressEvent},
};

pub const MISSING_FIELDS: &str = "Title and text are required.";
pub const UNKNOWN_REQUEST: &str = "No data found for the given requestId.";

// ─────────────────────────────────────────────────────────────────────────────
// State
// ─────────────────────────────────────────────────────────────────────────────

/// Shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<JobRegistry>,
    pub narrator: Arc<Narrator>,
    pub default_voice: Arc<str>,
    pub default_model: Arc<str>,
    pub channel_capacity: usize,
}

impl AppState {
    pub fn new(registry: Arc<JobRegistry>, narrator: Arc<Narrator>, settings: &Settings) -> Self {
        Self {
            registry,
            narrator,
            default_voice: settings.default_voice.as_str().into(),
            default_model: settings.default_model.as_str().into(),
            channel_capacity: settings.channel_capacity,
        }
    }

    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let narrator = Arc::new(settings.build_narrator()?);
        Ok(Self::new(Arc::new(JobRegistry::new()), narrator, settings))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SubmitRequest {
    pub title: Option<String>,
    pub text: Option<String>,
    pub voice_id: Option<String>,
    pub model_id: Option<String>,
    pub style_instructions: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitResponse {
    pub request_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    #[serde(rename = "requestId")]
    pub request_id: Option<String>,
}

/// JSON payload of one SSE event.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum WireEvent {
    Status {
        status: String,
    },
    Error {
        error: String,
    },
    Result {
        title: String,
        #[serde(rename = "audioBase64")]
        audio_base64: String,
    },
}

impl From<ProgressEvent> for WireEvent {
    fn from(event: ProgressEvent) -> Self {
        match event {
            ProgressEvent::Status(status) => Self::Status { status },
            ProgressEvent::Error(error) => Self::Error { error },
            ProgressEvent::Result { title, audio } => Self::Result {
                title,
                audio_base64: base64::engine::general_purpose::STANDARD.encode(audio),
            },
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Errors
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum ApiError {
    Validation(&'static str),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let Self::Validation(msg) = self;
        (StatusCode::BAD_REQUEST, Json(ErrorBody { error: msg.to_string() })).into_response()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

/// Treats blank strings like missing fields.
fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

async fn submit(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<Json<SubmitResponse>, ApiError> {
    // Any body that does not parse, whatever its content type, counts as `{}`.
    let req: SubmitRequest = serde_json::from_slice(&body).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "unparseable submission body");
        SubmitRequest::default()
    });

    let (Some(title), Some(text)) = (non_blank(req.title), non_blank(req.text)) else {
        return Err(ApiError::Validation(MISSING_FIELDS));
    };

    let job = NewJob {
        title,
        text,
        voice_id: non_blank(req.voice_id).unwrap_or_else(|| state.default_voice.to_string()),
        model_id: non_blank(req.model_id).unwrap_or_else(|| state.default_model.to_string()),
        style_instructions: non_blank(req.style_instructions),
    };
    let chars = job.text.chars().count();
    let request_id = state.registry.put(job);
    tracing::info!(request_id = %request_id, chars, "narration submitted");

    Ok(Json(SubmitResponse { request_id }))
}

async fn stream_progress(
    State(state): State<AppState>,
    Query(params): Query<StreamParams>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let (reporter, rx) = progress::channel(state.channel_capacity);

    let request_id = params.request_id.unwrap_or_default();
    match state.registry.take(&request_id) {
        Ok(job) => {
            tracing::info!(request_id = %job.id, "progress stream opened");
            let _ = state.narrator.spawn(job, reporter);
        }
        Err(not_found) => {
            tracing::info!(error = %not_found, "progress stream for unknown job");
            // Fresh channel with room for one event: delivery cannot block.
            let _ = reporter.fail(UNKNOWN_REQUEST).await;
        }
    }

    let events = ReceiverStream::new(rx).map(|event| Event::default().json_data(WireEvent::from(event)));
    Sse::new(events).keep_alive(KeepAlive::default())
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

/// Build the application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/narrations", post(submit))
        .route("/api/narrations/stream", get(stream_progress))
        .route("/health", get(health))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Infallible shutdown hook for `axum::serve(..).with_graceful_shutdown`.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received Ctrl+C, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
