//! HTTP surface: axum routes over [`CaptureService`].
//!
//! - `GET  /`                          : HTML page showing every display's stream
//! - `GET  /screens`                   : enumerated displays
//! - `GET  /screens/{index}/snapshot`  : one still, `?format=jpeg|png&quality=N`
//! - `GET  /status`                    : host, sessions, clients, stream counters
//! - `GET  /stream/{index}`            : MJPEG stream of one display
//! - `GET  /recording`       : recording state
//! - `POST /recording/start` : JSON `RecordingConfig`, every field optional
//! - `POST /recording/stop`
//!
//! Each `/stream` request becomes one `StreamingClientSink` writing into an
//! in-memory pipe whose read half is the response body. When the browser goes
//! away the body is dropped, the next write fails, and the distributor evicts
//! the client.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{Context, Result};
use anyscreen_core::{CaptureError, EncoderError, RecordingConfig, RecordingError, RegistryError, SessionError, StreamConfig};
use anyscreen_pipeline::{mjpeg, CaptureService, StillFormat};
use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, StatusCode};
use axum::response::{Html, IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_util::io::ReaderStream;
use tracing::{info, warn, Span};

/// Bytes buffered between a client sink and its HTTP body.
const CLIENT_PIPE_BYTES: usize = 256 * 1024;

/// camelCase names accepted in recording requests, and the fields they set.
const RECORDING_ALIASES: &[(&str, &str)] = &[
    ("frameRate", "frame_rate"),
    ("bitRate", "bit_rate"),
    ("outputFile", "output_path"),
    ("screenIndex", "display_index"),
];

// ── State ─────────────────────────────────────────────────────────────────────

pub struct AppState {
    service:   Arc<CaptureService>,
    /// Settings for streams started on demand by `/stream/{index}`.
    stream:    StreamConfig,
    /// Base for `/recording/start` requests.
    recording: RecordingConfig,
    hostname:  String,
    started:   Instant,
    span:      Span,
}

impl AppState {
    pub fn new(
        service: Arc<CaptureService>,
        stream: StreamConfig,
        recording: RecordingConfig,
        span: Span,
    ) -> Self {
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_owned());
        Self { service, stream, recording, hostname, started: Instant::now(), span }
    }

    /// Log server-side failures before they become a response.
    fn reject(&self, err: impl Into<ApiError>) -> ApiError {
        let err = err.into();
        if err.status.is_server_error() {
            warn!(parent: &self.span, "{}: {}", err.status, err.message);
        }
        err
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index_page))
        .route("/screens", get(screens))
        .route("/screens/{index}/snapshot", get(snapshot))
        .route("/status", get(status))
        .route("/stream/{index}", get(stream))
        .route("/recording", get(recording))
        .route("/recording/start", post(start_recording))
        .route("/recording/stop", post(stop_recording))
        .with_state(state)
}

/// Serve until `shutdown` resolves. Open MJPEG bodies end when the service
/// stops streaming, so `shutdown` should stop it before returning.
pub async fn serve<F>(listener: TcpListener, state: Arc<AppState>, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr().context("listener address")?;
    info!(parent: &state.span, "HTTP server listening on http://{addr}");
    axum::serve(listener, router(state).into_make_service_with_connect_info::<SocketAddr>())
        .with_graceful_shutdown(shutdown)
        .await
        .context("HTTP server error")
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct ApiError {
    status:  StatusCode,
    message: String,
}

impl ApiError {
    fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self { status, message: message.into() }
    }

    fn bad_request(err: impl std::fmt::Display) -> Self {
        Self::new(StatusCode::BAD_REQUEST, err.to_string())
    }
}

impl From<SessionError> for ApiError {
    fn from(err: SessionError) -> Self {
        let status = match &err {
            SessionError::AlreadyInProgress { .. }
            | SessionError::NotStreaming
            | SessionError::Registry(RegistryError::DuplicateClient(_)) => StatusCode::CONFLICT,
            SessionError::InvalidConfig(_) | SessionError::Recording(RecordingError::InvalidConfig(_)) => {
                StatusCode::BAD_REQUEST
            }
            SessionError::Capture(CaptureError::Unavailable { .. }) => StatusCode::NOT_FOUND,
            SessionError::Registry(RegistryError::Full { .. }) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self::new(status, err.to_string())
    }
}

impl From<CaptureError> for ApiError {
    fn from(err: CaptureError) -> Self {
        SessionError::Capture(err).into()
    }
}

impl From<EncoderError> for ApiError {
    fn from(err: EncoderError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

// ── Handlers ──────────────────────────────────────────────────────────────────

/// GET /
async fn index_page(State(state): State<Arc<AppState>>) -> Html<String> {
    let mut screens = String::new();
    for d in state.service.list_displays() {
        screens.push_str(&format!(
            "<figure><img src=\"/stream/{i}\" alt=\"display {i}\"><figcaption>Display {i}: {b}{p} \
             <a href=\"/screens/{i}/snapshot?format=png\">snapshot</a></figcaption></figure>\n",
            i = d.index,
            b = d.bounds,
            p = if d.primary { " (primary)" } else { "" },
        ));
    }
    if screens.is_empty() {
        screens.push_str("<p>No displays found.</p>\n");
    }
    Html(format!(
        "<!DOCTYPE html>\n<html><head><meta charset=\"utf-8\"><title>AnyScreen on {host}</title>\
         <style>body{{font-family:sans-serif;background:#111;color:#eee}}img{{max-width:100%}}</style>\
         </head><body><h1>AnyScreen on {host}</h1>\n{screens}</body></html>\n",
        host = state.hostname,
    ))
}

/// GET /screens
async fn screens(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.service.list_displays())
}

#[derive(Debug, Default, Deserialize)]
struct SnapshotQuery {
    format:  Option<String>,
    quality: Option<u8>,
}

/// GET /screens/{index}/snapshot
async fn snapshot(
    State(state): State<Arc<AppState>>,
    Path(index): Path<u32>,
    Query(query): Query<SnapshotQuery>,
) -> Result<Response, ApiError> {
    let format = match query.format.as_deref() {
        Some(name) => name.parse::<StillFormat>().map_err(ApiError::bad_request)?,
        None => StillFormat::default(),
    };
    let quality = query.quality.unwrap_or(state.stream.quality);
    if quality > 100 {
        return Err(ApiError::bad_request(format!("quality {quality} is out of range 0-100")));
    }

    let frame = state.service.snapshot(index).await.map_err(|e| state.reject(e))?;
    let image = tokio::task::spawn_blocking(move || format.encode(&frame, quality))
        .await
        .map_err(|e| state.reject(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())))?
        .map_err(|e| state.reject(e))?;

    Response::builder()
        .header(header::CONTENT_TYPE, format.content_type())
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::from(image))
        .map_err(|e| state.reject(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())))
}

/// GET /status
async fn status(State(state): State<Arc<AppState>>) -> Json<Value> {
    let svc = &state.service;
    Json(json!({
        "server": state.hostname,
        "port": state.stream.port,
        "uptime_secs": state.started.elapsed().as_secs(),
        "streaming": svc.is_streaming(),
        "stream": svc.stream_config(),
        "recording": svc.is_recording(),
        "clients": svc.clients(),
        "stats": svc.stats(),
    }))
}

/// GET /stream/{index}
async fn stream(
    State(state): State<Arc<AppState>>,
    Path(index): Path<u32>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Result<Response, ApiError> {
    if !state.service.list_displays().iter().any(|d| d.index == index) {
        return Err(ApiError::new(StatusCode::NOT_FOUND, format!("no display {index}")));
    }
    ensure_streaming(&state, index).map_err(|e| state.reject(e))?;

    let (writer, reader) = tokio::io::duplex(CLIENT_PIPE_BYTES);
    state
        .service
        .connect_client(peer.to_string(), Box::new(writer))
        .await
        .map_err(|e| state.reject(e))?;
    info!(parent: &state.span, "client {peer} watching display {index}");

    Response::builder()
        .header(header::CONTENT_TYPE, mjpeg::CONTENT_TYPE)
        .header(header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(header::PRAGMA, "no-cache")
        .header(header::ACCESS_CONTROL_ALLOW_ORIGIN, "*")
        .body(Body::from_stream(ReaderStream::new(reader)))
        .map_err(|e| state.reject(ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())))
}

/// Make sure display `index` is being streamed, starting it if nothing is.
fn ensure_streaming(state: &AppState, index: u32) -> Result<(), ApiError> {
    match state.service.stream_config() {
        Some(running) if running.display_index == index => return Ok(()),
        Some(running) => {
            return Err(ApiError::new(
                StatusCode::CONFLICT,
                format!("display {} is already being streamed", running.display_index),
            ))
        }
        None => {}
    }

    let config = StreamConfig { display_index: index, ..state.stream.clone() };
    match state.service.start_streaming(config) {
        // Another request started the same display first.
        Err(SessionError::AlreadyInProgress { display_index, .. }) if display_index == index => Ok(()),
        other => Ok(other?),
    }
}

/// GET /recording
async fn recording(State(state): State<Arc<AppState>>) -> Json<Value> {
    let svc = &state.service;
    Json(json!({
        "state": svc.recording_state(),
        "recording": svc.is_recording(),
        "config": svc.recording_config(),
    }))
}

/// POST /recording/start
async fn start_recording(State(state): State<Arc<AppState>>, body: Bytes) -> Result<Json<Value>, ApiError> {
    let config = recording_request(&state.recording, &body)?;
    state
        .service
        .start_recording(config.clone())
        .await
        .map_err(|e| state.reject(e))?;
    info!(parent: &state.span, "recording display {} to {}", config.display_index, config.output_path.display());
    Ok(Json(json!({ "recording": true, "config": config })))
}

/// POST /recording/stop
async fn stop_recording(State(state): State<Arc<AppState>>) -> Result<Json<Value>, ApiError> {
    match state.service.stop_recording().await.map_err(|e| state.reject(e))? {
        Some(summary) => Ok(Json(json!({ "stopped": true, "summary": summary }))),
        None => Ok(Json(json!({ "stopped": false }))),
    }
}

/// Overlay the fields present in `body` onto `base`.
fn recording_request(base: &RecordingConfig, body: &[u8]) -> Result<RecordingConfig, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(base.clone());
    }
    let Value::Object(fields) = serde_json::from_slice(body).map_err(ApiError::bad_request)? else {
        return Err(ApiError::bad_request("expected a JSON object"));
    };

    let mut merged = serde_json::to_value(base)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    for (key, value) in fields {
        let field = RECORDING_ALIASES
            .iter()
            .find(|(alias, _)| *alias == key)
            .map_or(key.as_str(), |(_, field)| *field);
        merged[field] = value;
    }
    serde_json::from_value(merged).map_err(ApiError::bad_request)
}
