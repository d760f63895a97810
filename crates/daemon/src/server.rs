//! HTTP boundary
//!
//! Upload, download, health and stats endpoints. Handlers only talk to the
//! [`Governor`]'s public contract.

use axum::body::Body;
use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Multipart, Path as UrlPath, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use tokio_util::io::ReaderStream;
use tracing::{debug, error};

use crate::config::Config;
use crate::governor::{ErrorKind, Governor, HealthStatus, JobError, JobOutcome, Stats};

const MIB: u64 = 1024 * 1024;

/// Errors that can occur when running the HTTP server
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Failed to bind to address: {0}")]
    BindError(#[from] std::io::Error),
}

/// Boundary settings taken from [`Config`].
#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub public_base_url: Option<String>,
    /// Outputs at or below this size are returned in the response body.
    pub inline_threshold_bytes: u64,
    pub max_upload_bytes: u64,
}

impl ServerSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            public_base_url: cfg.server.public_base_url.clone(),
            inline_threshold_bytes: cfg.storage.inline_threshold_bytes,
            max_upload_bytes: cfg.storage.max_upload_bytes,
        }
    }

    fn download_url(&self, name: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/file-download/{}", base.trim_end_matches('/'), name),
            None => format!("/file-download/{}", name),
        }
    }
}

#[derive(Clone)]
pub struct AppState {
    pub governor: Arc<Governor>,
    pub settings: Arc<ServerSettings>,
}

impl AppState {
    pub fn new(governor: Arc<Governor>, settings: ServerSettings) -> Self {
        Self {
            governor,
            settings: Arc::new(settings),
        }
    }
}

/// Error body: `{"error": "...", "kind": "..."}`
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    pub kind: String,
}

#[derive(Debug)]
pub enum ApiError {
    Job(JobError),
    BadRequest(String),
    Upload(MultipartError),
    Forbidden(String),
    NotFound(String),
    Internal(String),
}

impl From<JobError> for ApiError {
    fn from(e: JobError) -> Self {
        ApiError::Job(e)
    }
}

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::Validation => StatusCode::BAD_REQUEST,
        ErrorKind::Overload => StatusCode::SERVICE_UNAVAILABLE,
        ErrorKind::Timeout => StatusCode::REQUEST_TIMEOUT,
        ErrorKind::ExecutionFailure => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error, kind) = match self {
            ApiError::Job(e) => (status_for(e.kind()), e.diagnostic(), e.kind().as_str()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg, "validation"),
            ApiError::Upload(e) => (e.status(), e.body_text(), "validation"),
            ApiError::Forbidden(msg) => (StatusCode::FORBIDDEN, msg, "forbidden"),
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg, "not_found"),
            ApiError::Internal(msg) => {
                error!(error = %msg, "internal error");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal error".to_string(),
                    "execution_failure",
                )
            }
        };
        (
            status,
            Json(ErrorBody {
                error,
                kind: kind.to_string(),
            }),
        )
            .into_response()
    }
}

/// JSON answer for outputs too large to return inline.
#[derive(Debug, Serialize, Deserialize)]
pub struct ProcessResponse {
    pub success: bool,
    #[serde(rename = "file_size_MB")]
    pub file_size_mb: f64,
    pub processing_time_seconds: f64,
    pub pitch_preserved: bool,
    pub url: String,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: u64,
    #[serde(flatten)]
    pub stats: Stats,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn stream_file(path: &Path, download_name: &str, extra: Option<(&'static str, String)>) -> Result<Response, ApiError> {
    let file = match tokio::fs::File::open(path).await {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(ApiError::NotFound("file not found or expired".into()))
        }
        Err(e) => return Err(ApiError::Internal(e.to_string())),
    };
    let len = file
        .metadata()
        .await
        .map_err(|e| ApiError::Internal(e.to_string()))?
        .len();

    let mut response = (
        StatusCode::OK,
        [
            (header::CONTENT_TYPE, "video/mp4".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename=\"{}\"", download_name),
            ),
            (header::CONTENT_LENGTH, len.to_string()),
        ],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response();

    if let Some((name, value)) = extra {
        if let Ok(value) = value.parse() {
            response.headers_mut().insert(name, value);
        }
    }
    Ok(response)
}

fn respond_with_outcome_json(settings: &ServerSettings, outcome: &JobOutcome) -> Response {
    let name = outcome
        .output_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let size_mb = (outcome.size_bytes as f64 / MIB as f64 * 100.0).round() / 100.0;

    Json(ProcessResponse {
        success: true,
        file_size_mb: size_mb,
        processing_time_seconds: outcome.processing_time_secs,
        pitch_preserved: outcome.pitch_preserved,
        url: settings.download_url(&name),
        message: format!(
            "File too large for direct download ({} MB). Use the provided URL.",
            size_mb
        ),
    })
    .into_response()
}

/// Handler for POST /process and POST /repost-proof
async fn process_upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut upload: Option<(String, axum::body::Bytes)> = None;

    while let Some(field) = multipart.next_field().await.map_err(ApiError::Upload)? {
        if field.name() == Some("file") {
            let filename = field.file_name().unwrap_or("").to_string();
            let data = field.bytes().await.map_err(ApiError::Upload)?;
            upload = Some((filename, data));
        }
    }

    let (filename, data) =
        upload.ok_or_else(|| ApiError::BadRequest("missing required 'file' field".into()))?;
    if filename.is_empty() {
        return Err(ApiError::BadRequest("no file selected".into()));
    }
    let ext = Path::new(&filename)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("");

    debug!(filename = %filename, bytes = data.len(), "upload received");
    let outcome = state.governor.submit(&data, ext).await?;

    if outcome.size_bytes <= state.settings.inline_threshold_bytes {
        let download_name = format!("processed_{}.mp4", unix_now());
        stream_file(
            &outcome.output_path,
            &download_name,
            Some(("x-pitch-preserved", outcome.pitch_preserved.to_string())),
        )
        .await
    } else {
        Ok(respond_with_outcome_json(&state.settings, &outcome))
    }
}

/// Handler for GET /file-download/:name
async fn download_file(
    State(state): State<AppState>,
    UrlPath(name): UrlPath<String>,
) -> Result<Response, ApiError> {
    let path = state
        .governor
        .resolve_output(&name)
        .ok_or_else(|| ApiError::Forbidden("invalid file name".into()))?;
    stream_file(&path, &name, None).await
}

/// Handler for GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let stats = state.governor.stats().await;
    Json(HealthResponse {
        status: state.governor.health(&stats),
        timestamp: unix_now(),
        stats,
    })
}

/// Handler for GET /stats
async fn stats(State(state): State<AppState>) -> Json<Stats> {
    Json(state.governor.stats().await)
}

/// Creates the axum Router with every endpoint
pub fn create_router(state: AppState) -> Router {
    let body_limit = (state.settings.max_upload_bytes + MIB) as usize;
    Router::new()
        .route("/process", post(process_upload))
        .route("/repost-proof", post(process_upload))
        .route("/file-download/:name", get(download_file))
        .route("/health", get(health))
        .route("/stats", get(stats))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// Serve `router` on `listener` until `shutdown` resolves, then drain.
pub async fn serve<F>(
    listener: tokio::net::TcpListener,
    router: Router,
    shutdown: F,
) -> Result<(), ServerError>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
