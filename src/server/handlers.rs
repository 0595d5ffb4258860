//! Request handlers and wire DTOs.

use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::error;
use uuid::Uuid;

use crate::error::{Error, ExecError, FileError, PoolError, SandboxError};
use crate::exec::{ExecutionRequest, InputFile, InputFileSource};
use crate::files::FileRef;
use crate::languages::Language;
use crate::sandbox::PoolStatus;
use crate::server::AppState;

/// Body of `POST /exec`.
#[derive(Debug, Deserialize)]
pub struct ExecRequestDto {
    pub lang: String,
    pub code: String,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub files: Vec<FileRefDto>,
    /// Defaults to true for the interactive language.
    #[serde(default)]
    pub capture_state: Option<bool>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub memory_limit_mb: Option<u64>,
}

/// Input file reference: either inline content or a stored
/// `{sessionId}/{fileId}` pair from a previous upload.
#[derive(Debug, Deserialize)]
pub struct FileRefDto {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub content_b64: Option<String>,
}

/// Body of `POST /exec` responses.
#[derive(Debug, Serialize)]
pub struct ExecResponseDto {
    pub session_id: String,
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub files: Vec<FileRef>,
    pub warnings: Vec<String>,
}

/// Body of `POST /upload`.
#[derive(Debug, Deserialize)]
pub struct UploadRequestDto {
    #[serde(default)]
    pub session_id: Option<String>,
    pub filename: String,
    pub content_b64: String,
}

#[derive(Debug, Serialize)]
pub struct UploadResponseDto {
    pub session_id: String,
    pub file_id: String,
    pub filename: String,
}

/// Body of `GET /health/detailed`.
#[derive(Debug, Serialize)]
pub struct DetailedHealth {
    pub status: &'static str,
    pub hot_store: bool,
    pub cold_store: bool,
    pub interactive_ready: bool,
    pub pool: PoolStatus,
    pub uptime_secs: u64,
}

/// Error wrapper mapping the service taxonomy to status codes.
pub struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, kind) = match &self.0 {
            Error::Exec(ExecError::BadRequest { .. }) => (StatusCode::BAD_REQUEST, "bad_request"),
            Error::Exec(ExecError::TimeoutExceeded { .. }) => {
                (StatusCode::REQUEST_TIMEOUT, "timeout_exceeded")
            }
            Error::Pool(PoolError::Exhausted { .. }) => {
                (StatusCode::TOO_MANY_REQUESTS, "service_busy")
            }
            Error::Pool(PoolError::ShuttingDown) => {
                (StatusCode::SERVICE_UNAVAILABLE, "service_unavailable")
            }
            Error::Exec(ExecError::SandboxUnhealthy { .. })
            | Error::Sandbox(SandboxError::Unhealthy { .. }) => {
                (StatusCode::INTERNAL_SERVER_ERROR, "sandbox_unhealthy")
            }
            Error::File(FileError::NotFound { .. }) => (StatusCode::NOT_FOUND, "not_found"),
            Error::File(FileError::InvalidReference { .. }) => {
                (StatusCode::BAD_REQUEST, "bad_request")
            }
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal_error"),
        };
        if status.is_server_error() {
            error!(error = %self.0, "Request failed");
        }
        let body = Json(json!({
            "error": kind,
            "message": self.0.to_string(),
        }));
        (status, body).into_response()
    }
}

fn bad_request(reason: impl Into<String>) -> ApiError {
    ApiError(Error::Exec(ExecError::BadRequest {
        reason: reason.into(),
    }))
}

/// `POST /exec`
pub async fn exec(
    State(state): State<AppState>,
    Json(dto): Json<ExecRequestDto>,
) -> Result<Json<ExecResponseDto>, ApiError> {
    let language = Language::from_tag(&dto.lang)
        .ok_or_else(|| bad_request(format!("unsupported language: {:?}", dto.lang)))?;

    let mut files = Vec::with_capacity(dto.files.len());
    for file in dto.files {
        files.push(input_file(file)?);
    }

    let request = ExecutionRequest {
        language,
        code: dto.code,
        session_id: dto.session_id,
        files,
        capture_state: dto.capture_state.unwrap_or(language.is_interactive()),
        time_limit: dto.timeout_secs.map(Duration::from_secs),
        memory_limit_mb: dto.memory_limit_mb,
    };

    let outcome = state.orchestrator.execute(request).await?;
    Ok(Json(ExecResponseDto {
        session_id: outcome.session_id,
        stdout: outcome.stdout,
        stderr: outcome.stderr,
        exit_code: outcome.exit_code,
        files: outcome.files,
        warnings: outcome.warnings,
    }))
}

fn input_file(dto: FileRefDto) -> Result<InputFile, ApiError> {
    if let Some(content) = dto.content_b64 {
        let name = dto
            .name
            .ok_or_else(|| bad_request("inline files need a name"))?;
        let bytes = BASE64
            .decode(content.as_bytes())
            .map_err(|e| bad_request(format!("file '{name}' is not valid base64: {e}")))?;
        return Ok(InputFile {
            name,
            source: InputFileSource::Inline(bytes),
        });
    }
    match (dto.session_id, dto.id) {
        (Some(session_id), Some(file_id)) => Ok(InputFile {
            name: dto.name.unwrap_or_default(),
            source: InputFileSource::Stored {
                session_id,
                file_id,
            },
        }),
        _ => Err(bad_request(
            "file references need either content_b64 or session_id + id",
        )),
    }
}

/// `POST /upload`
pub async fn upload(
    State(state): State<AppState>,
    Json(dto): Json<UploadRequestDto>,
) -> Result<Json<UploadResponseDto>, ApiError> {
    let session_id = dto
        .session_id
        .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
    let bytes = BASE64
        .decode(dto.content_b64.as_bytes())
        .map_err(|e| bad_request(format!("content is not valid base64: {e}")))?;

    let stored = state
        .files
        .store(&session_id, &dto.filename, &bytes)
        .await
        .map_err(Error::from)?;
    Ok(Json(UploadResponseDto {
        session_id: stored.session_id,
        file_id: stored.id,
        filename: stored.name,
    }))
}

/// `GET /download/{session_id}/{file_id}`
pub async fn download(
    State(state): State<AppState>,
    Path((session_id, file_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let (name, bytes) = state
        .files
        .load(&session_id, &file_id)
        .await
        .map_err(Error::from)?;

    let disposition = HeaderValue::from_str(&format!("attachment; filename=\"{name}\""))
        .unwrap_or_else(|_| HeaderValue::from_static("attachment"));
    Ok((
        [
            (header::CONTENT_TYPE, HeaderValue::from_static("application/octet-stream")),
            (header::CONTENT_DISPOSITION, disposition),
        ],
        bytes,
    )
        .into_response())
}

/// `GET /health`
pub async fn health() -> StatusCode {
    StatusCode::OK
}

/// `GET /health/detailed`
pub async fn health_detailed(State(state): State<AppState>) -> Json<DetailedHealth> {
    let (hot_store, cold_store) = state.state_store.health().await;
    let pool = state.pool.status();
    let interactive_ready = pool.ready > 0 || pool.target == 0;
    let status = if hot_store && cold_store && interactive_ready {
        "healthy"
    } else {
        "degraded"
    };
    Json(DetailedHealth {
        status,
        hot_store,
        cold_store,
        interactive_ready,
        pool,
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}
