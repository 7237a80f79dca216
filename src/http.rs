// HTTP surface over DownloadService

use std::sync::Arc;

use axum::{
    Form, Json, Router,
    body::{Body, Bytes},
    extract::State,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures_util::{StreamExt, stream};
use serde::Deserialize;
use tokio::io::BufReader;
use tokio_util::io::ReaderStream;
use tracing::{error, warn};

use crate::downloader::errors::DownloadError;
use crate::downloader::job::{JobMode, JobOptions};
use crate::service::{DownloadService, JobResult, ServedArtifact};

/// Mode used by the plain form when it does not send one
pub const DEFAULT_FORM_MODE: &str = "download";

pub fn router(service: Arc<DownloadService>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/download", post(download_form))
        .route("/api/jobs", post(submit_json))
        .with_state(service)
}

async fn index() -> impl IntoResponse {
    let modes: Vec<&str> = JobMode::ALL.iter().map(|m| m.as_str()).collect();
    Json(serde_json::json!({ "modes": modes }))
}

/// Form submission: `URL`/`url`, `mode`, repeated `options` checkboxes, free fields
async fn download_form(
    State(service): State<Arc<DownloadService>>,
    Form(pairs): Form<Vec<(String, String)>>,
) -> Response {
    let mut url = String::new();
    let mut mode = DEFAULT_FORM_MODE.to_string();
    let mut rest = Vec::with_capacity(pairs.len());
    for (key, value) in pairs {
        match key.as_str() {
            "URL" | "url" => url = value,
            "mode" if !value.trim().is_empty() => mode = value,
            _ => rest.push((key, value)),
        }
    }

    let options = JobOptions::from_pairs(rest);
    respond(service.submit_job(&url, &mode, &options).await).await
}

#[derive(Debug, Deserialize)]
pub struct JobRequest {
    pub url: String,
    #[serde(default = "default_mode")]
    pub mode: String,
    #[serde(default)]
    pub options: JobOptions,
}

fn default_mode() -> String {
    DEFAULT_FORM_MODE.to_string()
}

async fn submit_json(State(service): State<Arc<DownloadService>>, Json(request): Json<JobRequest>) -> Response {
    respond(service.submit_job(&request.url, &request.mode, &request.options).await).await
}

async fn respond(result: Result<JobResult, DownloadError>) -> Response {
    match result {
        Ok(JobResult::Metadata(info)) => Json(info).into_response(),
        Ok(JobResult::Filtered { reason }) => {
            Json(serde_json::json!({ "status": "filtered", "reason": reason })).into_response()
        }
        Ok(JobResult::Artifact(artifact)) => serve_artifact(artifact).await,
        Err(e) if e.is_client_error() => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": e.to_string() })),
        )
            .into_response(),
        Err(e) => {
            error!("job failed: {}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

/// Stream the artifact; it is released to retention once the last chunk is sent.
///
/// If the client goes away first, the artifact is dropped unfinished: the gate
/// is released and nothing is deleted.
pub async fn serve_artifact(artifact: ServedArtifact) -> Response {
    let file = match tokio::fs::File::open(artifact.path()).await {
        Ok(file) => file,
        Err(e) => {
            error!(path = %artifact.path().display(), "failed to open artifact: {}", e);
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": format!("failed to open artifact: {}", e) })),
            )
                .into_response();
        }
    };

    let headers = [
        (header::CONTENT_TYPE, artifact.content_type().to_string()),
        (header::CONTENT_DISPOSITION, content_disposition(artifact.file_name())),
    ];

    let hand_off = stream::once(async move {
        for warning in artifact.finish() {
            warn!("{}", warning);
        }
    })
    .filter_map(|()| async { None::<std::io::Result<Bytes>> });
    let body = Body::from_stream(ReaderStream::new(BufReader::new(file)).chain(hand_off));

    (headers, body).into_response()
}

/// `attachment` header with an ASCII fallback and the RFC 5987 UTF-8 name
pub fn content_disposition(file_name: &str) -> String {
    let fallback: String = file_name
        .chars()
        .map(|c| match c {
            '"' | '\\' => '_',
            c if c.is_ascii() && !c.is_ascii_control() => c,
            _ => '_',
        })
        .collect();

    let mut encoded = String::with_capacity(file_name.len() * 3);
    for byte in file_name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => encoded.push(byte as char),
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }

    format!("attachment; filename=\"{}\"; filename*=UTF-8''{}", fallback, encoded)
}
