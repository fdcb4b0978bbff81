//! Upload Routes
//!
//! HTTP endpoints for the chunked upload protocol.
//!
//! Endpoints:
//! - POST /bigfile/check?fileMd5= - Complete (1), not started (0) or in progress (2)
//! - POST /bigfile/upload - Multipart chunk upload (`md5`, `chunk`, `file`)
//! - POST /bigfile/merge?fileName=&fileMd5= - Assemble the stored chunks

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::HeaderMap,
    routing::post,
    Json, Router,
};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::{AppError, Result};
use crate::routes::JsonResult;
use crate::state::AppState;
use crate::upload::{CheckStatus, ChunkIndex, Fingerprint, MergeOutcome};

/// Allowance for multipart boundaries and the small text fields
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

/// Optional SHA-256 of the chunk payload
const CHUNK_HASH_HEADER: &str = "X-Chunk-Hash";

// ============================================================================
// Router
// ============================================================================

/// Create the upload router
pub fn router(max_chunk_bytes: usize) -> Router<AppState> {
    Router::new()
        .route("/check", post(check))
        .route(
            "/upload",
            post(upload_chunk)
                .layer(DefaultBodyLimit::max(max_chunk_bytes.saturating_add(FORM_OVERHEAD_BYTES))),
        )
        .route("/merge", post(merge))
}

// ============================================================================
// Requests
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CheckParams {
    #[serde(rename = "fileMd5")]
    pub file_md5: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct MergeParams {
    #[serde(rename = "fileName")]
    pub file_name: Option<String>,
    #[serde(rename = "fileMd5")]
    pub file_md5: Option<String>,
}

/// Fields of the multipart chunk form
#[derive(Debug, Default)]
struct ChunkForm {
    md5: Option<String>,
    chunk: Option<String>,
    chunks: Option<String>,
    name: Option<String>,
    hash: Option<String>,
    file: Option<Bytes>,
}

impl ChunkForm {
    async fn read(mut multipart: Multipart) -> Result<Self> {
        let mut form = ChunkForm::default();

        while let Some(field) = multipart.next_field().await? {
            let Some(name) = field.name().map(str::to_string) else {
                continue;
            };
            match name.as_str() {
                "file" => form.file = Some(field.bytes().await?),
                "md5" => form.md5 = Some(field.text().await?),
                "chunk" => form.chunk = Some(field.text().await?),
                "chunks" => form.chunks = Some(field.text().await?),
                "name" => form.name = Some(field.text().await?),
                "hash" => form.hash = Some(field.text().await?),
                other => tracing::trace!(field = other, "Ignoring form field"),
            }
        }

        Ok(form)
    }
}

fn required<'a>(value: &'a Option<String>, field: &str) -> Result<&'a str> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::BadRequest(format!("missing {field}")))
}

// ============================================================================
// Handlers
// ============================================================================

/// POST /bigfile/check?fileMd5=
///
/// Tells the client whether to skip, start, or resume an upload.
async fn check(
    State(state): State<AppState>,
    Query(params): Query<CheckParams>,
) -> Result<Json<JsonResult>> {
    let fingerprint = Fingerprint::parse(required(&params.file_md5, "fileMd5")?)?;
    let status = state.uploads().check(&fingerprint).await?;

    let (message, data) = match &status {
        CheckStatus::Complete => ("file already exists", Value::Null),
        CheckStatus::NotStarted => ("upload not started", json!([])),
        CheckStatus::InProgress(present) => (
            "upload in progress",
            json!(present.iter().map(|i| i.0).collect::<Vec<_>>()),
        ),
    };

    Ok(Json(JsonResult::new(status.result_code(), message, Some(data))))
}

/// POST /bigfile/upload
///
/// Stores one chunk; responds with the number of chunks present so the
/// client can report progress.
async fn upload_chunk(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> Result<Json<JsonResult<usize>>> {
    let form = ChunkForm::read(multipart).await?;

    let fingerprint = Fingerprint::parse(required(&form.md5, "md5")?)?;
    let raw_index = required(&form.chunk, "chunk")?;
    let index = raw_index
        .parse::<u32>()
        .map(ChunkIndex)
        .map_err(|_| AppError::BadRequest(format!("invalid chunk index: {raw_index}")))?;
    let payload = form
        .file
        .as_ref()
        .ok_or_else(|| AppError::BadRequest("missing file".to_string()))?;

    let checksum = form
        .hash
        .clone()
        .or_else(|| {
            headers
                .get(CHUNK_HASH_HEADER)
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty());

    let count = state
        .uploads()
        .upload_chunk(&fingerprint, index, payload, checksum.as_deref())
        .await?;

    tracing::info!(
        fingerprint = %fingerprint,
        chunk_index = %index,
        total_chunks = form.chunks.as_deref().unwrap_or("?"),
        file_name = form.name.as_deref().unwrap_or(""),
        chunks_present = count,
        "Chunk uploaded"
    );

    Ok(Json(JsonResult::success(count)))
}

/// POST /bigfile/merge?fileName=&fileMd5=
///
/// Assembles every stored chunk into the named artifact.
async fn merge(
    State(state): State<AppState>,
    Query(params): Query<MergeParams>,
) -> Result<Json<JsonResult<MergeOutcome>>> {
    let fingerprint = Fingerprint::parse(required(&params.file_md5, "fileMd5")?)?;
    let file_name = required(&params.file_name, "fileName")?;

    let outcome = state.uploads().merge(&fingerprint, file_name).await?;

    Ok(Json(JsonResult::new(0, "merge complete", Some(outcome))))
}

// ============================================================================
// Tests
// ============================================================================
