//! Workspace filesystem tool handlers

use axum::body::Body;
use axum::extract::State;
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;

use crate::database::ContainerRow;
use crate::error::{DaemonError, Result};
use crate::events::{AuditEvent, Counters};
use crate::router::AppState;
use crate::workspace::{EntryInfo, ImportSummary, WriteOp, WriteOutcome};

/// Count path violations as they surface.
fn track(state: &AppState, e: DaemonError) -> DaemonError {
    if matches!(e, DaemonError::PathViolation(_)) {
        Counters::incr(&state.counters.path_violations);
    }
    e
}

async fn resolve_workspace(state: &AppState, container_id: &str) -> Result<(ContainerRow, std::path::PathBuf)> {
    let row = state.manager.resolve(container_id).await?;
    let root = state.manager.workspace_root(&row);
    Ok((row, root))
}

#[derive(Debug, Deserialize)]
pub struct FsPathBody {
    pub container_id: String,
    pub path: String,
}

#[derive(Debug, Serialize)]
pub struct FsReadResponse {
    pub path: String,
    /// Present when the content is valid UTF-8
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    pub content_b64: String,
    pub size: u64,
    pub etag: String,
    pub modified_ms: i64,
    pub mime_type: String,
}

pub async fn fs_read(
    State(state): State<AppState>,
    Json(body): Json<FsPathBody>,
) -> Result<Json<FsReadResponse>> {
    let (_, root) = resolve_workspace(&state, &body.container_id).await?;

    let file = state
        .gateway
        .read(&root, &body.path)
        .await
        .map_err(|e| track(&state, e.into()))?;

    Counters::incr(&state.counters.fs_reads);
    Ok(Json(FsReadResponse {
        path: body.path,
        content: String::from_utf8(file.content.clone()).ok(),
        content_b64: BASE64.encode(&file.content),
        size: file.size,
        etag: file.etag,
        modified_ms: file.modified_ms,
        mime_type: file.mime_type,
    }))
}

#[derive(Debug, Deserialize)]
pub struct FsWriteBody {
    pub container_id: String,
    pub path: String,
    pub content: Option<String>,
    pub content_b64: Option<String>,
    pub if_match_etag: Option<String>,
}

fn decode_content(content: Option<String>, content_b64: Option<String>) -> Result<Vec<u8>> {
    match (content_b64, content) {
        (Some(encoded), _) => BASE64
            .decode(encoded.as_bytes())
            .map_err(|e| DaemonError::InvalidRequest(format!("invalid base64 content: {}", e))),
        (None, Some(text)) => Ok(text.into_bytes()),
        (None, None) => Err(DaemonError::InvalidRequest(
            "one of 'content' or 'content_b64' is required".into(),
        )),
    }
}

#[derive(Debug, Serialize)]
pub struct FsWriteResponse {
    pub path: String,
    pub etag: String,
    pub size: u64,
}

pub async fn fs_write(
    State(state): State<AppState>,
    Json(body): Json<FsWriteBody>,
) -> Result<Json<FsWriteResponse>> {
    let (row, root) = resolve_workspace(&state, &body.container_id).await?;
    let content = decode_content(body.content, body.content_b64)?;

    let outcome = state
        .gateway
        .write(&root, &body.path, &content, body.if_match_etag.as_deref())
        .await
        .map_err(|e| track(&state, e.into()))?;

    Counters::incr(&state.counters.fs_writes);
    state.events.publish(AuditEvent::FileWritten {
        container_id: row.id,
        path: body.path.clone(),
        size: outcome.size,
    });

    Ok(Json(FsWriteResponse {
        path: body.path,
        etag: outcome.etag,
        size: outcome.size,
    }))
}

#[derive(Debug, Deserialize)]
pub struct FsBatchEntry {
    pub path: String,
    pub content: Option<String>,
    pub content_b64: Option<String>,
    pub if_match_etag: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FsWriteBatchBody {
    pub container_id: String,
    pub files: Vec<FsBatchEntry>,
}

#[derive(Debug, Serialize)]
pub struct FsWriteBatchResponse {
    pub files: Vec<WriteOutcome>,
}

pub async fn fs_write_batch(
    State(state): State<AppState>,
    Json(body): Json<FsWriteBatchBody>,
) -> Result<Json<FsWriteBatchResponse>> {
    let (row, root) = resolve_workspace(&state, &body.container_id).await?;

    let mut ops = Vec::with_capacity(body.files.len());
    for entry in body.files {
        ops.push(WriteOp {
            content: decode_content(entry.content, entry.content_b64)?,
            path: entry.path,
            if_match_etag: entry.if_match_etag,
        });
    }

    let outcomes = state
        .gateway
        .write_batch(&root, &ops)
        .await
        .map_err(|e| track(&state, e.into()))?;

    Counters::add(&state.counters.fs_writes, outcomes.len() as u64);
    for (op, outcome) in ops.iter().zip(&outcomes) {
        state.events.publish(AuditEvent::FileWritten {
            container_id: row.id.clone(),
            path: op.path.clone(),
            size: outcome.size,
        });
    }

    Ok(Json(FsWriteBatchResponse { files: outcomes }))
}

#[derive(Debug, Deserialize)]
pub struct FsDeleteBody {
    pub container_id: String,
    pub path: String,
    #[serde(default)]
    pub recursive: bool,
}

#[derive(Debug, Serialize)]
pub struct FsDeleteResponse {
    pub deleted: bool,
}

pub async fn fs_delete(
    State(state): State<AppState>,
    Json(body): Json<FsDeleteBody>,
) -> Result<Json<FsDeleteResponse>> {
    let (row, root) = resolve_workspace(&state, &body.container_id).await?;

    state
        .gateway
        .delete(&root, &body.path, body.recursive)
        .await
        .map_err(|e| track(&state, e.into()))?;

    Counters::incr(&state.counters.fs_deletes);
    state.events.publish(AuditEvent::FileDeleted {
        container_id: row.id,
        path: body.path,
    });

    Ok(Json(FsDeleteResponse { deleted: true }))
}

pub async fn fs_stat(
    State(state): State<AppState>,
    Json(body): Json<FsPathBody>,
) -> Result<Json<EntryInfo>> {
    let (_, root) = resolve_workspace(&state, &body.container_id).await?;
    let info = state
        .gateway
        .stat(&root, &body.path)
        .await
        .map_err(|e| track(&state, e.into()))?;
    Ok(Json(info))
}

#[derive(Debug, Serialize)]
pub struct FsListResponse {
    pub entries: Vec<EntryInfo>,
}

pub async fn fs_list(
    State(state): State<AppState>,
    Json(body): Json<FsPathBody>,
) -> Result<Json<FsListResponse>> {
    let (_, root) = resolve_workspace(&state, &body.container_id).await?;
    let entries = state
        .gateway
        .list(&root, &body.path)
        .await
        .map_err(|e| track(&state, e.into()))?;
    Ok(Json(FsListResponse { entries }))
}

#[derive(Debug, Deserialize)]
pub struct FsExportBody {
    pub container_id: String,
    pub path: String,
    #[serde(default)]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub gzip: bool,
}

/// Streams the archive as a chunked body. The spool file is unlinked as
/// soon as it is open, so it cannot leak.
pub async fn fs_export(
    State(state): State<AppState>,
    Json(body): Json<FsExportBody>,
) -> Result<Response> {
    let (row, root) = resolve_workspace(&state, &body.container_id).await?;

    let spool = state
        .gateway
        .export_tar(
            &root,
            &body.path,
            &body.include_globs,
            &body.exclude_globs,
            body.gzip,
        )
        .await
        .map_err(|e| track(&state, e.into()))?;

    let file = tokio::fs::File::open(&spool)
        .await
        .map_err(DaemonError::internal)?;
    let _ = tokio::fs::remove_file(&spool).await;

    Counters::incr(&state.counters.archives_exported);
    state.events.publish(AuditEvent::ArchiveExported {
        container_id: row.id,
        path: body.path,
    });

    let content_type = if body.gzip {
        "application/gzip"
    } else {
        "application/x-tar"
    };
    let response = (
        [(header::CONTENT_TYPE, content_type)],
        Body::from_stream(ReaderStream::new(file)),
    )
        .into_response();
    Ok(response)
}

#[derive(Debug, Deserialize)]
pub struct FsImportBody {
    pub container_id: String,
    /// Destination directory under the workspace mount
    pub path: String,
    /// Tar archive, optionally gzipped, base64-encoded
    pub data_b64: String,
}

pub async fn fs_import(
    State(state): State<AppState>,
    Json(body): Json<FsImportBody>,
) -> Result<Json<ImportSummary>> {
    let (row, root) = resolve_workspace(&state, &body.container_id).await?;

    let data = BASE64
        .decode(body.data_b64.as_bytes())
        .map_err(|e| DaemonError::InvalidRequest(format!("invalid base64 archive: {}", e)))?;

    let summary = state
        .gateway
        .import_tar(&root, &body.path, bytes::Bytes::from(data))
        .await
        .map_err(|e| track(&state, e.into()))?;

    Counters::incr(&state.counters.archives_imported);
    state.events.publish(AuditEvent::ArchiveImported {
        container_id: row.id,
        path: body.path,
        entries: summary.entries,
    });

    Ok(Json(summary))
}
