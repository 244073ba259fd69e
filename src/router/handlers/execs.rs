//! Execution tool handlers: start, cancel, poll

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::database::{ExecState, ExecUsage};
use crate::error::Result;
use crate::exec::{ExecRequest, Frame, StreamKind};
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct ExecStartBody {
    pub container_id: String,
    pub cmd: Vec<String>,
    pub cwd: Option<String>,
    #[serde(default)]
    pub env: std::collections::HashMap<String, String>,
    #[serde(default)]
    pub as_root: bool,
    pub timeout_s: Option<u64>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecStartResponse {
    pub exec_id: String,
    pub status: ExecState,
}

pub async fn exec_start(
    State(state): State<AppState>,
    Json(body): Json<ExecStartBody>,
) -> Result<Json<ExecStartResponse>> {
    state.gate.check()?;

    let row = state
        .engine
        .start(ExecRequest {
            target: body.container_id,
            argv: body.cmd,
            cwd: body.cwd,
            env: body.env.into_iter().collect(),
            as_root: body.as_root,
            timeout_seconds: body.timeout_s,
            idempotency_key: body.idempotency_key,
        })
        .await?;

    Ok(Json(ExecStartResponse {
        exec_id: row.id,
        status: row.status,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ExecCancelBody {
    pub exec_id: String,
}

#[derive(Debug, Serialize)]
pub struct ExecCancelResponse {
    pub exec_id: String,
    pub status: ExecState,
}

pub async fn exec_cancel(
    State(state): State<AppState>,
    Json(body): Json<ExecCancelBody>,
) -> Result<Json<ExecCancelResponse>> {
    let row = state.engine.cancel(&body.exec_id).await?;
    Ok(Json(ExecCancelResponse {
        exec_id: row.id,
        status: row.status,
    }))
}

#[derive(Debug, Deserialize)]
pub struct ExecPollBody {
    pub exec_id: String,
    #[serde(default)]
    pub after_seq: u64,
}

/// One frame on the wire. Output bytes are rendered as UTF-8 text with
/// invalid sequences replaced; the control frame carries exit code and
/// usage instead of data.
#[derive(Debug, Serialize)]
pub struct PollMessage {
    pub seq: u64,
    pub stream: StreamKind,
    pub data: String,
    pub ts: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<ExecUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
}

impl From<Frame> for PollMessage {
    fn from(frame: Frame) -> Self {
        let (exit_code, usage, reason) = match &frame.exit {
            Some(exit) => (exit.exit_code, Some(exit.usage), exit.reason),
            None => (None, None, None),
        };
        PollMessage {
            seq: frame.seq,
            stream: frame.stream,
            data: String::from_utf8_lossy(&frame.data).into_owned(),
            ts: frame.ts_ms,
            exit_code,
            usage,
            reason,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct ExecPollResponse {
    pub messages: Vec<PollMessage>,
    pub complete: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gap_from_seq: Option<u64>,
}

pub async fn exec_poll(
    State(state): State<AppState>,
    Json(body): Json<ExecPollBody>,
) -> Result<Json<ExecPollResponse>> {
    let result = state.engine.poll(&body.exec_id, body.after_seq).await?;
    Ok(Json(ExecPollResponse {
        messages: result.frames.into_iter().map(PollMessage::from).collect(),
        complete: result.complete,
        gap_from_seq: result.gap_from_seq,
    }))
}
