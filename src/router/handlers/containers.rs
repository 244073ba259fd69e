//! Lifecycle tool handlers: spawn, attach, detach, kill

use axum::extract::State;
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::database::ContainerStatus;
use crate::error::Result;
use crate::manager::{AttachOutcome, SpawnRequest};
use crate::router::AppState;

#[derive(Debug, Deserialize)]
pub struct SpawnBody {
    pub image: String,
    #[serde(default)]
    pub persistent: bool,
    pub alias: Option<String>,
    pub ttl_s: Option<i64>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct SpawnResponse {
    pub container_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub status: ContainerStatus,
}

pub async fn spawn(
    State(state): State<AppState>,
    Json(body): Json<SpawnBody>,
) -> Result<Json<SpawnResponse>> {
    state.gate.check()?;

    let row = state
        .manager
        .spawn(SpawnRequest {
            image: body.image,
            persistent: body.persistent,
            alias: body.alias,
            ttl_seconds: body.ttl_s,
            idempotency_key: body.idempotency_key,
        })
        .await?;

    Ok(Json(SpawnResponse {
        container_id: row.id,
        alias: row.alias,
        status: row.status,
    }))
}

#[derive(Debug, Deserialize)]
pub struct AttachBody {
    pub target: String,
    pub client_name: String,
    pub session_id: String,
}

pub async fn attach(
    State(state): State<AppState>,
    Json(body): Json<AttachBody>,
) -> Result<Json<AttachOutcome>> {
    state.gate.check()?;
    let outcome = state
        .manager
        .attach(&body.target, &body.client_name, &body.session_id)
        .await?;
    Ok(Json(outcome))
}

#[derive(Debug, Deserialize)]
pub struct DetachBody {
    pub target: String,
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct DetachResponse {
    pub detached: usize,
}

pub async fn detach(
    State(state): State<AppState>,
    Json(body): Json<DetachBody>,
) -> Result<Json<DetachResponse>> {
    let detached = state.manager.detach(&body.target, &body.session_id).await?;
    Ok(Json(DetachResponse { detached }))
}

#[derive(Debug, Deserialize)]
pub struct KillBody {
    pub container_id: String,
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct KillResponse {
    pub status: ContainerStatus,
}

pub async fn kill(
    State(state): State<AppState>,
    Json(body): Json<KillBody>,
) -> Result<Json<KillResponse>> {
    let status = state.manager.kill(&body.container_id, body.force).await?;
    Ok(Json(KillResponse { status }))
}
