//! Admin and diagnostics handlers

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::database::{ContainerRow, ExecRow, ExecState};
use crate::error::{DaemonError, Result};
use crate::events::CounterSnapshot;
use crate::reconcile::{MaintenanceReport, ReconcileReport};
use crate::router::AppState;

/// Trigger a reconciliation pass.
pub async fn admin_reconcile(State(state): State<AppState>) -> Result<Json<ReconcileReport>> {
    let report = state.reconciler.reconcile().await?;
    Ok(Json(report))
}

/// Trigger a maintenance pass.
pub async fn admin_gc(State(state): State<AppState>) -> Result<Json<MaintenanceReport>> {
    let report = state.reconciler.maintenance().await?;
    Ok(Json(report))
}

#[derive(Debug, Deserialize)]
pub struct ListContainersQuery {
    pub all: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct ListContainersResponse {
    pub containers: Vec<ContainerRow>,
}

pub async fn admin_containers(
    State(state): State<AppState>,
    Query(query): Query<ListContainersQuery>,
) -> Result<Json<ListContainersResponse>> {
    let containers = state.manager.list(query.all.unwrap_or(false)).await?;
    Ok(Json(ListContainersResponse { containers }))
}

#[derive(Debug, Deserialize)]
pub struct ListExecsQuery {
    pub container_id: Option<String>,
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ListExecsResponse {
    pub execs: Vec<ExecRow>,
}

pub async fn admin_execs(
    State(state): State<AppState>,
    Query(query): Query<ListExecsQuery>,
) -> Result<Json<ListExecsResponse>> {
    let status = match &query.status {
        Some(s) => Some(ExecState::parse(s).ok_or_else(|| {
            DaemonError::InvalidRequest(format!("unknown execution status '{}'", s))
        })?),
        None => None,
    };

    let execs = state
        .db
        .execs()
        .await
        .list(query.container_id.as_deref(), status)?;
    Ok(Json(ListExecsResponse { execs }))
}

#[derive(Debug, Serialize)]
pub struct HostInfo {
    pub cpus: usize,
    pub total_memory_bytes: u64,
    pub used_memory_bytes: u64,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub uptime_seconds: u64,
    pub draining: bool,
    pub runtime_reachable: bool,
    pub active_execs: usize,
    pub counters: CounterSnapshot,
    pub host: HostInfo,
}

pub async fn admin_status(State(state): State<AppState>) -> Json<StatusResponse> {
    let runtime_reachable = state.runtime.ping().await.is_ok();

    let mut system = System::new();
    system.refresh_memory();
    system.refresh_cpu_all();

    Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        uptime_seconds: state.started_at.elapsed().as_secs(),
        draining: state.gate.is_draining(),
        runtime_reachable,
        active_execs: state.engine.active_count(),
        counters: state.counters.snapshot(),
        host: HostInfo {
            cpus: system.cpus().len(),
            total_memory_bytes: system.total_memory(),
            used_memory_bytes: system.used_memory(),
        },
    })
}
