//! HTTP tool surface
//!
//! Thin JSON endpoints over the core: decode input, call the manager,
//! engine, gateway or reconciler, encode output. Framing, auth and TLS
//! live outside this daemon.

pub mod handlers;

use std::sync::Arc;
use std::time::Instant;

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::Configuration;
use crate::database::Database;
use crate::events::{Counters, EventBus};
use crate::exec::ExecutionEngine;
use crate::manager::ContainerManager;
use crate::reconcile::Reconciler;
use crate::runtime::ContainerRuntime;
use crate::shutdown::DrainGate;
use crate::workspace::WorkspaceGateway;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ContainerManager>,
    pub engine: Arc<ExecutionEngine>,
    pub gateway: Arc<WorkspaceGateway>,
    pub reconciler: Arc<Reconciler>,
    pub runtime: Arc<dyn ContainerRuntime>,
    pub db: Arc<Database>,
    pub config: Arc<Configuration>,
    pub counters: Arc<Counters>,
    pub gate: Arc<DrainGate>,
    pub started_at: Instant,
    pub events: EventBus,
}

pub fn build_router(state: AppState) -> Router {
    let body_limit = state.config.api.upload_limit_bytes;

    Router::new()
        // Lifecycle
        .route("/api/spawn", post(handlers::spawn))
        .route("/api/attach", post(handlers::attach))
        .route("/api/detach", post(handlers::detach))
        .route("/api/kill", post(handlers::kill))
        // Execution
        .route("/api/exec/start", post(handlers::exec_start))
        .route("/api/exec/cancel", post(handlers::exec_cancel))
        .route("/api/exec/poll", post(handlers::exec_poll))
        // Workspace filesystem
        .route("/api/fs/read", post(handlers::fs_read))
        .route("/api/fs/write", post(handlers::fs_write))
        .route("/api/fs/write_batch", post(handlers::fs_write_batch))
        .route("/api/fs/delete", post(handlers::fs_delete))
        .route("/api/fs/stat", post(handlers::fs_stat))
        .route("/api/fs/list", post(handlers::fs_list))
        .route("/api/fs/export", post(handlers::fs_export))
        .route("/api/fs/import", post(handlers::fs_import))
        // Admin / diagnostics
        .route("/api/admin/reconcile", post(handlers::admin_reconcile))
        .route("/api/admin/gc", post(handlers::admin_gc))
        .route("/api/admin/containers", get(handlers::admin_containers))
        .route("/api/admin/execs", get(handlers::admin_execs))
        .route("/api/admin/status", get(handlers::admin_status))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
