//! Main daemon command - boots the control plane and serves the tool API

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use backoff::ExponentialBackoff;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use devbench_daemon::config::Configuration;
use devbench_daemon::database::Database;
use devbench_daemon::events::{Counters, EventBus};
use devbench_daemon::exec::ExecutionEngine;
use devbench_daemon::manager::ContainerManager;
use devbench_daemon::reconcile::{warm::WarmPool, Reconciler};
use devbench_daemon::router::{self, AppState};
use devbench_daemon::runtime::{ContainerRuntime, DockerRuntime};
use devbench_daemon::shutdown::{DrainGate, ShutdownCoordinator};
use devbench_daemon::workspace::WorkspaceGateway;

/// Run the daemon
pub async fn run(config_path: &str) -> Result<()> {
    // Load configuration
    info!("Loading configuration from: {}", config_path);
    let config = Arc::new(Configuration::load(config_path)?);
    info!("  API: {}:{}", config.api.host, config.api.port);
    info!("  Data directory: {}", config.system.data_directory.display());
    info!("  State database: {}", config.system.state_db_path.display());

    // Migrations run to completion before any work is accepted
    let db = Arc::new(Database::open(&config.system.state_db_path)?);

    // Connect to the container runtime; an unreachable daemon is not
    // fatal, reconciliation retries on its next trigger
    let runtime: Arc<dyn ContainerRuntime> = Arc::new(match &config.docker.socket_path {
        Some(socket) => DockerRuntime::connect_socket(socket)?,
        None => DockerRuntime::connect()?,
    });
    let ping = backoff::future::retry(
        ExponentialBackoff {
            max_elapsed_time: Some(Duration::from_secs(30)),
            ..Default::default()
        },
        || async {
            runtime.ping().await.map_err(backoff::Error::transient)
        },
    )
    .await;
    match ping {
        Ok(()) => info!("Container runtime is reachable"),
        Err(e) => warn!("Container runtime unreachable at boot: {}", e),
    }

    let events = EventBus::new();
    let counters = Arc::new(Counters::default());
    let engine = Arc::new(ExecutionEngine::new(
        runtime.clone(),
        db.clone(),
        config.clone(),
        events.clone(),
        counters.clone(),
    ));
    let manager = Arc::new(ContainerManager::new(
        runtime.clone(),
        db.clone(),
        config.clone(),
        engine.clone(),
        events.clone(),
        counters.clone(),
    ));
    let gateway = Arc::new(WorkspaceGateway::new(
        config.system.workspace_mount_path.clone(),
    ));
    let reconciler = Arc::new(Reconciler::new(
        runtime.clone(),
        db.clone(),
        config.clone(),
        engine.clone(),
        manager.clone(),
        events.clone(),
        counters.clone(),
    ));

    // Adopt whatever survived the last run before serving
    let report = reconciler.boot().await?;
    info!(
        adopted = report.adopted,
        recovered = report.recovered,
        removed = report.removed,
        marked_stopped = report.marked_stopped,
        "boot reconciliation finished"
    );

    // Background workers
    let worker_token = CancellationToken::new();
    reconciler.clone().spawn_maintenance_loop(worker_token.clone());
    Arc::new(WarmPool::new(
        runtime.clone(),
        db.clone(),
        config.clone(),
        manager.clone(),
    ))
    .spawn_loop(worker_token.clone());

    // Tool surface
    let gate = Arc::new(DrainGate::new());
    let state = AppState {
        manager: manager.clone(),
        engine: engine.clone(),
        gateway,
        reconciler,
        runtime,
        db: db.clone(),
        config: config.clone(),
        counters,
        gate: gate.clone(),
        started_at: Instant::now(),
        events: events.clone(),
    };
    let app = router::build_router(state);

    let bind_addr: SocketAddr = format!("{}:{}", config.api.host, config.api.port).parse()?;
    let handle = axum_server::Handle::new();

    // Signal handling drives the drain sequence
    let coordinator = ShutdownCoordinator::new(gate, engine, manager, db, config, events);
    let shutdown_handle = handle.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to install CTRL+C handler: {}", e);
            return;
        }
        warn!("Received shutdown signal, draining...");
        worker_token.cancel();
        coordinator.run().await;
        shutdown_handle.graceful_shutdown(Some(Duration::from_secs(10)));
    });

    info!("Starting HTTP server on {}", bind_addr);
    axum_server::bind(bind_addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await?;

    info!("Daemon stopped");
    Ok(())
}
