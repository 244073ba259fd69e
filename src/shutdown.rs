//! Graceful shutdown coordination
//!
//! On signal the daemon stops accepting new work, lets in-flight
//! executions finish within the drain grace, cancels the rest (their
//! terminal frame carries `shutdown`), stops and removes transient
//! containers, leaves persistent ones running, and flushes state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Configuration;
use crate::database::Database;
use crate::error::{DaemonError, Result};
use crate::events::{AuditEvent, EventBus};
use crate::exec::ExecutionEngine;
use crate::manager::ContainerManager;

/// Admission gate checked by every mutating tool handler.
#[derive(Debug, Default)]
pub struct DrainGate {
    draining: AtomicBool,
}

impl DrainGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail new work once draining has begun.
    pub fn check(&self) -> Result<()> {
        if self.draining.load(Ordering::Relaxed) {
            Err(DaemonError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    pub fn begin(&self) {
        self.draining.store(true, Ordering::Relaxed);
    }

    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Relaxed)
    }
}

pub struct ShutdownCoordinator {
    gate: Arc<DrainGate>,
    engine: Arc<ExecutionEngine>,
    manager: Arc<ContainerManager>,
    db: Arc<Database>,
    config: Arc<Configuration>,
    events: EventBus,
}

impl ShutdownCoordinator {
    pub fn new(
        gate: Arc<DrainGate>,
        engine: Arc<ExecutionEngine>,
        manager: Arc<ContainerManager>,
        db: Arc<Database>,
        config: Arc<Configuration>,
        events: EventBus,
    ) -> Self {
        Self {
            gate,
            engine,
            manager,
            db,
            config,
            events,
        }
    }

    /// Run the full drain sequence. Safe to call once; later calls are
    /// no-ops because the gate is already closed.
    pub async fn run(&self) {
        if self.gate.is_draining() {
            return;
        }
        self.gate.begin();
        self.events.publish(AuditEvent::DrainStarted);
        info!(
            grace_seconds = self.config.lifecycle.drain_grace_seconds,
            "shutdown: draining in-flight executions"
        );

        let cancelled = self
            .engine
            .drain(Duration::from_secs(self.config.lifecycle.drain_grace_seconds))
            .await;
        self.events.publish(AuditEvent::DrainFinished { cancelled });
        if cancelled > 0 {
            info!(cancelled, "shutdown: cancelled executions past the drain grace");
        }

        // Transient containers go; persistent ones keep running
        match self.manager.list(false).await {
            Ok(rows) => {
                for row in rows {
                    if row.persistent {
                        continue;
                    }
                    if let Err(e) = self.manager.kill(&row.id, true).await {
                        warn!(container_id = %row.id, "shutdown: failed to stop transient: {}", e);
                    }
                }
            }
            Err(e) => warn!("shutdown: could not list containers: {}", e),
        }

        let now = chrono::Utc::now().timestamp();
        if let Err(e) = self.db.attachments().await.detach_everything(now) {
            warn!("shutdown: failed to detach sessions: {}", e);
        }

        if let Err(e) = self.db.checkpoint().await {
            warn!("shutdown: checkpoint failed: {}", e);
        }
        info!("shutdown: state flushed");
    }
}
