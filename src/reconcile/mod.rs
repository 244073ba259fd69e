//! Reconciliation between the state store and the container runtime
//!
//! At boot the daemon adopts every runtime container carrying its
//! namespace label, repairs rows whose containers are gone, fails
//! executions that were live at the last persisted state, and considers
//! all attachments detached. A periodic maintenance pass purges aged
//! rows, expired idempotency keys and retired ring buffers, and
//! re-checks drift.

pub mod warm;

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::database::{ContainerRow, ContainerStatus, Database};
use crate::error::{DaemonError, Result};
use crate::events::{AuditEvent, Counters, EventBus};
use crate::exec::ExecutionEngine;
use crate::manager::ContainerManager;
use crate::runtime::{ContainerRuntime, NAMESPACE_LABEL};

/// How often the maintenance pass runs.
const MAINTENANCE_INTERVAL: Duration = Duration::from_secs(3600);
/// Terminal exec rows are purged after this age.
const EXEC_RETENTION_SECONDS: i64 = 24 * 60 * 60;

/// Outcome of one reconciliation pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReconcileReport {
    /// Known containers whose status was synchronized
    pub adopted: usize,
    /// Unknown-but-labeled containers recovered into new rows
    pub recovered: usize,
    /// Runtime containers removed as orphans
    pub removed: usize,
    /// Rows marked stopped/error because their container is gone
    pub marked_stopped: usize,
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct MaintenanceReport {
    pub purged_containers: usize,
    pub purged_execs: usize,
    pub purged_keys: usize,
    pub expired_transients: usize,
    pub retired_rings: usize,
}

pub struct Reconciler {
    runtime: Arc<dyn ContainerRuntime>,
    db: Arc<Database>,
    config: Arc<Configuration>,
    engine: Arc<ExecutionEngine>,
    manager: Arc<ContainerManager>,
    events: EventBus,
    counters: Arc<Counters>,
}

impl Reconciler {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        db: Arc<Database>,
        config: Arc<Configuration>,
        engine: Arc<ExecutionEngine>,
        manager: Arc<ContainerManager>,
        events: EventBus,
        counters: Arc<Counters>,
    ) -> Self {
        Self {
            runtime,
            db,
            config,
            engine,
            manager,
            events,
            counters,
        }
    }

    /// Boot-time recovery. A reachable runtime is not required: when the
    /// daemon is down, recovery is logged and re-attempted on the next
    /// trigger.
    pub async fn boot(&self) -> Result<ReconcileReport> {
        let now = chrono::Utc::now().timestamp();

        let failed = self
            .db
            .execs()
            .await
            .fail_all_live("server_restart", now)?;
        if failed > 0 {
            info!(failed, "failed executions left over from previous run");
        }

        let detached = self.db.attachments().await.detach_everything(now)?;
        if detached > 0 {
            info!(detached, "detached stale attachments");
        }

        match self.reconcile().await {
            Ok(report) => Ok(report),
            Err(DaemonError::RuntimeUnavailable(msg)) => {
                warn!("runtime unavailable during boot reconciliation: {}", msg);
                Ok(ReconcileReport::default())
            }
            Err(e) => Err(e),
        }
    }

    /// One reconciliation pass. Idempotent: running it twice with no
    /// intervening events produces the same state.
    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        let now = chrono::Utc::now().timestamp();
        let mut report = ReconcileReport::default();

        let label = format!("{}=true", NAMESPACE_LABEL);
        let runtime_containers = self.runtime.list_labeled(&label).await?;
        let mut seen_ids = Vec::new();

        for rc in &runtime_containers {
            let container_id = match rc.labeled_container_id() {
                Some(id) => id.to_string(),
                None => {
                    warn!(runtime_id = %rc.runtime_id, "labeled container without id label; skipping");
                    continue;
                }
            };

            let known = self.db.containers().await.get(&container_id)?;
            match known {
                Some(row) if row.status.is_terminal() => {
                    // A terminal row should have no runtime object
                    debug!(container_id, "removing runtime container for terminal row");
                    self.runtime.remove(&rc.runtime_id, true).await?;
                    report.removed += 1;
                }
                Some(row) => {
                    seen_ids.push(container_id.clone());
                    if rc.running {
                        if row.status != ContainerStatus::Running
                            || row.runtime_id.as_deref() != Some(rc.runtime_id.as_str())
                        {
                            self.db
                                .containers()
                                .await
                                .set_running(&container_id, &rc.runtime_id, now)?;
                        } else {
                            self.db.containers().await.touch(&container_id, now)?;
                        }
                        report.adopted += 1;
                    } else {
                        // The container exited behind our back
                        self.runtime.remove(&rc.runtime_id, true).await?;
                        self.db.containers().await.set_status(
                            &container_id,
                            ContainerStatus::Stopped,
                            now,
                        )?;
                        report.marked_stopped += 1;
                    }
                }
                None => {
                    let age = now - rc.created_at_unix;
                    let gc_age = self.config.lifecycle.transient_gc_days as i64 * 86_400;
                    if rc.running && (rc.labeled_persistent() || age <= gc_age) {
                        // Recover identity from labels
                        let row = ContainerRow {
                            id: container_id.clone(),
                            runtime_id: Some(rc.runtime_id.clone()),
                            alias: None,
                            image: rc.image.clone(),
                            persistent: rc.labeled_persistent(),
                            warm: rc.labeled_warm(),
                            status: ContainerStatus::Running,
                            ttl_seconds: None,
                            workspace_dir: container_id.clone(),
                            created_at: rc.created_at_unix,
                            last_seen_at: now,
                        };
                        self.db.containers().await.insert(&row)?;
                        seen_ids.push(container_id.clone());
                        Counters::incr(&self.counters.containers_adopted);
                        self.events.publish(AuditEvent::ContainerAdopted {
                            container_id: container_id.clone(),
                        });
                        info!(container_id, "adopted unknown runtime container");
                        report.recovered += 1;
                    } else {
                        info!(container_id, age, "removing orphaned runtime container");
                        self.runtime.remove(&rc.runtime_id, true).await?;
                        report.removed += 1;
                    }
                }
            }
        }

        // Rows whose runtime object is gone
        let live_rows = self.db.containers().await.list(false)?;
        for row in live_rows {
            if seen_ids.contains(&row.id) {
                continue;
            }
            let status = match row.status {
                ContainerStatus::Creating => ContainerStatus::Error,
                _ => ContainerStatus::Stopped,
            };
            self.db
                .containers()
                .await
                .set_status(&row.id, status, now)?;
            report.marked_stopped += 1;
        }

        Counters::incr(&self.counters.reconcile_passes);
        self.events.publish(AuditEvent::ReconcilePass {
            adopted: report.adopted,
            removed: report.removed,
            marked_stopped: report.marked_stopped,
        });
        debug!(?report, "reconciliation pass finished");
        Ok(report)
    }

    /// Periodic maintenance: purge aged rows and keys, expire transient
    /// containers past their TTL, drop retired rings, then re-check
    /// drift.
    pub async fn maintenance(&self) -> Result<MaintenanceReport> {
        let now = chrono::Utc::now().timestamp();
        let mut report = MaintenanceReport::default();

        let expired = self.db.containers().await.expired_running_transients(now)?;
        for row in expired {
            info!(container_id = %row.id, "transient container exceeded its TTL");
            if let Err(e) = self.manager.kill(&row.id, true).await {
                warn!(container_id = %row.id, "failed to expire transient: {}", e);
                continue;
            }
            report.expired_transients += 1;
        }

        let gc_cutoff = now - self.config.lifecycle.transient_gc_days as i64 * 86_400;
        report.purged_containers = self
            .db
            .containers()
            .await
            .purge_terminal_transients(gc_cutoff)?;
        report.purged_execs = self
            .db
            .execs()
            .await
            .purge_terminal_older_than(now - EXEC_RETENTION_SECONDS)?;
        report.purged_keys = self.db.idempotency().await.purge_expired(now)?;
        report.retired_rings = self.engine.purge_retired(now);

        if report.purged_containers + report.purged_execs + report.purged_keys > 0 {
            self.db.vacuum().await?;
        }

        if let Err(e) = self.reconcile().await {
            warn!("drift check skipped: {}", e);
        }

        info!(?report, "maintenance pass finished");
        Ok(report)
    }

    /// Run maintenance hourly until cancelled.
    pub fn spawn_maintenance_loop(self: Arc<Self>, token: CancellationToken) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(MAINTENANCE_INTERVAL);
            interval.tick().await; // Skip first immediate tick

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("maintenance loop stopped");
                        return;
                    }
                    _ = interval.tick() => {
                        if let Err(e) = self.maintenance().await {
                            warn!("maintenance pass failed: {}", e);
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::database::{ExecRow, ExecState, ExecUsage};
    use crate::runtime::fake::FakeRuntime;

    struct Fixture {
        reconciler: Reconciler,
        runtime: Arc<FakeRuntime>,
        db: Arc<Database>,
        manager: Arc<ContainerManager>,
        _data_dir: TempDir,
    }

    fn fixture() -> Fixture {
        let data_dir = TempDir::new().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let config = Arc::new(Configuration::default_for_tests(
            data_dir.path().to_path_buf(),
        ));
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
        let reconciler = Reconciler::new(
            runtime.clone(),
            db.clone(),
            config,
            engine,
            manager.clone(),
            events,
            counters,
        );
        Fixture {
            reconciler,
            runtime,
            db,
            manager,
            _data_dir: data_dir,
        }
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    #[tokio::test]
    async fn test_boot_adopts_unknown_labeled_container() {
        let fx = fixture();
        fx.runtime
            .add_container("c_2", "python:3.11-slim", false, false, true, now() - 60);

        let report = fx.reconciler.boot().await.unwrap();
        assert_eq!(report.recovered, 1);

        let row = fx.db.containers().await.get("c_2").unwrap().unwrap();
        assert_eq!(row.status, ContainerStatus::Running);
        assert!(row.runtime_id.is_some());

        // The adopted container is fully operable
        let status = fx.manager.kill("c_2", false).await.unwrap();
        assert_eq!(status, ContainerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let fx = fixture();
        fx.runtime
            .add_container("c_2", "python:3.11-slim", false, false, true, now() - 60);

        fx.reconciler.reconcile().await.unwrap();
        let first: Vec<_> = fx.db.containers().await.list(true).unwrap();

        let report = fx.reconciler.reconcile().await.unwrap();
        assert_eq!(report.recovered, 0);
        assert_eq!(report.removed, 0);
        let second: Vec<_> = fx.db.containers().await.list(true).unwrap();

        assert_eq!(first.len(), second.len());
        assert_eq!(first[0].id, second[0].id);
        assert_eq!(first[0].status, second[0].status);
    }

    #[tokio::test]
    async fn test_rows_without_runtime_marked_stopped() {
        let fx = fixture();
        let row = fx.manager.spawn(crate::manager::SpawnRequest {
            image: "python:3.11-slim".into(),
            persistent: false,
            alias: None,
            ttl_seconds: None,
            idempotency_key: None,
        })
        .await
        .unwrap();

        // The runtime loses the container behind our back
        fx.runtime.remove(row.runtime_id.as_deref().unwrap(), true)
            .await
            .unwrap();

        let report = fx.reconciler.reconcile().await.unwrap();
        assert_eq!(report.marked_stopped, 1);

        let row = fx.db.containers().await.get(&row.id).unwrap().unwrap();
        assert_eq!(row.status, ContainerStatus::Stopped);
    }

    #[tokio::test]
    async fn test_aged_unknown_transient_removed() {
        let fx = fixture();
        let old = now() - 30 * 86_400;
        let runtime_id =
            fx.runtime
                .add_container("c_old", "python:3.11-slim", false, false, true, old);

        let report = fx.reconciler.reconcile().await.unwrap();
        assert_eq!(report.removed, 1);
        assert!(fx.runtime.removed_ids().contains(&runtime_id));
        assert!(fx.db.containers().await.get("c_old").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_aged_unknown_persistent_adopted() {
        let fx = fixture();
        let old = now() - 30 * 86_400;
        fx.runtime
            .add_container("c_keep", "python:3.11-slim", true, false, true, old);

        let report = fx.reconciler.reconcile().await.unwrap();
        assert_eq!(report.recovered, 1);
        let row = fx.db.containers().await.get("c_keep").unwrap().unwrap();
        assert!(row.persistent);
    }

    #[tokio::test]
    async fn test_boot_fails_live_execs_and_detaches() {
        let fx = fixture();
        fx.db.execs().await.insert(&ExecRow {
            id: "e_1".into(),
            container_id: "c_1".into(),
            argv: vec!["sleep".into(), "100".into()],
            cwd: None,
            as_root: false,
            timeout_seconds: 600,
            status: ExecState::Running,
            exit_code: None,
            usage: None,
            failure_reason: None,
            started_at: now() - 10,
            ended_at: None,
        })
        .unwrap();
        fx.db.attachments().await.insert("c_1", "agent", "s_1", now()).unwrap();

        fx.reconciler.boot().await.unwrap();

        let exec = fx.db.execs().await.get("e_1").unwrap().unwrap();
        assert_eq!(exec.status, ExecState::Failed);
        assert_eq!(exec.failure_reason.as_deref(), Some("server_restart"));
        assert!(fx.db.attachments().await.active_for("c_1").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_boot_survives_unavailable_runtime() {
        let fx = fixture();
        fx.runtime.set_unavailable(true);
        let report = fx.reconciler.boot().await.unwrap();
        assert_eq!(report.adopted + report.recovered + report.removed, 0);
    }

    #[tokio::test]
    async fn test_maintenance_purges() {
        let fx = fixture();
        let old = now() - 3 * 86_400;

        fx.db.execs().await.insert(&ExecRow {
            id: "e_old".into(),
            container_id: "c_1".into(),
            argv: vec!["true".into()],
            cwd: None,
            as_root: false,
            timeout_seconds: 600,
            status: ExecState::Running,
            exit_code: None,
            usage: None,
            failure_reason: None,
            started_at: old,
            ended_at: None,
        })
        .unwrap();
        fx.db
            .execs()
            .await
            .finish("e_old", ExecState::Exited, Some(0), ExecUsage::default(), None, old)
            .unwrap();
        fx.db.idempotency().await.claim("k-old", "e_old", old).unwrap();

        let report = fx.reconciler.maintenance().await.unwrap();
        assert_eq!(report.purged_execs, 1);
        assert_eq!(report.purged_keys, 1);
    }
}
