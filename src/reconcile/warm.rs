//! Warm pool keeper
//!
//! Maintains a small set of pre-created containers of the default image
//! so spawn can hand one out via an atomic database claim. A background
//! sweep tops the pool up, health-checks members every minute, and
//! replaces unhealthy ones. Claims wake the sweep immediately through
//! the manager's rewarm notifier.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Configuration;
use crate::database::Database;
use crate::manager::ContainerManager;
use crate::runtime::{ContainerRuntime, RuntimeError};

/// Health-check cadence for pool members.
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

pub struct WarmPool {
    runtime: Arc<dyn ContainerRuntime>,
    db: Arc<Database>,
    config: Arc<Configuration>,
    manager: Arc<ContainerManager>,
    rewarm: Arc<Notify>,
}

impl WarmPool {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        db: Arc<Database>,
        config: Arc<Configuration>,
        manager: Arc<ContainerManager>,
    ) -> Self {
        let rewarm = manager.rewarm_notify();
        Self {
            runtime,
            db,
            config,
            manager,
            rewarm,
        }
    }

    /// One sweep: retire unhealthy members, then top up to the target.
    pub async fn sweep(&self) {
        let image = &self.config.policy.default_image;
        let target = self.config.lifecycle.warm_pool_size;

        let members = match self.db.containers().await.list_warm(image) {
            Ok(members) => members,
            Err(e) => {
                warn!("warm pool sweep could not list members: {}", e);
                return;
            }
        };

        for member in members {
            let healthy = match &member.runtime_id {
                Some(runtime_id) => match self.runtime.inspect(runtime_id).await {
                    Ok(rc) => rc.running,
                    Err(RuntimeError::NotFound(_)) => false,
                    Err(e) => {
                        warn!("warm pool health check unavailable: {}", e);
                        return;
                    }
                },
                None => false,
            };
            if !healthy {
                info!(container_id = %member.id, "replacing unhealthy warm container");
                if let Err(e) = self.manager.kill(&member.id, true).await {
                    warn!(container_id = %member.id, "failed to retire warm container: {}", e);
                }
            }
        }

        let current = match self.db.containers().await.warm_count(image) {
            Ok(n) => n as usize,
            Err(e) => {
                warn!("warm pool sweep could not count members: {}", e);
                return;
            }
        };

        for _ in current..target {
            match self.manager.spawn_warm().await {
                Ok(row) => debug!(container_id = %row.id, "warm container ready"),
                Err(e) => {
                    warn!("warm pool top-up failed: {}", e);
                    break;
                }
            }
        }
    }

    /// Sweep on an interval, and immediately after each claim, until
    /// cancelled.
    pub fn spawn_loop(self: Arc<Self>, token: CancellationToken) {
        if !self.config.lifecycle.warm_pool_enabled {
            return;
        }

        tokio::spawn(async move {
            info!(
                size = self.config.lifecycle.warm_pool_size,
                image = %self.config.policy.default_image,
                "warm pool enabled"
            );
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);

            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        debug!("warm pool loop stopped");
                        return;
                    }
                    _ = self.rewarm.notified() => self.sweep().await,
                    _ = interval.tick() => self.sweep().await,
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::database::ContainerStatus;
    use crate::events::{Counters, EventBus};
    use crate::exec::ExecutionEngine;
    use crate::manager::SpawnRequest;
    use crate::runtime::fake::FakeRuntime;

    struct Fixture {
        pool: WarmPool,
        manager: Arc<ContainerManager>,
        runtime: Arc<FakeRuntime>,
        db: Arc<Database>,
        config: Arc<Configuration>,
        _data_dir: TempDir,
    }

    fn fixture(size: usize) -> Fixture {
        let data_dir = TempDir::new().unwrap();
        let runtime = Arc::new(FakeRuntime::new());
        let db = Arc::new(Database::open_in_memory().unwrap());
        let mut config = Configuration::default_for_tests(data_dir.path().to_path_buf());
        config.lifecycle.warm_pool_enabled = true;
        config.lifecycle.warm_pool_size = size;
        let config = Arc::new(config);
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
            engine,
            events,
            counters,
        ));
        let pool = WarmPool::new(runtime.clone(), db.clone(), config.clone(), manager.clone());
        Fixture {
            pool,
            manager,
            runtime,
            db,
            config,
            _data_dir: data_dir,
        }
    }

    #[tokio::test]
    async fn test_sweep_tops_up_to_target() {
        let fx = fixture(2);
        fx.pool.sweep().await;

        let image = &fx.config.policy.default_image;
        assert_eq!(fx.db.containers().await.warm_count(image).unwrap(), 2);

        // A second sweep does not overshoot
        fx.pool.sweep().await;
        assert_eq!(fx.db.containers().await.warm_count(image).unwrap(), 2);
    }

    #[tokio::test]
    async fn test_claim_then_sweep_replenishes() {
        let fx = fixture(1);
        fx.pool.sweep().await;
        let image = fx.config.policy.default_image.clone();

        let claimed = fx
            .manager
            .spawn(SpawnRequest {
                image: image.clone(),
                persistent: false,
                alias: Some("w1".into()),
                ttl_seconds: None,
                idempotency_key: None,
            })
            .await
            .unwrap();
        assert!(!claimed.warm);
        assert_eq!(fx.db.containers().await.warm_count(&image).unwrap(), 0);

        fx.pool.sweep().await;
        assert_eq!(fx.db.containers().await.warm_count(&image).unwrap(), 1);

        // The claimed container is untouched by the new sweep
        let row = fx.db.containers().await.get(&claimed.id).unwrap().unwrap();
        assert_eq!(row.status, ContainerStatus::Running);
    }

    #[tokio::test]
    async fn test_unhealthy_member_replaced() {
        let fx = fixture(1);
        fx.pool.sweep().await;
        let image = fx.config.policy.default_image.clone();

        let members = fx.db.containers().await.list_warm(&image).unwrap();
        let member = members[0].clone();
        let member_id = member.id.clone();
        // Stop it behind the pool's back
        fx.runtime
            .stop(member.runtime_id.as_deref().unwrap(), 0)
            .await
            .unwrap();

        fx.pool.sweep().await;

        let old = fx.db.containers().await.get(&member_id).unwrap().unwrap();
        assert_eq!(old.status, ContainerStatus::Stopped);

        let members = fx.db.containers().await.list_warm(&image).unwrap();
        assert_eq!(members.len(), 1);
        assert_ne!(members[0].id, member_id);
    }
}
