//! Container lifecycle manager
//!
//! Enforces lifecycle rules around the runtime adapter and the state
//! store: image policy, alias uniqueness, hardened creation defaults,
//! persistent-vs-transient semantics, and idempotent kill.

pub mod policy;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::config::Configuration;
use crate::database::{ContainerRow, ContainerStatus, Database};
use crate::error::{DaemonError, Result};
use crate::events::{AuditEvent, Counters, EventBus};
use crate::exec::ExecutionEngine;
use crate::runtime::{ContainerRuntime, CreateSpec};
use policy::ImagePolicy;

/// Input for spawning one sandbox.
#[derive(Debug, Clone)]
pub struct SpawnRequest {
    pub image: String,
    pub persistent: bool,
    pub alias: Option<String>,
    pub ttl_seconds: Option<i64>,
    pub idempotency_key: Option<String>,
}

/// Result of an attach.
#[derive(Debug, Clone, Serialize)]
pub struct AttachOutcome {
    pub container_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
    pub roots: Vec<String>,
}

pub struct ContainerManager {
    runtime: Arc<dyn ContainerRuntime>,
    db: Arc<Database>,
    config: Arc<Configuration>,
    engine: Arc<ExecutionEngine>,
    policy: ImagePolicy,
    events: EventBus,
    counters: Arc<Counters>,
    rewarm: Arc<Notify>,
}

impl ContainerManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        db: Arc<Database>,
        config: Arc<Configuration>,
        engine: Arc<ExecutionEngine>,
        events: EventBus,
        counters: Arc<Counters>,
    ) -> Self {
        let policy = ImagePolicy::from_config(&config.policy);
        Self {
            runtime,
            db,
            config,
            engine,
            policy,
            events,
            counters,
            rewarm: Arc::new(Notify::new()),
        }
    }

    /// Notified whenever a warm container is claimed, so the pool can
    /// replace it without waiting for its next sweep.
    pub fn rewarm_notify(&self) -> Arc<Notify> {
        self.rewarm.clone()
    }

    /// Host directory bind-mounted as this container's workspace.
    pub fn workspace_root(&self, row: &ContainerRow) -> PathBuf {
        self.config.system.data_directory.join(&row.workspace_dir)
    }

    /// Provision a sandbox: validate policy, try a warm claim, otherwise
    /// cold-spawn with hardened defaults.
    pub async fn spawn(&self, req: SpawnRequest) -> Result<ContainerRow> {
        let image = self.policy.validate(&req.image)?;
        if let Some(alias) = &req.alias {
            validate_alias(alias)?;
        }

        let now = chrono::Utc::now().timestamp();
        let container_id = new_container_id();

        // Claim the idempotency key before any side effect; racing
        // spawns with the same key converge on the winner's container
        // without the losers touching the warm pool or the runtime.
        let claimed = match &req.idempotency_key {
            Some(key) => match self.db.idempotency().await.claim(key, &container_id, now)? {
                crate::database::ClaimOutcome::Claimed => true,
                crate::database::ClaimOutcome::Existing(existing) => {
                    return self.existing_container(key, existing).await;
                }
            },
            None => false,
        };

        let result = self.spawn_claimed(&req, &image, &container_id, now).await;
        if result.is_err() && claimed {
            // Free the key so a retry is not pinned to this failure
            if let Some(key) = &req.idempotency_key {
                if let Err(e) = self.db.idempotency().await.release(key, &container_id) {
                    warn!(%key, "failed to release idempotency claim: {}", e);
                }
            }
        }
        result
    }

    /// The side-effecting part of [`spawn`], entered with the
    /// idempotency key (if any) already claimed for `container_id`.
    async fn spawn_claimed(
        &self,
        req: &SpawnRequest,
        image: &str,
        container_id: &str,
        now: i64,
    ) -> Result<ContainerRow> {
        // Warm claim short-circuits the cold path
        if self.config.lifecycle.warm_pool_enabled && image == self.config.policy.default_image {
            let claimed = self.db.containers().await.claim_warm(
                image,
                req.alias.as_deref(),
                req.persistent,
                req.ttl_seconds,
                now,
            )?;
            if let Some(row) = claimed {
                // The key was claimed for the reserved id; point it at
                // the pool member that actually fulfilled the spawn
                if let Some(key) = &req.idempotency_key {
                    self.db.idempotency().await.reassign(key, container_id, &row.id)?;
                }
                self.rewarm.notify_one();
                Counters::incr(&self.counters.warm_claims);
                Counters::incr(&self.counters.containers_spawned);
                self.events.publish(AuditEvent::ContainerSpawned {
                    container_id: row.id.clone(),
                    image: image.to_string(),
                    persistent: req.persistent,
                    from_warm_pool: true,
                });
                info!(container_id = %row.id, "spawn fulfilled from warm pool");
                return Ok(row);
            }
        }

        let row = self
            .cold_spawn(
                container_id.to_string(),
                image,
                req.persistent,
                req.alias.clone(),
                req.ttl_seconds,
                false,
                now,
            )
            .await?;

        Counters::incr(&self.counters.containers_spawned);
        self.events.publish(AuditEvent::ContainerSpawned {
            container_id: row.id.clone(),
            image: image.to_string(),
            persistent: req.persistent,
            from_warm_pool: false,
        });
        Ok(row)
    }

    /// Resolve another caller's claim to its container row. The winner
    /// may still be between claiming and reserving (or reassigning to a
    /// warm member), so the wait re-reads the claim each round; a claim
    /// that disappears means the winner failed and released it.
    async fn existing_container(&self, key: &str, mut container_id: String) -> Result<ContainerRow> {
        for _ in 0..50 {
            {
                let containers = self.db.containers().await;
                if let Some(row) = containers.get(&container_id)? {
                    return Ok(row);
                }
            }
            let now = chrono::Utc::now().timestamp();
            match self.db.idempotency().await.lookup(key, now)? {
                Some(current) => container_id = current,
                None => {
                    return Err(DaemonError::Runtime(
                        "a concurrent request with this idempotency key failed; retry".into(),
                    ))
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        }
        Err(DaemonError::NotFound(format!("container {}", container_id)))
    }

    /// Create a warm-pool member of the default image.
    pub async fn spawn_warm(&self) -> Result<ContainerRow> {
        let image = self.config.policy.default_image.clone();
        let now = chrono::Utc::now().timestamp();
        self.cold_spawn(new_container_id(), &image, false, None, None, true, now)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn cold_spawn(
        &self,
        id: String,
        image: &str,
        persistent: bool,
        alias: Option<String>,
        ttl_seconds: Option<i64>,
        warm: bool,
        now: i64,
    ) -> Result<ContainerRow> {
        // Reserve the row (and the alias) before touching the runtime
        let row = ContainerRow {
            id: id.clone(),
            runtime_id: None,
            alias,
            image: image.to_string(),
            persistent,
            warm,
            status: ContainerStatus::Creating,
            ttl_seconds,
            workspace_dir: id.clone(),
            created_at: now,
            last_seen_at: now,
        };
        self.db.containers().await.insert(&row)?;

        let workspace_source = self.config.system.data_directory.join(&id);
        if let Err(e) = tokio::fs::create_dir_all(&workspace_source).await {
            self.db
                .containers()
                .await
                .set_status(&id, ContainerStatus::Error, now)?;
            return Err(DaemonError::internal(e));
        }

        let spec = CreateSpec {
            name: format!("devbench-{}", id),
            image: image.to_string(),
            container_id: id.clone(),
            persistent,
            warm,
            workspace_source: workspace_source.clone(),
            workspace_target: self.config.system.workspace_mount_path.clone(),
            network_mode: self.config.docker.network_mode.clone(),
            memory_limit_bytes: self.config.execution.memory_limit_bytes,
            cpus: self.config.execution.cpus,
            pids_limit: self.config.execution.pids_limit,
        };

        let runtime_id = match self.runtime.create(&spec).await {
            Ok(runtime_id) => runtime_id,
            Err(e) => {
                self.abort_spawn(&id, &workspace_source, None, now).await;
                return Err(e.into());
            }
        };

        if let Err(e) = self.runtime.start(&runtime_id).await {
            self.abort_spawn(&id, &workspace_source, Some(&runtime_id), now)
                .await;
            return Err(e.into());
        }

        self.db
            .containers()
            .await
            .set_running(&id, &runtime_id, now)?;

        let row = self
            .db
            .containers()
            .await
            .get(&id)?
            .ok_or_else(|| DaemonError::internal("spawned container row vanished"))?;
        info!(container_id = %id, image, persistent, warm, "container running");
        Ok(row)
    }

    /// Best-effort rollback of a failed spawn: remove runtime side
    /// effects and the workspace directory, then mark the row.
    async fn abort_spawn(
        &self,
        id: &str,
        workspace_source: &std::path::Path,
        runtime_id: Option<&str>,
        now: i64,
    ) {
        if let Some(runtime_id) = runtime_id {
            if let Err(e) = self.runtime.remove(runtime_id, true).await {
                warn!(container_id = %id, "failed to remove runtime container after spawn failure: {}", e);
            }
        }
        let _ = tokio::fs::remove_dir_all(workspace_source).await;
        if let Err(e) = self
            .db
            .containers()
            .await
            .set_status(id, ContainerStatus::Error, now)
        {
            warn!(container_id = %id, "failed to mark container errored: {}", e);
        }
    }

    /// Resolve an id or alias to a live container.
    pub async fn resolve(&self, target: &str) -> Result<ContainerRow> {
        self.db
            .containers()
            .await
            .resolve(target)?
            .ok_or_else(|| DaemonError::NotFound(format!("container {}", target)))
    }

    /// Record a client session against a container.
    pub async fn attach(
        &self,
        target: &str,
        client_name: &str,
        session_id: &str,
    ) -> Result<AttachOutcome> {
        let row = self.resolve(target).await?;
        let now = chrono::Utc::now().timestamp();

        self.db
            .attachments()
            .await
            .insert(&row.id, client_name, session_id, now)?;

        self.events.publish(AuditEvent::ClientAttached {
            container_id: row.id.clone(),
            client_name: client_name.to_string(),
        });

        Ok(AttachOutcome {
            roots: vec![format!("workspace:{}", row.id)],
            container_id: row.id,
            alias: row.alias,
        })
    }

    /// End a recorded session.
    pub async fn detach(&self, target: &str, session_id: &str) -> Result<usize> {
        let row = self.resolve(target).await?;
        let now = chrono::Utc::now().timestamp();
        Ok(self.db.attachments().await.detach(&row.id, session_id, now)?)
    }

    /// Stop and remove a container. Idempotent: killing an already
    /// stopped container reports `stopped` without error.
    pub async fn kill(&self, target: &str, force: bool) -> Result<ContainerStatus> {
        let row = match self.lookup_any(target).await? {
            Some(row) => row,
            None => return Err(DaemonError::NotFound(format!("container {}", target))),
        };

        if row.status.is_terminal() {
            return Ok(row.status);
        }

        let now = chrono::Utc::now().timestamp();
        let cancelled = self.engine.cancel_all_for(&row.id);
        if cancelled > 0 {
            info!(container_id = %row.id, cancelled, "cancelled executions before kill");
        }

        self.db
            .containers()
            .await
            .set_status(&row.id, ContainerStatus::Stopping, now)?;

        if let Some(runtime_id) = &row.runtime_id {
            let stop_timeout = if force { 0 } else { 10 };
            if let Err(e) = self.runtime.stop(runtime_id, stop_timeout).await {
                warn!(container_id = %row.id, "stop failed, removing anyway: {}", e);
            }
            self.runtime.remove(runtime_id, true).await?;
        }

        if !row.persistent {
            let _ = tokio::fs::remove_dir_all(self.workspace_root(&row)).await;
        }

        self.db.attachments().await.detach_all_for(&row.id, now)?;
        self.engine.release_container(&row.id);
        self.db
            .containers()
            .await
            .set_status(&row.id, ContainerStatus::Stopped, now)?;

        Counters::incr(&self.counters.containers_killed);
        self.events.publish(AuditEvent::ContainerKilled {
            container_id: row.id.clone(),
            force,
        });
        info!(container_id = %row.id, force, "container killed");

        Ok(ContainerStatus::Stopped)
    }

    /// Look up by id or alias without filtering terminal rows.
    async fn lookup_any(&self, target: &str) -> Result<Option<ContainerRow>> {
        let containers = self.db.containers().await;
        if let Some(row) = containers.get(target)? {
            return Ok(Some(row));
        }
        Ok(containers.get_by_alias(target)?)
    }

    pub async fn list(&self, include_terminal: bool) -> Result<Vec<ContainerRow>> {
        Ok(self.db.containers().await.list(include_terminal)?)
    }
}

fn new_container_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("c_{}", &id[..12])
}

fn validate_alias(alias: &str) -> Result<()> {
    let ok = !alias.is_empty()
        && alias.len() <= 63
        && alias
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
        && !alias.starts_with('.');
    if ok {
        Ok(())
    } else {
        Err(DaemonError::InvalidRequest(format!(
            "alias '{}' is not valid",
            alias
        )))
    }
}
