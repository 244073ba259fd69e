//! State persistence module
//!
//! SQLite-backed system of record for containers, attachments, executions
//! and idempotency keys. The database, not the runtime, decides which
//! containers belong to the daemon.

mod attachments;
mod containers;
mod execs;
mod idempotency;

pub use attachments::{AttachmentRow, AttachmentStore};
pub use containers::{ContainerRow, ContainerStatus, ContainerStore};
pub use execs::{ExecRow, ExecState, ExecStore, ExecUsage};
pub use idempotency::{ClaimOutcome, IdempotencyStore, IDEMPOTENCY_TTL_SECONDS};

use std::path::Path;

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::info;

/// Current schema version; migrations run to completion before the
/// server accepts work.
const SCHEMA_VERSION: i64 = 1;

/// Database errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Other(String),
}

pub type DatabaseResult<T> = Result<T, DatabaseError>;

/// Map a unique-index violation to a conflict carrying `what`; other
/// SQLite errors pass through unchanged.
pub(crate) fn constraint_to_conflict(e: rusqlite::Error, what: impl Into<String>) -> DatabaseError {
    match &e {
        rusqlite::Error::SqliteFailure(err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            DatabaseError::Conflict(what.into())
        }
        _ => DatabaseError::Sqlite(e),
    }
}

/// Main database wrapper. One connection behind an async mutex: every
/// mutation is a single transaction with a single writer per row.
pub struct Database {
    conn: Mutex<Connection>,
    containers: ContainerStore,
    execs: ExecStore,
    attachments: AttachmentStore,
    idempotency: IdempotencyStore,
}

impl Database {
    /// Open or create the database
    pub fn open(path: impl AsRef<Path>) -> DatabaseResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        Self::migrate(&conn)?;

        info!("Database opened at {:?}", path);
        Ok(Self::wrap(conn))
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> DatabaseResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self::wrap(conn))
    }

    fn wrap(conn: Connection) -> Self {
        Self {
            conn: Mutex::new(conn),
            containers: ContainerStore::new(),
            execs: ExecStore::new(),
            attachments: AttachmentStore::new(),
            idempotency: IdempotencyStore::new(),
        }
    }

    fn migrate(conn: &Connection) -> DatabaseResult<()> {
        conn.execute_batch("CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)")?;

        let version: i64 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

        if version < 1 {
            conn.execute_batch(
                r#"
                BEGIN;

                CREATE TABLE containers (
                    id TEXT PRIMARY KEY,
                    runtime_id TEXT,
                    alias TEXT,
                    image TEXT NOT NULL,
                    persistent INTEGER NOT NULL DEFAULT 0,
                    warm INTEGER NOT NULL DEFAULT 0,
                    status TEXT NOT NULL,
                    ttl_seconds INTEGER,
                    workspace_dir TEXT NOT NULL,
                    created_at INTEGER NOT NULL,
                    last_seen_at INTEGER NOT NULL
                );

                -- Aliases are unique among non-terminal containers only
                CREATE UNIQUE INDEX idx_containers_alias
                    ON containers(alias)
                    WHERE alias IS NOT NULL AND status NOT IN ('stopped', 'error');

                CREATE INDEX idx_containers_last_seen ON containers(last_seen_at);

                CREATE TABLE attachments (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    container_id TEXT NOT NULL,
                    client_name TEXT NOT NULL,
                    session_id TEXT NOT NULL,
                    attached_at INTEGER NOT NULL,
                    detached_at INTEGER
                );

                CREATE INDEX idx_attachments_container ON attachments(container_id);

                CREATE TABLE execs (
                    id TEXT PRIMARY KEY,
                    container_id TEXT NOT NULL,
                    argv TEXT NOT NULL,
                    cwd TEXT,
                    as_root INTEGER NOT NULL DEFAULT 0,
                    timeout_seconds INTEGER NOT NULL,
                    status TEXT NOT NULL,
                    exit_code INTEGER,
                    cpu_ms INTEGER,
                    mem_peak_bytes INTEGER,
                    wall_ms INTEGER,
                    timed_out INTEGER NOT NULL DEFAULT 0,
                    failure_reason TEXT,
                    started_at INTEGER NOT NULL,
                    ended_at INTEGER
                );

                CREATE INDEX idx_execs_container_status ON execs(container_id, status);

                CREATE TABLE idempotency_keys (
                    key TEXT PRIMARY KEY,
                    entity_id TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );

                INSERT INTO schema_version (version) VALUES (1);

                COMMIT;
                "#,
            )?;
            info!("Applied schema migration to version {}", SCHEMA_VERSION);
        }

        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn migrate_for_tests(conn: &Connection) {
        Self::migrate(conn).expect("migration failed");
    }

    /// Get container store with connection
    pub async fn containers(&self) -> ContainerStoreWithConn<'_> {
        ContainerStoreWithConn {
            conn: self.conn.lock().await,
            store: &self.containers,
        }
    }

    /// Get exec store with connection
    pub async fn execs(&self) -> ExecStoreWithConn<'_> {
        ExecStoreWithConn {
            conn: self.conn.lock().await,
            store: &self.execs,
        }
    }

    /// Get attachment store with connection
    pub async fn attachments(&self) -> AttachmentStoreWithConn<'_> {
        AttachmentStoreWithConn {
            conn: self.conn.lock().await,
            store: &self.attachments,
        }
    }

    /// Get idempotency store with connection
    pub async fn idempotency(&self) -> IdempotencyStoreWithConn<'_> {
        IdempotencyStoreWithConn {
            conn: self.conn.lock().await,
            store: &self.idempotency,
        }
    }

    /// Reclaim space after purges.
    pub async fn vacuum(&self) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch("VACUUM")?;
        Ok(())
    }

    /// Flush the write-ahead log; called on shutdown.
    pub async fn checkpoint(&self) -> DatabaseResult<()> {
        let conn = self.conn.lock().await;
        conn.execute_batch("PRAGMA wal_checkpoint(TRUNCATE)")?;
        Ok(())
    }
}

/// Container store with active connection
pub struct ContainerStoreWithConn<'a> {
    conn: tokio::sync::MutexGuard<'a, Connection>,
    store: &'a ContainerStore,
}

impl<'a> ContainerStoreWithConn<'a> {
    pub fn insert(&self, row: &ContainerRow) -> DatabaseResult<()> {
        self.store.insert(&self.conn, row)
    }

    pub fn get(&self, id: &str) -> DatabaseResult<Option<ContainerRow>> {
        self.store.get(&self.conn, id)
    }

    pub fn get_by_alias(&self, alias: &str) -> DatabaseResult<Option<ContainerRow>> {
        self.store.get_by_alias(&self.conn, alias)
    }

    pub fn resolve(&self, target: &str) -> DatabaseResult<Option<ContainerRow>> {
        self.store.resolve(&self.conn, target)
    }

    pub fn set_running(&self, id: &str, runtime_id: &str, now: i64) -> DatabaseResult<()> {
        self.store.set_running(&self.conn, id, runtime_id, now)
    }

    pub fn set_status(&self, id: &str, status: ContainerStatus, now: i64) -> DatabaseResult<()> {
        self.store.set_status(&self.conn, id, status, now)
    }

    pub fn touch(&self, id: &str, now: i64) -> DatabaseResult<()> {
        self.store.touch(&self.conn, id, now)
    }

    pub fn claim_warm(
        &self,
        image: &str,
        alias: Option<&str>,
        persistent: bool,
        ttl_seconds: Option<i64>,
        now: i64,
    ) -> DatabaseResult<Option<ContainerRow>> {
        self.store
            .claim_warm(&self.conn, image, alias, persistent, ttl_seconds, now)
    }

    pub fn list(&self, include_terminal: bool) -> DatabaseResult<Vec<ContainerRow>> {
        self.store.list(&self.conn, include_terminal)
    }

    pub fn warm_count(&self, image: &str) -> DatabaseResult<i64> {
        self.store.warm_count(&self.conn, image)
    }

    pub fn list_warm(&self, image: &str) -> DatabaseResult<Vec<ContainerRow>> {
        self.store.list_warm(&self.conn, image)
    }

    pub fn delete(&self, id: &str) -> DatabaseResult<()> {
        self.store.delete(&self.conn, id)
    }

    pub fn purge_terminal_transients(&self, cutoff: i64) -> DatabaseResult<usize> {
        self.store.purge_terminal_transients(&self.conn, cutoff)
    }

    pub fn expired_running_transients(&self, now: i64) -> DatabaseResult<Vec<ContainerRow>> {
        self.store.expired_running_transients(&self.conn, now)
    }
}

/// Exec store with active connection
pub struct ExecStoreWithConn<'a> {
    conn: tokio::sync::MutexGuard<'a, Connection>,
    store: &'a ExecStore,
}

impl<'a> ExecStoreWithConn<'a> {
    pub fn insert(&self, row: &ExecRow) -> DatabaseResult<()> {
        self.store.insert(&self.conn, row)
    }

    pub fn get(&self, id: &str) -> DatabaseResult<Option<ExecRow>> {
        self.store.get(&self.conn, id)
    }

    pub fn list(
        &self,
        container_id: Option<&str>,
        status: Option<ExecState>,
    ) -> DatabaseResult<Vec<ExecRow>> {
        self.store.list(&self.conn, container_id, status)
    }

    pub fn set_cancelling(&self, id: &str) -> DatabaseResult<bool> {
        self.store.set_cancelling(&self.conn, id)
    }

    #[allow(clippy::too_many_arguments)]
    pub fn finish(
        &self,
        id: &str,
        status: ExecState,
        exit_code: Option<i64>,
        usage: ExecUsage,
        failure_reason: Option<&str>,
        now: i64,
    ) -> DatabaseResult<bool> {
        self.store
            .finish(&self.conn, id, status, exit_code, usage, failure_reason, now)
    }

    pub fn fail_all_live(&self, reason: &str, now: i64) -> DatabaseResult<usize> {
        self.store.fail_all_live(&self.conn, reason, now)
    }

    pub fn count_running_for(&self, container_id: &str) -> DatabaseResult<i64> {
        self.store.count_running_for(&self.conn, container_id)
    }

    pub fn purge_terminal_older_than(&self, cutoff: i64) -> DatabaseResult<usize> {
        self.store.purge_terminal_older_than(&self.conn, cutoff)
    }
}

/// Attachment store with active connection
pub struct AttachmentStoreWithConn<'a> {
    conn: tokio::sync::MutexGuard<'a, Connection>,
    store: &'a AttachmentStore,
}

impl<'a> AttachmentStoreWithConn<'a> {
    pub fn insert(
        &self,
        container_id: &str,
        client_name: &str,
        session_id: &str,
        now: i64,
    ) -> DatabaseResult<i64> {
        self.store
            .insert(&self.conn, container_id, client_name, session_id, now)
    }

    pub fn detach(&self, container_id: &str, session_id: &str, now: i64) -> DatabaseResult<usize> {
        self.store.detach(&self.conn, container_id, session_id, now)
    }

    pub fn detach_all_for(&self, container_id: &str, now: i64) -> DatabaseResult<usize> {
        self.store.detach_all_for(&self.conn, container_id, now)
    }

    pub fn detach_everything(&self, now: i64) -> DatabaseResult<usize> {
        self.store.detach_everything(&self.conn, now)
    }

    pub fn active_for(&self, container_id: &str) -> DatabaseResult<Vec<AttachmentRow>> {
        self.store.active_for(&self.conn, container_id)
    }
}

/// Idempotency store with active connection
pub struct IdempotencyStoreWithConn<'a> {
    conn: tokio::sync::MutexGuard<'a, Connection>,
    store: &'a IdempotencyStore,
}

impl<'a> IdempotencyStoreWithConn<'a> {
    pub fn lookup(&self, key: &str, now: i64) -> DatabaseResult<Option<String>> {
        self.store.lookup(&self.conn, key, now)
    }

    pub fn claim(&self, key: &str, entity_id: &str, now: i64) -> DatabaseResult<ClaimOutcome> {
        self.store.claim(&self.conn, key, entity_id, now)
    }

    pub fn release(&self, key: &str, entity_id: &str) -> DatabaseResult<()> {
        self.store.release(&self.conn, key, entity_id)
    }

    pub fn reassign(&self, key: &str, from_entity: &str, to_entity: &str) -> DatabaseResult<()> {
        self.store.reassign(&self.conn, key, from_entity, to_entity)
    }

    pub fn purge_expired(&self, now: i64) -> DatabaseResult<usize> {
        self.store.purge_expired(&self.conn, now)
    }
}
