//! Container row persistence

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{constraint_to_conflict, DatabaseResult};

/// Container lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerStatus {
    Creating,
    Running,
    Stopping,
    Stopped,
    Error,
}

impl ContainerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerStatus::Creating => "creating",
            ContainerStatus::Running => "running",
            ContainerStatus::Stopping => "stopping",
            ContainerStatus::Stopped => "stopped",
            ContainerStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "creating" => Some(ContainerStatus::Creating),
            "running" => Some(ContainerStatus::Running),
            "stopping" => Some(ContainerStatus::Stopping),
            "stopped" => Some(ContainerStatus::Stopped),
            "error" => Some(ContainerStatus::Error),
            _ => None,
        }
    }

    /// Terminal containers free their alias and never run again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, ContainerStatus::Stopped | ContainerStatus::Error)
    }
}

impl std::fmt::Display for ContainerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Container record
#[derive(Debug, Clone, Serialize)]
pub struct ContainerRow {
    pub id: String,
    pub runtime_id: Option<String>,
    pub alias: Option<String>,
    pub image: String,
    pub persistent: bool,
    pub warm: bool,
    pub status: ContainerStatus,
    pub ttl_seconds: Option<i64>,
    pub workspace_dir: String,
    pub created_at: i64,
    pub last_seen_at: i64,
}

fn row_to_container(row: &Row) -> rusqlite::Result<ContainerRow> {
    let status: String = row.get(6)?;
    let status = ContainerStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown container status '{}'", status).into(),
        )
    })?;

    Ok(ContainerRow {
        id: row.get(0)?,
        runtime_id: row.get(1)?,
        alias: row.get(2)?,
        image: row.get(3)?,
        persistent: row.get::<_, i64>(4)? != 0,
        warm: row.get::<_, i64>(5)? != 0,
        status,
        ttl_seconds: row.get(7)?,
        workspace_dir: row.get(8)?,
        created_at: row.get(9)?,
        last_seen_at: row.get(10)?,
    })
}

const COLUMNS: &str = "id, runtime_id, alias, image, persistent, warm, status, \
                       ttl_seconds, workspace_dir, created_at, last_seen_at";

/// Store for container rows
pub struct ContainerStore;

impl ContainerStore {
    pub fn new() -> Self {
        Self
    }

    /// Insert a new row. Alias collisions among non-terminal containers
    /// surface as a conflict.
    pub fn insert(&self, conn: &Connection, row: &ContainerRow) -> DatabaseResult<()> {
        conn.execute(
            &format!("INSERT INTO containers ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)"),
            params![
                row.id,
                row.runtime_id,
                row.alias,
                row.image,
                row.persistent as i64,
                row.warm as i64,
                row.status.as_str(),
                row.ttl_seconds,
                row.workspace_dir,
                row.created_at,
                row.last_seen_at,
            ],
        )
        .map_err(|e| {
            constraint_to_conflict(
                e,
                match &row.alias {
                    Some(alias) => format!("alias '{}' is already in use", alias),
                    None => format!("container '{}' already exists", row.id),
                },
            )
        })?;
        Ok(())
    }

    pub fn get(&self, conn: &Connection, id: &str) -> DatabaseResult<Option<ContainerRow>> {
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM containers WHERE id = ?1"),
            [id],
            row_to_container,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Look up a non-terminal container by alias.
    pub fn get_by_alias(&self, conn: &Connection, alias: &str) -> DatabaseResult<Option<ContainerRow>> {
        conn.query_row(
            &format!(
                "SELECT {COLUMNS} FROM containers \
                 WHERE alias = ?1 AND status NOT IN ('stopped', 'error')"
            ),
            [alias],
            row_to_container,
        )
        .optional()
        .map_err(Into::into)
    }

    /// Resolve an id or alias to a non-terminal container.
    pub fn resolve(&self, conn: &Connection, target: &str) -> DatabaseResult<Option<ContainerRow>> {
        if let Some(row) = self.get(conn, target)? {
            if !row.status.is_terminal() {
                return Ok(Some(row));
            }
            return Ok(None);
        }
        self.get_by_alias(conn, target)
    }

    /// Record the runtime id and move to `running`.
    pub fn set_running(
        &self,
        conn: &Connection,
        id: &str,
        runtime_id: &str,
        now: i64,
    ) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE containers SET runtime_id = ?2, status = 'running', last_seen_at = ?3 \
             WHERE id = ?1",
            params![id, runtime_id, now],
        )?;
        Ok(())
    }

    pub fn set_status(
        &self,
        conn: &Connection,
        id: &str,
        status: ContainerStatus,
        now: i64,
    ) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE containers SET status = ?2, last_seen_at = ?3 WHERE id = ?1",
            params![id, status.as_str(), now],
        )?;
        Ok(())
    }

    pub fn touch(&self, conn: &Connection, id: &str, now: i64) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE containers SET last_seen_at = ?2 WHERE id = ?1",
            params![id, now],
        )?;
        Ok(())
    }

    /// Atomically claim one warm container of the given image: flips
    /// `warm` off and installs the caller's alias/persistence, guarded by
    /// the `warm = 1` predicate so two spawns cannot claim the same row.
    pub fn claim_warm(
        &self,
        conn: &Connection,
        image: &str,
        alias: Option<&str>,
        persistent: bool,
        ttl_seconds: Option<i64>,
        now: i64,
    ) -> DatabaseResult<Option<ContainerRow>> {
        let claimed: Option<String> = conn
            .query_row(
                "UPDATE containers \
                 SET warm = 0, alias = ?2, persistent = ?3, ttl_seconds = ?4, last_seen_at = ?5 \
                 WHERE id = (SELECT id FROM containers \
                             WHERE warm = 1 AND status = 'running' AND image = ?1 \
                             ORDER BY created_at LIMIT 1) \
                   AND warm = 1 \
                 RETURNING id",
                params![image, alias, persistent as i64, ttl_seconds, now],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| {
                constraint_to_conflict(
                    e,
                    format!("alias '{}' is already in use", alias.unwrap_or_default()),
                )
            })?;

        match claimed {
            Some(id) => self.get(conn, &id),
            None => Ok(None),
        }
    }

    pub fn list(&self, conn: &Connection, include_terminal: bool) -> DatabaseResult<Vec<ContainerRow>> {
        let sql = if include_terminal {
            format!("SELECT {COLUMNS} FROM containers ORDER BY created_at")
        } else {
            format!(
                "SELECT {COLUMNS} FROM containers \
                 WHERE status NOT IN ('stopped', 'error') ORDER BY created_at"
            )
        };
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map([], row_to_container)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Count live warm containers of the given image.
    pub fn warm_count(&self, conn: &Connection, image: &str) -> DatabaseResult<i64> {
        conn.query_row(
            "SELECT COUNT(*) FROM containers \
             WHERE warm = 1 AND status = 'running' AND image = ?1",
            [image],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    pub fn list_warm(&self, conn: &Connection, image: &str) -> DatabaseResult<Vec<ContainerRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM containers \
             WHERE warm = 1 AND status = 'running' AND image = ?1"
        ))?;
        let rows = stmt
            .query_map([image], row_to_container)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn delete(&self, conn: &Connection, id: &str) -> DatabaseResult<()> {
        conn.execute("DELETE FROM containers WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Delete terminal transient rows not seen since the cutoff.
    pub fn purge_terminal_transients(&self, conn: &Connection, cutoff: i64) -> DatabaseResult<usize> {
        let n = conn.execute(
            "DELETE FROM containers \
             WHERE persistent = 0 AND status IN ('stopped', 'error') AND last_seen_at < ?1",
            [cutoff],
        )?;
        Ok(n)
    }

    /// Running transients whose TTL has elapsed.
    pub fn expired_running_transients(
        &self,
        conn: &Connection,
        now: i64,
    ) -> DatabaseResult<Vec<ContainerRow>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM containers \
             WHERE persistent = 0 AND warm = 0 AND status = 'running' \
               AND ttl_seconds IS NOT NULL AND created_at + ttl_seconds < ?1"
        ))?;
        let rows = stmt
            .query_map([now], row_to_container)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl Default for ContainerStore {
    fn default() -> Self {
        Self::new()
    }
}
