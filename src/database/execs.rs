//! Execution row persistence

use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::Serialize;

use super::{DatabaseError, DatabaseResult};

/// Execution status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecState {
    Queued,
    Running,
    Cancelling,
    Exited,
    TimedOut,
    Cancelled,
    Failed,
}

impl ExecState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecState::Queued => "queued",
            ExecState::Running => "running",
            ExecState::Cancelling => "cancelling",
            ExecState::Exited => "exited",
            ExecState::TimedOut => "timed_out",
            ExecState::Cancelled => "cancelled",
            ExecState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "queued" => Some(ExecState::Queued),
            "running" => Some(ExecState::Running),
            "cancelling" => Some(ExecState::Cancelling),
            "exited" => Some(ExecState::Exited),
            "timed_out" => Some(ExecState::TimedOut),
            "cancelled" => Some(ExecState::Cancelled),
            "failed" => Some(ExecState::Failed),
            _ => None,
        }
    }

    /// Terminal states are absorbing.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ExecState::Exited | ExecState::TimedOut | ExecState::Cancelled | ExecState::Failed
        )
    }

    /// Legal transitions of the execution state machine:
    ///
    /// ```text
    /// queued -> running -> {exited | timed_out | cancelled | failed}
    /// running -> cancelling -> {cancelled | exited}
    /// ```
    pub fn can_transition(&self, to: ExecState) -> bool {
        match (self, to) {
            (ExecState::Queued, ExecState::Running) => true,
            (ExecState::Queued, ExecState::Failed) => true,
            (ExecState::Running, s) if s.is_terminal() => true,
            (ExecState::Running, ExecState::Cancelling) => true,
            (ExecState::Cancelling, ExecState::Cancelled) => true,
            (ExecState::Cancelling, ExecState::Exited) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for ExecState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Resource usage reported with the terminal frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecUsage {
    pub cpu_ms: u64,
    pub mem_peak_bytes: u64,
    pub wall_ms: u64,
    pub timed_out: bool,
}

/// Execution record. `env` is intentionally absent: it is never
/// persisted or logged.
#[derive(Debug, Clone, Serialize)]
pub struct ExecRow {
    pub id: String,
    pub container_id: String,
    pub argv: Vec<String>,
    pub cwd: Option<String>,
    pub as_root: bool,
    pub timeout_seconds: i64,
    pub status: ExecState,
    pub exit_code: Option<i64>,
    pub usage: Option<ExecUsage>,
    pub failure_reason: Option<String>,
    pub started_at: i64,
    pub ended_at: Option<i64>,
}

const COLUMNS: &str = "id, container_id, argv, cwd, as_root, timeout_seconds, status, \
                       exit_code, cpu_ms, mem_peak_bytes, wall_ms, timed_out, \
                       failure_reason, started_at, ended_at";

fn row_to_exec(row: &Row) -> rusqlite::Result<ExecRow> {
    let status: String = row.get(6)?;
    let status = ExecState::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            6,
            rusqlite::types::Type::Text,
            format!("unknown exec status '{}'", status).into(),
        )
    })?;

    let argv: String = row.get(2)?;
    let argv: Vec<String> = serde_json::from_str(&argv).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;

    let ended_at: Option<i64> = row.get(14)?;
    let usage = if ended_at.is_some() && status.is_terminal() {
        Some(ExecUsage {
            cpu_ms: row.get::<_, Option<i64>>(8)?.unwrap_or(0) as u64,
            mem_peak_bytes: row.get::<_, Option<i64>>(9)?.unwrap_or(0) as u64,
            wall_ms: row.get::<_, Option<i64>>(10)?.unwrap_or(0) as u64,
            timed_out: row.get::<_, i64>(11)? != 0,
        })
    } else {
        None
    };

    Ok(ExecRow {
        id: row.get(0)?,
        container_id: row.get(1)?,
        argv,
        cwd: row.get(3)?,
        as_root: row.get::<_, i64>(4)? != 0,
        timeout_seconds: row.get(5)?,
        status,
        exit_code: row.get(7)?,
        usage,
        failure_reason: row.get(12)?,
        started_at: row.get(13)?,
        ended_at,
    })
}

/// Store for execution rows
pub struct ExecStore;

impl ExecStore {
    pub fn new() -> Self {
        Self
    }

    pub fn insert(&self, conn: &Connection, row: &ExecRow) -> DatabaseResult<()> {
        let argv = serde_json::to_string(&row.argv)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
        conn.execute(
            &format!(
                "INSERT INTO execs ({COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)"
            ),
            params![
                row.id,
                row.container_id,
                argv,
                row.cwd,
                row.as_root as i64,
                row.timeout_seconds,
                row.status.as_str(),
                row.exit_code,
                row.usage.map(|u| u.cpu_ms as i64),
                row.usage.map(|u| u.mem_peak_bytes as i64),
                row.usage.map(|u| u.wall_ms as i64),
                row.usage.map(|u| u.timed_out as i64).unwrap_or(0),
                row.failure_reason,
                row.started_at,
                row.ended_at,
            ],
        )?;
        Ok(())
    }

    pub fn get(&self, conn: &Connection, id: &str) -> DatabaseResult<Option<ExecRow>> {
        conn.query_row(
            &format!("SELECT {COLUMNS} FROM execs WHERE id = ?1"),
            [id],
            row_to_exec,
        )
        .optional()
        .map_err(Into::into)
    }

    pub fn list(
        &self,
        conn: &Connection,
        container_id: Option<&str>,
        status: Option<ExecState>,
    ) -> DatabaseResult<Vec<ExecRow>> {
        let mut sql = format!("SELECT {COLUMNS} FROM execs WHERE 1=1");
        let mut args: Vec<String> = Vec::new();
        if let Some(cid) = container_id {
            sql.push_str(" AND container_id = ?");
            args.push(cid.to_string());
        }
        if let Some(status) = status {
            sql.push_str(" AND status = ?");
            args.push(status.as_str().to_string());
        }
        sql.push_str(" ORDER BY started_at");

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt
            .query_map(rusqlite::params_from_iter(args), row_to_exec)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Move a running exec to `cancelling`. Returns false when the exec
    /// already left the running state (the transition is rejected).
    pub fn set_cancelling(&self, conn: &Connection, id: &str) -> DatabaseResult<bool> {
        let n = conn.execute(
            "UPDATE execs SET status = 'cancelling' WHERE id = ?1 AND status = 'running'",
            [id],
        )?;
        Ok(n == 1)
    }

    /// Terminal transition: status, exit code, end time and usage land in
    /// one statement, guarded so a terminal row is never updated again.
    pub fn finish(
        &self,
        conn: &Connection,
        id: &str,
        status: ExecState,
        exit_code: Option<i64>,
        usage: ExecUsage,
        failure_reason: Option<&str>,
        now: i64,
    ) -> DatabaseResult<bool> {
        if !status.is_terminal() {
            return Err(DatabaseError::Other(format!(
                "'{}' is not a terminal exec status",
                status
            )));
        }

        let n = conn.execute(
            "UPDATE execs \
             SET status = ?2, exit_code = ?3, cpu_ms = ?4, mem_peak_bytes = ?5, \
                 wall_ms = ?6, timed_out = ?7, failure_reason = ?8, ended_at = ?9 \
             WHERE id = ?1 AND status IN ('queued', 'running', 'cancelling')",
            params![
                id,
                status.as_str(),
                exit_code,
                usage.cpu_ms as i64,
                usage.mem_peak_bytes as i64,
                usage.wall_ms as i64,
                usage.timed_out as i64,
                failure_reason,
                now,
            ],
        )?;
        Ok(n == 1)
    }

    /// Mark every non-terminal exec failed; used by boot reconciliation.
    pub fn fail_all_live(&self, conn: &Connection, reason: &str, now: i64) -> DatabaseResult<usize> {
        let n = conn.execute(
            "UPDATE execs \
             SET status = 'failed', failure_reason = ?1, ended_at = ?2 \
             WHERE status IN ('queued', 'running', 'cancelling')",
            params![reason, now],
        )?;
        Ok(n)
    }

    pub fn count_running_for(&self, conn: &Connection, container_id: &str) -> DatabaseResult<i64> {
        conn.query_row(
            "SELECT COUNT(*) FROM execs \
             WHERE container_id = ?1 AND status IN ('running', 'cancelling')",
            [container_id],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    /// Delete terminal rows that ended before the cutoff.
    pub fn purge_terminal_older_than(&self, conn: &Connection, cutoff: i64) -> DatabaseResult<usize> {
        let n = conn.execute(
            "DELETE FROM execs \
             WHERE status IN ('exited', 'timed_out', 'cancelled', 'failed') \
               AND ended_at IS NOT NULL AND ended_at < ?1",
            [cutoff],
        )?;
        Ok(n)
    }
}

impl Default for ExecStore {
    fn default() -> Self {
        Self::new()
    }
}
