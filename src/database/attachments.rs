//! Attachment row persistence
//!
//! Attachments record client sessions against containers for audit; they
//! do not gate execution. On reboot every attachment is considered
//! detached.

use rusqlite::{params, Connection, Row};
use serde::Serialize;

use super::DatabaseResult;

/// Attachment record
#[derive(Debug, Clone, Serialize)]
pub struct AttachmentRow {
    pub id: i64,
    pub container_id: String,
    pub client_name: String,
    pub session_id: String,
    pub attached_at: i64,
    pub detached_at: Option<i64>,
}

fn row_to_attachment(row: &Row) -> rusqlite::Result<AttachmentRow> {
    Ok(AttachmentRow {
        id: row.get(0)?,
        container_id: row.get(1)?,
        client_name: row.get(2)?,
        session_id: row.get(3)?,
        attached_at: row.get(4)?,
        detached_at: row.get(5)?,
    })
}

/// Store for attachment rows
pub struct AttachmentStore;

impl AttachmentStore {
    pub fn new() -> Self {
        Self
    }

    pub fn insert(
        &self,
        conn: &Connection,
        container_id: &str,
        client_name: &str,
        session_id: &str,
        now: i64,
    ) -> DatabaseResult<i64> {
        conn.execute(
            "INSERT INTO attachments (container_id, client_name, session_id, attached_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![container_id, client_name, session_id, now],
        )?;
        Ok(conn.last_insert_rowid())
    }

    /// Detach one session from a container.
    pub fn detach(
        &self,
        conn: &Connection,
        container_id: &str,
        session_id: &str,
        now: i64,
    ) -> DatabaseResult<usize> {
        let n = conn.execute(
            "UPDATE attachments SET detached_at = ?3 \
             WHERE container_id = ?1 AND session_id = ?2 AND detached_at IS NULL",
            params![container_id, session_id, now],
        )?;
        Ok(n)
    }

    /// Detach every session on a container; used when it is removed.
    pub fn detach_all_for(&self, conn: &Connection, container_id: &str, now: i64) -> DatabaseResult<usize> {
        let n = conn.execute(
            "UPDATE attachments SET detached_at = ?2 \
             WHERE container_id = ?1 AND detached_at IS NULL",
            params![container_id, now],
        )?;
        Ok(n)
    }

    /// Detach everything; used at boot and shutdown.
    pub fn detach_everything(&self, conn: &Connection, now: i64) -> DatabaseResult<usize> {
        let n = conn.execute(
            "UPDATE attachments SET detached_at = ?1 WHERE detached_at IS NULL",
            [now],
        )?;
        Ok(n)
    }

    pub fn active_for(&self, conn: &Connection, container_id: &str) -> DatabaseResult<Vec<AttachmentRow>> {
        let mut stmt = conn.prepare(
            "SELECT id, container_id, client_name, session_id, attached_at, detached_at \
             FROM attachments WHERE container_id = ?1 AND detached_at IS NULL \
             ORDER BY attached_at",
        )?;
        let rows = stmt
            .query_map([container_id], row_to_attachment)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

impl Default for AttachmentStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::Database;

    fn setup() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        Database::migrate_for_tests(&conn);
        conn
    }

    #[test]
    fn test_attach_detach() {
        let conn = setup();
        let store = AttachmentStore::new();

        store.insert(&conn, "c_1", "agent-a", "s_1", 100).unwrap();
        store.insert(&conn, "c_1", "agent-b", "s_2", 101).unwrap();
        assert_eq!(store.active_for(&conn, "c_1").unwrap().len(), 2);

        assert_eq!(store.detach(&conn, "c_1", "s_1", 102).unwrap(), 1);
        assert_eq!(store.active_for(&conn, "c_1").unwrap().len(), 1);

        // Detaching an unknown session is a no-op
        assert_eq!(store.detach(&conn, "c_1", "s_9", 103).unwrap(), 0);
    }

    #[test]
    fn test_detach_everything() {
        let conn = setup();
        let store = AttachmentStore::new();
        store.insert(&conn, "c_1", "agent-a", "s_1", 100).unwrap();
        store.insert(&conn, "c_2", "agent-a", "s_2", 100).unwrap();

        assert_eq!(store.detach_everything(&conn, 200).unwrap(), 2);
        assert!(store.active_for(&conn, "c_1").unwrap().is_empty());
        assert!(store.active_for(&conn, "c_2").unwrap().is_empty());
    }
}
