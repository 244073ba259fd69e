//! Idempotency key persistence
//!
//! A client-supplied key maps to the entity (exec or container) its first
//! use created. Within the TTL the same key always yields the same id.
//! Keys are claimed up front, before any runtime side effect: the claim
//! is a single insert under the connection lock, so exactly one of any
//! set of racing callers wins and the losers learn the winner's id.

use rusqlite::{params, Connection, OptionalExtension};

use super::DatabaseResult;

/// Keys expire 24 hours after first use.
pub const IDEMPOTENCY_TTL_SECONDS: i64 = 24 * 60 * 60;

/// Result of attempting to claim a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now owns the key and must do the work (or release the
    /// claim on failure)
    Claimed,
    /// Another caller holds the key; carry its entity id
    Existing(String),
}

/// Store for idempotency keys
pub struct IdempotencyStore;

impl IdempotencyStore {
    pub fn new() -> Self {
        Self
    }

    /// Return the entity id for an unexpired key.
    pub fn lookup(&self, conn: &Connection, key: &str, now: i64) -> DatabaseResult<Option<String>> {
        let found: Option<(String, i64)> = conn
            .query_row(
                "SELECT entity_id, created_at FROM idempotency_keys WHERE key = ?1",
                [key],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        Ok(found.and_then(|(entity_id, created_at)| {
            (now - created_at <= IDEMPOTENCY_TTL_SECONDS).then_some(entity_id)
        }))
    }

    /// Claim a key for `entity_id` before doing the work it deduplicates.
    /// Expired holders are evicted; otherwise the first writer wins and
    /// later callers get [`ClaimOutcome::Existing`] with the winner's id.
    pub fn claim(
        &self,
        conn: &Connection,
        key: &str,
        entity_id: &str,
        now: i64,
    ) -> DatabaseResult<ClaimOutcome> {
        conn.execute(
            "DELETE FROM idempotency_keys WHERE key = ?1 AND created_at < ?2",
            params![key, now - IDEMPOTENCY_TTL_SECONDS],
        )?;

        let inserted = conn.execute(
            "INSERT INTO idempotency_keys (key, entity_id, created_at) VALUES (?1, ?2, ?3) \
             ON CONFLICT(key) DO NOTHING",
            params![key, entity_id, now],
        )?;
        if inserted == 1 {
            return Ok(ClaimOutcome::Claimed);
        }

        let existing: String = conn.query_row(
            "SELECT entity_id FROM idempotency_keys WHERE key = ?1",
            [key],
            |row| row.get(0),
        )?;
        Ok(ClaimOutcome::Existing(existing))
    }

    /// Give a claim back after the work it guarded failed, so a retry
    /// with the same key can start fresh. Guarded by the entity id, a
    /// claim held by someone else is left alone.
    pub fn release(&self, conn: &Connection, key: &str, entity_id: &str) -> DatabaseResult<()> {
        conn.execute(
            "DELETE FROM idempotency_keys WHERE key = ?1 AND entity_id = ?2",
            params![key, entity_id],
        )?;
        Ok(())
    }

    /// Repoint an owned claim at a different entity; used when a spawn
    /// claim is fulfilled from the warm pool instead of the reserved id.
    pub fn reassign(
        &self,
        conn: &Connection,
        key: &str,
        from_entity: &str,
        to_entity: &str,
    ) -> DatabaseResult<()> {
        conn.execute(
            "UPDATE idempotency_keys SET entity_id = ?3 WHERE key = ?1 AND entity_id = ?2",
            params![key, from_entity, to_entity],
        )?;
        Ok(())
    }

    /// Delete expired keys; returns how many were removed.
    pub fn purge_expired(&self, conn: &Connection, now: i64) -> DatabaseResult<usize> {
        let n = conn.execute(
            "DELETE FROM idempotency_keys WHERE created_at < ?1",
            [now - IDEMPOTENCY_TTL_SECONDS],
        )?;
        Ok(n)
    }
}

impl Default for IdempotencyStore {
    fn default() -> Self {
        Self::new()
    }
}
