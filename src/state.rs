//! State (C8): the watermark, `last_command_id`, and the pending-events ring.
//!
//! Durable via a local SQLite file, synced on every append so a crash never
//! loses an acknowledged-pending event or rewinds the watermark. Modeled on
//! the teacher's `storage::journal` module: pragmas applied at open, an
//! integrity check on open, and a thin typed wrapper around `rusqlite`.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS kv (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS pending_events (
    event_id TEXT PRIMARY KEY,
    event_type TEXT NOT NULL,
    thread_id TEXT,
    details TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

const WATERMARK_KEY: &str = "last_row_id";
const LAST_COMMAND_ID_KEY: &str = "last_command_id";

/// Maximum number of pending events retained; oldest dropped on overflow.
pub const MAX_PENDING_EVENTS: usize = 1024;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("store failed integrity check")]
    IntegrityCheckFailed,
}

pub struct State {
    conn: Connection,
}

impl State {
    pub fn open(path: &str) -> Result<Self, StateError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        let check: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if check != "ok" {
            return Err(StateError::IntegrityCheckFailed);
        }

        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// Open an in-memory store, used by tests that don't need persistence
    /// across a process boundary.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, StateError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    /// The highest chat-datastore row id observed by ingress, or 0 if none
    /// has ever been recorded.
    pub fn watermark(&self) -> Result<i64, StateError> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![WATERMARK_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()).unwrap_or(0))
    }

    /// Advance the watermark. Rejects any attempt to move it backwards —
    /// the watermark is monotonic by construction.
    pub fn advance_watermark(&self, row_id: i64) -> Result<(), StateError> {
        let current = self.watermark()?;
        if row_id <= current {
            return Ok(());
        }
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![WATERMARK_KEY, row_id.to_string()],
        )?;
        Ok(())
    }

    pub fn last_command_id(&self) -> Result<Option<Uuid>, StateError> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM kv WHERE key = ?1",
                params![LAST_COMMAND_ID_KEY],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| Uuid::parse_str(&v).ok()))
    }

    pub fn set_last_command_id(&self, id: Uuid) -> Result<(), StateError> {
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![LAST_COMMAND_ID_KEY, id.to_string()],
        )?;
        Ok(())
    }

    /// Record a pending event, dropping the oldest if the ring is at
    /// capacity. Returns `true` if an older event was dropped.
    pub fn push_pending_event(
        &self,
        event_id: Uuid,
        event_type: &str,
        thread_id: Option<&str>,
        details: &serde_json::Value,
    ) -> Result<bool, StateError> {
        self.conn.execute(
            "INSERT INTO pending_events (event_id, event_type, thread_id, details, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event_id.to_string(),
                event_type,
                thread_id,
                details.to_string(),
                Utc::now().to_rfc3339(),
            ],
        )?;

        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pending_events", [], |row| row.get(0))?;
        if count as usize > MAX_PENDING_EVENTS {
            self.conn.execute(
                "DELETE FROM pending_events WHERE event_id = (
                    SELECT event_id FROM pending_events ORDER BY created_at ASC LIMIT 1
                )",
                [],
            )?;
            return Ok(true);
        }
        Ok(false)
    }

    /// Remove an event once the backend has acknowledged it.
    pub fn remove_pending_event(&self, event_id: Uuid) -> Result<(), StateError> {
        self.conn.execute(
            "DELETE FROM pending_events WHERE event_id = ?1",
            params![event_id.to_string()],
        )?;
        Ok(())
    }

    pub fn pending_events(&self) -> Result<Vec<PendingEvent>, StateError> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, event_type, thread_id, details, created_at
             FROM pending_events ORDER BY created_at ASC",
        )?;
        let rows = stmt.query_map([], |row| {
            let event_id: String = row.get(0)?;
            let details: String = row.get(3)?;
            let created_at: String = row.get(4)?;
            Ok(PendingEvent {
                event_id: Uuid::parse_str(&event_id).unwrap_or_else(|_| Uuid::nil()),
                event_type: row.get(1)?,
                thread_id: row.get(2)?,
                details: serde_json::from_str(&details).unwrap_or(serde_json::Value::Null),
                created_at: DateTime::parse_from_rfc3339(&created_at)
                    .map(|dt| dt.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
            })
        })?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    /// Introspection hook for the stats panel contract: current ring depth.
    pub fn pending_event_count(&self) -> Result<usize, StateError> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM pending_events", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub event_id: Uuid,
    pub event_type: String,
    pub thread_id: Option<String>,
    pub details: serde_json::Value,
    pub created_at: DateTime<Utc>,
}
