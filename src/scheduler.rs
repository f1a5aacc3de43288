//! Scheduler (C5): a durable, single-process, adaptive timer over a
//! SQLite-backed `scheduled_messages` table.
//!
//! The central correctness guarantee lives in `claim_due`: the row is
//! flipped from `pending` to `sent` by a single `UPDATE ... WHERE
//! status='pending'` before any outbound I/O happens. A crash between claim
//! and send loses a message (at-most-once); it never duplicates one.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tracing::instrument;
use uuid::Uuid;

use crate::sendqueue::{JobPayload, SendQueue};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS scheduled_messages (
    id TEXT PRIMARY KEY,
    thread_id TEXT NOT NULL,
    text TEXT NOT NULL,
    send_at TEXT NOT NULL,
    is_group INTEGER NOT NULL,
    status TEXT NOT NULL,
    created_at TEXT NOT NULL,
    command_id TEXT,
    error TEXT
);
CREATE INDEX IF NOT EXISTS idx_scheduled_pending_send_at
    ON scheduled_messages (send_at)
    WHERE status = 'pending';
";

/// Default ceiling on how long the scheduler sleeps with nothing due.
pub const DEFAULT_MAX_CHECK_MS: u64 = 60_000;
/// Slack subtracted from the next-due sleep so the check happens slightly
/// before the row is actually due.
pub const BUFFER_MS: i64 = 100;
/// A pending row more than this far past due at startup is not fired; it
/// is transitioned to `failed` instead of flooding a long outage's backlog.
pub const MAX_STALE_SECONDS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduledStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

impl ScheduledStatus {
    fn as_str(self) -> &'static str {
        match self {
            ScheduledStatus::Pending => "pending",
            ScheduledStatus::Sent => "sent",
            ScheduledStatus::Failed => "failed",
            ScheduledStatus::Cancelled => "cancelled",
        }
    }

    fn parse(s: &str) -> Self {
        match s {
            "sent" => ScheduledStatus::Sent,
            "failed" => ScheduledStatus::Failed,
            "cancelled" => ScheduledStatus::Cancelled,
            _ => ScheduledStatus::Pending,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledMessage {
    pub id: Uuid,
    pub thread_id: String,
    pub text: String,
    pub send_at: DateTime<Utc>,
    pub is_group: bool,
    pub status: ScheduledStatus,
    pub created_at: DateTime<Utc>,
    pub command_id: Option<Uuid>,
    pub error: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

pub struct Scheduler {
    conn: AsyncMutex<Connection>,
    new_schedule_tx: watch::Sender<u64>,
    max_check_ms: std::sync::atomic::AtomicU64,
    adaptive: std::sync::atomic::AtomicBool,
}

impl Scheduler {
    pub fn open(path: &str) -> Result<Self, SchedulerError> {
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "FULL")?;
        conn.execute_batch(SCHEMA)?;
        let (new_schedule_tx, _rx) = watch::channel(0);
        Ok(Self {
            conn: AsyncMutex::new(conn),
            new_schedule_tx,
            max_check_ms: std::sync::atomic::AtomicU64::new(DEFAULT_MAX_CHECK_MS),
            adaptive: std::sync::atomic::AtomicBool::new(true),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, SchedulerError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        let (new_schedule_tx, _rx) = watch::channel(0);
        Ok(Self {
            conn: AsyncMutex::new(conn),
            new_schedule_tx,
            max_check_ms: std::sync::atomic::AtomicU64::new(DEFAULT_MAX_CHECK_MS),
            adaptive: std::sync::atomic::AtomicBool::new(true),
        })
    }

    /// Overrides the timer behaviour from `scheduler.check_interval_seconds`
    /// / `scheduler.adaptive_mode`. When `adaptive` is false the timer
    /// degrades to a fixed `max_check_ms` cadence instead of recomputing
    /// its sleep from `MIN(send_at)`.
    pub fn configure_timer(&self, max_check_ms: u64, adaptive: bool) {
        self.max_check_ms
            .store(max_check_ms, std::sync::atomic::Ordering::Relaxed);
        self.adaptive
            .store(adaptive, std::sync::atomic::Ordering::Relaxed);
    }

    /// Insert a new pending row and wake the adaptive timer.
    pub async fn schedule(
        &self,
        thread_id: String,
        text: String,
        send_at: DateTime<Utc>,
        is_group: bool,
        command_id: Option<Uuid>,
    ) -> Result<Uuid, SchedulerError> {
        let id = Uuid::new_v4();
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO scheduled_messages
             (id, thread_id, text, send_at, is_group, status, created_at, command_id, error)
             VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?7, NULL)",
            params![
                id.to_string(),
                thread_id,
                text,
                send_at.to_rfc3339(),
                is_group as i64,
                Utc::now().to_rfc3339(),
                command_id.map(|c| c.to_string()),
            ],
        )?;
        drop(conn);
        self.new_schedule_tx.send_modify(|v| *v += 1);
        Ok(id)
    }

    /// `UPDATE ... SET status='cancelled' WHERE id=? AND status='pending'`.
    /// Returns whether a row was actually changed.
    pub async fn cancel(&self, id: Uuid) -> Result<bool, SchedulerError> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE scheduled_messages SET status = 'cancelled' WHERE id = ?1 AND status = 'pending'",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// The atomic claim: flips one row from `pending` to `sent`. Returns
    /// `None` if another checker already claimed it (or it doesn't exist /
    /// isn't pending).
    pub async fn claim(&self, id: Uuid) -> Result<Option<ScheduledMessage>, SchedulerError> {
        let conn = self.conn.lock().await;
        let affected = conn.execute(
            "UPDATE scheduled_messages SET status = 'sent' WHERE id = ?1 AND status = 'pending'",
            params![id.to_string()],
        )?;
        if affected == 0 {
            return Ok(None);
        }
        Self::fetch(&conn, id)
    }

    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<(), SchedulerError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE scheduled_messages SET status = 'failed', error = ?2 WHERE id = ?1",
            params![id.to_string(), error],
        )?;
        Ok(())
    }

    fn fetch(conn: &Connection, id: Uuid) -> Result<Option<ScheduledMessage>, SchedulerError> {
        conn.query_row(
            "SELECT id, thread_id, text, send_at, is_group, status, created_at, command_id, error
             FROM scheduled_messages WHERE id = ?1",
            params![id.to_string()],
            Self::row_to_message,
        )
        .optional()
        .map_err(Into::into)
    }

    fn row_to_message(row: &rusqlite::Row) -> rusqlite::Result<ScheduledMessage> {
        let id: String = row.get(0)?;
        let send_at: String = row.get(3)?;
        let created_at: String = row.get(6)?;
        let command_id: Option<String> = row.get(7)?;
        Ok(ScheduledMessage {
            id: Uuid::parse_str(&id).unwrap_or_else(|_| Uuid::nil()),
            thread_id: row.get(1)?,
            text: row.get(2)?,
            send_at: DateTime::parse_from_rfc3339(&send_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            is_group: row.get::<_, i64>(4)? != 0,
            status: ScheduledStatus::parse(&row.get::<_, String>(5)?),
            created_at: DateTime::parse_from_rfc3339(&created_at)
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(|_| Utc::now()),
            command_id: command_id.and_then(|c| Uuid::parse_str(&c).ok()),
            error: row.get(8)?,
        })
    }

    /// Minimum `send_at` over currently-pending rows.
    async fn min_pending_send_at(&self) -> Result<Option<DateTime<Utc>>, SchedulerError> {
        let conn = self.conn.lock().await;
        let value: Option<String> = conn
            .query_row(
                "SELECT MIN(send_at) FROM scheduled_messages WHERE status = 'pending'",
                [],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?
            .flatten();
        Ok(value.and_then(|v| DateTime::parse_from_rfc3339(&v).ok().map(|d| d.with_timezone(&Utc))))
    }

    /// All rows due (`send_at <= now`) and still pending, ascending by
    /// `send_at`.
    async fn due_ids(&self) -> Result<Vec<Uuid>, SchedulerError> {
        let conn = self.conn.lock().await;
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT id FROM scheduled_messages
             WHERE status = 'pending' AND send_at <= ?1
             ORDER BY send_at ASC",
        )?;
        let rows = stmt.query_map(params![now], |row| row.get::<_, String>(0))?;
        let mut ids = Vec::new();
        for row in rows {
            if let Ok(id) = Uuid::parse_str(&row?) {
                ids.push(id);
            }
        }
        Ok(ids)
    }

    /// Startup recovery: pending rows whose `send_at` is more than
    /// `MAX_STALE_SECONDS` in the past are failed instead of fired, so a
    /// multi-hour outage does not flood a backlog on restart.
    #[instrument(skip(self))]
    pub async fn recover_stale_on_startup(&self) -> Result<u64, SchedulerError> {
        let conn = self.conn.lock().await;
        let cutoff = (Utc::now() - chrono::Duration::seconds(MAX_STALE_SECONDS)).to_rfc3339();
        let affected = conn.execute(
            "UPDATE scheduled_messages
             SET status = 'failed', error = 'stale at startup'
             WHERE status = 'pending' AND send_at < ?1",
            params![cutoff],
        )?;
        if affected > 0 {
            tracing::warn!(count = affected, "⚠️ failed stale scheduled rows at startup");
        }
        Ok(affected as u64)
    }

    /// Drive the adaptive timer until `shutdown` fires, dispatching due
    /// rows into `send_queue`.
    #[instrument(skip(self, send_queue, shutdown))]
    pub async fn run(self: &Arc<Self>, send_queue: SendQueue, mut shutdown: watch::Receiver<bool>) {
        let mut new_schedule_rx = self.new_schedule_tx.subscribe();
        loop {
            if *shutdown.borrow() {
                return;
            }

            let max_check_ms = self.max_check_ms.load(std::sync::atomic::Ordering::Relaxed);
            let adaptive = self.adaptive.load(std::sync::atomic::Ordering::Relaxed);
            let sleep_for = if !adaptive {
                Duration::from_millis(max_check_ms)
            } else {
                match self.min_pending_send_at().await {
                    Ok(Some(due)) => {
                        let now = Utc::now();
                        let delta_ms = (due - now).num_milliseconds() - BUFFER_MS;
                        Duration::from_millis(delta_ms.max(0) as u64)
                    }
                    Ok(None) => Duration::from_millis(max_check_ms),
                    Err(e) => {
                        tracing::error!(error = %e, "❌ scheduler query failed");
                        Duration::from_millis(max_check_ms)
                    }
                }
            };

            tokio::select! {
                () = tokio::time::sleep(sleep_for) => {}
                _ = new_schedule_rx.changed() => {
                    continue; // recompute the sleep immediately
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            self.claim_and_dispatch_due(&send_queue).await;
        }
    }

    async fn claim_and_dispatch_due(&self, send_queue: &SendQueue) {
        let due = match self.due_ids().await {
            Ok(ids) => ids,
            Err(e) => {
                tracing::error!(error = %e, "❌ scheduler due-query failed");
                return;
            }
        };

        for id in due {
            match self.claim(id).await {
                Ok(Some(message)) => {
                    let enqueued = send_queue
                        .enqueue(
                            message.thread_id.clone(),
                            message.is_group,
                            JobPayload::Single(message.text.clone()),
                        )
                        .await;
                    if !enqueued {
                        if let Err(e) = self.mark_failed(id, "send queue full").await {
                            tracing::error!(error = %e, "❌ failed to mark scheduled row failed");
                        }
                    }
                }
                Ok(None) => {
                    // Another checker claimed it first; this is expected
                    // under concurrent checkers and not an error.
                }
                Err(e) => {
                    tracing::error!(error = %e, "❌ claim failed");
                }
            }
        }
    }
}
