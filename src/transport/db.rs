//! Read-only polling of the chat datastore (a local SQLite file).
//!
//! Schema assumptions mirror the real on-disk layout: messages in `message`,
//! senders in `handle`, chats in `chat`, join tables linking the two, and
//! attachments linked via `message_attachment_join`. The store's epoch is
//! offset from the Unix epoch by a fixed number of seconds and expressed in
//! nanoseconds (`APPLE_EPOCH_OFFSET_SECONDS`).

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use tokio::sync::Mutex as AsyncMutex;

use super::attachments::resolve_attachment_path;
use super::send::{NativeSender, SendError};
use super::{Attachment, IncomingMessage, Transport};

/// Seconds between the Unix epoch (1970-01-01) and the datastore's own
/// epoch (2001-01-01), the fixed offset the store's timestamps are relative
/// to before the nanosecond scaling.
const STORE_EPOCH_OFFSET_SECONDS: i64 = 978_307_200;

#[derive(Debug, thiserror::Error)]
pub enum DbError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// SQLite-backed `Transport`. The connection is wrapped in an async mutex:
/// polling and sending never overlap in practice (ingress ticks and the
/// send queue's single active send are the only callers), so a single
/// connection is sufficient and avoids the complexity of a pool for a
/// read-mostly, low-throughput workload.
pub struct SqliteTransport {
    conn: AsyncMutex<Connection>,
    attachments_root: String,
    sender: NativeSender,
    enable_fast_check: bool,
}

impl SqliteTransport {
    pub fn open(
        db_path: &str,
        attachments_root: impl Into<String>,
        action_binary: impl Into<String>,
        enable_fast_check: bool,
    ) -> Result<Self, DbError> {
        let conn = Connection::open_with_flags(
            db_path,
            rusqlite::OpenFlags::SQLITE_OPEN_READ_ONLY,
        )?;
        Ok(Self {
            conn: AsyncMutex::new(conn),
            attachments_root: attachments_root.into(),
            sender: NativeSender::new(action_binary),
            enable_fast_check,
        })
    }

    fn store_epoch_to_utc(raw_ns: i64) -> DateTime<Utc> {
        let seconds = raw_ns / 1_000_000_000 + STORE_EPOCH_OFFSET_SECONDS;
        let nanos = (raw_ns % 1_000_000_000) as u32;
        Utc.timestamp_opt(seconds, nanos).single().unwrap_or_else(Utc::now)
    }

    fn assemble(
        conn: &Connection,
        watermark: i64,
        limit: u32,
        attachments_root: &str,
    ) -> Result<Vec<IncomingMessage>, DbError> {
        let mut stmt = conn.prepare(
            "SELECT m.ROWID, c.chat_identifier, h.id, m.text, m.date
             FROM message m
             JOIN chat_message_join cmj ON cmj.message_id = m.ROWID
             JOIN chat c ON c.ROWID = cmj.chat_id
             LEFT JOIN handle h ON h.ROWID = m.handle_id
             WHERE m.ROWID > ?1
               AND m.is_from_me = 0
               AND m.text IS NOT NULL
               AND m.text != ''
             ORDER BY m.ROWID ASC
             LIMIT ?2",
        )?;

        let rows = stmt.query_map(rusqlite::params![watermark, limit], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i64>(4)?,
            ))
        })?;

        let mut messages = Vec::new();
        for row in rows {
            let (row_id, thread_id, sender, text, raw_date) = row?;
            let is_group = crate::sanitize::is_group_thread_id(&thread_id);
            let participants = if is_group {
                Self::participants(conn, &thread_id)?
            } else {
                sender.clone().into_iter().collect()
            };
            let attachments = Self::attachments_for(conn, row_id, attachments_root)?;

            messages.push(IncomingMessage {
                row_id,
                thread_id,
                is_group,
                sender: sender.unwrap_or_default(),
                text,
                timestamp: Self::store_epoch_to_utc(raw_date),
                participants,
                attachments,
            });
        }
        Ok(messages)
    }

    fn participants(conn: &Connection, thread_id: &str) -> Result<Vec<String>, DbError> {
        let mut stmt = conn.prepare(
            "SELECT h.id FROM chat c
             JOIN chat_handle_join chj ON chj.chat_id = c.ROWID
             JOIN handle h ON h.ROWID = chj.handle_id
             WHERE c.chat_identifier = ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![thread_id], |row| row.get::<_, String>(0))?;
        rows.collect::<Result<Vec<_>, _>>().map_err(Into::into)
    }

    fn attachments_for(
        conn: &Connection,
        message_row_id: i64,
        attachments_root: &str,
    ) -> Result<Vec<Attachment>, DbError> {
        let mut stmt = conn.prepare(
            "SELECT a.ROWID, a.guid, a.filename, a.mime_type, a.uti, a.total_bytes, a.is_sticker
             FROM attachment a
             JOIN message_attachment_join maj ON maj.attachment_id = a.ROWID
             WHERE maj.message_id = ?1",
        )?;
        let rows = stmt.query_map(rusqlite::params![message_row_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, Option<i64>>(5)?,
                row.get::<_, Option<i64>>(6)?,
            ))
        })?;

        let mut attachments = Vec::new();
        for row in rows {
            let (id, guid, filename, mime, uti, size, is_sticker) = row?;
            let absolute_path = filename
                .as_deref()
                .and_then(|f| resolve_attachment_path(f, attachments_root));
            attachments.push(Attachment {
                id: id.to_string(),
                guid,
                relative_path: filename.clone(),
                filename,
                mime,
                uti,
                size,
                absolute_path,
                is_sticker: is_sticker.unwrap_or(0) != 0,
                is_outgoing: false,
            });
        }
        Ok(attachments)
    }
}

#[async_trait]
impl Transport for SqliteTransport {
    async fn poll_new(&self, watermark: i64, limit: u32) -> Result<Vec<IncomingMessage>, DbError> {
        let conn = self.conn.lock().await;

        if self.enable_fast_check {
            let count: i64 = conn.query_row(
                "SELECT COUNT(*) FROM message
                 WHERE ROWID > ?1 AND is_from_me = 0 AND text IS NOT NULL AND text != ''",
                rusqlite::params![watermark],
                |row| row.get(0),
            )?;
            if count == 0 {
                return Ok(Vec::new());
            }
        }

        Self::assemble(&conn, watermark, limit, &self.attachments_root)
    }

    async fn send(&self, thread_id: &str, text: &str, is_group: bool) -> Result<(), SendError> {
        self.sender.send(thread_id, text, is_group).await
    }

    async fn send_multi(
        &self,
        thread_id: &str,
        bubbles: &[String],
        is_group: bool,
        batched: bool,
    ) -> Result<(), SendError> {
        self.sender
            .send_multi(thread_id, bubbles, is_group, batched)
            .await
    }
}
