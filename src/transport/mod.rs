//! Transport (C1): the only component that touches the chat datastore and
//! the chat-send action. Everything upstream of this module speaks in terms
//! of the types below, never raw SQL rows or subprocess invocations.

mod attachments;
mod db;
mod send;

pub use attachments::{resolve_attachment_path, AttachmentPathError};
pub use db::{SqliteTransport, DbError};
pub use send::{NativeSender, RateLimiter, SendError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

/// An inbound chat message, as read from the datastore.
#[derive(Debug, Clone, PartialEq)]
pub struct IncomingMessage {
    pub row_id: i64,
    pub thread_id: String,
    pub is_group: bool,
    pub sender: String,
    pub text: String,
    pub timestamp: DateTime<Utc>,
    pub participants: Vec<String>,
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    pub id: String,
    pub guid: String,
    pub filename: Option<String>,
    pub mime: Option<String>,
    pub uti: Option<String>,
    pub size: Option<i64>,
    pub relative_path: Option<String>,
    pub absolute_path: Option<String>,
    pub is_sticker: bool,
    pub is_outgoing: bool,
}

/// The read-new-messages and send-message surfaces the rest of the daemon
/// depends on. A real implementation talks to an embedded SQLite file and
/// shells out to the platform's chat-send action; tests substitute a fake.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Rows with `row_id > watermark`, ascending, capped at
    /// `imessage.max_messages_per_poll`. Implementations MUST perform the
    /// fast pre-check before assembling the full row.
    async fn poll_new(&self, watermark: i64, limit: u32) -> Result<Vec<IncomingMessage>, DbError>;

    async fn send(&self, thread_id: &str, text: &str, is_group: bool) -> Result<(), SendError>;

    async fn send_multi(
        &self,
        thread_id: &str,
        bubbles: &[String],
        is_group: bool,
        batched: bool,
    ) -> Result<(), SendError>;
}
