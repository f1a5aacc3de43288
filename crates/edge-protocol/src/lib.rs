//! Wire types shared between the edge daemon and the remote orchestrator.
//!
//! Mirrors the `rt_protocol` convention of a single discriminated union for
//! bidirectional messages (tagged with `type`, snake_case variants) plus
//! plain request/response structs for the HTTP surface. Nothing here talks
//! to a socket; this crate only defines shapes and (de)serializes them.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Shared enums
// ---------------------------------------------------------------------------

/// Direct vs. group chat, decided by the thread id's opaque prefix shape —
/// never by text heuristics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThreadMode {
    Direct,
    Group,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandPriority {
    Normal,
    Immediate,
}

/// All command types the backend may dispatch. `upload_retry` and
/// `emit_event` carry no dedicated executor branch beyond the handler's
/// idempotency bookkeeping — see `CommandHandler` for the exact policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    SendMessageNow,
    ScheduleMessage,
    CancelScheduled,
    SetRule,
    UpdatePlan,
    ContextUpdate,
    ContextReset,
    UploadRetry,
    EmitEvent,
}

/// `send_message_now`'s bubble_type. `Burst` has no special dispatcher
/// branch in this system — it is treated identically to `Normal`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BubbleType {
    Reflex,
    Burst,
    Normal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandAckStatus {
    Completed,
    Failed,
    Pending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduledStatus {
    Pending,
    Sent,
    Failed,
    Cancelled,
}

// ---------------------------------------------------------------------------
// Command envelope (backend -> edge, over WS or HTTP sync)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub command_id: Uuid,
    pub command_type: CommandType,
    pub payload: serde_json::Value,
    pub priority: CommandPriority,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

/// Payload shape for `send_message_now`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendMessageNowPayload {
    pub thread_id: String,
    pub text: String,
    pub is_group: bool,
    #[serde(default = "default_bubble_type")]
    pub bubble_type: BubbleType,
}

fn default_bubble_type() -> BubbleType {
    BubbleType::Normal
}

/// Payload shape for `schedule_message`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleMessagePayload {
    pub thread_id: String,
    pub text: String,
    pub send_at: chrono::DateTime<chrono::Utc>,
    pub is_group: bool,
}

/// Payload shape for `cancel_scheduled`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelScheduledPayload {
    pub schedule_id: Uuid,
}

// ---------------------------------------------------------------------------
// Command ack (edge -> backend, over WS or HTTP)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandAck {
    pub command_id: Uuid,
    pub status: CommandAckStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Event (edge -> backend, via the pending-events ring)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub event_id: Uuid,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    pub details: serde_json::Value,
}

// ---------------------------------------------------------------------------
// HTTP: POST /edge/message
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttachmentSummary {
    pub id: String,
    pub guid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uti: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<i64>,
    pub is_sticker: bool,
    pub is_outgoing: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardMessageRequest {
    pub chat_guid: String,
    pub mode: ThreadMode,
    pub sender: String,
    pub text: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub participants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Vec<AttachmentSummary>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForwardMessageResponse {
    pub should_respond: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_bubbles: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reflex_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_messages: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst_delay_ms: Option<u64>,
}

/// The four shapes a `ForwardMessageResponse` collapses to for dispatch
/// purposes. See `CommandHandler`/ingress classification in spec.md §4.7.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyClassification {
    NoReply,
    ReflexAndBurst {
        reflex: String,
        burst: Vec<String>,
        burst_delay_ms: u64,
    },
    LegacyBubbles(Vec<String>),
    SingleText(String),
}

impl ForwardMessageResponse {
    /// Classify the response into one of the four dispatch shapes.
    ///
    /// Precedence: `should_respond == false` always wins. A `reflex_message`
    /// takes priority over `reply_bubbles`/`reply_text` (a backend that
    /// sets both is using the newer protocol and the older fields are
    /// vestigial). `reply_bubbles` beats a bare `reply_text`.
    pub fn classify(&self) -> ReplyClassification {
        if !self.should_respond {
            return ReplyClassification::NoReply;
        }
        if let Some(reflex) = &self.reflex_message {
            return ReplyClassification::ReflexAndBurst {
                reflex: reflex.clone(),
                burst: self.burst_messages.clone().unwrap_or_default(),
                burst_delay_ms: self.burst_delay_ms.unwrap_or(2000),
            };
        }
        if let Some(bubbles) = &self.reply_bubbles {
            if !bubbles.is_empty() {
                return ReplyClassification::LegacyBubbles(bubbles.clone());
            }
        }
        match &self.reply_text {
            Some(text) if !text.is_empty() => ReplyClassification::SingleText(text.clone()),
            _ => ReplyClassification::NoReply,
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP: POST /edge/command/ack
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckCommandRequest {
    pub command_id: Uuid,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// HTTP: POST /edge/sync (fallback path only)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRequest {
    pub edge_agent_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_command_id: Option<Uuid>,
    pub pending_events: Vec<Event>,
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResponse {
    #[serde(default)]
    pub commands: Vec<Command>,
    #[serde(default)]
    pub ack_events: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_updates: Option<serde_json::Value>,
}

// ---------------------------------------------------------------------------
// WebSocket envelope (bidirectional, tagged by `type`)
// ---------------------------------------------------------------------------

/// All frames exchanged on the persistent command channel.
///
/// ```json
/// { "type": "ping" }
/// { "type": "command", "data": { "command_id": "...", ... } }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsFrame {
    Ping,
    Pong,
    Command { data: Command },
    CommandAck { data: CommandAck },
    ConfigUpdate { data: serde_json::Value },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ws_frame_ping_round_trips_with_type_tag() {
        let json = serde_json::to_value(WsFrame::Ping).unwrap();
        assert_eq!(json["type"], "ping");
        let back: WsFrame = serde_json::from_value(json).unwrap();
        assert_eq!(back, WsFrame::Ping);
    }

    #[test]
    fn ws_frame_command_round_trips() {
        let cmd = Command {
            command_id: Uuid::new_v4(),
            command_type: CommandType::SendMessageNow,
            payload: serde_json::json!({"thread_id": "t1", "text": "hi", "is_group": false}),
            priority: CommandPriority::Normal,
            timestamp: chrono::Utc::now(),
        };
        let frame = WsFrame::Command { data: cmd.clone() };
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["type"], "command");
        let back: WsFrame = serde_json::from_value(json).unwrap();
        match back {
            WsFrame::Command { data } => assert_eq!(data.command_id, cmd.command_id),
            other => panic!("expected Command, got {:?}", other),
        }
    }

    #[test]
    fn classify_prefers_reflex_over_legacy_bubbles() {
        let resp = ForwardMessageResponse {
            should_respond: true,
            reply_text: None,
            reply_bubbles: Some(vec!["ignored".into()]),
            reflex_message: Some("oh!".into()),
            burst_messages: Some(vec!["a".into(), "b".into()]),
            burst_delay_ms: Some(1500),
        };
        match resp.classify() {
            ReplyClassification::ReflexAndBurst {
                reflex,
                burst,
                burst_delay_ms,
            } => {
                assert_eq!(reflex, "oh!");
                assert_eq!(burst, vec!["a".to_owned(), "b".to_owned()]);
                assert_eq!(burst_delay_ms, 1500);
            }
            other => panic!("expected ReflexAndBurst, got {:?}", other),
        }
    }

    #[test]
    fn classify_no_reply_when_should_respond_false() {
        let resp = ForwardMessageResponse {
            should_respond: false,
            reply_text: Some("would have replied".into()),
            reply_bubbles: None,
            reflex_message: None,
            burst_messages: None,
            burst_delay_ms: None,
        };
        assert_eq!(resp.classify(), ReplyClassification::NoReply);
    }

    #[test]
    fn classify_falls_back_to_single_text() {
        let resp = ForwardMessageResponse {
            should_respond: true,
            reply_text: Some("hello".into()),
            reply_bubbles: None,
            reflex_message: None,
            burst_messages: None,
            burst_delay_ms: None,
        };
        assert_eq!(
            resp.classify(),
            ReplyClassification::SingleText("hello".into())
        );
    }
}
