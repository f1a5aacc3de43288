//! CommandHandler (C6): dispatch table from `command_type` to a typed
//! payload validator followed by a typed executor. Idempotent per
//! `command_id` via a small LRU.

use std::collections::VecDeque;
use std::sync::Mutex;

use chrono::Utc;
use edge_protocol::{
    CancelScheduledPayload, Command, CommandAck, CommandAckStatus, CommandType,
    ScheduleMessagePayload, SendMessageNowPayload,
};
use uuid::Uuid;

use crate::reflex::ReflexCoordinator;
use crate::scheduler::Scheduler;
use crate::sendqueue::{JobPayload, SendQueue};
use crate::sanitize::{sanitize_text, validate_thread_id};
use crate::state::State;

const IDEMPOTENCY_LRU_CAPACITY: usize = 1024;
const MAX_SCHEDULE_HORIZON_DAYS: i64 = 365;
const MAX_RULE_PAYLOAD_BYTES: usize = 1024 * 1024;
const MAX_RULE_PAYLOAD_DEPTH: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("invalid thread id")]
    InvalidThreadId,
    #[error("text too long or forbidden")]
    InvalidText,
    #[error("send_at out of range [now, now+365d]")]
    SendAtOutOfRange,
    #[error("schedule_id is not a valid uuid")]
    InvalidScheduleId,
    #[error("payload object nesting exceeds {MAX_RULE_PAYLOAD_DEPTH}")]
    PayloadTooDeep,
    #[error("payload serialized size exceeds {MAX_RULE_PAYLOAD_BYTES} bytes")]
    PayloadTooLarge,
    #[error("unrecognized command payload shape")]
    MalformedPayload,
}

/// A small idempotency cache keyed by `command_id`: re-executing the same
/// id is a no-op on the second attempt. Implemented as a bounded
/// insertion-ordered set rather than pulling in a dedicated LRU crate,
/// since the only operation needed is "seen before" + bounded eviction.
struct IdempotencyCache {
    order: VecDeque<Uuid>,
    seen: std::collections::HashSet<Uuid>,
    capacity: usize,
}

impl IdempotencyCache {
    fn new(capacity: usize) -> Self {
        Self {
            order: VecDeque::with_capacity(capacity),
            seen: std::collections::HashSet::with_capacity(capacity),
            capacity,
        }
    }

    /// Returns `true` if this id has already been recorded (a repeat).
    fn check_and_record(&mut self, id: Uuid) -> bool {
        if self.seen.contains(&id) {
            return true;
        }
        if self.order.len() >= self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.order.push_back(id);
        self.seen.insert(id);
        false
    }
}

pub struct CommandHandler {
    scheduler: std::sync::Arc<Scheduler>,
    send_queue: SendQueue,
    reflex: std::sync::Arc<ReflexCoordinator>,
    state: std::sync::Arc<tokio::sync::Mutex<State>>,
    idempotency: Mutex<IdempotencyCache>,
}

impl CommandHandler {
    pub fn new(
        scheduler: std::sync::Arc<Scheduler>,
        send_queue: SendQueue,
        reflex: std::sync::Arc<ReflexCoordinator>,
        state: std::sync::Arc<tokio::sync::Mutex<State>>,
    ) -> Self {
        Self {
            scheduler,
            send_queue,
            reflex,
            state,
            idempotency: Mutex::new(IdempotencyCache::new(IDEMPOTENCY_LRU_CAPACITY)),
        }
    }

    pub async fn handle(&self, command: Command) -> CommandAck {
        let command_id = command.command_id;
        let is_repeat = self
            .idempotency
            .lock()
            .expect("idempotency mutex poisoned")
            .check_and_record(command_id);
        if is_repeat {
            return CommandAck {
                command_id,
                status: CommandAckStatus::Completed,
                error: None,
            };
        }

        match self.execute(&command).await {
            Ok(()) => CommandAck {
                command_id,
                status: CommandAckStatus::Completed,
                error: None,
            },
            Err(e) => CommandAck {
                command_id,
                status: CommandAckStatus::Failed,
                error: Some(e.to_string()),
            },
        }
    }

    async fn execute(&self, command: &Command) -> Result<(), ValidationError> {
        match command.command_type {
            CommandType::SendMessageNow => self.execute_send_message_now(command).await,
            CommandType::ScheduleMessage => self.execute_schedule_message(command).await,
            CommandType::CancelScheduled => self.execute_cancel_scheduled(command).await,
            CommandType::SetRule
            | CommandType::UpdatePlan
            | CommandType::ContextUpdate
            | CommandType::ContextReset => self.execute_generic_payload(command),
            // `emit_event` is registered but not acknowledged upstream;
            // the resolved policy (SPEC_FULL.md §6, DESIGN.md) is to ack
            // `completed` after recording the event for best-effort
            // forward, not after a side-effect-free validation only.
            CommandType::EmitEvent => self.execute_emit_event(command).await,
            // `upload_retry` has no dedicated executor beyond idempotency
            // bookkeeping, matching its place in the command schema.
            CommandType::UploadRetry => Ok(()),
        }
    }

    async fn execute_send_message_now(&self, command: &Command) -> Result<(), ValidationError> {
        let payload: SendMessageNowPayload = serde_json::from_value(command.payload.clone())
            .map_err(|_| ValidationError::MalformedPayload)?;
        validate_thread_id(&payload.thread_id).map_err(|_| ValidationError::InvalidThreadId)?;
        sanitize_text(&payload.text).map_err(|_| ValidationError::InvalidText)?;

        self.send_queue
            .enqueue(
                payload.thread_id.clone(),
                payload.is_group,
                JobPayload::Single(payload.text.clone()),
            )
            .await;

        // `burst` carries no dedicated dispatcher branch; treat it as
        // `normal`. Only `reflex` populates the suppression map.
        if matches!(payload.bubble_type, edge_protocol::BubbleType::Reflex) {
            self.reflex.record(&payload.thread_id, &payload.text).await;
        }
        Ok(())
    }

    async fn execute_schedule_message(&self, command: &Command) -> Result<(), ValidationError> {
        let payload: ScheduleMessagePayload = serde_json::from_value(command.payload.clone())
            .map_err(|_| ValidationError::MalformedPayload)?;
        validate_thread_id(&payload.thread_id).map_err(|_| ValidationError::InvalidThreadId)?;
        sanitize_text(&payload.text).map_err(|_| ValidationError::InvalidText)?;

        let now = Utc::now();
        let horizon = now + chrono::Duration::days(MAX_SCHEDULE_HORIZON_DAYS);
        if payload.send_at < now || payload.send_at > horizon {
            return Err(ValidationError::SendAtOutOfRange);
        }

        self.scheduler
            .schedule(
                payload.thread_id,
                payload.text,
                payload.send_at,
                payload.is_group,
                Some(command.command_id),
            )
            .await
            .map_err(|_| ValidationError::MalformedPayload)?;
        Ok(())
    }

    async fn execute_cancel_scheduled(&self, command: &Command) -> Result<(), ValidationError> {
        let payload: CancelScheduledPayload = serde_json::from_value(command.payload.clone())
            .map_err(|_| ValidationError::MalformedPayload)?;
        self.scheduler
            .cancel(payload.schedule_id)
            .await
            .map_err(|_| ValidationError::InvalidScheduleId)?;
        Ok(())
    }

    /// Shared validation for the rule/plan/context family and `emit_event`:
    /// object-depth and serialized-size limits.
    fn validate_generic_payload(&self, command: &Command) -> Result<(), ValidationError> {
        let serialized =
            serde_json::to_vec(&command.payload).map_err(|_| ValidationError::MalformedPayload)?;
        if serialized.len() > MAX_RULE_PAYLOAD_BYTES {
            return Err(ValidationError::PayloadTooLarge);
        }
        if json_depth(&command.payload) > MAX_RULE_PAYLOAD_DEPTH {
            return Err(ValidationError::PayloadTooDeep);
        }
        Ok(())
    }

    /// The rule/plan/context family: execution itself is forwarded to an
    /// external collaborator, outside this crate's scope; validation
    /// success is what the ack reflects here.
    fn execute_generic_payload(&self, command: &Command) -> Result<(), ValidationError> {
        self.validate_generic_payload(command)
    }

    /// `emit_event`: validated the same way as the rule/plan/context
    /// family, then recorded in the pending-events ring (C8) so it reaches
    /// the backend via the next WebSocket ack round-trip or HTTP sync poll
    /// rather than being silently dropped after validation.
    async fn execute_emit_event(&self, command: &Command) -> Result<(), ValidationError> {
        self.validate_generic_payload(command)?;

        let event_type = command
            .payload
            .get("event_type")
            .and_then(|v| v.as_str())
            .unwrap_or("event")
            .to_owned();
        let thread_id = command
            .payload
            .get("thread_id")
            .and_then(|v| v.as_str())
            .map(str::to_owned);
        let details = command
            .payload
            .get("details")
            .cloned()
            .unwrap_or_else(|| command.payload.clone());

        let state = self.state.lock().await;
        let dropped = state
            .push_pending_event(command.command_id, &event_type, thread_id.as_deref(), &details)
            .map_err(|_| ValidationError::MalformedPayload)?;
        if dropped {
            tracing::warn!(
                command_id = %command.command_id,
                "⚠️ pending-events ring at capacity, oldest event dropped"
            );
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl crate::command_channel::CommandHandlerFn for CommandHandler {
    async fn handle(&self, command: Command) -> Result<CommandAck, String> {
        Ok(CommandHandler::handle(self, command).await)
    }
}

fn json_depth(value: &serde_json::Value) -> usize {
    match value {
        serde_json::Value::Object(map) => {
            1 + map.values().map(json_depth).max().unwrap_or(0)
        }
        serde_json::Value::Array(items) => {
            1 + items.iter().map(json_depth).max().unwrap_or(0)
        }
        _ => 0,
    }
}
