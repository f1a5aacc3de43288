//! HTTP sync fallback: the backstop command/event path used while the
//! persistent WebSocket is not `Open`.
//!
//! Polls `POST /edge/sync` on a fixed interval, carrying any pending events
//! and the last acknowledged `command_id`, and dispatches whatever commands
//! come back through the same `CommandHandler` the WebSocket path uses. The
//! loop observes `command_channel::ChannelState` via a `watch::Receiver` and
//! skips its own tick entirely while the channel reads `Open` — the two
//! transports are never allowed to deliver the same command twice by design
//! of the interlock, not by deduplicating after the fact.

use std::sync::Arc;
use std::time::Duration;

use edge_protocol::{Event, SyncRequest};
use tokio::sync::watch;
use tracing::instrument;

use crate::backend_client::{BackendClient, BackendError};
use crate::command_handler::CommandHandler;
use crate::command_channel::ChannelState;
use crate::state::State;

pub struct SyncFallback {
    backend: Arc<BackendClient>,
    handler: Arc<CommandHandler>,
    state: Arc<tokio::sync::Mutex<State>>,
    agent_id: String,
    poll_interval: Duration,
}

impl SyncFallback {
    pub fn new(
        backend: Arc<BackendClient>,
        handler: Arc<CommandHandler>,
        state: Arc<tokio::sync::Mutex<State>>,
        agent_id: impl Into<String>,
        poll_interval_seconds: u64,
    ) -> Self {
        Self {
            backend,
            handler,
            state,
            agent_id: agent_id.into(),
            poll_interval: Duration::from_secs(poll_interval_seconds),
        }
    }

    #[instrument(skip(self, channel_state, shutdown))]
    pub async fn run(
        &self,
        mut channel_state: watch::Receiver<ChannelState>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    if *channel_state.borrow() == ChannelState::Open {
                        continue;
                    }
                    if let Err(e) = self.poll_once().await {
                        tracing::error!(error = %e, "❌ sync fallback poll failed");
                    }
                }
                _ = channel_state.changed() => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn poll_once(&self) -> Result<(), BackendError> {
        let (last_command_id, pending_events) = {
            let state = self.state.lock().await;
            let last_command_id = state.last_command_id().unwrap_or(None);
            let pending_events = state
                .pending_events()
                .unwrap_or_default()
                .into_iter()
                .map(|e| Event {
                    event_id: e.event_id,
                    event_type: e.event_type,
                    thread_id: e.thread_id,
                    details: e.details,
                })
                .collect();
            (last_command_id, pending_events)
        };

        let request = SyncRequest {
            edge_agent_id: self.agent_id.clone(),
            last_command_id,
            pending_events,
            status: "online".into(),
        };

        let response = self.backend.sync(&request).await?;

        for command in response.commands {
            let command_id = command.command_id;
            let ack = self.handler.handle(command).await;
            if let Err(e) = self
                .backend
                .acknowledge_command(ack.command_id, ack.error.is_none(), ack.error.clone())
                .await
            {
                tracing::error!(error = %e, %command_id, "❌ failed to ack command over http");
            }
            let state = self.state.lock().await;
            if let Err(e) = state.set_last_command_id(command_id) {
                tracing::error!(error = %e, "❌ failed to persist last_command_id");
            }
        }

        let state = self.state.lock().await;
        for event_id in response.ack_events {
            if let Err(e) = state.remove_pending_event(event_id) {
                tracing::error!(error = %e, %event_id, "❌ failed to clear acked pending event");
            }
        }

        Ok(())
    }
}
