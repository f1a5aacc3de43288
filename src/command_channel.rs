//! CommandChannel (C4): the persistent, authenticated WebSocket stream.
//!
//! Reconnects with exponential back-off (1 s doubling, capped at 60 s,
//! indefinite attempts), pings every `ping_interval_seconds`, and exposes a
//! small state machine (`ChannelState`) so the HTTP sync fallback can pause
//! itself while the stream is open, matching the interlock described for
//! the dual-transport command path.

use std::sync::Arc;
use std::time::Duration;

use edge_protocol::{Command, CommandAck, WsFrame};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::watch;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::instrument;

const MIN_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const HANDSHAKE_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum CommandChannelError {
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("connect error: {0}")]
    Connect(String),
}

/// `WS_DOWN` / `WS_CONNECTING` / `WS_OPEN`, per the fallback interlock: the
/// HTTP sync loop observes this via `watch::Receiver<ChannelState>` and
/// pauses itself exactly while this reads `Open`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Down,
    Connecting,
    Open,
}

/// Handler invoked for each `Command` the backend pushes. Returning an
/// `Err` does not tear the channel down: the error is logged and a
/// `failed` ack is sent if the handler itself didn't already send one.
#[async_trait::async_trait]
pub trait CommandHandlerFn: Send + Sync {
    async fn handle(&self, command: Command) -> Result<CommandAck, String>;
}

pub struct CommandChannel<H: CommandHandlerFn> {
    url: String,
    secret: String,
    agent_id: String,
    ping_interval: Duration,
    handler: Arc<H>,
    state_tx: watch::Sender<ChannelState>,
}

impl<H: CommandHandlerFn + 'static> CommandChannel<H> {
    pub fn new(url: impl Into<String>, secret: impl Into<String>, agent_id: impl Into<String>, ping_interval_seconds: u64, handler: Arc<H>) -> (Self, watch::Receiver<ChannelState>) {
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        (
            Self {
                url: url.into(),
                secret: secret.into(),
                agent_id: agent_id.into(),
                ping_interval: Duration::from_secs(ping_interval_seconds),
                handler,
                state_tx,
            },
            state_rx,
        )
    }

    pub fn state(&self) -> ChannelState {
        *self.state_tx.borrow()
    }

    /// Run the reconnect-forever loop until `shutdown` fires.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = MIN_BACKOFF;
        loop {
            if *shutdown.borrow() {
                return;
            }
            let _ = self.state_tx.send(ChannelState::Connecting);

            tokio::select! {
                result = self.connect_and_serve(&mut shutdown) => {
                    match result {
                        Ok(()) => {
                            tracing::info!("command channel closed cleanly");
                        }
                        Err(e) => {
                            tracing::error!(error = %e, "❌ command channel error");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }

            let _ = self.state_tx.send(ChannelState::Down);
            if *shutdown.borrow() {
                return;
            }
            tracing::warn!(backoff_ms = backoff.as_millis() as u64, "⚠️ reconnecting");
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    async fn connect_and_serve(
        &self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<(), CommandChannelError> {
        let url = format!("{}?edge_agent_id={}", self.url, self.agent_id);
        let mut request = url
            .into_client_request()
            .map_err(|e| CommandChannelError::Connect(e.to_string()))?;
        let auth_value = HeaderValue::from_str(&format!("Bearer {}", self.secret))
            .map_err(|e| CommandChannelError::Connect(e.to_string()))?;
        request.headers_mut().insert("Authorization", auth_value);

        let (ws_stream, _) = tokio::time::timeout(HANDSHAKE_DEADLINE, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| CommandChannelError::Connect("handshake timed out".into()))??;
        let (mut write, mut read) = ws_stream.split();
        let _ = self.state_tx.send(ChannelState::Open);
        tracing::info!("command channel open");

        let mut ping_tick = tokio::time::interval(self.ping_interval);
        ping_tick.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                _ = ping_tick.tick() => {
                    let frame = serde_json::to_string(&WsFrame::Ping)?;
                    write.send(Message::Text(frame.into())).await?;
                }
                msg = read.next() => {
                    let Some(msg) = msg else { return Ok(()); };
                    let msg = msg?;
                    match msg {
                        Message::Text(text) => {
                            self.handle_frame(&text, &mut write).await?;
                        }
                        Message::Ping(data) => {
                            write.send(Message::Pong(data)).await?;
                        }
                        Message::Close(_) => return Ok(()),
                        _ => {}
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(());
                    }
                }
            }
        }
    }

    async fn handle_frame(
        &self,
        text: &str,
        write: &mut (impl SinkExt<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    ) -> Result<(), CommandChannelError> {
        let frame: WsFrame = serde_json::from_str(text)?;
        match frame {
            WsFrame::Pong | WsFrame::Ping => {}
            WsFrame::Command { data } => {
                let command_id = data.command_id;
                let ack = match self.handler.handle(data).await {
                    Ok(ack) => ack,
                    Err(error) => {
                        tracing::error!(%command_id, error, "❌ command handler failed");
                        CommandAck {
                            command_id,
                            status: edge_protocol::CommandAckStatus::Failed,
                            error: Some(error),
                        }
                    }
                };
                let frame = WsFrame::CommandAck { data: ack };
                let json = serde_json::to_string(&frame)?;
                write.send(Message::Text(json.into())).await?;
            }
            WsFrame::CommandAck { .. } | WsFrame::ConfigUpdate { .. } => {}
        }
        Ok(())
    }
}
