//! Local status HTTP surface.
//!
//! - `GET /healthz` — always 200, process is running.
//! - `GET /readyz`  — 200 once local subsystems have booted, 503 otherwise.
//!   Backend/WebSocket connectivity is explicitly excluded from readiness:
//!   a freshly started daemon that can't yet reach the orchestrator is
//!   still "ready" in the sense this endpoint cares about.
//! - `GET /stats`   — JSON snapshot for the admin portal's stats panel:
//!   send queue depth/counters, pending-event ring depth, command channel
//!   state.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::extract::State as AxumState;
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::command_channel::ChannelState;
use crate::sendqueue::SendQueue;
use crate::state::State;

#[derive(Debug, Clone)]
pub struct StatusConfig {
    pub bind: String,
}

/// Flips to `true` once every component the supervisor boots in order has
/// started; readiness is otherwise a plain boolean, there's nothing else
/// local for this daemon to be not-ready about.
#[derive(Clone, Default)]
pub struct Readiness(Arc<AtomicBool>);

impl Readiness {
    pub fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn set_ready(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_ready(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Clone)]
struct AppState {
    send_queue: SendQueue,
    state: Arc<tokio::sync::Mutex<State>>,
    channel_state: watch::Receiver<ChannelState>,
    readiness: Readiness,
}

#[derive(Serialize)]
struct StatsResponse {
    send_queue_depth: usize,
    send_queue_enqueued: u64,
    send_queue_delivered: u64,
    send_queue_dropped: u64,
    pending_event_count: usize,
    command_channel_state: &'static str,
}

pub struct StatusServer {
    local_addr: SocketAddr,
}

impl StatusServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub async fn start(
        cfg: StatusConfig,
        send_queue: SendQueue,
        state: Arc<tokio::sync::Mutex<State>>,
        channel_state: watch::Receiver<ChannelState>,
        readiness: Readiness,
    ) -> Result<Self, std::io::Error> {
        let listener = TcpListener::bind(&cfg.bind).await?;
        let local_addr = listener.local_addr()?;

        let app_state = AppState {
            send_queue,
            state,
            channel_state,
            readiness,
        };
        let router = Router::new()
            .route("/healthz", get(healthz))
            .route("/readyz", get(readyz))
            .route("/stats", get(stats))
            .with_state(app_state);

        tokio::spawn(async move {
            let _ = axum::serve(listener, router).await;
        });

        Ok(StatusServer { local_addr })
    }
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(AxumState(state): AxumState<AppState>) -> (StatusCode, &'static str) {
    if state.readiness.is_ready() {
        (StatusCode::OK, "ready")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

async fn stats(AxumState(state): AxumState<AppState>) -> Json<StatsResponse> {
    let send_queue_stats = state.send_queue.stats().await;
    let pending_event_count = state
        .state
        .lock()
        .await
        .pending_event_count()
        .unwrap_or(0);
    let command_channel_state = match *state.channel_state.borrow() {
        ChannelState::Down => "down",
        ChannelState::Connecting => "connecting",
        ChannelState::Open => "open",
    };

    Json(StatsResponse {
        send_queue_depth: send_queue_stats.depth,
        send_queue_enqueued: send_queue_stats.enqueued,
        send_queue_delivered: send_queue_stats.delivered,
        send_queue_dropped: send_queue_stats.dropped,
        pending_event_count,
        command_channel_state,
    })
}
