//! Supervisor (C9): boots every component in dependency order, runs them
//! concurrently, and tears them down on shutdown.
//!
//! Boot order: State -> Scheduler -> Transport -> SendQueue -> BackendClient
//! -> CommandChannel -> Ingress -> HTTP sync fallback -> local status HTTP.
//! Shutdown broadcasts a single `watch<bool>` and gives the fleet
//! `SHUTDOWN_DEADLINE` to wind down before the process exits anyway.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::backend_client::BackendClient;
use crate::command_channel::CommandChannel;
use crate::command_handler::CommandHandler;
use crate::config::Config;
use crate::ingress::IngressLoop;
use crate::reflex::ReflexCoordinator;
use crate::scheduler::Scheduler;
use crate::sendqueue::{SendQueue, SendQueueConfig};
use crate::state::State;
use crate::status_http::{Readiness, StatusConfig, StatusServer};
use crate::sync_fallback::SyncFallback;
use crate::transport::{SqliteTransport, Transport};

const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(10);
const STATE_DB_PATH: &str = "/var/lib/edge-bridge/state.db";
const SCHEDULER_DB_PATH: &str = "/var/lib/edge-bridge/scheduled.db";

#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("state store: {0}")]
    State(#[from] crate::state::StateError),
    #[error("scheduler store: {0}")]
    Scheduler(#[from] crate::scheduler::SchedulerError),
    #[error("chat datastore: {0}")]
    Transport(#[from] crate::transport::DbError),
    #[error("backend client: {0}")]
    Backend(#[from] crate::backend_client::BackendError),
    #[error("status http server: {0}")]
    StatusHttp(std::io::Error),
}

pub struct Supervisor {
    config: Config,
    status_bind: String,
}

impl Supervisor {
    pub fn new(config: Config, status_bind: impl Into<String>) -> Self {
        Self {
            config,
            status_bind: status_bind.into(),
        }
    }

    pub async fn run(self, mut shutdown_signal: watch::Receiver<bool>) -> Result<(), SupervisorError> {
        let config = &self.config;

        let state = Arc::new(tokio::sync::Mutex::new(State::open(STATE_DB_PATH)?));
        let scheduler = Arc::new(Scheduler::open(SCHEDULER_DB_PATH)?);
        scheduler.configure_timer(
            config.scheduler.check_interval_seconds * 1000,
            config.scheduler.adaptive_mode,
        );
        scheduler.recover_stale_on_startup().await?;

        let transport: Arc<dyn Transport> = Arc::new(SqliteTransport::open(
            &config.imessage.db_path,
            config.imessage.attachments_path.clone(),
            config.imessage.send_action_binary.clone(),
            config.imessage.enable_fast_check,
        )?);

        let send_queue = SendQueue::new(SendQueueConfig::default());
        let reflex = Arc::new(ReflexCoordinator::new());

        let backend = Arc::new(BackendClient::new(
            config.backend.url.clone(),
            config.edge.secret.clone(),
            config.edge.agent_id.clone(),
            config.backend.request_timeout_ms,
            config.backend.max_concurrent_requests,
        )?);

        let command_handler = Arc::new(CommandHandler::new(
            scheduler.clone(),
            send_queue.clone(),
            reflex.clone(),
            state.clone(),
        ));

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let ws_url = format!(
            "{}/edge/ws",
            config.backend.url.replacen("http", "ws", 1)
        );
        let (command_channel, channel_state_rx) = CommandChannel::new(
            ws_url,
            config.edge.secret.clone(),
            config.edge.agent_id.clone(),
            config.websocket.ping_interval_seconds,
            command_handler.clone(),
        );

        let ingress = IngressLoop::new(
            transport.clone(),
            backend.clone(),
            send_queue.clone(),
            scheduler.clone(),
            reflex.clone(),
            state.clone(),
            config.imessage.poll_interval_seconds,
            config.performance.parallel_message_processing,
            config.imessage.max_messages_per_poll,
            config.performance.batch_applescript_sends,
        );

        let sync_fallback = SyncFallback::new(
            backend.clone(),
            command_handler.clone(),
            state.clone(),
            config.edge.agent_id.clone(),
            config.backend.sync_interval_seconds,
        );

        let readiness = Readiness::new();
        let _status_server = StatusServer::start(
            StatusConfig {
                bind: self.status_bind.clone(),
            },
            send_queue.clone(),
            state.clone(),
            channel_state_rx.clone(),
            readiness.clone(),
        )
        .await
        .map_err(SupervisorError::StatusHttp)?;

        let send_queue_for_drain = send_queue.clone();
        let transport_for_drain = transport.clone();
        let drain_shutdown = shutdown_rx.clone();
        let send_queue_task = tokio::spawn(async move {
            send_queue_for_drain
                .run(transport_for_drain, |_job| {}, drain_shutdown)
                .await;
        });

        let scheduler_for_run = scheduler.clone();
        let send_queue_for_scheduler = send_queue.clone();
        let scheduler_shutdown = shutdown_rx.clone();
        let scheduler_task = tokio::spawn(async move {
            scheduler_for_run
                .run(send_queue_for_scheduler, scheduler_shutdown)
                .await;
        });

        let websocket_enabled = config.websocket.enabled;
        let command_channel_shutdown = shutdown_rx.clone();
        let command_channel_task = tokio::spawn(async move {
            if websocket_enabled {
                command_channel.run(command_channel_shutdown).await;
            } else {
                let mut shutdown = command_channel_shutdown;
                let _ = shutdown.changed().await;
            }
        });

        let ingress_shutdown = shutdown_rx.clone();
        let ingress_task = tokio::spawn(async move {
            ingress.run(ingress_shutdown).await;
        });

        let sync_fallback_state = channel_state_rx.clone();
        let sync_fallback_shutdown = shutdown_rx.clone();
        let sync_fallback_task = tokio::spawn(async move {
            sync_fallback.run(sync_fallback_state, sync_fallback_shutdown).await;
        });

        readiness.set_ready();
        tracing::info!("edge-bridge daemon ready");

        // Wait for the process-level shutdown signal (ctrl_c/SIGTERM, driven
        // by main.rs) and fan it out to every component's own watch channel.
        let _ = shutdown_signal.changed().await;
        let _ = shutdown_tx.send(true);

        let tasks = vec![
            send_queue_task,
            scheduler_task,
            command_channel_task,
            ingress_task,
            sync_fallback_task,
        ];
        let join_all = futures_util::future::join_all(tasks);
        if tokio::time::timeout(SHUTDOWN_DEADLINE, join_all)
            .await
            .is_err()
        {
            tracing::warn!("⚠️ shutdown deadline exceeded, exiting anyway");
        }

        Ok(())
    }
}
