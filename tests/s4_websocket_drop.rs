//! S4: when the WebSocket command channel is not `Open`, HTTP sync takes
//! over within one `sync_interval_seconds` and delivers commands; once
//! the channel reports `Open` again, HTTP sync stops polling within one
//! more tick.

use std::sync::Arc;
use std::time::Duration;

use edge_bridge::backend_client::BackendClient;
use edge_bridge::command_channel::ChannelState;
use edge_bridge::command_handler::CommandHandler;
use edge_bridge::reflex::ReflexCoordinator;
use edge_bridge::scheduler::Scheduler;
use edge_bridge::sendqueue::{SendQueue, SendQueueConfig};
use edge_bridge::state::State;
use edge_bridge::sync_fallback::SyncFallback;
use edge_protocol::{Command, CommandPriority, CommandType, SyncResponse};
use edge_test_support::MockHttpBackend;
use tokio::sync::watch;

#[tokio::test]
async fn sync_fallback_tracks_the_channel_state_interlock() {
    let backend_mock = MockHttpBackend::start(None).await.unwrap();
    let backend =
        Arc::new(BackendClient::new(backend_mock.base_url(), "secret", "edge_1", 5000, 5).unwrap());

    let scheduler = Arc::new(Scheduler::open(":memory:").unwrap());
    let send_queue = SendQueue::new(SendQueueConfig::default());
    let reflex = Arc::new(ReflexCoordinator::new());
    let state = Arc::new(tokio::sync::Mutex::new(State::open(":memory:").unwrap()));
    let handler = Arc::new(CommandHandler::new(scheduler, send_queue, reflex, state.clone()));

    let fallback = SyncFallback::new(backend, handler, state, "edge_1", 1);

    let (channel_state_tx, channel_state_rx) = watch::channel(ChannelState::Open);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let fallback_task =
        tokio::spawn(async move { fallback.run(channel_state_rx, shutdown_rx).await });

    // WS reports Open: sync stays silent across more than one tick.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert_eq!(backend_mock.sync_requests().len(), 0);

    // Queue a command the backend will hand back on the next /edge/sync
    // poll, then drop the WS channel.
    let pending_command = Command {
        command_id: uuid::Uuid::new_v4(),
        command_type: CommandType::SendMessageNow,
        payload: serde_json::json!({"thread_id": "+15551230000", "text": "hi", "is_group": false}),
        priority: CommandPriority::Normal,
        timestamp: chrono::Utc::now(),
    };
    backend_mock.set_sync_response(SyncResponse {
        commands: vec![pending_command.clone()],
        ack_events: Vec::new(),
        config_updates: None,
    });
    channel_state_tx.send(ChannelState::Down).unwrap();

    // Sync resumes within one poll interval and the command gets acked.
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    assert!(backend_mock.sync_requests().len() >= 1);
    let acked = backend_mock.acked_commands();
    assert!(acked.iter().any(|a| a.command_id == pending_command.command_id));

    // Clear the canned response so a duplicate poll wouldn't re-ack, then
    // report the channel open again; sync should halt within one tick.
    backend_mock.set_sync_response(SyncResponse {
        commands: Vec::new(),
        ack_events: Vec::new(),
        config_updates: None,
    });
    channel_state_tx.send(ChannelState::Open).unwrap();
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    let count_after_recovery = backend_mock.sync_requests().len();

    tokio::time::sleep(Duration::from_millis(1_500)).await;
    assert_eq!(backend_mock.sync_requests().len(), count_after_recovery);

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(1), fallback_task).await;
}
