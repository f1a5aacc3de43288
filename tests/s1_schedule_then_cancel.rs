//! S1: a scheduled message fires at its due time; a cancel issued before
//! the due time suppresses it entirely.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use edge_bridge::scheduler::Scheduler;
use edge_bridge::sendqueue::{SendQueue, SendQueueConfig};
use edge_bridge::transport::{DbError, IncomingMessage, SendError, Transport};
use tokio::sync::watch;

struct RecordingTransport {
    sent: Arc<Mutex<Vec<(String, String)>>>,
}

#[async_trait]
impl Transport for RecordingTransport {
    async fn poll_new(&self, _w: i64, _l: u32) -> Result<Vec<IncomingMessage>, DbError> {
        Ok(Vec::new())
    }
    async fn send(&self, thread_id: &str, text: &str, _is_group: bool) -> Result<(), SendError> {
        self.sent
            .lock()
            .unwrap()
            .push((thread_id.to_owned(), text.to_owned()));
        Ok(())
    }
    async fn send_multi(
        &self,
        _t: &str,
        _b: &[String],
        _g: bool,
        _batched: bool,
    ) -> Result<(), SendError> {
        Ok(())
    }
}

#[tokio::test(start_paused = true)]
async fn scheduled_message_fires_at_due_time() {
    let scheduler = Arc::new(Scheduler::open(":memory:").unwrap());
    let send_queue = SendQueue::new(SendQueueConfig::default());
    let sent = Arc::new(Mutex::new(Vec::new()));
    let transport: Arc<dyn Transport> = Arc::new(RecordingTransport { sent: sent.clone() });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = {
        let scheduler = scheduler.clone();
        let send_queue = send_queue.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(send_queue, shutdown_rx).await })
    };
    let drain_task = {
        let send_queue = send_queue.clone();
        let transport = transport.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { send_queue.run(transport, |_| {}, shutdown_rx).await })
    };

    scheduler
        .schedule(
            "t1".into(),
            "hi".into(),
            chrono::Utc::now() + chrono::Duration::seconds(2),
            false,
            None,
        )
        .await
        .unwrap();

    tokio::time::advance(Duration::from_millis(2_200)).await;
    tokio::time::advance(Duration::from_millis(300)).await;

    assert_eq!(*sent.lock().unwrap(), vec![("t1".to_owned(), "hi".to_owned())]);

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(1), scheduler_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), drain_task).await;
}

#[tokio::test(start_paused = true)]
async fn cancel_before_due_time_suppresses_dispatch() {
    let scheduler = Arc::new(Scheduler::open(":memory:").unwrap());
    let send_queue = SendQueue::new(SendQueueConfig::default());
    let sent = Arc::new(Mutex::new(Vec::new()));
    let transport: Arc<dyn Transport> = Arc::new(RecordingTransport { sent: sent.clone() });

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let scheduler_task = {
        let scheduler = scheduler.clone();
        let send_queue = send_queue.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { scheduler.run(send_queue, shutdown_rx).await })
    };
    let drain_task = {
        let send_queue = send_queue.clone();
        let transport = transport.clone();
        let shutdown_rx = shutdown_rx.clone();
        tokio::spawn(async move { send_queue.run(transport, |_| {}, shutdown_rx).await })
    };

    let id = scheduler
        .schedule(
            "t1".into(),
            "should not send".into(),
            chrono::Utc::now() + chrono::Duration::seconds(2),
            false,
            None,
        )
        .await
        .unwrap();

    tokio::time::advance(Duration::from_secs(1)).await;
    assert!(scheduler.cancel(id).await.unwrap());

    tokio::time::advance(Duration::from_millis(2_000)).await;

    assert!(sent.lock().unwrap().is_empty());

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(1), scheduler_task).await;
    let _ = tokio::time::timeout(Duration::from_secs(1), drain_task).await;
}
