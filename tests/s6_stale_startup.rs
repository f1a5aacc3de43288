//! S6: a pending row whose `send_at` is far enough in the past at startup
//! is transitioned to `failed(reason="stale at startup")` rather than
//! fired, so a multi-hour outage never floods a backlog on restart. A row
//! that is merely a little overdue (inside `MAX_STALE_SECONDS`) is left
//! pending for the adaptive timer to pick up immediately instead.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use edge_bridge::scheduler::{Scheduler, MAX_STALE_SECONDS};
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

#[tokio::test]
async fn stale_pending_row_at_startup_is_failed_not_dispatched() {
    let scheduler = Scheduler::open(":memory:").unwrap();
    let stale_send_at =
        chrono::Utc::now() - chrono::Duration::seconds(MAX_STALE_SECONDS + 60);
    let id = scheduler
        .schedule("t1".into(), "hi".into(), stale_send_at, false, None)
        .await
        .unwrap();

    let recovered = scheduler.recover_stale_on_startup().await.unwrap();
    assert_eq!(recovered, 1);

    // Already flipped to `failed`; the claim path must see nothing to
    // dispatch.
    assert_eq!(scheduler.claim(id).await.unwrap(), None);
}

#[tokio::test(start_paused = true)]
async fn stale_row_is_never_handed_to_the_send_queue_via_run() {
    let scheduler = Arc::new(Scheduler::open(":memory:").unwrap());
    let stale_send_at =
        chrono::Utc::now() - chrono::Duration::seconds(MAX_STALE_SECONDS + 60);
    scheduler
        .schedule("t1".into(), "should not send".into(), stale_send_at, false, None)
        .await
        .unwrap();

    // Startup recovery runs before the adaptive loop starts, exactly as
    // the supervisor boot sequence does.
    let recovered = scheduler.recover_stale_on_startup().await.unwrap();
    assert_eq!(recovered, 1);

    let send_queue = SendQueue::new(SendQueueConfig::default());
    let sent = Arc::new(Mutex::new(Vec::new()));
    let transport: Arc<dyn Transport> = Arc::new(RecordingTransport { sent: sent.clone() });
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let scheduler_clone = scheduler.clone();
    let sq = send_queue.clone();
    let run_handle = tokio::spawn(async move {
        scheduler_clone.run(sq, shutdown_rx).await;
    });
    let drain_shutdown = {
        let (_tx, rx) = watch::channel(false);
        rx
    };
    let drain_handle = {
        let send_queue = send_queue.clone();
        let transport = transport.clone();
        tokio::spawn(async move { send_queue.run(transport, |_| {}, drain_shutdown).await })
    };

    tokio::time::advance(Duration::from_millis(500)).await;
    assert!(sent.lock().unwrap().is_empty());
    assert_eq!(send_queue.stats().await.enqueued, 0);

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(1), run_handle).await;
    drain_handle.abort();
}

#[tokio::test]
async fn mildly_overdue_row_inside_grace_window_stays_pending_for_immediate_claim() {
    let scheduler = Scheduler::open(":memory:").unwrap();
    // Overdue by less than MAX_STALE_SECONDS: must not be failed at startup.
    let barely_overdue = chrono::Utc::now() - chrono::Duration::seconds(MAX_STALE_SECONDS - 30);
    let id = scheduler
        .schedule("t1".into(), "hi".into(), barely_overdue, false, None)
        .await
        .unwrap();

    let recovered = scheduler.recover_stale_on_startup().await.unwrap();
    assert_eq!(recovered, 0);

    // Still pending, claimable by the normal adaptive path.
    assert!(scheduler.claim(id).await.unwrap().is_some());
}
