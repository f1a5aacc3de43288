//! S3: a burst of sends for one identifier never exceeds the Transport's
//! rate ceiling (120 per rolling 60s window) no matter how fast they are
//! enqueued, SendQueue absorbs the overflow as backpressure rather than
//! dropping it, and every job is still eventually delivered.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use edge_bridge::sendqueue::{JobPayload, SendQueue, SendQueueConfig};
use edge_bridge::transport::{DbError, IncomingMessage, RateLimiter, SendError, Transport};
use tokio::sync::watch;
use tokio::time::Instant;

/// Wraps the real sliding-window `RateLimiter` so the test observes the
/// same ceiling `NativeSender` enforces, without shelling out to a real
/// send action.
struct RateLimitedFakeTransport {
    limiter: RateLimiter,
    delivered_at: Mutex<Vec<Instant>>,
}

#[async_trait]
impl Transport for RateLimitedFakeTransport {
    async fn poll_new(&self, _w: i64, _l: u32) -> Result<Vec<IncomingMessage>, DbError> {
        Ok(Vec::new())
    }

    async fn send(&self, thread_id: &str, _text: &str, _is_group: bool) -> Result<(), SendError> {
        if !self.limiter.check(thread_id) {
            return Err(SendError::RateLimited {
                identifier: thread_id.to_owned(),
            });
        }
        self.delivered_at.lock().unwrap().push(Instant::now());
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
async fn burst_enqueue_respects_rate_ceiling_and_eventually_delivers_all() {
    const TOTAL_JOBS: usize = 150;
    const MAX_QUEUE: usize = 500;

    let send_queue = SendQueue::new(SendQueueConfig {
        max_queue: MAX_QUEUE,
        // Generous TTL: the property under test is the rate ceiling and
        // eventual delivery, not TTL interaction with backoff.
        ttl_ms: 300_000,
        ..SendQueueConfig::default()
    });

    // Enqueue the whole burst "in one second", i.e. before any draining
    // happens.
    for i in 0..TOTAL_JOBS {
        let enqueued = send_queue
            .enqueue(
                "+15551230000".into(),
                false,
                JobPayload::Single(format!("msg-{i}")),
            )
            .await;
        assert!(enqueued, "queue depth must stay within max_queue for this burst size");
    }
    assert!(send_queue.stats().await.depth <= MAX_QUEUE);

    let transport = Arc::new(RateLimitedFakeTransport {
        limiter: RateLimiter::new(),
        delivered_at: Mutex::new(Vec::new()),
    });
    let transport_dyn: Arc<dyn Transport> = transport.clone();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let sq = send_queue.clone();
    let run_handle = tokio::spawn(async move {
        sq.run(transport_dyn, |_| {}, shutdown_rx).await;
    });

    // Advance simulated time in drain-tick-sized steps well past the
    // point every job should have cleared the rate ceiling.
    for _ in 0..750 {
        tokio::time::advance(Duration::from_millis(200)).await;
        if send_queue.stats().await.delivered as usize == TOTAL_JOBS {
            break;
        }
    }

    let stats = send_queue.stats().await;
    assert_eq!(stats.dropped, 0, "no job should be dropped for being rate limited");
    assert_eq!(
        stats.delivered as usize, TOTAL_JOBS,
        "every enqueued job must eventually be delivered"
    );

    let _ = shutdown_tx.send(true);
    let _ = tokio::time::timeout(Duration::from_secs(1), run_handle).await;

    // Rate ceiling: in any rolling 60s window, at most 120 sends went
    // through for this identifier.
    let timestamps = transport.delivered_at.lock().unwrap().clone();
    assert_eq!(timestamps.len(), TOTAL_JOBS);
    for &t in &timestamps {
        let window_start = t - Duration::from_secs(60);
        let count_in_window = timestamps
            .iter()
            .filter(|&&other| other <= t && other >= window_start)
            .count();
        assert!(
            count_in_window <= 120,
            "rate ceiling exceeded: {count_in_window} sends in the 60s window ending at {t:?}"
        );
    }
}

#[tokio::test(start_paused = true)]
async fn depth_never_exceeds_max_queue_and_enqueue_fails_past_capacity() {
    let send_queue = SendQueue::new(SendQueueConfig {
        max_queue: 5,
        ..SendQueueConfig::default()
    });

    for i in 0..5 {
        assert!(
            send_queue
                .enqueue("t1".into(), false, JobPayload::Single(format!("m{i}")))
                .await
        );
    }
    assert!(
        !send_queue
            .enqueue("t1".into(), false, JobPayload::Single("overflow".into()))
            .await,
        "enqueue past max_queue must return false"
    );
    assert_eq!(send_queue.stats().await.depth, 5);
}
