//! SendQueue (C2): a strictly FIFO, bounded, in-memory queue of send jobs
//! sitting in front of `Transport`. One head-of-queue dispatch per drain
//! tick, so the underlying chat-send rate limit is never pressured by more
//! than one attempt at a time.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::instrument;

use crate::transport::{SendError, Transport};

pub const DEFAULT_MAX_QUEUE: usize = 500;
pub const DEFAULT_MAX_RETRIES: u32 = 3;
pub const DEFAULT_RETRY_BASE_MS: u64 = 2000;
pub const DEFAULT_TTL_MS: u64 = 120_000;
pub const DEFAULT_DRAIN_TICK_MS: u64 = 200;

#[derive(Debug, Clone, Copy)]
pub struct SendQueueConfig {
    pub max_queue: usize,
    pub max_retries: u32,
    pub retry_base_ms: u64,
    pub ttl_ms: u64,
    pub drain_tick_ms: u64,
}

impl Default for SendQueueConfig {
    fn default() -> Self {
        Self {
            max_queue: DEFAULT_MAX_QUEUE,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_base_ms: DEFAULT_RETRY_BASE_MS,
            ttl_ms: DEFAULT_TTL_MS,
            drain_tick_ms: DEFAULT_DRAIN_TICK_MS,
        }
    }
}

/// A job's payload: one bubble or a pre-batched multi-bubble sequence.
#[derive(Debug, Clone)]
pub enum JobPayload {
    Single(String),
    Multi { bubbles: Vec<String>, batched: bool },
}

#[derive(Debug, Clone)]
pub struct Job {
    pub thread_id: String,
    pub is_group: bool,
    pub payload: JobPayload,
    added_at: Instant,
    attempts: u32,
    last_attempt: Option<Instant>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SendQueueStats {
    pub depth: usize,
    pub enqueued: u64,
    pub delivered: u64,
    pub dropped: u64,
}

struct Inner {
    queue: VecDeque<Job>,
    stats: SendQueueStats,
}

/// The bounded FIFO itself. Cheaply cloneable; internals are behind an
/// `Arc<Mutex<_>>` so the drain loop and the enqueue callers (CommandHandler,
/// ingress) can share one queue across tasks.
#[derive(Clone)]
pub struct SendQueue {
    inner: Arc<Mutex<Inner>>,
    config: SendQueueConfig,
}

impl SendQueue {
    pub fn new(config: SendQueueConfig) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                queue: VecDeque::new(),
                stats: SendQueueStats::default(),
            })),
            config,
        }
    }

    /// Enqueue a job. Returns `false` if the queue is already at
    /// `max_queue` depth; the caller decides whether that fails the
    /// originating command.
    pub async fn enqueue(&self, thread_id: String, is_group: bool, payload: JobPayload) -> bool {
        let mut inner = self.inner.lock().await;
        if inner.queue.len() >= self.config.max_queue {
            return false;
        }
        inner.queue.push_back(Job {
            thread_id,
            is_group,
            payload,
            added_at: Instant::now(),
            attempts: 0,
            last_attempt: None,
        });
        inner.stats.enqueued += 1;
        true
    }

    pub async fn stats(&self) -> SendQueueStats {
        let inner = self.inner.lock().await;
        SendQueueStats {
            depth: inner.queue.len(),
            ..inner.stats
        }
    }

    /// Run the drain loop until `shutdown` fires. One attempt per tick.
    #[instrument(skip(self, transport, on_delivered, shutdown))]
    pub async fn run(
        &self,
        transport: Arc<dyn Transport>,
        on_delivered: impl Fn(&Job) + Send + Sync + 'static,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        let mut tick = tokio::time::interval(Duration::from_millis(self.config.drain_tick_ms));
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.drain_one(&transport, &on_delivered).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn drain_one(&self, transport: &Arc<dyn Transport>, on_delivered: &impl Fn(&Job)) {
        let now = Instant::now();
        let mut job = {
            let mut inner = self.inner.lock().await;
            let Some(front) = inner.queue.front() else {
                return;
            };

            if now.duration_since(front.added_at).as_millis() as u64 > self.config.ttl_ms {
                let dropped = inner.queue.pop_front().expect("front checked above");
                inner.stats.dropped += 1;
                tracing::warn!(thread_id = %dropped.thread_id, "⚠️ dropping job past ttl");
                return;
            }

            if front.attempts > 0 {
                let backoff =
                    self.config.retry_base_ms * 2u64.pow(front.attempts - 1);
                let elapsed = front
                    .last_attempt
                    .map(|t| now.duration_since(t).as_millis() as u64)
                    .unwrap_or(u64::MAX);
                if elapsed < backoff {
                    return;
                }
            }

            inner.queue.front().expect("front checked above").clone()
        };

        job.attempts += 1;
        job.last_attempt = Some(now);

        let result = match &job.payload {
            JobPayload::Single(text) => transport.send(&job.thread_id, text, job.is_group).await,
            JobPayload::Multi { bubbles, batched } => {
                transport
                    .send_multi(&job.thread_id, bubbles, job.is_group, *batched)
                    .await
            }
        };

        match result {
            Ok(()) => {
                let mut inner = self.inner.lock().await;
                inner.queue.pop_front();
                inner.stats.delivered += 1;
                drop(inner);
                on_delivered(&job);
            }
            Err(SendError::RateLimited { .. }) => {
                tracing::warn!(thread_id = %job.thread_id, "⚠️ rate limited, retrying next tick");
                self.requeue_front_attempt(job).await;
            }
            Err(e) => {
                tracing::error!(thread_id = %job.thread_id, error = %e, "❌ send failed");
                if job.attempts >= self.config.max_retries {
                    let mut inner = self.inner.lock().await;
                    inner.queue.pop_front();
                    inner.stats.dropped += 1;
                } else {
                    self.requeue_front_attempt(job).await;
                }
            }
        }
    }

    async fn requeue_front_attempt(&self, job: Job) {
        let mut inner = self.inner.lock().await;
        if let Some(front) = inner.queue.front_mut() {
            front.attempts = job.attempts;
            front.last_attempt = job.last_attempt;
        }
    }
}
