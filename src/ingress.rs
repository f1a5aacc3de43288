//! Ingress loop (C7): polls Transport for new messages, forwards each to
//! the backend, and dispatches the classified response into SendQueue and
//! Scheduler.
//!
//! Per-thread inbound ordering is preserved by advancing the watermark only
//! at batch boundaries: a batch of up to `parallel` messages is forwarded
//! concurrently, but the next poll never starts past a row whose sibling in
//! the same batch hasn't finished yet.

use std::sync::Arc;
use std::time::Duration;

use edge_protocol::{AttachmentSummary, ForwardMessageRequest, ReplyClassification, ThreadMode};
use futures_util::future::join_all;
use tokio::sync::watch;
use tracing::instrument;

use crate::backend_client::BackendClient;
use crate::reflex::ReflexCoordinator;
use crate::scheduler::Scheduler;
use crate::sendqueue::{JobPayload, SendQueue};
use crate::state::State;
use crate::transport::{IncomingMessage, Transport};

pub struct IngressLoop {
    transport: Arc<dyn Transport>,
    backend: Arc<BackendClient>,
    send_queue: SendQueue,
    scheduler: Arc<Scheduler>,
    reflex: Arc<ReflexCoordinator>,
    state: Arc<tokio::sync::Mutex<State>>,
    poll_interval: Duration,
    batch_size: usize,
    max_messages_per_poll: u32,
    batch_applescript_sends: bool,
}

impl IngressLoop {
    pub fn new(
        transport: Arc<dyn Transport>,
        backend: Arc<BackendClient>,
        send_queue: SendQueue,
        scheduler: Arc<Scheduler>,
        reflex: Arc<ReflexCoordinator>,
        state: Arc<tokio::sync::Mutex<State>>,
        poll_interval_seconds: u64,
        batch_size: usize,
        max_messages_per_poll: u32,
        batch_applescript_sends: bool,
    ) -> Self {
        Self {
            transport,
            backend,
            send_queue,
            scheduler,
            reflex,
            state,
            poll_interval: Duration::from_secs(poll_interval_seconds),
            batch_size: batch_size.max(1),
            max_messages_per_poll,
            batch_applescript_sends,
        }
    }

    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut tick = tokio::time::interval(self.poll_interval);
        loop {
            tokio::select! {
                _ = tick.tick() => {
                    self.tick().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                }
            }
        }
    }

    async fn tick(&self) {
        let watermark = { self.state.lock().await.watermark().unwrap_or(0) };
        let messages = match self
            .transport
            .poll_new(watermark, self.max_messages_per_poll)
            .await
        {
            Ok(messages) => messages,
            Err(e) => {
                tracing::error!(error = %e, "❌ ingress poll failed");
                return;
            }
        };
        if messages.is_empty() {
            return;
        }

        for batch in messages.chunks(self.batch_size) {
            let futures = batch.iter().map(|m| self.process_one(m));
            join_all(futures).await;

            // Ascending row-id order is an invariant of `Transport::poll_new`;
            // the watermark only needs the last row in the batch.
            if let Some(last) = batch.last() {
                let state = self.state.lock().await;
                if let Err(e) = state.advance_watermark(last.row_id) {
                    tracing::error!(error = %e, "❌ failed to advance watermark");
                }
            }
        }
    }

    async fn process_one(&self, message: &IncomingMessage) {
        let request = build_forward_request(message);
        let response = match self.backend.forward_message(&request).await {
            Ok(resp) => resp,
            Err(e) => {
                tracing::error!(error = %e, thread_id = %message.thread_id, "❌ forward_message failed");
                return;
            }
        };

        match response.classify() {
            ReplyClassification::NoReply => {}
            ReplyClassification::ReflexAndBurst {
                reflex,
                burst,
                burst_delay_ms,
            } => {
                self.reflex.record(&message.thread_id, &reflex).await;
                self.send_queue
                    .enqueue(
                        message.thread_id.clone(),
                        message.is_group,
                        JobPayload::Single(reflex),
                    )
                    .await;
                if !burst.is_empty() {
                    let send_at =
                        chrono::Utc::now() + chrono::Duration::milliseconds(burst_delay_ms as i64);
                    for (i, bubble) in burst.into_iter().enumerate() {
                        // Stagger identical sends slightly so ordering is
                        // preserved even though Scheduler claims are
                        // independent rows.
                        let bubble_send_at =
                            send_at + chrono::Duration::milliseconds(i as i64 * 10);
                        if let Err(e) = self
                            .scheduler
                            .schedule(
                                message.thread_id.clone(),
                                bubble,
                                bubble_send_at,
                                message.is_group,
                                None,
                            )
                            .await
                        {
                            tracing::error!(error = %e, "❌ failed to schedule burst bubble");
                        }
                    }
                }
            }
            ReplyClassification::LegacyBubbles(bubbles) => {
                let mut bubbles = bubbles;
                if let Some(first) = bubbles.first().cloned() {
                    if self
                        .reflex
                        .consume_if_matches(&message.thread_id, &first)
                        .await
                    {
                        bubbles.remove(0);
                    }
                }
                if !bubbles.is_empty() {
                    self.send_queue
                        .enqueue(
                            message.thread_id.clone(),
                            message.is_group,
                            JobPayload::Multi {
                                bubbles,
                                batched: self.batch_applescript_sends,
                            },
                        )
                        .await;
                }
            }
            ReplyClassification::SingleText(text) => {
                self.send_queue
                    .enqueue(
                        message.thread_id.clone(),
                        message.is_group,
                        JobPayload::Single(text),
                    )
                    .await;
            }
        }
    }
}

fn build_forward_request(message: &IncomingMessage) -> ForwardMessageRequest {
    let attachments = if message.attachments.is_empty() {
        None
    } else {
        Some(
            message
                .attachments
                .iter()
                .map(|a| AttachmentSummary {
                    id: a.id.clone(),
                    guid: a.guid.clone(),
                    filename: a.filename.clone(),
                    mime: a.mime.clone(),
                    uti: a.uti.clone(),
                    size: a.size,
                    is_sticker: a.is_sticker,
                    is_outgoing: a.is_outgoing,
                })
                .collect(),
        )
    };

    ForwardMessageRequest {
        chat_guid: message.thread_id.clone(),
        mode: if message.is_group {
            ThreadMode::Group
        } else {
            ThreadMode::Direct
        },
        sender: message.sender.clone(),
        text: message.text.clone(),
        timestamp: message.timestamp,
        participants: message.participants.clone(),
        metadata: None,
        context: None,
        attachments,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sendqueue::SendQueueConfig;
    use crate::transport::{Attachment, DbError, SendError};
    use edge_test_support::MockHttpBackend;

    struct FakeTransport {
        messages: Vec<IncomingMessage>,
    }

    #[async_trait::async_trait]
    impl Transport for FakeTransport {
        async fn poll_new(&self, watermark: i64, _limit: u32) -> Result<Vec<IncomingMessage>, DbError> {
            Ok(self
                .messages
                .iter()
                .filter(|m| m.row_id > watermark)
                .cloned()
                .collect())
        }
        async fn send(&self, _t: &str, _x: &str, _g: bool) -> Result<(), SendError> {
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

    fn incoming(row_id: i64) -> IncomingMessage {
        IncomingMessage {
            row_id,
            thread_id: "+15551230000".into(),
            is_group: false,
            sender: "+15551230000".into(),
            text: "hey".into(),
            timestamp: chrono::Utc::now(),
            participants: vec!["+15551230000".into()],
            attachments: Vec::<Attachment>::new(),
        }
    }

    #[tokio::test]
    async fn single_text_reply_is_enqueued_and_watermark_advances() {
        let backend_mock = MockHttpBackend::start(None).await.unwrap();
        backend_mock.set_forward_response(edge_protocol::ForwardMessageResponse {
            should_respond: true,
            reply_text: Some("hi there".into()),
            reply_bubbles: None,
            reflex_message: None,
            burst_messages: None,
            burst_delay_ms: None,
        });
        let backend =
            Arc::new(BackendClient::new(backend_mock.base_url(), "secret", "edge_1", 5000, 5).unwrap());

        let transport: Arc<dyn Transport> = Arc::new(FakeTransport {
            messages: vec![incoming(1)],
        });
        let send_queue = SendQueue::new(SendQueueConfig::default());
        let scheduler = Arc::new(Scheduler::open_in_memory().unwrap());
        let reflex = Arc::new(ReflexCoordinator::new());
        let state = Arc::new(tokio::sync::Mutex::new(State::open_in_memory().unwrap()));

        let ingress = IngressLoop::new(
            transport,
            backend,
            send_queue.clone(),
            scheduler,
            reflex,
            state.clone(),
            1,
            3,
            100,
            true,
        );
        ingress.tick().await;

        assert_eq!(send_queue.stats().await.enqueued, 1);
        assert_eq!(state.lock().await.watermark().unwrap(), 1);
    }

    #[tokio::test]
    async fn no_reply_does_not_enqueue_but_still_advances_watermark() {
        let backend_mock = MockHttpBackend::start(None).await.unwrap();
        let backend =
            Arc::new(BackendClient::new(backend_mock.base_url(), "secret", "edge_1", 5000, 5).unwrap());
        let transport: Arc<dyn Transport> = Arc::new(FakeTransport {
            messages: vec![incoming(1)],
        });
        let send_queue = SendQueue::new(SendQueueConfig::default());
        let scheduler = Arc::new(Scheduler::open_in_memory().unwrap());
        let reflex = Arc::new(ReflexCoordinator::new());
        let state = Arc::new(tokio::sync::Mutex::new(State::open_in_memory().unwrap()));

        let ingress = IngressLoop::new(
            transport, backend, send_queue.clone(), scheduler, reflex, state.clone(), 1, 3, 100, true,
        );
        ingress.tick().await;

        assert_eq!(send_queue.stats().await.enqueued, 0);
        assert_eq!(state.lock().await.watermark().unwrap(), 1);
    }
}
