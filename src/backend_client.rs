//! BackendClient (C3): Bearer-authenticated HTTP calls to the orchestrator.
//!
//! Retry policy per call: at most two attempts. Connection-reset/refused is
//! retried once with a linear 5 s × attempt pause. A 60 s timeout is never
//! retried (the backend may still be processing; a double-send must be
//! avoided). 401 disables further attempts and is surfaced as a permanent
//! auth failure. 429 surfaces `retry_after` and is left to the caller.

use std::time::Duration;

use edge_protocol::{AckCommandRequest, ForwardMessageRequest, ForwardMessageResponse, SyncRequest, SyncResponse};
use reqwest::{Client, StatusCode};
use tracing::instrument;

const MAX_ATTEMPTS: u32 = 2;
const RETRY_STEP: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("authentication rejected by backend")]
    Auth,
    #[error("rate limited, retry after {retry_after}s")]
    RateLimited { retry_after: u64 },
    #[error("request timed out")]
    Timeout,
    #[error("transient network failure after retries: {0}")]
    Transient(String),
    #[error("unexpected backend response: status {0}")]
    UnexpectedStatus(u16),
    #[error("request error: {0}")]
    Request(String),
}

pub struct BackendClient {
    client: Client,
    base_url: String,
    secret: String,
    agent_id: String,
}

impl BackendClient {
    pub fn new(base_url: impl Into<String>, secret: impl Into<String>, agent_id: impl Into<String>, timeout_ms: u64, pool_size: usize) -> Result<Self, BackendError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(timeout_ms))
            .pool_max_idle_per_host(pool_size.min(2))
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| BackendError::Request(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            secret: secret.into(),
            agent_id: agent_id.into(),
        })
    }

    #[instrument(skip(self, req))]
    pub async fn forward_message(
        &self,
        req: &ForwardMessageRequest,
    ) -> Result<ForwardMessageResponse, BackendError> {
        self.call_with_retry(|| {
            self.client
                .post(format!("{}/edge/message", self.base_url))
                .bearer_auth(&self.secret)
                .header("X-Edge-Agent-Id", &self.agent_id)
                .json(req)
        })
        .await
    }

    #[instrument(skip(self))]
    pub async fn acknowledge_command(
        &self,
        command_id: uuid::Uuid,
        success: bool,
        error: Option<String>,
    ) -> Result<(), BackendError> {
        let body = AckCommandRequest {
            command_id,
            success,
            error,
        };
        let _: serde_json::Value = self
            .call_with_retry(|| {
                self.client
                    .post(format!("{}/edge/command/ack", self.base_url))
                    .bearer_auth(&self.secret)
                    .header("X-Edge-Agent-Id", &self.agent_id)
                    .json(&body)
            })
            .await
            .or_else(|e| match e {
                // An empty/non-JSON ack response body still counts as a
                // successful acknowledgement; only surface real failures.
                BackendError::Request(_) => Ok(serde_json::Value::Null),
                other => Err(other),
            })?;
        Ok(())
    }

    pub async fn sync(&self, req: &SyncRequest) -> Result<SyncResponse, BackendError> {
        self.call_with_retry(|| {
            self.client
                .post(format!("{}/edge/sync", self.base_url))
                .bearer_auth(&self.secret)
                .header("X-Edge-Agent-Id", &self.agent_id)
                .json(req)
        })
        .await
    }

    pub async fn health(&self) -> bool {
        self.client
            .get(format!("{}/health", self.base_url))
            .send()
            .await
            .map(|r| r.status().is_success())
            .unwrap_or(false)
    }

    async fn call_with_retry<T, F>(&self, build: F) -> Result<T, BackendError>
    where
        T: serde::de::DeserializeOwned,
        F: Fn() -> reqwest::RequestBuilder,
    {
        let mut attempt = 1u32;
        loop {
            let result = build().send().await;
            match result {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::UNAUTHORIZED {
                        return Err(BackendError::Auth);
                    }
                    if status == StatusCode::TOO_MANY_REQUESTS {
                        let retry_after = resp
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse().ok())
                            .unwrap_or(60);
                        return Err(BackendError::RateLimited { retry_after });
                    }
                    if status.is_success() {
                        return resp
                            .json::<T>()
                            .await
                            .map_err(|e| BackendError::Request(e.to_string()));
                    }
                    return Err(BackendError::UnexpectedStatus(status.as_u16()));
                }
                Err(e) if e.is_timeout() => {
                    tracing::error!("❌ backend request timed out, not retrying");
                    return Err(BackendError::Timeout);
                }
                Err(e) if is_connection_error(&e) && attempt < MAX_ATTEMPTS => {
                    tracing::warn!(attempt, "⚠️ transient backend failure, retrying");
                    tokio::time::sleep(RETRY_STEP * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(BackendError::Transient(e.to_string()));
                }
            }
        }
    }
}

fn is_connection_error(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_request()
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_test_support::MockHttpBackend;

    #[tokio::test]
    async fn forward_message_round_trips_through_mock_backend() {
        let backend = MockHttpBackend::start(Some("secret".into())).await.unwrap();
        backend.set_forward_response(ForwardMessageResponse {
            should_respond: true,
            reply_text: Some("hi".into()),
            reply_bubbles: None,
            reflex_message: None,
            burst_messages: None,
            burst_delay_ms: None,
        });

        let client = BackendClient::new(backend.base_url(), "secret", "edge_1", 5000, 5).unwrap();
        let req = ForwardMessageRequest {
            chat_guid: "c1".into(),
            mode: edge_protocol::ThreadMode::Direct,
            sender: "+1".into(),
            text: "hello".into(),
            timestamp: chrono::Utc::now(),
            participants: vec!["+1".into()],
            metadata: None,
            context: None,
            attachments: None,
        };
        let resp = client.forward_message(&req).await.unwrap();
        assert!(resp.should_respond);
        assert_eq!(backend.forwarded_messages().len(), 1);
    }

    #[tokio::test]
    async fn wrong_token_surfaces_auth_error() {
        let backend = MockHttpBackend::start(Some("secret".into())).await.unwrap();
        let client = BackendClient::new(backend.base_url(), "wrong", "edge_1", 5000, 5).unwrap();
        let req = ForwardMessageRequest {
            chat_guid: "c1".into(),
            mode: edge_protocol::ThreadMode::Direct,
            sender: "+1".into(),
            text: "hello".into(),
            timestamp: chrono::Utc::now(),
            participants: vec![],
            metadata: None,
            context: None,
            attachments: None,
        };
        let err = client.forward_message(&req).await.unwrap_err();
        assert!(matches!(err, BackendError::Auth));
    }

    #[tokio::test]
    async fn health_reflects_mock_backend() {
        let backend = MockHttpBackend::start(None).await.unwrap();
        let client = BackendClient::new(backend.base_url(), "x", "edge_1", 5000, 5).unwrap();
        assert!(client.health().await);
    }
}
