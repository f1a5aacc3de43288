//! The outbound half of Transport: rate limiting and the native chat-send
//! action, including batched multi-bubble sends with inter-bubble pauses.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use rand::Rng;
use tokio::time::Instant;
use tokio::process::Command;

use crate::sanitize::{sanitize_text, validate_thread_id, SanitizeError};

const RATE_LIMIT_WINDOW: Duration = Duration::from_secs(60);
const RATE_LIMIT_MAX: usize = 120;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("validation failed: {0}")]
    Validation(#[from] SanitizeError),
    #[error("rate limited for identifier '{identifier}'")]
    RateLimited { identifier: String },
    #[error("chat-send action failed: {0}")]
    ActionFailed(String),
}

/// Sliding-window rate limiter, 120 calls per 60 s per identifier (thread
/// id). Checked before every send; exceeding it is a distinguished
/// retryable error, not a plain `false` return, so `SendQueue` can tell a
/// rate-limit soft failure apart from a hard one.
#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Vec<Instant>>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an attempt for `identifier` and return `true` if it is
    /// permitted under the rolling window, `false` if it must be rejected.
    pub fn check(&self, identifier: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock().expect("rate limiter mutex poisoned");
        let entry = windows.entry(identifier.to_owned()).or_default();
        entry.retain(|t| now.duration_since(*t) < RATE_LIMIT_WINDOW);
        if entry.len() >= RATE_LIMIT_MAX {
            return false;
        }
        entry.push(now);
        true
    }
}

/// Computes the pause before the next bubble in a batched multi-bubble
/// send: base 1.0 s + min(len(prev)/50, 1.0) s + jitter in [-0.2, +0.2] s.
fn bubble_pause(prev_len: usize) -> Duration {
    let base = 1.0_f64;
    let length_term = (prev_len as f64 / 50.0).min(1.0);
    let jitter = rand::thread_rng().gen_range(-0.2..=0.2);
    let seconds = (base + length_term + jitter).max(0.0);
    Duration::from_secs_f64(seconds)
}

/// Drives the platform chat-send action. The concrete invocation is a
/// subprocess call (AppleScript via `osascript` on the real platform); this
/// struct owns only the sanitisation, rate limiting, and pacing policy —
/// the subprocess boundary is the single `run_action` method so tests can
/// substitute a fake binary.
pub struct NativeSender {
    rate_limiter: RateLimiter,
    action_binary: String,
}

impl NativeSender {
    pub fn new(action_binary: impl Into<String>) -> Self {
        Self {
            rate_limiter: RateLimiter::new(),
            action_binary: action_binary.into(),
        }
    }

    pub async fn send(&self, thread_id: &str, text: &str, is_group: bool) -> Result<(), SendError> {
        validate_thread_id(thread_id)?;
        let escaped = sanitize_text(text)?;
        if !self.rate_limiter.check(thread_id) {
            return Err(SendError::RateLimited {
                identifier: thread_id.to_owned(),
            });
        }
        self.run_action(thread_id, &[escaped], is_group, false).await
    }

    pub async fn send_multi(
        &self,
        thread_id: &str,
        bubbles: &[String],
        is_group: bool,
        batched: bool,
    ) -> Result<(), SendError> {
        validate_thread_id(thread_id)?;
        let mut escaped = Vec::with_capacity(bubbles.len());
        for bubble in bubbles {
            escaped.push(sanitize_text(bubble)?);
        }
        if !self.rate_limiter.check(thread_id) {
            return Err(SendError::RateLimited {
                identifier: thread_id.to_owned(),
            });
        }

        if batched {
            let pauses: Vec<u64> = (1..escaped.len())
                .map(|i| bubble_pause(escaped[i - 1].len()).as_millis() as u64)
                .collect();
            match self.run_action(thread_id, &escaped, &pauses, is_group, true).await {
                Ok(()) => return Ok(()),
                Err(_) => {
                    // Batched native invocation failed; fall back to
                    // sequential with the same inter-bubble pauses.
                }
            }
        }

        for (i, bubble) in escaped.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(bubble_pause(escaped[i - 1].len())).await;
            }
            self.run_action(thread_id, std::slice::from_ref(bubble), &[], is_group, false)
                .await?;
        }
        Ok(())
    }

    /// Invoke the native chat-send action. A single invocation, even for a
    /// batched multi-bubble send: the per-invocation subprocess overhead
    /// dominates, so the pauses between bubbles are passed as `--pause`
    /// (milliseconds) arguments interleaved after each `--bubble` but the
    /// last, rather than issuing N invocations with an `await`ed sleep
    /// between them.
    async fn run_action(
        &self,
        thread_id: &str,
        bubbles: &[String],
        pause_ms: &[u64],
        is_group: bool,
        batched: bool,
    ) -> Result<(), SendError> {
        let mut cmd = Command::new(&self.action_binary);
        cmd.arg("--thread").arg(thread_id);
        cmd.arg("--group").arg(is_group.to_string());
        cmd.arg("--batched").arg(batched.to_string());
        for (i, bubble) in bubbles.iter().enumerate() {
            cmd.arg("--bubble").arg(bubble);
            if let Some(pause) = pause_ms.get(i) {
                cmd.arg("--pause").arg(pause.to_string());
            }
        }
        let status = cmd
            .status()
            .await
            .map_err(|e| SendError::ActionFailed(e.to_string()))?;
        if status.success() {
            Ok(())
        } else {
            Err(SendError::ActionFailed(format!(
                "exit status {status}"
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limiter_allows_up_to_max_then_rejects() {
        let limiter = RateLimiter::new();
        for _ in 0..RATE_LIMIT_MAX {
            assert!(limiter.check("t1"));
        }
        assert!(!limiter.check("t1"));
    }

    #[test]
    fn rate_limiter_is_per_identifier() {
        let limiter = RateLimiter::new();
        for _ in 0..RATE_LIMIT_MAX {
            assert!(limiter.check("t1"));
        }
        assert!(limiter.check("t2"));
    }

    #[test]
    fn bubble_pause_is_bounded() {
        for prev_len in [0, 50, 500] {
            let pause = bubble_pause(prev_len);
            assert!(pause.as_secs_f64() >= 0.0);
            assert!(pause.as_secs_f64() <= 2.2);
        }
    }
}
