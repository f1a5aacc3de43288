//! The reflex-suppression map and the WS/HTTP fallback interlock, both
//! modeled as serialised-access coordinator objects rather than raw shared
//! fields: the map is written from `CommandChannel` and read-and-deleted
//! from the ingress loop, so direct field access would race.

use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

const REFLEX_TTL: Duration = Duration::from_secs(10);

struct ReflexEntry {
    text: String,
    recorded_at: Instant,
}

/// Serialises access to the thread_id -> {text, ts} reflex map.
pub struct ReflexCoordinator {
    entries: Mutex<HashMap<String, ReflexEntry>>,
}

impl ReflexCoordinator {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a reflex bubble just delivered via the WebSocket path.
    pub async fn record(&self, thread_id: &str, text: &str) {
        let mut entries = self.entries.lock().await;
        entries.insert(
            thread_id.to_owned(),
            ReflexEntry {
                text: text.to_owned(),
                recorded_at: Instant::now(),
            },
        );
    }

    /// If the given thread has a live (non-expired) reflex entry whose text
    /// matches `candidate`, consume it (delete and return `true`) so the
    /// ingress loop can drop the duplicate first bubble of an HTTP
    /// response. Expired entries are evicted as a side effect regardless of
    /// match.
    pub async fn consume_if_matches(&self, thread_id: &str, candidate: &str) -> bool {
        let mut entries = self.entries.lock().await;
        let Some(entry) = entries.get(thread_id) else {
            return false;
        };
        if entry.recorded_at.elapsed() > REFLEX_TTL {
            entries.remove(thread_id);
            return false;
        }
        if entry.text == candidate {
            entries.remove(thread_id);
            true
        } else {
            false
        }
    }
}

impl Default for ReflexCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
