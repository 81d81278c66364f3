//! Per-session connection cooldown.
//!
//! Rapid reconnects to the same streaming session can wedge the streaming host,
//! so each session may open at most one relayed WebSocket per cooldown window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

/// Entries untouched for longer than this are dropped by the sweep.
const STALE_AFTER: Duration = Duration::from_secs(60);

/// The sweep only runs once the table grows past this many entries.
const SWEEP_THRESHOLD: usize = 100;

pub struct RateLimiter {
    cooldown: Duration,
    last_seen: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(cooldown: Duration) -> Self {
        Self {
            cooldown,
            last_seen: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` and records the attempt if the session is outside its
    /// cooldown; returns `false` without recording otherwise.
    pub fn allow(&self, session_id: &str) -> bool {
        self.allow_at(session_id, Instant::now())
    }

    pub(crate) fn allow_at(&self, session_id: &str, now: Instant) -> bool {
        let mut table = self
            .last_seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);

        if let Some(last) = table.get(session_id) {
            let since = now.saturating_duration_since(*last);
            if since < self.cooldown {
                debug!(
                    session_id,
                    since_ms = since.as_millis() as u64,
                    "Streaming connection rate limited"
                );
                return false;
            }
        }

        table.insert(session_id.to_string(), now);

        if table.len() > SWEEP_THRESHOLD {
            table.retain(|_, seen| now.saturating_duration_since(*seen) <= STALE_AFTER);
        }

        true
    }

    pub fn len(&self) -> usize {
        self.last_seen
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
