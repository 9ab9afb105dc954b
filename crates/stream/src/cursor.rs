//! Cursor tokens for CDN request collapsing.
//!
//! Live readers echo an opaque cursor; the server derives it from fixed
//! time intervals so equivalent waiters share a cache key, and bumps it
//! past any client-supplied value so polling never loops on a cached
//! response.

use chrono::{DateTime, Utc};
use rand::Rng;

/// Cursor derivation parameters.
#[derive(Debug, Clone)]
pub struct CursorConfig {
    /// Interval duration in seconds.
    pub interval_seconds: u64,
    /// Epoch the interval count is measured from.
    pub epoch: DateTime<Utc>,
}

impl Default for CursorConfig {
    fn default() -> Self {
        Self {
            interval_seconds: 20,
            epoch: DateTime::parse_from_rfc3339("2024-10-09T00:00:00Z")
                .unwrap()
                .with_timezone(&Utc),
        }
    }
}

impl CursorConfig {
    /// Number of whole intervals elapsed since the epoch.
    pub fn current_interval(&self) -> u64 {
        let elapsed = Utc::now()
            .signed_duration_since(self.epoch)
            .num_seconds()
            .max(0) as u64;
        elapsed / self.interval_seconds.max(1)
    }

    /// Produce the cursor to hand back for a request that echoed
    /// `client_cursor`. The result never moves backward, and a client
    /// at or ahead of the current interval gets jitter added so the
    /// token still advances.
    pub fn next_cursor(&self, client_cursor: Option<&str>) -> String {
        let current = self.current_interval();
        let value = match client_cursor.and_then(|c| c.parse::<u64>().ok()) {
            Some(cursor) if cursor >= current => {
                let jitter_seconds: u64 = rand::thread_rng().gen_range(1..=3600);
                let jitter = (jitter_seconds / self.interval_seconds.max(1)).max(1);
                cursor + jitter
            }
            Some(cursor) => current.max(cursor),
            None => current,
        };
        value.to_string()
    }
}
