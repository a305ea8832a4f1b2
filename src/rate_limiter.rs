//! Fixed-window rate limiting for comment posting, one window per client.
//!
//! Windows live in the shared KV store under `rate:comment:{client}`, so
//! every instance of the service sees the same counts. Entries carry a
//! TTL of twice the window so stale records age out on their own.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::config::CommentsConfig;
use crate::error::GalleryError;
use crate::kv_store::KvStore;

const KEY_PREFIX: &str = "rate:comment:";

/// One client's window: when it opened and how many comments landed in it.
#[derive(Debug, Serialize, Deserialize)]
struct WindowRecord {
    window_start: i64,
    count: u32,
}

impl WindowRecord {
    fn opened_at(now: DateTime<Utc>) -> Self {
        Self {
            window_start: now.timestamp_millis(),
            count: 0,
        }
    }
}

/// Per-client fixed-window counter backed by KV.
pub struct CommentRateLimiter {
    kv: Arc<dyn KvStore>,
    max_per_window: u32,
    window: Duration,
}

impl CommentRateLimiter {
    pub fn new(kv: Arc<dyn KvStore>, config: &CommentsConfig) -> Self {
        Self {
            kv,
            max_per_window: config.max_per_window,
            window: config.window(),
        }
    }

    /// Counts one comment attempt for `client` against the current window.
    pub async fn check(&self, client: &str) -> Result<(), GalleryError> {
        self.check_at(client, Utc::now()).await
    }

    /// Deterministic core of [`check`](Self::check).
    ///
    /// The window resets only when strictly more than the window length
    /// has elapsed since it opened; at exactly the boundary the old
    /// window still applies.
    pub async fn check_at(&self, client: &str, now: DateTime<Utc>) -> Result<(), GalleryError> {
        let key = format!("{KEY_PREFIX}{client}");

        // A record that fails to parse starts a fresh window.
        let mut record = match self.kv.get(&key).await? {
            Some(raw) => {
                serde_json::from_str(&raw).unwrap_or_else(|_| WindowRecord::opened_at(now))
            }
            None => WindowRecord::opened_at(now),
        };

        let window_ms = self.window.as_millis() as i64;
        if now.timestamp_millis() - record.window_start > window_ms {
            record = WindowRecord::opened_at(now);
        }

        if record.count >= self.max_per_window {
            metrics::counter!("gallery.comments.rate_limited").increment(1);
            return Err(GalleryError::RateLimited);
        }

        record.count += 1;
        self.kv
            .put(&key, &serde_json::to_string(&record)?, Some(self.window * 2))
            .await?;
        Ok(())
    }
}
