//! Key-value persistence for collection documents, site secrets and
//! rate-limit windows.
//!
//! The production store talks to a remote KV namespace over HTTP; the
//! in-memory store backs unit tests and local development.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::instrument;

use crate::config::KvConfig;
use crate::error::GalleryError;

/// String-valued KV namespace with optional per-key TTL.
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Returns the value for `key`, or `None` when absent or expired.
    async fn get(&self, key: &str) -> Result<Option<String>, GalleryError>;

    /// Writes `value` under `key`. A TTL makes the entry vanish after
    /// the given duration.
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), GalleryError>;
}

/// KV namespace client speaking the remote HTTP API.
pub struct HttpKvStore {
    client: reqwest::Client,
    base: String,
    api_token: String,
}

impl HttpKvStore {
    pub fn new(config: &KvConfig) -> Result<Self, GalleryError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        let base = format!(
            "{}/accounts/{}/storage/kv/namespaces/{}",
            config.api_base.trim_end_matches('/'),
            config.account_id,
            config.namespace_id
        );

        Ok(Self {
            client,
            base,
            api_token: config.api_token.clone(),
        })
    }
}

#[async_trait]
impl KvStore for HttpKvStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<String>, GalleryError> {
        let url = format!("{}/values/{}", self.base, key);
        let response = self.client.get(&url).bearer_auth(&self.api_token).send().await?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            metrics::counter!("gallery.kv.errors").increment(1);
            return Err(GalleryError::storage(format!(
                "kv get {key} returned {status}: {body}"
            )));
        }

        metrics::counter!("gallery.kv.reads").increment(1);
        Ok(Some(response.text().await?))
    }

    #[instrument(skip(self, value), fields(size_bytes = value.len()))]
    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), GalleryError> {
        let mut url = format!("{}/values/{}", self.base, key);
        if let Some(ttl) = ttl {
            url.push_str(&format!("?expiration_ttl={}", ttl.as_secs()));
        }

        let response = self
            .client
            .put(&url)
            .bearer_auth(&self.api_token)
            .body(value.to_string())
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            metrics::counter!("gallery.kv.errors").increment(1);
            return Err(GalleryError::storage(format!(
                "kv put {key} returned {status}: {body}"
            )));
        }

        metrics::counter!("gallery.kv.writes").increment(1);
        Ok(())
    }
}

struct StoredValue {
    value: String,
    expires_at: Option<Instant>,
}

impl StoredValue {
    fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| Instant::now() >= at)
    }
}

/// In-process KV store with the same TTL semantics as the remote one.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: Mutex<HashMap<String, StoredValue>>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<String>, GalleryError> {
        let mut entries = self.entries.lock().unwrap();
        let expired = entries.get(key).map(StoredValue::is_expired).unwrap_or(false);
        if expired {
            entries.remove(key);
            return Ok(None);
        }
        Ok(entries.get(key).map(|stored| stored.value.clone()))
    }

    async fn put(&self, key: &str, value: &str, ttl: Option<Duration>) -> Result<(), GalleryError> {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            key.to_string(),
            StoredValue {
                value: value.to_string(),
                expires_at: ttl.map(|ttl| Instant::now() + ttl),
            },
        );
        Ok(())
    }
}
