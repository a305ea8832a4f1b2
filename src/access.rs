//! Site and collection access checks.
//!
//! Management operations require a credential matching one of the site
//! secrets stored in KV. Viewing a protected collection requires its
//! password; an unprotected collection admits anyone.

use std::sync::Arc;

use crate::collection_store::Collection;
use crate::error::GalleryError;
use crate::kv_store::KvStore;

const SITE_AUTH_KEY: &str = "auth";

/// Two-level access gate over the shared KV store.
pub struct AccessGate {
    kv: Arc<dyn KvStore>,
}

impl AccessGate {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self { kv }
    }

    /// True when `credential` is a member of the stored site secret set.
    /// A missing credential or a missing secret set never authorizes.
    pub async fn authorize_site(&self, credential: Option<&str>) -> Result<bool, GalleryError> {
        let Some(raw) = self.kv.get(SITE_AUTH_KEY).await? else {
            return Ok(false);
        };
        let secrets: Vec<String> = serde_json::from_str(&raw)?;
        Ok(credential.is_some_and(|given| secrets.iter().any(|secret| secret == given)))
    }

    /// True when the collection has no password or `credential` equals it.
    pub fn authorize_collection(collection: &Collection, credential: Option<&str>) -> bool {
        match collection.password.as_deref() {
            None => true,
            Some(password) => credential == Some(password),
        }
    }

    /// Seeds the site secret set with `key` when none exists yet.
    /// Returns whether seeding happened.
    pub async fn bootstrap(&self, key: &str) -> Result<bool, GalleryError> {
        if self.kv.get(SITE_AUTH_KEY).await?.is_some() {
            return Ok(false);
        }
        let body = serde_json::to_string(&vec![key.to_string()])?;
        self.kv.put(SITE_AUTH_KEY, &body, None).await?;
        Ok(true)
    }
}
