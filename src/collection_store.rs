//! The collection document: every collection, stored as one KV value.
//!
//! All mutations are whole-document read-modify-write cycles. Each
//! stored document carries a version stamp; a write only lands when the
//! live version still matches the snapshot the mutation was applied to,
//! otherwise the cycle retries against a fresh snapshot. Two writers
//! racing between the version check and the put can still clobber each
//! other, the stamp narrows the window rather than closing it.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, instrument};

use crate::error::GalleryError;
use crate::kv_store::KvStore;

const COLLECTIONS_KEY: &str = "collections";
const CONFLICT_RETRY_BUDGET: u32 = 3;

/// Membership record for one image inside a collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageRecord {
    pub id: String,
    #[serde(default)]
    pub alt_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
}

/// A named, optionally password-protected set of images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Collection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default)]
    pub images: Vec<ImageRecord>,
    /// Derived listing thumbnail, populated on read-out and never persisted.
    #[serde(skip)]
    pub thumbnail: Option<String>,
}

/// Version-stamped snapshot of every collection.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionsDocument {
    pub version: u64,
    pub collections: Vec<Collection>,
}

/// Pre-versioning documents were a bare array of collections; those
/// parse as version zero and upgrade on their next write.
#[derive(Deserialize)]
#[serde(untagged)]
enum StoredDocument {
    Versioned {
        version: u64,
        collections: Vec<Collection>,
    },
    Legacy(Vec<Collection>),
}

fn parse_document(raw: &str) -> Result<CollectionsDocument, GalleryError> {
    let stored: StoredDocument = serde_json::from_str(raw)?;
    Ok(match stored {
        StoredDocument::Versioned {
            version,
            collections,
        } => CollectionsDocument {
            version,
            collections,
        },
        StoredDocument::Legacy(collections) => CollectionsDocument {
            version: 0,
            collections,
        },
    })
}

/// Case-insensitive name equality used for every collection lookup.
pub fn folded_eq(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

pub fn find_collection_mut<'a>(
    collections: &'a mut [Collection],
    name: &str,
) -> Option<&'a mut Collection> {
    collections.iter_mut().find(|c| folded_eq(&c.name, name))
}

/// Store for the single collections document.
pub struct CollectionStore {
    kv: Arc<dyn KvStore>,
    key: String,
}

impl CollectionStore {
    pub fn new(kv: Arc<dyn KvStore>) -> Self {
        Self {
            kv,
            key: COLLECTIONS_KEY.to_string(),
        }
    }

    /// Loads the current document. A never-initialized key is persisted
    /// as an empty document before it is returned.
    pub async fn load(&self) -> Result<CollectionsDocument, GalleryError> {
        match self.kv.get(&self.key).await? {
            Some(raw) => parse_document(&raw),
            None => {
                let doc = CollectionsDocument::default();
                self.kv
                    .put(&self.key, &serde_json::to_string(&doc)?, None)
                    .await?;
                Ok(doc)
            }
        }
    }

    /// Persists `snapshot` when the live document still carries the
    /// version the snapshot was read at; the written document gets the
    /// next version stamp.
    pub async fn store(&self, snapshot: &CollectionsDocument) -> Result<(), GalleryError> {
        let live_version = match self.kv.get(&self.key).await? {
            Some(raw) => parse_document(&raw)?.version,
            None => 0,
        };
        if live_version != snapshot.version {
            metrics::counter!("gallery.collections.conflicts").increment(1);
            return Err(GalleryError::conflict(format!(
                "document version moved from {} to {}",
                snapshot.version, live_version
            )));
        }

        let next = CollectionsDocument {
            version: snapshot.version + 1,
            collections: snapshot.collections.clone(),
        };
        self.kv
            .put(&self.key, &serde_json::to_string(&next)?, None)
            .await
    }

    /// One read-modify-write cycle: load a fresh snapshot, apply
    /// `mutate`, store the result. Version conflicts retry with a fresh
    /// snapshot up to a small budget; any other error aborts the cycle
    /// without retrying the write.
    #[instrument(skip(self, mutate))]
    pub async fn update<T, F>(&self, mutate: F) -> Result<T, GalleryError>
    where
        F: Fn(&mut Vec<Collection>) -> Result<T, GalleryError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut doc = self.load().await?;
            let out = mutate(&mut doc.collections)?;
            match self.store(&doc).await {
                Ok(()) => return Ok(out),
                Err(GalleryError::Conflict(reason)) if attempt < CONFLICT_RETRY_BUDGET => {
                    debug!(attempt, %reason, "collection document moved, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn list(&self) -> Result<Vec<Collection>, GalleryError> {
        Ok(self.load().await?.collections)
    }

    pub async fn find(&self, name: &str) -> Result<Option<Collection>, GalleryError> {
        Ok(self
            .load()
            .await?
            .collections
            .into_iter()
            .find(|c| folded_eq(&c.name, name)))
    }

    /// Inserts `collection`, replacing in place any entry whose name
    /// matches case-insensitively.
    pub async fn upsert(&self, collection: Collection) -> Result<(), GalleryError> {
        self.update(move |collections| {
            let existing = collections
                .iter()
                .position(|c| folded_eq(&c.name, &collection.name));
            match existing {
                Some(index) => collections[index] = collection.clone(),
                None => collections.push(collection.clone()),
            }
            Ok(())
        })
        .await
    }

    /// Drops every entry whose name matches case-insensitively. Removing
    /// an absent name is a no-op, not an error.
    pub async fn remove_by_name(&self, name: &str) -> Result<(), GalleryError> {
        self.update(|collections| {
            collections.retain(|c| !folded_eq(&c.name, name));
            Ok(())
        })
        .await
    }
}
