//! Gallery orchestration: batch uploads and deletes against the remote
//! image service, followed by a single membership write per logical
//! batch.
//!
//! Remote mutations run first and never roll back; the document write
//! that records membership happens exactly once per batch, so a batch
//! with partial failures still lands as one write. Failed remote deletes
//! leave orphaned assets behind rather than blocking membership cleanup.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{instrument, warn};
use uuid::Uuid;

use crate::collection_store::{
    find_collection_mut, folded_eq, Collection, CollectionStore, ImageRecord,
};
use crate::delivery_url::{SignedUrl, UrlSigner, Variant, MAX_EXPIRY_SECS};
use crate::error::GalleryError;
use crate::image_service::{ImageExport, ImageService};
use crate::worker_pool;

/// One file of an upload batch.
#[derive(Debug, Clone)]
pub struct UploadFile {
    pub data: Vec<u8>,
    pub alt_text: Option<String>,
}

/// Aggregate outcome of an upload batch.
#[derive(Debug, Serialize)]
pub struct BatchUploadOutcome {
    pub uploaded: Vec<ImageRecord>,
    pub errors: Vec<String>,
}

/// Aggregate outcome of a batch delete.
#[derive(Debug, Default, Serialize)]
pub struct DeleteReport {
    pub succeeded: usize,
    pub failed_ids: Vec<String>,
}

/// Per-image dimension payload for finalize and remeasure calls.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageDimensions {
    pub id: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// Outcome of a remeasure pass.
#[derive(Debug, Serialize)]
pub struct RemeasureReport {
    pub updated: usize,
    pub skipped: usize,
}

/// One reserved direct-upload slot.
#[derive(Debug, Clone, Serialize)]
pub struct UploadTicket {
    pub id: String,
    pub upload_url: String,
    pub issued_at: DateTime<Utc>,
}

/// A prepared batch of direct-upload tickets.
#[derive(Debug, Serialize)]
pub struct PreparedUploads {
    pub session_id: String,
    pub requested_at: DateTime<Utc>,
    pub tickets: Vec<UploadTicket>,
}

/// One image of a collection with its signed delivery URL.
#[derive(Debug, Serialize)]
pub struct ImageView {
    pub id: String,
    pub alt_text: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub url: String,
}

/// Orchestrates collection membership, asset mutations and URL signing.
pub struct GalleryService {
    collections: Arc<CollectionStore>,
    images: Arc<dyn ImageService>,
    signer: Arc<UrlSigner>,
    delete_concurrency: usize,
}

impl GalleryService {
    pub fn new(
        collections: Arc<CollectionStore>,
        images: Arc<dyn ImageService>,
        signer: Arc<UrlSigner>,
        delete_concurrency: usize,
    ) -> Self {
        Self {
            collections,
            images,
            signer,
            delete_concurrency,
        }
    }

    async fn require(&self, name: &str) -> Result<Collection, GalleryError> {
        self.collections
            .find(name)
            .await?
            .ok_or_else(|| GalleryError::not_found(format!("collection {name}")))
    }

    /// Every collection, each with its derived listing thumbnail.
    pub async fn list_collections(&self) -> Result<Vec<Collection>, GalleryError> {
        let mut collections = self.collections.list().await?;
        for collection in &mut collections {
            collection.thumbnail = collection
                .images
                .first()
                .map(|first| self.signer.sign(&first.id, Variant::Thumb, None).url);
        }
        Ok(collections)
    }

    /// Creates an empty collection. The name must be unique under
    /// case-insensitive comparison; an empty password means unprotected.
    #[instrument(skip(self, password))]
    pub async fn create_collection(
        &self,
        name: &str,
        password: Option<String>,
    ) -> Result<Collection, GalleryError> {
        let name = name.trim();
        if name.is_empty() {
            return Err(GalleryError::validation("collection name is required"));
        }

        let collection = Collection {
            name: name.to_string(),
            password: password.filter(|p| !p.is_empty()),
            images: vec![],
            thumbnail: None,
        };
        let created = collection.clone();

        self.collections
            .update(move |collections| {
                if collections
                    .iter()
                    .any(|c| folded_eq(&c.name, &collection.name))
                {
                    return Err(GalleryError::validation("collection already exists"));
                }
                collections.push(collection.clone());
                Ok(())
            })
            .await?;

        Ok(created)
    }

    /// Renames a collection and/or changes its password. A `None`
    /// password leaves protection untouched; an empty one clears it.
    #[instrument(skip(self, password))]
    pub async fn update_settings(
        &self,
        name: &str,
        new_name: Option<String>,
        password: Option<String>,
    ) -> Result<Collection, GalleryError> {
        let name = name.to_string();
        let new_name = new_name
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty());

        self.collections
            .update(move |collections| {
                let index = collections
                    .iter()
                    .position(|c| folded_eq(&c.name, &name))
                    .ok_or_else(|| GalleryError::not_found(format!("collection {name}")))?;

                if let Some(new_name) = &new_name {
                    let taken = collections
                        .iter()
                        .enumerate()
                        .any(|(i, c)| i != index && folded_eq(&c.name, new_name));
                    if taken {
                        return Err(GalleryError::validation(
                            "another collection already uses that name",
                        ));
                    }
                    collections[index].name = new_name.clone();
                }

                match password.as_deref() {
                    None => {}
                    Some("") => collections[index].password = None,
                    Some(p) => collections[index].password = Some(p.to_string()),
                }

                Ok(collections[index].clone())
            })
            .await
    }

    /// Uploads one file with the long-lived token; remote failures
    /// propagate as-is.
    pub async fn upload_single(&self, data: &[u8]) -> Result<String, GalleryError> {
        self.images.upload(data, None).await
    }

    /// Uploads every file and captures each outcome independently. More
    /// than one file means the uploads share a batch token and run
    /// concurrently; completion order is whatever the remote yields.
    #[instrument(skip(self, files), fields(files = files.len()))]
    pub async fn upload_batch(
        &self,
        mut files: Vec<UploadFile>,
    ) -> Result<Vec<(UploadFile, Result<String, GalleryError>)>, GalleryError> {
        if files.is_empty() {
            return Ok(vec![]);
        }
        if files.len() == 1 {
            let file = files.remove(0);
            let outcome = self.upload_single(&file.data).await;
            return Ok(vec![(file, outcome)]);
        }

        let batch_token = self.images.batch_token().await?.token;
        let uploads = files.into_iter().map(|file| {
            let images = Arc::clone(&self.images);
            let token = batch_token.clone();
            async move {
                let outcome = images.upload(&file.data, Some(token.as_str())).await;
                (file, outcome)
            }
        });

        Ok(join_all(uploads).await)
    }

    /// Uploads a batch and appends the successful images to the
    /// collection in a single document write, partial failures included.
    #[instrument(skip(self, files), fields(files = files.len()))]
    pub async fn add_images(
        &self,
        collection_name: &str,
        files: Vec<UploadFile>,
    ) -> Result<BatchUploadOutcome, GalleryError> {
        if files.is_empty() {
            return Err(GalleryError::validation("at least one file is required"));
        }
        // Uploads are not rolled back, so the membership target must
        // exist before any bytes leave for the remote service.
        self.require(collection_name).await?;

        let outcomes = self.upload_batch(files).await?;

        let mut uploaded = Vec::new();
        let mut errors = Vec::new();
        for (file, outcome) in outcomes {
            match outcome {
                Ok(id) => uploaded.push(ImageRecord {
                    alt_text: file.alt_text.unwrap_or_else(|| id.clone()),
                    id,
                    width: None,
                    height: None,
                }),
                Err(err) => {
                    warn!(error = %err, "upload failed");
                    errors.push(err.to_string());
                }
            }
        }
        metrics::counter!("gallery.uploads.completed").increment(uploaded.len() as u64);
        metrics::counter!("gallery.uploads.failed").increment(errors.len() as u64);

        let name = collection_name.to_string();
        let appended = uploaded.clone();
        self.collections
            .update(move |collections| {
                let entry = find_collection_mut(collections, &name)
                    .ok_or_else(|| GalleryError::not_found(format!("collection {name}")))?;
                entry.images.extend(appended.iter().cloned());
                Ok(())
            })
            .await?;

        Ok(BatchUploadOutcome { uploaded, errors })
    }

    /// Deletes assets through a fixed-size worker pool over a shared
    /// queue. Each failure is recorded and never stops the pool.
    #[instrument(skip(self, ids), fields(count = ids.len(), concurrency))]
    pub async fn delete_many(
        &self,
        ids: Vec<String>,
        concurrency: usize,
    ) -> Result<DeleteReport, GalleryError> {
        if ids.is_empty() {
            return Ok(DeleteReport::default());
        }

        let batch_token = if ids.len() > 1 {
            Some(self.images.batch_token().await?.token)
        } else {
            None
        };

        let images = Arc::clone(&self.images);
        let outcomes = worker_pool::run(ids, concurrency, move |id: String| {
            let images = Arc::clone(&images);
            let token = batch_token.clone();
            async move { images.delete(&id, token.as_deref()).await }
        })
        .await;

        let mut report = DeleteReport::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.succeeded += 1,
                Err(err) => {
                    warn!(image_id = %id, error = %err, "asset delete failed");
                    report.failed_ids.push(id);
                }
            }
        }
        metrics::counter!("gallery.assets.deleted").increment(report.succeeded as u64);
        metrics::counter!("gallery.assets.delete_failed").increment(report.failed_ids.len() as u64);
        Ok(report)
    }

    /// Removes a collection after a best-effort purge of its assets.
    /// Failed asset deletes are reported in the result; membership goes
    /// away regardless.
    #[instrument(skip(self))]
    pub async fn delete_collection(&self, name: &str) -> Result<DeleteReport, GalleryError> {
        let collection = self.require(name).await?;

        let ids: Vec<String> = collection.images.iter().map(|image| image.id.clone()).collect();
        let report = self.delete_many(ids, self.delete_concurrency).await?;
        if !report.failed_ids.is_empty() {
            warn!(failed = report.failed_ids.len(), "leaving orphaned assets behind");
        }

        self.collections.remove_by_name(name).await?;
        Ok(report)
    }

    /// Removes one image. The remote delete is best-effort; membership
    /// removal is what makes the image gone.
    #[instrument(skip(self))]
    pub async fn delete_image(
        &self,
        collection_name: &str,
        image_id: &str,
    ) -> Result<(), GalleryError> {
        if let Err(err) = self.images.delete(image_id, None).await {
            warn!(image_id = %image_id, error = %err, "remote delete failed, removing membership anyway");
        }

        let name = collection_name.to_string();
        let id = image_id.to_string();
        self.collections
            .update(move |collections| {
                let entry = find_collection_mut(collections, &name)
                    .ok_or_else(|| GalleryError::not_found(format!("collection {name}")))?;
                entry.images.retain(|image| image.id != id);
                Ok(())
            })
            .await
    }

    /// Reserves `count` direct-upload slots concurrently. Any failed
    /// reservation fails the whole prepare.
    #[instrument(skip(self))]
    pub async fn prepare_uploads(&self, count: usize) -> Result<PreparedUploads, GalleryError> {
        if count == 0 {
            return Err(GalleryError::validation("count must be at least 1"));
        }

        let requests = (0..count).map(|_| {
            let images = Arc::clone(&self.images);
            async move { images.direct_upload().await }
        });
        let outcomes = join_all(requests).await;

        let issued_at = Utc::now();
        let mut tickets = Vec::with_capacity(count);
        for outcome in outcomes {
            let slot = outcome?;
            tickets.push(UploadTicket {
                id: slot.id,
                upload_url: slot.upload_url,
                issued_at,
            });
        }

        Ok(PreparedUploads {
            session_id: Uuid::new_v4().to_string(),
            requested_at: issued_at,
            tickets,
        })
    }

    /// Records direct-uploaded images as members in one document write.
    /// Returns how many records were appended.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub async fn finalize_uploads(
        &self,
        collection_name: &str,
        items: Vec<ImageDimensions>,
    ) -> Result<usize, GalleryError> {
        let records: Vec<ImageRecord> = items
            .into_iter()
            .map(|item| ImageRecord {
                alt_text: item.id.clone(),
                id: item.id,
                width: item.width,
                height: item.height,
            })
            .collect();
        let saved = records.len();

        let name = collection_name.to_string();
        self.collections
            .update(move |collections| {
                let entry = find_collection_mut(collections, &name)
                    .ok_or_else(|| GalleryError::not_found(format!("collection {name}")))?;
                entry.images.extend(records.iter().cloned());
                Ok(())
            })
            .await?;

        Ok(saved)
    }

    /// Refreshes stored dimensions in one document write. Items without
    /// dimensions are looked up in the image service first; ids that are
    /// not members, and lookups that fail, count as skipped.
    #[instrument(skip(self, items), fields(items = items.len()))]
    pub async fn remeasure(
        &self,
        collection_name: &str,
        items: Vec<ImageDimensions>,
    ) -> Result<RemeasureReport, GalleryError> {
        let mut resolved: Vec<(String, u32, u32)> = Vec::with_capacity(items.len());
        let mut failed_lookups = 0usize;

        for item in items {
            match (item.width, item.height) {
                (Some(width), Some(height)) => resolved.push((item.id, width, height)),
                _ => match self.images.details(&item.id).await {
                    Ok(details) => match (details.width, details.height) {
                        (Some(width), Some(height)) => resolved.push((item.id, width, height)),
                        _ => {
                            warn!(image_id = %item.id, "image service reports no dimensions");
                            failed_lookups += 1;
                        }
                    },
                    Err(err) => {
                        warn!(image_id = %item.id, error = %err, "dimension lookup failed");
                        failed_lookups += 1;
                    }
                },
            }
        }

        let name = collection_name.to_string();
        let report = self
            .collections
            .update(move |collections| {
                let entry = find_collection_mut(collections, &name)
                    .ok_or_else(|| GalleryError::not_found(format!("collection {name}")))?;

                let mut updated = 0;
                let mut skipped = 0;
                for (id, width, height) in &resolved {
                    match entry.images.iter_mut().find(|image| &image.id == id) {
                        Some(image) => {
                            image.width = Some(*width);
                            image.height = Some(*height);
                            updated += 1;
                        }
                        None => skipped += 1,
                    }
                }
                Ok(RemeasureReport { updated, skipped })
            })
            .await?;

        Ok(RemeasureReport {
            updated: report.updated,
            skipped: report.skipped + failed_lookups,
        })
    }

    /// Signed views of every image in a collection.
    pub async fn collection_images(
        &self,
        name: &str,
        variant: Variant,
    ) -> Result<Vec<ImageView>, GalleryError> {
        let collection = self.require(name).await?;
        Ok(collection
            .images
            .iter()
            .map(|image| ImageView {
                id: image.id.clone(),
                alt_text: image.alt_text.clone(),
                width: image.width,
                height: image.height,
                url: self.signer.sign(&image.id, variant, None).url,
            })
            .collect())
    }

    /// Signed URL for one member image.
    pub async fn viewing_url(
        &self,
        collection_name: &str,
        image_id: &str,
        variant: Variant,
        expiry_secs: Option<u64>,
    ) -> Result<SignedUrl, GalleryError> {
        if let Some(secs) = expiry_secs {
            if secs == 0 || secs > MAX_EXPIRY_SECS {
                return Err(GalleryError::validation(format!(
                    "expiry_secs must be between 1 and {MAX_EXPIRY_SECS}"
                )));
            }
        }
        let collection = self.require(collection_name).await?;
        if !collection.images.iter().any(|image| image.id == image_id) {
            return Err(GalleryError::not_found(format!("image {image_id}")));
        }
        Ok(self.signer.sign(image_id, variant, expiry_secs))
    }

    /// Streams the original bytes of a member image.
    #[instrument(skip(self))]
    pub async fn export_image(
        &self,
        collection_name: &str,
        image_id: &str,
    ) -> Result<ImageExport, GalleryError> {
        let collection = self.require(collection_name).await?;
        if !collection.images.iter().any(|image| image.id == image_id) {
            return Err(GalleryError::not_found(format!("image {image_id}")));
        }
        self.images.export(image_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeliveryConfig;
    use crate::image_service::{BatchToken, DirectUpload, ImageDetails};
    use crate::kv_store::MemoryKvStore;
    use async_trait::async_trait;
    use bytes::Bytes;
    use futures::StreamExt;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    /// In-memory stand-in for the remote image service with
    /// configurable failures.
    #[derive(Default)]
    struct FakeImageService {
        fail_upload_payloads: Vec<Vec<u8>>,
        fail_delete_ids: HashSet<String>,
        next_id: AtomicUsize,
        deleted: Mutex<Vec<String>>,
        batch_tokens_issued: AtomicUsize,
    }

    impl FakeImageService {
        fn failing_deletes(ids: &[&str]) -> Self {
            Self {
                fail_delete_ids: ids.iter().map(|id| id.to_string()).collect(),
                ..Self::default()
            }
        }
    }

    #[async_trait]
    impl ImageService for FakeImageService {
        async fn upload(
            &self,
            data: &[u8],
            _batch_token: Option<&str>,
        ) -> Result<String, GalleryError> {
            if self.fail_upload_payloads.iter().any(|p| p == data) {
                return Err(GalleryError::remote(500, "upload rejected"));
            }
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(format!("asset-{n}"))
        }

        async fn delete(
            &self,
            image_id: &str,
            _batch_token: Option<&str>,
        ) -> Result<(), GalleryError> {
            if self.fail_delete_ids.contains(image_id) {
                return Err(GalleryError::remote(500, "delete rejected"));
            }
            self.deleted.lock().unwrap().push(image_id.to_string());
            Ok(())
        }

        async fn batch_token(&self) -> Result<BatchToken, GalleryError> {
            self.batch_tokens_issued.fetch_add(1, Ordering::SeqCst);
            Ok(BatchToken {
                token: "batch-token".to_string(),
                expires_at: Utc::now() + chrono::Duration::minutes(5),
            })
        }

        async fn direct_upload(&self) -> Result<DirectUpload, GalleryError> {
            let n = self.next_id.fetch_add(1, Ordering::SeqCst);
            Ok(DirectUpload {
                id: format!("slot-{n}"),
                upload_url: format!("https://upload.example/slot-{n}"),
            })
        }

        async fn details(&self, image_id: &str) -> Result<ImageDetails, GalleryError> {
            Ok(ImageDetails {
                id: image_id.to_string(),
                width: Some(640),
                height: Some(480),
            })
        }

        async fn export(&self, _image_id: &str) -> Result<ImageExport, GalleryError> {
            Ok(ImageExport {
                content_type: Some("image/jpeg".to_string()),
                body: futures::stream::iter(vec![Ok(Bytes::from_static(b"jpeg-bytes"))]).boxed(),
            })
        }
    }

    struct Fixture {
        store: Arc<CollectionStore>,
        images: Arc<FakeImageService>,
        gallery: GalleryService,
    }

    fn fixture(images: FakeImageService) -> Fixture {
        let kv = Arc::new(MemoryKvStore::new());
        let store = Arc::new(CollectionStore::new(kv));
        let images = Arc::new(images);
        let signer = Arc::new(UrlSigner::new(&DeliveryConfig {
            base: "https://imagedelivery.net".to_string(),
            account_hash: "hash".to_string(),
            signing_key: "secret".to_string(),
            url_expiry_secs: 86_400,
        }));
        let gallery = GalleryService::new(store.clone(), images.clone(), signer, 5);
        Fixture {
            store,
            images,
            gallery,
        }
    }

    fn file(data: &[u8]) -> UploadFile {
        UploadFile {
            data: data.to_vec(),
            alt_text: None,
        }
    }

    #[tokio::test]
    async fn test_create_collection_rejects_case_insensitive_duplicate() {
        let fx = fixture(FakeImageService::default());
        fx.gallery.create_collection("Sunsets", None).await.unwrap();

        let duplicate = fx.gallery.create_collection("SUNSETS", None).await;
        assert!(matches!(duplicate, Err(GalleryError::Validation(_))));
        assert_eq!(fx.store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_collection_blank_password_means_unprotected() {
        let fx = fixture(FakeImageService::default());
        fx.gallery
            .create_collection("Open", Some(String::new()))
            .await
            .unwrap();

        let stored = fx.store.find("Open").await.unwrap().unwrap();
        assert!(stored.password.is_none());
    }

    #[tokio::test]
    async fn test_update_settings_rename_and_clear_password() {
        let fx = fixture(FakeImageService::default());
        fx.gallery
            .create_collection("Sunsets", Some("pw".to_string()))
            .await
            .unwrap();

        let updated = fx
            .gallery
            .update_settings("sunsets", Some("Dusk".to_string()), Some(String::new()))
            .await
            .unwrap();
        assert_eq!(updated.name, "Dusk");
        assert!(updated.password.is_none());

        assert!(fx.store.find("Sunsets").await.unwrap().is_none());
        assert!(fx.store.find("dusk").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_update_settings_rejects_name_collision() {
        let fx = fixture(FakeImageService::default());
        fx.gallery.create_collection("One", None).await.unwrap();
        fx.gallery.create_collection("Two", None).await.unwrap();

        let result = fx
            .gallery
            .update_settings("One", Some("TWO".to_string()), None)
            .await;
        assert!(matches!(result, Err(GalleryError::Validation(_))));
    }

    #[tokio::test]
    async fn test_partial_upload_batch_keeps_other_files() {
        let images = FakeImageService {
            fail_upload_payloads: vec![b"second".to_vec()],
            ..FakeImageService::default()
        };
        let fx = fixture(images);
        fx.gallery.create_collection("Sunsets", None).await.unwrap();

        let outcome = fx
            .gallery
            .add_images(
                "Sunsets",
                vec![file(b"first"), file(b"second"), file(b"third")],
            )
            .await
            .unwrap();

        assert_eq!(outcome.uploaded.len(), 2);
        assert_eq!(outcome.errors.len(), 1);

        let stored = fx.store.find("Sunsets").await.unwrap().unwrap();
        assert_eq!(stored.images.len(), 2);
    }

    #[tokio::test]
    async fn test_batch_upload_is_one_document_write() {
        let fx = fixture(FakeImageService::default());
        fx.gallery.create_collection("Sunsets", None).await.unwrap();
        let version_before = fx.store.load().await.unwrap().version;

        fx.gallery
            .add_images(
                "Sunsets",
                vec![file(b"a"), file(b"b"), file(b"c"), file(b"d")],
            )
            .await
            .unwrap();

        let version_after = fx.store.load().await.unwrap().version;
        assert_eq!(version_after, version_before + 1);
    }

    #[tokio::test]
    async fn test_single_file_upload_skips_batch_token() {
        let fx = fixture(FakeImageService::default());
        fx.gallery.create_collection("Sunsets", None).await.unwrap();

        fx.gallery
            .add_images("Sunsets", vec![file(b"only")])
            .await
            .unwrap();

        assert_eq!(fx.images.batch_tokens_issued.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_multi_file_batch_shares_one_token() {
        let fx = fixture(FakeImageService::default());
        fx.gallery.create_collection("Sunsets", None).await.unwrap();

        fx.gallery
            .add_images("Sunsets", vec![file(b"a"), file(b"b"), file(b"c")])
            .await
            .unwrap();

        assert_eq!(fx.images.batch_tokens_issued.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_upload_alt_text_defaults_to_asset_id() {
        let fx = fixture(FakeImageService::default());
        fx.gallery.create_collection("Sunsets", None).await.unwrap();

        let outcome = fx
            .gallery
            .add_images("Sunsets", vec![file(b"data")])
            .await
            .unwrap();
        let record = &outcome.uploaded[0];
        assert_eq!(record.alt_text, record.id);
    }

    #[tokio::test]
    async fn test_add_images_checks_collection_before_uploading() {
        let fx = fixture(FakeImageService::default());

        let result = fx
            .gallery
            .add_images("no-such-collection", vec![file(b"a"), file(b"b")])
            .await;

        assert!(matches!(result, Err(GalleryError::NotFound(_))));
        // Nothing reached the remote service.
        assert_eq!(fx.images.next_id.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_empty_upload_batch_is_rejected() {
        let fx = fixture(FakeImageService::default());
        fx.gallery.create_collection("Sunsets", None).await.unwrap();

        let result = fx.gallery.add_images("Sunsets", vec![]).await;
        assert!(matches!(result, Err(GalleryError::Validation(_))));
    }

    #[tokio::test]
    async fn test_delete_many_reports_exact_failed_ids() {
        let ids: Vec<String> = (0..8).map(|i| format!("img-{i}")).collect();

        for concurrency in [1usize, 5, 8, 18] {
            let images = FakeImageService::failing_deletes(&["img-2", "img-5"]);
            let fx = fixture(images);

            let report = fx
                .gallery
                .delete_many(ids.clone(), concurrency)
                .await
                .unwrap();

            assert_eq!(report.succeeded, 6, "concurrency {concurrency}");
            let failed: HashSet<_> = report.failed_ids.iter().map(String::as_str).collect();
            assert_eq!(failed, HashSet::from(["img-2", "img-5"]));
        }
    }

    #[tokio::test]
    async fn test_delete_collection_removes_membership_despite_failures() {
        let images = FakeImageService::failing_deletes(&["img-1"]);
        let fx = fixture(images);

        fx.gallery.create_collection("Sunsets", None).await.unwrap();
        fx.gallery
            .finalize_uploads(
                "Sunsets",
                vec![
                    ImageDimensions { id: "img-1".to_string(), width: None, height: None },
                    ImageDimensions { id: "img-2".to_string(), width: None, height: None },
                ],
            )
            .await
            .unwrap();

        let report = fx.gallery.delete_collection("Sunsets").await.unwrap();
        assert_eq!(report.succeeded, 1);
        assert_eq!(report.failed_ids, vec!["img-1".to_string()]);
        assert!(fx.store.find("Sunsets").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_image_survives_remote_failure() {
        let images = FakeImageService::failing_deletes(&["img-1"]);
        let fx = fixture(images);

        fx.gallery.create_collection("Sunsets", None).await.unwrap();
        fx.gallery
            .finalize_uploads(
                "Sunsets",
                vec![ImageDimensions { id: "img-1".to_string(), width: None, height: None }],
            )
            .await
            .unwrap();

        fx.gallery.delete_image("Sunsets", "img-1").await.unwrap();
        let stored = fx.store.find("Sunsets").await.unwrap().unwrap();
        assert!(stored.images.is_empty());
    }

    #[tokio::test]
    async fn test_prepare_uploads_issues_distinct_tickets() {
        let fx = fixture(FakeImageService::default());

        let prepared = fx.gallery.prepare_uploads(3).await.unwrap();
        assert_eq!(prepared.tickets.len(), 3);

        let ids: HashSet<_> = prepared.tickets.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids.len(), 3);
        assert!(prepared.tickets.iter().all(|t| !t.upload_url.is_empty()));
    }

    #[tokio::test]
    async fn test_prepare_uploads_rejects_zero_count() {
        let fx = fixture(FakeImageService::default());
        let result = fx.gallery.prepare_uploads(0).await;
        assert!(matches!(result, Err(GalleryError::Validation(_))));
    }

    #[tokio::test]
    async fn test_finalize_appends_in_one_write() {
        let fx = fixture(FakeImageService::default());
        fx.gallery.create_collection("Sunsets", None).await.unwrap();
        let version_before = fx.store.load().await.unwrap().version;

        let saved = fx
            .gallery
            .finalize_uploads(
                "Sunsets",
                vec![
                    ImageDimensions { id: "a".to_string(), width: Some(10), height: Some(20) },
                    ImageDimensions { id: "b".to_string(), width: None, height: None },
                ],
            )
            .await
            .unwrap();

        assert_eq!(saved, 2);
        assert_eq!(
            fx.store.load().await.unwrap().version,
            version_before + 1
        );

        let stored = fx.store.find("Sunsets").await.unwrap().unwrap();
        assert_eq!(stored.images[0].width, Some(10));
        assert!(stored.images[1].width.is_none());
    }

    #[tokio::test]
    async fn test_remeasure_backfills_missing_dimensions() {
        let fx = fixture(FakeImageService::default());
        fx.gallery.create_collection("Sunsets", None).await.unwrap();
        fx.gallery
            .finalize_uploads(
                "Sunsets",
                vec![
                    ImageDimensions { id: "a".to_string(), width: None, height: None },
                    ImageDimensions { id: "b".to_string(), width: None, height: None },
                ],
            )
            .await
            .unwrap();

        let report = fx
            .gallery
            .remeasure(
                "Sunsets",
                vec![
                    ImageDimensions { id: "a".to_string(), width: Some(800), height: Some(600) },
                    // Dimensions omitted: fetched from the image service.
                    ImageDimensions { id: "b".to_string(), width: None, height: None },
                    // Not a member: skipped.
                    ImageDimensions { id: "ghost".to_string(), width: Some(1), height: Some(1) },
                ],
            )
            .await
            .unwrap();

        assert_eq!(report.updated, 2);
        assert_eq!(report.skipped, 1);

        let stored = fx.store.find("Sunsets").await.unwrap().unwrap();
        assert_eq!(stored.images[0].width, Some(800));
        assert_eq!(stored.images[1].width, Some(640));
        assert_eq!(stored.images[1].height, Some(480));
    }

    #[tokio::test]
    async fn test_list_collections_signs_first_image_as_thumbnail() {
        let fx = fixture(FakeImageService::default());
        fx.gallery.create_collection("Empty", None).await.unwrap();
        fx.gallery.create_collection("Full", None).await.unwrap();
        fx.gallery
            .finalize_uploads(
                "Full",
                vec![ImageDimensions { id: "img-1".to_string(), width: None, height: None }],
            )
            .await
            .unwrap();

        let collections = fx.gallery.list_collections().await.unwrap();
        let empty = collections.iter().find(|c| c.name == "Empty").unwrap();
        let full = collections.iter().find(|c| c.name == "Full").unwrap();

        assert!(empty.thumbnail.is_none());
        let thumb = full.thumbnail.as_ref().unwrap();
        assert!(thumb.contains("/img-1/thumb?exp="));
    }

    #[tokio::test]
    async fn test_collection_images_signs_requested_variant() {
        let fx = fixture(FakeImageService::default());
        fx.gallery.create_collection("Sunsets", None).await.unwrap();
        fx.gallery
            .finalize_uploads(
                "Sunsets",
                vec![ImageDimensions { id: "img-1".to_string(), width: None, height: None }],
            )
            .await
            .unwrap();

        let views = fx
            .gallery
            .collection_images("Sunsets", Variant::Private800)
            .await
            .unwrap();
        assert_eq!(views.len(), 1);
        assert!(views[0].url.contains("/img-1/private800?exp="));
        assert!(views[0].url.contains("&sig="));
    }

    #[tokio::test]
    async fn test_viewing_url_requires_membership() {
        let fx = fixture(FakeImageService::default());
        fx.gallery.create_collection("Sunsets", None).await.unwrap();

        let result = fx
            .gallery
            .viewing_url("Sunsets", "ghost", Variant::Public, None)
            .await;
        assert!(matches!(result, Err(GalleryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_viewing_url_rejects_out_of_range_expiry() {
        let fx = fixture(FakeImageService::default());
        fx.gallery.create_collection("Sunsets", None).await.unwrap();
        fx.gallery
            .finalize_uploads(
                "Sunsets",
                vec![ImageDimensions { id: "img-1".to_string(), width: None, height: None }],
            )
            .await
            .unwrap();

        // Would overflow the signing arithmetic if it got that far.
        let huge = fx
            .gallery
            .viewing_url("Sunsets", "img-1", Variant::Public, Some(10_000_000_000_000_000))
            .await;
        assert!(matches!(huge, Err(GalleryError::Validation(_))));

        let zero = fx
            .gallery
            .viewing_url("Sunsets", "img-1", Variant::Public, Some(0))
            .await;
        assert!(matches!(zero, Err(GalleryError::Validation(_))));

        fx.gallery
            .viewing_url("Sunsets", "img-1", Variant::Public, Some(MAX_EXPIRY_SECS))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_export_streams_member_bytes() {
        let fx = fixture(FakeImageService::default());
        fx.gallery.create_collection("Sunsets", None).await.unwrap();
        fx.gallery
            .finalize_uploads(
                "Sunsets",
                vec![ImageDimensions { id: "img-1".to_string(), width: None, height: None }],
            )
            .await
            .unwrap();

        let export = fx.gallery.export_image("Sunsets", "img-1").await.unwrap();
        assert_eq!(export.content_type.as_deref(), Some("image/jpeg"));

        let chunks: Vec<_> = export.body.collect().await;
        let bytes: Vec<u8> = chunks
            .into_iter()
            .map(|chunk| chunk.unwrap())
            .flat_map(|b| b.to_vec())
            .collect();
        assert_eq!(bytes, b"jpeg-bytes");
    }
}
