//! Client for the remote image service that stores the actual asset bytes.
//!
//! Mutating calls go to the account endpoint with the long-lived API
//! token, or to the batch endpoint when a short-lived batch token is in
//! play. Failures surface as [`GalleryError::Remote`] carrying the
//! remote status and body.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use reqwest::multipart;
use serde::Deserialize;
use tracing::instrument;

use crate::config::ImagesConfig;
use crate::error::GalleryError;

/// Short-lived token authorizing a burst of uploads or deletes.
#[derive(Debug, Clone, Deserialize)]
pub struct BatchToken {
    pub token: String,
    #[serde(rename = "expiresAt")]
    pub expires_at: DateTime<Utc>,
}

/// One-time upload slot a client can push bytes to directly.
#[derive(Debug, Clone, Deserialize)]
pub struct DirectUpload {
    pub id: String,
    #[serde(rename = "uploadURL")]
    pub upload_url: String,
}

/// Dimensions and identity of a stored image.
#[derive(Debug, Clone, Deserialize)]
pub struct ImageDetails {
    pub id: String,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
}

/// Original-quality image bytes streamed out of the remote service.
pub struct ImageExport {
    pub content_type: Option<String>,
    pub body: BoxStream<'static, Result<Bytes, GalleryError>>,
}

/// Operations the gallery needs from the remote image service.
#[async_trait]
pub trait ImageService: Send + Sync {
    /// Uploads one image and returns its asset id.
    async fn upload(&self, data: &[u8], batch_token: Option<&str>) -> Result<String, GalleryError>;

    /// Deletes one image by asset id.
    async fn delete(&self, image_id: &str, batch_token: Option<&str>)
        -> Result<(), GalleryError>;

    /// Issues a batch token for a burst of mutations.
    async fn batch_token(&self) -> Result<BatchToken, GalleryError>;

    /// Reserves a direct-upload slot.
    async fn direct_upload(&self) -> Result<DirectUpload, GalleryError>;

    /// Fetches stored metadata for one image.
    async fn details(&self, image_id: &str) -> Result<ImageDetails, GalleryError>;

    /// Streams the original bytes of one image.
    async fn export(&self, image_id: &str) -> Result<ImageExport, GalleryError>;
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    result: T,
}

/// HTTP implementation of [`ImageService`].
pub struct HttpImageService {
    client: reqwest::Client,
    api_base: String,
    batch_base: String,
    account_id: String,
    api_token: String,
}

impl HttpImageService {
    pub fn new(config: &ImagesConfig) -> Result<Self, GalleryError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self {
            client,
            api_base: config.api_base.trim_end_matches('/').to_string(),
            batch_base: config.batch_base.trim_end_matches('/').to_string(),
            account_id: config.account_id.clone(),
            api_token: config.api_token.clone(),
        })
    }

    fn account_url(&self, suffix: &str) -> String {
        format!(
            "{}/accounts/{}/images/{}",
            self.api_base, self.account_id, suffix
        )
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, GalleryError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        metrics::counter!("gallery.images.remote_errors").increment(1);
        let body = response.text().await.unwrap_or_default();
        Err(GalleryError::remote(status.as_u16(), body))
    }
}

#[async_trait]
impl ImageService for HttpImageService {
    #[instrument(skip(self, data), fields(size_bytes = data.len(), batched = batch_token.is_some()))]
    async fn upload(&self, data: &[u8], batch_token: Option<&str>) -> Result<String, GalleryError> {
        let part = multipart::Part::bytes(data.to_vec()).file_name("upload.bin");
        let form = multipart::Form::new()
            .part("file", part)
            .text("requireSignedURLs", "true");

        let (url, token) = match batch_token {
            Some(token) => (format!("{}/images/v1", self.batch_base), token.to_string()),
            None => (self.account_url("v1"), self.api_token.clone()),
        };

        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .multipart(form)
            .send()
            .await?;
        let response = Self::check(response).await?;

        let envelope: Envelope<UploadResult> = response.json().await?;
        metrics::counter!("gallery.images.uploads").increment(1);
        Ok(envelope.result.id)
    }

    #[instrument(skip(self), fields(batched = batch_token.is_some()))]
    async fn delete(
        &self,
        image_id: &str,
        batch_token: Option<&str>,
    ) -> Result<(), GalleryError> {
        let (url, token) = match batch_token {
            Some(token) => (
                format!("{}/images/v1/{}", self.batch_base, image_id),
                token.to_string(),
            ),
            None => (
                self.account_url(&format!("v1/{image_id}")),
                self.api_token.clone(),
            ),
        };

        let response = self.client.delete(&url).bearer_auth(token).send().await?;
        Self::check(response).await?;
        metrics::counter!("gallery.images.deletes").increment(1);
        Ok(())
    }

    async fn batch_token(&self) -> Result<BatchToken, GalleryError> {
        let response = self
            .client
            .get(self.account_url("v1/batch_token"))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        let response = Self::check(response).await?;

        let envelope: Envelope<BatchToken> = response.json().await?;
        Ok(envelope.result)
    }

    async fn direct_upload(&self) -> Result<DirectUpload, GalleryError> {
        let form = multipart::Form::new().text("requireSignedURLs", "true");

        let response = self
            .client
            .post(self.account_url("v2/direct_upload"))
            .bearer_auth(&self.api_token)
            .multipart(form)
            .send()
            .await?;
        let response = Self::check(response).await?;

        let envelope: Envelope<DirectUpload> = response.json().await?;
        Ok(envelope.result)
    }

    async fn details(&self, image_id: &str) -> Result<ImageDetails, GalleryError> {
        let response = self
            .client
            .get(self.account_url(&format!("v1/{image_id}")))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        let response = Self::check(response).await?;

        let envelope: Envelope<ImageDetails> = response.json().await?;
        Ok(envelope.result)
    }

    #[instrument(skip(self))]
    async fn export(&self, image_id: &str) -> Result<ImageExport, GalleryError> {
        let response = self
            .client
            .get(self.account_url(&format!("v1/{image_id}/blob")))
            .bearer_auth(&self.api_token)
            .send()
            .await?;
        let response = Self::check(response).await?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(String::from);
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(GalleryError::from))
            .boxed();

        Ok(ImageExport { content_type, body })
    }
}

#[derive(Debug, Deserialize)]
struct UploadResult {
    id: String,
}
