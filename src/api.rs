//! HTTP API for the gallery service.
//!
//! Management routes require a site credential, viewing routes a
//! collection password when one is set. The credential rides either the
//! `x-gallery-key` header or a `k` query parameter; gates run before any
//! mutation is attempted.

use anyhow::Context;
use axum::body::Body;
use axum::extract::{ConnectInfo, Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::Response;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::access::AccessGate;
use crate::collection_store::{Collection, CollectionStore};
use crate::comments::{Comment, CommentStore};
use crate::config::Config;
use crate::delivery_url::{SignedUrl, Variant};
use crate::error::GalleryError;
use crate::gallery::{
    BatchUploadOutcome, DeleteReport, GalleryService, ImageDimensions, ImageView,
    PreparedUploads, RemeasureReport, UploadFile,
};
use crate::rate_limiter::CommentRateLimiter;

/// Shared state handed to every handler.
pub struct AppState {
    pub config: Arc<Config>,
    pub collections: Arc<CollectionStore>,
    pub gallery: Arc<GalleryService>,
    pub comments: Arc<CommentStore>,
    pub limiter: Arc<CommentRateLimiter>,
    pub gate: Arc<AccessGate>,
}

pub fn create_router(state: AppState) -> Router {
    let cors = if state.config.api.cors_enabled {
        let origins: Vec<HeaderValue> = state
            .config
            .api
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        if origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route(
            "/api/v1/collections",
            get(list_collections).post(create_collection),
        )
        .route("/api/v1/collections/:name", delete(delete_collection))
        .route("/api/v1/collections/:name/settings", put(update_settings))
        .route(
            "/api/v1/collections/:name/images",
            get(list_images).post(add_images),
        )
        .route(
            "/api/v1/collections/:name/images/:image_id",
            delete(remove_image),
        )
        .route(
            "/api/v1/collections/:name/images/:image_id/url",
            get(issue_viewing_url),
        )
        .route(
            "/api/v1/collections/:name/images/:image_id/export",
            get(export_image),
        )
        .route(
            "/api/v1/collections/:name/images/:image_id/comments",
            get(list_comments).post(add_comment),
        )
        .route(
            "/api/v1/collections/:name/uploads/prepare",
            post(prepare_uploads),
        )
        .route(
            "/api/v1/collections/:name/uploads/finalize",
            post(finalize_uploads),
        )
        .route("/api/v1/collections/:name/remeasure", post(remeasure_images))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(Arc::new(state))
}

pub async fn start_api_server(state: AppState) -> anyhow::Result<()> {
    let addr = format!("{}:{}", state.config.api.host, state.config.api.port);
    let router = create_router(state);

    info!(address = %addr, "Starting gallery API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    // Comment rate limiting keys off the peer address when no forwarding
    // header is present.
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("API server error")?;

    Ok(())
}

/// Bytes-in-JSON codec for upload payloads.
mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    service: &'static str,
}

#[derive(Debug, Serialize)]
struct ReadyResponse {
    status: &'static str,
}

/// Listing view of a collection; the password never leaves the server.
#[derive(Debug, Serialize)]
struct CollectionSummary {
    name: String,
    protected: bool,
    image_count: usize,
    thumbnail: Option<String>,
}

impl From<Collection> for CollectionSummary {
    fn from(collection: Collection) -> Self {
        Self {
            protected: collection.password.is_some(),
            image_count: collection.images.len(),
            name: collection.name,
            thumbnail: collection.thumbnail,
        }
    }
}

#[derive(Debug, Deserialize)]
struct CreateCollectionRequest {
    name: String,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UpdateSettingsRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    password: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct UploadPayload {
    #[serde(with = "base64_bytes")]
    data: Vec<u8>,
    #[serde(default)]
    alt_text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AddImagesRequest {
    files: Vec<UploadPayload>,
}

#[derive(Debug, Serialize)]
struct RemovedResponse {
    removed: String,
}

#[derive(Debug, Deserialize)]
struct PrepareRequest {
    count: usize,
}

#[derive(Debug, Deserialize)]
struct FinalizeRequest {
    #[serde(default)]
    items: Vec<ImageDimensions>,
    /// Older clients send bare asset ids instead of dimension items.
    #[serde(default)]
    ids: Vec<String>,
}

impl FinalizeRequest {
    fn into_items(self) -> Vec<ImageDimensions> {
        if !self.items.is_empty() {
            return self.items;
        }
        self.ids
            .into_iter()
            .map(|id| ImageDimensions {
                id,
                width: None,
                height: None,
            })
            .collect()
    }
}

#[derive(Debug, Serialize)]
struct FinalizeResponse {
    saved: usize,
}

#[derive(Debug, Deserialize)]
struct RemeasureRequest {
    items: Vec<ImageDimensions>,
}

#[derive(Debug, Deserialize)]
struct AuthQuery {
    #[serde(default)]
    k: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ImagesQuery {
    #[serde(default)]
    k: Option<String>,
    #[serde(default)]
    variant: Option<Variant>,
}

#[derive(Debug, Deserialize)]
struct UrlQuery {
    #[serde(default)]
    k: Option<String>,
    #[serde(default)]
    variant: Option<Variant>,
    #[serde(default)]
    expiry_secs: Option<u64>,
}

#[derive(Debug, Serialize)]
struct ImageWithComments {
    #[serde(flatten)]
    image: ImageView,
    comment_count: i64,
}

#[derive(Debug, Serialize)]
struct ListImagesResponse {
    collection: String,
    images: Vec<ImageWithComments>,
}

#[derive(Debug, Deserialize)]
struct AddCommentRequest {
    text: String,
    #[serde(default)]
    author: Option<String>,
}

#[derive(Debug, Serialize)]
struct CommentsResponse {
    comments: Vec<Comment>,
}

#[derive(Debug, Serialize)]
struct CommentCreatedResponse {
    comment: Comment,
}

fn credential(headers: &HeaderMap, key_param: &Option<String>) -> Option<String> {
    headers
        .get("x-gallery-key")
        .and_then(|value| value.to_str().ok())
        .map(String::from)
        .or_else(|| key_param.clone())
}

/// Rate-limit key: the nearest client address, preferring the forwarding
/// header a fronting proxy sets.
fn client_identifier(headers: &HeaderMap, addr: SocketAddr) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(|ip| ip.trim().to_string())
        .filter(|ip| !ip.is_empty())
        .unwrap_or_else(|| addr.ip().to_string())
}

async fn require_site(state: &AppState, credential: Option<&str>) -> Result<(), GalleryError> {
    if state.gate.authorize_site(credential).await? {
        Ok(())
    } else {
        Err(GalleryError::Unauthorized)
    }
}

async fn require_collection_access(
    state: &AppState,
    name: &str,
    credential: Option<&str>,
) -> Result<Collection, GalleryError> {
    let collection = state
        .collections
        .find(name)
        .await?
        .ok_or_else(|| GalleryError::not_found(format!("collection {name}")))?;

    if AccessGate::authorize_collection(&collection, credential) {
        Ok(collection)
    } else {
        Err(GalleryError::Unauthorized)
    }
}

async fn health_check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: "atelier",
    })
}

async fn readiness_check(
    State(state): State<Arc<AppState>>,
) -> Result<Json<ReadyResponse>, GalleryError> {
    sqlx::query("SELECT 1").execute(state.comments.pool()).await?;
    Ok(Json(ReadyResponse { status: "ready" }))
}

async fn list_collections(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Result<Json<Vec<CollectionSummary>>, GalleryError> {
    require_site(&state, credential(&headers, &query.k).as_deref()).await?;

    let collections = state.gallery.list_collections().await?;
    Ok(Json(
        collections.into_iter().map(CollectionSummary::from).collect(),
    ))
}

async fn create_collection(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    Json(request): Json<CreateCollectionRequest>,
) -> Result<(StatusCode, Json<CollectionSummary>), GalleryError> {
    require_site(&state, credential(&headers, &query.k).as_deref()).await?;

    let created = state
        .gallery
        .create_collection(&request.name, request.password)
        .await?;
    Ok((StatusCode::CREATED, Json(CollectionSummary::from(created))))
}

async fn delete_collection(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Result<Json<DeleteReport>, GalleryError> {
    require_site(&state, credential(&headers, &query.k).as_deref()).await?;

    let report = state.gallery.delete_collection(&name).await?;
    Ok(Json(report))
}

async fn update_settings(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    Json(request): Json<UpdateSettingsRequest>,
) -> Result<Json<CollectionSummary>, GalleryError> {
    require_site(&state, credential(&headers, &query.k).as_deref()).await?;

    let updated = state
        .gallery
        .update_settings(&name, request.name, request.password)
        .await?;
    Ok(Json(CollectionSummary::from(updated)))
}

async fn list_images(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<ImagesQuery>,
    headers: HeaderMap,
) -> Result<Json<ListImagesResponse>, GalleryError> {
    let credential = credential(&headers, &query.k);
    let collection = require_collection_access(&state, &name, credential.as_deref()).await?;

    let variant = query.variant.unwrap_or_default();
    let views = state
        .gallery
        .collection_images(&collection.name, variant)
        .await?;
    let counts = state.comments.comment_counts(&collection.name).await?;

    let images = views
        .into_iter()
        .map(|image| {
            let comment_count = counts.get(&image.id).copied().unwrap_or(0);
            ImageWithComments {
                image,
                comment_count,
            }
        })
        .collect();

    Ok(Json(ListImagesResponse {
        collection: collection.name,
        images,
    }))
}

async fn add_images(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    Json(request): Json<AddImagesRequest>,
) -> Result<Json<BatchUploadOutcome>, GalleryError> {
    require_site(&state, credential(&headers, &query.k).as_deref()).await?;

    let files = request
        .files
        .into_iter()
        .map(|payload| UploadFile {
            data: payload.data,
            alt_text: payload.alt_text,
        })
        .collect();
    let outcome = state.gallery.add_images(&name, files).await?;
    Ok(Json(outcome))
}

async fn remove_image(
    State(state): State<Arc<AppState>>,
    Path((name, image_id)): Path<(String, String)>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Result<Json<RemovedResponse>, GalleryError> {
    require_site(&state, credential(&headers, &query.k).as_deref()).await?;

    state.gallery.delete_image(&name, &image_id).await?;
    Ok(Json(RemovedResponse { removed: image_id }))
}

async fn issue_viewing_url(
    State(state): State<Arc<AppState>>,
    Path((name, image_id)): Path<(String, String)>,
    Query(query): Query<UrlQuery>,
    headers: HeaderMap,
) -> Result<Json<SignedUrl>, GalleryError> {
    let credential = credential(&headers, &query.k);
    let collection = require_collection_access(&state, &name, credential.as_deref()).await?;

    let variant = query.variant.unwrap_or_default();
    let signed = state
        .gallery
        .viewing_url(&collection.name, &image_id, variant, query.expiry_secs)
        .await?;
    metrics::counter!("gallery.api.urls_issued").increment(1);
    Ok(Json(signed))
}

async fn export_image(
    State(state): State<Arc<AppState>>,
    Path((name, image_id)): Path<(String, String)>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
) -> Result<Response, GalleryError> {
    let credential = credential(&headers, &query.k);
    let collection = require_collection_access(&state, &name, credential.as_deref()).await?;

    let export = state.gallery.export_image(&collection.name, &image_id).await?;
    let content_type = export
        .content_type
        .unwrap_or_else(|| "application/octet-stream".to_string());

    Response::builder()
        .header(header::CONTENT_TYPE, content_type)
        .body(Body::from_stream(export.body))
        .map_err(|e| GalleryError::storage(format!("failed to build export response: {e}")))
}

async fn prepare_uploads(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    Json(request): Json<PrepareRequest>,
) -> Result<Json<PreparedUploads>, GalleryError> {
    require_site(&state, credential(&headers, &query.k).as_deref()).await?;

    // The collection must exist before tickets are handed out.
    state
        .collections
        .find(&name)
        .await?
        .ok_or_else(|| GalleryError::not_found(format!("collection {name}")))?;
    let prepared = state.gallery.prepare_uploads(request.count).await?;
    Ok(Json(prepared))
}

async fn finalize_uploads(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    Json(request): Json<FinalizeRequest>,
) -> Result<Json<FinalizeResponse>, GalleryError> {
    require_site(&state, credential(&headers, &query.k).as_deref()).await?;

    let saved = state
        .gallery
        .finalize_uploads(&name, request.into_items())
        .await?;
    Ok(Json(FinalizeResponse { saved }))
}

async fn remeasure_images(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
    Query(query): Query<AuthQuery>,
    headers: HeaderMap,
    Json(request): Json<RemeasureRequest>,
) -> Result<Json<RemeasureReport>, GalleryError> {
    require_site(&state, credential(&headers, &query.k).as_deref()).await?;

    let report = state.gallery.remeasure(&name, request.items).await?;
    Ok(Json(report))
}

async fn list_comments(
    State(state): State<Arc<AppState>>,
    Path((name, image_id)): Path<(String, String)>,
) -> Result<Json<CommentsResponse>, GalleryError> {
    let comments = state.comments.list_comments(&name, &image_id).await?;
    Ok(Json(CommentsResponse { comments }))
}

async fn add_comment(
    State(state): State<Arc<AppState>>,
    Path((name, image_id)): Path<(String, String)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<AddCommentRequest>,
) -> Result<Json<CommentCreatedResponse>, GalleryError> {
    let client = client_identifier(&headers, addr);
    state.limiter.check(&client).await?;

    let comment = state
        .comments
        .add_comment(&name, &image_id, &request.text, request.author.as_deref())
        .await?;
    Ok(Json(CommentCreatedResponse { comment }))
}
