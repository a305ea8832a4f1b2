//! Atelier Gallery Service
//!
//! Image collection gallery backed by a remote image CDN. Collections and
//! their image membership live as one versioned JSON document in a KV
//! namespace; binaries live in the image service and are reached through
//! HMAC-signed delivery URLs. Comments and their per-image counters live
//! in SQLite.
//!
//! ## Features
//!
//! - **Versioned Collection Document**: Single KV document with write-time
//!   conflict detection and bounded retry
//! - **Batch Asset Orchestration**: Concurrent uploads and deletes with
//!   exactly one membership write per logical batch
//! - **Signed Delivery URLs**: Time-limited HMAC-SHA256 URLs per image
//!   variant for gallery viewing
//! - **Comments with Rate Limiting**: SQLite-backed comments, fixed-window
//!   per-client limits kept in KV
//!
//! ## Architecture
//!
//! ```text
//! HTTP API                    KV Namespace              Image Service
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Collections  │           │ collections  │          │ upload /     │
//! │ Images       │──────────▶│ auth         │          │ delete /     │
//! │ Comments     │           │ rate:*       │          │ direct_upload│
//! └──────────────┘           └──────────────┘          └──────────────┘
//!        │                          ▲                         ▲
//!        │                          │                         │
//!        ▼                          │                         │
//! ┌──────────────┐           ┌──────────────┐          ┌──────────────┐
//! │ Gallery      │──────────▶│ Collection   │          │ Worker       │
//! │ Service      │           │ Store        │          │ Pool         │
//! └──────────────┘           └──────────────┘          └──────────────┘
//!        │                                                    │
//!        ▼                                                    │
//! ┌──────────────┐           ┌──────────────┐                 │
//! │ URL          │           │ Comment      │◀────────────────┘
//! │ Signer       │           │ Store        │
//! └──────────────┘           └──────────────┘
//! ```

pub mod access;
pub mod api;
pub mod collection_store;
pub mod comments;
pub mod config;
pub mod delivery_url;
pub mod error;
pub mod gallery;
pub mod image_service;
pub mod kv_store;
pub mod rate_limiter;
pub mod worker_pool;

pub use access::AccessGate;
pub use api::AppState;
pub use collection_store::{Collection, CollectionStore, CollectionsDocument, ImageRecord};
pub use comments::{Comment, CommentStore};
pub use config::Config;
pub use delivery_url::{SignedUrl, UrlSigner, Variant};
pub use error::{ErrorResponse, GalleryError};
pub use gallery::{BatchUploadOutcome, DeleteReport, GalleryService, PreparedUploads};
pub use image_service::{HttpImageService, ImageService};
pub use kv_store::{HttpKvStore, KvStore, MemoryKvStore};
pub use rate_limiter::CommentRateLimiter;
