//! Relational comment ledger with per-image counters.
//!
//! Every comment lands in `comments`; the matching row in
//! `image_comment_stats` is bumped in the same transaction, so the
//! counter always equals the number of ledger rows for that image.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::collections::HashMap;
use tracing::instrument;
use uuid::Uuid;

use crate::config::DatabaseConfig;
use crate::error::GalleryError;

pub const DEFAULT_AUTHOR: &str = "Guest";
pub const MAX_AUTHOR_LEN: usize = 80;

/// One comment on one image of one collection.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Comment {
    pub id: String,
    pub collection: String,
    pub image_id: String,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub author: String,
}

/// Missing author names fall back to a guest label; long ones are cut
/// to the column width.
fn normalize_author(author: Option<&str>) -> String {
    author
        .unwrap_or(DEFAULT_AUTHOR)
        .chars()
        .take(MAX_AUTHOR_LEN)
        .collect()
}

/// Store for comments and their per-image counters.
pub struct CommentStore {
    pool: SqlitePool,
}

impl CommentStore {
    pub async fn new(config: &DatabaseConfig) -> Result<Self, GalleryError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.connect_timeout())
            .idle_timeout(config.idle_timeout())
            .connect(&config.url)
            .await?;

        Ok(Self { pool })
    }

    pub fn with_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn run_migrations(&self) -> Result<(), GalleryError> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| GalleryError::storage(format!("migrations failed: {e}")))?;
        Ok(())
    }

    /// Inserts a comment and bumps the image's counter in one
    /// transaction. The text is trimmed and must be non-empty.
    #[instrument(skip(self, text, author))]
    pub async fn add_comment(
        &self,
        collection: &str,
        image_id: &str,
        text: &str,
        author: Option<&str>,
    ) -> Result<Comment, GalleryError> {
        let text = text.trim();
        if text.is_empty() {
            return Err(GalleryError::validation("comment text is required"));
        }

        let comment = Comment {
            id: Uuid::new_v4().to_string(),
            collection: collection.to_string(),
            image_id: image_id.to_string(),
            text: text.to_string(),
            created_at: Utc::now(),
            author: normalize_author(author),
        };

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "INSERT INTO comments (id, collection, image_id, text, created_at, author)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        )
        .bind(&comment.id)
        .bind(&comment.collection)
        .bind(&comment.image_id)
        .bind(&comment.text)
        .bind(comment.created_at)
        .bind(&comment.author)
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            "INSERT INTO image_comment_stats (collection, image_id, comment_count)
             VALUES (?1, ?2, 1)
             ON CONFLICT(collection, image_id)
             DO UPDATE SET comment_count = comment_count + 1",
        )
        .bind(&comment.collection)
        .bind(&comment.image_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        metrics::counter!("gallery.comments.added").increment(1);
        Ok(comment)
    }

    /// Comments for one image, most recent first.
    pub async fn list_comments(
        &self,
        collection: &str,
        image_id: &str,
    ) -> Result<Vec<Comment>, GalleryError> {
        let comments = sqlx::query_as::<_, Comment>(
            "SELECT id, collection, image_id, text, created_at, author
             FROM comments
             WHERE collection = ?1 AND image_id = ?2
             ORDER BY created_at DESC",
        )
        .bind(collection)
        .bind(image_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(comments)
    }

    /// Comment counts for every image of a collection that has any.
    pub async fn comment_counts(
        &self,
        collection: &str,
    ) -> Result<HashMap<String, i64>, GalleryError> {
        let rows = sqlx::query_as::<_, (String, i64)>(
            "SELECT image_id, comment_count FROM image_comment_stats WHERE collection = ?1",
        )
        .bind(collection)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().collect())
    }
}
