use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::models::{CollectionKind, CollectionRecord, COLLECTION_COLUMNS};
use super::locks::stale_lock_cutoff;
use super::{to_timestamp, StorageError};
use crate::core::fetchable::Serie;

/// Feeds never fetched, with a retry due at `?1`, or followed and last
/// fetched successfully before `?2`.
pub(crate) const FEED_IS_DUE: &str = r#"type = 'feed'
  AND (
    feed_fetched_at IS NULL
    OR (feed_fetched_retry_at IS NOT NULL AND feed_fetched_retry_at <= ?1)
    OR (
      feed_fetched_retry_at IS NULL
      AND feed_fetched_code >= 200 AND feed_fetched_code < 300
      AND feed_fetched_at <= ?2
      AND EXISTS (SELECT 1 FROM followed_collections fc WHERE fc.collection_id = collections.id)
    )
  )"#;

#[derive(Debug, Clone)]
pub struct CollectionRepository {
    pool: SqlitePool,
}

impl CollectionRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        user_id: i64,
        kind: CollectionKind,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<CollectionRecord, StorageError> {
        let id = sqlx::query(
            "INSERT INTO collections (user_id, name, type, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(user_id)
        .bind(name)
        .bind(kind.as_str())
        .bind(to_timestamp(now))
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        self.get(id).await
    }

    pub async fn create_feed(
        &self,
        user_id: i64,
        feed_url: &str,
        now: DateTime<Utc>,
    ) -> Result<CollectionRecord, StorageError> {
        let id = sqlx::query(
            r#"
            INSERT INTO collections (user_id, name, type, feed_url, created_at)
            VALUES (?1, ?2, 'feed', ?2, ?3)
            "#,
        )
        .bind(user_id)
        .bind(feed_url)
        .bind(to_timestamp(now))
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        self.get(id).await
    }

    pub async fn find_or_create_feed(
        &self,
        user_id: i64,
        feed_url: &str,
        now: DateTime<Utc>,
    ) -> Result<CollectionRecord, StorageError> {
        let existing = sqlx::query_as::<_, CollectionRecord>(&format!(
            "SELECT {COLLECTION_COLUMNS} FROM collections WHERE user_id = ?1 AND feed_url = ?2"
        ))
        .bind(user_id)
        .bind(feed_url)
        .fetch_optional(&self.pool)
        .await?;
        match existing {
            Some(collection) => Ok(collection),
            None => self.create_feed(user_id, feed_url, now).await,
        }
    }

    pub async fn find(&self, id: i64) -> Result<Option<CollectionRecord>, StorageError> {
        let row = sqlx::query_as::<_, CollectionRecord>(&format!(
            "SELECT {COLLECTION_COLUMNS} FROM collections WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    async fn get(&self, id: i64) -> Result<CollectionRecord, StorageError> {
        self.find(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("collection {id}")))
    }

    /// Returns the user's system collection of this kind, creating it if needed.
    pub async fn find_or_create_by_kind(
        &self,
        user_id: i64,
        kind: CollectionKind,
        now: DateTime<Utc>,
    ) -> Result<CollectionRecord, StorageError> {
        let existing = sqlx::query_as::<_, CollectionRecord>(&format!(
            "SELECT {COLLECTION_COLUMNS} FROM collections WHERE user_id = ?1 AND type = ?2 ORDER BY id LIMIT 1"
        ))
        .bind(user_id)
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        match existing {
            Some(collection) => Ok(collection),
            None => self.create(user_id, kind, kind.default_name(), now).await,
        }
    }

    pub async fn follow(
        &self,
        user_id: i64,
        collection_id: i64,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            INSERT INTO followed_collections (user_id, collection_id, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(user_id, collection_id) DO NOTHING
            "#,
        )
        .bind(user_id)
        .bind(collection_id)
        .bind(to_timestamp(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Feeds never fetched, with a due retry, or followed and last fetched
    /// successfully before `refresh_before`. Feeds held by a live lock are left
    /// out.
    pub async fn list_feeds_to_fetch(
        &self,
        max: usize,
        serie: Option<Serie>,
        now: DateTime<Utc>,
        refresh_before: DateTime<Utc>,
    ) -> Result<Vec<CollectionRecord>, StorageError> {
        let rows = sqlx::query_as::<_, CollectionRecord>(&format!(
            r#"
            SELECT {COLLECTION_COLUMNS}
            FROM collections
            WHERE {FEED_IS_DUE}
              AND (locked_at IS NULL OR locked_at <= ?6)
              AND (?3 IS NULL OR id % ?3 = ?4)
            ORDER BY feed_fetched_at IS NOT NULL, feed_fetched_at, id
            LIMIT ?5
            "#
        ))
        .bind(to_timestamp(now))
        .bind(to_timestamp(refresh_before))
        .bind(serie.map(|serie| i64::from(serie.total)))
        .bind(serie.map(|serie| i64::from(serie.number)).unwrap_or_default())
        .bind(max as i64)
        .bind(to_timestamp(stale_lock_cutoff(now)))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_feeds_to_fetch(
        &self,
        now: DateTime<Utc>,
        refresh_before: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM collections WHERE {FEED_IS_DUE}"
        ))
        .bind(to_timestamp(now))
        .bind(to_timestamp(refresh_before))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Persists feed metadata and fetch fields, and releases the lock.
    pub async fn save_feed_fetch(&self, collection: &CollectionRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE collections
            SET name = ?1,
                feed_type = ?2,
                feed_site_url = ?3,
                feed_last_hash = ?4,
                feed_parse_error = ?5,
                feed_fetched_at = ?6,
                feed_fetched_code = ?7,
                feed_fetched_error = ?8,
                feed_fetched_count = ?9,
                feed_fetched_retry_at = ?10,
                locked_at = NULL
            WHERE id = ?11
            "#,
        )
        .bind(&collection.name)
        .bind(&collection.feed_type)
        .bind(&collection.feed_site_url)
        .bind(&collection.feed_last_hash)
        .bind(&collection.feed_parse_error)
        .bind(collection.feed_fetched_at)
        .bind(collection.feed_fetched_code)
        .bind(&collection.feed_fetched_error)
        .bind(collection.feed_fetched_count)
        .bind(collection.feed_fetched_retry_at)
        .bind(collection.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn list_followed_feeds(
        &self,
        owner_id: i64,
    ) -> Result<Vec<CollectionRecord>, StorageError> {
        let rows = sqlx::query_as::<_, CollectionRecord>(&format!(
            r#"
            SELECT {COLLECTION_COLUMNS}
            FROM collections
            WHERE user_id = ?1
              AND type = 'feed'
              AND EXISTS (SELECT 1 FROM followed_collections fc WHERE fc.collection_id = collections.id)
            ORDER BY id
            "#
        ))
        .bind(owner_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete_unfollowed_feeds(
        &self,
        owner_id: i64,
        before: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let affected = sqlx::query(
            r#"
            DELETE FROM collections
            WHERE user_id = ?1
              AND type = 'feed'
              AND created_at < ?2
              AND NOT EXISTS (SELECT 1 FROM followed_collections fc WHERE fc.collection_id = collections.id)
            "#,
        )
        .bind(owner_id)
        .bind(to_timestamp(before))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }
}
