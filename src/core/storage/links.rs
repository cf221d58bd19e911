use chrono::{DateTime, Utc};
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

use super::models::{CollectionLinkRow, LinkRecord, NewLink, LINK_COLUMNS};
use super::locks::stale_lock_cutoff;
use super::{to_timestamp, StorageError};
use crate::core::fetchable::Serie;

/// Never fetched, or with a retry due at `?1`.
pub(crate) const LINK_IS_DUE: &str =
    "(fetched_at IS NULL OR (fetched_retry_at IS NOT NULL AND fetched_retry_at <= ?1))";

/// A link of a followed collection, proposed to a user's news.
#[derive(Debug, Clone, FromRow)]
pub struct NewsCandidate {
    pub link_id: i64,
    pub url: String,
    pub title: String,
    pub reading_time: i64,
    pub collection_id: i64,
    pub published_at: i64,
}

#[derive(Debug, Clone)]
pub struct LinkRepository {
    pool: SqlitePool,
}

impl LinkRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(&self, link: &NewLink) -> Result<LinkRecord, StorageError> {
        let id = sqlx::query(
            r#"
            INSERT INTO links (user_id, url, title, reading_time, feed_entry_id, source_type, source_resource_id, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
        )
        .bind(link.user_id)
        .bind(&link.url)
        .bind(&link.title)
        .bind(link.reading_time)
        .bind(&link.feed_entry_id)
        .bind(&link.source_type)
        .bind(link.source_resource_id)
        .bind(to_timestamp(link.created_at))
        .execute(&self.pool)
        .await?
        .last_insert_rowid();

        self.find(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("link {id}")))
    }

    pub async fn find(&self, id: i64) -> Result<Option<LinkRecord>, StorageError> {
        let row = sqlx::query_as::<_, LinkRecord>(&format!(
            "SELECT {LINK_COLUMNS} FROM links WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn find_by_url(
        &self,
        user_id: i64,
        url: &str,
    ) -> Result<Option<LinkRecord>, StorageError> {
        let row = sqlx::query_as::<_, LinkRecord>(&format!(
            "SELECT {LINK_COLUMNS} FROM links WHERE user_id = ?1 AND url = ?2 ORDER BY id LIMIT 1"
        ))
        .bind(user_id)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// Links never fetched come first, then those whose retry is due. Links
    /// held by a live lock are left out.
    pub async fn list_to_fetch(
        &self,
        max: usize,
        serie: Option<Serie>,
        now: DateTime<Utc>,
    ) -> Result<Vec<LinkRecord>, StorageError> {
        let rows = sqlx::query_as::<_, LinkRecord>(&format!(
            r#"
            SELECT {LINK_COLUMNS}
            FROM links
            WHERE {LINK_IS_DUE}
              AND (locked_at IS NULL OR locked_at <= ?5)
              AND (?2 IS NULL OR id % ?2 = ?3)
            ORDER BY fetched_at IS NOT NULL, fetched_retry_at, id
            LIMIT ?4
            "#
        ))
        .bind(to_timestamp(now))
        .bind(serie.map(|serie| i64::from(serie.total)))
        .bind(serie.map(|serie| i64::from(serie.number)).unwrap_or_default())
        .bind(max as i64)
        .bind(to_timestamp(stale_lock_cutoff(now)))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn count_to_fetch(&self, now: DateTime<Utc>) -> Result<i64, StorageError> {
        let count = sqlx::query_scalar::<_, i64>(&format!(
            "SELECT COUNT(*) FROM links WHERE {LINK_IS_DUE}"
        ))
        .bind(to_timestamp(now))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Persists metadata and fetch fields, and releases the lock.
    pub async fn save_fetch_result(&self, link: &LinkRecord) -> Result<(), StorageError> {
        sqlx::query(
            r#"
            UPDATE links
            SET title = ?1,
                reading_time = ?2,
                fetched_at = ?3,
                fetched_code = ?4,
                fetched_error = ?5,
                fetched_count = ?6,
                fetched_retry_at = ?7,
                locked_at = NULL
            WHERE id = ?8
            "#,
        )
        .bind(&link.title)
        .bind(link.reading_time)
        .bind(link.fetched_at)
        .bind(link.fetched_code)
        .bind(&link.fetched_error)
        .bind(link.fetched_count)
        .bind(link.fetched_retry_at)
        .bind(link.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_url_and_title(
        &self,
        id: i64,
        url: &str,
        title: &str,
    ) -> Result<(), StorageError> {
        sqlx::query("UPDATE links SET url = ?1, title = ?2 WHERE id = ?3")
            .bind(url)
            .bind(title)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Adds the link to the collection; an existing membership keeps its date.
    pub async fn attach(
        &self,
        link_id: i64,
        collection_id: i64,
        created_at: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let affected = sqlx::query(
            r#"
            INSERT INTO links_to_collections (link_id, collection_id, created_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(link_id, collection_id) DO NOTHING
            "#,
        )
        .bind(link_id)
        .bind(collection_id)
        .bind(to_timestamp(created_at))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected > 0)
    }

    pub async fn find_in_collection_by_entry_id(
        &self,
        collection_id: i64,
        entry_id: &str,
    ) -> Result<Option<LinkRecord>, StorageError> {
        let row = sqlx::query_as::<_, LinkRecord>(&format!(
            r#"
            SELECT {LINK_COLUMNS}
            FROM links
            WHERE feed_entry_id = ?2
              AND id IN (SELECT link_id FROM links_to_collections WHERE collection_id = ?1)
            LIMIT 1
            "#
        ))
        .bind(collection_id)
        .bind(entry_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn find_in_collection_by_url(
        &self,
        collection_id: i64,
        url: &str,
    ) -> Result<Option<LinkRecord>, StorageError> {
        let row = sqlx::query_as::<_, LinkRecord>(&format!(
            r#"
            SELECT {LINK_COLUMNS}
            FROM links
            WHERE url = ?2
              AND id IN (SELECT link_id FROM links_to_collections WHERE collection_id = ?1)
            LIMIT 1
            "#
        ))
        .bind(collection_id)
        .bind(url)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn count_in_collection(&self, collection_id: i64) -> Result<usize, StorageError> {
        let count = sqlx::query_scalar::<_, i64>(
            "SELECT COUNT(*) FROM links_to_collections WHERE collection_id = ?1",
        )
        .bind(collection_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    pub async fn list_in_collection(
        &self,
        collection_id: i64,
    ) -> Result<Vec<LinkRecord>, StorageError> {
        let rows = sqlx::query_as::<_, LinkRecord>(&format!(
            r#"
            SELECT {LINK_COLUMNS}
            FROM links
            WHERE id IN (SELECT link_id FROM links_to_collections WHERE collection_id = ?1)
            ORDER BY id
            "#
        ))
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Memberships of a collection, newest publication first.
    pub async fn list_publications(
        &self,
        collection_id: i64,
    ) -> Result<Vec<CollectionLinkRow>, StorageError> {
        let rows = sqlx::query_as::<_, CollectionLinkRow>(
            r#"
            SELECT link_id, created_at AS published_at
            FROM links_to_collections
            WHERE collection_id = ?1
            ORDER BY created_at DESC, link_id DESC
            "#,
        )
        .bind(collection_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete_many(&self, ids: &[i64]) -> Result<u64, StorageError> {
        if ids.is_empty() {
            return Ok(0);
        }

        let mut query = QueryBuilder::<Sqlite>::new("DELETE FROM links WHERE id IN (");
        let mut separated = query.separated(", ");
        for id in ids {
            separated.push_bind(*id);
        }
        separated.push_unseparated(")");

        let affected = query.build().execute(&self.pool).await?.rows_affected();
        Ok(affected)
    }

    /// Deletes links of `user_id` created before `before` that no collection
    /// references anymore.
    pub async fn delete_orphaned(
        &self,
        user_id: i64,
        before: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let affected = sqlx::query(
            r#"
            DELETE FROM links
            WHERE user_id = ?1
              AND created_at < ?2
              AND NOT EXISTS (SELECT 1 FROM links_to_collections lc WHERE lc.link_id = links.id)
            "#,
        )
        .bind(user_id)
        .bind(to_timestamp(before))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    /// Newest links of the collections `user_id` follows, one per URL, leaving
    /// out URLs the user already keeps somewhere.
    pub async fn list_news_candidates(
        &self,
        user_id: i64,
        since: DateTime<Utc>,
        max: usize,
    ) -> Result<Vec<NewsCandidate>, StorageError> {
        let rows = sqlx::query_as::<_, NewsCandidate>(
            r#"
            SELECT
              l.id AS link_id,
              l.url,
              l.title,
              l.reading_time,
              lc.collection_id,
              MAX(lc.created_at) AS published_at
            FROM links l
            JOIN links_to_collections lc ON lc.link_id = l.id
            JOIN followed_collections fc ON fc.collection_id = lc.collection_id
            WHERE fc.user_id = ?1
              AND l.user_id != ?1
              AND lc.created_at >= ?2
              AND NOT EXISTS (
                SELECT 1
                FROM links ul
                JOIN links_to_collections ulc ON ulc.link_id = ul.id
                JOIN collections uc ON uc.id = ulc.collection_id
                WHERE ul.user_id = ?1
                  AND ul.url = l.url
                  AND uc.type IN ('bookmarks', 'read', 'never', 'news')
              )
            GROUP BY l.url
            ORDER BY published_at DESC, link_id DESC
            LIMIT ?3
            "#,
        )
        .bind(user_id)
        .bind(to_timestamp(since))
        .bind(max as i64)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Copies a link into `user_id`'s links, fetch state included, with the
    /// given source attribution.
    pub async fn copy(
        &self,
        link_id: i64,
        user_id: i64,
        source_type: &str,
        source_resource_id: i64,
        now: DateTime<Utc>,
    ) -> Result<LinkRecord, StorageError> {
        let result = sqlx::query(
            r#"
            INSERT INTO links (
              user_id, url, title, reading_time, source_type, source_resource_id,
              fetched_at, fetched_code, fetched_error, fetched_count, fetched_retry_at, created_at
            )
            SELECT ?2, url, title, reading_time, ?3, ?4,
                   fetched_at, fetched_code, fetched_error, fetched_count, fetched_retry_at, ?5
            FROM links
            WHERE id = ?1
            "#,
        )
        .bind(link_id)
        .bind(user_id)
        .bind(source_type)
        .bind(source_resource_id)
        .bind(to_timestamp(now))
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("link {link_id}")));
        }

        let id = result.last_insert_rowid();
        self.find(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("link {id}")))
    }

    pub async fn set_group_by_source(&self, id: i64, grouped: bool) -> Result<(), StorageError> {
        sqlx::query("UPDATE links SET group_by_source = ?1 WHERE id = ?2")
            .bind(i64::from(grouped))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
