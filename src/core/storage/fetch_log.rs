use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::models::FetchLogRecord;
use super::{to_timestamp, StorageError};
use crate::core::fetchable::ResourceKind;

/// Append-only log of outbound requests.
#[derive(Debug, Clone)]
pub struct FetchLogRepository {
    pool: SqlitePool,
}

impl FetchLogRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        url: &str,
        host: &str,
        kind: ResourceKind,
        ip: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO fetch_logs (url, host, type, ip, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(url)
        .bind(host)
        .bind(kind.as_str())
        .bind(ip)
        .bind(to_timestamp(now))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Counts requests to `host` made at or after `since`, optionally
    /// narrowed to one resource kind and one outbound IP.
    pub async fn count_since(
        &self,
        host: &str,
        kind: Option<ResourceKind>,
        ip: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<i64, StorageError> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM fetch_logs
            WHERE host = ?1
              AND created_at >= ?2
              AND (?3 IS NULL OR type = ?3)
              AND (?4 IS NULL OR ip = ?4)
            "#,
        )
        .bind(host)
        .bind(to_timestamp(since))
        .bind(kind.map(|kind| kind.as_str()))
        .bind(ip)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn list_recent(&self, limit: i64) -> Result<Vec<FetchLogRecord>, StorageError> {
        let rows = sqlx::query_as::<_, FetchLogRecord>(
            r#"
            SELECT id, url, host, type, ip, created_at
            FROM fetch_logs
            ORDER BY created_at DESC, id DESC
            LIMIT ?1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete_older_than(&self, before: DateTime<Utc>) -> Result<u64, StorageError> {
        let affected = sqlx::query("DELETE FROM fetch_logs WHERE created_at < ?1")
            .bind(to_timestamp(before))
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }
}
