use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use super::collections::FEED_IS_DUE;
use super::links::LINK_IS_DUE;
use super::{to_timestamp, StorageError};
use crate::core::fetchable::ResourceKind;

/// Seconds after which a lock is considered abandoned by a crashed worker.
pub const LOCK_STALE_AFTER_SECS: i64 = 60 * 60;

/// Locks taken at or before this instant may be stolen.
pub(crate) fn stale_lock_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::seconds(LOCK_STALE_AFTER_SECS)
}

/// A resource to claim, with the condition it must still meet when the claim
/// runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Claim {
    /// A link still due for a fetch.
    Link,
    /// A feed still due, refreshing followed feeds fetched before the cutoff.
    Feed { refresh_before: DateTime<Utc> },
}

impl Claim {
    pub fn kind(&self) -> ResourceKind {
        match self {
            Self::Link => ResourceKind::Link,
            Self::Feed { .. } => ResourceKind::Feed,
        }
    }

    fn is_due(&self) -> &'static str {
        match self {
            Self::Link => LINK_IS_DUE,
            Self::Feed { .. } => FEED_IS_DUE,
        }
    }

    fn refresh_before(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        match self {
            Self::Link => now,
            Self::Feed { refresh_before } => *refresh_before,
        }
    }
}

/// Advisory per-resource locks kept in the `locked_at` column.
#[derive(Debug, Clone)]
pub struct ResourceLocks {
    pool: SqlitePool,
}

impl ResourceLocks {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Claims the resource when it is unlocked or its lock went stale, and it
    /// is still due at `now`. The check and the write happen in a single
    /// UPDATE, so a resource another worker fetched since it was listed is
    /// not claimed again.
    pub async fn try_acquire(
        &self,
        claim: Claim,
        id: i64,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let affected = sqlx::query(&format!(
            r#"
            UPDATE {table}
            SET locked_at = ?1
            WHERE id = ?3
              AND (locked_at IS NULL OR locked_at <= ?4)
              AND {due}
            "#,
            table = table_for(claim.kind()),
            due = claim.is_due(),
        ))
        .bind(to_timestamp(now))
        .bind(to_timestamp(claim.refresh_before(now)))
        .bind(id)
        .bind(to_timestamp(stale_lock_cutoff(now)))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected == 1)
    }

    pub async fn release(&self, kind: ResourceKind, id: i64) -> Result<(), StorageError> {
        sqlx::query(&format!(
            "UPDATE {table} SET locked_at = NULL WHERE id = ?1",
            table = table_for(kind)
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

fn table_for(kind: ResourceKind) -> &'static str {
    match kind {
        ResourceKind::Link => "links",
        ResourceKind::Feed => "collections",
    }
}
