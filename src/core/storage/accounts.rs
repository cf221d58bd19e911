use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use super::models::UserRecord;
use super::{to_timestamp, StorageError};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExpiredSessions {
    pub sessions: u64,
    pub tokens: u64,
}

/// Users, their auth tokens and sessions, as far as retention needs them.
#[derive(Debug, Clone)]
pub struct AccountRepository {
    pool: SqlitePool,
}

impl AccountRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create_user(
        &self,
        username: &str,
        email: &str,
        validated_at: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<UserRecord, StorageError> {
        let id = sqlx::query(
            "INSERT INTO users (username, email, validated_at, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(username)
        .bind(email)
        .bind(validated_at.map(to_timestamp))
        .bind(to_timestamp(now))
        .execute(&self.pool)
        .await?
        .last_insert_rowid();
        self.find(id)
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("user {id}")))
    }

    pub async fn find(&self, id: i64) -> Result<Option<UserRecord>, StorageError> {
        let row = sqlx::query_as::<_, UserRecord>(
            "SELECT id, username, email, validated_at, created_at FROM users WHERE id = ?1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn find_by_email(&self, email: &str) -> Result<Option<UserRecord>, StorageError> {
        let row = sqlx::query_as::<_, UserRecord>(
            "SELECT id, username, email, validated_at, created_at FROM users WHERE email = ?1",
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    /// The pseudo-user owning feeds and the links ingested from them.
    pub async fn ensure_support_user(
        &self,
        email: &str,
        now: DateTime<Utc>,
    ) -> Result<UserRecord, StorageError> {
        match self.find_by_email(email).await? {
            Some(user) => Ok(user),
            None => self.create_user("support", email, Some(now), now).await,
        }
    }

    pub async fn create_session(
        &self,
        user_id: i64,
        token: &str,
        expired_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            "INSERT INTO tokens (token, user_id, expired_at, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(token)
        .bind(user_id)
        .bind(to_timestamp(expired_at))
        .bind(to_timestamp(now))
        .execute(&mut *tx)
        .await?;
        sqlx::query("INSERT INTO sessions (user_id, token, created_at) VALUES (?1, ?2, ?3)")
            .bind(user_id)
            .bind(token)
            .bind(to_timestamp(now))
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub async fn count_sessions(&self) -> Result<i64, StorageError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM sessions")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Removes tokens expired at `now` along with the sessions using them.
    pub async fn delete_expired_sessions(
        &self,
        now: DateTime<Utc>,
    ) -> Result<ExpiredSessions, StorageError> {
        let mut tx = self.pool.begin().await?;
        let sessions = sqlx::query(
            r#"
            DELETE FROM sessions
            WHERE token IN (SELECT token FROM tokens WHERE expired_at <= ?1)
            "#,
        )
        .bind(to_timestamp(now))
        .execute(&mut *tx)
        .await?
        .rows_affected();
        let tokens = sqlx::query("DELETE FROM tokens WHERE expired_at <= ?1")
            .bind(to_timestamp(now))
            .execute(&mut *tx)
            .await?
            .rows_affected();
        tx.commit().await?;
        Ok(ExpiredSessions { sessions, tokens })
    }

    pub async fn delete_unvalidated_users(
        &self,
        created_before: DateTime<Utc>,
    ) -> Result<u64, StorageError> {
        let affected = sqlx::query(
            "DELETE FROM users WHERE validated_at IS NULL AND created_at < ?1",
        )
        .bind(to_timestamp(created_before))
        .execute(&self.pool)
        .await?
        .rows_affected();
        Ok(affected)
    }

    /// Deletes every user but `keep_id`; their data goes with them.
    pub async fn delete_all_except(&self, keep_id: i64) -> Result<u64, StorageError> {
        let affected = sqlx::query("DELETE FROM users WHERE id != ?1")
            .bind(keep_id)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(affected)
    }

    pub async fn count_users(&self) -> Result<i64, StorageError> {
        let count = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}
