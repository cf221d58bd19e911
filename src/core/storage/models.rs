use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::{from_timestamp, to_timestamp};
use crate::core::fetchable::FetchableState;

pub(crate) const LINK_COLUMNS: &str = "id, user_id, url, title, reading_time, feed_entry_id, \
     source_type, source_resource_id, group_by_source, fetched_at, fetched_code, fetched_error, \
     fetched_count, fetched_retry_at, locked_at, created_at";

pub(crate) const COLLECTION_COLUMNS: &str = "id, user_id, name, type, feed_url, feed_type, \
     feed_site_url, feed_last_hash, feed_parse_error, feed_fetched_at, feed_fetched_code, \
     feed_fetched_error, feed_fetched_count, feed_fetched_retry_at, locked_at, created_at";

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CollectionKind {
    Bookmarks,
    News,
    Read,
    Never,
    Collection,
    Feed,
}

impl CollectionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bookmarks => "bookmarks",
            Self::News => "news",
            Self::Read => "read",
            Self::Never => "never",
            Self::Collection => "collection",
            Self::Feed => "feed",
        }
    }

    pub fn default_name(&self) -> &'static str {
        match self {
            Self::Bookmarks => "Bookmarks",
            Self::News => "News",
            Self::Read => "Links read",
            Self::Never => "Never",
            Self::Collection => "Collection",
            Self::Feed => "Feed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct NewLink {
    pub user_id: i64,
    pub url: String,
    pub title: String,
    pub reading_time: i64,
    pub feed_entry_id: Option<String>,
    pub source_type: Option<String>,
    pub source_resource_id: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct LinkRecord {
    pub id: i64,
    pub user_id: i64,
    pub url: String,
    pub title: String,
    pub reading_time: i64,
    pub feed_entry_id: Option<String>,
    pub source_type: Option<String>,
    pub source_resource_id: Option<i64>,
    pub group_by_source: i64,
    pub fetched_at: Option<i64>,
    pub fetched_code: i64,
    pub fetched_error: Option<String>,
    pub fetched_count: i64,
    pub fetched_retry_at: Option<i64>,
    pub locked_at: Option<i64>,
    pub created_at: i64,
}

impl LinkRecord {
    pub fn fetch_state(&self) -> FetchableState {
        state_from_columns(
            self.fetched_at,
            self.fetched_code,
            self.fetched_error.clone(),
            self.fetched_count,
            self.fetched_retry_at,
        )
    }

    pub fn set_fetch_state(&mut self, state: FetchableState) {
        self.fetched_at = state.fetched_at.map(to_timestamp);
        self.fetched_code = i64::from(state.fetched_code);
        self.fetched_error = state.fetched_error;
        self.fetched_count = i64::from(state.fetched_count);
        self.fetched_retry_at = state.fetched_retry_at.map(to_timestamp);
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        from_timestamp(self.created_at)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct CollectionRecord {
    pub id: i64,
    pub user_id: i64,
    pub name: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub feed_url: Option<String>,
    pub feed_type: Option<String>,
    pub feed_site_url: Option<String>,
    pub feed_last_hash: Option<String>,
    pub feed_parse_error: Option<String>,
    pub feed_fetched_at: Option<i64>,
    pub feed_fetched_code: i64,
    pub feed_fetched_error: Option<String>,
    pub feed_fetched_count: i64,
    pub feed_fetched_retry_at: Option<i64>,
    pub locked_at: Option<i64>,
    pub created_at: i64,
}

impl CollectionRecord {
    pub fn fetch_state(&self) -> FetchableState {
        state_from_columns(
            self.feed_fetched_at,
            self.feed_fetched_code,
            self.feed_fetched_error.clone(),
            self.feed_fetched_count,
            self.feed_fetched_retry_at,
        )
    }

    pub fn set_fetch_state(&mut self, state: FetchableState) {
        self.feed_fetched_at = state.fetched_at.map(to_timestamp);
        self.feed_fetched_code = i64::from(state.fetched_code);
        self.feed_fetched_error = state.fetched_error;
        self.feed_fetched_count = i64::from(state.fetched_count);
        self.feed_fetched_retry_at = state.fetched_retry_at.map(to_timestamp);
    }

    pub fn is_feed(&self) -> bool {
        self.kind == CollectionKind::Feed.as_str()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct UserRecord {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub validated_at: Option<i64>,
    pub created_at: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct FetchLogRecord {
    pub id: i64,
    pub url: String,
    pub host: String,
    #[sqlx(rename = "type")]
    pub kind: String,
    pub ip: Option<String>,
    pub created_at: i64,
}

/// A link of a collection along with the date it joined it.
#[derive(Debug, Clone, FromRow)]
pub struct CollectionLinkRow {
    pub link_id: i64,
    pub published_at: i64,
}

fn state_from_columns(
    fetched_at: Option<i64>,
    fetched_code: i64,
    fetched_error: Option<String>,
    fetched_count: i64,
    fetched_retry_at: Option<i64>,
) -> FetchableState {
    FetchableState {
        fetched_at: fetched_at.map(from_timestamp),
        fetched_code: u16::try_from(fetched_code).unwrap_or_default(),
        fetched_error,
        fetched_count: u32::try_from(fetched_count).unwrap_or_default(),
        fetched_retry_at: fetched_retry_at.map(from_timestamp),
    }
}
