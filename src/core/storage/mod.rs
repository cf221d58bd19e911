pub mod accounts;
pub mod collections;
pub mod fetch_log;
pub mod links;
pub mod locks;
pub mod models;
pub mod repository;

use chrono::{DateTime, Utc};

pub use repository::{Storage, StorageError};

pub(crate) fn to_timestamp(value: DateTime<Utc>) -> i64 {
    value.timestamp()
}

pub(crate) fn from_timestamp(seconds: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(seconds, 0).unwrap_or_default()
}
