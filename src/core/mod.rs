pub mod config;
pub mod feed;
pub mod fetchable;
pub mod http;
pub mod jobs;
pub mod journal;
pub mod page;
pub mod rate_limit;
pub mod storage;

#[cfg(test)]
pub(crate) mod testing;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;

use config::EngineConfig;
use http::cache::{CacheError, HttpCache};
use http::{FetchError, HttpClients};
use jobs::cleaner::{CleanerJob, CleanerReport};
use jobs::feeds_fetcher::FeedsFetcherJob;
use jobs::links_fetcher::LinksFetcherJob;
use jobs::{BatchOptions, JobError, JobReport, ResourceFetcher};
use journal::Journal;
use rate_limit::RateLimiter;
use storage::models::UserRecord;
use storage::{Storage, StorageError};

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Http(#[from] FetchError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub feeds: JobReport,
    pub links: JobReport,
    pub cleaner: Option<CleanerReport>,
}

/// Everything a worker needs, wired from one configuration.
#[derive(Debug, Clone)]
pub struct Engine {
    config: EngineConfig,
    storage: Storage,
    cache: HttpCache,
    fetcher: ResourceFetcher,
    support: UserRecord,
}

impl Engine {
    pub async fn connect(config: EngineConfig) -> Result<Self, EngineError> {
        let storage = Storage::connect(&config.database_url).await?;
        let cache = HttpCache::new(&config.cache_path)?;
        let clients = HttpClients::new(
            &config.user_agent,
            config.fetch_timeout,
            &config.server_ips,
        )?;
        let fetcher = ResourceFetcher::new(
            clients,
            cache.clone(),
            RateLimiter::new(storage.fetch_logs()),
        );
        let support = storage
            .accounts()
            .ensure_support_user(&config.support_email, Utc::now())
            .await?;

        Ok(Self {
            config,
            storage,
            cache,
            fetcher,
            support,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    /// The pseudo-user owning feed collections and their links.
    pub fn support_user(&self) -> &UserRecord {
        &self.support
    }

    fn batch_options(&self) -> BatchOptions {
        BatchOptions {
            batch_size: self.config.batch_size,
            serie: self.config.serie,
        }
    }

    pub fn links_fetcher(&self) -> LinksFetcherJob {
        LinksFetcherJob::new(&self.storage, self.fetcher.clone(), self.batch_options())
    }

    pub fn feeds_fetcher(&self) -> FeedsFetcherJob {
        FeedsFetcherJob::new(
            &self.storage,
            self.fetcher.clone(),
            self.config.retention.feeds,
            self.batch_options(),
            self.config.feed_refresh_interval,
        )
    }

    pub fn cleaner(&self) -> CleanerJob {
        CleanerJob::new(
            self.storage.clone(),
            self.cache.clone(),
            self.config.retention.clone(),
            self.config.support_email.clone(),
            self.config.demo,
        )
    }

    pub fn journal(&self) -> Journal {
        Journal::new(&self.storage)
    }

    /// Runs the feeds then the links job, and the cleaner when `clean` is set.
    pub async fn tick(&self, now: DateTime<Utc>, clean: bool) -> Result<TickReport, JobError> {
        let feeds = self.feeds_fetcher().perform(now).await?;
        let links = self.links_fetcher().perform(now).await?;
        let cleaner = if clean {
            Some(self.cleaner().perform(now).await?)
        } else {
            None
        };
        Ok(TickReport {
            feeds,
            links,
            cleaner,
        })
    }

    pub async fn health_report(
        &self,
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<String, String>, StorageError> {
        let refresh_before = now - self.config.feed_refresh_interval;
        let links_to_fetch = self.storage.links().count_to_fetch(now).await?;
        let feeds_to_fetch = self
            .storage
            .collections()
            .count_feeds_to_fetch(now, refresh_before)
            .await?;

        let mut report = BTreeMap::new();
        report.insert("links_to_fetch".to_string(), links_to_fetch.to_string());
        report.insert("feeds_to_fetch".to_string(), feeds_to_fetch.to_string());
        report.insert(
            "serie".to_string(),
            self.config
                .serie
                .map(|serie| format!("{}/{}", serie.number, serie.total))
                .unwrap_or_else(|| "all".to_string()),
        );
        Ok(report)
    }
}
