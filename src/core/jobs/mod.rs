pub mod cleaner;
pub mod feeds_fetcher;
pub mod links_fetcher;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{debug, warn};

use super::fetchable::{ResourceKind, Serie};
use super::feed::merge::MergeError;
use super::http::cache::{content_hash, CacheError, HttpCache};
use super::http::{fetch_url, FetchError, HttpClients, HttpResponse};
use super::rate_limit::RateLimiter;
use super::storage::locks::ResourceLocks;
use super::storage::StorageError;

/// Fetched error bodies are kept up to this many characters.
const ERROR_MAX_CHARS: usize = 1000;

#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Cache(#[from] CacheError),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Merge(#[from] MergeError),
}

/// Which slice of the due resources a fetch job handles per run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub batch_size: usize,
    pub serie: Option<Serie>,
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self {
            batch_size: 25,
            serie: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub selected: usize,
    pub fetched: usize,
    pub failed: usize,
    pub locked: usize,
    pub rate_limited: usize,
    pub errors: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Processed {
    Fetched,
    Failed,
    Locked,
    RateLimited,
}

impl JobReport {
    pub(crate) fn count(&mut self, processed: Processed) {
        match processed {
            Processed::Fetched => self.fetched += 1,
            Processed::Failed => self.failed += 1,
            Processed::Locked => self.locked += 1,
            Processed::RateLimited => self.rate_limited += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Response { response: HttpResponse, cached: bool },
    /// The request never got a response (timeout, DNS, TLS...).
    TransportFailed(String),
    RateLimited,
}

/// Rate-checked, cached HTTP access shared by the fetch jobs.
#[derive(Debug, Clone)]
pub struct ResourceFetcher {
    clients: HttpClients,
    cache: HttpCache,
    limiter: RateLimiter,
}

impl ResourceFetcher {
    pub fn new(clients: HttpClients, cache: HttpCache, limiter: RateLimiter) -> Self {
        Self {
            clients,
            cache,
            limiter,
        }
    }

    pub fn cache(&self) -> &HttpCache {
        &self.cache
    }

    pub async fn fetch(
        &self,
        url: &str,
        kind: ResourceKind,
        now: DateTime<Utc>,
    ) -> Result<FetchOutcome, JobError> {
        let mut available_ip = None;
        for ip in self.clients.ips() {
            if !self.limiter.has_reached_rate_limit(url, kind, ip, now).await? {
                available_ip = Some(ip);
                break;
            }
        }
        let Some(ip) = available_ip else {
            debug!(url, kind = kind.as_str(), "rate limit reached");
            return Ok(FetchOutcome::RateLimited);
        };

        let key = content_hash(url.as_bytes());
        match self.cache.get(&key, cache_max_age(kind), now) {
            Ok(Some(response)) => {
                debug!(url, "using cached response");
                return Ok(FetchOutcome::Response {
                    response,
                    cached: true,
                });
            }
            Ok(None) => {}
            Err(CacheError::Corrupted(key)) => {
                warn!(url, key = %key, "ignoring corrupted cache entry");
            }
            Err(error) => return Err(error.into()),
        }

        let result = fetch_url(self.clients.client_for(ip), url).await;
        self.limiter.log(url, kind, ip, now).await?;
        match result {
            Ok(response) => {
                if response.is_success() {
                    if let Err(error) = self.cache.save(&key, &response) {
                        warn!(url, error = %error, "failed to cache response");
                    }
                }
                Ok(FetchOutcome::Response {
                    response,
                    cached: false,
                })
            }
            Err(error) => Ok(FetchOutcome::TransportFailed(error.to_string())),
        }
    }
}

/// How long a cached response stands in for a new request.
pub fn cache_max_age(kind: ResourceKind) -> Duration {
    match kind {
        ResourceKind::Link => Duration::days(1),
        ResourceKind::Feed => Duration::minutes(30),
    }
}

pub(crate) fn error_message(response: &HttpResponse) -> String {
    let body = response.body_text();
    let body = body.trim();
    if body.is_empty() {
        format!("HTTP {}", response.status)
    } else {
        body.chars().take(ERROR_MAX_CHARS).collect()
    }
}

pub(crate) async fn release_after_error(
    locks: &ResourceLocks,
    kind: ResourceKind,
    id: i64,
    error: &JobError,
) {
    warn!(kind = kind.as_str(), id, error = %error, "resource processing failed");
    if let Err(release_error) = locks.release(kind, id).await {
        warn!(kind = kind.as_str(), id, error = %release_error, "failed to release lock");
    }
}
