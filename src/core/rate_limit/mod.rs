use chrono::{DateTime, Duration, Utc};
use url::Url;

use super::fetchable::ResourceKind;
use super::storage::fetch_log::FetchLogRepository;
use super::storage::StorageError;

pub const DEFAULT_REQUESTS_PER_MINUTE: i64 = 25;

/// Hosts throttling harder than the default: (host, link budget, feed budget).
const HOST_BUDGETS: &[(&str, i64, i64)] = &[("youtube.com", 1, 10)];

/// Lowercased host without a leading `www.`; empty for unparsable URLs.
pub fn extract_host(url: &str) -> String {
    let host = Url::parse(url)
        .ok()
        .and_then(|url| url.host_str().map(str::to_lowercase))
        .unwrap_or_default();
    match host.strip_prefix("www.") {
        Some(stripped) => stripped.to_string(),
        None => host,
    }
}

/// Per-host request budget over a sliding one-minute window, backed by the
/// fetch log.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    log: FetchLogRepository,
}

impl RateLimiter {
    pub fn new(log: FetchLogRepository) -> Self {
        Self { log }
    }

    pub async fn log(
        &self,
        url: &str,
        kind: ResourceKind,
        ip: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<(), StorageError> {
        self.log
            .create(url, &extract_host(url), kind, ip, now)
            .await
    }

    pub async fn has_reached_rate_limit(
        &self,
        url: &str,
        kind: ResourceKind,
        ip: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let host = extract_host(url);
        let since = now - Duration::minutes(1);
        let (budget, counted_kind) = match host_budget(&host, kind) {
            Some(budget) => (budget, Some(kind)),
            None => (DEFAULT_REQUESTS_PER_MINUTE, None),
        };
        let count = self.log.count_since(&host, counted_kind, ip, since).await?;
        Ok(count >= budget)
    }
}

fn host_budget(host: &str, kind: ResourceKind) -> Option<i64> {
    HOST_BUDGETS
        .iter()
        .find(|(candidate, _, _)| *candidate == host)
        .map(|(_, link_budget, feed_budget)| match kind {
            ResourceKind::Link => *link_budget,
            ResourceKind::Feed => *feed_budget,
        })
}
