use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;
use url::Url;

use super::parser::{parse_feed_bytes, FeedParseError};
use crate::core::config::FeedRetention;
use crate::core::http::cache::content_hash;
use crate::core::storage::links::LinkRepository;
use crate::core::storage::models::{CollectionRecord, NewLink};
use crate::core::storage::StorageError;

pub const NAME_MAX_CHARS: usize = 100;

#[derive(Debug, thiserror::Error)]
pub enum MergeError {
    #[error(transparent)]
    Parse(#[from] FeedParseError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// The body hashed like the last merged one; nothing was looked at.
    pub unchanged: bool,
    pub created: usize,
    pub updated: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Candidate {
    pub position: usize,
    pub entry_id: String,
    pub url: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
}

/// Reconciles a fetched feed document with the links of its collection.
#[derive(Debug, Clone)]
pub struct FeedMerger {
    links: LinkRepository,
    retention: FeedRetention,
}

impl FeedMerger {
    pub fn new(links: LinkRepository, retention: FeedRetention) -> Self {
        Self { links, retention }
    }

    /// Merges `body` into `collection`. Feed metadata and `feed_last_hash` are
    /// updated on the record; the caller persists it.
    pub async fn merge(
        &self,
        collection: &mut CollectionRecord,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<MergeReport, MergeError> {
        let hash = content_hash(body);
        if collection.feed_last_hash.as_deref() == Some(hash.as_str()) {
            debug!(collection_id = collection.id, "feed content unchanged");
            return Ok(MergeReport {
                unchanged: true,
                ..MergeReport::default()
            });
        }

        let parsed = parse_feed_bytes(body)?;
        let base = collection
            .feed_url
            .as_deref()
            .and_then(|feed_url| Url::parse(feed_url).ok());
        if !parsed.title.is_empty() {
            collection.name = truncate_chars(&parsed.title, NAME_MAX_CHARS);
        }
        collection.feed_type = Some(parsed.format.as_str().to_string());
        collection.feed_site_url = parsed
            .site_url
            .as_deref()
            .and_then(|site_url| absolutize(site_url, base.as_ref()));

        let mut report = MergeReport::default();
        let mut seen_ids = HashSet::new();
        let mut seen_urls = HashSet::new();
        let mut candidates = Vec::new();
        for (position, entry) in parsed.entries.iter().enumerate() {
            let Some(url) = entry
                .link
                .as_deref()
                .and_then(|link| absolutize(link, base.as_ref()))
            else {
                report.skipped += 1;
                continue;
            };
            let entry_id = entry.id.clone().unwrap_or_else(|| url.clone());
            if !seen_ids.insert(entry_id.clone()) || !seen_urls.insert(url.clone()) {
                report.skipped += 1;
                continue;
            }
            let title = if entry.title.is_empty() {
                url.clone()
            } else {
                entry.title.clone()
            };

            if let Some(existing) = self
                .links
                .find_in_collection_by_entry_id(collection.id, &entry_id)
                .await?
            {
                if existing.url != url || existing.title != title {
                    self.links
                        .update_url_and_title(existing.id, &url, &title)
                        .await?;
                    report.updated += 1;
                }
                continue;
            }
            if self
                .links
                .find_in_collection_by_url(collection.id, &url)
                .await?
                .is_some()
            {
                continue;
            }

            candidates.push(Candidate {
                position,
                entry_id,
                url,
                title,
                published_at: entry.published_at.map_or(now, |published| published.min(now)),
            });
        }

        let existing = self.links.count_in_collection(collection.id).await?;
        let candidate_count = candidates.len();
        let accepted = retain_candidates(candidates, existing, &self.retention, now);
        report.skipped += candidate_count - accepted.len();

        for candidate in accepted {
            let link = self
                .links
                .create(&NewLink {
                    user_id: collection.user_id,
                    url: candidate.url,
                    title: candidate.title,
                    reading_time: 0,
                    feed_entry_id: Some(candidate.entry_id),
                    source_type: None,
                    source_resource_id: None,
                    created_at: candidate.published_at,
                })
                .await?;
            self.links
                .attach(link.id, collection.id, candidate.published_at)
                .await?;
            report.created += 1;
        }

        collection.feed_last_hash = Some(hash);
        Ok(report)
    }
}

/// Picks the new entries the retention allows, newest first, ranked after
/// the `existing` links; returns them in document order.
pub(crate) fn retain_candidates(
    mut candidates: Vec<Candidate>,
    existing: usize,
    retention: &FeedRetention,
    now: DateTime<Utc>,
) -> Vec<Candidate> {
    candidates.sort_by(|a, b| {
        b.published_at
            .cmp(&a.published_at)
            .then(a.position.cmp(&b.position))
    });
    let mut accepted = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let rank = existing + accepted.len();
        if retention.retains(rank, candidate.published_at, now) {
            accepted.push(candidate);
        }
    }
    accepted.sort_by_key(|candidate| candidate.position);
    accepted
}

/// Resolves `value` against `base`; only http(s) URLs are kept.
pub fn absolutize(value: &str, base: Option<&Url>) -> Option<String> {
    let url = match base {
        Some(base) => base.join(value.trim()).ok()?,
        None => Url::parse(value.trim()).ok()?,
    };
    matches!(url.scheme(), "http" | "https").then(|| url.to_string())
}

pub fn truncate_chars(value: &str, max: usize) -> String {
    value.chars().take(max).collect()
}
