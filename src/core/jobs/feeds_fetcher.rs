use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};

use super::{
    error_message, release_after_error, BatchOptions, FetchOutcome, JobError, JobReport,
    Processed, ResourceFetcher,
};
use crate::core::config::FeedRetention;
use crate::core::feed::merge::{FeedMerger, MergeError};
use crate::core::fetchable::ResourceKind;
use crate::core::storage::collections::CollectionRepository;
use crate::core::storage::locks::{Claim, ResourceLocks};
use crate::core::storage::models::CollectionRecord;
use crate::core::storage::Storage;

/// Fetches due feed collections and merges their entries.
#[derive(Debug, Clone)]
pub struct FeedsFetcherJob {
    collections: CollectionRepository,
    locks: ResourceLocks,
    fetcher: ResourceFetcher,
    merger: FeedMerger,
    options: BatchOptions,
    refresh_interval: Duration,
}

impl FeedsFetcherJob {
    pub fn new(
        storage: &Storage,
        fetcher: ResourceFetcher,
        retention: FeedRetention,
        options: BatchOptions,
        refresh_interval: Duration,
    ) -> Self {
        Self {
            collections: storage.collections(),
            locks: storage.locks(),
            fetcher,
            merger: FeedMerger::new(storage.links(), retention),
            options,
            refresh_interval,
        }
    }

    pub async fn perform(&self, now: DateTime<Utc>) -> Result<JobReport, JobError> {
        let candidates = self
            .collections
            .list_feeds_to_fetch(
                self.options.batch_size,
                self.options.serie,
                now,
                now - self.refresh_interval,
            )
            .await?;
        let mut report = JobReport {
            selected: candidates.len(),
            ..JobReport::default()
        };

        for collection in candidates {
            let collection_id = collection.id;
            match self.process(collection, now).await {
                Ok(processed) => report.count(processed),
                Err(error) => {
                    report.errors += 1;
                    release_after_error(&self.locks, ResourceKind::Feed, collection_id, &error)
                        .await;
                }
            }
        }

        info!(
            selected = report.selected,
            fetched = report.fetched,
            failed = report.failed,
            locked = report.locked,
            rate_limited = report.rate_limited,
            errors = report.errors,
            "feeds fetch finished"
        );
        Ok(report)
    }

    async fn process(
        &self,
        candidate: CollectionRecord,
        now: DateTime<Utc>,
    ) -> Result<Processed, JobError> {
        let claim = Claim::Feed {
            refresh_before: now - self.refresh_interval,
        };
        if !self.locks.try_acquire(claim, candidate.id, now).await? {
            debug!(collection_id = candidate.id, "feed is locked or no longer due, skipping");
            return Ok(Processed::Locked);
        }
        let Some(mut collection) = self.collections.find(candidate.id).await? else {
            return Ok(Processed::Locked);
        };
        let Some(feed_url) = collection.feed_url.clone() else {
            warn!(collection_id = collection.id, "feed collection has no url");
            self.locks.release(ResourceKind::Feed, collection.id).await?;
            return Ok(Processed::Failed);
        };

        let mut state = collection.fetch_state();
        let processed = match self.fetcher.fetch(&feed_url, ResourceKind::Feed, now).await? {
            FetchOutcome::RateLimited => {
                self.locks.release(ResourceKind::Feed, collection.id).await?;
                return Ok(Processed::RateLimited);
            }
            FetchOutcome::TransportFailed(error) => {
                debug!(collection_id = collection.id, url = %feed_url, error = %error, "feed fetch failed");
                state.record_fetch(now, 0, Some(error), None);
                Processed::Failed
            }
            FetchOutcome::Response { response, .. } if response.is_success() => {
                state.record_fetch(now, response.status, None, None);
                match self.merger.merge(&mut collection, &response.body, now).await {
                    Ok(merge) => {
                        collection.feed_parse_error = None;
                        if !merge.unchanged {
                            debug!(
                                collection_id = collection.id,
                                created = merge.created,
                                updated = merge.updated,
                                skipped = merge.skipped,
                                "feed merged"
                            );
                        }
                    }
                    Err(MergeError::Parse(error)) => {
                        warn!(collection_id = collection.id, url = %feed_url, error = %error, "feed could not be parsed");
                        collection.feed_parse_error = Some(error.to_string());
                    }
                    Err(error) => return Err(error.into()),
                }
                Processed::Fetched
            }
            FetchOutcome::Response { response, .. } => {
                debug!(collection_id = collection.id, url = %feed_url, status = response.status, "feed fetch failed");
                state.record_fetch(
                    now,
                    response.status,
                    Some(error_message(&response)),
                    response.retry_after(now),
                );
                Processed::Failed
            }
        };

        collection.set_fetch_state(state);
        self.collections.save_feed_fetch(&collection).await?;
        Ok(processed)
    }
}
