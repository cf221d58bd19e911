use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::{
    error_message, release_after_error, BatchOptions, FetchOutcome, JobError, JobReport,
    Processed, ResourceFetcher,
};
use crate::core::fetchable::ResourceKind;
use crate::core::page::{is_html, parse_page};
use crate::core::storage::links::LinkRepository;
use crate::core::storage::locks::{Claim, ResourceLocks};
use crate::core::storage::models::LinkRecord;
use crate::core::storage::Storage;

/// Fetches due links and stores their title and reading time.
#[derive(Debug, Clone)]
pub struct LinksFetcherJob {
    links: LinkRepository,
    locks: ResourceLocks,
    fetcher: ResourceFetcher,
    options: BatchOptions,
}

impl LinksFetcherJob {
    pub fn new(storage: &Storage, fetcher: ResourceFetcher, options: BatchOptions) -> Self {
        Self {
            links: storage.links(),
            locks: storage.locks(),
            fetcher,
            options,
        }
    }

    pub async fn perform(&self, now: DateTime<Utc>) -> Result<JobReport, JobError> {
        let candidates = self
            .links
            .list_to_fetch(self.options.batch_size, self.options.serie, now)
            .await?;
        let mut report = JobReport {
            selected: candidates.len(),
            ..JobReport::default()
        };

        for link in candidates {
            let link_id = link.id;
            match self.process(link, now).await {
                Ok(processed) => report.count(processed),
                Err(error) => {
                    report.errors += 1;
                    release_after_error(&self.locks, ResourceKind::Link, link_id, &error).await;
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
            "links fetch finished"
        );
        Ok(report)
    }

    async fn process(&self, candidate: LinkRecord, now: DateTime<Utc>) -> Result<Processed, JobError> {
        if !self.locks.try_acquire(Claim::Link, candidate.id, now).await? {
            debug!(link_id = candidate.id, "link is locked or no longer due, skipping");
            return Ok(Processed::Locked);
        }
        let Some(mut link) = self.links.find(candidate.id).await? else {
            return Ok(Processed::Locked);
        };

        let mut state = link.fetch_state();
        let processed = match self.fetcher.fetch(&link.url, ResourceKind::Link, now).await? {
            FetchOutcome::RateLimited => {
                self.locks.release(ResourceKind::Link, link.id).await?;
                return Ok(Processed::RateLimited);
            }
            FetchOutcome::TransportFailed(error) => {
                debug!(link_id = link.id, url = %link.url, error = %error, "link fetch failed");
                state.record_fetch(now, 0, Some(error), None);
                Processed::Failed
            }
            FetchOutcome::Response { response, .. } if response.is_success() => {
                state.record_fetch(now, response.status, None, None);
                if is_html(response.content_type()) {
                    let metadata = parse_page(&response.body_text());
                    if let Some(title) = metadata.title {
                        link.title = title;
                    }
                    link.reading_time = metadata.reading_time;
                }
                Processed::Fetched
            }
            FetchOutcome::Response { response, .. } => {
                debug!(link_id = link.id, url = %link.url, status = response.status, "link fetch failed");
                state.record_fetch(
                    now,
                    response.status,
                    Some(error_message(&response)),
                    response.retry_after(now),
                );
                Processed::Failed
            }
        };

        link.set_fetch_state(state);
        self.links.save_fetch_result(&link).await?;
        Ok(processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::fetchable::{Serie, MAX_FETCH_ATTEMPTS};
    use crate::core::http::cache::HttpCache;
    use crate::core::http::HttpClients;
    use crate::core::rate_limit::RateLimiter;
    use crate::core::testing;
    use axum::http::{header, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::Router;
    use chrono::Duration;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    async fn article() -> impl IntoResponse {
        (
            [(header::CONTENT_TYPE, "text/html; charset=utf-8")],
            include_str!("../../../fixtures/pages/article.html"),
        )
    }

    async fn gone() -> impl IntoResponse {
        (StatusCode::NOT_FOUND, "no such page")
    }

    async fn busy() -> impl IntoResponse {
        (StatusCode::SERVICE_UNAVAILABLE, [(header::RETRY_AFTER, "3600")], "")
    }

    fn router() -> Router {
        Router::new()
            .route("/article", get(article))
            .route("/gone", get(gone))
            .route("/busy", get(busy))
    }

    fn job(storage: &Storage, cache_dir: &std::path::Path, options: BatchOptions) -> LinksFetcherJob {
        let fetcher = ResourceFetcher::new(
            HttpClients::new("linkfetch-test", std::time::Duration::from_secs(5), &[])
                .expect("clients should build"),
            HttpCache::new(cache_dir).expect("cache should open"),
            RateLimiter::new(storage.fetch_logs()),
        );
        LinksFetcherJob::new(storage, fetcher, options)
    }

    #[tokio::test]
    async fn fetched_link_gets_page_metadata() {
        let base = testing::serve(router()).await;
        let storage = testing::storage().await;
        let user = testing::user(&storage, "alix@example.com").await;
        let link = testing::link(&storage, user, &format!("{base}/article")).await;
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let now = Utc::now();

        let report = job(&storage, dir.path(), BatchOptions::default())
            .perform(now)
            .await
            .expect("job should succeed");
        let link = storage
            .links()
            .find(link.id)
            .await
            .expect("find")
            .expect("link should exist");

        assert_eq!(report.selected, 1);
        assert_eq!(report.fetched, 1);
        assert_eq!(link.title, "Why we fetch slowly");
        assert_eq!(link.reading_time, 1);
        assert_eq!(link.fetched_code, 200);
        assert_eq!(link.fetched_count, 1);
        assert_eq!(link.fetched_retry_at, None);
        assert_eq!(link.locked_at, None);
        assert!(link.fetch_state().is_fetched());
    }

    #[tokio::test]
    async fn not_found_is_terminal_after_first_attempt() {
        let base = testing::serve(router()).await;
        let storage = testing::storage().await;
        let user = testing::user(&storage, "alix@example.com").await;
        let link = testing::link(&storage, user, &format!("{base}/gone")).await;
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let job = job(&storage, dir.path(), BatchOptions::default());
        let now = Utc::now();

        let report = job.perform(now).await.expect("job should succeed");
        let link = storage.links().find(link.id).await.expect("find").expect("link");

        assert_eq!(report.failed, 1);
        assert_eq!(link.fetched_code, 404);
        assert_eq!(link.fetched_error.as_deref(), Some("no such page"));
        assert_eq!(link.fetched_retry_at, None);
        assert_eq!(link.locked_at, None);

        let later = job
            .perform(now + Duration::days(30))
            .await
            .expect("job should succeed");
        assert_eq!(later.selected, 0);
    }

    #[tokio::test]
    async fn retryable_status_honours_retry_after_hint() {
        let base = testing::serve(router()).await;
        let storage = testing::storage().await;
        let user = testing::user(&storage, "alix@example.com").await;
        let link = testing::link(&storage, user, &format!("{base}/busy")).await;
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let now = Utc::now();

        job(&storage, dir.path(), BatchOptions::default())
            .perform(now)
            .await
            .expect("job should succeed");
        let link = storage.links().find(link.id).await.expect("find").expect("link");
        let state = link.fetch_state();

        assert_eq!(link.fetched_code, 503);
        assert_eq!(link.fetched_error.as_deref(), Some("HTTP 503"));
        let retry_at = state.fetched_retry_at.expect("retry should be scheduled");
        assert!(retry_at >= now + Duration::seconds(3599));
        assert!(!state.is_due(now + Duration::minutes(2)));
    }

    #[tokio::test]
    async fn transport_failures_retry_until_the_budget_is_spent() {
        let storage = testing::storage().await;
        let user = testing::user(&storage, "alix@example.com").await;
        let link = testing::link(&storage, user, &testing::closed_url().await).await;
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let job = job(&storage, dir.path(), BatchOptions::default());
        let mut now = Utc::now();

        for attempt in 1..=MAX_FETCH_ATTEMPTS {
            let report = job.perform(now).await.expect("job should succeed");
            assert_eq!(report.failed, 1, "attempt {attempt} should run");
            let record = storage.links().find(link.id).await.expect("find").expect("link");
            assert_eq!(record.fetched_code, 0);
            assert_eq!(record.fetched_count, i64::from(attempt));
            match record.fetch_state().fetched_retry_at {
                Some(retry_at) => now = retry_at,
                None => assert_eq!(attempt, MAX_FETCH_ATTEMPTS),
            }
        }

        let report = job
            .perform(now + Duration::days(30))
            .await
            .expect("job should succeed");
        assert_eq!(report.selected, 0);
    }

    #[tokio::test]
    async fn locked_link_is_skipped_and_left_due() {
        let base = testing::serve(router()).await;
        let storage = testing::storage().await;
        let user = testing::user(&storage, "alix@example.com").await;
        let link = testing::link(&storage, user, &format!("{base}/article")).await;
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let now = Utc::now();
        assert!(storage
            .locks()
            .try_acquire(Claim::Link, link.id, now)
            .await
            .expect("lock"));
        let job = job(&storage, dir.path(), BatchOptions::default());

        let report = job.perform(now).await.expect("job should succeed");
        let record = storage.links().find(link.id).await.expect("find").expect("link");

        assert_eq!(report.selected, 0);
        assert_eq!(record.fetched_at, None);

        let outcome = job.process(record, now).await.expect("process should succeed");
        assert_eq!(outcome, Processed::Locked);

        let report = job
            .perform(now + Duration::minutes(61))
            .await
            .expect("job should succeed");
        assert_eq!(report.selected, 1);
        assert_eq!(report.fetched, 1);
    }

    #[tokio::test]
    async fn candidate_fetched_by_another_worker_is_not_fetched_again() {
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = hits.clone();
        let base = testing::serve(Router::new().route(
            "/flaky",
            get(move || {
                let counter = counter.clone();
                async move {
                    counter.fetch_add(1, Ordering::SeqCst);
                    StatusCode::SERVICE_UNAVAILABLE
                }
            }),
        ))
        .await;
        let storage = testing::storage().await;
        let user = testing::user(&storage, "alix@example.com").await;
        testing::link(&storage, user, &format!("{base}/flaky")).await;
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let job = job(&storage, dir.path(), BatchOptions::default());
        let now = Utc::now();

        let listed = storage
            .links()
            .list_to_fetch(25, None, now)
            .await
            .expect("list should succeed");
        job.perform(now).await.expect("other worker run");
        let stale = listed.into_iter().next().expect("link should be listed");
        let outcome = job.process(stale.clone(), now).await.expect("process should succeed");
        let record = storage.links().find(stale.id).await.expect("find").expect("link");

        assert_eq!(outcome, Processed::Locked);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(record.fetched_count, 1);
        assert_eq!(record.fetched_code, 503);
        assert_eq!(record.locked_at, None);
    }

    #[tokio::test]
    async fn rate_limited_link_is_released_without_penalty() {
        let storage = testing::storage().await;
        let user = testing::user(&storage, "alix@example.com").await;
        let url = "https://www.youtube.com/watch?v=abc";
        let link = testing::link(&storage, user, url).await;
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let now = Utc::now();
        RateLimiter::new(storage.fetch_logs())
            .log(url, ResourceKind::Link, None, now)
            .await
            .expect("log");

        let report = job(&storage, dir.path(), BatchOptions::default())
            .perform(now)
            .await
            .expect("job should succeed");
        let record = storage.links().find(link.id).await.expect("find").expect("link");

        assert_eq!(report.rate_limited, 1);
        assert_eq!(record.fetched_at, None);
        assert_eq!(record.fetched_count, 0);
        assert_eq!(record.locked_at, None);
    }

    #[tokio::test]
    async fn serie_only_selects_its_shard() {
        let storage = testing::storage().await;
        let user = testing::user(&storage, "alix@example.com").await;
        let closed = testing::closed_url().await;
        let mut ids = Vec::new();
        for index in 0..4 {
            ids.push(testing::link(&storage, user, &format!("{closed}{index}")).await.id);
        }
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let options = BatchOptions {
            batch_size: 25,
            serie: Serie::new(1, 2),
        };

        let report = job(&storage, dir.path(), options)
            .perform(Utc::now())
            .await
            .expect("job should succeed");

        let owned = ids.iter().filter(|id| *id % 2 == 1).count();
        assert_eq!(report.selected, owned);
    }
}
