use chrono::{DateTime, Months, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::JobError;
use crate::core::config::{FeedRetention, RetentionPolicy};
use crate::core::http::cache::HttpCache;
use crate::core::storage::models::CollectionKind;
use crate::core::storage::{from_timestamp, Storage};

pub const DEMO_USERNAME: &str = "demo";
pub const DEMO_EMAIL: &str = "demo@localhost";

const DEMO_COLLECTIONS: [CollectionKind; 4] = [
    CollectionKind::Bookmarks,
    CollectionKind::News,
    CollectionKind::Read,
    CollectionKind::Never,
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CleanerReport {
    pub cache_files: usize,
    pub fetch_logs: u64,
    pub sessions: u64,
    pub tokens: u64,
    pub unvalidated_users: u64,
    pub unfollowed_feeds: u64,
    pub orphan_links: u64,
    pub feed_links: u64,
    pub demo_reset: bool,
}

/// Periodic deletion of everything that outlived its retention.
#[derive(Debug, Clone)]
pub struct CleanerJob {
    storage: Storage,
    cache: HttpCache,
    retention: RetentionPolicy,
    support_email: String,
    demo: bool,
}

impl CleanerJob {
    pub fn new(
        storage: Storage,
        cache: HttpCache,
        retention: RetentionPolicy,
        support_email: impl Into<String>,
        demo: bool,
    ) -> Self {
        Self {
            storage,
            cache,
            retention,
            support_email: support_email.into(),
            demo,
        }
    }

    pub async fn perform(&self, now: DateTime<Utc>) -> Result<CleanerReport, JobError> {
        let mut report = CleanerReport::default();
        let accounts = self.storage.accounts();
        let collections = self.storage.collections();
        let links = self.storage.links();
        let support = accounts.ensure_support_user(&self.support_email, now).await?;

        match self.cache.clean(now - self.retention.cache_max_age) {
            Ok(deleted) => report.cache_files = deleted,
            Err(error) => warn!(error = %error, "cache cleaning failed"),
        }

        report.fetch_logs = self
            .storage
            .fetch_logs()
            .delete_older_than(now - self.retention.fetch_logs_max_age)
            .await?;

        let expired = accounts.delete_expired_sessions(now).await?;
        report.sessions = expired.sessions;
        report.tokens = expired.tokens;

        if let Some(created_before) =
            now.checked_sub_months(Months::new(self.retention.unvalidated_users_max_age_months))
        {
            report.unvalidated_users = accounts.delete_unvalidated_users(created_before).await?;
        }

        let orphans_before = now - self.retention.orphans_max_age;
        report.unfollowed_feeds = collections
            .delete_unfollowed_feeds(support.id, orphans_before)
            .await?;

        for feed in collections.list_followed_feeds(support.id).await? {
            let publications = links.list_publications(feed.id).await?;
            let expired_links = expired_publications(
                publications
                    .iter()
                    .map(|row| (row.link_id, from_timestamp(row.published_at))),
                &self.retention.feeds,
                now,
            );
            report.feed_links += links.delete_many(&expired_links).await?;
        }

        report.orphan_links = links.delete_orphaned(support.id, orphans_before).await?;

        if self.demo {
            self.reset_demo(support.id, now).await?;
            report.demo_reset = true;
        }

        info!(
            cache_files = report.cache_files,
            fetch_logs = report.fetch_logs,
            sessions = report.sessions,
            unvalidated_users = report.unvalidated_users,
            unfollowed_feeds = report.unfollowed_feeds,
            orphan_links = report.orphan_links,
            feed_links = report.feed_links,
            demo_reset = report.demo_reset,
            "cleaner finished"
        );
        Ok(report)
    }

    async fn reset_demo(&self, support_id: i64, now: DateTime<Utc>) -> Result<(), JobError> {
        let accounts = self.storage.accounts();
        let collections = self.storage.collections();

        accounts.delete_all_except(support_id).await?;
        let demo = accounts
            .create_user(DEMO_USERNAME, DEMO_EMAIL, Some(now), now)
            .await?;
        for kind in DEMO_COLLECTIONS {
            collections.create(demo.id, kind, kind.default_name(), now).await?;
        }
        Ok(())
    }
}

/// Ids of the links a feed no longer keeps. `publications` must be ordered
/// newest first.
pub fn expired_publications<I>(publications: I, retention: &FeedRetention, now: DateTime<Utc>) -> Vec<i64>
where
    I: IntoIterator<Item = (i64, DateTime<Utc>)>,
{
    publications
        .into_iter()
        .enumerate()
        .filter(|(rank, (_, published_at))| !retention.retains(*rank, *published_at, now))
        .map(|(_, (link_id, _))| link_id)
        .collect()
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::time::SystemTime;

    use super::*;
    use crate::core::http::HttpResponse;
    use crate::core::storage::models::NewLink;
    use crate::core::testing;
    use chrono::Duration;
    use proptest::prelude::*;

    const SUPPORT: &str = "support@example.com";

    fn cleaner(storage: &Storage, cache: HttpCache, retention: RetentionPolicy, demo: bool) -> CleanerJob {
        CleanerJob::new(storage.clone(), cache, retention, SUPPORT, demo)
    }

    async fn feed_link(
        storage: &Storage,
        feed: &crate::core::storage::models::CollectionRecord,
        url: &str,
        published_at: DateTime<Utc>,
    ) -> i64 {
        let link = storage
            .links()
            .create(&NewLink {
                user_id: feed.user_id,
                url: url.to_string(),
                title: url.to_string(),
                reading_time: 0,
                feed_entry_id: Some(url.to_string()),
                source_type: None,
                source_resource_id: None,
                created_at: published_at,
            })
            .await
            .expect("link create should succeed");
        storage
            .links()
            .attach(link.id, feed.id, published_at)
            .await
            .expect("attach should succeed");
        link.id
    }

    #[tokio::test]
    async fn cache_files_around_the_seven_day_cutoff() {
        let storage = testing::storage().await;
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let cache = HttpCache::new(dir.path()).expect("cache should open");
        let now = Utc::now();
        let response = HttpResponse {
            status: 200,
            headers: Vec::new(),
            body: b"body".to_vec(),
        };
        cache.save("expired", &response).expect("save");
        cache.save("kept", &response).expect("save");
        for (name, mtime) in [
            ("expired", now - Duration::days(7) - Duration::seconds(1)),
            ("kept", now - Duration::days(7) + Duration::seconds(1)),
        ] {
            fs::File::options()
                .write(true)
                .open(dir.path().join(name))
                .expect("open")
                .set_modified(SystemTime::from(mtime))
                .expect("set mtime");
        }

        let report = cleaner(&storage, cache, RetentionPolicy::default(), false)
            .perform(now)
            .await
            .expect("cleaner should succeed");

        assert_eq!(report.cache_files, 1);
        assert!(!dir.path().join("expired").exists());
        assert!(dir.path().join("kept").exists());
    }

    #[tokio::test]
    async fn expired_accounts_and_logs_are_removed() {
        let storage = testing::storage().await;
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let now = Utc::now();
        let accounts = storage.accounts();
        let alix = testing::user(&storage, "alix@example.com").await;
        accounts
            .create_session(alix, "expired-token", now - Duration::days(1), now - Duration::days(30))
            .await
            .expect("session");
        accounts
            .create_session(alix, "live-token", now + Duration::days(1), now)
            .await
            .expect("session");
        accounts
            .create_user("ghost", "ghost@example.com", None, now - Months::new(7))
            .await
            .expect("user");
        accounts
            .create_user("newcomer", "newcomer@example.com", None, now - Duration::days(2))
            .await
            .expect("user");
        let logs = storage.fetch_logs();
        logs.create("https://a.example.com", "a.example.com", crate::core::fetchable::ResourceKind::Link, None, now - Duration::days(4))
            .await
            .expect("log");
        logs.create("https://a.example.com", "a.example.com", crate::core::fetchable::ResourceKind::Link, None, now)
            .await
            .expect("log");

        let report = cleaner(
            &storage,
            HttpCache::new(dir.path()).expect("cache"),
            RetentionPolicy::default(),
            false,
        )
        .perform(now)
        .await
        .expect("cleaner should succeed");

        assert_eq!(report.fetch_logs, 1);
        assert_eq!(report.sessions, 1);
        assert_eq!(report.tokens, 1);
        assert_eq!(report.unvalidated_users, 1);
        assert_eq!(accounts.count_sessions().await.expect("count"), 1);
        assert!(accounts.find_by_email("ghost@example.com").await.expect("find").is_none());
        assert!(accounts.find_by_email("newcomer@example.com").await.expect("find").is_some());
    }

    #[tokio::test]
    async fn unfollowed_feeds_and_orphan_links_are_removed() {
        let storage = testing::storage().await;
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let now = Utc::now();
        let support = testing::user(&storage, SUPPORT).await;
        let reader = testing::user(&storage, "reader@example.com").await;
        let collections = storage.collections();
        let old = now - Duration::days(8);
        let abandoned = collections
            .create_feed(support, "https://abandoned.example.com/feed", old)
            .await
            .expect("feed");
        let followed = collections
            .create_feed(support, "https://followed.example.com/feed", old)
            .await
            .expect("feed");
        collections.follow(reader, followed.id, old).await.expect("follow");
        let fresh = collections
            .create_feed(support, "https://fresh.example.com/feed", now)
            .await
            .expect("feed");
        let orphan = testing::link_at(&storage, support, "https://orphan.example.com", old).await;
        let young_orphan = testing::link_at(&storage, support, "https://young.example.com", now).await;
        let kept = feed_link(&storage, &followed, "https://followed.example.com/1", old).await;

        let report = cleaner(
            &storage,
            HttpCache::new(dir.path()).expect("cache"),
            RetentionPolicy::default(),
            false,
        )
        .perform(now)
        .await
        .expect("cleaner should succeed");

        assert_eq!(report.unfollowed_feeds, 1);
        assert_eq!(report.orphan_links, 1);
        assert!(collections.find(abandoned.id).await.expect("find").is_none());
        assert!(collections.find(followed.id).await.expect("find").is_some());
        assert!(collections.find(fresh.id).await.expect("find").is_some());
        let links = storage.links();
        assert!(links.find(orphan.id).await.expect("find").is_none());
        assert!(links.find(young_orphan.id).await.expect("find").is_some());
        assert!(links.find(kept).await.expect("find").is_some());
    }

    #[tokio::test]
    async fn followed_feeds_are_trimmed_to_their_retention() {
        let storage = testing::storage().await;
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let now = Utc::now();
        let support = testing::user(&storage, SUPPORT).await;
        let reader = testing::user(&storage, "reader@example.com").await;
        let feed = testing::feed(&storage, support, "https://trim.example.com/feed").await;
        storage
            .collections()
            .follow(reader, feed.id, now)
            .await
            .expect("follow");
        let newest = feed_link(&storage, &feed, "https://trim.example.com/1", now - Duration::days(1)).await;
        let older = feed_link(&storage, &feed, "https://trim.example.com/2", now - Duration::days(90)).await;
        let oldest = feed_link(&storage, &feed, "https://trim.example.com/3", now - Duration::days(400)).await;
        let retention = RetentionPolicy {
            feeds: FeedRetention {
                keep_maximum: None,
                keep_period_months: Some(1),
                keep_minimum: 2,
            },
            ..RetentionPolicy::default()
        };

        let report = cleaner(
            &storage,
            HttpCache::new(dir.path()).expect("cache"),
            retention,
            false,
        )
        .perform(now)
        .await
        .expect("cleaner should succeed");

        let links = storage.links();
        assert_eq!(report.feed_links, 1);
        assert!(links.find(newest).await.expect("find").is_some());
        assert!(links.find(older).await.expect("find").is_some());
        assert!(links.find(oldest).await.expect("find").is_none());
    }

    #[tokio::test]
    async fn demo_reset_keeps_only_support_and_a_fresh_demo_account() {
        let storage = testing::storage().await;
        let dir = tempfile::tempdir().expect("tempdir should exist");
        let now = Utc::now();
        let support = testing::user(&storage, SUPPORT).await;
        let alix = testing::user(&storage, "alix@example.com").await;
        testing::link(&storage, alix, "https://alix.example.com").await;
        let feed = testing::feed(&storage, support, "https://feed.example.com/atom").await;

        let report = cleaner(
            &storage,
            HttpCache::new(dir.path()).expect("cache"),
            RetentionPolicy::default(),
            true,
        )
        .perform(now)
        .await
        .expect("cleaner should succeed");

        let accounts = storage.accounts();
        assert!(report.demo_reset);
        assert_eq!(accounts.count_users().await.expect("count"), 2);
        assert!(accounts.find(alix).await.expect("find").is_none());
        let demo = accounts
            .find_by_email(DEMO_EMAIL)
            .await
            .expect("find")
            .expect("demo user should exist");
        let news = storage
            .collections()
            .find_or_create_by_kind(demo.id, CollectionKind::News, now)
            .await
            .expect("news");
        assert_eq!(news.name, "News");
        assert!(storage.collections().find(feed.id).await.expect("find").is_some());
    }

    proptest! {
        #[test]
        fn trimming_respects_ceiling_and_floor(
            ages in proptest::collection::vec(0i64..500, 0..40),
            maximum in proptest::option::of(1usize..30),
            period in proptest::option::of(1u32..12),
            minimum in 0usize..30,
        ) {
            let now = Utc::now();
            let mut ages = ages;
            ages.sort_unstable();
            let publications: Vec<(i64, DateTime<Utc>)> = ages
                .iter()
                .enumerate()
                .map(|(index, age)| (index as i64, now - Duration::days(*age)))
                .collect();
            let retention = FeedRetention {
                keep_maximum: maximum,
                keep_period_months: period,
                keep_minimum: minimum,
            };

            let expired = expired_publications(publications.iter().copied(), &retention, now);
            let kept = publications.len() - expired.len();

            if let Some(maximum) = maximum {
                prop_assert!(kept <= maximum);
            }
            let floor = minimum.min(publications.len()).min(maximum.unwrap_or(usize::MAX));
            prop_assert!(kept >= floor);
            if maximum.is_none() && period.is_none() {
                prop_assert!(expired.is_empty());
            }
        }
    }
}
