use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::info;

use super::storage::collections::CollectionRepository;
use super::storage::links::LinkRepository;
use super::storage::models::CollectionKind;
use super::storage::{from_timestamp, Storage, StorageError};

/// Only links published within this many days are proposed.
pub const NEWS_CANDIDATES_DAYS: i64 = 7;

const SOURCE_COLLECTION: &str = "collection";

/// News links coming from the same source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceGroup {
    pub source_type: String,
    pub source_resource_id: i64,
    pub link_ids: Vec<i64>,
}

/// Builds a user's news from the collections they follow.
#[derive(Debug, Clone)]
pub struct Journal {
    links: LinkRepository,
    collections: CollectionRepository,
}

impl Journal {
    pub fn new(storage: &Storage) -> Self {
        Self {
            links: storage.links(),
            collections: storage.collections(),
        }
    }

    /// Fills an empty news collection with up to `max` links and returns how
    /// many links it holds. A non-empty news is left as is.
    pub async fn fill(
        &self,
        user_id: i64,
        max: usize,
        now: DateTime<Utc>,
    ) -> Result<usize, StorageError> {
        let news = self
            .collections
            .find_or_create_by_kind(user_id, CollectionKind::News, now)
            .await?;
        let existing = self.links.count_in_collection(news.id).await?;
        if existing > 0 {
            return Ok(existing);
        }

        let since = now - Duration::days(NEWS_CANDIDATES_DAYS);
        let candidates = self
            .links
            .list_news_candidates(user_id, since, max)
            .await?;
        for candidate in candidates {
            let link = match self.links.find_by_url(user_id, &candidate.url).await? {
                Some(link) => link,
                None => {
                    self.links
                        .copy(
                            candidate.link_id,
                            user_id,
                            SOURCE_COLLECTION,
                            candidate.collection_id,
                            now,
                        )
                        .await?
                }
            };
            self.links
                .attach(link.id, news.id, from_timestamp(candidate.published_at))
                .await?;
        }

        let groups = self.group_by_source(news.id).await?;
        let count = self.links.count_in_collection(news.id).await?;
        info!(user_id, count, groups = groups.len(), "news filled");
        Ok(count)
    }

    /// Flags the links of `collection_id` sharing a source with at least one
    /// other link, and returns those groups.
    pub async fn group_by_source(&self, collection_id: i64) -> Result<Vec<SourceGroup>, StorageError> {
        let links = self.links.list_in_collection(collection_id).await?;
        let mut by_source: BTreeMap<(String, i64), Vec<i64>> = BTreeMap::new();
        for link in &links {
            if let (Some(source_type), Some(source_resource_id)) =
                (&link.source_type, link.source_resource_id)
            {
                by_source
                    .entry((source_type.clone(), source_resource_id))
                    .or_default()
                    .push(link.id);
            }
        }

        let groups: Vec<SourceGroup> = by_source
            .into_iter()
            .filter(|(_, link_ids)| link_ids.len() >= 2)
            .map(|((source_type, source_resource_id), link_ids)| SourceGroup {
                source_type,
                source_resource_id,
                link_ids,
            })
            .collect();

        for link in &links {
            let grouped = groups.iter().any(|group| group.link_ids.contains(&link.id));
            if (link.group_by_source != 0) != grouped {
                self.links.set_group_by_source(link.id, grouped).await?;
            }
        }
        Ok(groups)
    }
}
