use chrono::{DateTime, Utc};
use feed_rs::model::{Entry, FeedType, Link};
use serde::Deserialize;

use super::types::{FeedFormat, ParsedEntry, ParsedFeed};

#[derive(Debug, thiserror::Error)]
pub enum FeedParseError {
    #[error("feed payload is empty")]
    EmptyPayload,
    #[error("xml feed parse error: {0}")]
    Xml(#[from] feed_rs::parser::ParseFeedError),
    #[error("json feed parse error: {0}")]
    Json(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Deserialize)]
struct JsonFeed {
    title: Option<String>,
    home_page_url: Option<String>,
    #[serde(default)]
    items: Vec<JsonFeedItem>,
}

#[derive(Debug, Clone, Deserialize)]
struct JsonFeedItem {
    id: Option<serde_json::Value>,
    title: Option<String>,
    url: Option<String>,
    external_url: Option<String>,
    date_published: Option<String>,
    date_modified: Option<String>,
}

pub fn parse_feed_bytes(raw: &[u8]) -> Result<ParsedFeed, FeedParseError> {
    let trimmed = raw.trim_ascii_start();
    if trimmed.is_empty() {
        return Err(FeedParseError::EmptyPayload);
    }
    if trimmed[0] == b'{' {
        return parse_json_feed(trimmed);
    }
    parse_xml_feed(trimmed)
}

fn parse_xml_feed(raw: &[u8]) -> Result<ParsedFeed, FeedParseError> {
    // Entries without an id get an empty one instead of a generated digest,
    // so the merge can fall back to their URL.
    let parser = feed_rs::parser::Builder::new()
        .id_generator(|_, _, _| String::new())
        .build();
    let feed = parser.parse(raw)?;
    let format = match feed.feed_type {
        FeedType::Atom => FeedFormat::Atom,
        FeedType::JSON => FeedFormat::Json,
        _ => FeedFormat::Rss,
    };
    let title = feed
        .title
        .as_ref()
        .map(|text| text.content.trim().to_string())
        .unwrap_or_default();
    let site_url = alternate_link(&feed.links);
    let entries = feed.entries.iter().map(entry_from_xml).collect();

    Ok(ParsedFeed {
        format,
        title,
        site_url,
        entries,
    })
}

fn parse_json_feed(raw: &[u8]) -> Result<ParsedFeed, FeedParseError> {
    let feed: JsonFeed = serde_json::from_slice(raw)?;
    let entries = feed
        .items
        .into_iter()
        .map(|item| ParsedEntry {
            id: item.id.and_then(|id| match id {
                serde_json::Value::String(value) => non_empty(value),
                serde_json::Value::Number(value) => Some(value.to_string()),
                _ => None,
            }),
            title: item.title.unwrap_or_default(),
            link: item.url.or(item.external_url).and_then(non_empty),
            published_at: item
                .date_published
                .or(item.date_modified)
                .and_then(|value| DateTime::parse_from_rfc3339(&value).ok())
                .map(|date| date.with_timezone(&Utc)),
        })
        .collect();

    Ok(ParsedFeed {
        format: FeedFormat::Json,
        title: feed.title.unwrap_or_default(),
        site_url: feed.home_page_url.and_then(non_empty),
        entries,
    })
}

fn entry_from_xml(entry: &Entry) -> ParsedEntry {
    let title = entry
        .title
        .as_ref()
        .map(|text| text.content.trim().to_string())
        .unwrap_or_default();

    ParsedEntry {
        id: non_empty(entry.id.clone()),
        title,
        link: alternate_link(&entry.links),
        published_at: entry.published.or(entry.updated),
    }
}

/// First `alternate` (or rel-less) link, else the first link at all.
fn alternate_link(links: &[Link]) -> Option<String> {
    links
        .iter()
        .find(|link| matches!(link.rel.as_deref(), None | Some("alternate")))
        .or_else(|| links.first())
        .and_then(|link| non_empty(link.href.clone()))
}

fn non_empty(value: String) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}
