use chrono::{DateTime, Utc};

use super::storage::models::{CollectionKind, CollectionRecord, LinkRecord, NewLink};
use super::storage::Storage;

pub async fn storage() -> Storage {
    Storage::connect("sqlite::memory:")
        .await
        .expect("connect must succeed")
}

pub async fn user(storage: &Storage, email: &str) -> i64 {
    storage
        .accounts()
        .create_user(email, email, Some(Utc::now()), Utc::now())
        .await
        .expect("user create should succeed")
        .id
}

pub async fn link(storage: &Storage, user_id: i64, url: &str) -> LinkRecord {
    link_at(storage, user_id, url, Utc::now()).await
}

pub async fn link_at(
    storage: &Storage,
    user_id: i64,
    url: &str,
    created_at: DateTime<Utc>,
) -> LinkRecord {
    storage
        .links()
        .create(&NewLink {
            user_id,
            url: url.to_string(),
            title: url.to_string(),
            reading_time: 0,
            feed_entry_id: None,
            source_type: None,
            source_resource_id: None,
            created_at,
        })
        .await
        .expect("link create should succeed")
}

pub async fn collection(storage: &Storage, user_id: i64, kind: CollectionKind) -> CollectionRecord {
    storage
        .collections()
        .create(user_id, kind, kind.default_name(), Utc::now())
        .await
        .expect("collection create should succeed")
}

pub async fn feed(storage: &Storage, user_id: i64, feed_url: &str) -> CollectionRecord {
    storage
        .collections()
        .create_feed(user_id, feed_url, Utc::now())
        .await
        .expect("feed create should succeed")
}

pub fn atom_feed(title: &str, entries: &[(&str, &str, DateTime<Utc>)]) -> String {
    let items: String = entries
        .iter()
        .map(|(id, href, published)| {
            format!(
                r#"
  <entry>
    <id>{id}</id>
    <title>Entry {id}</title>
    <link href="{href}"/>
    <published>{published}</published>
    <updated>{published}</updated>
  </entry>"#,
                published = published.to_rfc3339()
            )
        })
        .collect();
    format!(
        r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>{title}</title>
  <id>urn:test:feed</id>
  <updated>2026-01-01T00:00:00Z</updated>
  <link href="/blog/" rel="alternate"/>{items}
</feed>
"#
    )
}

/// Serves `router` on an ephemeral local port and returns its base URL.
pub async fn serve(router: axum::Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("test listener should bind");
    let address = listener.local_addr().expect("local addr should exist");
    tokio::spawn(async move {
        let _ = axum::serve(listener, router).await;
    });
    format!("http://{address}")
}

/// A URL on a local port nothing listens on.
pub async fn closed_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("test listener should bind");
    let address = listener.local_addr().expect("local addr should exist");
    drop(listener);
    format!("http://{address}/")
}
