use std::future::Future;
use std::time::Duration;

use feed_rs::model::{Entry, FeedType, Link};
use feed_rs::parser;
use log::debug;
use reqwest::Client;

use crate::error::FetchError;
use crate::models::{FetchedFeed, FetchedItem};

pub const DEFAULT_USER_AGENT: &str = concat!("gator/", env!("CARGO_PKG_VERSION"));

/// Where the scheduler gets feed documents from.
pub trait FeedSource {
    fn fetch_feed(&self, url: &str) -> impl Future<Output = Result<FetchedFeed, FetchError>>;
}

/// Retrieves feed documents over HTTP. One request per call, no retries.
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    pub fn new(user_agent: &str, timeout: Duration) -> reqwest::Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()?;

        Ok(Self { client })
    }

    pub async fn fetch(&self, url: &str) -> Result<FetchedFeed, FetchError> {
        let network = |err: reqwest::Error| FetchError::Network {
            url: url.to_string(),
            message: err.to_string(),
        };

        let response = self.client.get(url).send().await.map_err(network)?;

        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let bytes = response.bytes().await.map_err(network)?;
        debug!("Fetched {} bytes from {}", bytes.len(), url);

        parse_feed(url, &bytes[..])
    }
}

impl FeedSource for Fetcher {
    async fn fetch_feed(&self, url: &str) -> Result<FetchedFeed, FetchError> {
        self.fetch(url).await
    }
}

/// Parses an RSS or Atom document. Entries without a title or a link are
/// dropped; the rest keep document order.
pub fn parse_feed(url: &str, body: &[u8]) -> Result<FetchedFeed, FetchError> {
    let malformed = |message: String| FetchError::MalformedXml {
        url: url.to_string(),
        message,
    };

    let feed = parser::parse(body).map_err(|e| malformed(e.to_string()))?;

    if matches!(feed.feed_type, FeedType::JSON) {
        return Err(malformed("JSON feeds are not supported".to_string()));
    }

    let total = feed.entries.len();
    let items: Vec<FetchedItem> = feed.entries.into_iter().filter_map(parse_entry).collect();

    if items.len() < total {
        debug!(
            "Skipped {} of {} entries without a title or link in {}",
            total - items.len(),
            total,
            url
        );
    }

    Ok(FetchedFeed {
        title: feed.title.map(|t| t.content.trim().to_string()),
        link: preferred_link(&feed.links),
        description: feed.description.map(|d| d.content.trim().to_string()),
        items,
    })
}

fn parse_entry(entry: Entry) -> Option<FetchedItem> {
    let title = entry
        .title
        .map(|t| t.content.trim().to_string())
        .filter(|t| !t.is_empty())?;
    let link = preferred_link(&entry.links)?;

    let description = entry
        .summary
        .map(|s| s.content)
        .or_else(|| entry.content.and_then(|c| c.body))
        .map(|d| d.trim().to_string())
        .filter(|d| !d.is_empty());

    Some(FetchedItem {
        title,
        link,
        description,
        published_at: entry.published,
    })
}

/// The `alternate` link if there is one, otherwise the first non-empty href.
fn preferred_link(links: &[Link]) -> Option<String> {
    let usable = |link: &&Link| !link.href.trim().is_empty();

    links
        .iter()
        .filter(usable)
        .find(|link| matches!(link.rel.as_deref(), None | Some("alternate")))
        .or_else(|| links.iter().find(usable))
        .map(|link| link.href.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example Blog</title>
    <link>https://blog.example.com/</link>
    <description>Posts about things</description>
    <item>
      <title>First post</title>
      <link>https://blog.example.com/first</link>
      <description>Hello &amp; welcome</description>
      <pubDate>Mon, 02 Jan 2006 15:04:05 +0000</pubDate>
    </item>
    <item>
      <title>Second post</title>
      <link>https://blog.example.com/second</link>
      <pubDate>Tue, 03 Jan 2006 10:00:00 GMT</pubDate>
    </item>
    <item>
      <title>Draft without a link</title>
      <description>nowhere to go</description>
      <pubDate>Wed, 04 Jan 2006 10:00:00 GMT</pubDate>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Example Feed</title>
  <link href="http://example.org/"/>
  <updated>2003-12-13T18:30:02Z</updated>
  <id>urn:uuid:60a76c80-d399-11d9-b93C-0003939e0af6</id>
  <entry>
    <title>Atom-Powered Robots Run Amok</title>
    <link rel="edit" href="http://example.org/edit/1"/>
    <link rel="alternate" href="http://example.org/2003/12/13/atom03"/>
    <id>urn:uuid:1225c695-cfb8-4ebb-aaaa-80da344efa6a</id>
    <updated>2003-12-13T18:30:02Z</updated>
    <summary>Some text.</summary>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_rss_skips_items_without_link() {
        let feed = parse_feed("https://blog.example.com/rss", RSS.as_bytes()).unwrap();

        assert_eq!(feed.title.as_deref(), Some("Example Blog"));
        assert_eq!(feed.description.as_deref(), Some("Posts about things"));
        assert_eq!(feed.items.len(), 2);

        let first = &feed.items[0];
        assert_eq!(first.title, "First post");
        assert_eq!(first.link, "https://blog.example.com/first");
        assert_eq!(first.description.as_deref(), Some("Hello & welcome"));
        assert_eq!(
            first.published_at,
            Some(Utc.with_ymd_and_hms(2006, 1, 2, 15, 4, 5).unwrap())
        );

        assert_eq!(feed.items[1].title, "Second post");
        assert!(feed.items[1].description.is_none());
    }

    #[test]
    fn test_parse_rss_with_unparseable_date_keeps_item() {
        let doc = r#"<rss version="2.0"><channel><title>t</title>
            <item><title>Odd date</title><link>https://x.example/1</link>
            <pubDate>sometime last week</pubDate></item>
            <item><title>No date</title><link>https://x.example/2</link></item>
            </channel></rss>"#;

        let feed = parse_feed("https://x.example/rss", doc.as_bytes()).unwrap();

        assert_eq!(feed.items.len(), 2);
        assert!(feed.items[0].published_at.is_none());
        assert!(feed.items[1].published_at.is_none());
    }

    #[test]
    fn test_parse_atom_prefers_alternate_link() {
        let feed = parse_feed("http://example.org/feed", ATOM.as_bytes()).unwrap();

        assert_eq!(feed.title.as_deref(), Some("Example Feed"));
        assert_eq!(feed.link.as_deref(), Some("http://example.org/"));
        assert_eq!(feed.items.len(), 1);
        assert_eq!(feed.items[0].link, "http://example.org/2003/12/13/atom03");
        assert_eq!(feed.items[0].description.as_deref(), Some("Some text."));
    }

    #[test]
    fn test_parse_atom_updated_is_not_a_publish_date() {
        let doc = r#"<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Dates</title>
  <id>urn:x:dates</id>
  <updated>2024-03-05T12:00:00Z</updated>
  <entry>
    <title>Revised only</title>
    <link href="https://d.example/revised"/>
    <id>urn:x:1</id>
    <updated>2024-03-05T12:00:00Z</updated>
  </entry>
  <entry>
    <title>Published and revised</title>
    <link href="https://d.example/published"/>
    <id>urn:x:2</id>
    <published>2024-03-01T08:00:00Z</published>
    <updated>2024-03-05T12:00:00Z</updated>
  </entry>
</feed>"#;

        let feed = parse_feed("https://d.example/atom", doc.as_bytes()).unwrap();

        assert_eq!(feed.items.len(), 2);
        assert_eq!(feed.items[0].title, "Revised only");
        assert!(feed.items[0].published_at.is_none());
        assert_eq!(
            feed.items[1].published_at,
            Some(Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap())
        );
        let atom = parse_feed("http://example.org/feed", ATOM.as_bytes()).unwrap();
        assert!(atom.items[0].published_at.is_none());
    }

    #[test]
    fn test_parse_garbage_is_malformed() {
        let err = parse_feed("https://x.example/rss", b"<html><body>nope").unwrap_err();
        assert!(matches!(err, FetchError::MalformedXml { .. }));
        assert_eq!(err.url(), "https://x.example/rss");
    }

    #[test]
    fn test_parse_json_feed_is_rejected() {
        let doc = r#"{"version": "https://jsonfeed.org/version/1", "title": "j",
            "items": [{"id": "1", "url": "https://j.example/1", "title": "one"}]}"#;

        let err = parse_feed("https://j.example/feed.json", doc.as_bytes()).unwrap_err();
        assert!(matches!(err, FetchError::MalformedXml { .. }));
    }

    #[tokio::test]
    async fn test_fetch_sends_user_agent_and_parses() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/rss")
            .match_header("user-agent", "gator-test/1.0")
            .with_status(200)
            .with_header("content-type", "application/rss+xml")
            .with_body(RSS)
            .create_async()
            .await;

        let fetcher = Fetcher::new("gator-test/1.0", Duration::from_secs(5)).unwrap();
        let feed = fetcher.fetch(&format!("{}/rss", server.url())).await.unwrap();

        assert_eq!(feed.items.len(), 2);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_non_success_status() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/gone")
            .with_status(404)
            .create_async()
            .await;

        let fetcher = Fetcher::new(DEFAULT_USER_AGENT, Duration::from_secs(5)).unwrap();
        let err = fetcher
            .fetch(&format!("{}/gone", server.url()))
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
    }

    #[tokio::test]
    async fn test_fetch_connection_refused_is_network_error() {
        let fetcher = Fetcher::new(DEFAULT_USER_AGENT, Duration::from_secs(5)).unwrap();
        let err = fetcher.fetch("http://127.0.0.1:1/rss").await.unwrap_err();

        assert!(matches!(err, FetchError::Network { .. }));
    }
}
