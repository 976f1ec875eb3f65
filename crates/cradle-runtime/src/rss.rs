//! Minimal RSS 2.0 / RDF / Atom reader built on quick-xml

use anyhow::{Context, Result, anyhow, bail};
use quick_xml::Reader;
use quick_xml::events::{BytesStart, Event};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub description: String,
    pub published: String,
    pub author: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Feed {
    pub title: String,
    pub items: Vec<FeedItem>,
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn is_entry(name: &str) -> bool {
    name == "item" || name == "entry"
}

fn check_root(name: &str) -> Result<()> {
    match name {
        "rss" | "RDF" | "feed" => Ok(()),
        _ => bail!("document is not an RSS or Atom feed"),
    }
}

/// Atom puts the link in an `href` attribute
fn capture_href(e: &BytesStart<'_>, item: &mut FeedItem) -> Result<()> {
    if !item.link.is_empty() {
        return Ok(());
    }
    if let Some(attr) = e.try_get_attribute("href").map_err(|e| anyhow!("{}", e))? {
        let rel = e
            .try_get_attribute("rel")
            .map_err(|e| anyhow!("{}", e))?
            .map(|a| String::from_utf8_lossy(&a.value).into_owned());
        if rel.as_deref().is_none_or(|r| r == "alternate") {
            item.link = attr.unescape_value().map_err(|e| anyhow!("{}", e))?.into_owned();
        }
    }
    Ok(())
}

fn apply_text(stack: &[String], current: &mut Option<FeedItem>, feed: &mut Feed, text: &str) {
    let Some(element) = stack.last().map(String::as_str) else {
        return;
    };
    let parent = stack.len().checked_sub(2).map(|i| stack[i].as_str());

    if let Some(item) = current.as_mut() {
        let set_if_empty = |field: &mut String| {
            if field.is_empty() {
                field.push_str(text);
            }
        };
        match element {
            "title" => item.title.push_str(text),
            "link" => item.link.push_str(text),
            "description" | "summary" | "content" | "encoded" => set_if_empty(&mut item.description),
            "pubDate" | "published" | "updated" | "date" => set_if_empty(&mut item.published),
            "author" | "creator" => set_if_empty(&mut item.author),
            "name" if parent == Some("author") => set_if_empty(&mut item.author),
            _ => {}
        }
    } else if element == "title" && matches!(parent, Some("channel") | Some("feed")) {
        feed.title.push_str(text);
    }
}

/// Parse a feed document, keeping at most `max_items` entries
pub fn parse_feed(xml: &str, max_items: usize) -> Result<Feed> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut feed = Feed::default();
    let mut stack: Vec<String> = Vec::new();
    let mut current: Option<FeedItem> = None;
    let mut saw_root = false;

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = local_name(&e);
                if !saw_root {
                    check_root(&name)?;
                    saw_root = true;
                }
                if is_entry(&name) {
                    current = Some(FeedItem::default());
                } else if name == "link" {
                    if let Some(item) = current.as_mut() {
                        capture_href(&e, item)?;
                    }
                }
                stack.push(name);
            }
            Ok(Event::Empty(e)) => {
                let name = local_name(&e);
                if !saw_root {
                    check_root(&name)?;
                    saw_root = true;
                }
                if name == "link" {
                    if let Some(item) = current.as_mut() {
                        capture_href(&e, item)?;
                    }
                }
            }
            Ok(Event::End(_)) => {
                if let Some(name) = stack.pop() {
                    if is_entry(&name) {
                        if let Some(item) = current.take() {
                            if feed.items.len() < max_items {
                                feed.items.push(item);
                            }
                        }
                    }
                }
            }
            Ok(Event::Text(t)) => {
                let text = t.unescape().map_err(|e| anyhow!("invalid feed text: {}", e))?;
                apply_text(&stack, &mut current, &mut feed, &text);
            }
            Ok(Event::CData(c)) => {
                let text = String::from_utf8_lossy(&c).into_owned();
                apply_text(&stack, &mut current, &mut feed, text.trim());
            }
            Ok(Event::Eof) => break,
            Err(e) => bail!(
                "malformed XML at position {}: {}",
                reader.buffer_position(),
                e
            ),
            _ => {}
        }
    }

    if !saw_root {
        bail!("document is not an RSS or Atom feed");
    }
    Ok(feed)
}

/// Load a feed document from an http(s) or `file://` URL
pub async fn fetch_feed_source(client: &Client, url: &str, timeout: Duration) -> Result<String> {
    if let Some(path) = url.strip_prefix("file://") {
        return tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("Failed to read feed file {}", path));
    }
    if url.starts_with("http://") || url.starts_with("https://") {
        let response = client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .with_context(|| format!("Failed to fetch feed {}", url))?;
        let status = response.status();
        if !status.is_success() {
            bail!("feed request returned status {}", status);
        }
        return response.text().await.context("Failed to read feed body");
    }
    bail!("unsupported feed URL: {}", url)
}

#[cfg(test)]
mod tests {
    use super::*;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel>
    <title>Example News</title>
    <link>https://example.com</link>
    <item>
      <title>First &amp; foremost</title>
      <link>https://example.com/1</link>
      <description><![CDATA[<p>Hello</p>]]></description>
      <pubDate>Mon, 01 Jan 2024 09:00:00 GMT</pubDate>
      <dc:creator>Ann</dc:creator>
    </item>
    <item>
      <title>Second</title>
      <link>https://example.com/2</link>
    </item>
    <item>
      <title>Third</title>
      <link>https://example.com/3</link>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Feed</title>
  <entry>
    <title>Entry one</title>
    <link rel="alternate" href="https://example.org/e1"/>
    <summary>Short</summary>
    <updated>2024-01-01T00:00:00Z</updated>
    <author><name>Bob</name></author>
  </entry>
</feed>"#;

    #[test]
    fn test_parse_rss() {
        let feed = parse_feed(RSS, 10).unwrap();
        assert_eq!(feed.title, "Example News");
        assert_eq!(feed.items.len(), 3);
        let first = &feed.items[0];
        assert_eq!(first.title, "First & foremost");
        assert_eq!(first.link, "https://example.com/1");
        assert_eq!(first.description, "<p>Hello</p>");
        assert_eq!(first.author, "Ann");
        assert!(first.published.starts_with("Mon"));
    }

    #[test]
    fn test_max_items() {
        let feed = parse_feed(RSS, 2).unwrap();
        assert_eq!(feed.items.len(), 2);
        assert_eq!(feed.items[1].title, "Second");
    }

    #[test]
    fn test_parse_atom() {
        let feed = parse_feed(ATOM, 10).unwrap();
        assert_eq!(feed.title, "Atom Feed");
        assert_eq!(feed.items.len(), 1);
        assert_eq!(feed.items[0].link, "https://example.org/e1");
        assert_eq!(feed.items[0].description, "Short");
        assert_eq!(feed.items[0].author, "Bob");
    }

    #[test]
    fn test_rejects_non_feed() {
        let err = parse_feed("just some words", 10).unwrap_err();
        assert!(err.to_string().contains("not an RSS or Atom feed"));

        let err = parse_feed("<html><body>hi</body></html>", 10).unwrap_err();
        assert!(err.to_string().contains("not an RSS or Atom feed"));
    }

    #[test]
    fn test_rejects_malformed_xml() {
        assert!(parse_feed("<rss><channel></rss>", 10).is_err());
    }

    #[tokio::test]
    async fn test_fetch_file_url() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feed.xml");
        std::fs::write(&path, RSS).unwrap();

        let client = Client::new();
        let url = format!("file://{}", path.display());
        let body = fetch_feed_source(&client, &url, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(parse_feed(&body, 10).unwrap().items.len(), 3);

        assert!(
            fetch_feed_source(&client, "ftp://example.com/feed", Duration::from_secs(1))
                .await
                .is_err()
        );
    }
}
