use sha2::{Digest, Sha256};
use thiserror::Error;

use super::xml::{parse_document, Element};
use crate::storage::FeedInfo;

/// Errors produced when a body is not a usable RSS 2.0 or Atom 1.0 feed.
#[derive(Debug, Error)]
pub enum ParseError {
    /// The body is not well-formed XML
    #[error("XML parse error: {0}")]
    Xml(String),
    /// Well-formed XML, but the root is neither `<rss>` nor `<feed>`
    #[error("not an RSS or Atom feed (root element <{0}>)")]
    UnsupportedFormat(String),
    /// The document matched a dialect but carried nothing usable
    #[error("{0} feed contains no usable content")]
    NoItems(Dialect),
}

/// Syndication dialect a document was parsed as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dialect {
    Rss,
    Atom,
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dialect::Rss => f.write_str("RSS"),
            Dialect::Atom => f.write_str("Atom"),
        }
    }
}

/// One feed entry, normalized across dialects.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub author: String,
    pub guid: String,
    pub description: String,
}

/// Items of a polled feed in source order; the first item is the newest.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    pub dialect: Dialect,
    pub items: Vec<FeedItem>,
}

// ============================================================================
// Dialect Models
// ============================================================================

#[derive(Debug, Default)]
struct RssChannel {
    title: String,
    link: String,
    description: String,
    items: Vec<RssItem>,
}

#[derive(Debug, Default)]
struct RssItem {
    title: String,
    link: String,
    description: String,
    guid: String,
    author: String,
    creator: String,
}

#[derive(Debug, Default)]
struct AtomFeed {
    title: String,
    subtitle: String,
    links: Vec<AtomLink>,
    entries: Vec<AtomEntry>,
}

#[derive(Debug, Default)]
struct AtomEntry {
    title: String,
    links: Vec<AtomLink>,
    summary: String,
    content: String,
    id: String,
    author_name: String,
}

#[derive(Debug)]
struct AtomLink {
    href: String,
    rel: Option<String>,
}

/// A parsed document in exactly one dialect.
#[derive(Debug)]
enum FeedDocument {
    Rss(RssChannel),
    Atom(AtomFeed),
}

impl FeedDocument {
    fn parse(body: &[u8]) -> Result<Self, ParseError> {
        let root = parse_document(body)?;
        match root.local_name.as_str() {
            "rss" => Ok(FeedDocument::Rss(RssChannel::from_root(&root))),
            "feed" => Ok(FeedDocument::Atom(AtomFeed::from_root(&root))),
            other => Err(ParseError::UnsupportedFormat(other.to_owned())),
        }
    }
}

impl RssChannel {
    fn from_root(root: &Element) -> Self {
        let Some(channel) = root.child("channel") else {
            return Self::default();
        };
        Self {
            title: channel.child_text("title"),
            link: channel.child_text("link"),
            description: channel.child_text("description"),
            items: channel.children_named("item").map(RssItem::from_element).collect(),
        }
    }
}

impl RssItem {
    fn from_element(item: &Element) -> Self {
        Self {
            title: item.child_text("title"),
            link: item.child_text("link"),
            description: item.child_text("description"),
            guid: item.child_text("guid"),
            author: item.child_text("author"),
            creator: item
                .child_qualified("dc:creator")
                .map(Element::text)
                .unwrap_or_default(),
        }
    }
}

impl AtomFeed {
    fn from_root(root: &Element) -> Self {
        Self {
            title: root.child_text("title"),
            subtitle: root.child_text("subtitle"),
            links: root.children_named("link").map(AtomLink::from_element).collect(),
            entries: root.children_named("entry").map(AtomEntry::from_element).collect(),
        }
    }
}

impl AtomEntry {
    fn from_element(entry: &Element) -> Self {
        Self {
            title: entry.child_text("title"),
            links: entry.children_named("link").map(AtomLink::from_element).collect(),
            summary: entry.child_text("summary"),
            content: entry.child_text("content"),
            id: entry.child_text("id"),
            author_name: entry
                .child("author")
                .map(|a| a.child_text("name"))
                .unwrap_or_default(),
        }
    }
}

impl AtomLink {
    fn from_element(link: &Element) -> Self {
        Self {
            href: link.attr("href").unwrap_or_default().trim().to_owned(),
            rel: link.attr("rel").map(str::to_owned),
        }
    }
}

/// First link whose `rel` is `alternate` or missing.
fn alternate_link(links: &[AtomLink]) -> String {
    links
        .iter()
        .find(|l| matches!(l.rel.as_deref(), None | Some("") | Some("alternate")))
        .map(|l| l.href.clone())
        .unwrap_or_default()
}

// ============================================================================
// Public API
// ============================================================================

/// Extracts feed metadata for subscription.
///
/// The title is never empty: a missing title becomes `"Untitled Feed"`.
///
/// # Errors
///
/// Returns [`ParseError`] when the body is neither RSS 2.0 nor Atom 1.0.
pub fn parse_feed_info(body: &[u8]) -> Result<FeedInfo, ParseError> {
    match FeedDocument::parse(body)? {
        FeedDocument::Rss(channel) => Ok(FeedInfo::new(
            channel.title,
            channel.description,
            channel.link,
        )),
        FeedDocument::Atom(feed) => {
            let link = alternate_link(&feed.links);
            Ok(FeedInfo::new(feed.title, feed.subtitle, link))
        }
    }
}

/// Parses a feed for polling, returning its items in source order.
///
/// An RSS document is accepted if its channel has a title or at least one
/// item; an Atom document only if it has at least one entry.
///
/// # Errors
///
/// Returns [`ParseError`] for malformed XML, an unknown root element, or a
/// document that fails the acceptance rule above.
pub fn parse_feed(body: &[u8]) -> Result<ParsedFeed, ParseError> {
    match FeedDocument::parse(body)? {
        FeedDocument::Rss(channel) => {
            if channel.title.is_empty() && channel.items.is_empty() {
                return Err(ParseError::NoItems(Dialect::Rss));
            }
            Ok(ParsedFeed {
                dialect: Dialect::Rss,
                items: channel.items.into_iter().map(normalize_rss_item).collect(),
            })
        }
        FeedDocument::Atom(feed) => {
            if feed.entries.is_empty() {
                return Err(ParseError::NoItems(Dialect::Atom));
            }
            Ok(ParsedFeed {
                dialect: Dialect::Atom,
                items: feed.entries.into_iter().map(normalize_atom_entry).collect(),
            })
        }
    }
}

fn normalize_rss_item(item: RssItem) -> FeedItem {
    let author = if item.author.is_empty() {
        item.creator
    } else {
        item.author
    };
    let guid = generate_guid(&item.guid, &item.link, &item.title);
    FeedItem {
        title: item.title,
        link: item.link,
        author,
        guid,
        description: item.description,
    }
}

fn normalize_atom_entry(entry: AtomEntry) -> FeedItem {
    let link = alternate_link(&entry.links);
    let description = if entry.summary.is_empty() {
        entry.content
    } else {
        entry.summary
    };
    let guid = generate_guid(&entry.id, &link, &entry.title);
    FeedItem {
        title: entry.title,
        link,
        author: entry.author_name,
        guid,
        description,
    }
}

/// Uses the feed's own identifier when present, otherwise a SHA-256 digest of
/// `link|title` so that feeds without GUIDs still get a stable watermark.
fn generate_guid(existing: &str, link: &str, title: &str) -> String {
    if !existing.is_empty() {
        return existing.to_owned();
    }
    if link.is_empty() && title.is_empty() {
        return String::new();
    }
    let hash = Sha256::digest(format!("{}|{}", link, title).as_bytes());
    format!("{:x}", hash)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::UNTITLED_FEED;
    use pretty_assertions::assert_eq;

    const RSS_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:dc="http://purl.org/dc/elements/1.1/">
  <channel>
    <title>Test RSS Feed</title>
    <link>https://example.com</link>
    <description>A test RSS feed</description>
    <item>
      <title>Newest</title>
      <link>https://example.com/2</link>
      <guid isPermaLink="false">item-2</guid>
      <dc:creator>Dana</dc:creator>
      <description>Second post</description>
    </item>
    <item>
      <title>Older</title>
      <link>https://example.com/1</link>
      <guid>item-1</guid>
      <author>ann@example.com (Ann)</author>
      <dc:creator>Ignored</dc:creator>
    </item>
  </channel>
</rss>"#;

    const ATOM_FEED: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Test Atom Feed</title>
  <subtitle>Atom things</subtitle>
  <link href="https://example.com/atom.xml" rel="self"/>
  <link href="https://example.com" rel="alternate"/>
  <entry>
    <title>Entry One</title>
    <link href="https://example.com/e1/edit" rel="edit"/>
    <link href="https://example.com/e1"/>
    <id>urn:uuid:1</id>
    <author><name>Eve</name></author>
    <content type="html">Full &lt;b&gt;body&lt;/b&gt;</content>
  </entry>
  <entry>
    <title>Entry Two</title>
    <link href="https://example.com/e2" rel="alternate"/>
    <id>urn:uuid:2</id>
    <summary>Short</summary>
    <content>Long</content>
  </entry>
</feed>"#;

    #[test]
    fn test_rss_feed_info() {
        let info = parse_feed_info(RSS_FEED.as_bytes()).unwrap();
        assert_eq!(
            info,
            FeedInfo {
                title: "Test RSS Feed".into(),
                description: "A test RSS feed".into(),
                link: "https://example.com".into(),
            }
        );
    }

    #[test]
    fn test_atom_feed_info_uses_alternate_link() {
        let info = parse_feed_info(ATOM_FEED.as_bytes()).unwrap();
        assert_eq!(info.title, "Test Atom Feed");
        assert_eq!(info.link, "https://example.com");
        assert_eq!(info.description, "Atom things");
    }

    #[test]
    fn test_atom_feed_info_empty_title_falls_back() {
        let atom = r#"<feed xmlns="http://www.w3.org/2005/Atom">
  <title></title>
  <link href="https://example.com"/>
  <entry><title>E</title><id>e1</id></entry>
</feed>"#;
        let info = parse_feed_info(atom.as_bytes()).unwrap();
        assert_eq!(info.title, UNTITLED_FEED);
        assert_eq!(info.link, "https://example.com");
    }

    #[test]
    fn test_rss_feed_info_without_title_defaults() {
        let rss = r#"<rss version="2.0"><channel>
  <item><guid>1</guid><title>Post</title></item>
</channel></rss>"#;
        assert_eq!(parse_feed_info(rss.as_bytes()).unwrap().title, UNTITLED_FEED);
    }

    #[test]
    fn test_feed_info_rejects_non_feeds() {
        assert!(parse_feed_info(b"not xml").is_err());
        assert!(matches!(
            parse_feed_info(b"<html><body>Hello</body></html>"),
            Err(ParseError::UnsupportedFormat(_))
        ));
    }

    #[test]
    fn test_rss_items_normalized_in_source_order() {
        let parsed = parse_feed(RSS_FEED.as_bytes()).unwrap();
        assert_eq!(parsed.dialect, Dialect::Rss);
        assert_eq!(
            parsed.items,
            vec![
                FeedItem {
                    title: "Newest".into(),
                    link: "https://example.com/2".into(),
                    author: "Dana".into(),
                    guid: "item-2".into(),
                    description: "Second post".into(),
                },
                FeedItem {
                    title: "Older".into(),
                    link: "https://example.com/1".into(),
                    author: "ann@example.com (Ann)".into(),
                    guid: "item-1".into(),
                    description: String::new(),
                },
            ]
        );
    }

    #[test]
    fn test_atom_entries_normalized() {
        let parsed = parse_feed(ATOM_FEED.as_bytes()).unwrap();
        assert_eq!(parsed.dialect, Dialect::Atom);
        let first = &parsed.items[0];
        assert_eq!(first.link, "https://example.com/e1");
        assert_eq!(first.author, "Eve");
        assert_eq!(first.guid, "urn:uuid:1");
        assert_eq!(first.description, "Full <b>body</b>");

        let second = &parsed.items[1];
        assert_eq!(second.link, "https://example.com/e2");
        assert_eq!(second.description, "Short");
        assert_eq!(second.author, "");
    }

    #[test]
    fn test_rss_with_empty_title_but_items_is_accepted() {
        let rss = r#"<rss version="2.0"><channel><title></title>
  <item><guid>a</guid><title>A</title></item>
</channel></rss>"#;
        let parsed = parse_feed(rss.as_bytes()).unwrap();
        assert_eq!(parsed.items.len(), 1);
    }

    #[test]
    fn test_rss_with_title_and_no_items_is_accepted_empty() {
        let rss = r#"<rss version="2.0"><channel><title>Quiet</title></channel></rss>"#;
        let parsed = parse_feed(rss.as_bytes()).unwrap();
        assert!(parsed.items.is_empty());
    }

    #[test]
    fn test_empty_rss_channel_rejected() {
        let rss = r#"<rss version="2.0"><channel></channel></rss>"#;
        assert!(matches!(
            parse_feed(rss.as_bytes()),
            Err(ParseError::NoItems(Dialect::Rss))
        ));
    }

    #[test]
    fn test_atom_without_entries_rejected() {
        let atom = r#"<feed xmlns="http://www.w3.org/2005/Atom"><title>Empty</title></feed>"#;
        assert!(matches!(
            parse_feed(atom.as_bytes()),
            Err(ParseError::NoItems(Dialect::Atom))
        ));
    }

    #[test]
    fn test_missing_guid_gets_stable_fallback() {
        let rss = r#"<rss version="2.0"><channel><title>T</title>
  <item><title>No id</title><link>https://example.com/x</link></item>
</channel></rss>"#;
        let first = parse_feed(rss.as_bytes()).unwrap();
        let second = parse_feed(rss.as_bytes()).unwrap();
        assert_eq!(first.items[0].guid.len(), 64);
        assert_eq!(first.items[0].guid, second.items[0].guid);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn feed_info_title_never_empty(title in ".{0,40}", body in ".{0,200}") {
                let doc = format!(
                    "<rss><channel><title>{}</title></channel></rss>",
                    quick_xml::escape::escape(title.as_str())
                );
                if let Ok(info) = parse_feed_info(doc.as_bytes()) {
                    prop_assert!(!info.title.trim().is_empty());
                }
                if let Ok(info) = parse_feed_info(body.as_bytes()) {
                    prop_assert!(!info.title.trim().is_empty());
                }
            }
        }
    }
}
