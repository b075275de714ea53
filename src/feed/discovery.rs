use thiserror::Error;
use url::Url;

use super::fetcher::{FetchError, Fetcher};
use super::parser::parse_feed_info;
use crate::shutdown::Shutdown;
use crate::storage::FeedInfo;
use crate::util::validate_url;

const MAX_DISCOVERY_SIZE: usize = 5 * 1024 * 1024; // 5MB

/// A feed located from a user-supplied URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredFeed {
    /// URL of the RSS/Atom document itself
    pub feed_url: String,
    pub info: FeedInfo,
}

/// Errors that can occur during feed discovery.
#[derive(Debug, Error)]
pub enum DiscoveryError {
    /// The provided URL is not an absolute http(s) URL
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    /// Every candidate was tried and none yielded a feed
    #[error("no valid RSS/Atom feed found")]
    NoFeedFound,
    #[error("discovery cancelled")]
    Cancelled,
}

/// Locates a feed starting from `user_url`.
///
/// Candidates are the URL itself, each ancestor path, then the site root
/// (see [`candidate_urls`]). For each candidate, XML-ish responses are
/// parsed directly and HTML responses are scanned for
/// `<link rel="alternate">` feed hints. The first candidate that yields a
/// parseable feed wins; every other failure moves on silently.
///
/// # Errors
///
/// - [`DiscoveryError::InvalidUrl`] if `user_url` is not http(s)
/// - [`DiscoveryError::Cancelled`] if `shutdown` fires mid-walk
/// - [`DiscoveryError::NoFeedFound`] once all candidates are exhausted
pub async fn discover_feed(
    fetcher: &Fetcher,
    user_url: &str,
    shutdown: &Shutdown,
) -> Result<DiscoveredFeed, DiscoveryError> {
    let validated = validate_url(user_url).map_err(|e| DiscoveryError::InvalidUrl(e.to_string()))?;
    let fetcher = fetcher.clone().with_max_body_size(MAX_DISCOVERY_SIZE);

    for candidate in candidate_urls(&validated) {
        if shutdown.is_triggered() {
            return Err(DiscoveryError::Cancelled);
        }
        match try_candidate(&fetcher, &candidate, shutdown).await {
            Ok(Some(found)) => {
                tracing::info!(input = %user_url, feed = %found.feed_url, "Discovered feed");
                return Ok(found);
            }
            Ok(None) => {}
            Err(FetchError::Cancelled) => return Err(DiscoveryError::Cancelled),
            Err(e) => {
                tracing::debug!(candidate = %candidate, error = %e, "Candidate fetch failed");
            }
        }
    }

    Err(DiscoveryError::NoFeedFound)
}

/// Builds the ordered candidate list for `url`.
///
/// The input comes first, then each strict ancestor path with query and
/// fragment cleared, then the site root unless the input path is already
/// `/`. Duplicates are not removed.
pub fn candidate_urls(url: &Url) -> Vec<String> {
    let mut candidates = vec![url.to_string()];

    let mut path = url.path().to_owned();
    while !path.is_empty() && path != "/" {
        match path.rfind('/') {
            Some(last_slash) if last_slash > 0 => path.truncate(last_slash),
            _ => break,
        }
        candidates.push(with_path(url, &path));
    }

    if url.path() != "/" {
        candidates.push(with_path(url, "/"));
    }

    candidates
}

fn with_path(url: &Url, path: &str) -> String {
    let mut parent = url.clone();
    parent.set_path(path);
    parent.set_query(None);
    parent.set_fragment(None);
    parent.to_string()
}

/// Probes one candidate. `Ok(None)` means "reachable but not a feed".
async fn try_candidate(
    fetcher: &Fetcher,
    candidate: &str,
    shutdown: &Shutdown,
) -> Result<Option<DiscoveredFeed>, FetchError> {
    let fetched = fetcher.fetch(candidate, shutdown).await?;
    let content_type = fetched.content_type.to_ascii_lowercase();

    if ["xml", "rss", "atom"].iter().any(|t| content_type.contains(t)) {
        match parse_feed_info(&fetched.body) {
            Ok(info) => {
                return Ok(Some(DiscoveredFeed {
                    feed_url: candidate.to_owned(),
                    info,
                }))
            }
            Err(e) => tracing::debug!(candidate = %candidate, error = %e, "Not a feed"),
        }
    }

    if content_type.contains("html") {
        let Ok(base) = Url::parse(candidate) else {
            return Ok(None);
        };
        let html = String::from_utf8_lossy(&fetched.body);
        for href in find_feed_links_in_html(&html, &base) {
            match fetcher.fetch(&href, shutdown).await {
                Ok(feed) => match parse_feed_info(&feed.body) {
                    Ok(info) => {
                        return Ok(Some(DiscoveredFeed {
                            feed_url: href,
                            info,
                        }))
                    }
                    Err(e) => tracing::debug!(link = %href, error = %e, "Linked document is not a feed"),
                },
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(e) => tracing::debug!(link = %href, error = %e, "Linked feed fetch failed"),
            }
        }
    }

    Ok(None)
}

/// Scans HTML for `<link rel="alternate">` tags with an RSS or Atom type.
///
/// Uses simple string scanning (no HTML parser dependency). Attributes may
/// appear in any order, quoted with `"` or `'` or unquoted, with optional
/// whitespace around `=`. Every match is returned in document order,
/// resolved against `base`.
pub fn find_feed_links_in_html(html: &str, base: &Url) -> Vec<String> {
    // ASCII lowering keeps byte offsets aligned with `html`
    let html_lower = html.to_ascii_lowercase();
    let mut links = Vec::new();
    let mut search_from = 0;

    while let Some(found) = html_lower[search_from..].find("<link") {
        let attrs_start = search_from + found + "<link".len();
        let boundary = html.as_bytes().get(attrs_start).copied();
        if !matches!(boundary, Some(b) if b.is_ascii_whitespace() || b == b'/' || b == b'>') {
            search_from = attrs_start;
            continue;
        }

        let (attrs, tag_len) = parse_attributes(&html[attrs_start..]);
        search_from = attrs_start + tag_len;

        if attr(&attrs, "rel").is_some_and(|rel| rel.eq_ignore_ascii_case("alternate"))
            && attr(&attrs, "type").is_some_and(is_feed_type)
        {
            let href = attr(&attrs, "href").map(str::trim).unwrap_or_default();
            if !href.is_empty() {
                if let Ok(resolved) = base.join(href) {
                    links.push(resolved.to_string());
                }
            }
        }
    }

    links
}

fn is_feed_type(value: &str) -> bool {
    value.eq_ignore_ascii_case("application/rss+xml")
        || value.eq_ignore_ascii_case("application/atom+xml")
}

/// Looks up an attribute by lowercase name. A repeated attribute keeps its last value.
fn attr<'a>(attrs: &[(String, &'a str)], name: &str) -> Option<&'a str> {
    attrs
        .iter()
        .rev()
        .find(|(key, _)| key == name)
        .map(|(_, value)| *value)
}

/// Parses the attribute list of a tag whose name has already been consumed.
///
/// Returns the `(lowercased name, value)` pairs and the number of bytes up to
/// and including the closing `>` (or the whole input if the tag never closes).
/// A `>` inside a quoted value does not end the tag.
fn parse_attributes(tag: &str) -> (Vec<(String, &str)>, usize) {
    let bytes = tag.as_bytes();
    let mut attrs = Vec::new();
    let mut i = 0;

    let skip_ws = |mut i: usize| {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        i
    };

    loop {
        i = skip_ws(i);
        match bytes.get(i) {
            None => return (attrs, bytes.len()),
            Some(b'>') => return (attrs, i + 1),
            Some(b'/') => {
                i += 1;
                continue;
            }
            Some(_) => {}
        }

        let name_start = i;
        while i < bytes.len()
            && !bytes[i].is_ascii_whitespace()
            && !matches!(bytes[i], b'=' | b'>' | b'/')
        {
            i += 1;
        }
        let name = tag[name_start..i].to_ascii_lowercase();

        let after_name = skip_ws(i);
        if bytes.get(after_name) != Some(&b'=') {
            attrs.push((name, ""));
            continue;
        }
        i = skip_ws(after_name + 1);

        let value = match bytes.get(i) {
            Some(&quote) if quote == b'"' || quote == b'\'' => {
                let value_start = i + 1;
                match tag[value_start..].find(quote as char) {
                    Some(len) => {
                        i = value_start + len + 1;
                        &tag[value_start..value_start + len]
                    }
                    None => return (attrs, bytes.len()),
                }
            }
            _ => {
                let value_start = i;
                while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' {
                    i += 1;
                }
                &tag[value_start..i]
            }
        };
        attrs.push((name, value));
    }
}
