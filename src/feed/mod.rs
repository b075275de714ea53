//! Feed retrieval and interpretation.
//!
//! - [`fetcher`] - HTTP GET with a deadline, size cap and cancellation
//! - [`parser`] - RSS 2.0 / Atom 1.0 into [`FeedInfo`](crate::storage::FeedInfo)
//!   or a list of [`FeedItem`]s
//! - [`discovery`] - locating a feed from an arbitrary page URL
//!
//! # Example
//!
//! ```ignore
//! use feedbot::feed::{discover_feed, parse_feed, Fetcher};
//!
//! let fetcher = Fetcher::new()?;
//! let found = discover_feed(&fetcher, "https://blog.example/post", &shutdown).await?;
//! let body = fetcher.fetch(&found.feed_url, &shutdown).await?;
//! let newest = parse_feed(&body.body)?.items.into_iter().next();
//! ```

pub mod discovery;
pub mod fetcher;
pub mod parser;
mod xml;

pub use discovery::{candidate_urls, discover_feed, DiscoveredFeed, DiscoveryError};
pub use fetcher::{FetchError, FetchedBody, Fetcher, USER_AGENT};
pub use parser::{parse_feed, parse_feed_info, Dialect, FeedItem, ParseError, ParsedFeed};
