use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

/// Fallback used whenever a feed does not carry a usable title.
pub const UNTITLED_FEED: &str = "Untitled Feed";

// ============================================================================
// Error Types
// ============================================================================

/// Store errors.
///
/// `AlreadySubscribed` and `NotFound` are expected outcomes callers branch on;
/// the remaining variants are I/O failures that leave the store unchanged.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("already subscribed to this feed")]
    AlreadySubscribed,

    #[error("subscription not found")]
    NotFound,

    /// The snapshot file exists but does not contain a valid store.
    #[error("store file {path} is corrupt: {source}")]
    CorruptStore {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize store: {0}")]
    Serialize(#[source] serde_json::Error),
}

// ============================================================================
// Data Structures
// ============================================================================

/// Metadata captured from a feed when it is first subscribed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedInfo {
    pub title: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub link: String,
}

impl FeedInfo {
    /// Builds a `FeedInfo`, substituting [`UNTITLED_FEED`] for a blank title.
    pub fn new(
        title: impl Into<String>,
        description: impl Into<String>,
        link: impl Into<String>,
    ) -> Self {
        let title = title.into();
        let title = if title.trim().is_empty() {
            UNTITLED_FEED.to_owned()
        } else {
            title
        };
        Self {
            title,
            description: description.into(),
            link: link.into(),
        }
    }
}

/// A user's subscription to one feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    pub user_id: i64,
    pub chat_id: i64,
    pub feed_url: String,
    pub feed_info: FeedInfo,
    /// Time of the most recent successful poll (or of subscribing).
    #[serde(with = "rfc3339")]
    pub last_checked: DateTime<Utc>,
    /// GUID of the newest item seen; empty until the first successful poll.
    #[serde(default)]
    pub last_item_guid: String,
}

impl Subscription {
    /// A fresh subscription with no watermark. `last_checked` is restamped by
    /// [`Store::add`](super::Store::add).
    pub fn new(user_id: i64, chat_id: i64, feed_url: impl Into<String>, feed_info: FeedInfo) -> Self {
        Self {
            user_id,
            chat_id,
            feed_url: feed_url.into(),
            feed_info,
            last_checked: Utc::now(),
            last_item_guid: String::new(),
        }
    }

    /// True until the first successful poll has recorded a watermark.
    pub fn needs_baseline(&self) -> bool {
        self.last_item_guid.is_empty()
    }
}

/// Failure record for a feed URL whose latest fetch failed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedError {
    pub feed_url: String,
    pub error_count: u32,
    pub last_error: String,
    #[serde(with = "rfc3339")]
    pub last_error_at: DateTime<Utc>,
    #[serde(with = "rfc3339")]
    pub first_error_at: DateTime<Utc>,
}

/// The complete persisted state.
///
/// Serialized as `{"subscriptions": {user_id: {feed_url: ..}}, "feed_errors": {feed_url: ..}}`.
/// Integer user IDs become decimal string keys in JSON. `BTreeMap` keeps the
/// output ordering stable so identical states produce identical files.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreState {
    #[serde(default)]
    pub subscriptions: BTreeMap<i64, BTreeMap<String, Subscription>>,
    #[serde(default)]
    pub feed_errors: BTreeMap<String, FeedError>,
}

impl StoreState {
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.values().map(BTreeMap::len).sum()
    }
}

/// Timestamps are stored as RFC 3339 strings with second precision.
pub(crate) mod rfc3339 {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Secs, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
