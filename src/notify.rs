//! Chat sink contract and notification rendering.
//!
//! The monitor and the command surface only ever talk to the chat platform
//! through [`ChatSink`]; the Telegram client is one implementation and
//! [`RecordingSink`] is another.

use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

use thiserror::Error;

use crate::feed::FeedItem;
use crate::storage::Subscription;
use crate::util::{escape_html, escape_html_attr, unescape_html};

/// Errors surfaced by a chat sink.
#[derive(Debug, Error)]
pub enum SinkError {
    /// The request never got a usable response
    #[error("chat request failed: {0}")]
    Network(#[from] reqwest::Error),
    /// The chat platform answered but refused the message
    #[error("chat API error {code}: {description}")]
    Api { code: i64, description: String },
}

/// Markup dialect of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseMode {
    Html,
}

impl ParseMode {
    pub fn as_str(self) -> &'static str {
        match self {
            ParseMode::Html => "HTML",
        }
    }
}

/// One message for the chat platform.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub chat_id: i64,
    pub text: String,
    /// `None` sends the text verbatim
    pub parse_mode: Option<ParseMode>,
    /// URL the platform should build its link preview from
    pub link_preview_url: Option<String>,
}

impl OutgoingMessage {
    /// A plain-text reply with no markup and no preview override.
    pub fn plain(chat_id: i64, text: impl Into<String>) -> Self {
        Self {
            chat_id,
            text: text.into(),
            parse_mode: None,
            link_preview_url: None,
        }
    }
}

/// Narrow capability to deliver a message to a chat.
pub trait ChatSink: Send + Sync {
    fn send_message(
        &self,
        message: OutgoingMessage,
    ) -> impl Future<Output = Result<(), SinkError>> + Send;
}

/// Renders the new-item notification for `sub`.
///
/// ```text
/// <b><u>{title}</u></b>
///
/// via <a href="{item.link}">{feed_title}</a> (author: {author})
/// ```
///
/// Titles are entity-decoded before being escaped so that feeds which
/// double-encode do not leak `&amp;amp;` into the chat. The anchor is dropped
/// when the item has no link, and the author suffix when it has no author.
pub fn format_notification(sub: &Subscription, item: &FeedItem) -> OutgoingMessage {
    let title = unescape_html(&item.title);
    let feed_title = unescape_html(&sub.feed_info.title);

    let mut text = format!("<b><u>{}</u></b>\n\nvia ", escape_html(&title));
    if item.link.is_empty() {
        text.push_str(&escape_html(&feed_title));
    } else {
        text.push_str(&format!(
            "<a href=\"{}\">{}</a>",
            escape_html_attr(&item.link),
            escape_html(&feed_title)
        ));
    }
    if !item.author.is_empty() {
        text.push_str(&format!(" (author: {})", escape_html(&item.author)));
    }

    OutgoingMessage {
        chat_id: sub.chat_id,
        text,
        parse_mode: Some(ParseMode::Html),
        link_preview_url: (!item.link.is_empty()).then(|| item.link.clone()),
    }
}

/// A sink that keeps every message in memory instead of sending it.
///
/// Clones share the same log. A sink built with [`RecordingSink::failing`]
/// records nothing and rejects every message.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    sent: Arc<Mutex<Vec<OutgoingMessage>>>,
    fail: bool,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Messages delivered so far, oldest first.
    pub fn messages(&self) -> Vec<OutgoingMessage> {
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Drains the log.
    pub fn take(&self) -> Vec<OutgoingMessage> {
        std::mem::take(&mut *self.sent.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ChatSink for RecordingSink {
    async fn send_message(&self, message: OutgoingMessage) -> Result<(), SinkError> {
        if self.fail {
            return Err(SinkError::Api {
                code: 503,
                description: "sink unavailable".to_owned(),
            });
        }
        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(message);
        Ok(())
    }
}
