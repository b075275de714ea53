//! User command surface: `/start`, `/help`, `/sub`, `/unsub`, `/feeds`.
//!
//! The typed operations ([`Commands::subscribe`], [`Commands::unsubscribe`],
//! [`Commands::list`]) hold the semantics; [`Commands::handle`] parses chat
//! text, enforces the allow-list and turns outcomes into replies.

use thiserror::Error;

use crate::feed::{discover_feed, DiscoveryError, Fetcher};
use crate::notify::{ChatSink, OutgoingMessage};
use crate::shutdown::Shutdown;
use crate::storage::{Store, StoreError, Subscription};
use crate::util::{truncate_title, validate_url};

const WELCOME_TEXT: &str = "Welcome to RSS Bot! 🤖\n\n\
    I can help you subscribe to RSS feeds and notify you when new posts are published.\n\n\
    Use /help to see available commands.";

const HELP_TEXT: &str = "Available commands:\n\n\
    /start - Welcome message\n\
    /help - Show this help message\n\
    /sub <url> - Subscribe to an RSS feed\n\
    /unsub <search> - Unsubscribe from a feed\n\
    /feeds - List your subscribed feeds";

const ACCESS_DENIED_TEXT: &str =
    "Sorry, this is a private bot. Access is restricted to authorized users only.";
const UNKNOWN_COMMAND_TEXT: &str = "Unknown command. Use /help to see available commands.";
const SUB_USAGE_TEXT: &str = "Please provide a URL. Usage: /sub <url>";
const UNSUB_USAGE_TEXT: &str = "Please provide a search term. Usage: /unsub <search>";
const INVALID_URL_TEXT: &str = "Please provide a valid HTTP or HTTPS URL.";
const SEARCHING_TEXT: &str = "Looking for RSS feed...";
const ALREADY_SUBSCRIBED_TEXT: &str = "You are already subscribed to this feed.";
const NO_MATCH_TEXT: &str = "No matching feeds found.";
const NO_SUBSCRIPTIONS_TEXT: &str =
    "You have no active subscriptions. Use /sub <url> to subscribe to a feed.";

/// A text message received from a chat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub chat_id: i64,
    pub user_id: i64,
    pub text: String,
}

/// Errors from [`Commands::subscribe`].
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error(transparent)]
    Discovery(#[from] DiscoveryError),
    #[error("already subscribed to this feed")]
    AlreadySubscribed,
    #[error(transparent)]
    Store(StoreError),
}

impl From<StoreError> for SubscribeError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::AlreadySubscribed => SubscribeError::AlreadySubscribed,
            other => SubscribeError::Store(other),
        }
    }
}

/// Result of an unsubscribe search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnsubscribeOutcome {
    NoMatch,
    Removed(Subscription),
    /// More than one subscription matched; titles of every match
    Ambiguous(Vec<String>),
}

/// A parsed `/command args` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command<'a> {
    Start,
    Help,
    Subscribe(&'a str),
    Unsubscribe(&'a str),
    Feeds,
    Unknown,
}

impl<'a> Command<'a> {
    /// Splits `/name[@bot] args`. Anything that is not a known command
    /// (including plain text) is `Unknown`.
    fn parse(text: &'a str) -> Self {
        let text = text.trim();
        let (head, args) = match text.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (text, ""),
        };
        let name = head.split_once('@').map_or(head, |(name, _)| name);

        match name {
            "/start" => Command::Start,
            "/help" => Command::Help,
            "/sub" => Command::Subscribe(args),
            "/unsub" => Command::Unsubscribe(args),
            "/feeds" => Command::Feeds,
            _ => Command::Unknown,
        }
    }
}

/// Drives the store and discovery on behalf of chat users.
pub struct Commands<S> {
    store: Store,
    fetcher: Fetcher,
    sink: S,
    allowed_chat_ids: Vec<i64>,
    shutdown: Shutdown,
}

impl<S: ChatSink> Commands<S> {
    pub fn new(store: Store, fetcher: Fetcher, sink: S, shutdown: Shutdown) -> Self {
        Self {
            store,
            fetcher,
            sink,
            allowed_chat_ids: Vec::new(),
            shutdown,
        }
    }

    /// Restricts the bot to `chat_ids`. An empty list allows every chat.
    pub fn with_allowed_chats(mut self, chat_ids: Vec<i64>) -> Self {
        self.allowed_chat_ids = chat_ids;
        self
    }

    pub fn is_chat_allowed(&self, chat_id: i64) -> bool {
        self.allowed_chat_ids.is_empty() || self.allowed_chat_ids.contains(&chat_id)
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Discovers the feed behind `url` and subscribes `user_id` to it.
    ///
    /// # Errors
    ///
    /// - [`SubscribeError::InvalidUrl`] unless `url` is an http(s) URL
    /// - [`SubscribeError::Discovery`] when no feed could be located
    /// - [`SubscribeError::AlreadySubscribed`] for a duplicate
    /// - [`SubscribeError::Store`] when the store could not be written
    pub async fn subscribe(
        &self,
        user_id: i64,
        chat_id: i64,
        url: &str,
    ) -> Result<Subscription, SubscribeError> {
        let validated = validate_url(url).map_err(|e| SubscribeError::InvalidUrl(e.to_string()))?;
        let found = discover_feed(&self.fetcher, validated.as_str(), &self.shutdown).await?;

        let sub = Subscription::new(user_id, chat_id, found.feed_url, found.info);
        self.store.add(sub.clone()).await?;

        tracing::info!(user_id, chat_id, feed = %sub.feed_url, "Subscribed");
        Ok(sub)
    }

    /// Removes the single subscription of `user_id` whose title or URL
    /// contains `query`, ignoring case.
    pub async fn unsubscribe(
        &self,
        user_id: i64,
        query: &str,
    ) -> Result<UnsubscribeOutcome, StoreError> {
        let needle = query.to_lowercase();
        let mut matches: Vec<Subscription> = self
            .store
            .user_subscriptions(user_id)
            .await
            .into_iter()
            .filter(|sub| {
                sub.feed_info.title.to_lowercase().contains(&needle)
                    || sub.feed_url.to_lowercase().contains(&needle)
            })
            .collect();

        match matches.len() {
            0 => Ok(UnsubscribeOutcome::NoMatch),
            1 => {
                let sub = matches.remove(0);
                self.store.remove(user_id, &sub.feed_url).await?;
                tracing::info!(user_id, feed = %sub.feed_url, "Unsubscribed");
                Ok(UnsubscribeOutcome::Removed(sub))
            }
            _ => Ok(UnsubscribeOutcome::Ambiguous(
                matches.into_iter().map(|s| s.feed_info.title).collect(),
            )),
        }
    }

    /// Subscriptions of `user_id`, in store order.
    pub async fn list(&self, user_id: i64) -> Vec<Subscription> {
        self.store.user_subscriptions(user_id).await
    }

    // ========================================================================
    // Chat Dispatch
    // ========================================================================

    /// Handles one chat message, replying in the same chat.
    pub async fn handle(&self, msg: IncomingMessage) {
        if !self.is_chat_allowed(msg.chat_id) {
            tracing::info!(chat_id = msg.chat_id, "Rejected message from unauthorized chat");
            self.reply(msg.chat_id, ACCESS_DENIED_TEXT).await;
            return;
        }

        match Command::parse(&msg.text) {
            Command::Start => self.reply(msg.chat_id, WELCOME_TEXT).await,
            Command::Help => self.reply(msg.chat_id, HELP_TEXT).await,
            Command::Subscribe(args) => self.handle_subscribe(&msg, args).await,
            Command::Unsubscribe(args) => self.handle_unsubscribe(&msg, args).await,
            Command::Feeds => self.handle_feeds(&msg).await,
            Command::Unknown => self.reply(msg.chat_id, UNKNOWN_COMMAND_TEXT).await,
        }
    }

    async fn handle_subscribe(&self, msg: &IncomingMessage, url: &str) {
        if url.is_empty() {
            return self.reply(msg.chat_id, SUB_USAGE_TEXT).await;
        }
        if validate_url(url).is_err() {
            return self.reply(msg.chat_id, INVALID_URL_TEXT).await;
        }

        self.reply(msg.chat_id, SEARCHING_TEXT).await;

        let text = match self.subscribe(msg.user_id, msg.chat_id, url).await {
            Ok(sub) => format!("✅ Subscribed to: {}", sub.feed_info.title),
            Err(SubscribeError::InvalidUrl(_)) => INVALID_URL_TEXT.to_owned(),
            Err(SubscribeError::Discovery(e)) => {
                tracing::info!(url = %url, error = %e, "Feed discovery failed");
                format!("Failed to find RSS feed: {}", e)
            }
            Err(SubscribeError::AlreadySubscribed) => ALREADY_SUBSCRIBED_TEXT.to_owned(),
            Err(SubscribeError::Store(e)) => {
                tracing::error!(error = %e, "Failed to store subscription");
                format!("Failed to subscribe: {}", e)
            }
        };
        self.reply(msg.chat_id, text).await;
    }

    async fn handle_unsubscribe(&self, msg: &IncomingMessage, query: &str) {
        if query.is_empty() {
            return self.reply(msg.chat_id, UNSUB_USAGE_TEXT).await;
        }

        let text = match self.unsubscribe(msg.user_id, query).await {
            Ok(UnsubscribeOutcome::NoMatch) => NO_MATCH_TEXT.to_owned(),
            Ok(UnsubscribeOutcome::Removed(sub)) => {
                format!("✅ Unsubscribed from: {}", sub.feed_info.title)
            }
            Ok(UnsubscribeOutcome::Ambiguous(titles)) => {
                let mut text = String::from("Multiple feeds match your search:\n\n");
                for (i, title) in titles.iter().enumerate() {
                    text.push_str(&format!("{}. {}\n", i + 1, title));
                }
                text.push_str("\nPlease be more specific.");
                text
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to remove subscription");
                format!("Failed to unsubscribe: {}", e)
            }
        };
        self.reply(msg.chat_id, text).await;
    }

    async fn handle_feeds(&self, msg: &IncomingMessage) {
        let subs = self.list(msg.user_id).await;
        if subs.is_empty() {
            return self.reply(msg.chat_id, NO_SUBSCRIPTIONS_TEXT).await;
        }

        let mut text = String::from("Your subscribed feeds:\n\n");
        for (i, sub) in subs.iter().enumerate() {
            text.push_str(&format!("{}. {}\n", i + 1, truncate_title(&sub.feed_info.title)));
        }
        self.reply(msg.chat_id, text).await;
    }

    async fn reply(&self, chat_id: i64, text: impl Into<String>) {
        if let Err(e) = self
            .sink
            .send_message(OutgoingMessage::plain(chat_id, text))
            .await
        {
            tracing::warn!(chat_id, error = %e, "Failed to send reply");
        }
    }
}
