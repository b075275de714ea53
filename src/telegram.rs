//! Telegram Bot API client: the production [`ChatSink`] and the long-poll
//! loop that feeds user commands into [`Commands`].

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;

use crate::commands::{Commands, IncomingMessage};
use crate::feed::USER_AGENT;
use crate::notify::{ChatSink, OutgoingMessage, SinkError};
use crate::shutdown::Shutdown;

pub const DEFAULT_API_BASE: &str = "https://api.telegram.org";

/// Server-side wait of one `getUpdates` long poll.
const LONG_POLL_SECS: u64 = 30;
/// Deadline for ordinary API calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
/// Pause after a failed `getUpdates` before polling again.
const RETRY_DELAY: Duration = Duration::from_secs(5);

// ============================================================================
// Wire Types
// ============================================================================

#[derive(Debug, Deserialize)]
struct ApiResponse<T> {
    ok: bool,
    result: Option<T>,
    error_code: Option<i64>,
    description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Message {
    pub chat: Chat,
    #[serde(default)]
    pub from: Option<User>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct User {
    pub id: i64,
}

impl Update {
    /// The command-relevant part of a text message from a user.
    pub fn into_incoming(self) -> Option<IncomingMessage> {
        let message = self.message?;
        Some(IncomingMessage {
            chat_id: message.chat.id,
            user_id: message.from?.id,
            text: message.text?,
        })
    }
}

#[derive(Serialize)]
struct SendMessageRequest<'a> {
    chat_id: i64,
    text: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    parse_mode: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    link_preview_options: Option<LinkPreviewOptions<'a>>,
}

#[derive(Serialize)]
struct LinkPreviewOptions<'a> {
    url: &'a str,
}

#[derive(Serialize)]
struct GetUpdatesRequest {
    offset: i64,
    timeout: u64,
    allowed_updates: [&'static str; 1],
}

// ============================================================================
// Client
// ============================================================================

struct ClientInner {
    client: reqwest::Client,
    base_url: String,
    token: SecretString,
}

/// Bot API client. Cloning shares the connection pool and credential.
///
/// Transport errors are stripped of their URL before being returned, since
/// the request path embeds the bot token.
#[derive(Clone)]
pub struct TelegramClient {
    inner: Arc<ClientInner>,
}

impl std::fmt::Debug for TelegramClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramClient")
            .field("base_url", &self.inner.base_url)
            .field("token", &"[REDACTED]")
            .finish()
    }
}

impl TelegramClient {
    pub fn new(token: SecretString) -> Result<Self, SinkError> {
        Self::with_base_url(token, DEFAULT_API_BASE)
    }

    /// Points the client at another Bot API server (a local one, or a mock).
    pub fn with_base_url(token: SecretString, base_url: &str) -> Result<Self, SinkError> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| SinkError::Network(e.without_url()))?;
        Ok(Self {
            inner: Arc::new(ClientInner {
                client,
                base_url: base_url.trim_end_matches('/').to_owned(),
                token,
            }),
        })
    }

    /// Fetches pending updates at or after `offset`, waiting up to
    /// `timeout_secs` on the server for new ones.
    pub async fn get_updates(&self, offset: i64, timeout_secs: u64) -> Result<Vec<Update>, SinkError> {
        let body = GetUpdatesRequest {
            offset,
            timeout: timeout_secs,
            allowed_updates: ["message"],
        };
        let deadline = Duration::from_secs(timeout_secs) + REQUEST_TIMEOUT;
        self.call("getUpdates", &body, deadline).await
    }

    async fn call<B, T>(&self, method: &str, body: &B, timeout: Duration) -> Result<T, SinkError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!(
            "{}/bot{}/{}",
            self.inner.base_url,
            self.inner.token.expose_secret(),
            method
        );

        let response = self
            .inner
            .client
            .post(url)
            .json(body)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| SinkError::Network(e.without_url()))?;

        let status = response.status().as_u16();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| SinkError::Network(e.without_url()))?;

        let parsed: ApiResponse<T> = serde_json::from_slice(&bytes).map_err(|e| SinkError::Api {
            code: i64::from(status),
            description: format!("malformed {} response: {}", method, e),
        })?;

        match parsed {
            ApiResponse {
                ok: true,
                result: Some(result),
                ..
            } => Ok(result),
            ApiResponse {
                error_code,
                description,
                ..
            } => Err(SinkError::Api {
                code: error_code.unwrap_or(i64::from(status)),
                description: description.unwrap_or_else(|| "no description".to_owned()),
            }),
        }
    }
}

impl ChatSink for TelegramClient {
    async fn send_message(&self, message: OutgoingMessage) -> Result<(), SinkError> {
        let body = SendMessageRequest {
            chat_id: message.chat_id,
            text: &message.text,
            parse_mode: message.parse_mode.map(|m| m.as_str()),
            link_preview_options: message
                .link_preview_url
                .as_deref()
                .map(|url| LinkPreviewOptions { url }),
        };
        let _sent: serde_json::Value = self.call("sendMessage", &body, REQUEST_TIMEOUT).await?;
        Ok(())
    }
}

// ============================================================================
// Update Loop
// ============================================================================

/// Long-polls for updates and hands each text message to `commands` on its
/// own task, until `shutdown` fires. In-flight commands are awaited before
/// returning.
pub async fn run_updates<S>(client: &TelegramClient, commands: Arc<Commands<S>>, shutdown: Shutdown)
where
    S: ChatSink + 'static,
{
    tracing::info!("Listening for chat updates");

    let mut offset = 0;
    let mut tasks = JoinSet::new();

    loop {
        let result = tokio::select! {
            biased;
            _ = shutdown.triggered() => break,
            result = client.get_updates(offset, LONG_POLL_SECS) => result,
        };

        match result {
            Ok(updates) => {
                for update in updates {
                    offset = offset.max(update.update_id + 1);
                    let Some(message) = update.into_incoming() else {
                        continue;
                    };
                    tracing::debug!(chat_id = message.chat_id, user_id = message.user_id, "Received message");
                    let commands = Arc::clone(&commands);
                    tasks.spawn(async move { commands.handle(message).await });
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to get updates, retrying");
                tokio::select! {
                    biased;
                    _ = shutdown.triggered() => break,
                    _ = tokio::time::sleep(RETRY_DELAY) => {}
                }
            }
        }

        while let Some(joined) = tasks.try_join_next() {
            if let Err(e) = joined {
                tracing::error!(error = %e, "Command handler panicked");
            }
        }
    }

    while tasks.join_next().await.is_some() {}
    tracing::info!("Update loop stopped");
}
