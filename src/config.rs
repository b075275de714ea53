//! Runtime configuration: an optional TOML file, CLI overrides, and the
//! chat API credential from the environment.
//!
//! The config file is optional; a missing file yields `Config::default()`.
//! Unknown keys are accepted but logged, since they are usually typos.
use secrecy::SecretString;
use serde::{Deserialize, Deserializer};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable holding the Telegram bot token.
pub const API_KEY_ENV: &str = "TELEGRAM_API_KEY";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("{0} environment variable is required")]
    MissingCredential(&'static str),
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Service configuration.
///
/// All fields use `#[serde(default)]` so any subset of keys can be specified.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Path of the JSON subscription store.
    pub db_path: PathBuf,

    /// Time between feed checks, written as a duration string (`"1h"`,
    /// `"30s"`, `"1h30m"`). Must be non-zero.
    #[serde(deserialize_with = "deserialize_interval")]
    pub check_interval: Duration,

    /// Chats allowed to use the bot. Empty allows everyone.
    pub allowed_chat_ids: Vec<i64>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("db.json"),
            check_interval: Duration::from_secs(60 * 60),
            allowed_chat_ids: Vec::new(),
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    const KNOWN_KEYS: [&'static str; 3] = ["db_path", "check_interval", "allowed_chat_ids"];

    /// Load configuration from a TOML file.
    ///
    /// - Missing file → `Ok(Config::default())`
    /// - Empty file → `Ok(Config::default())`
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warning
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        // Check size before reading so a huge file cannot exhaust memory
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in raw.keys() {
                if !Self::KNOWN_KEYS.contains(&key.as_str()) {
                    tracing::warn!(key = %key, "Unknown key in config file, ignoring");
                }
            }
        }

        let config: Config = toml::from_str(&content)?;
        tracing::info!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Applies command-line values on top of the file values.
    pub fn with_overrides(
        mut self,
        db_path: Option<PathBuf>,
        check_interval: Option<Duration>,
        allowed_chat_ids: Option<Vec<i64>>,
    ) -> Self {
        if let Some(db_path) = db_path {
            self.db_path = db_path;
        }
        if let Some(interval) = check_interval {
            self.check_interval = interval;
        }
        if let Some(ids) = allowed_chat_ids {
            self.allowed_chat_ids = ids;
        }
        self
    }

    /// Rejects values the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.check_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "check_interval must be greater than zero".to_owned(),
            ));
        }
        if self.db_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid("db_path must not be empty".to_owned()));
        }
        Ok(())
    }

}

/// Parses a duration such as `"1h"`, `"45m"`, `"30s"`, `"500ms"` or `"1h30m"`.
///
/// The string is a sequence of whole numbers each followed by a unit
/// (`h`, `m`, `s`, `ms`).
pub fn parse_interval(input: &str) -> Result<Duration, String> {
    let s = input.trim();
    if s.is_empty() {
        return Err("empty duration".to_owned());
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
        if digits == 0 {
            return Err(format!("invalid duration '{input}': expected a number"));
        }
        let amount: u64 = rest[..digits]
            .parse()
            .map_err(|_| format!("invalid duration '{input}': number too large"))?;
        rest = &rest[digits..];

        let unit_len = rest.bytes().take_while(u8::is_ascii_alphabetic).count();
        let part = match &rest[..unit_len] {
            "h" => amount.checked_mul(3600).map(Duration::from_secs),
            "m" => amount.checked_mul(60).map(Duration::from_secs),
            "s" => Some(Duration::from_secs(amount)),
            "ms" => Some(Duration::from_millis(amount)),
            "" => return Err(format!("invalid duration '{input}': missing unit")),
            unit => return Err(format!("invalid duration '{input}': unknown unit '{unit}'")),
        };
        total = part
            .and_then(|p| total.checked_add(p))
            .ok_or_else(|| format!("invalid duration '{input}': too large"))?;
        rest = &rest[unit_len..];
    }
    Ok(total)
}

fn deserialize_interval<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_interval(&raw).map_err(serde::de::Error::custom)
}

/// Reads the bot token from [`API_KEY_ENV`].
pub fn api_key_from_env() -> Result<SecretString, ConfigError> {
    api_key_from(std::env::var(API_KEY_ENV).ok())
}

fn api_key_from(value: Option<String>) -> Result<SecretString, ConfigError> {
    value
        .map(|v| v.trim().to_owned())
        .filter(|v| !v.is_empty())
        .map(SecretString::from)
        .ok_or(ConfigError::MissingCredential(API_KEY_ENV))
}

// ============================================================================
// Tests
// ============================================================================
