//! Runtime configuration parsed from environment variables.
//!
//! Every knob has a `DEFAULT_*` constant; unparsable values fall back to the
//! default rather than failing startup. Only the URLs are validated, since a
//! bad URL would otherwise surface much later as an opaque transport error.

use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://127.0.0.1:3000";
pub const DEFAULT_STORAGE_PATH: &str = ".booking/preferences.json";
pub const DEFAULT_RECONNECT_BASE_MS: u64 = 1_000;
pub const DEFAULT_RECONNECT_MAX_MS: u64 = 30_000;
pub const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_RECONNECT_JITTER: f64 = 0.2;
pub const DEFAULT_BOT_REPLY_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_BOT_MAX_MESSAGE_CHARS: usize = 2_000;
pub const DEFAULT_TOAST_DURATION_MS: u64 = 4_000;
pub const DEFAULT_MAX_TOASTS: usize = 5;
pub const DEFAULT_SUPPORTED_LANGUAGES: &str = "en,es";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 15;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid URL in {var}: {value}")]
    InvalidUrl { var: &'static str, value: String },
}

/// Reconnect backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    pub base: Duration,
    pub max: Duration,
    /// Number of failed retries tolerated before the connection is declared lost.
    pub max_attempts: u32,
    /// Relative jitter applied to each delay, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_millis(DEFAULT_RECONNECT_BASE_MS),
            max: Duration::from_millis(DEFAULT_RECONNECT_MAX_MS),
            max_attempts: DEFAULT_RECONNECT_MAX_ATTEMPTS,
            jitter: DEFAULT_RECONNECT_JITTER,
        }
    }
}

/// Bot conversation limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConversationConfig {
    pub reply_timeout: Duration,
    pub max_message_chars: usize,
}

impl Default for ConversationConfig {
    fn default() -> Self {
        Self {
            reply_timeout: Duration::from_secs(DEFAULT_BOT_REPLY_TIMEOUT_SECS),
            max_message_chars: DEFAULT_BOT_MAX_MESSAGE_CHARS,
        }
    }
}

/// Toast queue behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyConfig {
    pub toast_duration: Duration,
    pub max_toasts: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self { toast_duration: Duration::from_millis(DEFAULT_TOAST_DURATION_MS), max_toasts: DEFAULT_MAX_TOASTS }
    }
}

/// Which path a chat prompt takes to the bot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum BotChannel {
    /// `bot:message` over the realtime connection.
    #[default]
    Realtime,
    /// `POST /api/chatbot`.
    Http,
}

impl BotChannel {
    fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "realtime" | "ws" => Some(Self::Realtime),
            "http" => Some(Self::Http),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// Base URL of the HTTP API, without trailing slash.
    pub api_url: String,
    /// Realtime endpoint. Derived from `api_url` when not set.
    pub ws_url: String,
    pub storage_path: PathBuf,
    pub http_timeout: Duration,
    pub backoff: BackoffConfig,
    pub conversation: ConversationConfig,
    pub notify: NotifyConfig,
    pub bot_channel: BotChannel,
    /// Accepted language codes; the first entry is the fallback.
    pub supported_languages: Vec<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_owned(),
            ws_url: derive_ws_url(DEFAULT_API_URL),
            storage_path: PathBuf::from(DEFAULT_STORAGE_PATH),
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            backoff: BackoffConfig::default(),
            conversation: ConversationConfig::default(),
            notify: NotifyConfig::default(),
            bot_channel: BotChannel::default(),
            supported_languages: parse_languages(DEFAULT_SUPPORTED_LANGUAGES),
        }
    }
}

impl RuntimeConfig {
    /// Build typed runtime config from environment variables.
    ///
    /// Optional:
    /// - `BOOKING_API_URL`: default `http://127.0.0.1:3000`
    /// - `BOOKING_WS_URL`: default `ws(s)://<api host>/api/ws`
    /// - `BOOKING_STORAGE_PATH`: preference file, default `.booking/preferences.json`
    /// - `HTTP_TIMEOUT_SECS`: default 15
    /// - `RECONNECT_BASE_MS` / `RECONNECT_MAX_MS`: default 1000 / 30000
    /// - `RECONNECT_MAX_ATTEMPTS`: default 10
    /// - `RECONNECT_JITTER`: default 0.2
    /// - `BOT_REPLY_TIMEOUT_SECS`: default 30
    /// - `BOT_MAX_MESSAGE_CHARS`: default 2000
    /// - `BOT_CHANNEL`: `realtime` or `http`, default `realtime`
    /// - `TOAST_DURATION_MS` / `MAX_TOASTS`: default 4000 / 5
    /// - `SUPPORTED_LANGUAGES`: comma separated, default `en,es`
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidUrl`] if a URL variable is not http(s)/ws(s).
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url = std::env::var("BOOKING_API_URL")
            .unwrap_or_else(|_| DEFAULT_API_URL.to_owned())
            .trim_end_matches('/')
            .to_owned();
        if !is_http_url(&api_url) {
            return Err(ConfigError::InvalidUrl { var: "BOOKING_API_URL", value: api_url });
        }

        let ws_url = match std::env::var("BOOKING_WS_URL") {
            Ok(url) if is_ws_url(&url) => url,
            Ok(url) => return Err(ConfigError::InvalidUrl { var: "BOOKING_WS_URL", value: url }),
            Err(_) => derive_ws_url(&api_url),
        };

        let storage_path = std::env::var("BOOKING_STORAGE_PATH")
            .map_or_else(|_| PathBuf::from(DEFAULT_STORAGE_PATH), PathBuf::from);

        let backoff = BackoffConfig {
            base: Duration::from_millis(env_parse("RECONNECT_BASE_MS", DEFAULT_RECONNECT_BASE_MS)),
            max: Duration::from_millis(env_parse("RECONNECT_MAX_MS", DEFAULT_RECONNECT_MAX_MS)),
            max_attempts: env_parse("RECONNECT_MAX_ATTEMPTS", DEFAULT_RECONNECT_MAX_ATTEMPTS),
            jitter: env_parse("RECONNECT_JITTER", DEFAULT_RECONNECT_JITTER).clamp(0.0, 1.0),
        };

        let conversation = ConversationConfig {
            reply_timeout: Duration::from_secs(env_parse("BOT_REPLY_TIMEOUT_SECS", DEFAULT_BOT_REPLY_TIMEOUT_SECS)),
            max_message_chars: env_parse("BOT_MAX_MESSAGE_CHARS", DEFAULT_BOT_MAX_MESSAGE_CHARS),
        };

        let notify = NotifyConfig {
            toast_duration: Duration::from_millis(env_parse("TOAST_DURATION_MS", DEFAULT_TOAST_DURATION_MS)),
            max_toasts: env_parse("MAX_TOASTS", DEFAULT_MAX_TOASTS).max(1),
        };

        let bot_channel = std::env::var("BOT_CHANNEL")
            .ok()
            .and_then(|raw| BotChannel::parse(&raw))
            .unwrap_or_default();

        let mut supported_languages =
            parse_languages(&std::env::var("SUPPORTED_LANGUAGES").unwrap_or_else(|_| DEFAULT_SUPPORTED_LANGUAGES.into()));
        if supported_languages.is_empty() {
            supported_languages = parse_languages(DEFAULT_SUPPORTED_LANGUAGES);
        }

        Ok(Self {
            api_url,
            ws_url,
            storage_path,
            http_timeout: Duration::from_secs(env_parse("HTTP_TIMEOUT_SECS", DEFAULT_HTTP_TIMEOUT_SECS)),
            backoff,
            conversation,
            notify,
            bot_channel,
            supported_languages,
        })
    }
}

pub(crate) fn env_parse<T>(key: &str, default: T) -> T
where
    T: std::str::FromStr + Copy,
{
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .unwrap_or(default)
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

fn is_ws_url(url: &str) -> bool {
    url.starts_with("ws://") || url.starts_with("wss://")
}

/// `https://host` becomes `wss://host/api/ws`, `http://host` becomes `ws://host/api/ws`.
pub(crate) fn derive_ws_url(api_url: &str) -> String {
    let base = api_url.trim_end_matches('/');
    if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}/api/ws")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}/api/ws")
    } else {
        format!("ws://{base}/api/ws")
    }
}

pub(crate) fn parse_languages(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(|s| s.trim().to_ascii_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
#[path = "config_test.rs"]
mod tests;
