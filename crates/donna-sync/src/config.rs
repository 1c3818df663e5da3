//! Environment-driven configuration.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use donna_storage::HttpClientConfig;
use thiserror::Error;

pub const DEFAULT_DATABASE_PATH: &str = "./data/donna.db";
pub const DEFAULT_FEEDS_PATH: &str = "./feeds.txt";
pub const DEFAULT_POLL_INTERVAL_MINUTES: u32 = 15;
pub const DEFAULT_WEB_PORT: u16 = 8000;
pub const DEFAULT_USER_AGENT: &str = "donna-bot/1.0 RSS Reader";
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 10;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error("invalid value {value:?} for {name}")]
    InvalidEnv { name: &'static str, value: String },
}

#[derive(Clone)]
pub struct SyncConfig {
    pub discord_bot_token: String,
    pub discord_guild_id: String,
    pub google_service_account_key: String,
    pub google_calendar_id: String,
    pub database_path: PathBuf,
    pub rss_channel_id: Option<String>,
    pub rss_feeds_path: PathBuf,
    pub rss_poll_interval_minutes: u32,
    pub disable_auto_sync: bool,
    pub disable_rss_sync: bool,
    pub web_port: u16,
    pub user_agent: String,
    pub http_timeout_secs: u64,
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("discord_bot_token", &"<redacted>")
            .field("discord_guild_id", &self.discord_guild_id)
            .field("google_service_account_key", &"<redacted>")
            .field("google_calendar_id", &self.google_calendar_id)
            .field("database_path", &self.database_path)
            .field("rss_channel_id", &self.rss_channel_id)
            .field("rss_feeds_path", &self.rss_feeds_path)
            .field("rss_poll_interval_minutes", &self.rss_poll_interval_minutes)
            .field("disable_auto_sync", &self.disable_auto_sync)
            .field("disable_rss_sync", &self.disable_rss_sync)
            .field("web_port", &self.web_port)
            .field("user_agent", &self.user_agent)
            .field("http_timeout_secs", &self.http_timeout_secs)
            .finish()
    }
}

fn flag(value: Option<String>) -> bool {
    value
        .map(|v| v.trim().eq_ignore_ascii_case("true") || v.trim() == "1")
        .unwrap_or(false)
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build the config from an arbitrary variable source. Empty values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |name: &str| lookup(name).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let required = |name: &'static str| get(name).ok_or(ConfigError::MissingEnv(name));

        let rss_poll_interval_minutes = match get("RSS_POLL_INTERVAL_MINUTES") {
            None => DEFAULT_POLL_INTERVAL_MINUTES,
            Some(raw) => raw
                .parse::<u32>()
                .ok()
                .filter(|m| (1..=59).contains(m))
                .ok_or(ConfigError::InvalidEnv {
                    name: "RSS_POLL_INTERVAL_MINUTES",
                    value: raw,
                })?,
        };

        let web_port = match get("DONNA_WEB_PORT") {
            None => DEFAULT_WEB_PORT,
            Some(raw) => raw.parse::<u16>().map_err(|_| ConfigError::InvalidEnv {
                name: "DONNA_WEB_PORT",
                value: raw.clone(),
            })?,
        };

        let http_timeout_secs = match get("DONNA_HTTP_TIMEOUT_SECS") {
            None => DEFAULT_HTTP_TIMEOUT_SECS,
            Some(raw) => raw
                .parse::<u64>()
                .ok()
                .filter(|s| *s > 0)
                .ok_or(ConfigError::InvalidEnv {
                    name: "DONNA_HTTP_TIMEOUT_SECS",
                    value: raw,
                })?,
        };

        Ok(Self {
            discord_bot_token: required("DISCORD_BOT_TOKEN")?,
            discord_guild_id: required("DISCORD_GUILD_ID")?,
            google_service_account_key: required("GOOGLE_SERVICE_ACCOUNT_KEY")?,
            google_calendar_id: required("GOOGLE_CALENDAR_ID")?,
            database_path: get("DATABASE_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH)),
            rss_channel_id: get("RSS_CHANNEL_ID"),
            rss_feeds_path: get("RSS_FEEDS_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from(DEFAULT_FEEDS_PATH)),
            rss_poll_interval_minutes,
            disable_auto_sync: flag(get("DISABLE_AUTO_SYNC")),
            disable_rss_sync: flag(get("DISABLE_RSS_SYNC")),
            web_port,
            user_agent: get("DONNA_USER_AGENT").unwrap_or_else(|| DEFAULT_USER_AGENT.to_string()),
            http_timeout_secs,
        })
    }

    /// Feed polling needs a target channel and must not be switched off.
    pub fn feed_sync_enabled(&self) -> bool {
        !self.disable_rss_sync && self.rss_channel_id.is_some()
    }

    /// Six-field cron expression firing every poll interval.
    pub fn feed_cron(&self) -> String {
        format!("0 */{} * * * *", self.rss_poll_interval_minutes)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}
