//! Collaborator contracts (calendar, chat, feeds) and their HTTP and in-memory implementations.

use async_trait::async_trait;
use donna_core::{
    CalendarEventPayload, FeedEntry, FeedMetadata, ParsedFeed, PlatformEvent, RemoteCalendarEvent,
};
use donna_storage::FetchError;
use reqwest::StatusCode;
use thiserror::Error;

pub mod discord;
pub mod feed;
pub mod google;
pub mod memory;

pub use discord::{render_embed, DiscordClient, Embed};
pub use feed::{load_feed_list, parse_feed, HttpFeedSource};
pub use google::{GoogleCalendarClient, ServiceAccountKey};
pub use memory::{DryRunChat, InMemoryCalendar, InMemoryChat, StaticFeedSource};

pub const CRATE_NAME: &str = "donna-adapters";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{resource} not found")]
    NotFound { resource: String },
    #[error("remote answered {status}: {body}")]
    Http { status: u16, body: String },
    #[error(transparent)]
    Request(#[from] reqwest::Error),
    #[error("authentication failed: {0}")]
    Auth(String),
    #[error("parse error: {0}")]
    Parse(String),
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl AdapterError {
    /// True when the remote says the resource is already gone (404 or 410).
    pub fn is_not_found(&self) -> bool {
        match self {
            AdapterError::NotFound { .. } => true,
            AdapterError::Http { status, .. } => *status == 404 || *status == 410,
            _ => false,
        }
    }
}

impl From<FetchError> for AdapterError {
    fn from(err: FetchError) -> Self {
        match err {
            FetchError::Request(err) => AdapterError::Request(err),
            FetchError::HttpStatus { status, url } => AdapterError::Http {
                status,
                body: format!("fetching {url}"),
            },
        }
    }
}

/// Turn a non-success response into an [`AdapterError`], keeping the body for logs.
pub(crate) async fn error_for_status(
    resp: reqwest::Response,
    resource: &str,
) -> Result<reqwest::Response, AdapterError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    if status == StatusCode::NOT_FOUND || status == StatusCode::GONE {
        return Err(AdapterError::NotFound {
            resource: resource.to_string(),
        });
    }
    let body = resp.text().await.unwrap_or_default();
    Err(AdapterError::Http {
        status: status.as_u16(),
        body,
    })
}

/// Calendar-side collaborator. Implementations never read calendar state back
/// into the platform.
#[async_trait]
pub trait CalendarService: Send + Sync {
    /// Create an event and return its calendar-assigned id.
    async fn create(&self, payload: &CalendarEventPayload) -> Result<String, AdapterError>;

    async fn update(
        &self,
        calendar_event_id: &str,
        payload: &CalendarEventPayload,
    ) -> Result<(), AdapterError>;

    /// Delete an event. An already-deleted event answers with an error for
    /// which [`AdapterError::is_not_found`] is true.
    async fn delete(&self, calendar_event_id: &str) -> Result<(), AdapterError>;

    async fn list(&self) -> Result<Vec<RemoteCalendarEvent>, AdapterError>;
}

#[async_trait]
pub trait ChatPlatform: Send + Sync {
    async fn list_events(&self, guild_id: &str) -> Result<Vec<PlatformEvent>, AdapterError>;

    async fn post(&self, channel_id: &str, post: &FeedPost) -> Result<(), AdapterError>;
}

/// Outcome of one conditional feed poll.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedFetch {
    NotModified { metadata: FeedMetadata },
    Fetched { feed: ParsedFeed, metadata: FeedMetadata },
}

impl FeedFetch {
    pub fn metadata(&self) -> &FeedMetadata {
        match self {
            FeedFetch::NotModified { metadata } | FeedFetch::Fetched { metadata, .. } => metadata,
        }
    }
}

#[async_trait]
pub trait FeedSource: Send + Sync {
    async fn fetch(
        &self,
        feed_url: &str,
        validators: Option<&FeedMetadata>,
    ) -> Result<FeedFetch, AdapterError>;
}

/// One feed entry ready to be rendered into a chat message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedPost {
    pub feed_url: String,
    pub feed_title: Option<String>,
    pub entry: FeedEntry,
}

impl FeedPost {
    pub fn new(feed: &ParsedFeed, entry: &FeedEntry) -> Self {
        Self {
            feed_url: feed.feed_url.clone(),
            feed_title: feed.feed_title.clone(),
            entry: entry.clone(),
        }
    }
}
