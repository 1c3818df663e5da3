//! Discord REST client: guild scheduled events in, feed embeds out.

use std::time::Duration;

use async_trait::async_trait;
use donna_core::PlatformEvent;
use serde::Serialize;
use tracing::{debug, info};
use url::Url;

use crate::{error_for_status, AdapterError, ChatPlatform, FeedPost};

pub const DISCORD_API_BASE: &str = "https://discord.com/api/v10";

const EMBED_COLOR: u32 = 0x5865F2;
const EMBED_TITLE_LIMIT: usize = 256;
const EMBED_DESCRIPTION_LIMIT: usize = 300;
const FOOTER_SEPARATOR: &str = " \u{2022} ";
const FOOTER_DATE_FORMAT: &str = "%b %-d, %Y";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedFooter {
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbedAuthor {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Embed {
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub color: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub footer: Option<EmbedFooter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub author: Option<EmbedAuthor>,
}

#[derive(Debug, Serialize)]
struct MessageBody<'a> {
    embeds: [&'a Embed; 1],
}

/// Cut `text` to at most `limit` characters, marking the cut with `...`.
fn truncate(text: &str, limit: usize) -> String {
    if text.chars().count() <= limit {
        return text.to_string();
    }
    let kept: String = text.chars().take(limit.saturating_sub(3)).collect();
    format!("{kept}...")
}

fn link_host(link: &str) -> Option<String> {
    if link.is_empty() {
        return None;
    }
    Some(
        Url::parse(link)
            .ok()
            .and_then(|u| u.host_str().map(ToString::to_string))
            .unwrap_or_else(|| link.to_string()),
    )
}

pub fn render_embed(post: &FeedPost) -> Embed {
    let entry = &post.entry;

    let mut footer_parts = Vec::new();
    if let Some(source) = post
        .feed_title
        .clone()
        .filter(|t| !t.trim().is_empty())
        .or_else(|| link_host(&entry.link))
    {
        footer_parts.push(source);
    }
    if let Some(published_at) = entry.published_at {
        footer_parts.push(published_at.format(FOOTER_DATE_FORMAT).to_string());
    }

    Embed {
        title: truncate(&entry.title, EMBED_TITLE_LIMIT),
        url: (!entry.link.is_empty()).then(|| entry.link.clone()),
        color: EMBED_COLOR,
        description: entry
            .summary
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| truncate(s, EMBED_DESCRIPTION_LIMIT)),
        footer: (!footer_parts.is_empty()).then(|| EmbedFooter {
            text: footer_parts.join(FOOTER_SEPARATOR),
        }),
        author: entry.author.clone().map(|name| EmbedAuthor { name }),
    }
}

#[derive(Debug, Clone)]
pub struct DiscordClient {
    http: reqwest::Client,
    token: String,
    api_base: Url,
}

impl DiscordClient {
    pub fn new(token: impl Into<String>) -> Result<Self, AdapterError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()?;
        let api_base = Url::parse(DISCORD_API_BASE)
            .map_err(|e| AdapterError::Message(format!("invalid discord api base: {e}")))?;
        Ok(Self {
            http,
            token: token.into(),
            api_base,
        })
    }

    pub fn with_api_base(mut self, base: &str) -> Result<Self, AdapterError> {
        self.api_base =
            Url::parse(base).map_err(|e| AdapterError::Message(format!("invalid discord api base {base}: {e}")))?;
        Ok(self)
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url, AdapterError> {
        let mut url = self.api_base.clone();
        url.path_segments_mut()
            .map_err(|_| AdapterError::Message(format!("discord api base {} cannot hold a path", self.api_base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn authorization(&self) -> String {
        format!("Bot {}", self.token)
    }
}

#[async_trait]
impl ChatPlatform for DiscordClient {
    async fn list_events(&self, guild_id: &str) -> Result<Vec<PlatformEvent>, AdapterError> {
        let resp = self
            .http
            .get(self.endpoint(&["guilds", guild_id, "scheduled-events"])?)
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .send()
            .await?;
        let events: Vec<PlatformEvent> = error_for_status(resp, &format!("guild {guild_id}"))
            .await?
            .json()
            .await?;
        debug!(%guild_id, count = events.len(), "fetched guild scheduled events");
        Ok(events)
    }

    async fn post(&self, channel_id: &str, post: &FeedPost) -> Result<(), AdapterError> {
        let embed = render_embed(post);
        let resp = self
            .http
            .post(self.endpoint(&["channels", channel_id, "messages"])?)
            .header(reqwest::header::AUTHORIZATION, self.authorization())
            .json(&MessageBody { embeds: [&embed] })
            .send()
            .await?;
        error_for_status(resp, &format!("channel {channel_id}")).await?;
        info!(%channel_id, title = %embed.title, "posted feed entry");
        Ok(())
    }
}
