//! In-memory collaborators for dry runs and engine tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use donna_core::{CalendarEventPayload, FeedMetadata, ParsedFeed, PlatformEvent, RemoteCalendarEvent};
use tracing::info;

use crate::{AdapterError, CalendarService, ChatPlatform, FeedFetch, FeedPost, FeedSource};

fn locked<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn injected(status: u16, what: &str) -> AdapterError {
    AdapterError::Http {
        status,
        body: format!("injected failure for {what}"),
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalendarCall {
    Create { summary: String },
    Update { calendar_event_id: String },
    Delete { calendar_event_id: String },
    List,
}

#[derive(Debug, Default)]
struct CalendarState {
    events: BTreeMap<String, RemoteCalendarEvent>,
    payloads: HashMap<String, CalendarEventPayload>,
    next_id: u64,
    calls: Vec<CalendarCall>,
    failing_creates: HashSet<String>,
    failing_updates: HashSet<String>,
    failing_deletes: HashMap<String, u16>,
    failing_list: bool,
}

/// Calendar held in process memory. Ids are `mem-<n>`.
#[derive(Debug, Default)]
pub struct InMemoryCalendar {
    state: Mutex<CalendarState>,
}

impl InMemoryCalendar {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed an event as if it already existed remotely.
    pub fn insert_remote(&self, id: &str, summary: &str, description: Option<&str>) {
        locked(&self.state).events.insert(
            id.to_string(),
            RemoteCalendarEvent {
                id: id.to_string(),
                summary: Some(summary.to_string()),
                description: description.map(ToString::to_string),
            },
        );
    }

    pub fn events(&self) -> Vec<RemoteCalendarEvent> {
        locked(&self.state).events.values().cloned().collect()
    }

    pub fn contains(&self, id: &str) -> bool {
        locked(&self.state).events.contains_key(id)
    }

    pub fn payload(&self, id: &str) -> Option<CalendarEventPayload> {
        locked(&self.state).payloads.get(id).cloned()
    }

    pub fn calls(&self) -> Vec<CalendarCall> {
        locked(&self.state).calls.clone()
    }

    pub fn create_count(&self) -> usize {
        locked(&self.state)
            .calls
            .iter()
            .filter(|c| matches!(c, CalendarCall::Create { .. }))
            .count()
    }

    /// Creates for events with this summary answer `500`.
    pub fn fail_creates_for(&self, summary: &str) {
        locked(&self.state).failing_creates.insert(summary.to_string());
    }

    /// Updates of `calendar_event_id` answer `500` and leave the event unchanged.
    pub fn fail_updates_for(&self, calendar_event_id: &str) {
        locked(&self.state)
            .failing_updates
            .insert(calendar_event_id.to_string());
    }

    /// Deletes of `calendar_event_id` answer `status` and leave the event in place.
    pub fn fail_deletes_for(&self, calendar_event_id: &str, status: u16) {
        locked(&self.state)
            .failing_deletes
            .insert(calendar_event_id.to_string(), status);
    }

    pub fn fail_list(&self) {
        locked(&self.state).failing_list = true;
    }
}

#[async_trait]
impl CalendarService for InMemoryCalendar {
    async fn create(&self, payload: &CalendarEventPayload) -> Result<String, AdapterError> {
        let mut state = locked(&self.state);
        state.calls.push(CalendarCall::Create {
            summary: payload.summary.clone(),
        });
        if state.failing_creates.contains(&payload.summary) {
            return Err(injected(500, &payload.summary));
        }

        state.next_id += 1;
        let id = format!("mem-{}", state.next_id);
        state.events.insert(
            id.clone(),
            RemoteCalendarEvent {
                id: id.clone(),
                summary: Some(payload.summary.clone()),
                description: Some(payload.description.clone()),
            },
        );
        state.payloads.insert(id.clone(), payload.clone());
        info!(calendar_event_id = %id, summary = %payload.summary, "in-memory calendar create");
        Ok(id)
    }

    async fn update(
        &self,
        calendar_event_id: &str,
        payload: &CalendarEventPayload,
    ) -> Result<(), AdapterError> {
        let mut state = locked(&self.state);
        state.calls.push(CalendarCall::Update {
            calendar_event_id: calendar_event_id.to_string(),
        });
        if state.failing_updates.contains(calendar_event_id) {
            return Err(injected(500, calendar_event_id));
        }

        let Some(event) = state.events.get_mut(calendar_event_id) else {
            return Err(AdapterError::NotFound {
                resource: format!("calendar event {calendar_event_id}"),
            });
        };
        event.summary = Some(payload.summary.clone());
        event.description = Some(payload.description.clone());
        state
            .payloads
            .insert(calendar_event_id.to_string(), payload.clone());
        info!(%calendar_event_id, summary = %payload.summary, "in-memory calendar update");
        Ok(())
    }

    async fn delete(&self, calendar_event_id: &str) -> Result<(), AdapterError> {
        let mut state = locked(&self.state);
        state.calls.push(CalendarCall::Delete {
            calendar_event_id: calendar_event_id.to_string(),
        });
        if let Some(status) = state.failing_deletes.get(calendar_event_id).copied() {
            return Err(injected(status, calendar_event_id));
        }

        state.payloads.remove(calendar_event_id);
        match state.events.remove(calendar_event_id) {
            Some(_) => {
                info!(%calendar_event_id, "in-memory calendar delete");
                Ok(())
            }
            None => Err(AdapterError::NotFound {
                resource: format!("calendar event {calendar_event_id}"),
            }),
        }
    }

    async fn list(&self) -> Result<Vec<RemoteCalendarEvent>, AdapterError> {
        let mut state = locked(&self.state);
        state.calls.push(CalendarCall::List);
        if state.failing_list {
            return Err(injected(503, "calendar list"));
        }
        Ok(state.events.values().cloned().collect())
    }
}

#[derive(Debug, Default)]
struct ChatState {
    events: HashMap<String, Vec<PlatformEvent>>,
    posts: Vec<(String, FeedPost)>,
    failing_titles: HashSet<String>,
}

/// Chat platform stand-in: serves seeded guild events and records posts.
#[derive(Debug, Default)]
pub struct InMemoryChat {
    state: Mutex<ChatState>,
}

impl InMemoryChat {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_events(&self, guild_id: &str, events: Vec<PlatformEvent>) {
        locked(&self.state)
            .events
            .insert(guild_id.to_string(), events);
    }

    pub fn posts(&self) -> Vec<(String, FeedPost)> {
        locked(&self.state).posts.clone()
    }

    pub fn posted_ids(&self) -> Vec<String> {
        locked(&self.state)
            .posts
            .iter()
            .map(|(_, post)| post.entry.id.clone())
            .collect()
    }

    /// Posts of entries with this title answer `429`.
    pub fn fail_posts_titled(&self, title: &str) {
        locked(&self.state).failing_titles.insert(title.to_string());
    }
}

#[async_trait]
impl ChatPlatform for InMemoryChat {
    async fn list_events(&self, guild_id: &str) -> Result<Vec<PlatformEvent>, AdapterError> {
        Ok(locked(&self.state)
            .events
            .get(guild_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn post(&self, channel_id: &str, post: &FeedPost) -> Result<(), AdapterError> {
        let mut state = locked(&self.state);
        if state.failing_titles.contains(&post.entry.title) {
            return Err(injected(429, &post.entry.title));
        }
        state.posts.push((channel_id.to_string(), post.clone()));
        Ok(())
    }
}

/// Reads guild events from a real platform and keeps outgoing posts in memory.
pub struct DryRunChat {
    platform: Arc<dyn ChatPlatform>,
    held: InMemoryChat,
}

impl DryRunChat {
    pub fn new(platform: Arc<dyn ChatPlatform>) -> Self {
        Self {
            platform,
            held: InMemoryChat::new(),
        }
    }

    pub fn held_posts(&self) -> Vec<(String, FeedPost)> {
        self.held.posts()
    }
}

#[async_trait]
impl ChatPlatform for DryRunChat {
    async fn list_events(&self, guild_id: &str) -> Result<Vec<PlatformEvent>, AdapterError> {
        self.platform.list_events(guild_id).await
    }

    async fn post(&self, channel_id: &str, post: &FeedPost) -> Result<(), AdapterError> {
        info!(%channel_id, entry_id = %post.entry.id, "dry run: post held back");
        self.held.post(channel_id, post).await
    }
}

#[derive(Debug, Clone)]
enum StaticFeed {
    Parsed { feed: ParsedFeed, etag: Option<String> },
    NotModified,
    Failing,
}

#[derive(Debug, Default)]
struct FeedState {
    feeds: HashMap<String, StaticFeed>,
    fetches: Vec<(String, Option<FeedMetadata>)>,
}

/// Feed source answering from canned documents.
#[derive(Debug, Default)]
pub struct StaticFeedSource {
    state: Mutex<FeedState>,
}

impl StaticFeedSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_feed(&self, feed: ParsedFeed, etag: Option<&str>) {
        locked(&self.state).feeds.insert(
            feed.feed_url.clone(),
            StaticFeed::Parsed {
                feed,
                etag: etag.map(ToString::to_string),
            },
        );
    }

    pub fn set_not_modified(&self, feed_url: &str) {
        locked(&self.state)
            .feeds
            .insert(feed_url.to_string(), StaticFeed::NotModified);
    }

    pub fn set_failing(&self, feed_url: &str) {
        locked(&self.state)
            .feeds
            .insert(feed_url.to_string(), StaticFeed::Failing);
    }

    /// Every fetch so far with the validators it carried.
    pub fn fetches(&self) -> Vec<(String, Option<FeedMetadata>)> {
        locked(&self.state).fetches.clone()
    }
}

#[async_trait]
impl FeedSource for StaticFeedSource {
    async fn fetch(
        &self,
        feed_url: &str,
        validators: Option<&FeedMetadata>,
    ) -> Result<FeedFetch, AdapterError> {
        let mut state = locked(&self.state);
        state
            .fetches
            .push((feed_url.to_string(), validators.cloned()));
        let previous = validators.cloned().unwrap_or_else(|| FeedMetadata {
            feed_url: feed_url.to_string(),
            ..FeedMetadata::default()
        });

        match state.feeds.get(feed_url).cloned() {
            Some(StaticFeed::Parsed { feed, etag }) => Ok(FeedFetch::Fetched {
                feed,
                metadata: FeedMetadata {
                    feed_url: feed_url.to_string(),
                    etag: etag.or(previous.etag),
                    last_modified: previous.last_modified,
                },
            }),
            Some(StaticFeed::NotModified) => Ok(FeedFetch::NotModified { metadata: previous }),
            Some(StaticFeed::Failing) => Err(injected(502, feed_url)),
            None => Err(AdapterError::NotFound {
                resource: format!("feed {feed_url}"),
            }),
        }
    }
}
