//! Core domain model for Donna: platform events, calendar payloads, mapping and ledger rows.

use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub mod recurrence;

pub use recurrence::{to_calendar_recurrence, Frequency};

pub const CRATE_NAME: &str = "donna-core";

/// Length of a calendar event whose platform event carries no end time.
pub fn default_event_duration() -> Duration {
    Duration::hours(1)
}

const EVENT_LINK_BASE: &str = "https://discord.com/events";
const BACK_REFERENCE_LABEL: &str = "Discord Event:";

static BACK_REFERENCE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Discord Event: https://discord\.com/events/(\d+)/(\d+)")
        .expect("back-reference pattern compiles")
});

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("event {event_id} has no start time")]
    MissingStart { event_id: String },
}

/// Lifecycle state of a platform event. Unknown codes are preserved verbatim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub enum EventStatus {
    Scheduled,
    Active,
    Completed,
    Canceled,
    Unknown(u8),
}

impl EventStatus {
    /// Completed and cancelled events are never mirrored into the calendar.
    pub fn is_terminal(self) -> bool {
        matches!(self, EventStatus::Completed | EventStatus::Canceled)
    }
}

impl From<u8> for EventStatus {
    fn from(code: u8) -> Self {
        match code {
            1 => EventStatus::Scheduled,
            2 => EventStatus::Active,
            3 => EventStatus::Completed,
            4 => EventStatus::Canceled,
            other => EventStatus::Unknown(other),
        }
    }
}

impl From<EventStatus> for u8 {
    fn from(status: EventStatus) -> Self {
        match status {
            EventStatus::Scheduled => 1,
            EventStatus::Active => 2,
            EventStatus::Completed => 3,
            EventStatus::Canceled => 4,
            EventStatus::Unknown(code) => code,
        }
    }
}

/// "nth weekday of the period" marker, e.g. `{ n: 4, day: 2 }` for the 4th Wednesday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NthWeekday {
    pub n: i32,
    pub day: u8,
}

/// Platform recurrence description. Weekdays are Monday-first (0 = Monday, 6 = Sunday).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecurrenceRule {
    pub frequency: u8,
    #[serde(default)]
    pub interval: Option<u32>,
    #[serde(default)]
    pub by_weekday: Option<Vec<u8>>,
    #[serde(default)]
    pub by_n_weekday: Option<Vec<NthWeekday>>,
    #[serde(default)]
    pub by_month: Option<Vec<u32>>,
    #[serde(default)]
    pub by_month_day: Option<Vec<i32>>,
    #[serde(default)]
    pub count: Option<u32>,
    #[serde(default, rename = "end")]
    pub end_at: Option<DateTime<Utc>>,
}

impl RecurrenceRule {
    pub fn new(frequency: u8) -> Self {
        Self {
            frequency,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EntityMetadata {
    #[serde(default)]
    pub location: Option<String>,
}

/// A scheduled event as the chat platform reports it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformEvent {
    pub id: String,
    pub guild_id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub status: EventStatus,
    #[serde(default)]
    pub scheduled_start_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scheduled_end_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entity_metadata: Option<EntityMetadata>,
    #[serde(default)]
    pub recurrence_rule: Option<RecurrenceRule>,
}

impl PlatformEvent {
    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }

    pub fn location(&self) -> Option<&str> {
        self.entity_metadata
            .as_ref()
            .and_then(|m| m.location.as_deref())
            .map(str::trim)
            .filter(|loc| !loc.is_empty())
    }
}

/// Lifecycle notification relayed from the chat platform gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventNotification {
    Created { event: PlatformEvent },
    Updated { event: PlatformEvent },
    Deleted { event_id: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Create,
    Update,
}

/// Calendar write payload derived from one platform event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalendarEventPayload {
    pub summary: String,
    pub description: String,
    pub location: Option<String>,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub recurrence: Vec<String>,
}

/// Projection of a calendar event as returned by the calendar listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteCalendarEvent {
    pub id: String,
    pub summary: Option<String>,
    pub description: Option<String>,
}

/// Durable association between one platform event and one calendar event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMapping {
    pub platform_event_id: String,
    pub calendar_event_id: String,
    pub group_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ledger row: a feed entry already delivered to chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PostedEntry {
    pub feed_url: String,
    pub entry_guid: String,
    pub entry_title: Option<String>,
    pub posted_at: DateTime<Utc>,
}

/// Cache validators remembered per feed to make the next poll conditional.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FeedMetadata {
    pub feed_url: String,
    pub etag: Option<String>,
    pub last_modified: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedEntry {
    pub id: String,
    pub title: String,
    pub link: String,
    pub published_at: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub author: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedFeed {
    pub feed_url: String,
    pub feed_title: Option<String>,
    pub entries: Vec<FeedEntry>,
}

/// Machine-readable pointer back to the originating platform event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackReference {
    pub guild_id: String,
    pub event_id: String,
}

pub fn event_link(guild_id: &str, event_id: &str) -> String {
    format!("{EVENT_LINK_BASE}/{guild_id}/{event_id}")
}

/// The system-owned line embedded in every calendar description. The
/// reconciliation extractor parses exactly this shape.
pub fn back_reference_line(guild_id: &str, event_id: &str) -> String {
    format!("{BACK_REFERENCE_LABEL} {}", event_link(guild_id, event_id))
}

pub fn extract_back_reference(description: &str) -> Option<BackReference> {
    let caps = BACK_REFERENCE_RE.captures(description)?;
    Some(BackReference {
        guild_id: caps.get(1)?.as_str().to_string(),
        event_id: caps.get(2)?.as_str().to_string(),
    })
}

pub fn escape_html(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for ch in input.chars() {
        match ch {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&#39;"),
            other => out.push(other),
        }
    }
    out
}

/// Calendar descriptions are HTML: escape user text, keep line breaks, append the back-reference.
pub fn calendar_description(event: &PlatformEvent) -> String {
    let link_line = back_reference_line(&event.guild_id, &event.id);
    let body = event
        .description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty())
        .map(|d| escape_html(d).replace("\r\n", "<br>").replace('\n', "<br>"));

    match body {
        Some(body) => format!("{body}<br><br>---<br>{link_line}"),
        None => link_line,
    }
}

pub fn build_calendar_payload(event: &PlatformEvent) -> Result<CalendarEventPayload, CoreError> {
    let start = event.scheduled_start_time.ok_or_else(|| CoreError::MissingStart {
        event_id: event.id.clone(),
    })?;
    let end = event
        .scheduled_end_time
        .unwrap_or_else(|| start + default_event_duration());

    Ok(CalendarEventPayload {
        summary: event.name.clone(),
        description: calendar_description(event),
        location: event.location().map(ToString::to_string),
        start,
        end,
        recurrence: to_calendar_recurrence(event.recurrence_rule.as_ref()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample_event() -> PlatformEvent {
        PlatformEvent {
            id: "1200000000000000001".into(),
            guild_id: "900000000000000009".into(),
            name: "Community Call".into(),
            description: Some("Agenda:\n<b>updates</b> & Q&A".into()),
            status: EventStatus::Scheduled,
            scheduled_start_time: Some(Utc.with_ymd_and_hms(2026, 3, 4, 18, 0, 0).unwrap()),
            scheduled_end_time: None,
            entity_metadata: Some(EntityMetadata {
                location: Some("Main Hall".into()),
            }),
            recurrence_rule: None,
        }
    }

    #[test]
    fn payload_defaults_end_to_one_hour_after_start() {
        let payload = build_calendar_payload(&sample_event()).unwrap();
        assert_eq!(payload.end - payload.start, Duration::hours(1));
        assert_eq!(payload.location.as_deref(), Some("Main Hall"));
        assert!(payload.recurrence.is_empty());
    }

    #[test]
    fn payload_requires_start_time() {
        let mut event = sample_event();
        event.scheduled_start_time = None;
        assert_eq!(
            build_calendar_payload(&event),
            Err(CoreError::MissingStart {
                event_id: "1200000000000000001".into()
            })
        );
    }

    #[test]
    fn description_is_escaped_and_carries_back_reference() {
        let description = calendar_description(&sample_event());
        assert_eq!(
            description,
            "Agenda:<br>&lt;b&gt;updates&lt;/b&gt; &amp; Q&amp;A<br><br>---<br>\
             Discord Event: https://discord.com/events/900000000000000009/1200000000000000001"
        );
    }

    #[test]
    fn description_without_body_is_just_the_link() {
        let mut event = sample_event();
        event.description = Some("   ".into());
        assert_eq!(
            calendar_description(&event),
            "Discord Event: https://discord.com/events/900000000000000009/1200000000000000001"
        );
    }

    #[test]
    fn back_reference_round_trips_through_description() {
        let event = sample_event();
        let found = extract_back_reference(&calendar_description(&event)).unwrap();
        assert_eq!(found.guild_id, event.guild_id);
        assert_eq!(found.event_id, event.id);
    }

    #[test]
    fn back_reference_ignores_foreign_descriptions() {
        assert_eq!(extract_back_reference("Dentist, bring insurance card"), None);
        assert_eq!(
            extract_back_reference("see https://discord.com/events/1/2 for details"),
            None
        );
    }

    #[test]
    fn blank_location_is_treated_as_absent() {
        let mut event = sample_event();
        event.entity_metadata = Some(EntityMetadata {
            location: Some("  ".into()),
        });
        assert_eq!(event.location(), None);
    }

    #[test]
    fn platform_event_parses_discord_json() {
        let json = r#"{
            "id": "1",
            "guild_id": "2",
            "name": "Raid night",
            "description": null,
            "status": 4,
            "scheduled_start_time": "2026-05-01T20:00:00+00:00",
            "scheduled_end_time": null,
            "entity_metadata": null,
            "recurrence_rule": {
                "start": "2026-05-01T20:00:00+00:00",
                "end": null,
                "frequency": 2,
                "interval": 1,
                "by_weekday": [4],
                "by_n_weekday": null,
                "by_month": null,
                "by_month_day": null,
                "by_year_day": null,
                "count": null
            }
        }"#;
        let event: PlatformEvent = serde_json::from_str(json).unwrap();
        assert_eq!(event.status, EventStatus::Canceled);
        assert!(!event.is_active());
        let rule = event.recurrence_rule.unwrap();
        assert_eq!(rule.by_weekday, Some(vec![4]));
        assert_eq!(rule.end_at, None);
    }

    #[test]
    fn unknown_status_codes_are_preserved() {
        let status = EventStatus::from(9);
        assert_eq!(status, EventStatus::Unknown(9));
        assert_eq!(u8::from(status), 9);
        assert!(!status.is_terminal());
    }

    #[test]
    fn notification_uses_type_tag() {
        let json = r#"{"type":"deleted","event_id":"42"}"#;
        let notification: EventNotification = serde_json::from_str(json).unwrap();
        assert_eq!(
            notification,
            EventNotification::Deleted {
                event_id: "42".into()
            }
        );
    }
}
