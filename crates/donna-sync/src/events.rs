//! Event Sync Engine: mirrors platform events into the calendar.

use std::sync::Arc;

use donna_adapters::CalendarService;
use donna_core::{build_calendar_payload, EventNotification, PlatformEvent, SyncAction};
use donna_storage::MappingStore;
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::SyncError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum SyncOutcome {
    /// Cancelled or completed events are never mirrored.
    Skipped,
    Created { calendar_event_id: String },
    Updated { calendar_event_id: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeleteOutcome {
    Unmapped,
    Deleted { calendar_event_id: String },
    AlreadyGone { calendar_event_id: String },
}

pub struct EventSyncEngine {
    calendar: Arc<dyn CalendarService>,
    mappings: Arc<dyn MappingStore>,
}

impl EventSyncEngine {
    pub fn new(calendar: Arc<dyn CalendarService>, mappings: Arc<dyn MappingStore>) -> Self {
        Self { calendar, mappings }
    }

    /// Create or update the calendar copy of `event`. `Create` always creates;
    /// `Update` falls back to creating when no mapping exists yet.
    pub async fn sync(
        &self,
        event: &PlatformEvent,
        action: SyncAction,
    ) -> Result<SyncOutcome, SyncError> {
        if !event.is_active() {
            info!(event_id = %event.id, status = ?event.status, name = %event.name, "skipping inactive event");
            return Ok(SyncOutcome::Skipped);
        }

        let payload = build_calendar_payload(event)?;
        let existing = self.mappings.get_mapping(&event.id).await?;

        match (action, existing) {
            (SyncAction::Update, Some(mapping)) => {
                self.calendar
                    .update(&mapping.calendar_event_id, &payload)
                    .await
                    .map_err(SyncError::Calendar)?;
                info!(event_id = %event.id, calendar_event_id = %mapping.calendar_event_id, "updated calendar event");
                Ok(SyncOutcome::Updated {
                    calendar_event_id: mapping.calendar_event_id,
                })
            }
            _ => {
                let calendar_event_id = self
                    .calendar
                    .create(&payload)
                    .await
                    .map_err(SyncError::Calendar)?;
                self.mappings
                    .upsert_mapping(&event.id, &calendar_event_id, &event.guild_id)
                    .await?;
                info!(event_id = %event.id, %calendar_event_id, "created mapping");
                Ok(SyncOutcome::Created { calendar_event_id })
            }
        }
    }

    /// Remove the calendar copy of a deleted platform event. Unmapped events are a no-op.
    pub async fn delete(&self, platform_event_id: &str) -> Result<DeleteOutcome, SyncError> {
        let Some(mapping) = self.mappings.get_mapping(platform_event_id).await? else {
            info!(event_id = %platform_event_id, "no mapping for deleted event");
            return Ok(DeleteOutcome::Unmapped);
        };

        let calendar_event_id = mapping.calendar_event_id;
        let outcome = match self.calendar.delete(&calendar_event_id).await {
            Ok(()) => DeleteOutcome::Deleted {
                calendar_event_id: calendar_event_id.clone(),
            },
            Err(err) if err.is_not_found() => {
                info!(%calendar_event_id, "calendar event already deleted");
                DeleteOutcome::AlreadyGone {
                    calendar_event_id: calendar_event_id.clone(),
                }
            }
            Err(err) => return Err(SyncError::Calendar(err)),
        };

        self.mappings.delete_mapping(platform_event_id).await?;
        info!(event_id = %platform_event_id, %calendar_event_id, "deleted mapping");
        Ok(outcome)
    }

    /// Sync every active event, choosing create or update from mapping presence.
    /// Per-event failures are logged and skipped. Returns the number synced.
    pub async fn bulk_sync(&self, events: &[PlatformEvent]) -> usize {
        let run_id = Uuid::new_v4();
        let span = info_span!("bulk_sync", %run_id, events = events.len());
        async {
            let mut synced = 0usize;
            for event in events.iter().filter(|e| e.is_active()) {
                // Update already falls back to create for unmapped events.
                match self.sync(event, SyncAction::Update).await {
                    Ok(_) => synced += 1,
                    Err(err) => error!(event_id = %event.id, name = %event.name, error = %err, "failed to sync event"),
                }
            }
            info!(synced, "bulk sync finished");
            synced
        }
        .instrument(span)
        .await
    }

    /// Route one lifecycle notification.
    pub async fn handle_notification(
        &self,
        notification: &EventNotification,
    ) -> Result<NotificationOutcome, SyncError> {
        let result = match notification {
            EventNotification::Created { event } => self
                .sync(event, SyncAction::Create)
                .await
                .map(NotificationOutcome::Synced),
            EventNotification::Updated { event } => self
                .sync(event, SyncAction::Update)
                .await
                .map(NotificationOutcome::Synced),
            EventNotification::Deleted { event_id } => self
                .delete(event_id)
                .await
                .map(NotificationOutcome::Deleted),
        };
        result.inspect_err(|err| warn!(error = %err, "notification handling failed"))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum NotificationOutcome {
    Synced(SyncOutcome),
    Deleted(DeleteOutcome),
    Ignored,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use donna_adapters::memory::CalendarCall;
    use donna_adapters::InMemoryCalendar;
    use donna_core::{EventStatus, RecurrenceRule};
    use donna_storage::SqliteStore;

    fn event(id: &str, name: &str) -> PlatformEvent {
        PlatformEvent {
            id: id.into(),
            guild_id: "900".into(),
            name: name.into(),
            description: None,
            status: EventStatus::Scheduled,
            scheduled_start_time: Some(Utc.with_ymd_and_hms(2026, 6, 1, 17, 0, 0).unwrap()),
            scheduled_end_time: None,
            entity_metadata: None,
            recurrence_rule: None,
        }
    }

    async fn engine() -> (EventSyncEngine, Arc<InMemoryCalendar>, Arc<SqliteStore>) {
        let calendar = Arc::new(InMemoryCalendar::new());
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        (
            EventSyncEngine::new(calendar.clone(), store.clone()),
            calendar,
            store,
        )
    }

    #[tokio::test]
    async fn create_then_update_keeps_a_single_mapping() {
        let (engine, calendar, store) = engine().await;
        let mut ev = event("1", "Launch party");

        let created = engine.sync(&ev, SyncAction::Create).await.unwrap();
        let SyncOutcome::Created { calendar_event_id } = created else {
            panic!("expected a create");
        };
        let mappings = store.list_mappings(None).await.unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].calendar_event_id, calendar_event_id);
        assert_eq!(mappings[0].group_id, "900");

        ev.name = "Launch party (moved)".into();
        let updated = engine.sync(&ev, SyncAction::Update).await.unwrap();
        assert_eq!(
            updated,
            SyncOutcome::Updated {
                calendar_event_id: calendar_event_id.clone()
            }
        );
        assert_eq!(store.list_mappings(None).await.unwrap().len(), 1);
        assert_eq!(calendar.create_count(), 1);
        assert_eq!(
            calendar.payload(&calendar_event_id).unwrap().summary,
            "Launch party (moved)"
        );
    }

    #[tokio::test]
    async fn update_without_mapping_creates() {
        let (engine, calendar, store) = engine().await;
        let outcome = engine.sync(&event("2", "Late add"), SyncAction::Update).await.unwrap();
        assert!(matches!(outcome, SyncOutcome::Created { .. }));
        assert_eq!(calendar.create_count(), 1);
        assert!(store.get_mapping("2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn terminal_events_are_skipped() {
        let (engine, calendar, store) = engine().await;
        for status in [EventStatus::Canceled, EventStatus::Completed] {
            let mut ev = event("3", "Gone");
            ev.status = status;
            assert_eq!(
                engine.sync(&ev, SyncAction::Create).await.unwrap(),
                SyncOutcome::Skipped
            );
        }
        assert!(calendar.calls().is_empty());
        assert!(store.list_mappings(None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_start_is_rejected_before_any_write() {
        let (engine, calendar, _store) = engine().await;
        let mut ev = event("4", "Someday");
        ev.scheduled_start_time = None;
        let err = engine.sync(&ev, SyncAction::Create).await.unwrap_err();
        assert!(matches!(err, SyncError::Core(_)));
        assert!(calendar.calls().is_empty());
    }

    #[tokio::test]
    async fn recurrence_reaches_the_calendar_payload() {
        let (engine, calendar, _store) = engine().await;
        let mut ev = event("5", "Weekly sync");
        let mut rule = RecurrenceRule::new(2);
        rule.by_weekday = Some(vec![0]);
        ev.recurrence_rule = Some(rule);

        let SyncOutcome::Created { calendar_event_id } =
            engine.sync(&ev, SyncAction::Create).await.unwrap()
        else {
            panic!("expected create");
        };
        assert_eq!(
            calendar.payload(&calendar_event_id).unwrap().recurrence,
            vec!["RRULE:FREQ=WEEKLY;BYDAY=MO".to_string()]
        );
    }

    #[tokio::test]
    async fn delete_is_idempotent_against_the_calendar() {
        let (engine, calendar, store) = engine().await;
        assert_eq!(engine.delete("missing").await.unwrap(), DeleteOutcome::Unmapped);

        store.upsert_mapping("6", "already-gone", "900").await.unwrap();
        assert_eq!(
            engine.delete("6").await.unwrap(),
            DeleteOutcome::AlreadyGone {
                calendar_event_id: "already-gone".into()
            }
        );
        assert!(store.get_mapping("6").await.unwrap().is_none());
        assert_eq!(
            calendar.calls(),
            vec![CalendarCall::Delete {
                calendar_event_id: "already-gone".into()
            }]
        );
    }

    #[tokio::test]
    async fn delete_failure_keeps_mapping() {
        let (engine, calendar, store) = engine().await;
        calendar.insert_remote("cal-7", "Kept", None);
        calendar.fail_deletes_for("cal-7", 503);
        store.upsert_mapping("7", "cal-7", "900").await.unwrap();

        assert!(matches!(
            engine.delete("7").await.unwrap_err(),
            SyncError::Calendar(_)
        ));
        assert!(store.get_mapping("7").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn bulk_sync_isolates_failures_and_counts_successes() {
        let (engine, calendar, store) = engine().await;
        calendar.fail_creates_for("Broken");

        let mut cancelled = event("c", "Cancelled");
        cancelled.status = EventStatus::Canceled;
        let events = vec![
            event("a", "First"),
            event("b", "Broken"),
            cancelled,
            event("d", "Last"),
        ];

        assert_eq!(engine.bulk_sync(&events).await, 2);
        assert_eq!(store.list_mappings(None).await.unwrap().len(), 2);

        // A second pass updates instead of duplicating.
        assert_eq!(engine.bulk_sync(&events).await, 2);
        assert_eq!(store.list_mappings(None).await.unwrap().len(), 2);
        assert_eq!(calendar.events().len(), 2);
    }

    #[tokio::test]
    async fn failed_update_on_resync_does_not_stop_the_batch() {
        let (engine, calendar, store) = engine().await;
        let mut events = vec![event("a", "First"), event("b", "Second"), event("c", "Third")];
        assert_eq!(engine.bulk_sync(&events).await, 3);

        let stuck = store.get_mapping("b").await.unwrap().unwrap();
        calendar.fail_updates_for(&stuck.calendar_event_id);
        for ev in &mut events {
            ev.name = format!("{} (renamed)", ev.name);
        }

        assert_eq!(engine.bulk_sync(&events).await, 2);
        assert_eq!(calendar.create_count(), 3);
        for id in ["a", "c"] {
            let mapping = store.get_mapping(id).await.unwrap().unwrap();
            assert!(calendar
                .payload(&mapping.calendar_event_id)
                .unwrap()
                .summary
                .ends_with("(renamed)"));
        }
        assert_eq!(store.get_mapping("b").await.unwrap(), Some(stuck.clone()));
        assert_eq!(
            calendar.payload(&stuck.calendar_event_id).unwrap().summary,
            "Second"
        );
    }

    #[tokio::test]
    async fn notifications_route_to_sync_and_delete() {
        let (engine, calendar, store) = engine().await;
        let created = EventNotification::Created {
            event: event("8", "Townhall"),
        };
        let outcome = engine.handle_notification(&created).await.unwrap();
        assert!(matches!(
            outcome,
            NotificationOutcome::Synced(SyncOutcome::Created { .. })
        ));

        let deleted = EventNotification::Deleted {
            event_id: "8".into(),
        };
        let outcome = engine.handle_notification(&deleted).await.unwrap();
        assert!(matches!(
            outcome,
            NotificationOutcome::Deleted(DeleteOutcome::Deleted { .. })
        ));
        assert!(calendar.events().is_empty());
        assert!(store.list_mappings(None).await.unwrap().is_empty());
    }

    #[test]
    fn outcomes_serialize_with_a_snake_case_tag() {
        let synced = NotificationOutcome::Synced(SyncOutcome::Updated {
            calendar_event_id: "cal-1".into(),
        });
        assert_eq!(
            serde_json::to_value(&synced).unwrap(),
            serde_json::json!({ "outcome": "updated", "calendar_event_id": "cal-1" })
        );
        let gone = NotificationOutcome::Deleted(DeleteOutcome::Unmapped);
        assert_eq!(
            serde_json::to_value(&gone).unwrap(),
            serde_json::json!({ "outcome": "unmapped" })
        );
    }
}
