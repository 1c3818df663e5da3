//! Reconciliation Engine: removes orphaned and duplicate calendar events.

use std::collections::HashSet;
use std::sync::Arc;

use donna_adapters::CalendarService;
use donna_core::{extract_back_reference, PlatformEvent};
use donna_storage::MappingStore;
use serde::Serialize;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::SyncError;

/// Tally of one reconciliation pass. Calendar events without a back-reference
/// were not created by this system and are reported as `unrelated`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub deleted: usize,
    pub kept: usize,
    pub unrelated: usize,
}

pub struct ReconciliationEngine {
    calendar: Arc<dyn CalendarService>,
    mappings: Arc<dyn MappingStore>,
}

impl ReconciliationEngine {
    pub fn new(calendar: Arc<dyn CalendarService>, mappings: Arc<dyn MappingStore>) -> Self {
        Self { calendar, mappings }
    }

    /// Diff the calendar against `current` platform events and the mapping table.
    ///
    /// A listing or mapping-table failure aborts the pass; individual delete
    /// failures are logged and counted nowhere.
    pub async fn reconcile(&self, current: &[PlatformEvent]) -> Result<ReconcileReport, SyncError> {
        let run_id = Uuid::new_v4();
        let span = info_span!("reconcile", %run_id, platform_events = current.len());
        self.reconcile_inner(current).instrument(span).await
    }

    async fn reconcile_inner(&self, current: &[PlatformEvent]) -> Result<ReconcileReport, SyncError> {
        let remote = self.calendar.list().await.map_err(SyncError::Calendar)?;
        let canonical: HashSet<String> = self
            .mappings
            .list_mappings(None)
            .await?
            .into_iter()
            .map(|m| m.calendar_event_id)
            .collect();
        let active: HashSet<&str> = current
            .iter()
            .filter(|e| e.is_active())
            .map(|e| e.id.as_str())
            .collect();

        let mut report = ReconcileReport::default();
        for event in &remote {
            let Some(back_ref) = event.description.as_deref().and_then(extract_back_reference) else {
                report.unrelated += 1;
                continue;
            };

            if active.contains(back_ref.event_id.as_str()) {
                if canonical.contains(&event.id) {
                    report.kept += 1;
                    continue;
                }
                debug!(calendar_event_id = %event.id, event_id = %back_ref.event_id, "duplicate calendar event");
                if self.delete_remote(&event.id).await {
                    report.deleted += 1;
                }
            } else {
                debug!(calendar_event_id = %event.id, event_id = %back_ref.event_id, "orphaned calendar event");
                if self.delete_remote(&event.id).await {
                    report.deleted += 1;
                    if let Err(err) = self.mappings.delete_mapping(&back_ref.event_id).await {
                        warn!(event_id = %back_ref.event_id, error = %err, "failed to remove stale mapping");
                    }
                }
            }
        }

        info!(
            deleted = report.deleted,
            kept = report.kept,
            unrelated = report.unrelated,
            remote = remote.len(),
            "reconciliation finished"
        );
        Ok(report)
    }

    /// True when the event is gone afterwards, whether or not this call removed it.
    async fn delete_remote(&self, calendar_event_id: &str) -> bool {
        match self.calendar.delete(calendar_event_id).await {
            Ok(()) => true,
            Err(err) if err.is_not_found() => {
                info!(%calendar_event_id, "calendar event already deleted");
                true
            }
            Err(err) => {
                error!(%calendar_event_id, error = %err, "failed to delete calendar event");
                false
            }
        }
    }
}
