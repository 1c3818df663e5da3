//! Sync orchestration: event mirroring, reconciliation, feed dedup and the service facade.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{DateTime, Utc};
use donna_adapters::{
    load_feed_list, AdapterError, CalendarService, ChatPlatform, DiscordClient, DryRunChat, FeedSource,
    GoogleCalendarClient, HttpFeedSource, InMemoryCalendar, ServiceAccountKey,
};
use donna_core::{CoreError, EventMapping, EventNotification};
use donna_storage::{FeedMetadataStore, HttpFetcher, MappingStore, PostedLedger, SqliteStore};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};

pub mod config;
pub mod events;
pub mod feeds;
pub mod reconcile;

pub use config::{ConfigError, SyncConfig};
pub use events::{DeleteOutcome, EventSyncEngine, NotificationOutcome, SyncOutcome};
pub use feeds::{FeedDedupSync, FeedSyncReport, MAX_ENTRY_AGE_DAYS};
pub use reconcile::{ReconcileReport, ReconciliationEngine};

pub const CRATE_NAME: &str = "donna-sync";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Core(#[from] CoreError),
    #[error("calendar request failed: {0}")]
    Calendar(#[source] AdapterError),
    #[error("chat request failed: {0}")]
    Chat(#[source] AdapterError),
    #[error("feed request failed: {0}")]
    Feed(#[source] AdapterError),
    #[error("storage failure: {0:#}")]
    Store(#[from] anyhow::Error),
    #[error("{0} is already running")]
    AlreadyRunning(&'static str),
}

/// The knobs [`DonnaService`] needs from [`SyncConfig`].
#[derive(Debug, Clone)]
pub struct ServiceSettings {
    pub guild_id: String,
    pub feeds_path: PathBuf,
    pub auto_sync: bool,
    /// `None` disables feed sync entirely.
    pub feed_channel_id: Option<String>,
}

impl ServiceSettings {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            guild_id: config.discord_guild_id.clone(),
            feeds_path: config.rss_feeds_path.clone(),
            auto_sync: !config.disable_auto_sync,
            feed_channel_id: config
                .feed_sync_enabled()
                .then(|| config.rss_channel_id.clone())
                .flatten(),
        }
    }
}

/// Per-feed delivery summary for the feed listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FeedStatus {
    pub feed_url: String,
    pub posted_entries: usize,
    pub last_posted_at: Option<DateTime<Utc>>,
}

/// Every administrative and notification operation, with run-in-progress guards.
///
/// Event-side work (notifications, full resync, reconciliation) shares one lock
/// and feed sync has its own. Manual and timer triggers refuse to start while
/// the same kind of run is active; notifications wait their turn.
pub struct DonnaService {
    settings: ServiceSettings,
    chat: Arc<dyn ChatPlatform>,
    mappings: Arc<dyn MappingStore>,
    ledger: Arc<dyn PostedLedger>,
    events: EventSyncEngine,
    reconciler: ReconciliationEngine,
    feeds: Option<FeedDedupSync>,
    event_lock: Mutex<()>,
    feed_lock: Mutex<()>,
}

impl DonnaService {
    pub fn new<S>(
        settings: ServiceSettings,
        calendar: Arc<dyn CalendarService>,
        chat: Arc<dyn ChatPlatform>,
        feed_source: Arc<dyn FeedSource>,
        store: Arc<S>,
    ) -> Self
    where
        S: MappingStore + PostedLedger + FeedMetadataStore + 'static,
    {
        let mappings: Arc<dyn MappingStore> = store.clone();
        let ledger: Arc<dyn PostedLedger> = store.clone();
        let metadata: Arc<dyn FeedMetadataStore> = store;
        let feeds = settings.feed_channel_id.as_ref().map(|channel_id| {
            FeedDedupSync::new(
                feed_source,
                chat.clone(),
                ledger.clone(),
                metadata,
                channel_id.clone(),
            )
        });

        Self {
            events: EventSyncEngine::new(calendar.clone(), mappings.clone()),
            reconciler: ReconciliationEngine::new(calendar, mappings.clone()),
            settings,
            chat,
            mappings,
            ledger,
            feeds,
            event_lock: Mutex::new(()),
            feed_lock: Mutex::new(()),
        }
    }

    /// Wire the real collaborators from configuration. With `dry_run` the
    /// calendar and outgoing chat posts are held in memory and the database is
    /// an in-memory snapshot, so nothing is written to Google, Discord or disk.
    pub async fn from_config(config: &SyncConfig, dry_run: bool) -> anyhow::Result<Self> {
        let discord: Arc<dyn ChatPlatform> =
            Arc::new(DiscordClient::new(config.discord_bot_token.clone())?);

        type Wiring = (SqliteStore, Arc<dyn CalendarService>, Arc<dyn ChatPlatform>);
        let (store, calendar, chat): Wiring = if dry_run {
            warn!("dry run: calendar writes, chat posts and database changes stay in memory");
            (
                SqliteStore::snapshot(&config.database_path).await?,
                Arc::new(InMemoryCalendar::new()),
                Arc::new(DryRunChat::new(discord)),
            )
        } else {
            let key = ServiceAccountKey::from_base64(&config.google_service_account_key)
                .context("decoding GOOGLE_SERVICE_ACCOUNT_KEY")?;
            (
                SqliteStore::open(&config.database_path).await?,
                Arc::new(GoogleCalendarClient::new(key, config.google_calendar_id.clone())?),
                discord,
            )
        };

        let fetcher = HttpFetcher::new(config.http_client_config())?;
        let feed_source: Arc<dyn FeedSource> = Arc::new(HttpFeedSource::new(fetcher));

        Ok(Self::new(
            ServiceSettings::from_config(config),
            calendar,
            chat,
            feed_source,
            Arc::new(store),
        ))
    }

    pub fn feed_sync_enabled(&self) -> bool {
        self.feeds.is_some()
    }

    /// Apply a lifecycle notification, or acknowledge and ignore it when auto-sync is off.
    pub async fn handle_notification(
        &self,
        notification: &EventNotification,
    ) -> Result<NotificationOutcome, SyncError> {
        if !self.settings.auto_sync {
            info!("auto sync disabled; ignoring event notification");
            return Ok(NotificationOutcome::Ignored);
        }
        let _guard = self.event_lock.lock().await;
        self.events.handle_notification(notification).await
    }

    /// Full resync of every event in the configured guild.
    pub async fn sync_all_events(&self) -> Result<usize, SyncError> {
        let _guard = self
            .event_lock
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning("event sync"))?;
        let events = self
            .chat
            .list_events(&self.settings.guild_id)
            .await
            .map_err(SyncError::Chat)?;
        Ok(self.events.bulk_sync(&events).await)
    }

    /// Reconcile the calendar against the guild's current events.
    pub async fn cleanup(&self) -> Result<ReconcileReport, SyncError> {
        let _guard = self
            .event_lock
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning("event sync"))?;
        let events = self
            .chat
            .list_events(&self.settings.guild_id)
            .await
            .map_err(SyncError::Chat)?;
        self.reconciler.reconcile(&events).await
    }

    pub async fn list_mappings(&self, guild_id: Option<&str>) -> Result<Vec<EventMapping>, SyncError> {
        Ok(self.mappings.list_mappings(guild_id).await?)
    }

    /// Configured feeds with how many entries each has delivered.
    pub async fn list_feeds(&self) -> Result<Vec<FeedStatus>, SyncError> {
        let urls = load_feed_list(&self.settings.feeds_path).await?;
        let mut statuses = Vec::with_capacity(urls.len());
        for feed_url in urls {
            let posted = self.ledger.list_posted(Some(&feed_url)).await?;
            statuses.push(FeedStatus {
                last_posted_at: posted.first().map(|p| p.posted_at),
                posted_entries: posted.len(),
                feed_url,
            });
        }
        Ok(statuses)
    }

    /// Manually triggered feed pass. Without a feed channel this is an empty report.
    pub async fn refresh_feeds(&self) -> Result<FeedSyncReport, SyncError> {
        let Some(feeds) = &self.feeds else {
            info!("feed sync disabled; nothing to refresh");
            return Ok(FeedSyncReport::default());
        };
        let _guard = self
            .feed_lock
            .try_lock()
            .map_err(|_| SyncError::AlreadyRunning("feed sync"))?;
        let urls = load_feed_list(&self.settings.feeds_path).await?;
        Ok(feeds.sync_feeds(&urls).await)
    }

    /// Timer entry point: overlapping ticks are skipped, failures only logged.
    pub async fn run_scheduled_feed_sync(&self) {
        match self.refresh_feeds().await {
            Ok(_) => {}
            Err(SyncError::AlreadyRunning(what)) => {
                info!(what, "previous feed sync still running; skipping tick");
            }
            Err(err) => warn!(error = %err, "scheduled feed sync failed"),
        }
    }
}

/// Run one feed sync right away and poll on `cron` afterwards. Returns `None`
/// when feed sync is disabled.
pub async fn start_feed_scheduler(
    service: Arc<DonnaService>,
    cron: &str,
) -> anyhow::Result<Option<JobScheduler>> {
    if !service.feed_sync_enabled() {
        info!("feed sync disabled; no poller started");
        return Ok(None);
    }

    let immediate = service.clone();
    tokio::spawn(async move { immediate.run_scheduled_feed_sync().await });

    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let service = service.clone();
        Box::pin(async move {
            service.run_scheduled_feed_sync().await;
        })
    })
    .with_context(|| format!("creating feed poll job for cron {cron}"))?;
    sched.add(job).await.context("adding feed poll job")?;
    sched.start().await.context("starting scheduler")?;
    info!(%cron, "feed poller started");
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use donna_adapters::{InMemoryChat, StaticFeedSource};
    use donna_core::{EventStatus, FeedEntry, ParsedFeed, PlatformEvent};
    use tempfile::tempdir;

    const GUILD: &str = "900";
    const FEED: &str = "https://blog.example.com/feed.xml";

    fn event(id: &str) -> PlatformEvent {
        PlatformEvent {
            id: id.into(),
            guild_id: GUILD.into(),
            name: format!("Event {id}"),
            description: Some("details".into()),
            status: EventStatus::Scheduled,
            scheduled_start_time: Some(Utc.with_ymd_and_hms(2026, 8, 1, 18, 0, 0).unwrap()),
            scheduled_end_time: None,
            entity_metadata: None,
            recurrence_rule: None,
        }
    }

    struct Harness {
        service: DonnaService,
        calendar: Arc<InMemoryCalendar>,
        chat: Arc<InMemoryChat>,
        source: Arc<StaticFeedSource>,
        store: Arc<SqliteStore>,
        _dir: tempfile::TempDir,
    }

    async fn harness(auto_sync: bool, feed_channel: Option<&str>) -> Harness {
        let dir = tempdir().expect("tempdir");
        let feeds_path = dir.path().join("feeds.txt");
        tokio::fs::write(&feeds_path, format!("# feeds\n{FEED}\n"))
            .await
            .unwrap();

        let calendar = Arc::new(InMemoryCalendar::new());
        let chat = Arc::new(InMemoryChat::new());
        let source = Arc::new(StaticFeedSource::new());
        let store = Arc::new(SqliteStore::in_memory().await.unwrap());
        let settings = ServiceSettings {
            guild_id: GUILD.into(),
            feeds_path,
            auto_sync,
            feed_channel_id: feed_channel.map(ToString::to_string),
        };
        let service = DonnaService::new(
            settings,
            calendar.clone(),
            chat.clone(),
            source.clone(),
            store.clone(),
        );
        Harness {
            service,
            calendar,
            chat,
            source,
            store,
            _dir: dir,
        }
    }

    #[tokio::test]
    async fn full_resync_then_cleanup_removes_deleted_events() {
        let h = harness(true, None).await;
        h.chat.set_events(GUILD, vec![event("1"), event("2")]);
        assert_eq!(h.service.sync_all_events().await.unwrap(), 2);
        assert_eq!(h.calendar.events().len(), 2);

        h.chat.set_events(GUILD, vec![event("1")]);
        let report = h.service.cleanup().await.unwrap();
        assert_eq!(report.deleted, 1);
        assert_eq!(report.kept, 1);
        let mappings = h.service.list_mappings(Some(GUILD)).await.unwrap();
        assert_eq!(mappings.len(), 1);
        assert_eq!(mappings[0].platform_event_id, "1");
    }

    #[tokio::test]
    async fn notifications_are_ignored_when_auto_sync_is_off() {
        let h = harness(false, None).await;
        let outcome = h
            .service
            .handle_notification(&EventNotification::Created { event: event("1") })
            .await
            .unwrap();
        assert_eq!(outcome, NotificationOutcome::Ignored);
        assert!(h.calendar.calls().is_empty());
    }

    #[tokio::test]
    async fn concurrent_manual_runs_are_refused() {
        let h = harness(true, None).await;
        let _held = h.service.event_lock.lock().await;
        assert!(matches!(
            h.service.sync_all_events().await,
            Err(SyncError::AlreadyRunning("event sync"))
        ));
        assert!(matches!(
            h.service.cleanup().await,
            Err(SyncError::AlreadyRunning(_))
        ));
    }

    #[tokio::test]
    async fn feed_refresh_is_a_no_op_without_a_channel() {
        let h = harness(true, None).await;
        assert!(!h.service.feed_sync_enabled());
        assert_eq!(
            h.service.refresh_feeds().await.unwrap(),
            FeedSyncReport::default()
        );
        assert!(h.source.fetches().is_empty());
    }

    #[tokio::test]
    async fn feed_refresh_posts_and_listing_reports_counts() {
        let h = harness(true, Some("rss")).await;
        h.source.insert_feed(
            ParsedFeed {
                feed_url: FEED.into(),
                feed_title: None,
                entries: vec![FeedEntry {
                    id: "e1".into(),
                    title: "Hello".into(),
                    link: "https://blog.example.com/e1".into(),
                    published_at: Some(Utc::now()),
                    summary: None,
                    author: None,
                }],
            },
            None,
        );

        let report = h.service.refresh_feeds().await.unwrap();
        assert_eq!(report.posted, 1);
        assert_eq!(h.chat.posts()[0].0, "rss");

        let feeds = h.service.list_feeds().await.unwrap();
        assert_eq!(feeds.len(), 1);
        assert_eq!(feeds[0].feed_url, FEED);
        assert_eq!(feeds[0].posted_entries, 1);
        assert!(feeds[0].last_posted_at.is_some());
        assert!(h.store.is_posted(FEED, "e1").await.unwrap());

        let _held = h.service.feed_lock.lock().await;
        assert!(matches!(
            h.service.refresh_feeds().await,
            Err(SyncError::AlreadyRunning("feed sync"))
        ));
    }

    #[test]
    fn settings_only_enable_feeds_with_a_channel() {
        let lookup = |name: &str| match name {
            "DISCORD_BOT_TOKEN" => Some("t".to_string()),
            "DISCORD_GUILD_ID" => Some(GUILD.to_string()),
            "GOOGLE_SERVICE_ACCOUNT_KEY" => Some("e30=".to_string()),
            "GOOGLE_CALENDAR_ID" => Some("cal".to_string()),
            "RSS_CHANNEL_ID" => Some("rss".to_string()),
            "DISABLE_AUTO_SYNC" => Some("true".to_string()),
            _ => None,
        };
        let settings = ServiceSettings::from_config(&SyncConfig::from_lookup(lookup).unwrap());
        assert_eq!(settings.feed_channel_id.as_deref(), Some("rss"));
        assert!(!settings.auto_sync);
    }

    #[tokio::test]
    async fn dry_run_leaves_the_database_file_untouched() {
        let dir = tempdir().expect("tempdir");
        let db_path = dir.path().join("donna.db");
        let real = SqliteStore::open(&db_path).await.unwrap();
        real.upsert_mapping("1", "google-1", GUILD).await.unwrap();
        real.pool().close().await;

        let db = db_path.to_string_lossy().into_owned();
        let lookup = |name: &str| match name {
            "DISCORD_BOT_TOKEN" => Some("t".to_string()),
            "DISCORD_GUILD_ID" => Some(GUILD.to_string()),
            "GOOGLE_SERVICE_ACCOUNT_KEY" => Some("e30=".to_string()),
            "GOOGLE_CALENDAR_ID" => Some("cal".to_string()),
            "DATABASE_PATH" => Some(db.clone()),
            _ => None,
        };
        let config = SyncConfig::from_lookup(lookup).unwrap();
        let service = DonnaService::from_config(&config, true).await.unwrap();

        service
            .handle_notification(&EventNotification::Created { event: event("2") })
            .await
            .unwrap();
        service
            .handle_notification(&EventNotification::Deleted {
                event_id: "1".into(),
            })
            .await
            .unwrap();
        let seen = service.list_mappings(None).await.unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].platform_event_id, "2");
        drop(service);

        let reopened = SqliteStore::open(&db_path).await.unwrap();
        assert!(reopened.get_mapping("2").await.unwrap().is_none());
        assert_eq!(
            reopened.get_mapping("1").await.unwrap().map(|m| m.calendar_event_id),
            Some("google-1".to_string())
        );
    }
}
