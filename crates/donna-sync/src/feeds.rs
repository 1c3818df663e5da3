//! Feed Dedup Sync: posts unseen feed entries to chat, oldest first.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use donna_adapters::{ChatPlatform, FeedFetch, FeedPost, FeedSource};
use donna_core::FeedEntry;
use donna_storage::{FeedMetadataStore, PostedLedger};
use serde::Serialize;
use tracing::{debug, error, info, info_span, Instrument};
use uuid::Uuid;

use crate::SyncError;

/// Entries published longer ago than this are never posted.
pub const MAX_ENTRY_AGE_DAYS: i64 = 60;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FeedSyncReport {
    pub feeds_checked: usize,
    pub feeds_failed: usize,
    pub posted: usize,
}

pub struct FeedDedupSync {
    source: Arc<dyn FeedSource>,
    chat: Arc<dyn ChatPlatform>,
    ledger: Arc<dyn PostedLedger>,
    metadata: Arc<dyn FeedMetadataStore>,
    channel_id: String,
}

impl FeedDedupSync {
    pub fn new(
        source: Arc<dyn FeedSource>,
        chat: Arc<dyn ChatPlatform>,
        ledger: Arc<dyn PostedLedger>,
        metadata: Arc<dyn FeedMetadataStore>,
        channel_id: impl Into<String>,
    ) -> Self {
        Self {
            source,
            chat,
            ledger,
            metadata,
            channel_id: channel_id.into(),
        }
    }

    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    pub async fn sync_feeds(&self, feed_urls: &[String]) -> FeedSyncReport {
        self.sync_feeds_at(feed_urls, Utc::now()).await
    }

    /// One pass over `feed_urls` with the age cutoff measured from `now`.
    /// Feeds are processed one at a time; a failing feed never stops the pass.
    pub async fn sync_feeds_at(&self, feed_urls: &[String], now: DateTime<Utc>) -> FeedSyncReport {
        let run_id = Uuid::new_v4();
        let span = info_span!("feed_sync", %run_id, feeds = feed_urls.len());
        async {
            let cutoff = now - Duration::days(MAX_ENTRY_AGE_DAYS);
            let mut report = FeedSyncReport::default();
            for feed_url in feed_urls {
                report.feeds_checked += 1;
                if let Err(err) = self.sync_feed(feed_url, cutoff, &mut report.posted).await {
                    report.feeds_failed += 1;
                    error!(%feed_url, error = %err, "feed sync failed");
                }
            }
            if report.posted > 0 || report.feeds_failed > 0 {
                info!(
                    posted = report.posted,
                    failed = report.feeds_failed,
                    checked = report.feeds_checked,
                    "feed sync finished"
                );
            }
            report
        }
        .instrument(span)
        .await
    }

    async fn sync_feed(
        &self,
        feed_url: &str,
        cutoff: DateTime<Utc>,
        posted: &mut usize,
    ) -> Result<(), SyncError> {
        let validators = self.metadata.get_feed_metadata(feed_url).await?;
        let fetched = self
            .source
            .fetch(feed_url, validators.as_ref())
            .await
            .map_err(SyncError::Feed)?;

        let (feed, metadata) = match fetched {
            FeedFetch::NotModified { metadata } => {
                debug!(%feed_url, "feed not modified");
                self.metadata.put_feed_metadata(&metadata).await?;
                return Ok(());
            }
            FeedFetch::Fetched { feed, metadata } => (feed, metadata),
        };

        let mut fresh: Vec<&FeedEntry> = Vec::new();
        for entry in &feed.entries {
            if entry.id.is_empty() {
                continue;
            }
            if entry.published_at.is_some_and(|at| at < cutoff) {
                continue;
            }
            if self.ledger.is_posted(feed_url, &entry.id).await? {
                continue;
            }
            fresh.push(entry);
        }
        fresh.sort_by_key(|e| e.published_at.unwrap_or(DateTime::<Utc>::UNIX_EPOCH));

        for entry in fresh {
            self.chat
                .post(&self.channel_id, &FeedPost::new(&feed, entry))
                .await
                .map_err(SyncError::Chat)?;
            self.ledger
                .mark_posted(feed_url, &entry.id, Some(&entry.title))
                .await?;
            *posted += 1;
            info!(%feed_url, entry_id = %entry.id, title = %entry.title, "posted feed entry");
        }

        // Validators are stored only once every new entry is delivered, so an
        // interrupted feed is fetched in full next time.
        self.metadata.put_feed_metadata(&metadata).await?;
        Ok(())
    }
}
