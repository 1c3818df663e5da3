//! SQLite persistence for event mappings and the feed ledger, plus HTTP fetch utilities.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use donna_core::{EventMapping, FeedMetadata, PostedEntry};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use tokio::fs;
use tracing::info;

mod http;

pub use http::{FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RetryPolicy};

pub const CRATE_NAME: &str = "donna-storage";

/// Durable platform-event -> calendar-event associations.
#[async_trait]
pub trait MappingStore: Send + Sync {
    /// Insert or repoint the mapping for `platform_event_id`, bumping `updated_at`.
    async fn upsert_mapping(
        &self,
        platform_event_id: &str,
        calendar_event_id: &str,
        group_id: &str,
    ) -> anyhow::Result<()>;

    async fn get_mapping(&self, platform_event_id: &str) -> anyhow::Result<Option<EventMapping>>;

    async fn delete_mapping(&self, platform_event_id: &str) -> anyhow::Result<()>;

    async fn list_mappings(&self, group_id: Option<&str>) -> anyhow::Result<Vec<EventMapping>>;
}

/// Append-only record of feed entries already delivered to chat.
#[async_trait]
pub trait PostedLedger: Send + Sync {
    async fn is_posted(&self, feed_url: &str, entry_guid: &str) -> anyhow::Result<bool>;

    /// Idempotent: a second mark for the same pair is a silent no-op.
    async fn mark_posted(
        &self,
        feed_url: &str,
        entry_guid: &str,
        entry_title: Option<&str>,
    ) -> anyhow::Result<()>;

    async fn list_posted(&self, feed_url: Option<&str>) -> anyhow::Result<Vec<PostedEntry>>;
}

/// Per-feed conditional-request validators.
#[async_trait]
pub trait FeedMetadataStore: Send + Sync {
    async fn get_feed_metadata(&self, feed_url: &str) -> anyhow::Result<Option<FeedMetadata>>;

    async fn put_feed_metadata(&self, metadata: &FeedMetadata) -> anyhow::Result<()>;
}

/// Run the embedded schema migrations against `pool`.
pub async fn run_migrations(pool: &SqlitePool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .context("running sqlite migrations")?;
    Ok(())
}

fn from_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[derive(sqlx::FromRow)]
struct MappingRow {
    platform_event_id: String,
    calendar_event_id: String,
    group_id: String,
    created_at_ms: i64,
    updated_at_ms: i64,
}

impl From<MappingRow> for EventMapping {
    fn from(r: MappingRow) -> Self {
        Self {
            platform_event_id: r.platform_event_id,
            calendar_event_id: r.calendar_event_id,
            group_id: r.group_id,
            created_at: from_millis(r.created_at_ms),
            updated_at: from_millis(r.updated_at_ms),
        }
    }
}

#[derive(sqlx::FromRow)]
struct PostedRow {
    feed_url: String,
    entry_guid: String,
    entry_title: Option<String>,
    posted_at_ms: i64,
}

impl From<PostedRow> for PostedEntry {
    fn from(r: PostedRow) -> Self {
        Self {
            feed_url: r.feed_url,
            entry_guid: r.entry_guid,
            entry_title: r.entry_title,
            posted_at: from_millis(r.posted_at_ms),
        }
    }
}

#[derive(sqlx::FromRow)]
struct FeedMetadataRow {
    feed_url: String,
    etag: Option<String>,
    last_modified: Option<String>,
}

/// Single SQLite handle backing every store trait. Constructed once at startup
/// and shared by reference with each engine.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (creating if needed) the database file at `path` and migrate it.
    pub async fn open(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating database directory {}", parent.display()))?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("opening sqlite database {}", path.display()))?;

        run_migrations(&pool).await?;
        info!(path = %path.display(), "database initialized");
        Ok(Self { pool })
    }

    /// Private in-memory database; a single pinned connection keeps it alive.
    pub async fn in_memory() -> anyhow::Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None::<Duration>)
            .max_lifetime(None::<Duration>)
            .connect("sqlite::memory:")
            .await
            .context("opening in-memory sqlite database")?;
        run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory copy of the database at `path` for dry runs: reads see the
    /// real rows, writes never reach the file. A missing file gives an empty store.
    pub async fn snapshot(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let store = Self::in_memory().await?;
        let exists = fs::try_exists(path)
            .await
            .with_context(|| format!("checking database {}", path.display()))?;
        if !exists {
            info!(path = %path.display(), "no database to snapshot; starting empty");
            return Ok(store);
        }

        // Brings an older file up to the current schema before copying.
        Self::open(path).await?.pool.close().await;

        let source = path
            .to_str()
            .with_context(|| format!("database path {} is not valid UTF-8", path.display()))?;
        let mut conn = store.pool.acquire().await.context("acquiring snapshot connection")?;
        sqlx::query("ATTACH DATABASE ? AS source")
            .bind(source)
            .execute(&mut *conn)
            .await
            .with_context(|| format!("attaching {}", path.display()))?;
        for table in ["event_mappings", "posted_entries", "feed_metadata"] {
            let copy = format!("INSERT INTO main.{table} SELECT * FROM source.{table}");
            sqlx::query(&copy)
                .execute(&mut *conn)
                .await
                .with_context(|| format!("copying {table}"))?;
        }
        sqlx::query("DETACH DATABASE source")
            .execute(&mut *conn)
            .await
            .context("detaching snapshot source")?;
        drop(conn);

        info!(path = %path.display(), "database snapshot loaded");
        Ok(store)
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl MappingStore for SqliteStore {
    async fn upsert_mapping(
        &self,
        platform_event_id: &str,
        calendar_event_id: &str,
        group_id: &str,
    ) -> anyhow::Result<()> {
        let now = Utc::now().timestamp_millis();
        sqlx::query(
            r#"INSERT INTO event_mappings (platform_event_id, calendar_event_id, group_id, created_at_ms, updated_at_ms)
               VALUES (?, ?, ?, ?, ?)
               ON CONFLICT(platform_event_id) DO UPDATE SET
                 calendar_event_id = excluded.calendar_event_id,
                 updated_at_ms = excluded.updated_at_ms"#,
        )
        .bind(platform_event_id)
        .bind(calendar_event_id)
        .bind(group_id)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .with_context(|| format!("upserting mapping for platform event {platform_event_id}"))?;
        Ok(())
    }

    async fn get_mapping(&self, platform_event_id: &str) -> anyhow::Result<Option<EventMapping>> {
        let row = sqlx::query_as::<_, MappingRow>(
            "SELECT * FROM event_mappings WHERE platform_event_id = ?",
        )
        .bind(platform_event_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading mapping for platform event {platform_event_id}"))?;
        Ok(row.map(Into::into))
    }

    async fn delete_mapping(&self, platform_event_id: &str) -> anyhow::Result<()> {
        sqlx::query("DELETE FROM event_mappings WHERE platform_event_id = ?")
            .bind(platform_event_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("deleting mapping for platform event {platform_event_id}"))?;
        Ok(())
    }

    async fn list_mappings(&self, group_id: Option<&str>) -> anyhow::Result<Vec<EventMapping>> {
        let rows = match group_id {
            Some(group_id) => {
                sqlx::query_as::<_, MappingRow>(
                    "SELECT * FROM event_mappings WHERE group_id = ? ORDER BY created_at_ms",
                )
                .bind(group_id)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, MappingRow>("SELECT * FROM event_mappings ORDER BY created_at_ms")
                    .fetch_all(&self.pool)
                    .await
            }
        }
        .context("listing event mappings")?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl PostedLedger for SqliteStore {
    async fn is_posted(&self, feed_url: &str, entry_guid: &str) -> anyhow::Result<bool> {
        let row = sqlx::query("SELECT 1 FROM posted_entries WHERE feed_url = ? AND entry_guid = ?")
            .bind(feed_url)
            .bind(entry_guid)
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("checking ledger for {feed_url} / {entry_guid}"))?;
        Ok(row.is_some())
    }

    async fn mark_posted(
        &self,
        feed_url: &str,
        entry_guid: &str,
        entry_title: Option<&str>,
    ) -> anyhow::Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO posted_entries (feed_url, entry_guid, entry_title, posted_at_ms)
             VALUES (?, ?, ?, ?)",
        )
        .bind(feed_url)
        .bind(entry_guid)
        .bind(entry_title)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .with_context(|| format!("recording ledger entry {feed_url} / {entry_guid}"))?;
        Ok(())
    }

    async fn list_posted(&self, feed_url: Option<&str>) -> anyhow::Result<Vec<PostedEntry>> {
        let rows = match feed_url {
            Some(feed_url) => {
                sqlx::query_as::<_, PostedRow>(
                    "SELECT feed_url, entry_guid, entry_title, posted_at_ms FROM posted_entries
                     WHERE feed_url = ? ORDER BY posted_at_ms DESC, id DESC",
                )
                .bind(feed_url)
                .fetch_all(&self.pool)
                .await
            }
            None => {
                sqlx::query_as::<_, PostedRow>(
                    "SELECT feed_url, entry_guid, entry_title, posted_at_ms FROM posted_entries
                     ORDER BY posted_at_ms DESC, id DESC",
                )
                .fetch_all(&self.pool)
                .await
            }
        }
        .context("listing ledger entries")?;
        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[async_trait]
impl FeedMetadataStore for SqliteStore {
    async fn get_feed_metadata(&self, feed_url: &str) -> anyhow::Result<Option<FeedMetadata>> {
        let row = sqlx::query_as::<_, FeedMetadataRow>(
            "SELECT feed_url, etag, last_modified FROM feed_metadata WHERE feed_url = ?",
        )
        .bind(feed_url)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("loading feed metadata for {feed_url}"))?;
        Ok(row.map(|r| FeedMetadata {
            feed_url: r.feed_url,
            etag: r.etag,
            last_modified: r.last_modified,
        }))
    }

    async fn put_feed_metadata(&self, metadata: &FeedMetadata) -> anyhow::Result<()> {
        sqlx::query(
            r#"INSERT INTO feed_metadata (feed_url, etag, last_modified, polled_at_ms)
               VALUES (?, ?, ?, ?)
               ON CONFLICT(feed_url) DO UPDATE SET
                 etag = excluded.etag,
                 last_modified = excluded.last_modified,
                 polled_at_ms = excluded.polled_at_ms"#,
        )
        .bind(&metadata.feed_url)
        .bind(&metadata.etag)
        .bind(&metadata.last_modified)
        .bind(Utc::now().timestamp_millis())
        .execute(&self.pool)
        .await
        .with_context(|| format!("storing feed metadata for {}", metadata.feed_url))?;
        Ok(())
    }
}
