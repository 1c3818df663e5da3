use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use donna_storage::SqliteStore;
use donna_sync::config::DEFAULT_DATABASE_PATH;
use donna_sync::{start_feed_scheduler, DonnaService, SyncConfig};
use tracing::info;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

#[derive(Debug, Parser)]
#[command(name = "donna")]
#[command(about = "Mirror guild scheduled events into Google Calendar and relay feeds to chat")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Keep calendar writes in memory instead of calling Google.
    #[arg(long, global = true)]
    dry_run: bool,

    /// Log filter used when RUST_LOG is not set.
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[arg(long, global = true)]
    json_logs: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the HTTP surface and the feed poller.
    Serve,
    /// Resync every scheduled event in the guild.
    SyncEvents,
    /// Delete orphaned and duplicate calendar events.
    Cleanup,
    Mappings {
        #[arg(long)]
        guild_id: Option<String>,
    },
    Feeds,
    RefreshFeeds,
    /// Create or upgrade the database schema.
    Migrate,
}

fn init_telemetry(cli: &Cli) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    let registry = tracing_subscriber::registry().with(filter);
    if cli.json_logs {
        registry.with(fmt::layer().json().with_target(true)).init();
    } else {
        registry.with(fmt::layer().with_target(false)).init();
    }
}

async fn service(config: &SyncConfig, dry_run: bool) -> Result<Arc<DonnaService>> {
    Ok(Arc::new(DonnaService::from_config(config, dry_run).await?))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    init_telemetry(&cli);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Migrate => migrate().await,
        command => run(command, cli.dry_run).await,
    }
}

async fn migrate() -> Result<()> {
    let path = std::env::var("DATABASE_PATH")
        .ok()
        .filter(|p| !p.trim().is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(DEFAULT_DATABASE_PATH));
    SqliteStore::open(&path).await?;
    println!("migrations applied: {}", path.display());
    Ok(())
}

async fn run(command: Commands, dry_run: bool) -> Result<()> {
    let config = SyncConfig::from_env().context("loading configuration")?;
    let service = service(&config, dry_run).await?;

    match command {
        Commands::Serve => {
            let _scheduler = start_feed_scheduler(service.clone(), &config.feed_cron()).await?;
            info!(
                guild_id = %config.discord_guild_id,
                auto_sync = !config.disable_auto_sync,
                feed_sync = service.feed_sync_enabled(),
                "donna starting"
            );
            donna_web::serve(service, config.web_port).await?;
        }
        Commands::SyncEvents => {
            let synced = service.sync_all_events().await?;
            println!("sync complete: synced={synced}");
        }
        Commands::Cleanup => {
            let report = service.cleanup().await?;
            println!(
                "cleanup complete: deleted={} kept={} unrelated={}",
                report.deleted, report.kept, report.unrelated
            );
        }
        Commands::Mappings { guild_id } => {
            let mappings = service.list_mappings(guild_id.as_deref()).await?;
            for m in &mappings {
                println!(
                    "{}\t{}\t{}\t{}",
                    m.platform_event_id,
                    m.calendar_event_id,
                    m.group_id,
                    m.updated_at.to_rfc3339()
                );
            }
            println!("{} mapping(s)", mappings.len());
        }
        Commands::Feeds => {
            for feed in service.list_feeds().await? {
                let last = feed
                    .last_posted_at
                    .map(|at| at.to_rfc3339())
                    .unwrap_or_else(|| "never".into());
                println!("{}\tposted={}\tlast={}", feed.feed_url, feed.posted_entries, last);
            }
        }
        Commands::RefreshFeeds => {
            let report = service.refresh_feeds().await?;
            println!(
                "feed refresh complete: checked={} failed={} posted={}",
                report.feeds_checked, report.feeds_failed, report.posted
            );
        }
        Commands::Migrate => migrate().await?,
    }

    Ok(())
}
