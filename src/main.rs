use clap::Parser;
use std::sync::Arc;
use tracing::{error, info};

use feedrank::store::PgStore;
use feedrank::{
    ChannelRegistry, FeedSynchronizer, FetchConfig, HttpFetcher, MetadataExtractor, Store,
    SyncConfig,
};

/// Feed aggregation service: registers channels, syncs their feeds, and keeps
/// post ranks current.
#[derive(Parser, Debug)]
#[command(name = "feedrank", version)]
struct Args {
    /// Postgres connection string.
    #[arg(long, env = "DATABASE_URL")]
    database_url: String,

    /// Feed URLs to register before syncing.
    #[arg(long = "add")]
    add: Vec<String>,

    /// Sync every channel regardless of staleness.
    #[arg(long)]
    force: bool,

    /// Divisor applied to post age in the hot rank formula.
    #[arg(long, default_value_t = 45_000.0)]
    rank_decay_seconds: f64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let pg = PgStore::connect(&args.database_url)
        .await?
        .with_decay(args.rank_decay_seconds);
    pg.migrate().await?;
    let store: Arc<dyn Store> = Arc::new(pg);
    info!("connected to database");

    let fetcher = Arc::new(HttpFetcher::new(FetchConfig::default())?);
    let extractor = Arc::new(MetadataExtractor::new(fetcher.clone()));
    let config = SyncConfig {
        rank_decay_seconds: args.rank_decay_seconds,
        ..SyncConfig::default()
    };

    let registry = ChannelRegistry::new(store.clone(), fetcher.clone(), extractor.clone());
    for url in &args.add {
        match registry.add_channel(url, true).await {
            Ok(channel) => info!(channel_id = channel.channel_id, url = %url, "channel ready"),
            Err(e) => error!(url = %url, error = %e, "could not register channel"),
        }
    }

    let sync = FeedSynchronizer::new(store.clone(), fetcher, extractor, config);
    for channel in store.list_channels().await? {
        // --force bypasses the staleness and subscriber checks entirely.
        if !args.force && !sync.should_sync(&channel, false) {
            continue;
        }
        match sync.sync_channel(channel.channel_id).await {
            Ok(Some(report)) => info!(channel_id = channel.channel_id, ?report, "synced"),
            Ok(None) => {}
            Err(e) => error!(channel_id = channel.channel_id, error = %e, "sync failed"),
        }
    }

    Ok(())
}
