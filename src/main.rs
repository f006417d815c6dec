use anyhow::Context as _;
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::EnvFilter;
use vault_cluster::api;
use vault_cluster::cache::LruCache;
use vault_cluster::config::Config;
use vault_cluster::router::{Coordinator, Forwarder};
use vault_cluster::sharding::ShardTable;
use vault_cluster::storage::{Storage, compression};

/// A single node of the sharded context vault.
#[derive(Parser, Debug)]
#[command(name = "vault-node", version, about)]
struct Args {
    /// TOML file listing every shard of the cluster.
    #[arg(long, default_value = "sharding.toml")]
    config_file: PathBuf,

    /// Name of the shard this node serves, as listed in the config file.
    #[arg(long)]
    shard: String,

    /// Path of the node's database file.
    #[arg(long)]
    db_location: PathBuf,

    #[arg(long, default_value = "127.0.0.1:8080")]
    http_addr: SocketAddr,

    /// Cache capacity in bytes.
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    cache_size: usize,

    #[arg(long, default_value_t = 10_000)]
    forward_timeout_ms: u64,

    #[arg(long, default_value_t = compression::DEFAULT_LEVEL)]
    compression_level: i32,

    /// Interval of the periodic stats log; 0 disables it.
    #[arg(long, default_value_t = 30)]
    stats_interval_secs: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = Args::parse();

    // 1. Topology:
    let config = Config::parse_file(&args.config_file)?;
    let shards = ShardTable::from_shards(&config.shards, &args.shard)
        .with_context(|| format!("invalid topology in {}", args.config_file.display()))?;

    tracing::info!(
        "Starting shard {} (index {} of {})",
        args.shard,
        shards.current_index(),
        shards.count()
    );

    // 2. Storage and cache:
    let storage = Storage::open_with_level(&args.db_location, args.compression_level)
        .with_context(|| format!("failed to open database {}", args.db_location.display()))?;

    let cache = LruCache::new(args.cache_size);

    // 3. Coordinator:
    let forwarder = Forwarder::new(
        shards.current_index(),
        Duration::from_millis(args.forward_timeout_ms),
    )?;
    let coordinator = Arc::new(Coordinator::new(shards, Arc::new(storage), cache, forwarder));

    // 4. Spawn stats reporter:
    if args.stats_interval_secs > 0 {
        let stats_coordinator = coordinator.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(args.stats_interval_secs));

            loop {
                interval.tick().await;
                match stats_coordinator.stats().await {
                    Ok(stats) => tracing::info!(
                        "Node stats: {} topics, cache {}/{} bytes in {} entries",
                        stats.topics,
                        stats.cache_bytes,
                        stats.cache_capacity,
                        stats.cache_entries
                    ),
                    Err(e) => tracing::warn!("Failed to collect stats: {}", e),
                }
            }
        });
    }

    // 5. Start HTTP server:
    let app = api::router(coordinator);

    tracing::info!("HTTP server listening on {}", args.http_addr);
    tracing::info!("Press Ctrl+C to shutdown");

    let listener = tokio::net::TcpListener::bind(args.http_addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for shutdown signal: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await?;

    tracing::info!("Shut down");
    Ok(())
}
