//! One-shot cache rebuild: reads the ledger, rewrites the derived cache,
//! prints the report and exits. Useful after a cache flush or an outage.

use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use yield_router_backend::{
    config::Config,
    db::Database,
    services::{RedisAggregateCache, ReconciliationJob},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "yield_router_backend=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let db = Database::new(&config).await?;
    db.run_migrations().await?;

    let redis = redis::Client::open(config.redis_url.clone())?;
    let manager = redis::aio::ConnectionManager::new(redis).await?;
    let cache = RedisAggregateCache::new(manager, config.cache_timeout());

    let job = ReconciliationJob::from_config(Arc::new(db), Arc::new(cache), &config);
    let report = job.run_once().await?;

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}
