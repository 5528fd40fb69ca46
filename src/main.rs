use axum::http::HeaderValue;
use axum::Router;
use std::{net::SocketAddr, sync::Arc};
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use yield_router_backend::{
    api::{self, AppState},
    config::Config,
    db::Database,
    services::{
        self, build_verifier, CoordinatorSettings, EventBus, RedisAggregateCache,
        ReconciliationJob, SettlementCoordinator,
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "yield_router_backend=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    let config = Config::from_env()?;
    config.validate()?;

    tracing::info!("Starting Yield Router settlement backend");
    tracing::info!("Environment: {}", config.environment);
    tracing::info!("Verification mode: {:?}", config.verification_mode);

    // Initialize database
    let db = Database::new(&config).await?;

    tracing::info!("Running database migrations...");
    db.run_migrations().await?;

    // Initialize Redis
    let redis = redis::Client::open(config.redis_url.clone())?;
    let redis_manager = redis::aio::ConnectionManager::new(redis).await?;

    let ledger = Arc::new(db);
    let cache = Arc::new(RedisAggregateCache::new(redis_manager, config.cache_timeout()));
    let events = EventBus::new(config.fanout_capacity);
    let verifier = build_verifier(&config)?;

    let coordinator = Arc::new(SettlementCoordinator::new(
        verifier,
        ledger.clone(),
        cache.clone(),
        Arc::new(events.clone()),
        CoordinatorSettings::from_config(&config),
    ));
    let reconciler = Arc::new(ReconciliationJob::from_config(
        ledger.clone(),
        cache.clone(),
        &config,
    ));

    services::start_background_services(reconciler.clone(), &config).await;

    let app_state = AppState {
        ledger,
        cache,
        events,
        coordinator,
        reconciler,
        config: config.clone(),
    };
    let app = build_router(app_state);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

fn build_router(state: AppState) -> Router {
    let cors = cors_from_config(&state.config);
    api::routes(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

fn cors_from_config(config: &Config) -> CorsLayer {
    let raw = config.cors_allowed_origins.trim();
    if raw.is_empty() || raw == "*" {
        return CorsLayer::very_permissive();
    }

    let allowed: Vec<HeaderValue> = raw
        .split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .filter_map(|s| s.parse::<HeaderValue>().ok())
        .collect();

    if allowed.is_empty() {
        tracing::warn!("No valid CORS origins parsed; falling back to permissive");
        return CorsLayer::very_permissive();
    }

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed))
        .allow_methods(Any)
        .allow_headers(Any)
}
