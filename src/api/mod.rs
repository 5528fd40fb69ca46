// src/api/mod.rs

pub mod admin;
pub mod health;
pub mod leaderboard;
pub mod matches;
pub mod player;
pub mod proof;
pub mod stake;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;

use crate::{
    config::Config,
    db::LedgerStore,
    services::{AggregateCache, EventBus, ReconciliationJob, SettlementCoordinator},
    websocket,
};

#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<dyn LedgerStore>,
    pub cache: Arc<dyn AggregateCache>,
    pub events: EventBus,
    pub coordinator: Arc<SettlementCoordinator>,
    pub reconciler: Arc<ReconciliationJob>,
    pub config: Config,
}

/// Every route, without the CORS and trace layers `main` adds.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        // Matches
        .route("/api/match/create", post(matches::create_match))
        .route("/api/match/join", post(matches::join_match))
        .route("/api/match/result", post(matches::submit_result))
        // Stakes
        .route("/api/stake/confirm", post(stake::confirm_stake))
        .route("/api/stake/{match_id}/totals", get(stake::get_totals))
        // Derived reads
        .route("/api/leaderboard", get(leaderboard::get_leaderboard))
        .route("/api/player/{address}", get(player::get_stats))
        .route("/api/player/{address}/stakes", get(player::get_stakes))
        // Authoritative proof lookup
        .route("/api/proof/{txid}", get(proof::get_proof))
        // Admin
        .route("/api/admin/reconcile", post(admin::reconcile))
        // WebSocket
        .route("/ws/events", get(websocket::events::handler))
        .with_state(state)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::{
        config::test_config,
        db::InMemoryLedger,
        services::{
            proof_verifier::PermissiveVerifier, CoordinatorSettings, InMemoryAggregateCache,
        },
    };

    pub struct Harness {
        pub state: AppState,
        pub ledger: Arc<InMemoryLedger>,
        pub cache: Arc<InMemoryAggregateCache>,
    }

    pub fn harness() -> Harness {
        let config = test_config();
        let ledger = Arc::new(InMemoryLedger::new());
        let cache = Arc::new(InMemoryAggregateCache::new());
        let events = EventBus::new(config.fanout_capacity);
        let coordinator = Arc::new(SettlementCoordinator::new(
            Arc::new(PermissiveVerifier),
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

        Harness {
            state: AppState {
                ledger: ledger.clone(),
                cache: cache.clone(),
                events,
                coordinator,
                reconciler,
                config,
            },
            ledger,
            cache,
        }
    }
}
