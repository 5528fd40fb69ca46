use axum::{extract::State, Json};
use serde::Serialize;

use super::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub database: String,
    pub cache: String,
}

fn connectivity(ok: bool) -> String {
    let status = if ok { "connected" } else { "disconnected" };
    status.to_string()
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = state.ledger.ping().await;
    let cache = state.cache.ping().await;

    Json(HealthResponse {
        status: if database { "ok" } else { "degraded" }.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        database: connectivity(database),
        cache: connectivity(cache),
    })
}
