use axum::{
    extract::{Path, State},
    Json,
};

use crate::{
    error::Result,
    models::{ApiResponse, PlayerStats, Stake},
};

use super::AppState;

/// GET /api/player/{address}
///
/// Cached stats; `null` for an identity the cache has never seen.
pub async fn get_stats(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<ApiResponse<Option<PlayerStats>>>> {
    let stats = state.cache.player_stats(address.trim()).await?;
    Ok(Json(ApiResponse::success(stats)))
}

/// GET /api/player/{address}/stakes
pub async fn get_stakes(
    State(state): State<AppState>,
    Path(address): Path<String>,
) -> Result<Json<ApiResponse<Vec<Stake>>>> {
    let stakes = state.ledger.stakes_for_staker(address.trim()).await?;
    Ok(Json(ApiResponse::success(stakes)))
}
