use axum::{
    extract::{Query, State},
    Json,
};
use serde::Deserialize;

use crate::{
    error::Result,
    models::{ApiResponse, LeaderboardEntry},
    utils::clamp_leaderboard_limit,
};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct LeaderboardQuery {
    pub limit: Option<usize>,
}

/// GET /api/leaderboard?limit=
pub async fn get_leaderboard(
    State(state): State<AppState>,
    Query(query): Query<LeaderboardQuery>,
) -> Result<Json<ApiResponse<Vec<LeaderboardEntry>>>> {
    let limit = clamp_leaderboard_limit(query.limit);
    let entries = state.cache.top(limit).await?;
    Ok(Json(ApiResponse::success(entries)))
}
