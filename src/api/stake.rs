use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

use crate::{
    error::Result,
    models::{ApiResponse, MatchStakeTotals, SettlementRequest},
    services::SettlementReceipt,
};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct ConfirmStakeRequest {
    pub txid: String,
    pub match_id: String,
    pub staker: String,
    /// Optional; taken from the transaction when omitted.
    pub amount: Option<i64>,
    #[serde(alias = "predicted_winner")]
    pub backed_participant: Option<String>,
}

/// POST /api/stake/confirm
pub async fn confirm_stake(
    State(state): State<AppState>,
    Json(req): Json<ConfirmStakeRequest>,
) -> Result<Json<ApiResponse<SettlementReceipt>>> {
    let request = SettlementRequest::stake(
        &req.txid,
        &req.match_id,
        &req.staker,
        req.amount,
        req.backed_participant.as_deref(),
    );
    let receipt = state.coordinator.submit(request).await?;
    Ok(Json(ApiResponse::success(receipt)))
}

/// GET /api/stake/{match_id}/totals
///
/// Served from the derived cache, so it may briefly lag the ledger.
pub async fn get_totals(
    State(state): State<AppState>,
    Path(match_id): Path<String>,
) -> Result<Json<ApiResponse<Option<MatchStakeTotals>>>> {
    let totals = state.cache.match_totals(match_id.trim()).await?;
    Ok(Json(ApiResponse::success(totals)))
}
