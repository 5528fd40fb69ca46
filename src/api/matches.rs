use axum::{extract::State, Json};
use serde::Deserialize;

use crate::{
    error::{AppError, Result},
    models::{ApiResponse, Match, SettlementRequest},
    services::SettlementReceipt,
};

use super::AppState;

#[derive(Debug, Deserialize)]
pub struct CreateMatchRequest {
    pub match_id: String,
    pub player_one: String,
    pub entry_fee: i64,
}

#[derive(Debug, Deserialize)]
pub struct JoinMatchRequest {
    pub match_id: String,
    pub player: String,
}

#[derive(Debug, Deserialize)]
pub struct MatchResultRequest {
    pub txid: String,
    pub match_id: String,
    pub winner: Option<String>,
}

fn required(field: &str, value: &str) -> Result<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(AppError::BadRequest(format!("{} is required", field)));
    }
    Ok(trimmed.to_string())
}

/// POST /api/match/create
pub async fn create_match(
    State(state): State<AppState>,
    Json(req): Json<CreateMatchRequest>,
) -> Result<Json<ApiResponse<Match>>> {
    let match_id = required("match_id", &req.match_id)?;
    let player_one = required("player_one", &req.player_one)?;

    let created = state
        .ledger
        .create_match(&match_id, &player_one, req.entry_fee)
        .await?;
    tracing::info!("Match {} created by {}", created.id, created.player_one);

    Ok(Json(ApiResponse::success(created)))
}

/// POST /api/match/join
pub async fn join_match(
    State(state): State<AppState>,
    Json(req): Json<JoinMatchRequest>,
) -> Result<Json<ApiResponse<Match>>> {
    let match_id = required("match_id", &req.match_id)?;
    let player = required("player", &req.player)?;

    let joined = state.ledger.join_match(&match_id, &player).await?;
    tracing::info!("{} joined match {}", player, joined.id);

    Ok(Json(ApiResponse::success(joined)))
}

/// POST /api/match/result
///
/// Settles a match from a chain transaction. Resubmitting a recorded
/// transaction is answered with `already_settled` instead of an error.
pub async fn submit_result(
    State(state): State<AppState>,
    Json(req): Json<MatchResultRequest>,
) -> Result<Json<ApiResponse<SettlementReceipt>>> {
    let request = SettlementRequest::match_result(&req.txid, &req.match_id, req.winner.as_deref());
    let receipt = state.coordinator.submit(request).await?;
    Ok(Json(ApiResponse::success(receipt)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{api::test_support::harness, models::MatchStatus, services::ReceiptStatus};

    async fn open_match(state: &AppState) {
        create_match(
            State(state.clone()),
            Json(CreateMatchRequest {
                match_id: "m1".to_string(),
                player_one: "p1".to_string(),
                entry_fee: 1_000_000,
            }),
        )
        .await
        .unwrap();
        join_match(
            State(state.clone()),
            Json(JoinMatchRequest {
                match_id: "m1".to_string(),
                player: "p2".to_string(),
            }),
        )
        .await
        .unwrap();
    }

    fn result(txid: &str, winner: Option<&str>) -> Json<MatchResultRequest> {
        Json(MatchResultRequest {
            txid: txid.to_string(),
            match_id: "m1".to_string(),
            winner: winner.map(str::to_string),
        })
    }

    #[tokio::test]
    async fn create_rejects_blank_ids_and_zero_fee() {
        let h = harness();
        let blank = create_match(
            State(h.state.clone()),
            Json(CreateMatchRequest {
                match_id: "  ".to_string(),
                player_one: "p1".to_string(),
                entry_fee: 10,
            }),
        )
        .await;
        assert!(matches!(blank, Err(AppError::BadRequest(_))));

        let free = create_match(
            State(h.state),
            Json(CreateMatchRequest {
                match_id: "m1".to_string(),
                player_one: "p1".to_string(),
                entry_fee: 0,
            }),
        )
        .await;
        assert!(matches!(free, Err(AppError::BadRequest(_))));
    }

    #[tokio::test]
    async fn join_activates_match() {
        let h = harness();
        open_match(&h.state).await;
        let m = h.state.ledger.get_match("m1").await.unwrap().unwrap();
        assert_eq!(m.status, MatchStatus::Active);
        assert_eq!(m.player_two.as_deref(), Some("p2"));
    }

    #[tokio::test]
    async fn result_settles_once() {
        let h = harness();
        open_match(&h.state).await;

        let Json(first) = submit_result(State(h.state.clone()), result("R1", Some("p1")))
            .await
            .unwrap();
        assert_eq!(first.data.status, ReceiptStatus::Committed);

        let Json(again) = submit_result(State(h.state.clone()), result("R1", Some("p1")))
            .await
            .unwrap();
        assert_eq!(again.data.status, ReceiptStatus::AlreadySettled);

        let other = submit_result(State(h.state), result("R2", Some("p2"))).await;
        assert!(matches!(other, Err(AppError::CommitFailed(_))));
    }
}
