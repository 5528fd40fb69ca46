use axum::{extract::State, Json};

use crate::{error::Result, models::ApiResponse, services::ReconciliationReport};

use super::AppState;

/// POST /api/admin/reconcile
///
/// Runs one reconciliation pass immediately, outside the schedule.
pub async fn reconcile(
    State(state): State<AppState>,
) -> Result<Json<ApiResponse<ReconciliationReport>>> {
    tracing::info!("Manual reconciliation requested");
    let report = state.reconciler.run_once().await?;
    Ok(Json(ApiResponse::success(report)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{api::test_support::harness, services::AggregateCache};

    #[tokio::test]
    async fn manual_reconcile_clears_stale_keys() {
        let h = harness();
        h.cache.bump_match_stake("m9", "p1", 3).await.unwrap();

        let Json(res) = reconcile(State(h.state)).await.unwrap();
        assert_eq!(res.data.stale_match_keys_removed, 1);
        assert_eq!(res.data.identities_rebuilt, Some(0));
        assert!(h.cache.match_totals("m9").await.unwrap().is_none());
    }
}
