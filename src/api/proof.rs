use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;

use crate::{
    error::Result,
    models::{ApiResponse, ChainProof},
};

use super::AppState;

#[derive(Debug, Serialize)]
pub struct ProofLookupResponse {
    pub txid: String,
    pub confirmed: bool,
    pub proofs: Vec<ChainProof>,
}

/// GET /api/proof/{txid}
///
/// Reads the ledger, never the cache: this is the authoritative answer to
/// "has this transaction been settled".
pub async fn get_proof(
    State(state): State<AppState>,
    Path(txid): Path<String>,
) -> Result<Json<ApiResponse<ProofLookupResponse>>> {
    let txid = txid.trim().to_string();
    let proofs = state.ledger.proofs_for_txid(&txid).await?;
    Ok(Json(ApiResponse::success(ProofLookupResponse {
        confirmed: !proofs.is_empty(),
        txid,
        proofs,
    })))
}
