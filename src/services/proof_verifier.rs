use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use std::{fmt, sync::Arc, time::Duration};
use url::Url;

use crate::{
    config::{Config, VerificationMode},
    error::{AppError, Result},
    models::{FactClaim, MatchResultFact, NoteHint, SettlementFact, SettlementRequest, StakeFact},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    Unreachable,
    Timeout,
    NotFound,
    Malformed,
    /// The transaction exists but does not back the submitted claim.
    Mismatch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerificationFailure {
    pub kind: FailureKind,
    pub reason: String,
}

impl VerificationFailure {
    pub fn new(kind: FailureKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            reason: reason.into(),
        }
    }

    /// Only transport problems are worth another attempt.
    pub fn is_retryable(&self) -> bool {
        matches!(self.kind, FailureKind::Unreachable | FailureKind::Timeout)
    }
}

impl fmt::Display for VerificationFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.reason)
    }
}

impl From<VerificationFailure> for AppError {
    fn from(failure: VerificationFailure) -> Self {
        AppError::VerificationFailed(failure.to_string())
    }
}

/// What the chain says about a transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VerifiedPayload {
    pub txid: String,
    pub sender: Option<String>,
    pub confirmed_round: Option<u64>,
    pub amount: Option<i64>,
    pub hint: Option<NoteHint>,
    pub raw: serde_json::Value,
}

#[async_trait]
pub trait ProofVerifier: Send + Sync {
    async fn verify(&self, txid: &str) -> std::result::Result<VerifiedPayload, VerificationFailure>;
}

// ==================== INDEXER ====================

/// Looks transactions up through an Algorand indexer.
pub struct IndexerVerifier {
    base_url: Url,
    api_token: Option<String>,
    client: Client,
}

impl IndexerVerifier {
    pub fn new(base_url: &str, api_token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AppError::Indexer(format!("failed to build indexer client: {}", e)))?;
        let base_url = Url::parse(base_url)
            .map_err(|e| AppError::Indexer(format!("invalid indexer URL {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(AppError::Indexer(format!("invalid indexer URL {}", base_url)));
        }
        Ok(Self {
            base_url,
            api_token: api_token.filter(|t| !t.trim().is_empty()),
            client,
        })
    }

    /// The lookup URL for `txid`, which is percent-encoded as one path segment.
    fn transaction_url(&self, txid: &str) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["v2", "transactions", txid]);
        }
        url
    }
}

#[async_trait]
impl ProofVerifier for IndexerVerifier {
    async fn verify(&self, txid: &str) -> std::result::Result<VerifiedPayload, VerificationFailure> {
        // Dot segments would be resolved away instead of encoded.
        if txid.is_empty() || txid == "." || txid == ".." {
            return Err(VerificationFailure::new(
                FailureKind::Malformed,
                format!("invalid transaction id {:?}", txid),
            ));
        }
        let mut req = self.client.get(self.transaction_url(txid));
        if let Some(token) = &self.api_token {
            req = req.header("X-API-Key", token);
        }

        let resp = req.send().await.map_err(|e| {
            let kind = if e.is_timeout() {
                FailureKind::Timeout
            } else {
                FailureKind::Unreachable
            };
            VerificationFailure::new(kind, format!("indexer request failed: {}", e))
        })?;

        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Err(VerificationFailure::new(
                FailureKind::NotFound,
                format!("transaction {} not found", txid),
            ));
        }
        if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
            return Err(VerificationFailure::new(
                FailureKind::Unreachable,
                format!("indexer returned {}", status),
            ));
        }
        if !status.is_success() {
            return Err(VerificationFailure::new(
                FailureKind::Malformed,
                format!("indexer rejected lookup with {}", status),
            ));
        }

        let body: serde_json::Value = resp.json().await.map_err(|e| {
            let kind = if e.is_timeout() {
                FailureKind::Timeout
            } else {
                FailureKind::Malformed
            };
            VerificationFailure::new(kind, format!("unreadable indexer response: {}", e))
        })?;

        parse_indexer_response(txid, body)
    }
}

/// Extracts the fields settlement cares about from a `/v2/transactions/{id}` body.
pub fn parse_indexer_response(
    txid: &str,
    body: serde_json::Value,
) -> std::result::Result<VerifiedPayload, VerificationFailure> {
    let tx = body.get("transaction").ok_or_else(|| {
        VerificationFailure::new(FailureKind::Malformed, "response has no transaction object")
    })?;

    let id = tx.get("id").and_then(|v| v.as_str()).unwrap_or(txid);
    if id != txid {
        return Err(VerificationFailure::new(
            FailureKind::Mismatch,
            format!("indexer returned transaction {} for {}", id, txid),
        ));
    }

    let hint = tx
        .get("note")
        .and_then(|v| v.as_str())
        .and_then(|note| STANDARD.decode(note).ok())
        .and_then(|bytes| serde_json::from_slice::<NoteHint>(&bytes).ok());

    Ok(VerifiedPayload {
        txid: txid.to_string(),
        sender: tx.get("sender").and_then(|v| v.as_str()).map(str::to_string),
        confirmed_round: tx.get("confirmed-round").and_then(|v| v.as_u64()),
        amount: tx
            .get("payment-transaction")
            .and_then(|p| p.get("amount"))
            .and_then(|v| v.as_i64()),
        hint,
        raw: body,
    })
}

// ==================== PERMISSIVE ====================

/// Accepts every transaction. Only for local development without an indexer.
pub struct PermissiveVerifier;

#[async_trait]
impl ProofVerifier for PermissiveVerifier {
    async fn verify(&self, txid: &str) -> std::result::Result<VerifiedPayload, VerificationFailure> {
        tracing::warn!(
            "No indexer configured, accepting transaction {} without verification",
            txid
        );
        Ok(VerifiedPayload {
            txid: txid.to_string(),
            raw: serde_json::json!({ "txid": txid, "verified": true, "mode": "permissive" }),
            ..VerifiedPayload::default()
        })
    }
}

pub fn build_verifier(config: &Config) -> Result<Arc<dyn ProofVerifier>> {
    match (config.verification_mode, config.indexer_url.as_deref()) {
        (VerificationMode::Strict, Some(url)) => Ok(Arc::new(IndexerVerifier::new(
            url,
            config.indexer_api_token.clone(),
            config.verify_timeout(),
        )?)),
        (VerificationMode::Strict, None) => Err(AppError::Internal(
            "strict verification requires INDEXER_URL".to_string(),
        )),
        (VerificationMode::Permissive, _) => Ok(Arc::new(PermissiveVerifier)),
    }
}

// ==================== FACT DECODING ====================

fn mismatch(reason: String) -> VerificationFailure {
    VerificationFailure::new(FailureKind::Mismatch, reason)
}

/// Combines a request with its verified payload into a typed fact.
pub fn decode_fact(
    req: &SettlementRequest,
    payload: &VerifiedPayload,
) -> std::result::Result<SettlementFact, VerificationFailure> {
    let hint = payload.hint.clone().unwrap_or_default();

    if let Some(hinted) = hint.match_id.as_deref() {
        if hinted != req.match_id {
            return Err(mismatch(format!(
                "transaction note names match {}, request names {}",
                hinted, req.match_id
            )));
        }
    }

    match &req.claim {
        FactClaim::MatchResult { winner } => {
            if let (Some(claimed), Some(hinted)) = (winner.as_deref(), hint.winner.as_deref()) {
                if claimed != hinted {
                    return Err(mismatch(format!(
                        "transaction note names winner {}, request names {}",
                        hinted, claimed
                    )));
                }
            }
            Ok(SettlementFact::MatchResult(MatchResultFact {
                match_id: req.match_id.clone(),
                winner: winner.clone().or(hint.winner),
            }))
        }
        FactClaim::Stake {
            staker,
            amount,
            backed_participant,
        } => {
            if let Some(sender) = payload.sender.as_deref() {
                if sender != staker {
                    return Err(mismatch(format!(
                        "transaction sent by {}, stake claimed by {}",
                        sender, staker
                    )));
                }
            }

            let chain_amount = hint.amount.or(payload.amount);
            let amount = match (*amount, chain_amount) {
                (Some(claimed), Some(onchain)) if claimed != onchain => {
                    return Err(mismatch(format!(
                        "transaction carries amount {}, request claims {}",
                        onchain, claimed
                    )));
                }
                (Some(claimed), _) => claimed,
                (None, Some(onchain)) => onchain,
                (None, None) => {
                    return Err(VerificationFailure::new(
                        FailureKind::Malformed,
                        "stake amount is neither claimed nor present on chain",
                    ))
                }
            };
            if amount <= 0 {
                return Err(VerificationFailure::new(
                    FailureKind::Malformed,
                    format!("stake amount {} is not positive", amount),
                ));
            }

            let backed_participant = backed_participant
                .clone()
                .or(hint.backed_participant)
                .unwrap_or_else(|| staker.clone());

            Ok(SettlementFact::Stake(StakeFact {
                match_id: req.match_id.clone(),
                staker: staker.clone(),
                backed_participant,
                amount,
            }))
        }
    }
}
