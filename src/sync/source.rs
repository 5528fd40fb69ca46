use async_trait::async_trait;
use reqwest::Client;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{collections::BTreeMap, time::Duration};
use thiserror::Error;

use crate::models::{ApiResponse, LeaderboardEntry, MatchStakeTotals, PlayerStats, Stake};

const IDENTITY_LOSS_MARKERS: [&str; 3] = ["wallet", "signer", "disconnected"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SyncError {
    /// Worth retrying: network trouble, timeouts, server errors.
    #[error("transient sync failure: {0}")]
    Transient(String),

    /// The session identity is gone; polling should stop.
    #[error("identity no longer valid: {0}")]
    Terminal(String),
}

impl SyncError {
    /// Classifies a failed read by HTTP status (when there was one) and message.
    pub fn classify(status: Option<u16>, message: &str) -> Self {
        let lowered = message.to_ascii_lowercase();
        let identity_lost = matches!(status, Some(401 | 403 | 410))
            || IDENTITY_LOSS_MARKERS.iter().any(|m| lowered.contains(m));
        if identity_lost {
            SyncError::Terminal(message.to_string())
        } else {
            SyncError::Transient(message.to_string())
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SyncError::Terminal(_))
    }
}

/// Per-identity values the sync manager caches.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountSnapshot {
    pub stats: Option<PlayerStats>,
    /// Amount staked by the identity, per match.
    pub stakes: BTreeMap<String, i64>,
}

impl AccountSnapshot {
    pub fn from_stakes(stats: Option<PlayerStats>, stakes: &[Stake]) -> Self {
        let mut by_match = BTreeMap::new();
        for stake in stakes {
            *by_match.entry(stake.match_id.clone()).or_insert(0) += stake.amount;
        }
        Self {
            stats,
            stakes: by_match,
        }
    }
}

/// Read side the client sync manager polls.
#[async_trait]
pub trait SyncSource: Send + Sync {
    async fn account(&self, identity: &str) -> Result<AccountSnapshot, SyncError>;

    async fn stake_totals(&self, match_id: &str) -> Result<Option<MatchStakeTotals>, SyncError>;

    async fn leaderboard(&self, limit: usize) -> Result<Vec<LeaderboardEntry>, SyncError>;

    /// True once the ledger holds a proof for `txid`.
    async fn proof_confirmed(&self, txid: &str) -> Result<bool, SyncError>;
}

#[derive(Debug, Deserialize)]
struct ProofLookup {
    confirmed: bool,
}

/// `SyncSource` backed by this service's own HTTP API.
#[derive(Clone, Debug)]
pub struct HttpSyncSource {
    base_url: String,
    session_token: Option<String>,
    client: Client,
}

impl HttpSyncSource {
    pub fn new(
        base_url: &str,
        session_token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, SyncError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::Transient(format!("failed to build http client: {}", e)))?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            session_token,
            client,
        })
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, SyncError> {
        let mut req = self.client.get(format!("{}{}", self.base_url, path));
        if let Some(token) = &self.session_token {
            req = req.bearer_auth(token);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| SyncError::classify(None, &e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            tracing::debug!("Sync read {} returned {}", path, status);
            return Err(SyncError::classify(
                Some(status.as_u16()),
                &format!("{}: {}", status, body),
            ));
        }

        let envelope: ApiResponse<T> = resp
            .json()
            .await
            .map_err(|e| SyncError::Transient(format!("unreadable response from {}: {}", path, e)))?;
        Ok(envelope.data)
    }
}

#[async_trait]
impl SyncSource for HttpSyncSource {
    async fn account(&self, identity: &str) -> Result<AccountSnapshot, SyncError> {
        let stats: Option<PlayerStats> = self.get(&format!("/api/player/{}", identity)).await?;
        let stakes: Vec<Stake> = self.get(&format!("/api/player/{}/stakes", identity)).await?;
        Ok(AccountSnapshot::from_stakes(stats, &stakes))
    }

    async fn stake_totals(&self, match_id: &str) -> Result<Option<MatchStakeTotals>, SyncError> {
        self.get(&format!("/api/stake/{}/totals", match_id)).await
    }

    async fn leaderboard(&self, limit: usize) -> Result<Vec<LeaderboardEntry>, SyncError> {
        self.get(&format!("/api/leaderboard?limit={}", limit)).await
    }

    async fn proof_confirmed(&self, txid: &str) -> Result<bool, SyncError> {
        let lookup: ProofLookup = self.get(&format!("/api/proof/{}", txid)).await?;
        Ok(lookup.confirmed)
    }
}
