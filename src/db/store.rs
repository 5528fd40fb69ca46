use async_trait::async_trait;

use crate::{
    error::Result,
    models::{ChainProof, Match, SettlementFact, Stake},
    services::aggregation::StakeResolution,
};

/// Ledger mutation applied by a successful commit.
#[derive(Debug, Clone, PartialEq)]
pub enum CommitEffects {
    StakeRecorded(Stake),
    MatchSettled {
        settled: Match,
        resolutions: Vec<StakeResolution>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Applied(CommitEffects),
    /// The `(match_id, txid)` proof already exists; nothing was written.
    Duplicate,
}

/// Consistent read of every row the derived aggregates depend on.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LedgerSnapshot {
    pub matches: Vec<Match>,
    pub stakes: Vec<Stake>,
}

/// The authoritative store.
///
/// `commit_fact` is the only settlement write path: it records the chain proof
/// and applies the domain mutation in one transaction, so either both land or
/// neither does. Business-rule violations return `AppError::CommitFailed`.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    async fn create_match(&self, id: &str, player_one: &str, entry_fee: i64) -> Result<Match>;

    async fn join_match(&self, id: &str, player: &str) -> Result<Match>;

    async fn get_match(&self, id: &str) -> Result<Option<Match>>;

    async fn commit_fact(
        &self,
        txid: &str,
        fact: &SettlementFact,
        payload: &serde_json::Value,
    ) -> Result<CommitOutcome>;

    /// Proof records for a transaction id, across matches.
    async fn proofs_for_txid(&self, txid: &str) -> Result<Vec<ChainProof>>;

    async fn stakes_for_match(&self, match_id: &str) -> Result<Vec<Stake>>;

    async fn stakes_for_staker(&self, staker: &str) -> Result<Vec<Stake>>;

    async fn snapshot(&self) -> Result<LedgerSnapshot>;

    async fn ping(&self) -> bool;
}
