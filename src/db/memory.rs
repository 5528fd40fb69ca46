use async_trait::async_trait;
use chrono::Utc;
use std::{
    collections::BTreeMap,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
};

use crate::{
    crypto::hash,
    error::{AppError, Result},
    models::*,
    services::aggregation::resolve_stakes,
};

use super::store::{CommitEffects, CommitOutcome, LedgerSnapshot, LedgerStore};

#[derive(Default, Clone)]
struct LedgerState {
    matches: BTreeMap<String, Match>,
    stakes: Vec<Stake>,
    proofs: Vec<ChainProof>,
    next_stake_id: i64,
    next_proof_id: i64,
}

/// Process-local ledger with the same commit semantics as the Postgres store.
///
/// Each commit runs under one mutex guard, which plays the role of the
/// database transaction: the state is cloned, mutated, and swapped back only
/// when every step succeeded.
#[derive(Default)]
pub struct InMemoryLedger {
    state: Mutex<LedgerState>,
    fail_commits: AtomicBool,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every following `commit_fact` fail after staging its writes.
    pub fn fail_commits(&self, fail: bool) {
        self.fail_commits.store(fail, Ordering::SeqCst);
    }

    pub fn proofs(&self) -> Vec<ChainProof> {
        self.lock().proofs.clone()
    }

    fn lock(&self) -> MutexGuard<'_, LedgerState> {
        // A poisoned guard still holds consistent data: commits swap state atomically.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn stage_commit(
    staged: &mut LedgerState,
    txid: &str,
    fact: &SettlementFact,
    payload: &serde_json::Value,
) -> Result<CommitOutcome> {
    let match_id = fact.match_id();
    let current = staged
        .matches
        .get(match_id)
        .cloned()
        .ok_or_else(|| AppError::CommitFailed(format!("match {} not found", match_id)))?;

    let duplicate = staged
        .proofs
        .iter()
        .any(|p| p.match_id == match_id && p.txid == txid);
    if duplicate {
        return Ok(CommitOutcome::Duplicate);
    }

    staged.next_proof_id += 1;
    staged.proofs.push(ChainProof {
        id: staged.next_proof_id,
        match_id: match_id.to_string(),
        txid: txid.to_string(),
        fact_kind: fact.kind(),
        payload: payload.clone(),
        payload_digest: hash::payload_digest(payload),
        inserted_at: Utc::now(),
    });

    let effects = match fact {
        SettlementFact::MatchResult(result) => {
            current
                .check_settlement(result.winner.as_deref())
                .map_err(AppError::CommitFailed)?;

            let match_stakes: Vec<Stake> = staged
                .stakes
                .iter()
                .filter(|s| s.match_id == match_id)
                .cloned()
                .collect();
            let resolutions = resolve_stakes(&match_stakes, result.winner.as_deref());
            for resolution in &resolutions {
                if let Some(stake) = staged
                    .stakes
                    .iter_mut()
                    .find(|s| s.id == resolution.stake_id && s.outcome == StakeOutcome::Pending)
                {
                    stake.outcome = resolution.outcome;
                    stake.payout = Some(resolution.payout);
                }
            }

            let settled = staged
                .matches
                .get_mut(match_id)
                .ok_or_else(|| AppError::CommitFailed(format!("match {} not found", match_id)))?;
            settled.status = MatchStatus::Completed;
            settled.winner = result.winner.clone();
            settled.settled = true;
            settled.settled_at = Some(Utc::now());

            CommitEffects::MatchSettled {
                settled: settled.clone(),
                resolutions,
            }
        }
        SettlementFact::Stake(stake_fact) => {
            current
                .check_stake(&stake_fact.backed_participant)
                .map_err(AppError::CommitFailed)?;

            staged.next_stake_id += 1;
            let stake = Stake {
                id: staged.next_stake_id,
                match_id: match_id.to_string(),
                staker: stake_fact.staker.clone(),
                backed_participant: stake_fact.backed_participant.clone(),
                amount: stake_fact.amount,
                txid: txid.to_string(),
                outcome: StakeOutcome::Pending,
                payout: None,
                created_at: Utc::now(),
            };
            staged.stakes.push(stake.clone());
            CommitEffects::StakeRecorded(stake)
        }
    };

    Ok(CommitOutcome::Applied(effects))
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn create_match(&self, id: &str, player_one: &str, entry_fee: i64) -> Result<Match> {
        if entry_fee <= 0 {
            return Err(AppError::BadRequest(
                "Entry fee must be greater than zero".to_string(),
            ));
        }
        let mut state = self.lock();
        if state.matches.contains_key(id) {
            return Err(AppError::Conflict(format!("match {} already exists", id)));
        }
        let created = Match::new(id, player_one, entry_fee);
        state.matches.insert(id.to_string(), created.clone());
        Ok(created)
    }

    async fn join_match(&self, id: &str, player: &str) -> Result<Match> {
        let mut state = self.lock();
        let current = state
            .matches
            .get_mut(id)
            .ok_or_else(|| AppError::NotFound(format!("match {} not found", id)))?;
        current.check_join(player).map_err(AppError::Conflict)?;
        current.player_two = Some(player.to_string());
        current.status = MatchStatus::Active;
        Ok(current.clone())
    }

    async fn get_match(&self, id: &str) -> Result<Option<Match>> {
        Ok(self.lock().matches.get(id).cloned())
    }

    async fn commit_fact(
        &self,
        txid: &str,
        fact: &SettlementFact,
        payload: &serde_json::Value,
    ) -> Result<CommitOutcome> {
        let mut state = self.lock();
        let mut staged = state.clone();
        let outcome = stage_commit(&mut staged, txid, fact, payload)?;

        if matches!(outcome, CommitOutcome::Applied(_)) {
            if self.fail_commits.load(Ordering::SeqCst) {
                return Err(AppError::CommitFailed("forced commit failure".to_string()));
            }
            *state = staged;
        }
        Ok(outcome)
    }

    async fn proofs_for_txid(&self, txid: &str) -> Result<Vec<ChainProof>> {
        Ok(self
            .lock()
            .proofs
            .iter()
            .filter(|p| p.txid == txid)
            .cloned()
            .collect())
    }

    async fn stakes_for_match(&self, match_id: &str) -> Result<Vec<Stake>> {
        Ok(self
            .lock()
            .stakes
            .iter()
            .filter(|s| s.match_id == match_id)
            .cloned()
            .collect())
    }

    async fn stakes_for_staker(&self, staker: &str) -> Result<Vec<Stake>> {
        Ok(self
            .lock()
            .stakes
            .iter()
            .rev()
            .filter(|s| s.staker == staker)
            .cloned()
            .collect())
    }

    async fn snapshot(&self) -> Result<LedgerSnapshot> {
        let state = self.lock();
        Ok(LedgerSnapshot {
            matches: state.matches.values().cloned().collect(),
            stakes: state.stakes.clone(),
        })
    }

    async fn ping(&self) -> bool {
        true
    }
}
