//! Settlement coordinator.
//!
//! Drives one chain-backed fact from submission to a terminal state:
//! verify the transaction, commit proof and mutation as one ledger
//! transaction, then update the derived cache and publish an event. Only the
//! first two steps can reject a request; the last two are best-effort.

use serde::Serialize;
use std::{sync::Arc, time::Duration};
use thiserror::Error;

use crate::{
    config::Config,
    constants::VERIFY_RETRY_BASE_MS,
    db::{CommitEffects, CommitOutcome, LedgerStore},
    error::AppError,
    models::{FactKind, SettlementRequest},
    services::{
        aggregate_cache::AggregateCache,
        aggregation::cache_deltas,
        fanout::{DomainEvent, EventPublisher},
        proof_verifier::{decode_fact, ProofVerifier, VerificationFailure, VerifiedPayload},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettlementStage {
    Received,
    Verifying,
    Verified,
    VerificationFailed,
    Committing,
    Committed,
    CommitFailed,
    CacheUpdating,
    Published,
}

impl SettlementStage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Verifying => "verifying",
            Self::Verified => "verified",
            Self::VerificationFailed => "verification_failed",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::CommitFailed => "commit_failed",
            Self::CacheUpdating => "cache_updating",
            Self::Published => "published",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiptStatus {
    Committed,
    /// The proof was already recorded; nothing changed.
    AlreadySettled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SettlementReceipt {
    pub txid: String,
    pub match_id: String,
    pub kind: FactKind,
    pub status: ReceiptStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SettlementRejection {
    #[error("invalid settlement request: {0}")]
    InvalidRequest(String),

    #[error("verification failed: {0}")]
    Verification(VerificationFailure),

    #[error("commit failed: {0}")]
    Commit(String),
}

impl From<SettlementRejection> for AppError {
    fn from(rejection: SettlementRejection) -> Self {
        match rejection {
            SettlementRejection::InvalidRequest(reason) => AppError::BadRequest(reason),
            SettlementRejection::Verification(failure) => failure.into(),
            SettlementRejection::Commit(reason) => AppError::CommitFailed(reason),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CoordinatorSettings {
    pub max_attempts: u32,
    pub retry_base: Duration,
    pub cache_timeout: Duration,
}

impl CoordinatorSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_attempts: config.verify_max_attempts.max(1),
            retry_base: Duration::from_millis(VERIFY_RETRY_BASE_MS),
            cache_timeout: config.cache_timeout(),
        }
    }
}

pub struct SettlementCoordinator {
    verifier: Arc<dyn ProofVerifier>,
    ledger: Arc<dyn LedgerStore>,
    cache: Arc<dyn AggregateCache>,
    publisher: Arc<dyn EventPublisher>,
    settings: CoordinatorSettings,
}

fn trace_stage(req: &SettlementRequest, stage: SettlementStage) {
    tracing::debug!(
        "Settlement {} txid={} match={} -> {}",
        req.kind().as_str(),
        req.txid,
        req.match_id,
        stage.as_str()
    );
}

fn event_for(effects: &CommitEffects) -> DomainEvent {
    match effects {
        CommitEffects::StakeRecorded(stake) => DomainEvent::StakeConfirmed {
            match_id: stake.match_id.clone(),
            staker: stake.staker.clone(),
            amount: stake.amount,
        },
        CommitEffects::MatchSettled { settled, .. } => DomainEvent::MatchSettled {
            match_id: settled.id.clone(),
            winner: settled.winner.clone(),
        },
    }
}

impl SettlementCoordinator {
    pub fn new(
        verifier: Arc<dyn ProofVerifier>,
        ledger: Arc<dyn LedgerStore>,
        cache: Arc<dyn AggregateCache>,
        publisher: Arc<dyn EventPublisher>,
        settings: CoordinatorSettings,
    ) -> Self {
        Self {
            verifier,
            ledger,
            cache,
            publisher,
            settings,
        }
    }

    pub async fn submit(
        &self,
        req: SettlementRequest,
    ) -> Result<SettlementReceipt, SettlementRejection> {
        trace_stage(&req, SettlementStage::Received);
        req.validate().map_err(SettlementRejection::InvalidRequest)?;

        trace_stage(&req, SettlementStage::Verifying);
        let (fact, payload) = match self
            .verify_with_retry(&req.txid)
            .await
            .and_then(|payload| decode_fact(&req, &payload).map(|fact| (fact, payload)))
        {
            Ok(verified) => verified,
            Err(failure) => {
                trace_stage(&req, SettlementStage::VerificationFailed);
                tracing::warn!("Rejected settlement txid={}: {}", req.txid, failure);
                return Err(SettlementRejection::Verification(failure));
            }
        };
        trace_stage(&req, SettlementStage::Verified);

        trace_stage(&req, SettlementStage::Committing);
        let effects = match self.ledger.commit_fact(&req.txid, &fact, &payload.raw).await {
            Ok(CommitOutcome::Applied(effects)) => effects,
            Ok(CommitOutcome::Duplicate) => {
                tracing::info!(
                    "Proof txid={} match={} already recorded, nothing to do",
                    req.txid,
                    req.match_id
                );
                return Ok(self.receipt(&req, ReceiptStatus::AlreadySettled));
            }
            Err(err) => {
                trace_stage(&req, SettlementStage::CommitFailed);
                tracing::warn!("Commit failed txid={}: {}", req.txid, err);
                let reason = match err {
                    AppError::CommitFailed(reason) => reason,
                    other => other.to_string(),
                };
                return Err(SettlementRejection::Commit(reason));
            }
        };
        trace_stage(&req, SettlementStage::Committed);
        tracing::info!(
            "Committed {} txid={} match={}",
            req.kind().as_str(),
            req.txid,
            req.match_id
        );

        trace_stage(&req, SettlementStage::CacheUpdating);
        self.update_cache(&req, &effects).await;

        let event = event_for(&effects);
        if let Err(err) = self.publisher.publish(event).await {
            tracing::warn!("Event publish failed txid={}: {}", req.txid, err);
        }
        trace_stage(&req, SettlementStage::Published);

        Ok(self.receipt(&req, ReceiptStatus::Committed))
    }

    async fn verify_with_retry(&self, txid: &str) -> Result<VerifiedPayload, VerificationFailure> {
        let mut attempt: u32 = 1;
        loop {
            match self.verifier.verify(txid).await {
                Ok(payload) => return Ok(payload),
                Err(failure) if failure.is_retryable() && attempt < self.settings.max_attempts => {
                    let delay = self.settings.retry_base * 2u32.saturating_pow(attempt - 1);
                    tracing::warn!(
                        "Verification attempt {}/{} for txid={} failed: {}; retrying in {:?}",
                        attempt,
                        self.settings.max_attempts,
                        txid,
                        failure,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(failure) => {
                    tracing::warn!(
                        "Verification attempt {}/{} for txid={} failed: {}",
                        attempt,
                        self.settings.max_attempts,
                        txid,
                        failure
                    );
                    return Err(failure);
                }
            }
        }
    }

    async fn update_cache(&self, req: &SettlementRequest, effects: &CommitEffects) {
        let deltas = cache_deltas(effects);
        match tokio::time::timeout(self.settings.cache_timeout, self.cache.apply(&deltas)).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!(
                    "Cache update failed txid={} match={}: {}; reconciliation will repair it",
                    req.txid,
                    req.match_id,
                    err
                );
            }
            Err(_) => {
                tracing::warn!(
                    "Cache update timed out txid={} match={}; reconciliation will repair it",
                    req.txid,
                    req.match_id
                );
            }
        }
    }

    fn receipt(&self, req: &SettlementRequest, status: ReceiptStatus) -> SettlementReceipt {
        SettlementReceipt {
            txid: req.txid.clone(),
            match_id: req.match_id.clone(),
            kind: req.kind(),
            status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::InMemoryLedger,
        error::Result,
        models::{MatchStatus, StakeOutcome},
        services::{
            aggregate_cache::InMemoryAggregateCache,
            aggregation::derive_all,
            proof_verifier::{FailureKind, PermissiveVerifier},
        },
    };
    use async_trait::async_trait;
    use std::sync::{
        atomic::{AtomicBool, AtomicU32, Ordering},
        Mutex,
    };

    #[derive(Default)]
    struct RecordingPublisher {
        events: Mutex<Vec<DomainEvent>>,
        fail: AtomicBool,
    }

    #[async_trait]
    impl EventPublisher for RecordingPublisher {
        async fn publish(&self, event: DomainEvent) -> Result<usize> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(AppError::Internal("bus closed".to_string()));
            }
            self.events.lock().unwrap().push(event);
            Ok(1)
        }
    }

    /// Fails with `kind` for the first `failures` calls, then accepts.
    struct FlakyVerifier {
        kind: FailureKind,
        failures: u32,
        calls: AtomicU32,
    }

    impl FlakyVerifier {
        fn new(kind: FailureKind, failures: u32) -> Self {
            Self {
                kind,
                failures,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl ProofVerifier for FlakyVerifier {
        async fn verify(
            &self,
            txid: &str,
        ) -> std::result::Result<VerifiedPayload, VerificationFailure> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                return Err(VerificationFailure::new(self.kind, "indexer down"));
            }
            PermissiveVerifier.verify(txid).await
        }
    }

    struct Harness {
        ledger: Arc<InMemoryLedger>,
        cache: Arc<InMemoryAggregateCache>,
        publisher: Arc<RecordingPublisher>,
        coordinator: SettlementCoordinator,
    }

    fn settings(max_attempts: u32) -> CoordinatorSettings {
        CoordinatorSettings {
            max_attempts,
            retry_base: Duration::from_millis(250),
            cache_timeout: Duration::from_secs(1),
        }
    }

    async fn harness_with(verifier: Arc<dyn ProofVerifier>, max_attempts: u32) -> Harness {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.create_match("m1", "p1", 1_000_000).await.unwrap();
        ledger.join_match("m1", "p2").await.unwrap();
        let cache = Arc::new(InMemoryAggregateCache::new());
        let publisher = Arc::new(RecordingPublisher::default());
        let coordinator = SettlementCoordinator::new(
            verifier,
            ledger.clone(),
            cache.clone(),
            publisher.clone(),
            settings(max_attempts),
        );
        Harness {
            ledger,
            cache,
            publisher,
            coordinator,
        }
    }

    async fn harness() -> Harness {
        harness_with(Arc::new(PermissiveVerifier), 3).await
    }

    fn stake_a1() -> SettlementRequest {
        SettlementRequest::stake("A1", "m1", "p1", Some(5_000_000), None)
    }

    #[tokio::test]
    async fn stake_then_resubmit_then_settle() {
        let h = harness().await;

        let receipt = h.coordinator.submit(stake_a1()).await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Committed);
        assert_eq!(h.ledger.stakes_for_match("m1").await.unwrap().len(), 1);
        assert_eq!(h.cache.match_totals("m1").await.unwrap().unwrap().total, 5_000_000);

        let again = h.coordinator.submit(stake_a1()).await.unwrap();
        assert_eq!(again.status, ReceiptStatus::AlreadySettled);
        assert_eq!(h.ledger.stakes_for_match("m1").await.unwrap().len(), 1);
        assert_eq!(h.cache.match_totals("m1").await.unwrap().unwrap().total, 5_000_000);

        let settle = SettlementRequest::match_result("T1", "m1", Some("p1"));
        h.coordinator.submit(settle).await.unwrap();
        let m = h.ledger.get_match("m1").await.unwrap().unwrap();
        assert_eq!(m.status, MatchStatus::Completed);
        assert_eq!(m.winner.as_deref(), Some("p1"));
        assert_eq!(h.cache.player_stats("p1").await.unwrap().unwrap().games_won, 1);

        let stakes = h.ledger.stakes_for_match("m1").await.unwrap();
        assert_eq!(stakes[0].outcome, StakeOutcome::Won);
        assert_eq!(stakes[0].payout, Some(5_000_000));

        let events = h.publisher.events.lock().unwrap().clone();
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[1],
            DomainEvent::MatchSettled {
                match_id: "m1".to_string(),
                winner: Some("p1".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn incremental_cache_matches_full_derivation() {
        let h = harness().await;
        h.coordinator.submit(stake_a1()).await.unwrap();
        h.coordinator
            .submit(SettlementRequest::stake("A2", "m1", "p3", Some(3_000_000), Some("p2")))
            .await
            .unwrap();
        h.coordinator
            .submit(SettlementRequest::match_result("T1", "m1", Some("p2")))
            .await
            .unwrap();

        let expected = derive_all(&h.ledger.snapshot().await.unwrap());
        assert_eq!(h.cache.snapshot(), expected);
    }

    #[tokio::test]
    async fn settled_match_cannot_be_resettled() {
        let h = harness().await;
        h.coordinator
            .submit(SettlementRequest::match_result("T1", "m1", Some("p1")))
            .await
            .unwrap();

        let second = h
            .coordinator
            .submit(SettlementRequest::match_result("T2", "m1", Some("p2")))
            .await;
        assert!(matches!(second, Err(SettlementRejection::Commit(_))));
        let m = h.ledger.get_match("m1").await.unwrap().unwrap();
        assert_eq!(m.winner.as_deref(), Some("p1"));

        // Same proof again is still a success.
        let replay = h
            .coordinator
            .submit(SettlementRequest::match_result("T1", "m1", Some("p1")))
            .await
            .unwrap();
        assert_eq!(replay.status, ReceiptStatus::AlreadySettled);
    }

    #[tokio::test]
    async fn result_for_unjoined_match_is_rejected() {
        let h = harness().await;
        h.ledger.create_match("m2", "p1", 1_000_000).await.unwrap();

        let result = h
            .coordinator
            .submit(SettlementRequest::match_result("R1", "m2", Some("p1")))
            .await;
        assert!(matches!(result, Err(SettlementRejection::Commit(_))));

        let m = h.ledger.get_match("m2").await.unwrap().unwrap();
        assert_eq!(m.status, MatchStatus::Pending);
        assert!(!m.settled);
        assert!(m.winner.is_none());
        assert!(h.ledger.proofs().is_empty());
        assert!(h.publisher.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unjoined_match_only_accepts_backing_its_creator() {
        let h = harness().await;
        h.ledger.create_match("m2", "p1", 1_000_000).await.unwrap();

        // Backing defaults to the staker, who is not playing.
        let unplayable = h
            .coordinator
            .submit(SettlementRequest::stake("A1", "m2", "s1", Some(10), None))
            .await;
        assert!(matches!(unplayable, Err(SettlementRejection::Commit(_))));
        assert!(h.ledger.stakes_for_match("m2").await.unwrap().is_empty());

        h.coordinator
            .submit(SettlementRequest::stake("A2", "m2", "s1", Some(10), Some("p1")))
            .await
            .unwrap();
        assert_eq!(h.ledger.stakes_for_match("m2").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stakes_are_refunded_when_nobody_backed_the_winner() {
        let h = harness().await;
        h.coordinator
            .submit(SettlementRequest::stake("A1", "m1", "s1", Some(300), Some("p2")))
            .await
            .unwrap();
        h.coordinator
            .submit(SettlementRequest::match_result("T1", "m1", Some("p1")))
            .await
            .unwrap();

        let stakes = h.ledger.stakes_for_match("m1").await.unwrap();
        assert_eq!(stakes[0].outcome, StakeOutcome::Refunded);
        assert_eq!(stakes[0].payout, Some(300));
        assert_eq!(h.cache.player_stats("s1").await.unwrap().unwrap().total_rewards, 0);

        let expected = derive_all(&h.ledger.snapshot().await.unwrap());
        assert_eq!(h.cache.snapshot(), expected);
    }

    #[tokio::test]
    async fn failed_commit_touches_nothing_downstream() {
        let h = harness().await;
        h.ledger.fail_commits(true);

        let result = h.coordinator.submit(stake_a1()).await;
        assert!(matches!(result, Err(SettlementRejection::Commit(_))));
        assert!(h.ledger.proofs().is_empty());
        assert!(h.ledger.stakes_for_match("m1").await.unwrap().is_empty());
        assert_eq!(h.cache.snapshot(), Default::default());
        assert!(h.publisher.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn winner_outside_match_is_a_commit_failure() {
        let h = harness().await;
        let result = h
            .coordinator
            .submit(SettlementRequest::match_result("T1", "m1", Some("stranger")))
            .await;
        assert!(matches!(result, Err(SettlementRejection::Commit(_))));
        assert_eq!(
            h.ledger.get_match("m1").await.unwrap().unwrap().status,
            MatchStatus::Active
        );
    }

    #[tokio::test]
    async fn not_found_is_rejected_without_retry() {
        let verifier = Arc::new(FlakyVerifier::new(FailureKind::NotFound, 1));
        let h = harness_with(verifier.clone(), 3).await;

        let result = h.coordinator.submit(stake_a1()).await;
        match result {
            Err(SettlementRejection::Verification(failure)) => {
                assert_eq!(failure.kind, FailureKind::NotFound)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 1);
        assert!(h.ledger.proofs().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn transient_verification_failures_are_retried() {
        let verifier = Arc::new(FlakyVerifier::new(FailureKind::Timeout, 2));
        let h = harness_with(verifier.clone(), 3).await;

        let receipt = h.coordinator.submit(stake_a1()).await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Committed);
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn retries_are_bounded() {
        let verifier = Arc::new(FlakyVerifier::new(FailureKind::Unreachable, 10));
        let h = harness_with(verifier.clone(), 2).await;

        let result = h.coordinator.submit(stake_a1()).await;
        assert!(matches!(result, Err(SettlementRejection::Verification(_))));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn cache_and_publish_failures_do_not_reject() {
        let h = harness().await;
        h.cache.set_unavailable(true);
        h.publisher.fail.store(true, Ordering::SeqCst);

        let receipt = h.coordinator.submit(stake_a1()).await.unwrap();
        assert_eq!(receipt.status, ReceiptStatus::Committed);
        assert_eq!(h.ledger.stakes_for_match("m1").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn invalid_request_never_reaches_verifier() {
        let verifier = Arc::new(FlakyVerifier::new(FailureKind::NotFound, 0));
        let h = harness_with(verifier.clone(), 3).await;
        let result = h
            .coordinator
            .submit(SettlementRequest::stake("A1", "m1", "", Some(5), None))
            .await;
        assert!(matches!(result, Err(SettlementRejection::InvalidRequest(_))));
        assert_eq!(verifier.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn rejections_map_to_api_errors() {
        let err: AppError = SettlementRejection::Commit("match m1 is not active".into()).into();
        assert!(matches!(err, AppError::CommitFailed(_)));
        let err: AppError = SettlementRejection::Verification(VerificationFailure::new(
            FailureKind::Mismatch,
            "amount",
        ))
        .into();
        assert!(matches!(err, AppError::VerificationFailed(_)));
    }
}
