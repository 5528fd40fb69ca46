use serde::Serialize;
use std::{sync::Arc, time::Duration};
use tokio::time::{interval, Instant, MissedTickBehavior};

use crate::{
    config::{Config, ReconcileScope},
    db::LedgerStore,
    error::Result,
    services::{aggregate_cache::AggregateCache, aggregation::derive_all},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReconciliationReport {
    pub scope: &'static str,
    pub matches_rebuilt: usize,
    pub stale_match_keys_removed: usize,
    /// `None` when the leaderboard is outside the configured scope.
    pub identities_rebuilt: Option<usize>,
    pub elapsed_ms: u64,
}

/// Rebuilds the derived cache from a consistent ledger snapshot.
///
/// Every run overwrites cache keys with absolute values, so running it twice
/// in a row leaves the cache unchanged.
pub struct ReconciliationJob {
    ledger: Arc<dyn LedgerStore>,
    cache: Arc<dyn AggregateCache>,
    scope: ReconcileScope,
    every: Duration,
}

impl ReconciliationJob {
    pub fn new(
        ledger: Arc<dyn LedgerStore>,
        cache: Arc<dyn AggregateCache>,
        scope: ReconcileScope,
        every: Duration,
    ) -> Self {
        Self {
            ledger,
            cache,
            scope,
            every,
        }
    }

    pub fn from_config(
        ledger: Arc<dyn LedgerStore>,
        cache: Arc<dyn AggregateCache>,
        config: &Config,
    ) -> Self {
        Self::new(ledger, cache, config.reconcile_scope, config.reconcile_interval())
    }

    pub async fn run_once(&self) -> Result<ReconciliationReport> {
        let started = Instant::now();
        let snapshot = self.ledger.snapshot().await?;
        let derived = derive_all(&snapshot);

        let stale = self.cache.replace_match_stakes(&derived.match_stakes).await?;
        let identities = if self.scope.includes_leaderboard() {
            self.cache
                .replace_leaderboard(&derived.player_stats, &derived.rank_scores)
                .await?;
            Some(derived.player_stats.len())
        } else {
            None
        };

        let report = ReconciliationReport {
            scope: match self.scope {
                ReconcileScope::MatchStakes => "match_stakes",
                ReconcileScope::Full => "full",
            },
            matches_rebuilt: derived.match_stakes.len(),
            stale_match_keys_removed: stale,
            identities_rebuilt: identities,
            elapsed_ms: started.elapsed().as_millis() as u64,
        };
        tracing::info!(
            "Reconciliation ({}) rebuilt {} matches, removed {} stale keys, {:?} identities in {}ms",
            report.scope,
            report.matches_rebuilt,
            report.stale_match_keys_removed,
            report.identities_rebuilt,
            report.elapsed_ms
        );
        Ok(report)
    }

    pub async fn start(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = interval(self.every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                ticker.tick().await;

                if let Err(e) = self.run_once().await {
                    tracing::error!("Reconciliation error: {}", e);
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        db::InMemoryLedger,
        models::{MatchResultFact, PlayerStat, SettlementFact, StakeFact},
        services::aggregate_cache::{CacheDelta, InMemoryAggregateCache},
    };
    use proptest::prelude::*;
    use tokio::runtime::Runtime;

    const STAKERS: [&str; 4] = ["p1", "p2", "s1", "s2"];
    const SIDES: [&str; 2] = ["p1", "p2"];

    fn job(
        ledger: Arc<InMemoryLedger>,
        cache: Arc<InMemoryAggregateCache>,
        scope: ReconcileScope,
    ) -> ReconciliationJob {
        ReconciliationJob::new(ledger, cache, scope, Duration::from_secs(60))
    }

    async fn seeded_ledger(stakes: &[(usize, usize, i64)], winner: Option<usize>) -> Arc<InMemoryLedger> {
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.create_match("m1", "p1", 100).await.unwrap();
        ledger.join_match("m1", "p2").await.unwrap();
        ledger.create_match("m2", "p1", 100).await.unwrap();

        for (i, (staker, side, amount)) in stakes.iter().enumerate() {
            let fact = SettlementFact::Stake(StakeFact {
                match_id: "m1".to_string(),
                staker: STAKERS[*staker].to_string(),
                backed_participant: SIDES[*side].to_string(),
                amount: *amount,
            });
            ledger
                .commit_fact(&format!("S{}", i), &fact, &serde_json::json!({}))
                .await
                .unwrap();
        }
        if let Some(w) = winner {
            let fact = SettlementFact::MatchResult(MatchResultFact {
                match_id: "m1".to_string(),
                winner: Some(SIDES[w].to_string()),
            });
            ledger
                .commit_fact("R1", &fact, &serde_json::json!({}))
                .await
                .unwrap();
        }
        ledger
    }

    #[tokio::test]
    async fn rebuild_is_idempotent() {
        let ledger = seeded_ledger(&[(2, 0, 40), (3, 1, 60)], Some(0)).await;
        let cache = Arc::new(InMemoryAggregateCache::new());
        let job = job(ledger.clone(), cache.clone(), ReconcileScope::Full);

        let first = job.run_once().await.unwrap();
        let after_first = cache.snapshot();
        let second = job.run_once().await.unwrap();

        assert_eq!(after_first, cache.snapshot());
        assert_eq!(first.matches_rebuilt, 1);
        assert_eq!(second.stale_match_keys_removed, 0);
        assert_eq!(after_first.player_stats["s1"].total_rewards, 100);
    }

    #[tokio::test]
    async fn stake_scope_leaves_leaderboard_alone() {
        let ledger = seeded_ledger(&[(2, 0, 40)], Some(0)).await;
        let cache = Arc::new(InMemoryAggregateCache::new());
        cache.bump_rank("ghost", 7).await.unwrap();
        cache.bump_match_stake("m9", "p1", 3).await.unwrap();

        let report = job(ledger, cache.clone(), ReconcileScope::MatchStakes)
            .run_once()
            .await
            .unwrap();

        assert_eq!(report.identities_rebuilt, None);
        assert_eq!(report.stale_match_keys_removed, 1);
        let snapshot = cache.snapshot();
        assert_eq!(snapshot.rank_scores["ghost"], 7);
        assert_eq!(snapshot.match_stakes["m1"].total, 40);
    }

    #[tokio::test]
    async fn unavailable_cache_surfaces_error() {
        let ledger = seeded_ledger(&[], None).await;
        let cache = Arc::new(InMemoryAggregateCache::new());
        cache.set_unavailable(true);
        assert!(job(ledger, cache, ReconcileScope::Full).run_once().await.is_err());
    }

    fn drift() -> impl Strategy<Value = CacheDelta> {
        prop_oneof![
            (0..3usize, 0..4usize, -1_000i64..1_000).prop_map(|(m, p, delta)| {
                CacheDelta::MatchStake {
                    match_id: format!("m{}", m),
                    participant: STAKERS[p].to_string(),
                    delta,
                }
            }),
            (0..4usize, 0..4usize, -50i64..50).prop_map(|(p, s, delta)| {
                let stat = [
                    PlayerStat::TotalStaked,
                    PlayerStat::GamesPlayed,
                    PlayerStat::GamesWon,
                    PlayerStat::TotalRewards,
                ][s];
                CacheDelta::PlayerStat {
                    identity: STAKERS[p].to_string(),
                    stat,
                    delta,
                }
            }),
            (0..6usize, -5i64..5).prop_map(|(p, delta)| CacheDelta::Rank {
                identity: format!("id{}", p),
                delta,
            }),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig { cases: 32, .. ProptestConfig::default() })]
        #[test]
        fn cache_converges_after_reconciliation(
            stakes in proptest::collection::vec((0..4usize, 0..2usize, 1i64..1_000_000), 0..8),
            winner in proptest::option::of(0..2usize),
            noise in proptest::collection::vec(drift(), 0..20),
        ) {
            let rt = Runtime::new().unwrap();
            rt.block_on(async {
                let ledger = seeded_ledger(&stakes, winner).await;
                let cache = Arc::new(InMemoryAggregateCache::new());
                cache.apply(&noise).await.unwrap();

                job(ledger.clone(), cache.clone(), ReconcileScope::Full)
                    .run_once()
                    .await
                    .unwrap();

                let expected = derive_all(&ledger.snapshot().await.unwrap());
                assert_eq!(cache.snapshot(), expected);
            });
        }
    }
}
