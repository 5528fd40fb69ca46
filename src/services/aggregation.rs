//! Pure functions from ledger rows to derived values.
//!
//! Both the incremental cache path and the reconciliation job are defined in
//! terms of these, so a fresh cache always equals `leaderboard_stats` /
//! `match_totals` applied to the current ledger.

use std::collections::BTreeMap;

use crate::{
    db::{CommitEffects, LedgerSnapshot},
    models::{Match, MatchStakeTotals, MatchStatus, PlayerStat, PlayerStats, Stake, StakeOutcome},
    services::aggregate_cache::CacheDelta,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StakeResolution {
    pub stake_id: i64,
    pub staker: String,
    pub outcome: StakeOutcome,
    pub payout: i64,
}

/// Decides outcome and payout for every pending stake of a match settled with `winner`.
///
/// The winning side splits the whole pool pro-rata (integer floor). When no
/// stake backed the winner, every stake is refunded in full. Without a winner
/// the match is void and no stake is resolved.
pub fn resolve_stakes(stakes: &[Stake], winner: Option<&str>) -> Vec<StakeResolution> {
    let Some(winner) = winner else {
        return Vec::new();
    };

    let pending: Vec<&Stake> = stakes
        .iter()
        .filter(|s| s.outcome == StakeOutcome::Pending)
        .collect();
    let pool: i128 = pending.iter().map(|s| s.amount as i128).sum();
    let winning_total: i128 = pending
        .iter()
        .filter(|s| s.backed_participant == winner)
        .map(|s| s.amount as i128)
        .sum();

    if winning_total == 0 {
        return pending
            .into_iter()
            .map(|stake| StakeResolution {
                stake_id: stake.id,
                staker: stake.staker.clone(),
                outcome: StakeOutcome::Refunded,
                payout: stake.amount,
            })
            .collect();
    }

    pending
        .into_iter()
        .map(|stake| {
            if stake.backed_participant == winner {
                let payout = (stake.amount as i128 * pool / winning_total) as i64;
                StakeResolution {
                    stake_id: stake.id,
                    staker: stake.staker.clone(),
                    outcome: StakeOutcome::Won,
                    payout,
                }
            } else {
                StakeResolution {
                    stake_id: stake.id,
                    staker: stake.staker.clone(),
                    outcome: StakeOutcome::Lost,
                    payout: 0,
                }
            }
        })
        .collect()
}

/// Per-match stake totals. Matches without stakes have no entry.
pub fn match_totals(stakes: &[Stake]) -> BTreeMap<String, MatchStakeTotals> {
    let mut out: BTreeMap<String, MatchStakeTotals> = BTreeMap::new();
    for stake in stakes {
        out.entry(stake.match_id.clone())
            .or_insert_with(|| MatchStakeTotals::new(&stake.match_id))
            .add(&stake.backed_participant, stake.amount);
    }
    out
}

/// Per-identity leaderboard counters.
pub fn leaderboard_stats(matches: &[Match], stakes: &[Stake]) -> BTreeMap<String, PlayerStats> {
    let mut out: BTreeMap<String, PlayerStats> = BTreeMap::new();

    for stake in stakes {
        let stats = out
            .entry(stake.staker.clone())
            .or_insert_with(|| PlayerStats::new(&stake.staker));
        stats.add(PlayerStat::TotalStaked, stake.amount);
        if stake.outcome == StakeOutcome::Won {
            stats.add(PlayerStat::TotalRewards, stake.payout.unwrap_or(0));
        }
    }

    for m in matches.iter().filter(|m| m.status == MatchStatus::Completed) {
        for participant in m.participants() {
            let stats = out
                .entry(participant.to_string())
                .or_insert_with(|| PlayerStats::new(participant));
            stats.add(PlayerStat::GamesPlayed, 1);
            if m.winner.as_deref() == Some(participant) {
                stats.add(PlayerStat::GamesWon, 1);
            }
        }
    }

    out
}

/// Leaderboard score is the number of games won.
pub fn rank_scores(stats: &BTreeMap<String, PlayerStats>) -> BTreeMap<String, i64> {
    stats
        .iter()
        .map(|(identity, s)| (identity.clone(), s.games_won))
        .collect()
}

/// Everything the cache should hold for a ledger snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DerivedAggregates {
    pub match_stakes: BTreeMap<String, MatchStakeTotals>,
    pub player_stats: BTreeMap<String, PlayerStats>,
    pub rank_scores: BTreeMap<String, i64>,
}

pub fn derive_all(snapshot: &LedgerSnapshot) -> DerivedAggregates {
    let player_stats = leaderboard_stats(&snapshot.matches, &snapshot.stakes);
    DerivedAggregates {
        match_stakes: match_totals(&snapshot.stakes),
        rank_scores: rank_scores(&player_stats),
        player_stats,
    }
}

/// Incremental cache updates implied by one committed ledger mutation.
pub fn cache_deltas(effects: &CommitEffects) -> Vec<CacheDelta> {
    match effects {
        CommitEffects::StakeRecorded(stake) => vec![
            CacheDelta::MatchStake {
                match_id: stake.match_id.clone(),
                participant: stake.backed_participant.clone(),
                delta: stake.amount,
            },
            CacheDelta::PlayerStat {
                identity: stake.staker.clone(),
                stat: PlayerStat::TotalStaked,
                delta: stake.amount,
            },
            CacheDelta::Rank {
                identity: stake.staker.clone(),
                delta: 0,
            },
        ],
        CommitEffects::MatchSettled {
            settled,
            resolutions,
        } => {
            let mut deltas = Vec::new();
            for participant in settled.participants() {
                deltas.push(CacheDelta::PlayerStat {
                    identity: participant.to_string(),
                    stat: PlayerStat::GamesPlayed,
                    delta: 1,
                });
                let won = settled.winner.as_deref() == Some(participant);
                if won {
                    deltas.push(CacheDelta::PlayerStat {
                        identity: participant.to_string(),
                        stat: PlayerStat::GamesWon,
                        delta: 1,
                    });
                }
                deltas.push(CacheDelta::Rank {
                    identity: participant.to_string(),
                    delta: if won { 1 } else { 0 },
                });
            }
            for resolution in resolutions
                .iter()
                .filter(|r| r.outcome == StakeOutcome::Won && r.payout > 0)
            {
                deltas.push(CacheDelta::PlayerStat {
                    identity: resolution.staker.clone(),
                    stat: PlayerStat::TotalRewards,
                    delta: resolution.payout,
                });
            }
            deltas
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn stake(id: i64, match_id: &str, staker: &str, backed: &str, amount: i64) -> Stake {
        Stake {
            id,
            match_id: match_id.to_string(),
            staker: staker.to_string(),
            backed_participant: backed.to_string(),
            amount,
            txid: format!("tx{}", id),
            outcome: StakeOutcome::Pending,
            payout: None,
            created_at: Utc::now(),
        }
    }

    fn completed(id: &str, one: &str, two: &str, winner: Option<&str>) -> Match {
        let mut m = Match::new(id, one, 10);
        m.player_two = Some(two.to_string());
        m.status = MatchStatus::Completed;
        m.settled = true;
        m.winner = winner.map(str::to_string);
        m
    }

    #[test]
    fn winners_split_the_pool_pro_rata() {
        let stakes = vec![
            stake(1, "m1", "a", "p1", 300),
            stake(2, "m1", "b", "p1", 100),
            stake(3, "m1", "c", "p2", 400),
        ];
        let resolved = resolve_stakes(&stakes, Some("p1"));
        assert_eq!(resolved.len(), 3);
        assert_eq!(resolved[0].outcome, StakeOutcome::Won);
        assert_eq!(resolved[0].payout, 600);
        assert_eq!(resolved[1].payout, 200);
        assert_eq!(resolved[2].outcome, StakeOutcome::Lost);
        assert_eq!(resolved[2].payout, 0);
    }

    #[test]
    fn void_match_resolves_nothing() {
        let stakes = vec![stake(1, "m1", "a", "p1", 300)];
        assert!(resolve_stakes(&stakes, None).is_empty());
    }

    #[test]
    fn nobody_backing_winner_refunds_everyone() {
        let stakes = vec![
            stake(1, "m1", "a", "p2", 300),
            stake(2, "m1", "b", "p2", 100),
        ];
        let resolved = resolve_stakes(&stakes, Some("p1"));
        assert_eq!(resolved.len(), 2);
        assert!(resolved.iter().all(|r| r.outcome == StakeOutcome::Refunded));
        assert_eq!(resolved[0].payout, 300);
        assert_eq!(resolved[1].payout, 100);
    }

    #[test]
    fn refunds_are_not_rewards() {
        let mut refunded = stake(1, "m1", "a", "p2", 300);
        refunded.outcome = StakeOutcome::Refunded;
        refunded.payout = Some(300);
        let stats = leaderboard_stats(&[], &[refunded]);
        assert_eq!(stats["a"].total_staked, 300);
        assert_eq!(stats["a"].total_rewards, 0);
    }

    #[test]
    fn already_resolved_stakes_are_skipped() {
        let mut s = stake(1, "m1", "a", "p1", 300);
        s.outcome = StakeOutcome::Won;
        s.payout = Some(300);
        assert!(resolve_stakes(&[s], Some("p1")).is_empty());
    }

    #[test]
    fn leaderboard_counts_games_stakes_and_rewards() {
        let mut s1 = stake(1, "m1", "p1", "p1", 5_000_000);
        s1.outcome = StakeOutcome::Won;
        s1.payout = Some(5_000_000);
        let matches = vec![completed("m1", "p1", "p2", Some("p1"))];
        let stats = leaderboard_stats(&matches, &[s1]);

        let p1 = &stats["p1"];
        assert_eq!(p1.total_staked, 5_000_000);
        assert_eq!(p1.games_played, 1);
        assert_eq!(p1.games_won, 1);
        assert_eq!(p1.total_rewards, 5_000_000);
        let p2 = &stats["p2"];
        assert_eq!(p2.games_played, 1);
        assert_eq!(p2.games_won, 0);
        assert_eq!(rank_scores(&stats)["p1"], 1);
    }

    #[test]
    fn deltas_match_pure_function_for_settlement() {
        let settled = completed("m1", "p1", "p2", Some("p2"));
        let effects = CommitEffects::MatchSettled {
            settled: settled.clone(),
            resolutions: vec![StakeResolution {
                stake_id: 1,
                staker: "x".to_string(),
                outcome: StakeOutcome::Won,
                payout: 40,
            }],
        };
        let deltas = cache_deltas(&effects);
        assert!(deltas.contains(&CacheDelta::Rank {
            identity: "p2".to_string(),
            delta: 1
        }));
        assert!(deltas.contains(&CacheDelta::Rank {
            identity: "p1".to_string(),
            delta: 0
        }));
        assert!(deltas.contains(&CacheDelta::PlayerStat {
            identity: "x".to_string(),
            stat: PlayerStat::TotalRewards,
            delta: 40
        }));
    }
}
