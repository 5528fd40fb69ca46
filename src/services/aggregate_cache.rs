//! Derived aggregate cache.
//!
//! Every value here can be recomputed from the ledger. Commits feed it
//! incremental deltas; the reconciliation job overwrites it from a snapshot.

use async_trait::async_trait;
use redis::{aio::ConnectionManager, RedisResult};
use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Mutex, MutexGuard,
    },
    time::Duration,
};

use crate::{
    constants::{LEADERBOARD_KEY, MATCH_STAKES_PREFIX, MATCH_STAKES_TOTAL_FIELD, PLAYER_STATS_PREFIX},
    error::{AppError, Result},
    models::{LeaderboardEntry, MatchStakeTotals, PlayerStat, PlayerStats},
    services::aggregation::DerivedAggregates,
};

/// One commutative cache increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheDelta {
    MatchStake {
        match_id: String,
        participant: String,
        delta: i64,
    },
    PlayerStat {
        identity: String,
        stat: PlayerStat,
        delta: i64,
    },
    /// A zero delta still registers the identity on the leaderboard.
    Rank { identity: String, delta: i64 },
}

pub fn match_stakes_key(match_id: &str) -> String {
    format!("{}{}", MATCH_STAKES_PREFIX, match_id)
}

pub fn player_stats_key(identity: &str) -> String {
    format!("{}{}", PLAYER_STATS_PREFIX, identity)
}

#[async_trait]
pub trait AggregateCache: Send + Sync {
    /// Applies a group of deltas as one unit.
    async fn apply(&self, deltas: &[CacheDelta]) -> Result<()>;

    async fn bump_match_stake(&self, match_id: &str, participant: &str, delta: i64) -> Result<()> {
        self.apply(&[CacheDelta::MatchStake {
            match_id: match_id.to_string(),
            participant: participant.to_string(),
            delta,
        }])
        .await
    }

    async fn bump_player_stat(&self, identity: &str, stat: PlayerStat, delta: i64) -> Result<()> {
        self.apply(&[CacheDelta::PlayerStat {
            identity: identity.to_string(),
            stat,
            delta,
        }])
        .await
    }

    async fn bump_rank(&self, identity: &str, delta: i64) -> Result<()> {
        self.apply(&[CacheDelta::Rank {
            identity: identity.to_string(),
            delta,
        }])
        .await
    }

    /// Overwrites every match stake hash and deletes hashes for matches not in
    /// `totals`. Returns the number of stale keys removed.
    async fn replace_match_stakes(&self, totals: &BTreeMap<String, MatchStakeTotals>)
        -> Result<usize>;

    /// Rebuilds the leaderboard set and every per-identity stats hash.
    async fn replace_leaderboard(
        &self,
        stats: &BTreeMap<String, PlayerStats>,
        scores: &BTreeMap<String, i64>,
    ) -> Result<()>;

    /// Highest scores first; equal scores by identity descending.
    async fn top(&self, limit: usize) -> Result<Vec<LeaderboardEntry>>;

    async fn player_stats(&self, identity: &str) -> Result<Option<PlayerStats>>;

    async fn match_totals(&self, match_id: &str) -> Result<Option<MatchStakeTotals>>;

    async fn ping(&self) -> bool;
}

fn stats_from_hash(identity: &str, fields: &HashMap<String, i64>) -> PlayerStats {
    let mut stats = PlayerStats::new(identity);
    for (field, value) in fields {
        if let Some(stat) = PlayerStat::from_field(field) {
            stats.add(stat, *value);
        }
    }
    stats
}

fn totals_from_hash(match_id: &str, fields: &HashMap<String, i64>) -> MatchStakeTotals {
    let mut totals = MatchStakeTotals::new(match_id);
    for (field, value) in fields {
        if field == MATCH_STAKES_TOTAL_FIELD {
            totals.total = *value;
        } else {
            totals.by_participant.insert(field.clone(), *value);
        }
    }
    totals
}

// ==================== REDIS ====================

#[derive(Clone)]
pub struct RedisAggregateCache {
    conn: ConnectionManager,
    timeout: Duration,
}

impl RedisAggregateCache {
    pub fn new(conn: ConnectionManager, timeout: Duration) -> Self {
        Self { conn, timeout }
    }

    async fn timed<T>(&self, fut: impl Future<Output = RedisResult<T>>) -> Result<T> {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(AppError::CacheTimeout),
        }
    }

    async fn scan_keys(&self, pattern: &str) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut keys = Vec::new();
        loop {
            let (next, batch): (u64, Vec<String>) = self
                .timed(
                    redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(pattern)
                        .arg("COUNT")
                        .arg(200)
                        .query_async(&mut conn),
                )
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }
        Ok(keys)
    }

    async fn hash(&self, key: &str) -> Result<HashMap<String, i64>> {
        let mut conn = self.conn.clone();
        self.timed(redis::cmd("HGETALL").arg(key).query_async(&mut conn))
            .await
    }
}

#[async_trait]
impl AggregateCache for RedisAggregateCache {
    async fn apply(&self, deltas: &[CacheDelta]) -> Result<()> {
        if deltas.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        pipe.atomic();
        for delta in deltas {
            match delta {
                CacheDelta::MatchStake {
                    match_id,
                    participant,
                    delta,
                } => {
                    let key = match_stakes_key(match_id);
                    pipe.hincr(&key, participant, *delta).ignore();
                    pipe.hincr(&key, MATCH_STAKES_TOTAL_FIELD, *delta).ignore();
                }
                CacheDelta::PlayerStat {
                    identity,
                    stat,
                    delta,
                } => {
                    pipe.hincr(player_stats_key(identity), stat.field(), *delta)
                        .ignore();
                }
                CacheDelta::Rank { identity, delta } => {
                    pipe.zincr(LEADERBOARD_KEY, identity, *delta).ignore();
                }
            }
        }
        let mut conn = self.conn.clone();
        self.timed(pipe.query_async::<()>(&mut conn)).await
    }

    async fn replace_match_stakes(
        &self,
        totals: &BTreeMap<String, MatchStakeTotals>,
    ) -> Result<usize> {
        let existing = self.scan_keys(&format!("{}*", MATCH_STAKES_PREFIX)).await?;
        let stale: Vec<&String> = existing
            .iter()
            .filter(|key| {
                key.strip_prefix(MATCH_STAKES_PREFIX)
                    .map_or(true, |id| !totals.contains_key(id))
            })
            .collect();

        let mut pipe = redis::pipe();
        pipe.atomic();
        for key in &stale {
            pipe.del(*key).ignore();
        }
        for (match_id, match_totals) in totals {
            let key = match_stakes_key(match_id);
            let mut fields: Vec<(String, i64)> = match_totals
                .by_participant
                .iter()
                .map(|(participant, amount)| (participant.clone(), *amount))
                .collect();
            fields.push((MATCH_STAKES_TOTAL_FIELD.to_string(), match_totals.total));
            pipe.del(&key).ignore();
            pipe.hset_multiple(&key, &fields).ignore();
        }

        let mut conn = self.conn.clone();
        self.timed(pipe.query_async::<()>(&mut conn)).await?;
        Ok(stale.len())
    }

    async fn replace_leaderboard(
        &self,
        stats: &BTreeMap<String, PlayerStats>,
        scores: &BTreeMap<String, i64>,
    ) -> Result<()> {
        let existing = self.scan_keys(&format!("{}*", PLAYER_STATS_PREFIX)).await?;

        let mut pipe = redis::pipe();
        pipe.atomic();
        pipe.del(LEADERBOARD_KEY).ignore();
        for key in &existing {
            pipe.del(key).ignore();
        }
        for (identity, score) in scores {
            pipe.zadd(LEADERBOARD_KEY, identity, *score).ignore();
        }
        for (identity, s) in stats {
            let fields = [
                PlayerStat::TotalStaked,
                PlayerStat::GamesPlayed,
                PlayerStat::GamesWon,
                PlayerStat::TotalRewards,
            ]
            .map(|stat| (stat.field(), s.get(stat)));
            pipe.hset_multiple(player_stats_key(identity), &fields)
                .ignore();
        }

        let mut conn = self.conn.clone();
        self.timed(pipe.query_async::<()>(&mut conn)).await
    }

    async fn top(&self, limit: usize) -> Result<Vec<LeaderboardEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let ranked: Vec<(String, i64)> = self
            .timed(
                redis::cmd("ZREVRANGE")
                    .arg(LEADERBOARD_KEY)
                    .arg(0)
                    .arg(limit as i64 - 1)
                    .arg("WITHSCORES")
                    .query_async(&mut conn),
            )
            .await?;
        if ranked.is_empty() {
            return Ok(Vec::new());
        }

        let mut pipe = redis::pipe();
        for (identity, _) in &ranked {
            pipe.hgetall(player_stats_key(identity));
        }
        let hashes: Vec<HashMap<String, i64>> =
            self.timed(pipe.query_async(&mut conn)).await?;

        Ok(ranked
            .iter()
            .zip(hashes.iter())
            .enumerate()
            .map(|(idx, ((identity, _), fields))| {
                stats_from_hash(identity, fields).into_entry(idx as i64 + 1)
            })
            .collect())
    }

    async fn player_stats(&self, identity: &str) -> Result<Option<PlayerStats>> {
        let fields = self.hash(&player_stats_key(identity)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(stats_from_hash(identity, &fields)))
    }

    async fn match_totals(&self, match_id: &str) -> Result<Option<MatchStakeTotals>> {
        let fields = self.hash(&match_stakes_key(match_id)).await?;
        if fields.is_empty() {
            return Ok(None);
        }
        Ok(Some(totals_from_hash(match_id, &fields)))
    }

    async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        self.timed(redis::cmd("PING").query_async::<String>(&mut conn))
            .await
            .is_ok()
    }
}

// ==================== IN-MEMORY ====================

/// Process-local cache behind the same trait, for tests.
#[derive(Default)]
pub struct InMemoryAggregateCache {
    state: Mutex<DerivedAggregates>,
    unavailable: AtomicBool,
}

impl InMemoryAggregateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every operation fails as if the cache were unreachable.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> DerivedAggregates {
        self.lock().clone()
    }

    fn lock(&self) -> MutexGuard<'_, DerivedAggregates> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::CacheTimeout);
        }
        Ok(())
    }
}

fn apply_delta(state: &mut DerivedAggregates, delta: &CacheDelta) {
    match delta {
        CacheDelta::MatchStake {
            match_id,
            participant,
            delta,
        } => state
            .match_stakes
            .entry(match_id.clone())
            .or_insert_with(|| MatchStakeTotals::new(match_id))
            .add(participant, *delta),
        CacheDelta::PlayerStat {
            identity,
            stat,
            delta,
        } => state
            .player_stats
            .entry(identity.clone())
            .or_insert_with(|| PlayerStats::new(identity))
            .add(*stat, *delta),
        CacheDelta::Rank { identity, delta } => {
            *state.rank_scores.entry(identity.clone()).or_insert(0) += delta;
        }
    }
}

#[async_trait]
impl AggregateCache for InMemoryAggregateCache {
    async fn apply(&self, deltas: &[CacheDelta]) -> Result<()> {
        self.check_available()?;
        let mut state = self.lock();
        for delta in deltas {
            apply_delta(&mut state, delta);
        }
        Ok(())
    }

    async fn replace_match_stakes(
        &self,
        totals: &BTreeMap<String, MatchStakeTotals>,
    ) -> Result<usize> {
        self.check_available()?;
        let mut state = self.lock();
        let stale = state
            .match_stakes
            .keys()
            .filter(|id| !totals.contains_key(*id))
            .count();
        state.match_stakes = totals.clone();
        Ok(stale)
    }

    async fn replace_leaderboard(
        &self,
        stats: &BTreeMap<String, PlayerStats>,
        scores: &BTreeMap<String, i64>,
    ) -> Result<()> {
        self.check_available()?;
        let mut state = self.lock();
        state.player_stats = stats.clone();
        state.rank_scores = scores.clone();
        Ok(())
    }

    async fn top(&self, limit: usize) -> Result<Vec<LeaderboardEntry>> {
        self.check_available()?;
        let state = self.lock();
        let mut ranked: Vec<(&String, i64)> =
            state.rank_scores.iter().map(|(id, s)| (id, *s)).collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| b.0.cmp(a.0)));

        Ok(ranked
            .into_iter()
            .take(limit)
            .enumerate()
            .map(|(idx, (identity, _))| {
                state
                    .player_stats
                    .get(identity)
                    .cloned()
                    .unwrap_or_else(|| PlayerStats::new(identity))
                    .into_entry(idx as i64 + 1)
            })
            .collect())
    }

    async fn player_stats(&self, identity: &str) -> Result<Option<PlayerStats>> {
        self.check_available()?;
        Ok(self.lock().player_stats.get(identity).cloned())
    }

    async fn match_totals(&self, match_id: &str) -> Result<Option<MatchStakeTotals>> {
        self.check_available()?;
        Ok(self.lock().match_stakes.get(match_id).cloned())
    }

    async fn ping(&self) -> bool {
        self.check_available().is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_use_documented_layout() {
        assert_eq!(match_stakes_key("m1"), "match_stakes:m1");
        assert_eq!(player_stats_key("p1"), "leaderboard:stats:p1");
    }

    #[test]
    fn hash_decoding_ignores_unknown_fields() {
        let fields = HashMap::from([
            ("games_won".to_string(), 3),
            ("games_played".to_string(), 4),
            ("legacy_score".to_string(), 99),
        ]);
        let stats = stats_from_hash("p1", &fields);
        assert_eq!(stats.games_won, 3);
        assert_eq!(stats.games_played, 4);
        assert_eq!(stats.total_staked, 0);

        let totals = totals_from_hash(
            "m1",
            &HashMap::from([("p1".to_string(), 5), ("total".to_string(), 5)]),
        );
        assert_eq!(totals.total, 5);
        assert_eq!(totals.backing("p1"), 5);
        assert!(!totals.by_participant.contains_key("total"));
    }

    #[tokio::test]
    async fn bumps_accumulate() {
        let cache = InMemoryAggregateCache::new();
        cache.bump_match_stake("m1", "p1", 5).await.unwrap();
        cache.bump_match_stake("m1", "p2", 3).await.unwrap();
        cache.bump_player_stat("p1", PlayerStat::GamesWon, 1).await.unwrap();
        cache.bump_rank("p1", 1).await.unwrap();

        let totals = cache.match_totals("m1").await.unwrap().unwrap();
        assert_eq!(totals.total, 8);
        assert_eq!(cache.player_stats("p1").await.unwrap().unwrap().games_won, 1);
        assert!(cache.player_stats("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn top_orders_by_score_then_identity_descending() {
        let cache = InMemoryAggregateCache::new();
        cache
            .apply(&[
                CacheDelta::Rank { identity: "alice".into(), delta: 2 },
                CacheDelta::Rank { identity: "bob".into(), delta: 2 },
                CacheDelta::Rank { identity: "carol".into(), delta: 5 },
                CacheDelta::Rank { identity: "dave".into(), delta: 0 },
            ])
            .await
            .unwrap();

        let top = cache.top(3).await.unwrap();
        let order: Vec<&str> = top.iter().map(|e| e.address.as_str()).collect();
        assert_eq!(order, vec!["carol", "bob", "alice"]);
        assert_eq!(top[0].rank, 1);
        assert!(cache.top(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn replace_drops_stale_match_keys() {
        let cache = InMemoryAggregateCache::new();
        cache.bump_match_stake("old", "p1", 9).await.unwrap();
        let mut fresh = BTreeMap::new();
        let mut totals = MatchStakeTotals::new("m1");
        totals.add("p1", 4);
        fresh.insert("m1".to_string(), totals);

        let removed = cache.replace_match_stakes(&fresh).await.unwrap();
        assert_eq!(removed, 1);
        assert!(cache.match_totals("old").await.unwrap().is_none());
        assert_eq!(cache.match_totals("m1").await.unwrap().unwrap().total, 4);
    }

    #[tokio::test]
    async fn unavailable_cache_fails_every_call() {
        let cache = InMemoryAggregateCache::new();
        cache.set_unavailable(true);
        assert!(!cache.ping().await);
        assert!(matches!(
            cache.bump_rank("p1", 1).await,
            Err(AppError::CacheTimeout)
        ));
    }
}
