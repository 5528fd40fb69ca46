use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool, Postgres, Transaction};

use crate::{
    config::Config,
    crypto::hash,
    error::{AppError, Result},
    models::*,
    services::aggregation::resolve_stakes,
};

pub mod memory;
pub mod store;

pub use memory::InMemoryLedger;
pub use store::{CommitEffects, CommitOutcome, LedgerSnapshot, LedgerStore};

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(config: &Config) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .connect(&config.database_url)
            .await?;

        Ok(Self { pool })
    }

    pub async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// ==================== COMMIT HELPERS ====================

async fn lock_match(
    tx: &mut Transaction<'_, Postgres>,
    match_id: &str,
    exclusive: bool,
) -> Result<Match> {
    let sql = if exclusive {
        "SELECT * FROM matches WHERE id = $1 FOR UPDATE"
    } else {
        "SELECT * FROM matches WHERE id = $1 FOR SHARE"
    };
    sqlx::query_as::<_, Match>(sql)
        .bind(match_id)
        .fetch_optional(&mut **tx)
        .await?
        .ok_or_else(|| AppError::CommitFailed(format!("match {} not found", match_id)))
}

/// Returns false when the `(match_id, txid)` proof already exists.
async fn insert_proof(
    tx: &mut Transaction<'_, Postgres>,
    txid: &str,
    fact: &SettlementFact,
    payload: &serde_json::Value,
) -> Result<bool> {
    let digest = hash::payload_digest(payload);
    let inserted: Option<i64> = sqlx::query_scalar(
        r#"
        INSERT INTO chain_proofs (match_id, txid, fact_kind, payload, payload_digest)
        VALUES ($1, $2, $3, $4, $5)
        ON CONFLICT (match_id, txid) DO NOTHING
        RETURNING id
        "#,
    )
    .bind(fact.match_id())
    .bind(txid)
    .bind(fact.kind())
    .bind(sqlx::types::Json(payload))
    .bind(digest)
    .fetch_optional(&mut **tx)
    .await?;
    Ok(inserted.is_some())
}

async fn apply_match_result(
    tx: &mut Transaction<'_, Postgres>,
    current: &Match,
    fact: &MatchResultFact,
) -> Result<CommitEffects> {
    current
        .check_settlement(fact.winner.as_deref())
        .map_err(AppError::CommitFailed)?;

    let stakes = sqlx::query_as::<_, Stake>(
        "SELECT * FROM stakes WHERE match_id = $1 ORDER BY id ASC FOR UPDATE",
    )
    .bind(&fact.match_id)
    .fetch_all(&mut **tx)
    .await?;

    let settled = sqlx::query_as::<_, Match>(
        r#"
        UPDATE matches
        SET status = 'completed', winner = $2, settled = TRUE, settled_at = NOW()
        WHERE id = $1 AND status = 'active'
        RETURNING *
        "#,
    )
    .bind(&fact.match_id)
    .bind(&fact.winner)
    .fetch_optional(&mut **tx)
    .await?
    .ok_or_else(|| AppError::CommitFailed(format!("match {} is not active", fact.match_id)))?;

    let resolutions = resolve_stakes(&stakes, fact.winner.as_deref());
    for resolution in &resolutions {
        sqlx::query(
            "UPDATE stakes SET outcome = $2, payout = $3 WHERE id = $1 AND outcome = 'pending'",
        )
        .bind(resolution.stake_id)
        .bind(resolution.outcome)
        .bind(resolution.payout)
        .execute(&mut **tx)
        .await?;
    }

    Ok(CommitEffects::MatchSettled {
        settled,
        resolutions,
    })
}

async fn apply_stake(
    tx: &mut Transaction<'_, Postgres>,
    current: &Match,
    txid: &str,
    fact: &StakeFact,
) -> Result<CommitEffects> {
    current
        .check_stake(&fact.backed_participant)
        .map_err(AppError::CommitFailed)?;

    let stake = sqlx::query_as::<_, Stake>(
        r#"
        INSERT INTO stakes (match_id, staker, backed_participant, amount, txid)
        VALUES ($1, $2, $3, $4, $5)
        RETURNING *
        "#,
    )
    .bind(&fact.match_id)
    .bind(&fact.staker)
    .bind(&fact.backed_participant)
    .bind(fact.amount)
    .bind(txid)
    .fetch_one(&mut **tx)
    .await?;

    Ok(CommitEffects::StakeRecorded(stake))
}

// ==================== LEDGER STORE ====================
#[async_trait]
impl LedgerStore for Database {
    async fn create_match(&self, id: &str, player_one: &str, entry_fee: i64) -> Result<Match> {
        if entry_fee <= 0 {
            return Err(AppError::BadRequest(
                "Entry fee must be greater than zero".to_string(),
            ));
        }
        sqlx::query_as::<_, Match>(
            r#"
            INSERT INTO matches (id, player_one, entry_fee)
            VALUES ($1, $2, $3)
            ON CONFLICT (id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(player_one)
        .bind(entry_fee)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| AppError::Conflict(format!("match {} already exists", id)))
    }

    async fn join_match(&self, id: &str, player: &str) -> Result<Match> {
        let mut tx = self.pool.begin().await?;
        let current = sqlx::query_as::<_, Match>("SELECT * FROM matches WHERE id = $1 FOR UPDATE")
            .bind(id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("match {} not found", id)))?;
        current.check_join(player).map_err(AppError::Conflict)?;

        let joined = sqlx::query_as::<_, Match>(
            r#"
            UPDATE matches SET player_two = $2, status = 'active'
            WHERE id = $1 AND status = 'pending' AND player_two IS NULL
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(player)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(joined)
    }

    async fn get_match(&self, id: &str) -> Result<Option<Match>> {
        let row = sqlx::query_as::<_, Match>("SELECT * FROM matches WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn commit_fact(
        &self,
        txid: &str,
        fact: &SettlementFact,
        payload: &serde_json::Value,
    ) -> Result<CommitOutcome> {
        let mut tx = self.pool.begin().await?;

        // Settlement takes the row exclusively; stakes only need it to stay put.
        let exclusive = matches!(fact, SettlementFact::MatchResult(_));
        let current = lock_match(&mut tx, fact.match_id(), exclusive).await?;

        if !insert_proof(&mut tx, txid, fact, payload).await? {
            tx.rollback().await?;
            return Ok(CommitOutcome::Duplicate);
        }

        let effects = match fact {
            SettlementFact::MatchResult(result) => {
                apply_match_result(&mut tx, &current, result).await?
            }
            SettlementFact::Stake(stake) => apply_stake(&mut tx, &current, txid, stake).await?,
        };

        tx.commit().await?;
        Ok(CommitOutcome::Applied(effects))
    }

    async fn proofs_for_txid(&self, txid: &str) -> Result<Vec<ChainProof>> {
        let rows = sqlx::query_as::<_, ChainProof>(
            "SELECT * FROM chain_proofs WHERE txid = $1 ORDER BY inserted_at ASC",
        )
        .bind(txid)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn stakes_for_match(&self, match_id: &str) -> Result<Vec<Stake>> {
        let rows = sqlx::query_as::<_, Stake>(
            "SELECT * FROM stakes WHERE match_id = $1 ORDER BY id ASC",
        )
        .bind(match_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn stakes_for_staker(&self, staker: &str) -> Result<Vec<Stake>> {
        let rows = sqlx::query_as::<_, Stake>(
            "SELECT * FROM stakes WHERE staker = $1 ORDER BY created_at DESC",
        )
        .bind(staker)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn snapshot(&self) -> Result<LedgerSnapshot> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await?;

        let matches = sqlx::query_as::<_, Match>("SELECT * FROM matches ORDER BY id ASC")
            .fetch_all(&mut *tx)
            .await?;
        let stakes = sqlx::query_as::<_, Stake>("SELECT * FROM stakes ORDER BY id ASC")
            .fetch_all(&mut *tx)
            .await?;
        tx.commit().await?;

        Ok(LedgerSnapshot { matches, stakes })
    }

    async fn ping(&self) -> bool {
        self.pool.acquire().await.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn database_new_returns_error_on_invalid_url() {
        let mut config = crate::config::test_config();
        config.database_url = "not-a-url".to_string();
        let result = Database::new(&config).await;
        assert!(result.is_err());
    }
}
