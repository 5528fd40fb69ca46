use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

use super::fact::FactKind;

// ==================== MATCH ====================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MatchStatus {
    Pending,
    Active,
    Completed,
}

impl MatchStatus {
    fn rank(self) -> u8 {
        match self {
            Self::Pending => 0,
            Self::Active => 1,
            Self::Completed => 2,
        }
    }

    /// Status only moves one step forward: pending -> active -> completed.
    pub fn can_advance_to(self, next: MatchStatus) -> bool {
        next.rank() == self.rank() + 1
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Match {
    pub id: String,
    pub player_one: String,
    pub player_two: Option<String>,
    pub entry_fee: i64,
    pub status: MatchStatus,
    pub winner: Option<String>,
    pub settled: bool,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
}

impl Match {
    pub fn new(id: &str, player_one: &str, entry_fee: i64) -> Self {
        Self {
            id: id.to_string(),
            player_one: player_one.to_string(),
            player_two: None,
            entry_fee,
            status: MatchStatus::Pending,
            winner: None,
            settled: false,
            created_at: Utc::now(),
            settled_at: None,
        }
    }

    pub fn participants(&self) -> Vec<&str> {
        let mut out = vec![self.player_one.as_str()];
        if let Some(two) = self.player_two.as_deref() {
            out.push(two);
        }
        out
    }

    pub fn is_participant(&self, identity: &str) -> bool {
        self.participants().contains(&identity)
    }

    /// Checks a join request against the lifecycle rules.
    pub fn check_join(&self, player: &str) -> std::result::Result<(), String> {
        if self.status != MatchStatus::Pending {
            return Err(format!("match {} is {}, not open for joining", self.id, self.status.as_str()));
        }
        if self.player_two.is_some() {
            return Err(format!("match {} is full", self.id));
        }
        if self.player_one == player {
            return Err("cannot join your own match".to_string());
        }
        Ok(())
    }

    /// Checks a settlement against the lifecycle rules.
    pub fn check_settlement(&self, winner: Option<&str>) -> std::result::Result<(), String> {
        if self.settled || self.status == MatchStatus::Completed {
            return Err(format!("match {} is already settled", self.id));
        }
        if !self.status.can_advance_to(MatchStatus::Completed) {
            return Err(format!("match {} is {}, not active", self.id, self.status.as_str()));
        }
        if let Some(winner) = winner {
            if !self.is_participant(winner) {
                return Err(format!("winner {} is not a participant of match {}", winner, self.id));
            }
        }
        Ok(())
    }

    /// Stakes are accepted until the match completes. Before a second player
    /// joins, only the creator can be backed.
    pub fn check_stake(&self, backed_participant: &str) -> std::result::Result<(), String> {
        if self.status == MatchStatus::Completed || self.settled {
            return Err(format!("match {} is already completed", self.id));
        }
        if self.status == MatchStatus::Pending && backed_participant != self.player_one {
            return Err(format!(
                "match {} has no second player yet; only {} can be backed",
                self.id, self.player_one
            ));
        }
        if !self.is_participant(backed_participant) {
            return Err(format!(
                "{} is not a participant of match {}",
                backed_participant, self.id
            ));
        }
        Ok(())
    }
}

// ==================== STAKE ====================
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum StakeOutcome {
    Pending,
    Won,
    Lost,
    /// Nobody backed the winner, so the stake is paid back.
    Refunded,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, FromRow)]
pub struct Stake {
    pub id: i64,
    pub match_id: String,
    pub staker: String,
    pub backed_participant: String,
    pub amount: i64,
    pub txid: String,
    pub outcome: StakeOutcome,
    pub payout: Option<i64>,
    pub created_at: DateTime<Utc>,
}

// ==================== CHAIN PROOF ====================
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct ChainProof {
    pub id: i64,
    pub match_id: String,
    pub txid: String,
    pub fact_kind: FactKind,
    pub payload: serde_json::Value,
    pub payload_digest: String,
    pub inserted_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn active_match() -> Match {
        let mut m = Match::new("m1", "p1", 1_000_000);
        m.player_two = Some("p2".to_string());
        m.status = MatchStatus::Active;
        m
    }

    #[test]
    fn status_only_advances_one_step() {
        assert!(MatchStatus::Pending.can_advance_to(MatchStatus::Active));
        assert!(MatchStatus::Active.can_advance_to(MatchStatus::Completed));
        assert!(!MatchStatus::Pending.can_advance_to(MatchStatus::Completed));
        assert!(!MatchStatus::Completed.can_advance_to(MatchStatus::Pending));
        assert!(!MatchStatus::Completed.can_advance_to(MatchStatus::Active));
    }

    #[test]
    fn settlement_requires_participant_winner() {
        let m = active_match();
        assert!(m.check_settlement(Some("p1")).is_ok());
        assert!(m.check_settlement(None).is_ok());
        assert!(m.check_settlement(Some("p3")).is_err());
    }

    #[test]
    fn completed_match_rejects_settlement_and_stakes() {
        let mut m = active_match();
        m.status = MatchStatus::Completed;
        m.settled = true;
        assert!(m.check_settlement(Some("p1")).is_err());
        assert!(m.check_stake("p1").is_err());
    }

    #[test]
    fn pending_match_only_backs_its_creator() {
        let m = Match::new("m1", "p1", 10);
        assert!(m.check_stake("p1").is_ok());
        assert!(m.check_stake("s1").is_err());
        assert!(m.check_stake("p2").is_err());

        let active = active_match();
        assert!(active.check_stake("p2").is_ok());
        assert!(active.check_stake("s1").is_err());
    }

    #[test]
    fn join_rules() {
        let m = Match::new("m1", "p1", 10);
        assert!(m.check_join("p1").is_err());
        assert!(m.check_join("p2").is_ok());
        assert!(active_match().check_join("p3").is_err());
    }
}
