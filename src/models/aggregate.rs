use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::constants::{STAT_GAMES_PLAYED, STAT_GAMES_WON, STAT_TOTAL_REWARDS, STAT_TOTAL_STAKED};

/// Counters kept per identity in the derived cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PlayerStat {
    TotalStaked,
    GamesPlayed,
    GamesWon,
    TotalRewards,
}

impl PlayerStat {
    pub fn field(self) -> &'static str {
        match self {
            Self::TotalStaked => STAT_TOTAL_STAKED,
            Self::GamesPlayed => STAT_GAMES_PLAYED,
            Self::GamesWon => STAT_GAMES_WON,
            Self::TotalRewards => STAT_TOTAL_REWARDS,
        }
    }

    pub fn from_field(field: &str) -> Option<Self> {
        match field {
            STAT_TOTAL_STAKED => Some(Self::TotalStaked),
            STAT_GAMES_PLAYED => Some(Self::GamesPlayed),
            STAT_GAMES_WON => Some(Self::GamesWon),
            STAT_TOTAL_REWARDS => Some(Self::TotalRewards),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerStats {
    pub address: String,
    pub total_staked: i64,
    pub games_played: i64,
    pub games_won: i64,
    pub total_rewards: i64,
}

impl PlayerStats {
    pub fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ..Self::default()
        }
    }

    pub fn get(&self, stat: PlayerStat) -> i64 {
        match stat {
            PlayerStat::TotalStaked => self.total_staked,
            PlayerStat::GamesPlayed => self.games_played,
            PlayerStat::GamesWon => self.games_won,
            PlayerStat::TotalRewards => self.total_rewards,
        }
    }

    pub fn add(&mut self, stat: PlayerStat, delta: i64) {
        match stat {
            PlayerStat::TotalStaked => self.total_staked += delta,
            PlayerStat::GamesPlayed => self.games_played += delta,
            PlayerStat::GamesWon => self.games_won += delta,
            PlayerStat::TotalRewards => self.total_rewards += delta,
        }
    }

    /// Win rate in percent, two decimal places.
    pub fn win_rate(&self) -> Decimal {
        if self.games_played <= 0 {
            return Decimal::ZERO;
        }
        (Decimal::from(self.games_won) * Decimal::from(100) / Decimal::from(self.games_played))
            .round_dp(2)
    }

    pub fn into_entry(self, rank: i64) -> LeaderboardEntry {
        LeaderboardEntry {
            rank,
            win_rate: self.win_rate(),
            address: self.address,
            total_staked: self.total_staked,
            games_played: self.games_played,
            games_won: self.games_won,
            total_rewards: self.total_rewards,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeaderboardEntry {
    pub rank: i64,
    pub address: String,
    pub total_staked: i64,
    pub games_played: i64,
    pub games_won: i64,
    pub win_rate: Decimal,
    pub total_rewards: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchStakeTotals {
    pub match_id: String,
    pub by_participant: BTreeMap<String, i64>,
    pub total: i64,
}

impl MatchStakeTotals {
    pub fn new(match_id: &str) -> Self {
        Self {
            match_id: match_id.to_string(),
            ..Self::default()
        }
    }

    pub fn add(&mut self, participant: &str, amount: i64) {
        *self.by_participant.entry(participant.to_string()).or_insert(0) += amount;
        self.total += amount;
    }

    pub fn backing(&self, participant: &str) -> i64 {
        self.by_participant.get(participant).copied().unwrap_or(0)
    }
}
