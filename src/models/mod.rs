// src/models/mod.rs
pub mod aggregate;
pub mod fact;
pub mod ledger;
pub mod response;

// Re-export commonly used types so other modules can use `crate::models::X`
pub use aggregate::{LeaderboardEntry, MatchStakeTotals, PlayerStat, PlayerStats};
pub use fact::{FactClaim, FactKind, MatchResultFact, NoteHint, SettlementFact, SettlementRequest, StakeFact};
pub use ledger::{ChainProof, Match, MatchStatus, Stake, StakeOutcome};
pub use response::ApiResponse;
