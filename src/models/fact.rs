use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FactKind {
    MatchResult,
    Stake,
}

impl FactKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::MatchResult => "match_result",
            Self::Stake => "stake",
        }
    }
}

/// What the submitter claims the transaction proves, before verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FactClaim {
    MatchResult {
        winner: Option<String>,
    },
    Stake {
        staker: String,
        amount: Option<i64>,
        backed_participant: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRequest {
    pub txid: String,
    pub match_id: String,
    pub claim: FactClaim,
}

impl SettlementRequest {
    pub fn match_result(txid: &str, match_id: &str, winner: Option<&str>) -> Self {
        Self {
            txid: txid.trim().to_string(),
            match_id: match_id.trim().to_string(),
            claim: FactClaim::MatchResult {
                winner: winner.map(|w| w.trim().to_string()).filter(|w| !w.is_empty()),
            },
        }
    }

    pub fn stake(
        txid: &str,
        match_id: &str,
        staker: &str,
        amount: Option<i64>,
        backed_participant: Option<&str>,
    ) -> Self {
        Self {
            txid: txid.trim().to_string(),
            match_id: match_id.trim().to_string(),
            claim: FactClaim::Stake {
                staker: staker.trim().to_string(),
                amount,
                backed_participant: backed_participant
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty()),
            },
        }
    }

    pub fn kind(&self) -> FactKind {
        match self.claim {
            FactClaim::MatchResult { .. } => FactKind::MatchResult,
            FactClaim::Stake { .. } => FactKind::Stake,
        }
    }

    /// Shape checks that need no chain access.
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.txid.is_empty() {
            return Err("txid is required".to_string());
        }
        if self.match_id.is_empty() {
            return Err("match_id is required".to_string());
        }
        if let FactClaim::Stake { staker, amount, .. } = &self.claim {
            if staker.is_empty() {
                return Err("staker is required".to_string());
            }
            if matches!(amount, Some(a) if *a <= 0) {
                return Err("stake amount must be greater than zero".to_string());
            }
        }
        Ok(())
    }
}

/// Structured hint carried in a transaction note (base64-encoded JSON).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteHint {
    #[serde(default, alias = "matchId")]
    pub match_id: Option<String>,
    #[serde(default)]
    pub winner: Option<String>,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default, alias = "backed", alias = "predicted_winner")]
    pub backed_participant: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MatchResultFact {
    pub match_id: String,
    pub winner: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StakeFact {
    pub match_id: String,
    pub staker: String,
    pub backed_participant: String,
    pub amount: i64,
}

/// A verified, fully-typed fact ready for the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SettlementFact {
    MatchResult(MatchResultFact),
    Stake(StakeFact),
}

impl SettlementFact {
    pub fn match_id(&self) -> &str {
        match self {
            Self::MatchResult(fact) => &fact.match_id,
            Self::Stake(fact) => &fact.match_id,
        }
    }

    pub fn kind(&self) -> FactKind {
        match self {
            Self::MatchResult(_) => FactKind::MatchResult,
            Self::Stake(_) => FactKind::Stake,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_constructors_trim_and_drop_empty_optionals() {
        let req = SettlementRequest::match_result(" tx1 ", " m1 ", Some("  "));
        assert_eq!(req.txid, "tx1");
        assert_eq!(req.match_id, "m1");
        assert_eq!(req.claim, FactClaim::MatchResult { winner: None });
        assert_eq!(req.kind(), FactKind::MatchResult);
    }

    #[test]
    fn validate_rejects_missing_fields() {
        assert!(SettlementRequest::match_result("", "m1", None).validate().is_err());
        assert!(SettlementRequest::match_result("tx", "", None).validate().is_err());
        assert!(SettlementRequest::stake("tx", "m1", "", Some(1), None).validate().is_err());
        assert!(SettlementRequest::stake("tx", "m1", "p1", Some(0), None).validate().is_err());
        assert!(SettlementRequest::stake("tx", "m1", "p1", None, None).validate().is_ok());
    }

    #[test]
    fn note_hint_accepts_aliases() {
        let hint: NoteHint =
            serde_json::from_str(r#"{"matchId":"m1","predicted_winner":"p2","amount":7}"#).unwrap();
        assert_eq!(hint.match_id.as_deref(), Some("m1"));
        assert_eq!(hint.backed_participant.as_deref(), Some("p2"));
        assert_eq!(hint.amount, Some(7));
        assert_eq!(hint.winner, None);
    }
}
