use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{PointType, Points};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionOutcome {
    Granted,
    DeniedInsufficientBalance,
    Refunded,
}

impl TransactionOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionOutcome::Granted => "granted",
            TransactionOutcome::DeniedInsufficientBalance => "denied_insufficient_balance",
            TransactionOutcome::Refunded => "refunded",
        }
    }
}

/// One gate decision. Emitted to the `ledger` log target, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: Uuid,
    pub user_id: String,
    pub feature_id: Option<String>,
    pub point_type: PointType,
    pub cost: u32,
    pub outcome: TransactionOutcome,
    pub timestamp: DateTime<Utc>,
}

impl LedgerTransaction {
    pub fn new(
        user_id: &str,
        point_type: PointType,
        cost: u32,
        outcome: TransactionOutcome,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id: user_id.to_string(),
            feature_id: None,
            point_type,
            cost,
            outcome,
            timestamp,
        }
    }

    pub fn for_feature(mut self, feature_id: &str) -> Self {
        self.feature_id = Some(feature_id.to_string());
        self
    }

    pub fn emit(&self) {
        tracing::info!(
            target: "ledger",
            transaction_id = %self.id,
            user_id = %self.user_id,
            feature_id = self.feature_id.as_deref().unwrap_or("-"),
            point_type = %self.point_type,
            cost = self.cost,
            outcome = self.outcome.as_str(),
            timestamp = %self.timestamp,
            "ledger transaction"
        );
    }
}

/// Why a gate refused to run a feature, with enough detail for the client
/// to tell the user when to come back.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GateDenied {
    pub point_type: PointType,
    pub cost: u32,
    pub current_balance: Points,
    pub next_replenish_at: DateTime<Utc>,
    pub next_replenish_amount: u32,
}

impl GateDenied {
    pub fn available(&self) -> u32 {
        self.current_balance.get(self.point_type)
    }

    pub fn message(&self) -> String {
        let (unit, when) = match self.point_type {
            PointType::Ticket => ("tickets", "at the next local midnight"),
            PointType::Diamond => ("diamonds", "on the 1st of next month"),
        };
        format!(
            "Not enough {}: {} required, {} remaining. {} {} are distributed {}.",
            unit,
            self.cost,
            self.available(),
            self.next_replenish_amount,
            unit,
            when
        )
    }
}
