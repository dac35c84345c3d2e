use std::fmt;

use chrono::{DateTime, Utc};

use crate::domain::{Money, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DealStatus {
    Open,
    Closed,
}

/// Provider-side accumulation scoping a user's payments and payouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalDeal {
    pub id: u64,
    pub user_id: UserId,
    pub status: DealStatus,
    /// Provider `SpAccumulationId`.
    pub external_id: String,
    pub created_at: DateTime<Utc>,
}

/// Provider status vocabulary shared by payments and payouts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayStatus {
    New,
    Authorized,
    Confirmed,
    Checking,
    CreditChecking,
    Completed,
    Rejected,
    Canceled,
    Other(String),
}

impl GatewayStatus {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_uppercase().as_str() {
            "NEW" => GatewayStatus::New,
            "AUTHORIZED" => GatewayStatus::Authorized,
            "CONFIRMED" => GatewayStatus::Confirmed,
            "CHECKING" => GatewayStatus::Checking,
            "CREDIT_CHECKING" => GatewayStatus::CreditChecking,
            "COMPLETED" => GatewayStatus::Completed,
            "REJECTED" => GatewayStatus::Rejected,
            "CANCELED" | "CANCELLED" => GatewayStatus::Canceled,
            other => GatewayStatus::Other(other.to_string()),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, GatewayStatus::Rejected | GatewayStatus::Canceled)
    }

    /// A payout in one of these statuses never changes again.
    pub fn is_payout_final(&self) -> bool {
        matches!(self, GatewayStatus::Completed) || self.is_failure()
    }

    /// Statuses only ever reported for payouts.
    pub fn is_payout_only(&self) -> bool {
        matches!(
            self,
            GatewayStatus::Checking | GatewayStatus::CreditChecking | GatewayStatus::Completed
        )
    }
}

impl fmt::Display for GatewayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayStatus::New => f.write_str("NEW"),
            GatewayStatus::Authorized => f.write_str("AUTHORIZED"),
            GatewayStatus::Confirmed => f.write_str("CONFIRMED"),
            GatewayStatus::Checking => f.write_str("CHECKING"),
            GatewayStatus::CreditChecking => f.write_str("CREDIT_CHECKING"),
            GatewayStatus::Completed => f.write_str("COMPLETED"),
            GatewayStatus::Rejected => f.write_str("REJECTED"),
            GatewayStatus::Canceled => f.write_str("CANCELED"),
            GatewayStatus::Other(s) => f.write_str(s),
        }
    }
}

/// Local mirror of a provider payment (deposit).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalPayment {
    pub payment_id: String,
    pub order_id: String,
    pub user_id: UserId,
    pub deal_id: Option<String>,
    pub amount: Money,
    pub status: GatewayStatus,
    pub created_at: DateTime<Utc>,
}

/// Local mirror of a provider payout (withdrawal).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalPayout {
    pub payment_id: String,
    pub order_id: String,
    pub user_id: UserId,
    pub deal_id: String,
    pub amount: Money,
    pub destination: String,
    pub status: GatewayStatus,
    pub is_final: bool,
    /// False when the provider accepted the payout but funds could not be frozen.
    pub reserved: bool,
    pub created_at: DateTime<Utc>,
}
