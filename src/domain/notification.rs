use crate::domain::{GatewayStatus, Money};

/// A provider status report for one payment or payout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusChange {
    pub payment_id: String,
    pub order_id: Option<String>,
    pub status: GatewayStatus,
    pub success: bool,
    pub amount: Money,
    pub accumulation_id: Option<String>,
}

impl StatusChange {
    /// `CONFIRMED`, or `Success=true` with a non-failure status.
    pub fn indicates_success(&self) -> bool {
        self.status == GatewayStatus::Confirmed || (self.success && !self.status.is_failure())
    }
}

/// Verified inbound notification, parsed once at the webhook boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Payment(StatusChange),
    Payout(StatusChange),
    DealAccumulation {
        accumulation_id: String,
        order_id: String,
    },
    Unrecognized,
}

impl Notification {
    pub fn kind(&self) -> &'static str {
        match self {
            Notification::Payment(_) => "payment",
            Notification::Payout(_) => "payout",
            Notification::DealAccumulation { .. } => "deal_accumulation",
            Notification::Unrecognized => "unrecognized",
        }
    }
}
