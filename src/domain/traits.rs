use async_trait::async_trait;
use std::fmt;

use crate::domain::{Error, GatewayStatus, Money, TaskId, UserId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentRequest {
    pub order_id: String,
    pub user_id: UserId,
    pub amount: Money,
    pub deal_id: Option<String>,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PayoutRequest {
    pub order_id: String,
    pub user_id: UserId,
    pub deal_id: String,
    pub amount: Money,
    pub phone: String,
    pub is_final: bool,
}

/// What the provider answers when it accepts a payment or payout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayReceipt {
    pub payment_id: String,
    pub status: GatewayStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Confirmation {
    pub success: bool,
    pub status: GatewayStatus,
}

/// Outbound calls to the payment provider. Implementations sign every request
/// and bound every call with a timeout; they never retry on their own.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens an accumulation and returns the provider's `SpAccumulationId`.
    async fn create_deal(&self, user_id: UserId) -> Result<String, Error>;

    async fn close_deal(&self, accumulation_id: &str) -> Result<(), Error>;

    async fn init_payment(&self, request: &PaymentRequest) -> Result<GatewayReceipt, Error>;

    async fn confirm_payment(&self, payment_id: &str) -> Result<Confirmation, Error>;

    async fn init_payout(&self, request: &PayoutRequest) -> Result<GatewayReceipt, Error>;

    async fn payout_state(&self, payment_id: &str) -> Result<GatewayStatus, Error>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserEvent {
    TaskAssigned { task_id: TaskId },
    TaskCompleted { task_id: TaskId, amount: Money },
    TaskRefunded { task_id: TaskId, amount: Money },
    DepositCredited { amount: Money },
    PayoutCompleted { amount: Money },
    PayoutRejected { amount: Money },
    BadgesAwarded { badges: Vec<String> },
}

impl fmt::Display for UserEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UserEvent::TaskAssigned { task_id } => write!(f, "assigned to task {}", task_id),
            UserEvent::TaskCompleted { task_id, amount } => {
                write!(f, "task {} completed, {} settled", task_id, amount)
            }
            UserEvent::TaskRefunded { task_id, amount } => {
                write!(f, "task {} refunded, {} released", task_id, amount)
            }
            UserEvent::DepositCredited { amount } => write!(f, "deposit of {} credited", amount),
            UserEvent::PayoutCompleted { amount } => write!(f, "payout of {} completed", amount),
            UserEvent::PayoutRejected { amount } => write!(f, "payout of {} rejected", amount),
            UserEvent::BadgesAwarded { badges } => write!(f, "badges: {}", badges.join(", ")),
        }
    }
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, user_id: UserId, event: &UserEvent) -> Result<(), Error>;
}

#[async_trait]
pub trait ExperienceService: Send + Sync {
    async fn award_xp(&self, user_id: UserId, amount: u32, reason: &str) -> Result<(), Error>;
}

#[async_trait]
pub trait AchievementService: Send + Sync {
    async fn check_and_award(&self, user_id: UserId) -> Result<Vec<String>, Error>;
}

pub trait DeadLetterQueue: Send + Sync {
    fn report(&self, context: &str, error: &Error);
}
