use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::WithdrawalConfig;
use crate::domain::{
    DealStatus, EntryKind, Error, ExternalDeal, ExternalPayment, ExternalPayout, Money,
    PaymentGateway, PaymentRequest, PayoutRequest, UserId,
};
use crate::ledger::EntryRef;
use crate::store::Store;

/// Normalises a Russian phone number to `7XXXXXXXXXX`.
pub fn normalize_phone(raw: &str) -> Result<String, Error> {
    let trimmed = raw.trim();
    let digits: String = trimmed.chars().filter(|c| c.is_ascii_digit()).collect();
    let allowed = trimmed
        .chars()
        .all(|c| c.is_ascii_digit() || matches!(c, '+' | ' ' | '-' | '(' | ')'));
    let normalized = match (digits.len(), digits.chars().next()) {
        (11, Some('7')) => digits,
        (11, Some('8')) => format!("7{}", &digits[1..]),
        (10, Some('9')) => format!("7{}", digits),
        _ => String::new(),
    };
    if !allowed || normalized.is_empty() {
        return Err(Error::Validation(format!("invalid phone number {}", raw)));
    }
    Ok(normalized)
}

/// Verdict of the velocity heuristics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FraudVerdict {
    Clear,
    /// Logged for review; the withdrawal goes ahead.
    Flagged(Vec<String>),
    Rejected(String),
}

/// What the fraud heuristics look at.
#[derive(Debug, Clone, Default)]
pub struct WithdrawalHistory {
    pub recent: Vec<(DateTime<Utc>, Money)>,
    pub last_deposit_at: Option<DateTime<Utc>>,
    pub profile_phone: Option<String>,
}

#[derive(Debug, Clone)]
pub struct FraudGuard {
    cfg: WithdrawalConfig,
}

impl FraudGuard {
    pub fn new(cfg: WithdrawalConfig) -> Self {
        Self { cfg }
    }

    pub fn assess(
        &self,
        history: &WithdrawalHistory,
        amount: Money,
        phone: &str,
        now: DateTime<Utc>,
    ) -> FraudVerdict {
        let window = ChronoDuration::from_std(self.cfg.window).unwrap_or(ChronoDuration::days(1));
        let in_window: Vec<Money> = history
            .recent
            .iter()
            .filter(|(at, _)| now - *at < window)
            .map(|(_, amount)| *amount)
            .collect();

        if in_window.len() >= self.cfg.max_per_window {
            return FraudVerdict::Rejected(format!(
                "{} withdrawals already requested in the current window",
                in_window.len()
            ));
        }
        let total = in_window.iter().copied().sum::<Money>() + amount;
        if total > self.cfg.daily_limit {
            return FraudVerdict::Rejected(format!(
                "window total {} exceeds limit {}",
                total, self.cfg.daily_limit
            ));
        }

        let mut flags = Vec::new();
        let soft = ChronoDuration::from_std(self.cfg.soft_flag_after_deposit)
            .unwrap_or(ChronoDuration::zero());
        if history.last_deposit_at.is_some_and(|at| now - at < soft) {
            flags.push("withdrawal shortly after a deposit".to_string());
        }
        if history
            .profile_phone
            .as_deref()
            .is_some_and(|p| normalize_phone(p).ok().as_deref() != Some(phone))
        {
            flags.push("destination differs from profile phone".to_string());
        }

        if flags.is_empty() {
            FraudVerdict::Clear
        } else {
            FraudVerdict::Flagged(flags)
        }
    }
}

/// Payout initiation and deposit initiation against the provider.
pub struct WithdrawalController {
    store: Arc<Store>,
    gateway: Arc<dyn PaymentGateway>,
    cfg: WithdrawalConfig,
    guard: FraudGuard,
    // one initiation at a time per user
    user_locks: Mutex<HashMap<UserId, Arc<Mutex<()>>>>,
}

impl WithdrawalController {
    pub fn new(store: Arc<Store>, gateway: Arc<dyn PaymentGateway>, cfg: WithdrawalConfig) -> Self {
        Self {
            store,
            gateway,
            guard: FraudGuard::new(cfg.clone()),
            cfg,
            user_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn user_lock(&self, user_id: UserId) -> Arc<Mutex<()>> {
        self.user_locks
            .lock()
            .await
            .entry(user_id)
            .or_default()
            .clone()
    }

    /// Drops the user's lock once nobody else holds or waits on it.
    async fn release_user_lock(&self, user_id: UserId) {
        let mut locks = self.user_locks.lock().await;
        if locks
            .get(&user_id)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(&user_id);
        }
    }

    pub async fn locked_users(&self) -> usize {
        self.user_locks.lock().await.len()
    }

    /// Dropping this future before the provider accepts the payout cancels it
    /// with nothing reserved. Afterwards the payout record and the freeze are
    /// written in one unit with no await in between.
    pub async fn initiate_withdrawal(
        &self,
        user_id: UserId,
        amount: Money,
        destination: &str,
    ) -> Result<ExternalPayout, Error> {
        if amount < self.cfg.min_amount {
            return Err(Error::Validation(format!(
                "minimum withdrawal is {}, requested {}",
                self.cfg.min_amount, amount
            )));
        }
        let phone = normalize_phone(destination)?;

        let lock = self.user_lock(user_id).await;
        let result = {
            let _serialized = lock.lock().await;
            self.initiate_serialized(user_id, amount, phone).await
        };
        drop(lock);
        self.release_user_lock(user_id).await;
        result
    }

    async fn initiate_serialized(
        &self,
        user_id: UserId,
        amount: Money,
        phone: String,
    ) -> Result<ExternalPayout, Error> {
        let (history, available, deal) = self
            .store
            .read(|t| {
                let history = WithdrawalHistory {
                    recent: t
                        .payments
                        .payouts_of(user_id)
                        .filter(|p| !p.status.is_failure())
                        .map(|p| (p.created_at, p.amount))
                        .collect(),
                    last_deposit_at: t
                        .ledger
                        .entries_for(user_id)
                        .filter(|e| e.kind == EntryKind::Deposit)
                        .map(|e| e.created_at)
                        .max(),
                    profile_phone: t.board.profile(user_id).and_then(|p| p.phone.clone()),
                };
                (
                    history,
                    t.ledger.available(user_id),
                    t.payments.open_deal(user_id).cloned(),
                )
            })
            .await;

        match self.guard.assess(&history, amount, &phone, Utc::now()) {
            FraudVerdict::Rejected(reason) => {
                warn!(user_id, %amount, %reason, "withdrawal blocked by fraud checks");
                return Err(Error::FraudRejected(reason));
            }
            FraudVerdict::Flagged(flags) => {
                warn!(user_id, %amount, flags = ?flags, "withdrawal flagged for review");
            }
            FraudVerdict::Clear => {}
        }

        if available < amount {
            return Err(Error::InsufficientFunds {
                required: amount,
                available,
            });
        }

        let deal = match deal {
            Some(deal) => deal,
            None => self.open_deal(user_id).await?,
        };

        // withdrawing everything closes the accumulation
        let is_final = amount == available;
        let request = PayoutRequest {
            order_id: Uuid::new_v4().to_string(),
            user_id,
            deal_id: deal.external_id.clone(),
            amount,
            phone: phone.clone(),
            is_final,
        };
        let receipt = self.gateway.init_payout(&request).await.map_err(|e| {
            warn!(user_id, %amount, error = %e, "provider refused payout");
            e
        })?;

        let mut payout = ExternalPayout {
            payment_id: receipt.payment_id,
            order_id: request.order_id,
            user_id,
            deal_id: deal.external_id,
            amount,
            destination: phone,
            status: receipt.status,
            is_final,
            reserved: true,
            created_at: Utc::now(),
        };

        let reserved = {
            let payout = payout.clone();
            self.store
                .atomic("reserve payout", move |t| {
                    let reference = EntryRef::external(payout.payment_id.clone())
                        .with_deal(Some(payout.deal_id.clone()));
                    t.ledger
                        .freeze(user_id, payout.amount, "payout-pending", reference)?;
                    t.payments.insert_payout(payout)
                })
                .await
        };

        if let Err(e) = reserved {
            // The provider already holds the payout; keep the record so its
            // notifications still match, but mark it as holding nothing.
            error!(
                user_id,
                payment_id = %payout.payment_id,
                error = %e,
                "payout accepted by provider but funds could not be reserved"
            );
            payout.reserved = false;
            let record = payout.clone();
            self.store
                .atomic("record unreserved payout", move |t| t.payments.insert_payout(record))
                .await?;
            return Err(e);
        }

        info!(
            user_id,
            payment_id = %payout.payment_id,
            %amount,
            is_final,
            "payout initiated, funds reserved"
        );
        Ok(payout)
    }

    /// A payout the provider accepted can only be reversed through the
    /// provider's own flow.
    pub async fn cancel_withdrawal(&self, user_id: UserId, payment_id: &str) -> Result<(), Error> {
        let payout = self
            .store
            .read(|t| t.payments.payout(payment_id).cloned())
            .await
            .filter(|p| p.user_id == user_id)
            .ok_or_else(|| Error::NotFound(format!("payout {}", payment_id)))?;

        if payout.status.is_failure() {
            return Err(Error::CannotCancel(format!(
                "payout {} was already {}",
                payment_id, payout.status
            )));
        }
        Err(Error::CannotCancel(format!(
            "payout {} is already with the provider, contact support",
            payment_id
        )))
    }

    /// Registers a deposit with the provider. The ledger is credited only when
    /// the confirming notification arrives.
    pub async fn initiate_deposit(
        &self,
        user_id: UserId,
        amount: Money,
    ) -> Result<ExternalPayment, Error> {
        if !amount.is_positive() {
            return Err(Error::Validation(format!("deposit must be positive, got {}", amount)));
        }
        let deal_id = self
            .store
            .read(|t| t.payments.open_deal(user_id).map(|d| d.external_id.clone()))
            .await;

        let request = PaymentRequest {
            order_id: Uuid::new_v4().to_string(),
            user_id,
            amount,
            deal_id: deal_id.clone(),
            description: format!("Balance top-up for user {}", user_id),
        };
        let receipt = self.gateway.init_payment(&request).await?;

        let payment = ExternalPayment {
            payment_id: receipt.payment_id,
            order_id: request.order_id,
            user_id,
            deal_id,
            amount,
            status: receipt.status,
            created_at: Utc::now(),
        };
        let record = payment.clone();
        self.store
            .atomic("record payment", move |t| t.payments.insert_payment(record))
            .await?;

        info!(user_id, payment_id = %payment.payment_id, %amount, "deposit initiated");
        Ok(payment)
    }

    async fn open_deal(&self, user_id: UserId) -> Result<ExternalDeal, Error> {
        let external_id = self.gateway.create_deal(user_id).await?;
        let deal = ExternalDeal {
            id: 0,
            user_id,
            status: DealStatus::Open,
            external_id,
            created_at: Utc::now(),
        };
        let stored = self
            .store
            .atomic("open deal", move |t| Ok(t.payments.insert_deal(deal)))
            .await?;
        match stored {
            Ok(deal) => {
                info!(user_id, accumulation_id = %deal.external_id, "deal opened");
                Ok(deal)
            }
            Err(existing) => {
                warn!(user_id, accumulation_id = %existing.external_id, "deal opened concurrently, reusing existing");
                Ok(existing)
            }
        }
    }
}
