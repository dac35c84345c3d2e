use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::domain::{
    EntryKind, Error, ExternalPayout, GatewayStatus, LedgerEntry, Notification, PaymentGateway,
    StatusChange, UserEvent,
};
use crate::effects::{EffectDispatcher, PostCommit};
use crate::ledger::{EntryRef, Posting};
use crate::store::{Store, Tables};

/// What a notification did to local state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Credited(LedgerEntry),
    /// Same payment already credited; nothing changed.
    Replayed,
    PayoutSettled(LedgerEntry),
    PayoutReleased(LedgerEntry),
    StatusRecorded,
    DealLinked,
    Unmatched,
    Ignored,
}

/// Applies verified provider notifications to the ledger.
pub struct ReconciliationService {
    store: Arc<Store>,
    gateway: Arc<dyn PaymentGateway>,
    effects: Arc<EffectDispatcher>,
}

impl ReconciliationService {
    pub fn new(
        store: Arc<Store>,
        gateway: Arc<dyn PaymentGateway>,
        effects: Arc<EffectDispatcher>,
    ) -> Self {
        Self {
            store,
            gateway,
            effects,
        }
    }

    pub async fn apply(&self, notification: Notification) -> Result<Outcome, Error> {
        match notification {
            Notification::Payment(change) => self.on_status(change, false).await,
            Notification::Payout(change) => self.on_status(change, true).await,
            Notification::DealAccumulation {
                accumulation_id,
                order_id,
            } => self.on_accumulation(accumulation_id, order_id).await,
            Notification::Unrecognized => Ok(Outcome::Ignored),
        }
    }

    /// Payment and payout status reports share one unit; the hint only picks
    /// which table is searched first.
    async fn on_status(&self, change: StatusChange, payout_hint: bool) -> Result<Outcome, Error> {
        let (outcome, effects, deal_to_close) = self
            .store
            .atomic("reconcile", |t| {
                let order_id = change.order_id.as_deref();
                let is_payment = t.payments.payment_mut(&change.payment_id, order_id).is_some();
                let is_payout = t.payments.payout_mut(&change.payment_id, order_id).is_some();
                match (is_payment, is_payout, payout_hint) {
                    (true, _, false) | (true, false, true) => apply_payment(t, &change),
                    (_, true, _) => apply_payout(t, &change),
                    (false, false, _) => Ok((Outcome::Unmatched, Vec::new(), None)),
                }
            })
            .await?;

        match &outcome {
            Outcome::Unmatched => warn!(
                payment_id = %change.payment_id,
                status = %change.status,
                "notification matches no local payment or payout"
            ),
            Outcome::Replayed => info!(payment_id = %change.payment_id, "duplicate notification ignored"),
            other => info!(payment_id = %change.payment_id, status = %change.status, outcome = ?other, "notification applied"),
        }

        self.effects.dispatch(effects);

        if let Some(accumulation_id) = deal_to_close {
            if let Err(e) = self.gateway.close_deal(&accumulation_id).await {
                error!(accumulation_id = %accumulation_id, error = %e, "deal closed locally but not at provider");
            }
        }
        Ok(outcome)
    }

    /// Asks the provider about payouts still pending after `older_than` and
    /// applies what it reports the same way a notification would be applied.
    /// Returns how many payouts moved money as a result.
    pub async fn poll_stale_payouts(&self, older_than: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or(chrono::Duration::zero());
        let stale: Vec<ExternalPayout> = self
            .store
            .read(|t| {
                t.payments
                    .pending_payouts()
                    .filter(|p| p.created_at <= cutoff)
                    .cloned()
                    .collect()
            })
            .await;

        let mut settled = 0;
        for payout in stale {
            let status = match self.gateway.payout_state(&payout.payment_id).await {
                Ok(status) => status,
                Err(e) => {
                    warn!(payment_id = %payout.payment_id, error = %e, "payout state unavailable");
                    continue;
                }
            };
            if status == payout.status {
                continue;
            }

            let change = StatusChange {
                payment_id: payout.payment_id.clone(),
                order_id: Some(payout.order_id.clone()),
                success: status == GatewayStatus::Completed,
                status,
                amount: payout.amount,
                accumulation_id: None,
            };
            match self.on_status(change, true).await {
                Ok(Outcome::PayoutSettled(_) | Outcome::PayoutReleased(_)) => settled += 1,
                Ok(_) => {}
                Err(e) => {
                    error!(payment_id = %payout.payment_id, error = %e, "polled payout status not applied")
                }
            }
        }
        settled
    }

    async fn on_accumulation(&self, accumulation_id: String, order_id: String) -> Result<Outcome, Error> {
        let outcome = self
            .store
            .atomic("link deal", |t| {
                Ok(match t.payments.payment_by_order_mut(&order_id) {
                    Some(payment) => {
                        payment.deal_id = Some(accumulation_id.clone());
                        Outcome::DealLinked
                    }
                    None => Outcome::Unmatched,
                })
            })
            .await?;
        if outcome == Outcome::Unmatched {
            warn!(%order_id, %accumulation_id, "accumulation id for unknown order");
        }
        Ok(outcome)
    }
}

type Applied = (Outcome, Vec<PostCommit>, Option<String>);

fn apply_payment(t: &mut Tables, change: &StatusChange) -> Result<Applied, Error> {
    let payment = t
        .payments
        .payment_mut(&change.payment_id, change.order_id.as_deref())
        .ok_or_else(|| Error::NotFound(format!("payment {}", change.payment_id)))?;

    let previous = payment.status.clone();
    payment.status = change.status.clone();
    if let Some(accumulation_id) = &change.accumulation_id {
        payment.deal_id = Some(accumulation_id.clone());
    }
    let payment = payment.clone();

    if !change.indicates_success() {
        if previous == GatewayStatus::Confirmed && change.status.is_failure() {
            warn!(payment_id = %payment.payment_id, status = %change.status, "credited payment reported failed afterwards");
        }
        return Ok((Outcome::StatusRecorded, Vec::new(), None));
    }

    if change.amount != payment.amount {
        warn!(
            payment_id = %payment.payment_id,
            reported = %change.amount,
            recorded = %payment.amount,
            "notification amount differs, crediting the recorded amount"
        );
    }

    let posting = t.ledger.credit(
        payment.user_id,
        payment.amount,
        EntryKind::Deposit,
        &format!("deposit {}", payment.order_id),
        EntryRef::external(payment.payment_id.clone()).with_deal(payment.deal_id.clone()),
    )?;
    Ok(match posting {
        Posting::Applied(entry) => (
            Outcome::Credited(entry),
            vec![PostCommit::notify(
                payment.user_id,
                UserEvent::DepositCredited {
                    amount: payment.amount,
                },
            )],
            None,
        ),
        Posting::Replayed(_) => (Outcome::Replayed, Vec::new(), None),
    })
}

fn apply_payout(t: &mut Tables, change: &StatusChange) -> Result<Applied, Error> {
    let payout = t
        .payments
        .payout_mut(&change.payment_id, change.order_id.as_deref())
        .ok_or_else(|| Error::NotFound(format!("payout {}", change.payment_id)))?;

    if payout.status.is_payout_final() {
        if payout.status != change.status {
            warn!(
                payment_id = %payout.payment_id,
                recorded = %payout.status,
                reported = %change.status,
                "payout already final, later status ignored"
            );
            return Ok((Outcome::Ignored, Vec::new(), None));
        }
        return Ok((Outcome::Replayed, Vec::new(), None));
    }

    payout.status = change.status.clone();
    let payout = payout.clone();

    if !payout.reserved && change.status.is_payout_final() {
        error!(
            payment_id = %payout.payment_id,
            user_id = payout.user_id,
            status = %change.status,
            "payout never held funds, ledger left untouched"
        );
        return Ok((Outcome::StatusRecorded, Vec::new(), None));
    }

    let reference = EntryRef::external(payout.payment_id.clone()).with_deal(Some(payout.deal_id.clone()));
    let (outcome, effects) = match &change.status {
        GatewayStatus::Completed => {
            let posting = t.ledger.release_payout(
                payout.user_id,
                payout.amount,
                &format!("payout {}", payout.order_id),
                reference,
            )?;
            (
                Outcome::PayoutSettled(posting.entry().clone()),
                vec![PostCommit::notify(
                    payout.user_id,
                    UserEvent::PayoutCompleted {
                        amount: payout.amount,
                    },
                )],
            )
        }
        status if status.is_failure() => {
            let posting = t.ledger.unfreeze(
                payout.user_id,
                payout.amount,
                &format!("payout {} rejected", payout.order_id),
                reference,
            )?;
            (
                Outcome::PayoutReleased(posting.entry().clone()),
                vec![PostCommit::notify(
                    payout.user_id,
                    UserEvent::PayoutRejected {
                        amount: payout.amount,
                    },
                )],
            )
        }
        _ => (Outcome::StatusRecorded, Vec::new()),
    };

    let deal_to_close = if payout.is_final && change.status.is_payout_final() {
        t.payments
            .close_deal(&payout.deal_id)
            .map(|deal| deal.external_id.clone())
    } else {
        None
    };

    Ok((outcome, effects, deal_to_close))
}
