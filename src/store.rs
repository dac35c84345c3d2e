use tokio::sync::Mutex;
use tracing::error;

use crate::domain::{
    DealStatus, Error, ExternalDeal, ExternalPayment, ExternalPayout, UserId,
};
use crate::journal::JournaledMap;
use crate::ledger::LedgerBook;
use crate::tasks::TaskBoard;

/// Local mirrors of provider objects.
#[derive(Debug, Clone, Default)]
pub struct PaymentBook {
    deals: JournaledMap<u64, ExternalDeal>,
    payments: JournaledMap<String, ExternalPayment>,
    payouts: JournaledMap<String, ExternalPayout>,
}

impl PaymentBook {
    pub fn commit(&mut self) {
        self.deals.commit();
        self.payments.commit();
        self.payouts.commit();
    }

    pub fn rollback(&mut self) {
        self.deals.rollback();
        self.payments.rollback();
        self.payouts.rollback();
    }

    pub fn open_deal(&self, user_id: UserId) -> Option<&ExternalDeal> {
        self.deals
            .values()
            .find(|d| d.user_id == user_id && d.status == DealStatus::Open)
    }

    /// Keeps the first open deal per user; a second one is reported back.
    pub fn insert_deal(&mut self, mut deal: ExternalDeal) -> Result<ExternalDeal, ExternalDeal> {
        if let Some(existing) = self.open_deal(deal.user_id) {
            return Err(existing.clone());
        }
        deal.id = self.deals.len() as u64 + 1;
        self.deals.insert(deal.id, deal.clone());
        Ok(deal)
    }

    pub fn close_deal(&mut self, external_id: &str) -> Option<&ExternalDeal> {
        let deal = self
            .deals
            .find_mut(|d| d.external_id == external_id && d.status == DealStatus::Open)?;
        deal.status = DealStatus::Closed;
        Some(&*deal)
    }

    pub fn insert_payment(&mut self, payment: ExternalPayment) -> Result<(), Error> {
        if self.payments.contains_key(&payment.payment_id) {
            return Err(Error::LedgerInvariantViolation(format!(
                "payment {} recorded twice",
                payment.payment_id
            )));
        }
        self.payments.insert(payment.payment_id.clone(), payment);
        Ok(())
    }

    pub fn insert_payout(&mut self, payout: ExternalPayout) -> Result<(), Error> {
        if self.payouts.contains_key(&payout.payment_id) {
            return Err(Error::LedgerInvariantViolation(format!(
                "payout {} recorded twice",
                payout.payment_id
            )));
        }
        self.payouts.insert(payout.payment_id.clone(), payout);
        Ok(())
    }

    /// Looks up by provider id, falling back to our order id.
    pub fn payment_mut(
        &mut self,
        payment_id: &str,
        order_id: Option<&str>,
    ) -> Option<&mut ExternalPayment> {
        if self.payments.contains_key(payment_id) {
            return self.payments.get_mut(payment_id);
        }
        self.payment_by_order_mut(order_id?)
    }

    pub fn payment_by_order_mut(&mut self, order_id: &str) -> Option<&mut ExternalPayment> {
        self.payments.find_mut(|p| p.order_id == order_id)
    }

    pub fn payout_mut(
        &mut self,
        payment_id: &str,
        order_id: Option<&str>,
    ) -> Option<&mut ExternalPayout> {
        if self.payouts.contains_key(payment_id) {
            return self.payouts.get_mut(payment_id);
        }
        let order_id = order_id?;
        self.payouts.find_mut(|p| p.order_id == order_id)
    }

    pub fn payment(&self, payment_id: &str) -> Option<&ExternalPayment> {
        self.payments.get(payment_id)
    }

    pub fn payout(&self, payment_id: &str) -> Option<&ExternalPayout> {
        self.payouts.get(payment_id)
    }

    pub fn payouts_of(&self, user_id: UserId) -> impl Iterator<Item = &ExternalPayout> {
        self.payouts.values().filter(move |p| p.user_id == user_id)
    }

    /// Payouts the provider has not finished with yet.
    pub fn pending_payouts(&self) -> impl Iterator<Item = &ExternalPayout> {
        self.payouts.values().filter(|p| !p.status.is_payout_final())
    }
}

#[derive(Debug, Default)]
pub struct Tables {
    pub ledger: LedgerBook,
    pub board: TaskBoard,
    pub payments: PaymentBook,
}

impl Tables {
    fn commit(&mut self) {
        self.ledger.commit();
        self.board.commit();
        self.payments.commit();
    }

    fn rollback(&mut self) {
        self.ledger.rollback();
        self.board.rollback();
        self.payments.rollback();
    }
}

/// In-process datastore. Every mutation runs as one serializable unit: the
/// tables are locked for the duration of a synchronous closure and every row
/// it wrote is put back if it fails. The closure cannot await, so no unit can
/// be held open across a gateway call.
#[derive(Debug, Default)]
pub struct Store {
    tables: Mutex<Tables>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn atomic<T, F>(&self, operation: &str, f: F) -> Result<T, Error>
    where
        F: FnOnce(&mut Tables) -> Result<T, Error>,
    {
        let mut tables = self.tables.lock().await;
        match f(&mut tables) {
            Ok(value) => {
                tables.commit();
                Ok(value)
            }
            Err(e) => {
                tables.rollback();
                if e.is_fatal() {
                    error!(operation, error = %e, "atomic unit aborted on invariant violation");
                }
                Err(e)
            }
        }
    }

    pub async fn read<T, F>(&self, f: F) -> T
    where
        F: FnOnce(&Tables) -> T,
    {
        let tables = self.tables.lock().await;
        f(&tables)
    }

    pub async fn audit(&self) -> Result<(), Error> {
        self.read(|t| t.ledger.audit()).await
    }
}
