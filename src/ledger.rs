use std::collections::{BTreeMap, HashMap};

use chrono::Utc;
use tracing::debug;

use crate::domain::{Account, EntryId, EntryKind, Error, LedgerEntry, Money, TaskId, UserId};
use crate::journal::{JournaledLog, JournaledMap};

/// Optional tags carried by a ledger entry.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryRef {
    pub task_id: Option<TaskId>,
    pub external_ref: Option<String>,
    pub deal_id: Option<String>,
}

impl EntryRef {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn task(task_id: TaskId) -> Self {
        Self {
            task_id: Some(task_id),
            ..Self::default()
        }
    }

    pub fn external(payment_id: impl Into<String>) -> Self {
        Self {
            external_ref: Some(payment_id.into()),
            ..Self::default()
        }
    }

    pub fn with_deal(mut self, deal_id: Option<String>) -> Self {
        self.deal_id = deal_id;
        self
    }
}

/// Result of an idempotent posting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Posting {
    Applied(LedgerEntry),
    /// An entry with the same `(external_ref, kind)` already existed.
    Replayed(LedgerEntry),
}

impl Posting {
    pub fn entry(&self) -> &LedgerEntry {
        match self {
            Posting::Applied(e) | Posting::Replayed(e) => e,
        }
    }

    pub fn is_applied(&self) -> bool {
        matches!(self, Posting::Applied(_))
    }
}

/// Entries written by one settlement, in order: payment, commission, earn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettlementEntries {
    pub payment: LedgerEntry,
    pub commission: LedgerEntry,
    pub earn: LedgerEntry,
}

/// Balances plus the append-only entry log.
///
/// Entry amounts are the signed delta of the field the entry moves:
/// `freeze`/`unfreeze`/`refund` move `frozen`, every other kind moves `balance`.
/// This is the only code that writes `Account` fields.
#[derive(Debug, Clone, Default)]
pub struct LedgerBook {
    accounts: JournaledMap<UserId, Account>,
    entries: JournaledLog<LedgerEntry>,
    idempotency: HashMap<(String, EntryKind), EntryId>,
}

impl LedgerBook {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn account(&self, account_id: UserId) -> Account {
        self.accounts.get(&account_id).cloned().unwrap_or_default()
    }

    pub fn accounts(&self) -> &BTreeMap<UserId, Account> {
        self.accounts.rows()
    }

    pub fn available(&self, account_id: UserId) -> Money {
        self.account(account_id).available()
    }

    pub fn entries(&self) -> &[LedgerEntry] {
        self.entries.items()
    }

    pub fn entries_for(&self, account_id: UserId) -> impl Iterator<Item = &LedgerEntry> {
        self.entries
            .items()
            .iter()
            .filter(move |e| e.account_id == account_id)
    }

    pub fn find_by_ref(&self, external_ref: &str, kind: EntryKind) -> Option<&LedgerEntry> {
        let id = self.idempotency.get(&(external_ref.to_string(), kind))?;
        self.entry(*id)
    }

    fn entry(&self, id: EntryId) -> Option<&LedgerEntry> {
        // ids are 1-based positions in the log
        let idx = usize::try_from(id).ok()?.checked_sub(1)?;
        self.entries.items().get(idx)
    }

    pub fn commit(&mut self) {
        self.accounts.commit();
        self.entries.commit();
    }

    /// Undoes every write since the last commit.
    pub fn rollback(&mut self) {
        self.accounts.rollback();
        for entry in self.entries.rollback() {
            if let Some(external_ref) = entry.external_ref {
                self.idempotency.remove(&(external_ref, entry.kind));
            }
        }
    }

    /// Reserves `amount` of the available balance. `balance` is untouched.
    pub fn freeze(
        &mut self,
        account_id: UserId,
        amount: Money,
        reason: &str,
        reference: EntryRef,
    ) -> Result<LedgerEntry, Error> {
        require_positive(amount)?;
        if let Some(existing) = self.replayed(&reference, EntryKind::Freeze) {
            return Ok(existing);
        }

        let mut account = self.account(account_id);
        let available = account.available();
        if available < amount {
            return Err(Error::InsufficientFunds {
                required: amount,
                available,
            });
        }
        account.frozen += amount;

        self.store_account(account_id, account)?;
        self.append(account_id, amount, EntryKind::Freeze, reason, reference)
    }

    /// Returns reserved funds to availability.
    pub fn unfreeze(
        &mut self,
        account_id: UserId,
        amount: Money,
        reason: &str,
        reference: EntryRef,
    ) -> Result<Posting, Error> {
        self.release(account_id, amount, EntryKind::Unfreeze, reason, reference)
    }

    /// Releases a task's escrow back to the customer after a refund decision.
    pub fn refund(
        &mut self,
        account_id: UserId,
        amount: Money,
        reason: &str,
        reference: EntryRef,
    ) -> Result<Posting, Error> {
        self.release(account_id, amount, EntryKind::Refund, reason, reference)
    }

    fn release(
        &mut self,
        account_id: UserId,
        amount: Money,
        kind: EntryKind,
        reason: &str,
        reference: EntryRef,
    ) -> Result<Posting, Error> {
        require_positive(amount)?;
        if let Some(existing) = self.replayed(&reference, kind) {
            return Ok(Posting::Replayed(existing));
        }

        let mut account = self.account(account_id);
        if account.frozen < amount {
            return Err(Error::LedgerInvariantViolation(format!(
                "{} of {} exceeds frozen {} on account {}",
                kind, amount, account.frozen, account_id
            )));
        }
        account.frozen -= amount;

        self.store_account(account_id, account)?;
        self.append(account_id, -amount, kind, reason, reference)
            .map(Posting::Applied)
    }

    /// Moves a task's escrow: the customer pays `escrow`, the platform earns
    /// `commission`, the executor earns the rest. All three accounts are
    /// validated before any of them is written.
    pub fn settle(
        &mut self,
        customer_id: UserId,
        executor_id: UserId,
        platform_id: UserId,
        escrow: Money,
        commission: Money,
        reason: &str,
        task_id: TaskId,
    ) -> Result<SettlementEntries, Error> {
        if !escrow.is_positive() || commission.is_negative() || commission > escrow {
            return Err(Error::LedgerInvariantViolation(format!(
                "cannot settle escrow {} with commission {}",
                escrow, commission
            )));
        }
        let payout = escrow - commission;

        let mut staged: BTreeMap<UserId, Account> = BTreeMap::new();

        let mut customer = self.account(customer_id);
        if customer.frozen < escrow || customer.balance < escrow {
            return Err(Error::LedgerInvariantViolation(format!(
                "customer {} holds balance {} frozen {}, cannot pay escrow {}",
                customer_id, customer.balance, customer.frozen, escrow
            )));
        }
        customer.balance -= escrow;
        customer.frozen -= escrow;
        staged.insert(customer_id, customer);

        let mut executor = staged
            .remove(&executor_id)
            .unwrap_or_else(|| self.account(executor_id));
        executor.balance += payout;
        staged.insert(executor_id, executor);

        let mut platform = staged
            .remove(&platform_id)
            .unwrap_or_else(|| self.account(platform_id));
        platform.balance += commission;
        staged.insert(platform_id, platform);

        if let Some((id, _)) = staged.iter().find(|(_, a)| !a.is_consistent()) {
            return Err(Error::LedgerInvariantViolation(format!(
                "settlement of task {} would leave account {} inconsistent",
                task_id, id
            )));
        }
        for (id, account) in staged {
            self.accounts.insert(id, account);
        }

        let payment = self.append(
            customer_id,
            -escrow,
            EntryKind::Payment,
            reason,
            EntryRef::task(task_id),
        )?;
        let commission = self.append(
            platform_id,
            commission,
            EntryKind::Commission,
            reason,
            EntryRef::task(task_id),
        )?;
        let earn = self.append(
            executor_id,
            payout,
            EntryKind::Earn,
            reason,
            EntryRef::task(task_id),
        )?;

        Ok(SettlementEntries {
            payment,
            commission,
            earn,
        })
    }

    /// Adds funds from outside the ledger. Idempotent per `(external_ref, kind)`.
    pub fn credit(
        &mut self,
        account_id: UserId,
        amount: Money,
        kind: EntryKind,
        reason: &str,
        reference: EntryRef,
    ) -> Result<Posting, Error> {
        require_positive(amount)?;
        if let Some(existing) = self.replayed(&reference, kind) {
            debug!(account_id, %kind, "credit replay ignored");
            return Ok(Posting::Replayed(existing));
        }

        let mut account = self.account(account_id);
        account.balance = account.balance.checked_add(amount).ok_or_else(|| {
            Error::LedgerInvariantViolation(format!("balance overflow on account {}", account_id))
        })?;

        self.store_account(account_id, account)?;
        self.append(account_id, amount, kind, reason, reference)
            .map(Posting::Applied)
    }

    /// Consumes a payout reservation once the provider reports it paid.
    pub fn release_payout(
        &mut self,
        account_id: UserId,
        amount: Money,
        reason: &str,
        reference: EntryRef,
    ) -> Result<Posting, Error> {
        require_positive(amount)?;
        if let Some(existing) = self.replayed(&reference, EntryKind::Payout) {
            return Ok(Posting::Replayed(existing));
        }

        let mut account = self.account(account_id);
        if account.frozen < amount || account.balance < amount {
            return Err(Error::LedgerInvariantViolation(format!(
                "payout of {} exceeds reservation on account {} (balance {}, frozen {})",
                amount, account_id, account.balance, account.frozen
            )));
        }
        account.balance -= amount;
        account.frozen -= amount;

        self.store_account(account_id, account)?;
        self.append(account_id, -amount, EntryKind::Payout, reason, reference)
            .map(Posting::Applied)
    }

    /// Full scan of the `0 <= frozen <= balance` invariant and of the
    /// idempotency index.
    pub fn audit(&self) -> Result<(), Error> {
        for (id, account) in self.accounts.rows() {
            if !account.is_consistent() {
                return Err(Error::LedgerInvariantViolation(format!(
                    "account {} has balance {} frozen {}",
                    id, account.balance, account.frozen
                )));
            }
        }
        for ((external_ref, kind), id) in &self.idempotency {
            let matches = self.entry(*id).is_some_and(|e| {
                e.kind == *kind && e.external_ref.as_deref() == Some(external_ref.as_str())
            });
            if !matches {
                return Err(Error::LedgerInvariantViolation(format!(
                    "idempotency key ({}, {}) points at entry {}",
                    external_ref, kind, id
                )));
            }
        }
        Ok(())
    }

    fn replayed(&self, reference: &EntryRef, kind: EntryKind) -> Option<LedgerEntry> {
        let external_ref = reference.external_ref.as_deref()?;
        self.find_by_ref(external_ref, kind).cloned()
    }

    fn store_account(&mut self, account_id: UserId, account: Account) -> Result<(), Error> {
        if !account.is_consistent() {
            return Err(Error::LedgerInvariantViolation(format!(
                "account {} would hold balance {} frozen {}",
                account_id, account.balance, account.frozen
            )));
        }
        self.accounts.insert(account_id, account);
        Ok(())
    }

    fn append(
        &mut self,
        account_id: UserId,
        amount: Money,
        kind: EntryKind,
        reason: &str,
        reference: EntryRef,
    ) -> Result<LedgerEntry, Error> {
        let id = self.entries.len() as EntryId + 1;
        if let Some(external_ref) = &reference.external_ref {
            let key = (external_ref.clone(), kind);
            if self.idempotency.contains_key(&key) {
                return Err(Error::LedgerInvariantViolation(format!(
                    "duplicate idempotency key ({}, {})",
                    external_ref, kind
                )));
            }
            self.idempotency.insert(key, id);
        }

        let entry = LedgerEntry {
            id,
            account_id,
            amount,
            kind,
            reason: reason.to_string(),
            task_id: reference.task_id,
            external_ref: reference.external_ref,
            deal_id: reference.deal_id,
            created_at: Utc::now(),
        };
        self.entries.push(entry.clone());
        Ok(entry)
    }
}

fn require_positive(amount: Money) -> Result<(), Error> {
    if amount.is_positive() {
        Ok(())
    } else {
        Err(Error::Validation(format!("amount must be positive, got {}", amount)))
    }
}
