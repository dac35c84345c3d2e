use std::fmt;

use chrono::{DateTime, Utc};

use crate::domain::{Money, TaskId, UserId};

pub type EntryId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntryKind {
    Freeze,
    Unfreeze,
    Payment,
    Commission,
    Deposit,
    Earn,
    Refund,
    Payout,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Freeze => "freeze",
            EntryKind::Unfreeze => "unfreeze",
            EntryKind::Payment => "payment",
            EntryKind::Commission => "commission",
            EntryKind::Deposit => "deposit",
            EntryKind::Earn => "earn",
            EntryKind::Refund => "refund",
            EntryKind::Payout => "payout",
        }
    }
}

impl fmt::Display for EntryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable row of the append-only ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerEntry {
    pub id: EntryId,
    pub account_id: UserId,
    /// Signed: negative for debits.
    pub amount: Money,
    pub kind: EntryKind,
    pub reason: String,
    pub task_id: Option<TaskId>,
    /// Provider payment id; unique per kind when present.
    pub external_ref: Option<String>,
    pub deal_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl fmt::Display for LedgerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "#{} {},account={},amount={}",
            self.id, self.kind, self.account_id, self.amount
        )?;
        if let Some(task_id) = self.task_id {
            write!(f, ",task={}", task_id)?;
        }
        if let Some(external_ref) = &self.external_ref {
            write!(f, ",ref={}", external_ref)?;
        }
        Ok(())
    }
}
