use crate::domain::Money;

pub type UserId = u64;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Account {
    pub balance: Money, // available + frozen
    pub frozen: Money,  // reserved against open escrows and pending payouts
}

impl Account {
    pub fn new() -> Self {
        Self {
            balance: Money::ZERO,
            frozen: Money::ZERO,
        }
    }

    pub fn available(&self) -> Money {
        self.balance - self.frozen
    }

    /// `0 <= frozen <= balance`
    pub fn is_consistent(&self) -> bool {
        !self.frozen.is_negative() && self.frozen <= self.balance
    }
}
