use std::str::FromStr;

use rust_decimal::Decimal;

use crate::domain::Money;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommissionTier {
    pub min_level: u32,
    pub rate: Decimal,
}

/// When the executor's level is read to pick a rate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommissionPolicy {
    #[default]
    AtCompletion,
    AtAssignment,
}

impl FromStr for CommissionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "completion" | "at_completion" => Ok(CommissionPolicy::AtCompletion),
            "assignment" | "at_assignment" => Ok(CommissionPolicy::AtAssignment),
            other => Err(format!("unknown commission policy {}", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Split {
    pub commission: Money,
    pub payout: Money,
}

/// Maps an executor level to the platform's cut.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommissionSchedule {
    tiers: Vec<CommissionTier>, // sorted by min_level, highest first
    base_rate: Decimal,
}

impl Default for CommissionSchedule {
    fn default() -> Self {
        Self::new(
            Decimal::new(20, 2),
            vec![
                CommissionTier { min_level: 3, rate: Decimal::new(15, 2) },
                CommissionTier { min_level: 5, rate: Decimal::new(12, 2) },
                CommissionTier { min_level: 7, rate: Decimal::new(10, 2) },
            ],
        )
    }
}

impl CommissionSchedule {
    pub fn new(base_rate: Decimal, mut tiers: Vec<CommissionTier>) -> Self {
        tiers.sort_by(|a, b| b.min_level.cmp(&a.min_level));
        Self { tiers, base_rate }
    }

    /// Parses `level:rate` pairs, e.g. `3:0.15,5:0.12,7:0.10`.
    pub fn parse(base_rate: Decimal, pairs: &str) -> Result<Self, String> {
        let mut tiers = Vec::new();
        for pair in pairs.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            let (level, rate) = pair
                .split_once(':')
                .ok_or_else(|| format!("expected level:rate, got {}", pair))?;
            let min_level = level
                .trim()
                .parse()
                .map_err(|_| format!("bad level in {}", pair))?;
            let rate = Decimal::from_str(rate.trim()).map_err(|_| format!("bad rate in {}", pair))?;
            tiers.push(CommissionTier { min_level, rate });
        }
        let schedule = Self::new(base_rate, tiers);
        schedule.validate()?;
        Ok(schedule)
    }

    fn validate(&self) -> Result<(), String> {
        let in_range = |r: Decimal| r >= Decimal::ZERO && r <= Decimal::ONE;
        if !in_range(self.base_rate) || !self.tiers.iter().all(|t| in_range(t.rate)) {
            return Err("commission rates must lie in [0, 1]".into());
        }
        Ok(())
    }

    pub fn rate_for(&self, level: u32) -> Decimal {
        self.tiers
            .iter()
            .find(|t| level >= t.min_level)
            .map(|t| t.rate)
            .unwrap_or(self.base_rate)
    }

    /// `commission = floor(amount * rate, 2dp)`, the executor keeps the rest.
    pub fn split(amount: Money, rate: Decimal) -> Split {
        let commission = amount.mul_floor(rate);
        Split {
            commission,
            payout: amount - commission,
        }
    }
}
