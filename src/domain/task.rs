use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::domain::{Money, UserId};

pub type TaskId = u64;
pub type TeamId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Open,
    InProgress,
    Completed,
    Cancelled,
    Disputed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Open => "open",
            TaskStatus::InProgress => "in_progress",
            TaskStatus::Completed => "completed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Disputed => "disputed",
        }
    }

    /// Edges of the lifecycle graph. Nothing skips a state.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Open, InProgress)
                | (Open, Cancelled)
                | (InProgress, Completed)
                | (InProgress, Disputed)
                | (Disputed, Cancelled)
                | (Disputed, Completed)
        )
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assignee {
    Executor(UserId),
    Team(TeamId),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    pub id: TaskId,
    pub customer_id: UserId,
    /// For team assignments this is the team admin, who receives the payout.
    pub executor_id: Option<UserId>,
    pub team_id: Option<TeamId>,
    pub price: Option<Money>,
    pub escrow_amount: Money,
    pub status: TaskStatus,
    /// Provider payment whose capture is confirmed on completion.
    pub authorization_id: Option<String>,
    /// Rate fixed at assignment when commission is honoured at assignment.
    pub commission_rate: Option<Decimal>,
    /// `Some(false)` when the task settled without a confirmed capture.
    pub capture_confirmed: Option<bool>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(id: TaskId, customer_id: UserId) -> Self {
        Self {
            id,
            customer_id,
            executor_id: None,
            team_id: None,
            price: None,
            escrow_amount: Money::ZERO,
            status: TaskStatus::Open,
            authorization_id: None,
            commission_rate: None,
            capture_confirmed: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn with_authorization(mut self, payment_id: impl Into<String>) -> Self {
        self.authorization_id = Some(payment_id.into());
        self
    }

    pub fn is_assigned(&self) -> bool {
        self.executor_id.is_some() || self.team_id.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseStatus {
    Pending,
    Accepted,
}

/// An executor's (or team admin's) offer on a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub task_id: TaskId,
    pub user_id: UserId,
    pub team_id: Option<TeamId>,
    pub price: Option<Money>,
    pub status: ResponseStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Team {
    pub id: TeamId,
    pub admin_id: UserId,
    pub members: Vec<UserId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Profile {
    pub user_id: UserId,
    pub level: u32,
    pub phone: Option<String>,
}

impl Profile {
    pub fn new(user_id: UserId, level: u32) -> Self {
        Self {
            user_id,
            level,
            phone: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::TaskStatus::*;

    #[test]
    fn lifecycle_edges() {
        assert!(Open.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(Disputed.can_transition_to(Cancelled));
        assert!(!Open.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Open));
        assert!(!Cancelled.can_transition_to(InProgress));
        assert!(!InProgress.can_transition_to(Cancelled));
    }
}
