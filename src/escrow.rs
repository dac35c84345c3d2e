use std::sync::Arc;

use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::commission::{CommissionPolicy, CommissionSchedule, Split};
use crate::domain::{
    Assignee, Error, LedgerEntry, PaymentGateway, Task, TaskId, TaskStatus, UserEvent, UserId,
};
use crate::effects::{EffectDispatcher, PostCommit};
use crate::ledger::{EntryRef, SettlementEntries};
use crate::store::Store;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub task: Task,
    pub freeze: LedgerEntry,
    pub effects: Vec<PostCommit>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settlement {
    pub task: Task,
    pub rate: Decimal,
    pub split: Split,
    pub entries: SettlementEntries,
    pub effects: Vec<PostCommit>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Refund {
    pub task: Task,
    pub entry: LedgerEntry,
}

pub struct EscrowSettings {
    pub platform_account: UserId,
    pub commission: CommissionSchedule,
    pub policy: CommissionPolicy,
    pub xp_per_task: u32,
}

/// Freezes a customer's funds when a task is assigned and settles them when
/// the task completes.
pub struct EscrowController {
    store: Arc<Store>,
    gateway: Arc<dyn PaymentGateway>,
    effects: Arc<EffectDispatcher>,
    settings: EscrowSettings,
}

impl EscrowController {
    pub fn new(
        store: Arc<Store>,
        gateway: Arc<dyn PaymentGateway>,
        effects: Arc<EffectDispatcher>,
        settings: EscrowSettings,
    ) -> Self {
        Self {
            store,
            gateway,
            effects,
            settings,
        }
    }

    pub async fn assign(
        &self,
        task_id: TaskId,
        assignee: Assignee,
        actor_id: UserId,
    ) -> Result<Assignment, Error> {
        // Validation before any mutation; everything is re-checked in the unit.
        let (commitment, rate) = self
            .store
            .read(|t| -> Result<_, Error> {
                let task = t.board.task(task_id)?;
                require_owner(task, actor_id)?;
                if task.is_assigned() {
                    return Err(Error::AlreadyAssigned(task_id));
                }
                if task.status != TaskStatus::Open {
                    return Err(Error::InvalidStateTransition {
                        task_id,
                        from: task.status,
                        to: TaskStatus::InProgress,
                    });
                }
                let commitment = t.board.committed_price(task_id, assignee)?;
                if commitment.executor_id == task.customer_id {
                    return Err(Error::Validation("customers cannot assign themselves".into()));
                }
                let available = t.ledger.available(task.customer_id);
                if available < commitment.price {
                    return Err(Error::InsufficientFunds {
                        required: commitment.price,
                        available,
                    });
                }
                let rate = match self.settings.policy {
                    CommissionPolicy::AtAssignment => Some(
                        self.settings
                            .commission
                            .rate_for(t.board.level(commitment.executor_id)),
                    ),
                    CommissionPolicy::AtCompletion => None,
                };
                Ok((commitment, rate))
            })
            .await?;

        let (task, freeze) = self
            .store
            .atomic("assign", |t| {
                // compare-and-set: a concurrent assign that won leaves the task assigned
                let task = t.board.start(task_id, commitment, rate)?;
                let freeze = t.ledger.freeze(
                    task.customer_id,
                    commitment.price,
                    &format!("escrow for task {}", task_id),
                    EntryRef::task(task_id),
                )?;
                Ok((task, freeze))
            })
            .await?;

        info!(
            task_id,
            customer_id = task.customer_id,
            executor_id = commitment.executor_id,
            amount = %commitment.price,
            "escrow frozen, task in progress"
        );

        match self
            .store
            .atomic("withdraw responses", |t| {
                Ok(t.board
                    .withdraw_pending_responses(commitment.executor_id, task_id))
            })
            .await
        {
            Ok(removed) if removed > 0 => {
                info!(user_id = commitment.executor_id, removed, "pending responses withdrawn")
            }
            Ok(_) => {}
            Err(e) => warn!(task_id, error = %e, "could not withdraw pending responses"),
        }

        let effects = vec![PostCommit::notify(
            commitment.executor_id,
            UserEvent::TaskAssigned { task_id },
        )];
        self.effects.dispatch(effects.clone());

        Ok(Assignment {
            task,
            freeze,
            effects,
        })
    }

    pub async fn complete(&self, task_id: TaskId, actor_id: UserId) -> Result<Settlement, Error> {
        let task = self
            .store
            .read(|t| -> Result<Task, Error> {
                let task = t.board.task(task_id)?;
                require_owner(task, actor_id)?;
                Ok(t.board.check_settleable(task_id, TaskStatus::InProgress)?.clone())
            })
            .await?;

        self.settle(task, TaskStatus::InProgress).await
    }

    /// `in_progress -> disputed`, open to either party.
    pub async fn open_dispute(&self, task_id: TaskId, actor_id: UserId) -> Result<Task, Error> {
        let task = self
            .store
            .atomic("open dispute", |t| {
                let task = t.board.task(task_id)?;
                if actor_id != task.customer_id && Some(actor_id) != task.executor_id {
                    return Err(Error::Forbidden(format!(
                        "user {} is not a party to task {}",
                        actor_id, task_id
                    )));
                }
                t.board.open_dispute(task_id)
            })
            .await?;
        warn!(task_id, actor_id, "task disputed");
        Ok(task)
    }

    /// Dispute outcome decided elsewhere: escrow goes back to the customer.
    pub async fn resolve_refund(&self, task_id: TaskId) -> Result<Refund, Error> {
        let refund = self
            .store
            .atomic("resolve refund", |t| {
                let task = t.board.cancel(task_id, TaskStatus::Disputed)?;
                let posting = t.ledger.refund(
                    task.customer_id,
                    task.escrow_amount,
                    &format!("refund for task {}", task_id),
                    EntryRef::task(task_id),
                )?;
                let task = t.board.task(task_id)?.clone();
                Ok(Refund {
                    task,
                    entry: posting.entry().clone(),
                })
            })
            .await?;

        info!(task_id, amount = %refund.entry.amount, "disputed task refunded");
        self.effects.dispatch(vec![PostCommit::notify(
            refund.task.customer_id,
            UserEvent::TaskRefunded {
                task_id,
                amount: -refund.entry.amount,
            },
        )]);
        Ok(refund)
    }

    /// Dispute outcome decided elsewhere: the executor is paid as on completion.
    pub async fn resolve_payout(&self, task_id: TaskId) -> Result<Settlement, Error> {
        let task = self
            .store
            .read(|t| t.board.check_settleable(task_id, TaskStatus::Disputed).cloned())
            .await?;
        self.settle(task, TaskStatus::Disputed).await
    }

    /// `open -> cancelled`. Nothing is frozen yet, so no money moves.
    pub async fn cancel(&self, task_id: TaskId, actor_id: UserId) -> Result<Task, Error> {
        self.store
            .atomic("cancel", |t| {
                require_owner(t.board.task(task_id)?, actor_id)?;
                t.board.cancel(task_id, TaskStatus::Open)?;
                Ok(t.board.task(task_id)?.clone())
            })
            .await
    }

    /// Re-attempts capture confirmation for tasks that settled without it.
    /// Returns how many were confirmed.
    pub async fn sweep_unconfirmed_captures(&self) -> usize {
        let pending: Vec<(TaskId, String)> = self
            .store
            .read(|t| {
                t.board
                    .tasks()
                    .filter(|task| task.capture_confirmed == Some(false))
                    .filter_map(|task| task.authorization_id.clone().map(|id| (task.id, id)))
                    .collect()
            })
            .await;

        let mut confirmed = 0;
        for (task_id, payment_id) in pending {
            match self.gateway.confirm_payment(&payment_id).await {
                Ok(c) if c.success => {
                    match self
                        .store
                        .atomic("mark captured", |t| t.board.mark_captured(task_id))
                        .await
                    {
                        Ok(()) => confirmed += 1,
                        Err(e) => error!(task_id, error = %e, "could not record capture"),
                    }
                }
                Ok(c) => warn!(task_id, status = %c.status, "capture still not confirmed"),
                Err(e) => warn!(task_id, error = %e, "capture retry failed"),
            }
        }
        confirmed
    }

    async fn settle(&self, task: Task, from: TaskStatus) -> Result<Settlement, Error> {
        let task_id = task.id;
        let executor_id = task
            .executor_id
            .ok_or_else(|| Error::LedgerInvariantViolation(format!("task {} lost its executor", task_id)))?;

        let rate = match (self.settings.policy, task.commission_rate) {
            (CommissionPolicy::AtAssignment, Some(rate)) => rate,
            _ => {
                let level = self.store.read(|t| t.board.level(executor_id)).await;
                self.settings.commission.rate_for(level)
            }
        };

        // Capture happens outside the unit. The local ledger decides completion;
        // the capture sweep catches up on failures.
        let capture_confirmed = match &task.authorization_id {
            None => None,
            Some(payment_id) => match self.gateway.confirm_payment(payment_id).await {
                Ok(c) if c.success => Some(true),
                Ok(c) => {
                    warn!(task_id, payment_id = %payment_id, status = %c.status, "capture not confirmed, settling anyway");
                    Some(false)
                }
                Err(e) => {
                    warn!(task_id, payment_id = %payment_id, error = %e, "capture call failed, settling anyway");
                    Some(false)
                }
            },
        };

        let platform_id = self.settings.platform_account;
        let (task, split, entries) = self
            .store
            .atomic("settle", |t| {
                let current = t.board.check_settleable(task_id, from)?;
                if current.executor_id != Some(executor_id) {
                    return Err(Error::InvalidStateTransition {
                        task_id,
                        from: current.status,
                        to: TaskStatus::Completed,
                    });
                }
                let customer_id = current.customer_id;
                let escrow = current.escrow_amount;
                let split = CommissionSchedule::split(escrow, rate);
                let entries = t.ledger.settle(
                    customer_id,
                    executor_id,
                    platform_id,
                    escrow,
                    split.commission,
                    &format!("settlement of task {}", task_id),
                    task_id,
                )?;
                let task = t.board.finish(task_id, from, capture_confirmed)?;
                Ok((task, split, entries))
            })
            .await?;

        info!(
            task_id,
            customer_id = task.customer_id,
            executor_id,
            %rate,
            commission = %split.commission,
            payout = %split.payout,
            "task settled"
        );

        let amount = split.payout;
        let effects = vec![
            PostCommit::AwardXp {
                user_id: executor_id,
                amount: self.settings.xp_per_task,
                reason: format!("task {} completed", task_id),
            },
            PostCommit::CheckAchievements {
                user_id: executor_id,
            },
            PostCommit::CheckAchievements {
                user_id: task.customer_id,
            },
            PostCommit::notify(executor_id, UserEvent::TaskCompleted { task_id, amount }),
            PostCommit::notify(
                task.customer_id,
                UserEvent::TaskCompleted {
                    task_id,
                    amount: split.commission + split.payout,
                },
            ),
        ];
        self.effects.dispatch(effects.clone());

        Ok(Settlement {
            task,
            rate,
            split,
            entries,
            effects,
        })
    }
}

fn require_owner(task: &Task, actor_id: UserId) -> Result<(), Error> {
    if task.customer_id != actor_id {
        return Err(Error::Forbidden(format!(
            "user {} does not own task {}",
            actor_id, task.id
        )));
    }
    Ok(())
}
