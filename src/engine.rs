use std::collections::BTreeMap;
use std::sync::Arc;

use futures::StreamExt;
use tracing::info;

use crate::config::EngineConfig;
use crate::domain::{
    Account, Assignee, DeadLetterQueue, Error, GatewayStatus, Money, PaymentGateway, Profile,
    Task, TaskId, Team, TeamId, UserId,
};
use crate::effects::{Collaborators, EffectDispatcher};
use crate::escrow::{EscrowController, EscrowSettings};
use crate::gateway::sandbox::notification_body;
use crate::ingestion::{Command, CommandStream};
use crate::reconciliation::ReconciliationService;
use crate::store::Store;
use crate::webhook::WebhookState;
use crate::withdrawal::WithdrawalController;

/// Wires the store, the gateway and the controllers together.
pub struct Engine {
    store: Arc<Store>,
    effects: Arc<EffectDispatcher>,
    escrow: EscrowController,
    withdrawals: WithdrawalController,
    reconciliation: Arc<ReconciliationService>,
    webhook: Arc<WebhookState>,
    dead_letters: Arc<dyn DeadLetterQueue>,
    gateway_password: String,
}

impl Engine {
    /// Must be called inside a tokio runtime: the effects worker is spawned here.
    pub fn new(
        config: EngineConfig,
        gateway: Arc<dyn PaymentGateway>,
        collaborators: Collaborators,
    ) -> Self {
        let store = Arc::new(Store::new());
        let dead_letters = collaborators.dead_letters.clone();
        let effects = Arc::new(EffectDispatcher::spawn(
            collaborators,
            config.effects_capacity,
        ));

        let escrow = EscrowController::new(
            store.clone(),
            gateway.clone(),
            effects.clone(),
            EscrowSettings {
                platform_account: config.platform_account,
                commission: config.commission.clone(),
                policy: config.commission_policy,
                xp_per_task: config.xp_per_task,
            },
        );
        let withdrawals =
            WithdrawalController::new(store.clone(), gateway.clone(), config.withdrawal.clone());
        let reconciliation = Arc::new(ReconciliationService::new(
            store.clone(),
            gateway,
            effects.clone(),
        ));
        let webhook = Arc::new(WebhookState::new(
            reconciliation.clone(),
            config.gateway.password.clone(),
        ));

        Self {
            store,
            effects,
            escrow,
            withdrawals,
            reconciliation,
            webhook,
            dead_letters,
            gateway_password: config.gateway.password,
        }
    }

    pub fn store(&self) -> &Arc<Store> {
        &self.store
    }

    pub fn escrow(&self) -> &EscrowController {
        &self.escrow
    }

    pub fn withdrawals(&self) -> &WithdrawalController {
        &self.withdrawals
    }

    pub fn reconciliation(&self) -> &ReconciliationService {
        &self.reconciliation
    }

    pub fn webhook(&self) -> Arc<WebhookState> {
        self.webhook.clone()
    }

    pub async fn create_task(&self, task: Task) -> Result<Task, Error> {
        let created = task.clone();
        self.store
            .atomic("create task", move |t| t.board.insert_task(task))
            .await?;
        info!(task_id = created.id, customer_id = created.customer_id, "task created");
        Ok(created)
    }

    pub async fn respond(
        &self,
        task_id: TaskId,
        user_id: UserId,
        team_id: Option<TeamId>,
        price: Money,
    ) -> Result<(), Error> {
        self.store
            .atomic("respond", |t| {
                t.board.add_response(task_id, user_id, team_id, Some(price))
            })
            .await
    }

    pub async fn accept_response(
        &self,
        task_id: TaskId,
        user_id: UserId,
        actor_id: UserId,
    ) -> Result<(), Error> {
        self.store
            .atomic("accept response", |t| {
                t.board.accept_response(task_id, user_id, actor_id)
            })
            .await
    }

    pub async fn upsert_profile(&self, profile: Profile) -> Result<(), Error> {
        self.store
            .atomic("upsert profile", |t| {
                t.board.upsert_profile(profile);
                Ok(())
            })
            .await
    }

    pub async fn upsert_team(&self, team: Team) -> Result<(), Error> {
        self.store
            .atomic("upsert team", |t| {
                t.board.upsert_team(team);
                Ok(())
            })
            .await
    }

    /// Applies every command in order; failures go to dead letters and the
    /// replay carries on.
    pub async fn process<S: CommandStream>(&self, source: &mut S) {
        let mut commands = source.stream();
        let mut line = 0usize;

        while let Some(command) = commands.next().await {
            line += 1;
            let result = match command {
                Ok(command) => self.apply_command(command).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                self.dead_letters.report(&format!("command {}", line), &e);
            }
        }
    }

    pub async fn apply_command(&self, command: Command) -> Result<(), Error> {
        match command {
            Command::Profile { user_id, level } => {
                let phone = self
                    .store
                    .read(|t| t.board.profile(user_id).and_then(|p| p.phone.clone()))
                    .await;
                self.upsert_profile(Profile {
                    phone,
                    ..Profile::new(user_id, level)
                })
                .await
            }
            Command::Deposit { user_id, amount } => {
                let payment = self.withdrawals.initiate_deposit(user_id, amount).await?;
                let body = notification_body(
                    &self.gateway_password,
                    &payment.payment_id,
                    "CONFIRMED",
                    true,
                    amount,
                    Some(&payment.order_id),
                );
                self.webhook.handle(&body).await.map(|_| ())
            }
            Command::CreateTask {
                task_id,
                customer_id,
            } => self
                .create_task(Task::new(task_id, customer_id))
                .await
                .map(|_| ()),
            Command::Respond {
                task_id,
                user_id,
                price,
            } => self.respond(task_id, user_id, None, price).await,
            Command::Accept {
                task_id,
                customer_id,
                executor_id,
            } => self.accept_response(task_id, executor_id, customer_id).await,
            Command::Assign {
                task_id,
                customer_id,
                executor_id,
            } => self
                .escrow
                .assign(task_id, Assignee::Executor(executor_id), customer_id)
                .await
                .map(|_| ()),
            Command::Complete {
                task_id,
                customer_id,
            } => self.escrow.complete(task_id, customer_id).await.map(|_| ()),
            Command::Cancel {
                task_id,
                customer_id,
            } => self.escrow.cancel(task_id, customer_id).await.map(|_| ()),
            Command::Dispute { task_id, user_id } => {
                self.escrow.open_dispute(task_id, user_id).await.map(|_| ())
            }
            Command::ResolveRefund { task_id } => {
                self.escrow.resolve_refund(task_id).await.map(|_| ())
            }
            Command::ResolvePayout { task_id } => {
                self.escrow.resolve_payout(task_id).await.map(|_| ())
            }
            Command::Withdraw {
                user_id,
                amount,
                phone,
            } => self
                .withdrawals
                .initiate_withdrawal(user_id, amount, &phone)
                .await
                .map(|_| ()),
            Command::PayoutStatus { user_id, status } => {
                let payout = self
                    .store
                    .read(|t| {
                        t.payments
                            .payouts_of(user_id)
                            .max_by_key(|p| p.created_at)
                            .cloned()
                    })
                    .await
                    .ok_or_else(|| Error::NotFound(format!("payout of user {}", user_id)))?;
                let body = notification_body(
                    &self.gateway_password,
                    &payout.payment_id,
                    &status.to_string(),
                    status == GatewayStatus::Completed,
                    payout.amount,
                    Some(&payout.order_id),
                );
                self.webhook.handle(&body).await.map(|_| ())
            }
        }
    }

    pub async fn balances(&self) -> BTreeMap<UserId, Account> {
        self.store.read(|t| t.ledger.accounts().clone()).await
    }

    /// Drains queued side effects, then audits the ledger.
    pub async fn shutdown(&self) -> Result<(), Error> {
        self.effects.shutdown().await;
        self.store.audit().await.inspect_err(|e| {
            self.dead_letters.report("ledger audit", e);
        })
    }
}
