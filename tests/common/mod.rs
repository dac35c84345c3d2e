#![allow(dead_code)]

use std::str::FromStr;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use settlement_engine::config::EngineConfig;
use settlement_engine::dlq::CollectingDeadLetters;
use settlement_engine::domain::{
    AchievementService, Account, EntryKind, Error, ExperienceService, LedgerEntry, Money,
    Notifier, PaymentGateway, Task, TaskId, UserEvent, UserId,
};
use settlement_engine::effects::Collaborators;
use settlement_engine::engine::Engine;
use settlement_engine::gateway::SandboxGateway;
use settlement_engine::reconciliation::Outcome;

pub const PASSWORD: &str = "sandbox-secret";
pub const PLATFORM: UserId = 900;

pub fn money(value: &str) -> Money {
    Money::from_str(value).unwrap()
}

/// Records everything the post-commit worker delivers.
#[derive(Debug, Default)]
pub struct Recorder {
    pub events: Mutex<Vec<(UserId, UserEvent)>>,
    pub xp: Mutex<Vec<(UserId, u32)>>,
    pub achievement_checks: Mutex<Vec<UserId>>,
}

#[async_trait]
impl Notifier for Recorder {
    async fn notify(&self, user_id: UserId, event: &UserEvent) -> Result<(), Error> {
        self.events.lock().unwrap().push((user_id, event.clone()));
        Ok(())
    }
}

#[async_trait]
impl ExperienceService for Recorder {
    async fn award_xp(&self, user_id: UserId, amount: u32, _reason: &str) -> Result<(), Error> {
        self.xp.lock().unwrap().push((user_id, amount));
        Ok(())
    }
}

#[async_trait]
impl AchievementService for Recorder {
    async fn check_and_award(&self, user_id: UserId) -> Result<Vec<String>, Error> {
        self.achievement_checks.lock().unwrap().push(user_id);
        Ok(Vec::new())
    }
}

pub struct Harness {
    pub engine: Engine,
    pub gateway: Arc<SandboxGateway>,
    pub recorder: Arc<Recorder>,
    pub dead_letters: Arc<CollectingDeadLetters>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_gateway(config, |sandbox| -> Arc<dyn PaymentGateway> { sandbox })
    }

    /// The engine talks to whatever `wrap` builds around the sandbox; the
    /// harness keeps the sandbox for signing notifications and call checks.
    pub fn with_gateway(
        mut config: EngineConfig,
        wrap: impl FnOnce(Arc<SandboxGateway>) -> Arc<dyn PaymentGateway>,
    ) -> Self {
        config.platform_account = PLATFORM;
        config.gateway.password = PASSWORD.to_string();

        let gateway = Arc::new(SandboxGateway::new(PASSWORD));
        let recorder = Arc::new(Recorder::default());
        let dead_letters = Arc::new(CollectingDeadLetters::new());
        let collaborators = Collaborators {
            notifier: recorder.clone(),
            experience: recorder.clone(),
            achievements: recorder.clone(),
            dead_letters: dead_letters.clone(),
        };
        let engine = Engine::new(config, wrap(gateway.clone()), collaborators);

        Self {
            engine,
            gateway,
            recorder,
            dead_letters,
        }
    }

    /// Deposits through the provider flow: initiation, then a signed
    /// `CONFIRMED` notification.
    pub async fn fund(&self, user_id: UserId, amount: &str) {
        let payment = self
            .engine
            .withdrawals()
            .initiate_deposit(user_id, money(amount))
            .await
            .unwrap();
        let body = self.gateway.notification(
            &payment.payment_id,
            "CONFIRMED",
            true,
            payment.amount,
            Some(&payment.order_id),
        );
        let outcome = self.engine.webhook().handle(&body).await.unwrap();
        assert!(matches!(outcome, Outcome::Credited(_)));
    }

    /// Creates a task and an accepted offer from `executor_id` at `price`.
    pub async fn task_with_offer(
        &self,
        task_id: TaskId,
        customer_id: UserId,
        executor_id: UserId,
        price: &str,
    ) {
        self.engine
            .create_task(Task::new(task_id, customer_id))
            .await
            .unwrap();
        self.engine
            .respond(task_id, executor_id, None, money(price))
            .await
            .unwrap();
        self.engine
            .accept_response(task_id, executor_id, customer_id)
            .await
            .unwrap();
    }

    pub async fn account(&self, user_id: UserId) -> Account {
        self.engine
            .store()
            .read(|t| t.ledger.account(user_id))
            .await
    }

    pub async fn task(&self, task_id: TaskId) -> Task {
        self.engine
            .store()
            .read(|t| t.board.task(task_id).cloned())
            .await
            .unwrap()
    }

    pub async fn entries(&self, user_id: UserId, kind: EntryKind) -> Vec<LedgerEntry> {
        self.engine
            .store()
            .read(|t| {
                t.ledger
                    .entries_for(user_id)
                    .filter(|e| e.kind == kind)
                    .cloned()
                    .collect()
            })
            .await
    }

    /// Drains post-commit effects and audits the ledger.
    pub async fn finish(&self) {
        self.engine.shutdown().await.unwrap();
    }
}
