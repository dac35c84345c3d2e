use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::domain::{
    AchievementService, DeadLetterQueue, Error, ExperienceService, Notifier, UserEvent, UserId,
};

/// Work that may only happen after a unit has committed. Failures here never
/// touch money that already moved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PostCommit {
    Notify { user_id: UserId, event: UserEvent },
    AwardXp { user_id: UserId, amount: u32, reason: String },
    CheckAchievements { user_id: UserId },
}

impl PostCommit {
    pub fn notify(user_id: UserId, event: UserEvent) -> Self {
        PostCommit::Notify { user_id, event }
    }
}

#[derive(Clone)]
pub struct Collaborators {
    pub notifier: Arc<dyn Notifier>,
    pub experience: Arc<dyn ExperienceService>,
    pub achievements: Arc<dyn AchievementService>,
    pub dead_letters: Arc<dyn DeadLetterQueue>,
}

impl Collaborators {
    /// Every collaborator only logs what it was asked to do.
    pub fn logging(dead_letters: Arc<dyn DeadLetterQueue>) -> Self {
        let log = Arc::new(LogCollaborator);
        Self {
            notifier: log.clone(),
            experience: log.clone(),
            achievements: log,
            dead_letters,
        }
    }
}

/// Stand-in used when the surrounding platform wires no real services.
#[derive(Debug, Default)]
pub struct LogCollaborator;

#[async_trait]
impl Notifier for LogCollaborator {
    async fn notify(&self, user_id: UserId, event: &UserEvent) -> Result<(), Error> {
        info!(user_id, %event, "notification");
        Ok(())
    }
}

#[async_trait]
impl ExperienceService for LogCollaborator {
    async fn award_xp(&self, user_id: UserId, amount: u32, reason: &str) -> Result<(), Error> {
        info!(user_id, amount, reason, "experience awarded");
        Ok(())
    }
}

#[async_trait]
impl AchievementService for LogCollaborator {
    async fn check_and_award(&self, user_id: UserId) -> Result<Vec<String>, Error> {
        debug!(user_id, "achievement check");
        Ok(Vec::new())
    }
}

/// Bounded outbox drained by one worker task.
pub struct EffectDispatcher {
    tx: Mutex<Option<mpsc::Sender<PostCommit>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    dead_letters: Arc<dyn DeadLetterQueue>,
}

impl EffectDispatcher {
    pub fn spawn(collaborators: Collaborators, capacity: usize) -> Self {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let dead_letters = collaborators.dead_letters.clone();
        let worker = tokio::spawn(run(rx, collaborators));
        Self {
            tx: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            dead_letters,
        }
    }

    /// Never blocks and never fails the caller: overflow goes to dead letters.
    pub fn dispatch(&self, effects: Vec<PostCommit>) {
        let guard = self.tx.lock().unwrap_or_else(|p| p.into_inner());
        let Some(tx) = guard.as_ref() else {
            warn!(dropped = effects.len(), "effects dispatched after shutdown");
            return;
        };
        for effect in effects {
            match tx.try_send(effect) {
                Ok(()) => {}
                Err(TrySendError::Full(effect)) | Err(TrySendError::Closed(effect)) => {
                    self.dead_letters.report(
                        "effects",
                        &Error::Collaborator {
                            service: "outbox",
                            message: format!("queue unavailable, dropped {:?}", effect),
                        },
                    );
                }
            }
        }
    }

    /// Closes the outbox and waits until queued effects are applied.
    pub async fn shutdown(&self) {
        drop(self.tx.lock().unwrap_or_else(|p| p.into_inner()).take());
        let worker = self.worker.lock().unwrap_or_else(|p| p.into_inner()).take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                error!(error = %e, "effects worker crashed");
            }
        }
    }
}

async fn run(mut rx: mpsc::Receiver<PostCommit>, collaborators: Collaborators) {
    while let Some(effect) = rx.recv().await {
        let label = format!("{:?}", effect);
        if let Err(e) = apply(effect, &collaborators).await {
            collaborators.dead_letters.report(&label, &e);
        }
    }
    debug!("effects worker drained");
}

async fn apply(effect: PostCommit, collaborators: &Collaborators) -> Result<(), Error> {
    match effect {
        PostCommit::Notify { user_id, event } => {
            collaborators.notifier.notify(user_id, &event).await
        }
        PostCommit::AwardXp {
            user_id,
            amount,
            reason,
        } => {
            collaborators
                .experience
                .award_xp(user_id, amount, &reason)
                .await
        }
        PostCommit::CheckAchievements { user_id } => {
            let badges = collaborators.achievements.check_and_award(user_id).await?;
            if badges.is_empty() {
                return Ok(());
            }
            collaborators
                .notifier
                .notify(user_id, &UserEvent::BadgesAwarded { badges })
                .await
        }
    }
}
