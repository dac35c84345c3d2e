use crate::domain::{Money, TaskId, TaskStatus, UserId};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    IO(#[from] std::io::Error),

    #[error("Ingestion failed with: {0}")]
    Ingestion(String),

    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Money, available: Money },

    #[error("Task {task_id} cannot move from {from} to {to}")]
    InvalidStateTransition {
        task_id: TaskId,
        from: TaskStatus,
        to: TaskStatus,
    },

    #[error("Task {0} already has an assignee")]
    AlreadyAssigned(TaskId),

    #[error("No accepted price for user {assignee} on task {task_id}")]
    NoPriceCommitted { task_id: TaskId, assignee: UserId },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Withdrawal rejected by fraud checks: {0}")]
    FraudRejected(String),

    #[error("Cannot cancel: {0}")]
    CannotCancel(String),

    #[error("Payment gateway error {code}: {message}")]
    ExternalGateway { code: String, message: String },

    #[error("Webhook signature verification failed")]
    SignatureVerificationFailed,

    #[error("Ledger invariant violated: {0}")]
    LedgerInvariantViolation(String),

    #[error("Collaborator {service} failed: {message}")]
    Collaborator { service: &'static str, message: String },
}

impl Error {
    pub fn gateway(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::ExternalGateway {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Bugs, not caller mistakes. Never swallowed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::LedgerInvariantViolation(_))
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        let code = if e.is_timeout() { "TIMEOUT" } else { "TRANSPORT" };
        Error::gateway(code, e.to_string())
    }
}

impl From<csv::Error> for Error {
    fn from(e: csv::Error) -> Self {
        Error::Ingestion(e.to_string())
    }
}
