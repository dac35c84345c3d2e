pub mod account;
pub mod error;
pub mod money;
pub mod notification;
pub mod payment;
pub mod task;
pub mod traits;
pub mod transaction;

pub use account::{Account, UserId};
pub use error::Error;
pub use money::Money;
pub use notification::{Notification, StatusChange};
pub use payment::{DealStatus, ExternalDeal, ExternalPayment, ExternalPayout, GatewayStatus};
pub use task::{
    Assignee, Profile, Response, ResponseStatus, Task, TaskId, TaskStatus, Team, TeamId,
};
pub use traits::{
    AchievementService, Confirmation, DeadLetterQueue, ExperienceService, GatewayReceipt,
    Notifier, PaymentGateway, PaymentRequest, PayoutRequest, UserEvent,
};
pub use transaction::{EntryId, EntryKind, LedgerEntry};
