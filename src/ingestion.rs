use std::io::Read;
use std::pin::Pin;

use futures::stream::{self, Stream};
use serde::Deserialize;

use crate::domain::{Error, GatewayStatus, Money, TaskId, UserId};

/// One replayable operation against the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Profile { user_id: UserId, level: u32 },
    /// Initiates a deposit and delivers the provider's confirmation for it.
    Deposit { user_id: UserId, amount: Money },
    CreateTask { task_id: TaskId, customer_id: UserId },
    Respond { task_id: TaskId, user_id: UserId, price: Money },
    Accept { task_id: TaskId, customer_id: UserId, executor_id: UserId },
    Assign { task_id: TaskId, customer_id: UserId, executor_id: UserId },
    Complete { task_id: TaskId, customer_id: UserId },
    Cancel { task_id: TaskId, customer_id: UserId },
    Dispute { task_id: TaskId, user_id: UserId },
    ResolveRefund { task_id: TaskId },
    ResolvePayout { task_id: TaskId },
    Withdraw { user_id: UserId, amount: Money, phone: String },
    /// Provider status for the user's most recent payout.
    PayoutStatus { user_id: UserId, status: GatewayStatus },
}

pub trait CommandStream {
    type Commands: Stream<Item = Result<Command, Error>> + Send + Unpin;

    fn stream(&mut self) -> Self::Commands;
}

pub struct CsvReader<R: Read> {
    reader: Option<csv::Reader<R>>,
}

impl<R: Read> CsvReader<R> {
    pub fn new(reader: R) -> Self {
        let rdr = csv::ReaderBuilder::new()
            .trim(csv::Trim::All)
            .flexible(true)
            .from_reader(reader);

        Self { reader: Some(rdr) }
    }
}

/// Internal shape used only for CSV deserialization: `op,user,task,amount,arg`.
#[derive(Debug, Deserialize)]
struct CsvRow {
    op: String,
    user: UserId,
    task: Option<TaskId>,
    amount: Option<Money>,
    arg: Option<String>,
}

impl CsvRow {
    fn task(&self) -> Result<TaskId, Error> {
        self.task
            .ok_or_else(|| Error::Ingestion(format!("{} needs a task id", self.op)))
    }

    fn amount(&self) -> Result<Money, Error> {
        self.amount
            .ok_or_else(|| Error::Ingestion(format!("{} needs an amount", self.op)))
    }

    fn arg(&self) -> Result<&str, Error> {
        self.arg
            .as_deref()
            .filter(|a| !a.is_empty())
            .ok_or_else(|| Error::Ingestion(format!("{} needs an argument", self.op)))
    }

    fn arg_user(&self) -> Result<UserId, Error> {
        let raw = self.arg()?;
        raw.parse()
            .map_err(|_| Error::Ingestion(format!("invalid user id {}", raw)))
    }
}

impl TryFrom<CsvRow> for Command {
    type Error = Error;

    fn try_from(row: CsvRow) -> Result<Self, Self::Error> {
        let user_id = row.user;
        let command = match row.op.to_ascii_lowercase().as_str() {
            "profile" => {
                let raw = row.arg()?;
                let level = raw
                    .parse()
                    .map_err(|_| Error::Ingestion(format!("invalid level {}", raw)))?;
                Command::Profile { user_id, level }
            }
            "deposit" => Command::Deposit {
                user_id,
                amount: row.amount()?,
            },
            "task" => Command::CreateTask {
                task_id: row.task()?,
                customer_id: user_id,
            },
            "respond" => Command::Respond {
                task_id: row.task()?,
                user_id,
                price: row.amount()?,
            },
            "accept" => Command::Accept {
                task_id: row.task()?,
                customer_id: user_id,
                executor_id: row.arg_user()?,
            },
            "assign" => Command::Assign {
                task_id: row.task()?,
                customer_id: user_id,
                executor_id: row.arg_user()?,
            },
            "complete" => Command::Complete {
                task_id: row.task()?,
                customer_id: user_id,
            },
            "cancel" => Command::Cancel {
                task_id: row.task()?,
                customer_id: user_id,
            },
            "dispute" => Command::Dispute {
                task_id: row.task()?,
                user_id,
            },
            "refund" => Command::ResolveRefund { task_id: row.task()? },
            "release" => Command::ResolvePayout { task_id: row.task()? },
            "withdraw" => Command::Withdraw {
                user_id,
                amount: row.amount()?,
                phone: row.arg()?.to_string(),
            },
            "payout" => Command::PayoutStatus {
                user_id,
                status: GatewayStatus::parse(row.arg()?),
            },
            other => {
                return Err(Error::Ingestion(format!("Invalid operation: {}", other)));
            }
        };
        Ok(command)
    }
}

impl<R: Read + Send + 'static> CommandStream for CsvReader<R> {
    type Commands = Pin<Box<dyn Stream<Item = Result<Command, Error>> + Send>>;

    fn stream(&mut self) -> Self::Commands {
        // Take ownership of the reader so the stream owns all data and is 'static.
        let Some(reader) = self.reader.take() else {
            return Box::pin(stream::empty());
        };

        let iter = reader
            .into_deserialize::<CsvRow>()
            .map(|row| match row {
                Ok(row) => Command::try_from(row),
                Err(e) => Err(Error::Ingestion(format!("CSV deserialization error: {}", e))),
            });

        Box::pin(stream::iter(iter))
    }
}
