use std::sync::Mutex;

use tracing::error;

use crate::domain::{DeadLetterQueue, Error};

/// Reports failures to the log, where alerting picks them up.
#[derive(Default, Debug)]
pub struct LogDeadLetters {}

impl DeadLetterQueue for LogDeadLetters {
    fn report(&self, context: &str, error: &Error) {
        error!(context, error = %error, fatal = error.is_fatal(), "dead letter");
    }
}

/// Keeps dead letters in memory as well as logging them.
#[derive(Default, Debug)]
pub struct CollectingDeadLetters {
    letters: Mutex<Vec<String>>,
}

impl CollectingDeadLetters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<String> {
        self.letters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }
}

impl DeadLetterQueue for CollectingDeadLetters {
    fn report(&self, context: &str, error: &Error) {
        LogDeadLetters::default().report(context, error);
        self.letters
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(format!("{}: {}", context, error));
    }
}
