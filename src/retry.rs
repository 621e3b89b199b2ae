//! Bounded retry policy for the retrying consumer.

use serde::{Deserialize, Serialize};

/// How many failed attempts a message gets before it is dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_retries: u32,
}

impl RetryPolicy {
    pub fn new(max_retries: u32) -> Self {
        Self { max_retries }
    }

    /// Decides what happens after a failure, given the number of failed attempts so far
    /// (including the one that just failed).
    pub fn decide(&self, failed_attempts: u32) -> RetryAction {
        if failed_attempts >= self.max_retries {
            RetryAction::DeadLetter {
                attempts: failed_attempts,
            }
        } else {
            RetryAction::Retry {
                attempt: failed_attempts,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Outcome of a failed message handling attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    /// Republish with the retry header set to `attempt`.
    Retry { attempt: u32 },
    /// Reject without requeue so the broker moves it to the dead-letter queue.
    DeadLetter { attempts: u32 },
}
