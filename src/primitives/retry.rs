#![forbid(unsafe_code)]
//! Bounded retry for index restructuring that may transiently run out of space.

use std::thread;
use std::time::Duration;

use tracing::{debug, error};

use crate::types::{Result, SombraError};

/// Attempts a pessimistic delete makes before giving up.
pub const DELETE_RETRY_ATTEMPTS: u32 = 100;
/// Pause between pessimistic delete attempts.
pub const DELETE_RETRY_BACKOFF: Duration = Duration::from_millis(50);

/// Retry bound and pause.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first.
    pub max_attempts: u32,
    /// Sleep between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DELETE_RETRY_ATTEMPTS,
            backoff: DELETE_RETRY_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Runs `op` until it returns something other than [`SombraError::OutOfSpace`].
    ///
    /// `op` receives the 1-based attempt number. Any other error is returned
    /// immediately. Once the bound is reached the result is
    /// [`SombraError::RetryExhausted`], which callers escalate as fatal.
    pub fn run<T>(&self, what: &'static str, mut op: impl FnMut(u32) -> Result<T>) -> Result<T> {
        let max = self.max_attempts.max(1);
        for attempt in 1..=max {
            match op(attempt) {
                Err(SombraError::OutOfSpace) => {
                    debug!(op = what, attempt, max, "undo.retry.out_of_space");
                    if attempt < max && !self.backoff.is_zero() {
                        thread::sleep(self.backoff);
                    }
                }
                other => return other,
            }
        }
        error!(op = what, attempts = max, "undo.retry.exhausted");
        Err(SombraError::RetryExhausted { attempts: max })
    }
}
