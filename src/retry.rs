//! Bounded retry with a fixed delay, interruptible by cancellation.

use log::{debug, warn};
use std::fmt::Display;
use std::time::Duration;

use crate::cancel::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            delay,
        }
    }
}

#[derive(Debug)]
pub enum RetryOutcome<T, E> {
    /// The operation returned Ok on attempt number `attempts`
    Succeeded { value: T, attempts: u32 },
    /// Every attempt failed
    Exhausted { last_error: Option<E>, attempts: u32 },
    /// Cancellation fired before the budget was used up
    Cancelled { attempts: u32 },
}

impl<T, E> RetryOutcome<T, E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryOutcome::Succeeded { attempts, .. }
            | RetryOutcome::Exhausted { attempts, .. }
            | RetryOutcome::Cancelled { attempts } => *attempts,
        }
    }
}

/// Run `op` until it succeeds, the attempt budget is exhausted, or `cancel`
/// fires. The delay is only slept between attempts.
///
/// `op` receives the 1-based attempt number. Failures are logged, not returned,
/// except for the last one.
pub fn retry<T, E, F>(
    label: &str,
    policy: RetryPolicy,
    cancel: &CancellationToken,
    mut op: F,
) -> RetryOutcome<T, E>
where
    E: Display,
    F: FnMut(u32) -> Result<T, E>,
{
    let mut last_error = None;
    let mut attempts = 0;

    while attempts < policy.max_attempts {
        if cancel.is_cancelled() {
            debug!("{}: cancelled after {} attempt(s)", label, attempts);
            return RetryOutcome::Cancelled { attempts };
        }

        attempts += 1;
        match op(attempts) {
            Ok(value) => return RetryOutcome::Succeeded { value, attempts },
            Err(e) => {
                warn!(
                    "{}: attempt {}/{} failed: {}",
                    label, attempts, policy.max_attempts, e
                );
                last_error = Some(e);
            }
        }

        if attempts < policy.max_attempts && cancel.sleep(policy.delay) {
            debug!("{}: cancelled while waiting to retry", label);
            return RetryOutcome::Cancelled { attempts };
        }
    }

    RetryOutcome::Exhausted {
        last_error,
        attempts,
    }
}
