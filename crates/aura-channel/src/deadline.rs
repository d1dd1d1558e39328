//! Absolute deadlines threaded through nested operations
//!
//! A [`Deadline`] is computed once from the caller's timeout. Every nested
//! call derives its own budget with [`Deadline::remaining`] instead of
//! restarting the clock.

use crate::error::{ChannelError, ChannelResult};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Point in time after which an operation must give up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    at: Option<Instant>,
    budget: Duration,
}

impl Deadline {
    /// Deadline `timeout` from now
    ///
    /// Timeouts too large to represent never expire.
    pub fn after(timeout: Duration) -> Self {
        Self {
            at: Instant::now().checked_add(timeout),
            budget: timeout,
        }
    }

    /// Deadline that never expires
    pub fn never() -> Self {
        Self {
            at: None,
            budget: Duration::MAX,
        }
    }

    /// Absolute expiry, `None` when the deadline never expires
    pub fn instant(&self) -> Option<Instant> {
        self.at
    }

    /// Original budget this deadline was created with
    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Time left before expiry, zero once expired
    pub fn remaining(&self) -> Duration {
        match self.at {
            Some(at) => at.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    /// Whether the deadline has passed
    pub fn is_expired(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Timeout error for `operation` reporting the original budget
    pub fn timeout_error(&self, operation: &str) -> ChannelError {
        ChannelError::timeout(operation, self.budget)
    }
}

/// Bound `future` by `deadline`, reporting expiry as a timeout for `operation`
pub async fn within<T, F>(deadline: Deadline, operation: &str, future: F) -> ChannelResult<T>
where
    F: Future<Output = ChannelResult<T>>,
{
    match deadline.instant() {
        Some(at) => match tokio::time::timeout_at(at, future).await {
            Ok(result) => result,
            Err(_) => Err(deadline.timeout_error(operation)),
        },
        None => future.await,
    }
}
