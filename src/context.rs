//! Per-call cancellation and deadline.

use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::clock::{Clock, Timestamp};

/// External signals a guarded call must honour.
///
/// Cancelling the token (or passing the deadline) abandons remaining retries
/// immediately; outcomes already observed are still recorded.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    token: CancellationToken,
    deadline: Option<Timestamp>,
}

impl CallContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel this call when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_deadline(mut self, deadline: Timestamp) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Deadline `timeout` from the clock's current time.
    pub fn with_timeout(self, clock: &dyn Clock, timeout: Duration) -> Self {
        let deadline = clock.now() + timeout;
        self.with_deadline(deadline)
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn deadline(&self) -> Option<Timestamp> {
        self.deadline
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Cancelled, or past the deadline at `now`.
    pub fn is_done(&self, now: Timestamp) -> bool {
        self.is_cancelled() || self.deadline.is_some_and(|d| now >= d)
    }

    /// Time left before the deadline, if one is set.
    pub fn remaining(&self, now: Timestamp) -> Option<Duration> {
        self.deadline.map(|d| d.saturating_duration_since(now))
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }
}
