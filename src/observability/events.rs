//! Guard events.
//!
//! Every circuit transition, rate-limit rejection and retry exhaustion is
//! published on a broadcast channel. Subscribers that fall behind lose the
//! oldest events; publishers never wait.

use serde::Serialize;
use tokio::sync::broadcast;

use crate::circuit_breaker::CircuitState;
use crate::clock::Timestamp;

/// Default number of buffered events per subscriber.
pub const DEFAULT_EVENT_CAPACITY: usize = 1_024;

/// Something noteworthy a guard did.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GuardEvent {
    CircuitTransition {
        policy: String,
        key: String,
        from: CircuitState,
        to: CircuitState,
        at: Timestamp,
    },
    RateLimited {
        policy: String,
        key: String,
        retry_after_ms: u64,
        current_count: u32,
    },
    RetryExhausted {
        policy: String,
        key: String,
        attempts: u32,
        last_error: String,
    },
}

/// Broadcast channel for [`GuardEvent`]s.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GuardEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<GuardEvent> {
        self.tx.subscribe()
    }

    /// Publish an event; dropped silently when nobody is listening.
    pub fn publish(&self, event: GuardEvent) {
        let _ = self.tx.send(event);
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
