//! Shutdown coordination for the gateway.

use tokio::sync::broadcast;

/// Coordinator for graceful shutdown.
///
/// Provides a broadcast channel that all long-running tasks can subscribe to.
#[derive(Debug, Clone)]
pub struct Shutdown {
    /// Broadcast channel sender; clones share it.
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    /// Create a new shutdown coordinator.
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    /// Subscribe to the shutdown signal. Receivers created after
    /// [`trigger`](Self::trigger) do not see it.
    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    /// Wake every subscriber. Safe to call more than once.
    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Number of subscribers still listening.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}
