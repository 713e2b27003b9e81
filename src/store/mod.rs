//! Per-key state storage.
//!
//! # Data Flow
//! ```text
//! limiter / breaker
//!     → KeyedState::update(key, |state| ...)
//!         local:  DashMap shard → per-key Mutex → closure (no await while held)
//!         shared: StateStore::get → decode → closure → encode → compare_and_swap
//! ```
//!
//! # Design Decisions
//! - Guard algorithms are plain functions over `&mut S`, so both backings run
//!   the same code
//! - Local state never takes a lock spanning more than one key
//! - Shared state uses optimistic concurrency; contention is bounded and
//!   surfaces as [`StoreError::Contention`]

pub mod keyed;
pub mod memory;

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

pub use keyed::KeyedState;
pub use memory::MemoryStore;

/// Store namespace for a guard: `prefix:name:fingerprint`.
///
/// Guards sharing a name but configured differently never share records.
pub(crate) fn namespace(prefix: &str, name: &str, config: &impl Serialize) -> String {
    let mut hasher = DefaultHasher::new();
    serde_json::to_vec(config).unwrap_or_default().hash(&mut hasher);
    format!("{prefix}:{name}:{:08x}", hasher.finish() as u32)
}

/// Errors raised by a [`StateStore`] or while (de)serializing state.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("state store unavailable: {0}")]
    Unavailable(String),

    #[error("state codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("gave up on '{key}' after {attempts} conflicting updates")]
    Contention { key: String, attempts: u32 },
}

/// Pluggable backend for sharing guard state between processes.
#[async_trait]
pub trait StateStore: Send + Sync + fmt::Debug {
    /// Current value for `key`, if present and not expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace the value for `key` with `new` only if it currently equals
    /// `expected` (`None` meaning absent). Returns whether the swap happened.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, StoreError>;
}
