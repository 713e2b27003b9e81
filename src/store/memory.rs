//! In-process [`StateStore`].
//!
//! Behaves like an external key-value store with TTLs, which makes it useful
//! for exercising the shared-state code paths in tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::clock::{Clock, Timestamp};
use crate::store::{StateStore, StoreError};

#[derive(Debug)]
struct StoredValue {
    bytes: Vec<u8>,
    expires_at: Timestamp,
}

/// DashMap-backed store with expiry measured on the injected clock.
#[derive(Debug)]
pub struct MemoryStore {
    entries: DashMap<String, StoredValue>,
    clock: Arc<dyn Clock>,
    available: AtomicBool,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            clock,
            available: AtomicBool::new(true),
        }
    }

    /// Simulate an outage: while unavailable every call fails.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of stored (possibly expired) entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn ensure_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        }
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.ensure_available()?;
        let now = self.clock.now();
        let value = self
            .entries
            .get(key)
            .filter(|v| v.expires_at > now)
            .map(|v| v.bytes.clone());
        if value.is_none() {
            self.entries.remove_if(key, |_, v| v.expires_at <= now);
        }
        Ok(value)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        new: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, StoreError> {
        self.ensure_available()?;
        let now = self.clock.now();
        let value = StoredValue {
            bytes: new,
            expires_at: now + ttl,
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let current = occupied.get();
                let live = (current.expires_at > now).then_some(current.bytes.as_slice());
                if live != expected {
                    return Ok(false);
                }
                occupied.insert(value);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                if expected.is_some() {
                    return Ok(false);
                }
                vacant.insert(value);
                Ok(true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[tokio::test]
    async fn test_compare_and_swap_semantics() {
        let clock = Arc::new(ManualClock::new());
        let store = MemoryStore::new(clock.clone());
        let ttl = Duration::from_secs(10);

        assert!(store.compare_and_swap("k", None, b"a".to_vec(), ttl).await.unwrap());
        assert!(!store.compare_and_swap("k", None, b"b".to_vec(), ttl).await.unwrap());
        assert!(!store
            .compare_and_swap("k", Some(b"x"), b"b".to_vec(), ttl)
            .await
            .unwrap());
        assert!(store
            .compare_and_swap("k", Some(b"a"), b"b".to_vec(), ttl)
            .await
            .unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"b".to_vec()));
    }

    #[tokio::test]
    async fn test_entries_expire_on_clock() {
        let clock = Arc::new(ManualClock::new());
        let store = MemoryStore::new(clock.clone());
        store
            .compare_and_swap("k", None, b"a".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(1));
        assert_eq!(store.get("k").await.unwrap(), None);
        assert!(store.is_empty());
        // An expired value counts as absent for the swap as well.
        store
            .compare_and_swap("j", None, b"a".to_vec(), Duration::from_secs(1))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(2));
        assert!(store
            .compare_and_swap("j", None, b"b".to_vec(), Duration::from_secs(1))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_outage_fails_every_call() {
        let store = MemoryStore::new(Arc::new(ManualClock::new()));
        store.set_available(false);
        assert!(matches!(store.get("k").await, Err(StoreError::Unavailable(_))));
    }
}
