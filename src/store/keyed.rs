//! Keyed state holder with local or shared backing.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::clock::{Clock, Timestamp};
use crate::store::{StateStore, StoreError};

/// Optimistic update attempts before giving up on a contended shared key.
const MAX_CAS_ATTEMPTS: u32 = 8;

#[derive(Debug, Default)]
struct Slot<S> {
    state: S,
    touched: Timestamp,
    /// Set when the slot is evicted; updates racing the eviction retry on a fresh slot.
    retired: bool,
}

#[derive(Debug)]
enum Backing<S> {
    Local(DashMap<String, Arc<Mutex<Slot<S>>>>),
    Shared {
        store: Arc<dyn StateStore>,
        ttl: Duration,
    },
}

/// Per-key state of type `S`.
///
/// Locally, each key owns its own mutex inside a sharded map; operations on
/// different keys never contend and no lock is ever held across an `.await`.
/// With a shared store, state is serialized with `serde_json` and updated
/// through compare-and-swap.
#[derive(Debug)]
pub struct KeyedState<S> {
    namespace: String,
    backing: Backing<S>,
    clock: Arc<dyn Clock>,
}

impl<S> KeyedState<S>
where
    S: Default + Serialize + DeserializeOwned + Send + 'static,
{
    pub fn local(namespace: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            namespace: namespace.into(),
            backing: Backing::Local(DashMap::new()),
            clock,
        }
    }

    /// State kept in `store`; entries expire `ttl` after their last update.
    pub fn shared(
        namespace: impl Into<String>,
        clock: Arc<dyn Clock>,
        store: Arc<dyn StateStore>,
        ttl: Duration,
    ) -> Self {
        Self {
            namespace: namespace.into(),
            backing: Backing::Shared { store, ttl },
            clock,
        }
    }

    pub fn is_shared(&self) -> bool {
        matches!(self.backing, Backing::Shared { .. })
    }

    /// Apply `f` to the state for `key`, creating it on first use.
    ///
    /// With a shared store `f` may run more than once (once per conflicting
    /// update); only the result of the committed run is returned.
    pub async fn update<R, F>(&self, key: &str, mut f: F) -> Result<R, StoreError>
    where
        R: Send,
        F: FnMut(&mut S) -> R + Send,
    {
        let (store, ttl) = match &self.backing {
            Backing::Local(slots) => return Ok(self.apply_local(slots, key, f)),
            Backing::Shared { store, ttl } => (store, *ttl),
        };

        let full_key = self.store_key(key);
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = store.get(&full_key).await?;
            let mut state: S = match &current {
                Some(bytes) => serde_json::from_slice(bytes)?,
                None => S::default(),
            };
            let result = f(&mut state);
            let encoded = serde_json::to_vec(&state)?;
            if store
                .compare_and_swap(&full_key, current.as_deref(), encoded, ttl)
                .await?
            {
                return Ok(result);
            }
            tokio::task::yield_now().await;
        }

        Err(StoreError::Contention {
            key: full_key,
            attempts: MAX_CAS_ATTEMPTS,
        })
    }

    /// Apply `f` synchronously. Returns `None` when the state is shared.
    pub fn update_local<R, F>(&self, key: &str, f: F) -> Option<R>
    where
        F: FnMut(&mut S) -> R,
    {
        match &self.backing {
            Backing::Local(slots) => Some(self.apply_local(slots, key, f)),
            Backing::Shared { .. } => None,
        }
    }

    fn apply_local<R, F>(&self, slots: &DashMap<String, Arc<Mutex<Slot<S>>>>, key: &str, mut f: F) -> R
    where
        F: FnMut(&mut S) -> R,
    {
        loop {
            // The map guard is dropped before the slot is locked.
            let slot = Arc::clone(
                slots
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(Mutex::new(Slot::default())))
                    .value(),
            );
            let mut guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
            if guard.retired {
                continue;
            }
            guard.touched = self.clock.now();
            return f(&mut guard.state);
        }
    }

    /// Read the state for `key` without creating it.
    pub async fn read<R, F>(&self, key: &str, f: F) -> Result<Option<R>, StoreError>
    where
        F: FnOnce(&S) -> R + Send,
    {
        match &self.backing {
            Backing::Local(slots) => {
                let Some(slot) = slots.get(key).map(|entry| Arc::clone(entry.value())) else {
                    return Ok(None);
                };
                let guard = slot.lock().unwrap_or_else(PoisonError::into_inner);
                Ok(Some(f(&guard.state)))
            }
            Backing::Shared { store, .. } => {
                let Some(bytes) = store.get(&self.store_key(key)).await? else {
                    return Ok(None);
                };
                let state: S = serde_json::from_slice(&bytes)?;
                Ok(Some(f(&state)))
            }
        }
    }

    /// Visit every locally held key. Shared state is not enumerable.
    pub fn for_each_local(&self, mut f: impl FnMut(&str, &S)) {
        if let Backing::Local(slots) = &self.backing {
            for entry in slots.iter() {
                let guard = entry.value().lock().unwrap_or_else(PoisonError::into_inner);
                f(entry.key(), &guard.state);
            }
        }
    }

    /// Number of locally held keys.
    pub fn len(&self) -> usize {
        match &self.backing {
            Backing::Local(slots) => slots.len(),
            Backing::Shared { .. } => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop keys untouched for `ttl` whose state `is_idle` reports as fresh.
    ///
    /// Keys locked by an in-progress update are skipped. Shared entries
    /// expire through the store's own TTL instead.
    pub fn evict_idle(&self, ttl: Duration, mut is_idle: impl FnMut(&mut S, Timestamp) -> bool) -> usize {
        let Backing::Local(slots) = &self.backing else {
            return 0;
        };
        let now = self.clock.now();
        let before = slots.len();
        slots.retain(|_, slot| match slot.try_lock() {
            Ok(mut guard) => {
                let expired = guard.touched + ttl <= now;
                if expired && is_idle(&mut guard.state, now) {
                    guard.retired = true;
                    false
                } else {
                    true
                }
            }
            Err(_) => true,
        });
        before.saturating_sub(slots.len())
    }

    fn store_key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }
}
