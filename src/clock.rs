//! Time source abstraction.
//!
//! Every window, timeout and backoff computation in the crate reads time
//! through a [`Clock`], so tests can drive it explicitly with [`ManualClock`].
//!
//! # Design Decisions
//! - Timestamps are milliseconds since the UNIX epoch, so state persisted in a
//!   shared store stays meaningful across processes
//! - [`SystemClock`] anchors wall time once and advances with `Instant`, so it
//!   never goes backwards inside a process
//! - Suspension goes through the clock as well (`Clock::sleep`)

use std::fmt;
use std::ops::Add;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;

/// A point in time, in milliseconds since the UNIX epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    pub const fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub const fn as_millis(self) -> u64 {
        self.0
    }

    /// Time elapsed since `earlier`, or zero if `earlier` is in the future.
    pub fn saturating_duration_since(self, earlier: Timestamp) -> Duration {
        Duration::from_millis(self.0.saturating_sub(earlier.0))
    }

    pub fn saturating_sub(self, duration: Duration) -> Timestamp {
        Timestamp(self.0.saturating_sub(duration_millis(duration)))
    }
}

impl Add<Duration> for Timestamp {
    type Output = Timestamp;

    fn add(self, rhs: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(duration_millis(rhs)))
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}ms", self.0)
    }
}

/// Whole milliseconds in `duration`, rounded up so short waits never become zero.
pub(crate) fn duration_millis(duration: Duration) -> u64 {
    let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
    if duration.subsec_nanos() % 1_000_000 != 0 {
        millis.saturating_add(1)
    } else {
        millis
    }
}

/// Source of time for all guards.
#[async_trait]
pub trait Clock: Send + Sync + fmt::Debug {
    /// Current time.
    fn now(&self) -> Timestamp;

    /// Suspend the calling task for `duration` without blocking the executor.
    async fn sleep(&self, duration: Duration);

    /// Resolve once `now()` reaches `deadline`.
    ///
    /// Unlike [`sleep`](Clock::sleep) this is a passive wait: it never moves
    /// a test clock forward by itself.
    async fn sleep_until(&self, deadline: Timestamp);
}

/// Production clock backed by the OS.
#[derive(Debug)]
pub struct SystemClock {
    anchor: Instant,
    anchor_millis: u64,
}

impl SystemClock {
    pub fn new() -> Self {
        let anchor_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or_default();
        Self {
            anchor: Instant::now(),
            anchor_millis,
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> Timestamp {
        let elapsed = u64::try_from(self.anchor.elapsed().as_millis()).unwrap_or(u64::MAX);
        Timestamp(self.anchor_millis.saturating_add(elapsed))
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    async fn sleep_until(&self, deadline: Timestamp) {
        tokio::time::sleep(deadline.saturating_duration_since(self.now())).await;
    }
}

/// Deterministic clock for tests.
///
/// Time only moves when [`ManualClock::advance`] is called or when a task
/// sleeps: `sleep` advances the clock by the requested duration, records it,
/// and yields once to the scheduler. `sleep_until` waits for someone else to
/// move the clock.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
    sleeps: Mutex<Vec<Duration>>,
    changed: Notify,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(start: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(start.as_millis()),
            sleeps: Mutex::new(Vec::new()),
            changed: Notify::new(),
        }
    }

    pub fn advance(&self, duration: Duration) {
        self.now.fetch_add(duration_millis(duration), Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    pub fn set(&self, at: Timestamp) {
        self.now.store(at.as_millis(), Ordering::SeqCst);
        self.changed.notify_waiters();
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Clock for ManualClock {
    fn now(&self) -> Timestamp {
        Timestamp(self.now.load(Ordering::SeqCst))
    }

    async fn sleep(&self, duration: Duration) {
        self.sleeps
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(duration);
        self.advance(duration);
        tokio::task::yield_now().await;
    }

    async fn sleep_until(&self, deadline: Timestamp) {
        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            // Register before checking so an advance in between is not missed.
            changed.as_mut().enable();
            if self.now() >= deadline {
                return;
            }
            changed.await;
        }
    }
}
