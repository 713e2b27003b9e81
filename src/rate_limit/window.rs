//! Bucketed sliding window counter.
//!
//! Events are grouped into buckets of `granularity` width. Each bucket keeps
//! the timestamp of its newest event and expires one full window after it,
//! so an event is only forgotten once it is at least a window old. The
//! approximation can under-admit near bucket edges but never over-admits.
//! Memory per window is bounded by `window / granularity + 1` buckets.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;
use crate::config::WindowConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Bucket {
    start: Timestamp,
    newest: Timestamp,
    count: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowCounter {
    buckets: VecDeque<Bucket>,
    total: u32,
}

impl WindowCounter {
    /// Forget every bucket whose newest event is a full window old.
    pub fn purge(&mut self, now: Timestamp, window: Duration) {
        while let Some(front) = self.buckets.front() {
            if front.newest + window > now {
                break;
            }
            self.total = self.total.saturating_sub(front.count);
            self.buckets.pop_front();
        }
    }

    /// Events counted in the window. Call [`purge`](Self::purge) first.
    pub fn count(&self) -> u32 {
        self.total
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Whether `cost` more events fit; on rejection, how long until they would.
    ///
    /// Assumes the counter was purged at `now`.
    pub fn check(&self, now: Timestamp, cost: u32, config: &WindowConfig) -> Result<u32, Duration> {
        let after = self.total.saturating_add(cost);
        if after <= config.limit {
            return Ok(config.limit - after);
        }
        if cost > config.limit {
            return Err(config.window());
        }

        // Oldest buckets expire first; find the one whose expiry frees enough room.
        let excess = after - config.limit;
        let mut freed = 0u32;
        for bucket in &self.buckets {
            freed = freed.saturating_add(bucket.count);
            if freed >= excess {
                return Err((bucket.newest + config.window()).saturating_duration_since(now));
            }
        }
        Err(config.window())
    }

    pub fn add(&mut self, now: Timestamp, cost: u32, granularity: Duration) {
        if cost == 0 {
            return;
        }
        match self.buckets.back_mut() {
            Some(back) if now < back.start + granularity => {
                back.count = back.count.saturating_add(cost);
                back.newest = back.newest.max(now);
            }
            _ => self.buckets.push_back(Bucket {
                start: now,
                newest: now,
                count: cost,
            }),
        }
        self.total = self.total.saturating_add(cost);
    }
}
