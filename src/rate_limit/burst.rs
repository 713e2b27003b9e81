//! Token bucket layered on top of the windows.
//!
//! Caps how many calls may arrive back-to-back even when the windows still
//! have room. Tokens refill continuously.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Timestamp;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    tokens: f64,
    last_update: Timestamp,
}

impl TokenBucket {
    pub fn full(capacity: f64, now: Timestamp) -> Self {
        Self {
            tokens: capacity,
            last_update: now,
        }
    }

    fn refill(&mut self, now: Timestamp, capacity: f64, refill_per_sec: f64) {
        let elapsed = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + elapsed * refill_per_sec).min(capacity);
        if now > self.last_update {
            self.last_update = now;
        }
    }

    /// Refill, then report whether `cost` tokens are available.
    ///
    /// On success returns the whole tokens that would remain; on rejection,
    /// how long until enough tokens accumulate.
    pub fn check(
        &mut self,
        now: Timestamp,
        cost: u32,
        capacity: f64,
        refill_per_sec: f64,
    ) -> Result<u32, Duration> {
        self.refill(now, capacity, refill_per_sec);
        let cost = f64::from(cost);
        if self.tokens >= cost {
            return Ok((self.tokens - cost).floor() as u32);
        }
        if cost > capacity || refill_per_sec <= 0.0 {
            return Err(Duration::MAX);
        }
        let wait = (cost - self.tokens) / refill_per_sec;
        Err(Duration::try_from_secs_f64(wait).unwrap_or(Duration::MAX))
    }

    pub fn consume(&mut self, cost: u32) {
        self.tokens = (self.tokens - f64::from(cost)).max(0.0);
    }

    pub fn is_full(&self, capacity: f64) -> bool {
        self.tokens >= capacity
    }

    pub fn tokens(&self) -> f64 {
        self.tokens
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drains_then_refills() {
        let mut bucket = TokenBucket::full(3.0, Timestamp::from_millis(0));
        for _ in 0..3 {
            assert!(bucket.check(Timestamp::from_millis(0), 1, 3.0, 1.0).is_ok());
            bucket.consume(1);
        }
        let wait = bucket.check(Timestamp::from_millis(0), 1, 3.0, 1.0).unwrap_err();
        assert_eq!(wait, Duration::from_secs(1));

        assert_eq!(bucket.check(Timestamp::from_millis(1_000), 1, 3.0, 1.0), Ok(0));
        assert!(!bucket.is_full(3.0));
        bucket.check(Timestamp::from_millis(10_000), 0, 3.0, 1.0).unwrap();
        assert!(bucket.is_full(3.0));
    }
}
