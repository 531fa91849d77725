// Token-bucket rate limiting

use std::sync::Mutex;
use std::time::Instant;

use dashmap::DashMap;

use crate::rules::Direction;

/// Burst depth: a bucket holds at most this many seconds worth of tokens.
const BURST_SECS: f64 = 2.0;

/// Thread-safe token bucket. Tokens are bytes; they accrue at `rate`
/// bytes/sec up to `max_tokens = 2 * rate` and are spent whole-packet.
/// A packet that cannot be paid for is dropped by the caller and nothing is
/// refunded: the drop is what tells the sender's congestion control to back
/// off.
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

struct BucketState {
    tokens: f64,
    max_tokens: f64,
    rate: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// New bucket at `rate` bytes/sec, initially full.
    pub fn new(rate: f64) -> Self {
        let rate = rate.max(0.0);
        let max_tokens = rate * BURST_SECS;
        Self {
            state: Mutex::new(BucketState {
                tokens: max_tokens,
                max_tokens,
                rate,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Update the rate. The burst cap follows the new rate; tokens above the
    /// new cap are discarded, never topped up.
    pub fn set_rate(&self, rate: f64) {
        let rate = rate.max(0.0);
        let mut state = self.state.lock().unwrap();
        state.rate = rate;
        state.max_tokens = rate * BURST_SECS;
        if state.tokens > state.max_tokens {
            state.tokens = state.max_tokens;
        }
    }

    /// Refill from elapsed monotonic time, then take `n` tokens if all of
    /// them are available. Returns false otherwise, leaving the balance
    /// untouched apart from the refill.
    pub fn try_consume(&self, n: u32) -> bool {
        self.try_consume_at(n, Instant::now())
    }

    fn try_consume_at(&self, n: u32, now: Instant) -> bool {
        if n == 0 {
            return true;
        }
        let mut state = self.state.lock().unwrap();
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.last_refill = now;
        state.tokens = (state.tokens + elapsed * state.rate).min(state.max_tokens);

        let need = n as f64;
        if state.tokens >= need {
            state.tokens -= need;
            true
        } else {
            false
        }
    }

    pub fn rate(&self) -> f64 {
        self.state.lock().unwrap().rate
    }

    pub fn tokens(&self) -> f64 {
        self.state.lock().unwrap().tokens
    }
}

/// Scope of one bucket: the host-wide cap or a single process, per
/// direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BucketKey {
    Global(Direction),
    Pid(u32, Direction),
}

/// Lazily-populated bucket table. Buckets appear on the first packet that
/// needs them and are re-tuned on every packet, so live rule edits and
/// adaptive adjustments take effect on the next packet through.
#[derive(Default)]
pub struct BucketMap {
    buckets: DashMap<BucketKey, TokenBucket>,
}

impl BucketMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge `len` bytes against the bucket for `key`, creating it at
    /// `rate` when absent. Returns false when the packet must be dropped.
    pub fn try_consume(&self, key: BucketKey, rate: f64, len: u32) -> bool {
        let bucket = self
            .buckets
            .entry(key)
            .or_insert_with(|| TokenBucket::new(rate));
        bucket.set_rate(rate);
        bucket.try_consume(len)
    }

    /// Drop both direction buckets for `pid` (its rule went away).
    pub fn remove_pid(&self, pid: u32) {
        self.buckets.remove(&BucketKey::Pid(pid, Direction::Download));
        self.buckets.remove(&BucketKey::Pid(pid, Direction::Upload));
    }

    pub fn contains(&self, key: &BucketKey) -> bool {
        self.buckets.contains_key(key)
    }

    pub fn clear(&self) {
        self.buckets.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_new_bucket_is_full_with_two_second_burst() {
        let bucket = TokenBucket::new(1000.0);
        assert_eq!(bucket.rate(), 1000.0);
        assert!((bucket.tokens() - 2000.0).abs() < 1e-9);
    }

    #[test]
    fn test_set_rate_clamps_tokens_down() {
        let bucket = TokenBucket::new(1000.0);
        bucket.set_rate(100.0);
        assert_eq!(bucket.rate(), 100.0);
        // old balance of 2000 must not survive the smaller cap
        assert!(bucket.tokens() <= 200.0 + 1e-9);

        // raising the rate widens the cap but never mints tokens
        bucket.set_rate(1000.0);
        assert!(bucket.tokens() <= 200.0 + 1e-9);
    }

    #[test]
    fn test_negative_rate_is_clamped_to_zero() {
        let bucket = TokenBucket::new(-5.0);
        assert_eq!(bucket.rate(), 0.0);
        assert_eq!(bucket.tokens(), 0.0);
    }

    #[test]
    fn test_consume_zero_always_succeeds_without_spending() {
        let bucket = TokenBucket::new(0.0);
        assert!(bucket.try_consume(0));
        assert_eq!(bucket.tokens(), 0.0);
    }

    #[test]
    fn test_zero_rate_rejects_everything() {
        let bucket = TokenBucket::new(0.0);
        let now = Instant::now();
        assert!(!bucket.try_consume_at(1, now));
        // no amount of elapsed time helps at rate zero
        assert!(!bucket.try_consume_at(1, now + Duration::from_secs(3600)));
        assert_eq!(bucket.tokens(), 0.0);
    }

    #[test]
    fn test_burst_bound_and_refill() {
        let bucket = TokenBucket::new(1000.0);
        let t0 = Instant::now();

        // more than the burst depth can never pass at once
        assert!(!bucket.try_consume_at(2101, t0));
        // the full burst passes, draining the bucket
        assert!(bucket.try_consume_at(2000, t0));
        assert!(!bucket.try_consume_at(500, t0));

        // one second refills one second of tokens (modest slack for the
        // creation-to-t0 gap)
        assert!(bucket.try_consume_at(900, t0 + Duration::from_secs(1)));
        assert!(!bucket.try_consume_at(500, t0 + Duration::from_secs(1)));

        // refill caps at max_tokens no matter how long the idle gap
        assert!(bucket.try_consume_at(2000, t0 + Duration::from_secs(3600)));
        assert!(!bucket.try_consume_at(2000, t0 + Duration::from_secs(3600)));
    }

    #[test]
    fn test_failed_consume_leaves_tokens_for_smaller_request() {
        let bucket = TokenBucket::new(1000.0);
        let t0 = Instant::now();
        assert!(!bucket.try_consume_at(5000, t0));
        // the failed attempt spent nothing; a smaller request still passes
        assert!(bucket.try_consume_at(1500, t0));
    }

    #[test]
    fn test_bucket_map_lazily_creates_and_removes() {
        let buckets = BucketMap::new();
        let key = BucketKey::Pid(7, Direction::Download);
        assert!(!buckets.contains(&key));

        assert!(buckets.try_consume(key, 1_000_000.0, 1500));
        assert!(buckets.contains(&key));

        buckets.remove_pid(7);
        assert!(!buckets.contains(&key));
        assert!(!buckets.contains(&BucketKey::Pid(7, Direction::Upload)));
    }

    #[test]
    fn test_bucket_map_retunes_rate_on_every_charge() {
        let buckets = BucketMap::new();
        let key = BucketKey::Global(Direction::Upload);
        assert!(buckets.try_consume(key, 1_000_000.0, 1500));
        // the next charge re-tunes the bucket down; the old 2 MB balance
        // cannot pay for a packet above the new cap
        assert!(!buckets.try_consume(key, 100.0, 1500));
    }
}
