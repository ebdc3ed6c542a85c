use std::{
    hash::Hash,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use dashmap::DashMap;

use crate::{
    Clock, KeylatchError, MonotonicClock,
    common::{Permits, RateLimiterOptions},
};

/// Token state for a single key.
///
/// Tokens are counted in units of `1 / period_nanos` of a token, so every
/// elapsed nanosecond adds exactly `permits` units and refill never rounds.
#[derive(Debug)]
pub(crate) struct Bucket {
    pub units: u128,
    pub last_refill: Instant,
}

impl Bucket {
    fn full(capacity_units: u128, now: Instant) -> Self {
        Self {
            units: capacity_units,
            last_refill: now,
        }
    }

    /// Units held at `now`, capped at `capacity_units`. Does not modify the bucket.
    fn units_at(&self, now: Instant, capacity_units: u128, units_per_nano: u128) -> u128 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_nanos();

        self.units
            .saturating_add(elapsed.saturating_mul(units_per_nano))
            .min(capacity_units)
    }

    /// Add the units regenerated since the last refill.
    fn refill(&mut self, now: Instant, capacity_units: u128, units_per_nano: u128) {
        if now <= self.last_refill {
            return;
        }

        self.units = self.units_at(now, capacity_units, units_per_nano);
        self.last_refill = now;
    }
}

/// Per-key continuous token bucket.
///
/// Every key owns a bucket holding at most `capacity` tokens that refills at
/// `permits / period` tokens per second. Refill is computed lazily from the time
/// elapsed since the bucket was last touched; there is no background timer.
///
/// # Algorithm
///
/// On each access:
///
/// 1. `tokens = min(capacity, tokens + elapsed_seconds × refill_rate)`
/// 2. If `tokens >= permits`, subtract `permits` and admit
/// 3. Otherwise reject and leave `tokens` unchanged
///
/// Tokens are kept as integers scaled by the period in nanoseconds, so the
/// outcome depends only on elapsed time, never on how often a key was queried.
/// [`available`](KeyedRateLimiter::available) and
/// [`estimate_wait`](KeyedRateLimiter::estimate_wait) only read bucket state.
///
/// Buckets are created full on first touch, so a fresh key can burst up to
/// `capacity` immediately.
///
/// # Thread Safety
///
/// - Buckets live in a [`DashMap`](dashmap::DashMap), each behind its own mutex
/// - Refill, check and subtract run as one critical section per bucket
/// - Unrelated keys never contend on the same bucket lock
///
/// # Memory
///
/// Buckets are never removed on their own. [`reset`](KeyedRateLimiter::reset)
/// drops one key and [`prune_full`](KeyedRateLimiter::prune_full) drops every
/// bucket that has refilled to capacity.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use keylatch::{KeyedRateLimiter, ManualClock, RateLimiterOptions};
///
/// let clock = ManualClock::new();
/// let options = RateLimiterOptions::try_new(2, Duration::from_secs(1)).unwrap();
/// let limiter = KeyedRateLimiter::with_clock(options, clock.clone());
///
/// assert!(limiter.try_acquire(&"user_123"));
/// assert!(limiter.try_acquire(&"user_123"));
/// assert!(!limiter.try_acquire(&"user_123"));
///
/// assert_eq!(
///     limiter.estimate_wait(&"user_123", 1).unwrap(),
///     Duration::from_millis(500)
/// );
///
/// clock.advance(Duration::from_millis(500));
/// assert!(limiter.try_acquire(&"user_123"));
/// ```
pub struct KeyedRateLimiter<K, C = MonotonicClock>
where
    K: Eq + Hash,
{
    capacity_units: u128,
    period_nanos: u128,
    refill_rate: f64,
    permits: Permits,
    buckets: DashMap<K, Mutex<Bucket>>,
    clock: C,
}

impl<K> KeyedRateLimiter<K>
where
    K: Eq + Hash + Clone,
{
    /// Create a limiter driven by the monotonic system clock.
    pub fn new(options: RateLimiterOptions) -> Self {
        Self::with_clock(options, MonotonicClock)
    }

    /// Create a limiter from raw values.
    ///
    /// # Errors
    ///
    /// [`KeylatchError::InvalidArgument`] if `permits` is zero or `period` is zero.
    pub fn try_new(permits: u64, period: Duration) -> Result<Self, KeylatchError> {
        Ok(Self::new(RateLimiterOptions::try_new(permits, period)?))
    }
}

impl<K, C> KeyedRateLimiter<K, C>
where
    K: Eq + Hash + Clone,
    C: Clock,
{
    /// Create a limiter that reads time from `clock`.
    pub fn with_clock(options: RateLimiterOptions, clock: C) -> Self {
        let period_nanos = options.period.as_nanos();

        Self {
            capacity_units: u128::from(*options.permits).saturating_mul(period_nanos),
            period_nanos,
            refill_rate: *options.permits as f64 / options.period.as_secs_f64(),
            permits: options.permits,
            buckets: DashMap::new(),
            clock,
        }
    } // end constructor

    #[cfg(test)]
    pub(crate) fn buckets(&self) -> &DashMap<K, Mutex<Bucket>> {
        &self.buckets
    }

    /// Take one permit for `key` if available.
    pub fn try_acquire(&self, key: &K) -> bool {
        self.acquire(key, Permits::ONE)
    }

    /// Take `permits` permits for `key` if all of them are available.
    ///
    /// Returns `false` without consuming anything when the bucket holds fewer than
    /// `permits` tokens, including when `permits` exceeds the limiter's capacity.
    ///
    /// # Errors
    ///
    /// [`KeylatchError::InvalidArgument`] if `permits` is zero.
    pub fn try_acquire_n(&self, key: &K, permits: u64) -> Result<bool, KeylatchError> {
        let permits = Permits::try_from(permits)?;
        Ok(self.acquire(key, permits))
    }

    /// How long until `permits` permits will be available for `key`.
    ///
    /// Zero if they are available now. The estimate is rounded up to the next
    /// nanosecond, so waiting exactly this long is always enough in the absence of
    /// other callers.
    ///
    /// Does not create a bucket for an untracked key.
    ///
    /// # Errors
    ///
    /// - [`KeylatchError::InvalidArgument`] if `permits` is zero
    /// - [`KeylatchError::ExceedsCapacity`] if `permits` can never be satisfied
    pub fn estimate_wait(&self, key: &K, permits: u64) -> Result<Duration, KeylatchError> {
        let permits = Permits::try_from(permits)?;

        if *permits > *self.permits {
            return Err(KeylatchError::ExceedsCapacity {
                requested: *permits,
                capacity: *self.permits,
            });
        }

        let held = self.units_now(key);
        let needed = self.units_for(permits);

        if held >= needed {
            return Ok(Duration::ZERO);
        }

        let wait_nanos = (needed - held).div_ceil(self.units_per_nano());

        Ok(Duration::from_nanos(u64::try_from(wait_nanos).unwrap_or(u64::MAX)))
    } // end method estimate_wait

    /// Tokens currently available for `key`, after refill.
    ///
    /// An untracked key reports the full capacity.
    pub fn available(&self, key: &K) -> f64 {
        self.tokens(self.units_now(key))
    }

    /// Forget `key`'s bucket; its next access starts full.
    pub fn reset(&self, key: &K) {
        self.buckets.remove(key);
    }

    /// Number of tracked keys.
    pub fn size(&self) -> usize {
        self.buckets.len()
    }

    /// Burst capacity shared by every key.
    pub fn capacity(&self) -> u64 {
        *self.permits
    }

    /// Tokens regenerated per second.
    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Remove every bucket that has refilled to capacity and return how many were removed.
    ///
    /// A full bucket admits exactly what a fresh one would, so admission decisions
    /// are unaffected.
    pub fn prune_full(&self) -> usize {
        let now = self.clock.now();
        let before = self.buckets.len();

        self.buckets.retain(|_, slot| {
            let bucket = slot.get_mut().unwrap_or_else(PoisonError::into_inner);
            bucket.units_at(now, self.capacity_units, self.units_per_nano()) < self.capacity_units
        });

        let remaining = self.buckets.len();
        let removed = before.saturating_sub(remaining);

        tracing::debug!(removed, remaining, "pruned full token buckets");

        removed
    } // end method prune_full

    fn acquire(&self, key: &K, permits: Permits) -> bool {
        let needed = self.units_for(permits);

        if let Some(slot) = self.buckets.get(key) {
            return self.take(&mut lock(&slot), needed);
        }

        let slot = self
            .buckets
            .entry(key.clone())
            .or_insert_with(|| Mutex::new(Bucket::full(self.capacity_units, self.clock.now())))
            .downgrade();

        self.take(&mut lock(&slot), needed)
    } // end method acquire

    fn take(&self, bucket: &mut Bucket, needed: u128) -> bool {
        bucket.refill(self.clock.now(), self.capacity_units, self.units_per_nano());

        if bucket.units >= needed {
            bucket.units -= needed;
            return true;
        }

        tracing::trace!(
            available = self.tokens(bucket.units),
            requested = self.tokens(needed),
            "token bucket exhausted"
        );

        false
    }

    /// Units `key` holds right now; an untracked key is full.
    fn units_now(&self, key: &K) -> u128 {
        let Some(slot) = self.buckets.get(key) else {
            return self.capacity_units;
        };

        let bucket = lock(&slot);
        bucket.units_at(self.clock.now(), self.capacity_units, self.units_per_nano())
    }

    fn units_for(&self, permits: Permits) -> u128 {
        u128::from(*permits).saturating_mul(self.period_nanos)
    }

    fn units_per_nano(&self) -> u128 {
        u128::from(*self.permits)
    }

    fn tokens(&self, units: u128) -> f64 {
        units as f64 / self.period_nanos as f64
    }
} // end of impl

/// Bucket state is valid after every statement, so a poisoned lock is still usable.
fn lock(slot: &Mutex<Bucket>) -> MutexGuard<'_, Bucket> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
