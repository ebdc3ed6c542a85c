use std::{
    hash::Hash,
    time::{Duration, Instant},
};

use dashmap::{DashMap, mapref::entry::Entry};

use crate::{Clock, KeylatchError, MonotonicClock, common::CooldownDuration};

/// Per-key "not ready until" gate.
///
/// Each key maps to the instant its cooldown expires. A key with no entry, or with
/// an entry whose expiry is not in the future, is ready.
///
/// # Thread Safety
///
/// - Backed by a [`DashMap`](dashmap::DashMap); updates lock only the shard that
///   holds the key, so unrelated keys do not serialize on each other
/// - [`try_acquire`](CooldownMap::try_acquire) is atomic per key: among concurrent
///   callers racing on a ready key exactly one observes `true`
///
/// # Memory
///
/// Expired entries are not purged on their own. They behave exactly like absent
/// entries, but keep their slot until [`clear_expired`](CooldownMap::clear_expired)
/// or [`clear`](CooldownMap::clear) removes them.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use keylatch::{CooldownMap, ManualClock};
///
/// let clock = ManualClock::new();
/// let cooldowns = CooldownMap::with_clock(clock.clone());
///
/// assert!(cooldowns.try_acquire(&"player_1", Duration::from_secs(3)).unwrap());
/// assert!(!cooldowns.try_acquire(&"player_1", Duration::from_secs(3)).unwrap());
///
/// clock.advance(Duration::from_secs(1));
/// assert_eq!(cooldowns.remaining(&"player_1"), Duration::from_secs(2));
///
/// clock.advance(Duration::from_secs(2));
/// assert!(cooldowns.try_acquire(&"player_1", Duration::from_secs(3)).unwrap());
/// ```
pub struct CooldownMap<K, C = MonotonicClock>
where
    K: Eq + Hash,
{
    expiries: DashMap<K, Instant>,
    clock: C,
}

impl<K> CooldownMap<K>
where
    K: Eq + Hash + Clone,
{
    /// Create an empty map driven by the monotonic system clock.
    pub fn new() -> Self {
        Self::with_clock(MonotonicClock)
    }
}

impl<K> Default for CooldownMap<K>
where
    K: Eq + Hash + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, C> CooldownMap<K, C>
where
    K: Eq + Hash + Clone,
    C: Clock,
{
    /// Create an empty map that reads time from `clock`.
    pub fn with_clock(clock: C) -> Self {
        Self {
            expiries: DashMap::new(),
            clock,
        }
    }

    /// Start (or restart) a cooldown of `duration` for `key`, whatever its current state.
    ///
    /// # Errors
    ///
    /// [`KeylatchError::InvalidArgument`] if `duration` is zero or the expiry cannot
    /// be represented.
    pub fn set(&self, key: &K, duration: Duration) -> Result<(), KeylatchError> {
        let expires_at = self.expiry_from_now(duration)?;
        self.expiries.insert(key.clone(), expires_at);
        Ok(())
    } // end method set

    /// Start a cooldown for `key` if it is not already cooling down.
    ///
    /// Returns `true` if the cooldown was started. Returns `false` and leaves the
    /// running cooldown untouched otherwise.
    ///
    /// # Errors
    ///
    /// [`KeylatchError::InvalidArgument`] if `duration` is zero or the expiry cannot
    /// be represented. Validation happens before the map is touched.
    pub fn try_acquire(&self, key: &K, duration: Duration) -> Result<bool, KeylatchError> {
        let duration = CooldownDuration::try_from(duration)?;

        match self.expiries.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let now = self.clock.now();

                if *entry.get() > now {
                    tracing::trace!(
                        remaining_ms = u64::try_from(entry.get().duration_since(now).as_millis())
                            .unwrap_or(u64::MAX),
                        "cooldown active"
                    );
                    return Ok(false);
                }

                entry.insert(Self::checked_expiry(now, duration)?);
            }
            Entry::Vacant(entry) => {
                let now = self.clock.now();
                entry.insert(Self::checked_expiry(now, duration)?);
            }
        }

        Ok(true)
    } // end method try_acquire

    /// Time left before `key` is ready again; zero if it is not cooling down.
    pub fn remaining(&self, key: &K) -> Duration {
        match self.expiries.get(key) {
            None => Duration::ZERO,
            Some(expires_at) => expires_at.saturating_duration_since(self.clock.now()),
        }
    }

    /// Whether `key` is cooling down right now.
    pub fn is_on_cooldown(&self, key: &K) -> bool {
        !self.remaining(key).is_zero()
    }

    /// The instant `key`'s cooldown ends, if it has one that has not been purged.
    ///
    /// The returned instant may already be in the past.
    pub fn expires_at(&self, key: &K) -> Option<Instant> {
        self.expiries.get(key).map(|expires_at| *expires_at)
    }

    /// Drop any cooldown for `key`; the next [`try_acquire`](Self::try_acquire) succeeds.
    pub fn clear(&self, key: &K) {
        self.expiries.remove(key);
    }

    /// Remove every entry whose cooldown has ended and return how many were removed.
    ///
    /// Only bounds memory; readiness answers are the same before and after.
    pub fn clear_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.expiries.len();

        self.expiries.retain(|_, expires_at| *expires_at > now);

        let remaining = self.expiries.len();
        let removed = before.saturating_sub(remaining);

        tracing::debug!(removed, remaining, "cleared expired cooldowns");

        removed
    } // end method clear_expired

    /// Number of tracked entries, expired ones included.
    pub fn len(&self) -> usize {
        self.expiries.len()
    }

    /// Whether no entries are tracked.
    pub fn is_empty(&self) -> bool {
        self.expiries.is_empty()
    }

    fn expiry_from_now(&self, duration: Duration) -> Result<Instant, KeylatchError> {
        let duration = CooldownDuration::try_from(duration)?;
        Self::checked_expiry(self.clock.now(), duration)
    }

    fn checked_expiry(now: Instant, duration: CooldownDuration) -> Result<Instant, KeylatchError> {
        now.checked_add(*duration).ok_or_else(|| {
            KeylatchError::InvalidArgument("Cooldown duration overflows the clock".to_string())
        })
    }
} // end of impl
