use std::{ops::Deref, time::Duration};

use crate::KeylatchError;

/// A validated permit count (must be `>= 1`).
///
/// Used both as a limiter's burst capacity and as the number of permits a single
/// acquisition consumes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Permits(u64);

impl Permits {
    /// A single permit.
    pub const ONE: Permits = Permits(1);
}

impl Default for Permits {
    fn default() -> Self {
        Self::ONE
    }
}

impl Deref for Permits {
    type Target = u64;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<u64> for Permits {
    type Error = KeylatchError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        if value == 0 {
            Err(KeylatchError::InvalidArgument(
                "Permits must be greater than 0".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// A validated refill period (must be non-zero).
///
/// A limiter regenerates its full [`Permits`] capacity once per period.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RefillPeriod(Duration);

impl Deref for RefillPeriod {
    type Target = Duration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<Duration> for RefillPeriod {
    type Error = KeylatchError;

    fn try_from(value: Duration) -> Result<Self, Self::Error> {
        if value.is_zero() {
            Err(KeylatchError::InvalidArgument(
                "Refill period must be greater than 0".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// A validated cooldown length (must be non-zero).
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CooldownDuration(Duration);

impl Deref for CooldownDuration {
    type Target = Duration;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl TryFrom<Duration> for CooldownDuration {
    type Error = KeylatchError;

    fn try_from(value: Duration) -> Result<Self, Self::Error> {
        if value.is_zero() {
            Err(KeylatchError::InvalidArgument(
                "Cooldown duration must be greater than 0".to_string(),
            ))
        } else {
            Ok(Self(value))
        }
    }
}

/// Configuration for a [`KeyedRateLimiter`](crate::KeyedRateLimiter).
///
/// `permits` is both the burst capacity and the number of permits regenerated per
/// `period`, so the steady rate is `permits / period`.
#[derive(Clone, Debug)]
pub struct RateLimiterOptions {
    /// Burst capacity of every bucket.
    pub permits: Permits,
    /// Time it takes an empty bucket to refill completely.
    pub period: RefillPeriod,
}

impl RateLimiterOptions {
    /// Build options from raw values, validating both.
    pub fn try_new(permits: u64, period: Duration) -> Result<Self, KeylatchError> {
        Ok(Self {
            permits: Permits::try_from(permits)?,
            period: RefillPeriod::try_from(period)?,
        })
    }
}
