#![doc = include_str!("../README.md")]
#![deny(missing_docs)]
#![forbid(unsafe_code)]

mod clock;
pub use clock::*;

mod cooldown_map;
pub use cooldown_map::*;

mod keyed_rate_limiter;
pub use keyed_rate_limiter::KeyedRateLimiter;

mod task_fence;
pub use task_fence::*;

mod error;
pub use error::*;

mod runtime;

mod common;
pub use common::{CooldownDuration, Permits, RateLimiterOptions, RefillPeriod};

#[cfg(test)]
mod tests;
