//! Randomness for retry jitter.
//!
//! Competing proposers that back off by the same fixed delay keep colliding.
//! A random extra delay lets one of them get ahead.

use std::ops::Range;
use std::time::Duration;

use rand::distr::uniform::SampleUniform;
use rand::Rng;

/// Source of random numbers.
pub trait RandomProvider: Clone + Send + Sync + 'static {
    /// A value in `range`, upper bound excluded.
    fn random_range<T>(&self, range: Range<T>) -> T
    where
        T: SampleUniform + PartialOrd;

    /// Pick a delay in `base..base + jitter`.
    fn jittered(&self, base: Duration, jitter: Duration) -> Duration {
        let jitter_ms = u64::try_from(jitter.as_millis()).unwrap_or(u64::MAX);
        if jitter_ms == 0 {
            return base;
        }
        base + Duration::from_millis(self.random_range(0..jitter_ms))
    }
}

/// Draws from `rand`'s per-thread generator.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThreadRandomProvider;

impl ThreadRandomProvider {
    /// Create the provider. It holds no state of its own.
    pub fn new() -> Self {
        Self
    }
}

impl RandomProvider for ThreadRandomProvider {
    fn random_range<T>(&self, range: Range<T>) -> T
    where
        T: SampleUniform + PartialOrd,
    {
        rand::rng().random_range(range)
    }
}
