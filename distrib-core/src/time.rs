//! Clocks.
//!
//! Every time-dependent component (request expiry, retry backoff) takes a
//! [`TimeProvider`] at construction instead of reading an ambient clock.
//! Production code uses [`TokioTimeProvider`]; tests drive a
//! [`ManualTimeProvider`] forward explicitly.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::Notify;

/// Failures of a [`TimeProvider`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TimeError {
    /// The deadline passed before the future finished.
    #[error("deadline elapsed")]
    Elapsed,

    /// The clock is gone, usually because its runtime stopped.
    #[error("clock stopped")]
    Shutdown,
}

/// Source of time for expiry sweeps and retry delays.
///
/// `now()` counts from the provider's creation and only compares with other
/// readings of the same provider.
#[async_trait]
pub trait TimeProvider: Clone + Send + Sync + 'static {
    /// Wait for `duration`.
    async fn sleep(&self, duration: Duration) -> Result<(), TimeError>;

    /// Time elapsed since the provider was created.
    fn now(&self) -> Duration;

    /// Drive `future` for at most `duration`.
    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: std::future::Future<Output = T> + Send,
        T: Send;
}

/// Wall-clock time on the tokio runtime.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    started: Instant,
}

impl TokioTimeProvider {
    /// Start counting from now.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) -> Result<(), TimeError> {
        tokio::time::sleep(duration).await;
        Ok(())
    }

    fn now(&self) -> Duration {
        self.started.elapsed()
    }

    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: std::future::Future<Output = T> + Send,
        T: Send,
    {
        tokio::time::timeout(duration, future)
            .await
            .map_err(|_| TimeError::Elapsed)
    }
}

/// A clock that only moves when told to.
///
/// Clones share the same clock. Sleepers wake when [`advance`](Self::advance)
/// moves the clock past their deadline.
///
/// ```
/// use std::time::Duration;
/// use distrib_core::{ManualTimeProvider, TimeProvider};
///
/// let time = ManualTimeProvider::new();
/// time.advance(Duration::from_millis(250));
/// assert_eq!(time.now(), Duration::from_millis(250));
/// ```
#[derive(Debug, Clone, Default)]
pub struct ManualTimeProvider {
    inner: Arc<ManualClock>,
}

#[derive(Debug, Default)]
struct ManualClock {
    nanos: AtomicU64,
    tick: Notify,
}

impl ManualTimeProvider {
    /// Create a clock starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward and wake every sleeper whose deadline passed.
    pub fn advance(&self, duration: Duration) {
        let delta = u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX);
        self.inner.nanos.fetch_add(delta, Ordering::SeqCst);
        self.inner.tick.notify_waiters();
    }
}

#[async_trait]
impl TimeProvider for ManualTimeProvider {
    async fn sleep(&self, duration: Duration) -> Result<(), TimeError> {
        let deadline = self.now() + duration;
        loop {
            // Register interest before checking, so an advance in between is not lost.
            let tick = self.inner.tick.notified();
            if self.now() >= deadline {
                return Ok(());
            }
            tick.await;
        }
    }

    fn now(&self) -> Duration {
        Duration::from_nanos(self.inner.nanos.load(Ordering::SeqCst))
    }

    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, TimeError>
    where
        F: std::future::Future<Output = T> + Send,
        T: Send,
    {
        tokio::select! {
            result = future => Ok(result),
            _ = self.sleep(duration) => Err(TimeError::Elapsed),
        }
    }
}
