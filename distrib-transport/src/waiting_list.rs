//! Request waiting list: correlation of outbound requests to pending callbacks.
//!
//! Every outbound request registers a [`RequestCallback`] under a fresh key
//! before it is sent. The entry then leaves the list exactly once:
//!
//! ```text
//! register(id, cb) ──▶ pending ──┬── handle_response(id, r, from) ──▶ cb.on_response(r, from)
//!                                ├── handle_error(id, e)          ──▶ cb.on_error(e)
//!                                └── sweep, age > expiry           ──▶ cb.on_error(Timeout)
//! ```
//!
//! Removal happens under the list's lock and the callback runs after the lock
//! is released. Whoever removes the entry first delivers; a late response or a
//! second error finds nothing and is dropped silently.
//!
//! Expiry is driven by a [`TimeProvider`], either by calling
//! [`RequestWaitingList::expire`] or by the background task started with
//! [`RequestWaitingList::spawn_sweeper`].

use std::collections::HashMap;
use std::fmt::{Debug, Display};
use std::future::Future;
use std::hash::Hash;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use distrib_core::{ReplicaId, TimeProvider};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Opaque id tying a response to the request that caused it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CorrelationId(pub u64);

impl Display for CorrelationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "corr({})", self.0)
    }
}

/// Configuration for a [`RequestWaitingList`].
#[derive(Debug, Clone)]
pub struct WaitingListConfig {
    /// Age after which a pending entry is failed with a timeout.
    pub expiry_timeout: Duration,
    /// Interval between two sweeps of the background sweeper.
    pub sweep_interval: Duration,
}

impl Default for WaitingListConfig {
    fn default() -> Self {
        Self {
            expiry_timeout: Duration::from_secs(1),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl WaitingListConfig {
    /// Set the expiry timeout.
    pub fn with_expiry_timeout(mut self, timeout: Duration) -> Self {
        self.expiry_timeout = timeout;
        self
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }
}

/// Failure delivered to a [`RequestCallback`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The request could not be delivered to the replica.
    #[error("network error to {replica}: {reason}")]
    Network {
        /// Replica the request was addressed to.
        replica: ReplicaId,
        /// Transport-level description.
        reason: String,
    },

    /// No response arrived before the expiry timeout.
    #[error("request timed out after {elapsed:?}")]
    Timeout {
        /// Age of the entry when it was expired.
        elapsed: Duration,
    },

    /// The waiting side went away before an outcome was delivered.
    #[error("request closed before completion")]
    Closed,
}

/// Errors returned by [`RequestWaitingList::register`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WaitingListError {
    /// The key is already pending.
    #[error("duplicate registration for {key}")]
    DuplicateRegistration {
        /// Rendered key.
        key: String,
    },
}

/// Completion capability registered for one outstanding request.
///
/// Exactly one of the two methods is called per registration.
pub trait RequestCallback<R>: Send + Sync {
    /// A response arrived from `from`.
    fn on_response(&self, response: R, from: ReplicaId);

    /// The request failed or expired.
    fn on_error(&self, error: RequestError);
}

struct CallbackDetails<R> {
    callback: Arc<dyn RequestCallback<R>>,
    created_at: Duration,
}

/// Correlation table from key to pending callback.
pub struct RequestWaitingList<K, R, T> {
    pending: Mutex<HashMap<K, CallbackDetails<R>>>,
    time: T,
    config: WaitingListConfig,
}

impl<K, R, T> RequestWaitingList<K, R, T>
where
    K: Eq + Hash + Clone + Display,
    T: TimeProvider,
{
    /// Create an empty waiting list.
    pub fn new(time: T, config: WaitingListConfig) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            time,
            config,
        }
    }

    /// The configuration this list was built with.
    pub fn config(&self) -> &WaitingListConfig {
        &self.config
    }

    /// Register a callback under `key`.
    ///
    /// A key still pending is never overwritten.
    pub fn register(
        &self,
        key: K,
        callback: Arc<dyn RequestCallback<R>>,
    ) -> Result<(), WaitingListError> {
        let mut pending = self.pending.lock();
        if pending.contains_key(&key) {
            return Err(WaitingListError::DuplicateRegistration {
                key: key.to_string(),
            });
        }
        debug!(key = %key, "registered pending request");
        pending.insert(
            key,
            CallbackDetails {
                callback,
                created_at: self.time.now(),
            },
        );
        Ok(())
    }

    /// Deliver a response. Returns `false` if nothing was pending under `key`.
    pub fn handle_response(&self, key: &K, response: R, from: ReplicaId) -> bool {
        let removed = self.pending.lock().remove(key);
        match removed {
            Some(details) => {
                details.callback.on_response(response, from);
                true
            }
            None => {
                debug!(key = %key, from = %from, "dropping response for unknown request");
                false
            }
        }
    }

    /// Deliver an error. Returns `false` if nothing was pending under `key`.
    pub fn handle_error(&self, key: &K, error: RequestError) -> bool {
        let removed = self.pending.lock().remove(key);
        match removed {
            Some(details) => {
                details.callback.on_error(error);
                true
            }
            None => false,
        }
    }

    /// Fail every entry older than the expiry timeout. Returns how many expired.
    pub fn expire(&self) -> usize {
        let now = self.time.now();
        let expiry = self.config.expiry_timeout;

        let expired: Vec<(K, CallbackDetails<R>)> = {
            let mut pending = self.pending.lock();
            let keys: Vec<K> = pending
                .iter()
                .filter(|(_, details)| now.saturating_sub(details.created_at) > expiry)
                .map(|(key, _)| key.clone())
                .collect();
            keys.into_iter()
                .filter_map(|key| pending.remove(&key).map(|details| (key, details)))
                .collect()
        };

        for (key, details) in &expired {
            let elapsed = now.saturating_sub(details.created_at);
            info!(key = %key, elapsed = ?elapsed, "expiring pending request");
            details.callback.on_error(RequestError::Timeout { elapsed });
        }
        expired.len()
    }

    /// Fail every pending entry with `error`, e.g. on shutdown.
    pub fn fail_all(&self, error: RequestError) -> usize {
        let drained: Vec<CallbackDetails<R>> =
            self.pending.lock().drain().map(|(_, details)| details).collect();
        for details in &drained {
            details.callback.on_error(error.clone());
        }
        drained.len()
    }

    /// Number of entries still pending.
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    /// Whether `key` is still pending.
    pub fn is_pending(&self, key: &K) -> bool {
        self.pending.lock().contains_key(key)
    }
}

impl<K, R, T> RequestWaitingList<K, R, T>
where
    K: Eq + Hash + Clone + Display + Send + 'static,
    R: Send + 'static,
    T: TimeProvider,
{
    /// Run [`expire`](Self::expire) every `sweep_interval` on the current
    /// tokio runtime.
    ///
    /// The task ends on its own once the list is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let list = Arc::downgrade(self);
        let time = self.time.clone();
        let interval = self.config.sweep_interval;
        tokio::spawn(async move {
            loop {
                if time.sleep(interval).await.is_err() {
                    break;
                }
                match list.upgrade() {
                    Some(list) => {
                        list.expire();
                    }
                    None => break,
                }
            }
        })
    }
}

impl<K, R, T> Debug for RequestWaitingList<K, R, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestWaitingList")
            .field("pending", &self.pending.lock().len())
            .field("config", &self.config)
            .finish()
    }
}

// =============================================================================
// Single-response callback
// =============================================================================

type SingleOutcome<R> = Result<(R, ReplicaId), RequestError>;

/// Callback that resolves one [`ResponseFuture`].
pub struct SingleResponseCallback<R> {
    sender: Mutex<Option<oneshot::Sender<SingleOutcome<R>>>>,
}

impl<R: Send> SingleResponseCallback<R> {
    /// Create the callback together with the future it resolves.
    pub fn new() -> (Arc<Self>, ResponseFuture<R>) {
        let (sender, receiver) = oneshot::channel();
        (
            Arc::new(Self {
                sender: Mutex::new(Some(sender)),
            }),
            ResponseFuture { receiver },
        )
    }

    fn complete(&self, outcome: SingleOutcome<R>) {
        if let Some(sender) = self.sender.lock().take() {
            // Receiver may be gone.
            let _ = sender.send(outcome);
        }
    }
}

impl<R: Send> RequestCallback<R> for SingleResponseCallback<R> {
    fn on_response(&self, response: R, from: ReplicaId) {
        self.complete(Ok((response, from)));
    }

    fn on_error(&self, error: RequestError) {
        self.complete(Err(error));
    }
}

/// Future side of a [`SingleResponseCallback`].
pub struct ResponseFuture<R> {
    receiver: oneshot::Receiver<SingleOutcome<R>>,
}

impl<R> Future for ResponseFuture<R> {
    type Output = SingleOutcome<R>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(RequestError::Closed)),
            Poll::Pending => Poll::Pending,
        }
    }
}
