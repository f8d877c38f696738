//! Quorum aggregation.
//!
//! A [`QuorumTracker`] collects one reply per replica and decides, exactly
//! once, whether a majority agreed. Two flavors wrap it as a
//! [`RequestCallback`] and differ only in how the caller observes the outcome:
//!
//! | Flavor | Caller side |
//! |---|---|
//! | [`AsyncQuorumCallback`] | awaits a [`QuorumFuture`] |
//! | [`BlockingQuorumCallback`] | parks the thread in [`block_for`](BlockingQuorumCallback::block_for) |
//!
//! ## Decision rule
//!
//! With `N` replicas the quorum is `N / 2 + 1`.
//!
//! - **Success** once `quorum` responses satisfy the success predicate.
//! - **Failure** once `failures > N - quorum`, where failures count transport
//!   errors plus responses that do not satisfy the predicate. At that point
//!   even if every silent replica answered favourably the quorum could not be
//!   reached.
//!
//! A second response from the same replica is ignored.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use distrib_core::ReplicaId;
use parking_lot::{Condvar, Mutex};
use tokio::sync::oneshot;
use tracing::debug;

use crate::waiting_list::{RequestCallback, RequestError};

/// Majority size for `total` replicas.
pub const fn quorum_size(total: usize) -> usize {
    total / 2 + 1
}

/// Why a quorum was not reached.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QuorumError<T> {
    /// Too many failures for the remaining replicas to make up a quorum.
    Unreachable {
        /// Responses that did not satisfy the success predicate.
        rejected: Vec<(ReplicaId, T)>,
        /// Transport errors and timeouts.
        errors: Vec<RequestError>,
    },

    /// The blocking wait gave up before a decision.
    Timeout,

    /// The callback was dropped before a decision.
    Abandoned,
}

impl<T> fmt::Display for QuorumError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            QuorumError::Unreachable { rejected, errors } => write!(
                f,
                "quorum unreachable: {} rejections, {} errors",
                rejected.len(),
                errors.len()
            ),
            QuorumError::Timeout => write!(f, "quorum wait timed out"),
            QuorumError::Abandoned => write!(f, "quorum callback abandoned"),
        }
    }
}

impl<T: fmt::Debug> std::error::Error for QuorumError<T> {}

/// Outcome of a quorum round: the qualifying responses, or why it failed.
pub type QuorumResult<T> = Result<Vec<(ReplicaId, T)>, QuorumError<T>>;

type Predicate<T> = Box<dyn Fn(&T) -> bool + Send + Sync>;

/// Shared aggregation state behind both quorum flavors.
pub struct QuorumTracker<T> {
    total: usize,
    quorum: usize,
    predicate: Predicate<T>,
    accepted: BTreeMap<ReplicaId, T>,
    rejected: BTreeMap<ReplicaId, T>,
    errors: Vec<RequestError>,
    done: bool,
}

impl<T> QuorumTracker<T> {
    /// Track `total` replicas; responses count towards the quorum when
    /// `predicate` holds.
    pub fn new(total: usize, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            total,
            quorum: quorum_size(total),
            predicate: Box::new(predicate),
            accepted: BTreeMap::new(),
            rejected: BTreeMap::new(),
            errors: Vec::new(),
            done: false,
        }
    }

    /// Track `total` replicas where every response counts.
    pub fn any_response(total: usize) -> Self {
        Self::new(total, |_| true)
    }

    /// Majority size.
    pub fn quorum(&self) -> usize {
        self.quorum
    }

    /// Whether a decision has already been made.
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Record a response. Returns the decision if this response made it.
    pub fn record_response(&mut self, from: ReplicaId, response: T) -> Option<QuorumResult<T>> {
        if self.done || self.accepted.contains_key(&from) || self.rejected.contains_key(&from) {
            return None;
        }
        if (self.predicate)(&response) {
            self.accepted.insert(from, response);
        } else {
            self.rejected.insert(from, response);
        }
        self.decide()
    }

    /// Record a transport error or timeout. Returns the decision if this
    /// error made it.
    pub fn record_error(&mut self, error: RequestError) -> Option<QuorumResult<T>> {
        if self.done {
            return None;
        }
        self.errors.push(error);
        self.decide()
    }

    fn failures(&self) -> usize {
        self.errors.len() + self.rejected.len()
    }

    fn decide(&mut self) -> Option<QuorumResult<T>> {
        if self.accepted.len() >= self.quorum {
            self.done = true;
            debug!(
                accepted = self.accepted.len(),
                quorum = self.quorum,
                "quorum reached"
            );
            let accepted = std::mem::take(&mut self.accepted);
            return Some(Ok(accepted.into_iter().collect()));
        }
        if self.failures() > self.total.saturating_sub(self.quorum) {
            self.done = true;
            debug!(
                rejected = self.rejected.len(),
                errors = self.errors.len(),
                total = self.total,
                "quorum unreachable"
            );
            let rejected = std::mem::take(&mut self.rejected);
            let errors = std::mem::take(&mut self.errors);
            return Some(Err(QuorumError::Unreachable {
                rejected: rejected.into_iter().collect(),
                errors,
            }));
        }
        None
    }
}

// =============================================================================
// Async flavor
// =============================================================================

struct AsyncState<T> {
    tracker: QuorumTracker<T>,
    sender: Option<oneshot::Sender<QuorumResult<T>>>,
}

/// Quorum callback resolving a [`QuorumFuture`].
pub struct AsyncQuorumCallback<T> {
    state: Mutex<AsyncState<T>>,
}

impl<T: Send + 'static> AsyncQuorumCallback<T> {
    /// Create the callback and the future it resolves.
    pub fn new(
        total: usize,
        predicate: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> (Arc<Self>, QuorumFuture<T>) {
        let (sender, receiver) = oneshot::channel();
        let callback = Arc::new(Self {
            state: Mutex::new(AsyncState {
                tracker: QuorumTracker::new(total, predicate),
                sender: Some(sender),
            }),
        });
        (callback, QuorumFuture { receiver })
    }

    fn resolve(state: &mut AsyncState<T>, decision: Option<QuorumResult<T>>) {
        // The sender must outlive every undecided reply.
        if let Some(decision) = decision {
            if let Some(sender) = state.sender.take() {
                let _ = sender.send(decision);
            }
        }
    }
}

impl<T: Send + 'static> RequestCallback<T> for AsyncQuorumCallback<T> {
    fn on_response(&self, response: T, from: ReplicaId) {
        let mut state = self.state.lock();
        let decision = state.tracker.record_response(from, response);
        Self::resolve(&mut state, decision);
    }

    fn on_error(&self, error: RequestError) {
        let mut state = self.state.lock();
        let decision = state.tracker.record_error(error);
        Self::resolve(&mut state, decision);
    }
}

/// Future side of an [`AsyncQuorumCallback`].
pub struct QuorumFuture<T> {
    receiver: oneshot::Receiver<QuorumResult<T>>,
}

impl<T> Future for QuorumFuture<T> {
    type Output = QuorumResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(QuorumError::Abandoned)),
            Poll::Pending => Poll::Pending,
        }
    }
}

// =============================================================================
// Blocking flavor
// =============================================================================

struct BlockingState<T> {
    tracker: QuorumTracker<T>,
    decision: Option<QuorumResult<T>>,
}

/// Quorum callback whose caller parks a thread until the decision.
pub struct BlockingQuorumCallback<T> {
    state: Mutex<BlockingState<T>>,
    decided: Condvar,
}

impl<T: Send> BlockingQuorumCallback<T> {
    /// Create a blocking callback for `total` replicas.
    pub fn new(total: usize, predicate: impl Fn(&T) -> bool + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BlockingState {
                tracker: QuorumTracker::new(total, predicate),
                decision: None,
            }),
            decided: Condvar::new(),
        })
    }

    /// Wait up to `timeout` for the decision.
    ///
    /// The decision is handed out once; later calls time out.
    pub fn block_for(&self, timeout: Duration) -> QuorumResult<T> {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        loop {
            if let Some(decision) = state.decision.take() {
                return decision;
            }
            if self.decided.wait_until(&mut state, deadline).timed_out() {
                return state.decision.take().unwrap_or(Err(QuorumError::Timeout));
            }
        }
    }

    fn record(&self, decision: Option<QuorumResult<T>>, state: &mut BlockingState<T>) {
        if let Some(decision) = decision {
            state.decision = Some(decision);
            self.decided.notify_all();
        }
    }
}

impl<T: Send> RequestCallback<T> for BlockingQuorumCallback<T> {
    fn on_response(&self, response: T, from: ReplicaId) {
        let mut state = self.state.lock();
        let decision = state.tracker.record_response(from, response);
        self.record(decision, &mut state);
    }

    fn on_error(&self, error: RequestError) {
        let mut state = self.state.lock();
        let decision = state.tracker.record_error(error);
        self.record(decision, &mut state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timeout() -> RequestError {
        RequestError::Timeout {
            elapsed: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_quorum_size() {
        assert_eq!(quorum_size(1), 1);
        assert_eq!(quorum_size(3), 2);
        assert_eq!(quorum_size(4), 3);
        assert_eq!(quorum_size(5), 3);
    }

    #[test]
    fn test_three_of_five_succeeds() {
        let mut tracker = QuorumTracker::new(5, |promised: &bool| *promised);
        assert!(tracker.record_response(ReplicaId(0), true).is_none());
        assert!(tracker.record_response(ReplicaId(1), true).is_none());
        let decision = tracker
            .record_response(ReplicaId(2), true)
            .expect("decided");
        let responses = decision.expect("success");
        assert_eq!(responses.len(), 3);

        // One-shot: later input is ignored.
        assert!(tracker.record_response(ReplicaId(3), true).is_none());
        assert!(tracker.record_error(timeout()).is_none());
    }

    #[test]
    fn test_three_errors_of_five_fails() {
        let mut tracker = QuorumTracker::<bool>::any_response(5);
        assert!(tracker.record_error(timeout()).is_none());
        assert!(tracker.record_error(timeout()).is_none());
        let decision = tracker.record_error(timeout()).expect("decided");
        match decision {
            Err(QuorumError::Unreachable { rejected, errors }) => {
                assert!(rejected.is_empty());
                assert_eq!(errors.len(), 3);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_two_errors_of_five_stays_pending() {
        let mut tracker = QuorumTracker::<bool>::any_response(5);
        assert!(tracker.record_error(timeout()).is_none());
        assert!(tracker.record_error(timeout()).is_none());
        assert!(!tracker.is_done());

        // Three replicas can still answer.
        tracker.record_response(ReplicaId(2), true);
        tracker.record_response(ReplicaId(3), true);
        let decision = tracker
            .record_response(ReplicaId(4), true)
            .expect("decided");
        assert!(decision.is_ok());
    }

    #[test]
    fn test_rejections_count_as_failures() {
        let mut tracker = QuorumTracker::new(3, |promised: &bool| *promised);
        assert!(tracker.record_response(ReplicaId(0), false).is_none());
        let decision = tracker
            .record_response(ReplicaId(1), false)
            .expect("decided");
        match decision {
            Err(QuorumError::Unreachable { rejected, .. }) => {
                assert_eq!(rejected, vec![(ReplicaId(0), false), (ReplicaId(1), false)]);
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_duplicate_response_ignored() {
        let mut tracker = QuorumTracker::<bool>::any_response(3);
        assert!(tracker.record_response(ReplicaId(0), true).is_none());
        assert!(tracker.record_response(ReplicaId(0), true).is_none());
        assert!(!tracker.is_done());
        assert!(tracker.record_response(ReplicaId(1), true).is_some());
    }

    #[tokio::test]
    async fn test_async_flavor_resolves() {
        let (callback, future) = AsyncQuorumCallback::new(3, |n: &u32| *n > 0);
        callback.on_response(1, ReplicaId(0));
        callback.on_error(timeout());
        callback.on_response(2, ReplicaId(2));

        let responses = future.await.expect("quorum");
        assert_eq!(responses, vec![(ReplicaId(0), 1), (ReplicaId(2), 2)]);
    }

    #[tokio::test]
    async fn test_async_flavor_survives_undecided_replies() {
        let (callback, future) = AsyncQuorumCallback::new(5, |ok: &bool| *ok);
        callback.on_response(true, ReplicaId(0));
        callback.on_response(false, ReplicaId(1));
        callback.on_error(timeout());
        callback.on_response(true, ReplicaId(3));
        callback.on_response(true, ReplicaId(4));

        let responses = future.await.expect("quorum");
        assert_eq!(
            responses,
            vec![(ReplicaId(0), true), (ReplicaId(3), true), (ReplicaId(4), true)]
        );
    }

    #[tokio::test]
    async fn test_async_flavor_abandoned() {
        let (callback, future) = AsyncQuorumCallback::<u32>::new(3, |_| true);
        drop(callback);
        assert_eq!(future.await, Err(QuorumError::Abandoned));
    }

    #[test]
    fn test_blocking_flavor_waits_for_other_threads() {
        let callback = BlockingQuorumCallback::new(3, |ok: &bool| *ok);
        let responders: Vec<_> = (0..3)
            .map(|i| {
                let callback = callback.clone();
                std::thread::spawn(move || callback.on_response(true, ReplicaId(i)))
            })
            .collect();

        let responses = callback
            .block_for(Duration::from_secs(5))
            .expect("quorum");
        assert!(responses.len() >= 2);

        for responder in responders {
            responder.join().expect("join");
        }
    }

    #[test]
    fn test_blocking_flavor_times_out() {
        let callback = BlockingQuorumCallback::new(3, |ok: &bool| *ok);
        callback.on_response(true, ReplicaId(0));
        assert_eq!(
            callback.block_for(Duration::from_millis(20)),
            Err(QuorumError::Timeout)
        );
    }
}
