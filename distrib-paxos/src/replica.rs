//! The replica node: messaging, dispatch and ordered apply.
//!
//! A [`Replica`] plays every role at once. It is an acceptor and a generation
//! voter for its peers, and a proposer or vote coordinator for its own
//! clients.
//!
//! ```text
//!                 ┌──────────────────────── Replica ────────────────────────┐
//!  inbound ──────▶│ Request  ──match kind──▶ Acceptor / GenerationVoter      │
//!  Envelope       │                              │                          │
//!                 │                              └─▶ reply(from, corr_id) ──┼──▶ network
//!                 │ Response ──▶ RequestWaitingList ─▶ callback (quorum)     │
//!                 │                                                          │
//!                 │ Commit ──▶ Acceptor ──▶ Applier ──▶ apply waiters        │
//!                 └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Outbound requests
//!
//! Every request gets a fresh [`CorrelationId`] registered in the waiting list
//! before it is sent. A send that fails is reported to the callback at once,
//! so a quorum can fail without waiting for the expiry sweep.
//!
//! ## Ordered apply
//!
//! Committed entries reach the [`StateMachine`] strictly in index order. A
//! commit that fills a gap also applies every committed successor. Clients
//! waiting for an index are resolved after all locks are released.
//!
//! Locks are always taken acceptor first, applier second.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use distrib_core::{GenerationId, RandomProvider, ReplicaId, ThreadRandomProvider, TimeProvider};
use distrib_transport::{
    AsyncQuorumCallback, CorrelationId, Network, QuorumResult, RequestCallback, RequestError,
    RequestWaitingList, ResponseFuture, SingleResponseCallback, WaitingListConfig,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::acceptor::Acceptor;
use crate::config::ReplicaConfig;
use crate::message::{Envelope, Message, PrepareTarget, Request, Response};
use crate::state_machine::{KvStateMachine, StateMachine};
use crate::storage::{InMemoryPaxosStorage, PaxosStorage};
use crate::types::{LogIndex, PaxosError, PaxosState, Value};
use crate::voting::GenerationVoter;

/// Result of applying one committed entry.
pub type ApplyOutcome = Result<Value, String>;

type DynStorage = Box<dyn PaxosStorage>;

/// Retry jitter drawn from whatever [`RandomProvider`] the builder was given.
trait Jitter: Send + Sync {
    fn jittered(&self, base: Duration, jitter: Duration) -> Duration;
}

impl<R: RandomProvider> Jitter for R {
    fn jittered(&self, base: Duration, jitter: Duration) -> Duration {
        RandomProvider::jittered(self, base, jitter)
    }
}

struct Applier {
    state_machine: Box<dyn StateMachine>,
    next: LogIndex,
}

impl Applier {
    /// Apply every committed entry from `next` onward, stopping at the first
    /// gap.
    fn apply_ready(
        &mut self,
        acceptor: &Acceptor<DynStorage>,
    ) -> Result<Vec<(LogIndex, ApplyOutcome)>, PaxosError> {
        let mut applied = Vec::new();
        while let Some(command) = acceptor.committed_value(self.next)? {
            let outcome = self.state_machine.apply(self.next, &command);
            if let Err(reason) = &outcome {
                warn!(index = %self.next, reason = %reason, "state machine refused command");
            }
            applied.push((self.next, outcome));
            self.next = self.next.next();
        }
        Ok(applied)
    }
}

/// Shared state behind a [`Replica`] handle.
pub(crate) struct ReplicaInner<T: TimeProvider> {
    pub(crate) config: ReplicaConfig,
    pub(crate) time: T,
    random: Box<dyn Jitter>,
    network: Box<dyn Network<Envelope>>,
    requests: Arc<RequestWaitingList<CorrelationId, Response, T>>,
    next_correlation: AtomicU64,
    acceptor: Mutex<Acceptor<DynStorage>>,
    pub(crate) voter: Mutex<GenerationVoter<DynStorage>>,
    applier: Mutex<Applier>,
    applied: Arc<RequestWaitingList<LogIndex, ApplyOutcome, T>>,
    highest_seen: Mutex<GenerationId>,
    pub(crate) voting_seen: Mutex<GenerationId>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<T: TimeProvider> ReplicaInner<T> {
    // =========================================================================
    // Outbound
    // =========================================================================

    /// Send `request` to `to`, routing the outcome to `callback`.
    pub(crate) fn send_request(
        &self,
        to: ReplicaId,
        request: Request,
        callback: Arc<dyn RequestCallback<Response>>,
    ) {
        let correlation_id = CorrelationId(self.next_correlation.fetch_add(1, Ordering::Relaxed));
        if let Err(err) = self.requests.register(correlation_id, callback.clone()) {
            warn!(replica = %self.config.id, error = %err, "could not register request");
            callback.on_error(RequestError::Closed);
            return;
        }
        let envelope = Envelope {
            from: self.config.id,
            correlation_id,
            message: Message::Request(request),
        };
        if let Err(err) = self.network.send_one_way(to, envelope) {
            debug!(replica = %self.config.id, to = %to, error = %err, "send failed");
            self.requests.handle_error(
                &correlation_id,
                RequestError::Network {
                    replica: to,
                    reason: err.to_string(),
                },
            );
        }
    }

    /// Send `request` to every peer, this replica included.
    pub(crate) fn broadcast(&self, request: Request, callback: Arc<dyn RequestCallback<Response>>) {
        debug!(replica = %self.config.id, kind = request.kind(), "broadcasting");
        for peer in &self.config.peers {
            self.send_request(*peer, request.clone(), callback.clone());
        }
    }

    /// Broadcast `request` and wait for a quorum of responses satisfying
    /// `predicate`.
    pub(crate) async fn quorum_round(
        &self,
        request: Request,
        predicate: fn(&Response) -> bool,
    ) -> QuorumResult<Response> {
        let (callback, decision) = AsyncQuorumCallback::new(self.config.cluster_size(), predicate);
        self.broadcast(request, callback);
        decision.await
    }

    fn reply(&self, to: ReplicaId, correlation_id: CorrelationId, response: Response) {
        let envelope = Envelope {
            from: self.config.id,
            correlation_id,
            message: Message::Response(response),
        };
        if let Err(err) = self.network.send_one_way(to, envelope) {
            // The requester will time out.
            debug!(replica = %self.config.id, to = %to, error = %err, "reply not delivered");
        }
    }

    /// Sleep for the configured retry delay plus jitter.
    pub(crate) async fn backoff(&self) -> Result<(), PaxosError> {
        let delay = self
            .random
            .jittered(self.config.retry_base_delay, self.config.retry_jitter);
        self.time
            .sleep(delay)
            .await
            .map_err(|_| PaxosError::Shutdown)
    }

    // =========================================================================
    // Generations
    // =========================================================================

    /// A fresh generation above everything this replica has seen.
    pub(crate) fn next_generation(&self) -> GenerationId {
        let mut seen = self.highest_seen.lock();
        *seen = seen.next(self.config.id);
        *seen
    }

    /// Remember a generation used by someone else.
    pub(crate) fn observe(&self, generation: GenerationId) {
        let mut seen = self.highest_seen.lock();
        if generation > *seen {
            *seen = generation;
        }
    }

    // =========================================================================
    // Inbound
    // =========================================================================

    fn handle_envelope(self: &Arc<Self>, envelope: Envelope) {
        let Envelope {
            from,
            correlation_id,
            message,
        } = envelope;
        match message {
            Message::Response(response) => {
                self.requests.handle_response(&correlation_id, response, from);
            }
            Message::Request(request) => match self.handle_request(request) {
                Some(response) => self.reply(from, correlation_id, response),
                None => self.spawn_next_number(from, correlation_id),
            },
        }
    }

    /// Answer a request synchronously. `None` for requests that need a
    /// round of their own.
    fn handle_request(&self, request: Request) -> Option<Response> {
        let kind = request.kind();
        let result = match request {
            Request::Prepare { generation, target } => {
                self.observe(generation);
                let mut acceptor = self.acceptor.lock();
                match target {
                    PrepareTarget::Register(index) => acceptor.handle_prepare(generation, index),
                    PrepareTarget::FullLog { from } => {
                        acceptor.handle_full_log_prepare(generation, from)
                    }
                }
                .map(Response::Promise)
            }
            Request::Accept {
                generation,
                index,
                value,
            } => {
                self.observe(generation);
                self.acceptor
                    .lock()
                    .handle_accept(generation, index, value)
                    .map(|(accepted, promised_generation)| Response::Accepted {
                        accepted,
                        promised_generation,
                    })
            }
            Request::Commit {
                generation,
                index,
                value,
            } => self
                .commit_locally(generation, index, value)
                .map(|()| Response::CommitAck),
            Request::GenerationPrepare { candidate } => self
                .voter
                .lock()
                .handle_prepare(candidate)
                .map(|(promised, watermark)| Response::GenerationPromise {
                    promised,
                    watermark,
                }),
            Request::NextNumber => return None,
        };
        Some(result.unwrap_or_else(|err| {
            warn!(replica = %self.config.id, kind, error = %err, "request failed");
            Response::Failed {
                reason: err.to_string(),
            }
        }))
    }

    fn spawn_next_number(self: &Arc<Self>, from: ReplicaId, correlation_id: CorrelationId) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let response = match inner.next_number().await {
                Ok(number) => Response::NextNumber { number },
                Err(err) => Response::Failed {
                    reason: err.to_string(),
                },
            };
            inner.reply(from, correlation_id, response);
        });
    }

    // =========================================================================
    // Commit and apply
    // =========================================================================

    /// Settle `index` here and apply whatever became contiguous.
    pub(crate) fn commit_locally(
        &self,
        generation: GenerationId,
        index: LogIndex,
        value: Value,
    ) -> Result<(), PaxosError> {
        let outcomes = {
            let mut acceptor = self.acceptor.lock();
            if !acceptor.handle_commit(generation, index, value)? {
                return Ok(());
            }
            let mut applier = self.applier.lock();
            applier.apply_ready(&acceptor)?
        };
        for (applied, outcome) in outcomes {
            debug!(replica = %self.config.id, index = %applied, "applied");
            self.applied
                .handle_response(&applied, outcome, self.config.id);
        }
        Ok(())
    }

    /// Pick an unapplied index at or after `at_least` that no local client is
    /// waiting on, and register a waiter for it.
    pub(crate) fn reserve_index(
        &self,
        at_least: LogIndex,
    ) -> Result<(LogIndex, ResponseFuture<ApplyOutcome>), PaxosError> {
        let applier = self.applier.lock();
        let mut index = at_least.max(applier.next);
        while self.applied.is_pending(&index) {
            index = index.next();
        }
        let (callback, applied) = SingleResponseCallback::new();
        self.applied
            .register(index, callback)
            .map_err(|err| PaxosError::Apply(err.to_string()))?;
        Ok((index, applied))
    }

    /// Drop the waiter for an index this client no longer owns.
    pub(crate) fn release_index(&self, index: LogIndex) {
        self.applied.handle_error(&index, RequestError::Closed);
    }

    /// First index after everything this replica stored.
    pub(crate) fn next_free_index(&self) -> Result<LogIndex, PaxosError> {
        let highest = self.acceptor.lock().highest_index()?;
        Ok(highest.map_or(LogIndex::FIRST, |index| index.next().max(LogIndex::FIRST)))
    }

    /// Next index the state machine is waiting for.
    pub(crate) fn next_to_apply(&self) -> LogIndex {
        self.applier.lock().next
    }

    pub(crate) fn committed_value(&self, index: LogIndex) -> Result<Option<Value>, PaxosError> {
        self.acceptor.lock().committed_value(index)
    }
}

// =============================================================================
// Public handle
// =============================================================================

/// Builder for a [`Replica`].
///
/// Storage defaults to memory and the state machine to [`KvStateMachine`].
pub struct ReplicaBuilder<T: TimeProvider> {
    config: ReplicaConfig,
    time: T,
    storage: DynStorage,
    voter_storage: DynStorage,
    state_machine: Box<dyn StateMachine>,
    random: Box<dyn Jitter>,
}

impl<T: TimeProvider> ReplicaBuilder<T> {
    /// Storage for consensus state.
    pub fn storage(mut self, storage: impl PaxosStorage + 'static) -> Self {
        self.storage = Box::new(storage);
        self
    }

    /// Storage for the generation-voting watermark.
    pub fn voter_storage(mut self, storage: impl PaxosStorage + 'static) -> Self {
        self.voter_storage = Box::new(storage);
        self
    }

    /// State machine fed with the committed log.
    pub fn state_machine(mut self, state_machine: impl StateMachine + 'static) -> Self {
        self.state_machine = Box::new(state_machine);
        self
    }

    /// Source of retry jitter. Defaults to [`ThreadRandomProvider`].
    pub fn random(mut self, random: impl RandomProvider) -> Self {
        self.random = Box::new(random);
        self
    }

    /// Start the replica on the current tokio runtime.
    ///
    /// Committed entries found in storage are applied before this returns.
    pub fn start(
        self,
        network: impl Network<Envelope> + 'static,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
    ) -> Result<Replica<T>, PaxosError> {
        let id = self.config.id;
        let acceptor = Acceptor::new(self.storage);
        let highest_seen = acceptor.highest_promised()?;
        let voter = GenerationVoter::new(self.voter_storage);
        let watermark = voter.watermark()?;

        let mut applier = Applier {
            state_machine: self.state_machine,
            next: LogIndex::FIRST,
        };
        let replayed = applier.apply_ready(&acceptor)?;

        let apply_waits = WaitingListConfig {
            expiry_timeout: self.config.apply_wait_timeout,
            sweep_interval: self.config.waiting_list.sweep_interval,
        };
        let inner = Arc::new(ReplicaInner {
            requests: Arc::new(RequestWaitingList::new(
                self.time.clone(),
                self.config.waiting_list.clone(),
            )),
            applied: Arc::new(RequestWaitingList::new(self.time.clone(), apply_waits)),
            config: self.config,
            time: self.time,
            random: self.random,
            network: Box::new(network),
            next_correlation: AtomicU64::new(0),
            acceptor: Mutex::new(acceptor),
            voter: Mutex::new(voter),
            applier: Mutex::new(applier),
            highest_seen: Mutex::new(highest_seen),
            voting_seen: Mutex::new(watermark),
            tasks: Mutex::new(Vec::new()),
        });

        let weak: Weak<ReplicaInner<T>> = Arc::downgrade(&inner);
        let receiver = tokio::spawn(async move {
            while let Some(envelope) = inbound.recv().await {
                match weak.upgrade() {
                    Some(inner) => inner.handle_envelope(envelope),
                    None => break,
                }
            }
        });
        inner.tasks.lock().extend([
            receiver,
            inner.requests.spawn_sweeper(),
            inner.applied.spawn_sweeper(),
        ]);

        info!(
            replica = %id,
            peers = inner.config.cluster_size(),
            replayed = replayed.len(),
            highest_seen = %highest_seen,
            "replica started"
        );
        Ok(Replica { inner })
    }
}

/// A consensus replica.
///
/// Cheap to clone; clones share the node.
pub struct Replica<T: TimeProvider> {
    pub(crate) inner: Arc<ReplicaInner<T>>,
}

impl<T: TimeProvider> Clone for Replica<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: TimeProvider> Replica<T> {
    /// Start building a replica.
    pub fn builder(config: ReplicaConfig, time: T) -> ReplicaBuilder<T> {
        ReplicaBuilder {
            config,
            time,
            storage: Box::new(InMemoryPaxosStorage::new()),
            voter_storage: Box::new(InMemoryPaxosStorage::new()),
            state_machine: Box::new(KvStateMachine::new()),
            random: Box::new(ThreadRandomProvider::new()),
        }
    }

    /// This replica's id.
    pub fn id(&self) -> ReplicaId {
        self.inner.config.id
    }

    /// The configuration this replica runs with.
    pub fn config(&self) -> &ReplicaConfig {
        &self.inner.config
    }

    /// Allocate a cluster-unique generation, coordinating the vote here.
    pub async fn next_number(&self) -> Result<GenerationId, PaxosError> {
        self.inner.next_number().await
    }

    /// Ask `coordinator` to allocate a cluster-unique generation.
    pub async fn request_next_number(
        &self,
        coordinator: ReplicaId,
    ) -> Result<GenerationId, PaxosError> {
        let (callback, response) = SingleResponseCallback::new();
        self.inner
            .send_request(coordinator, Request::NextNumber, callback);
        match response.await {
            Ok((Response::NextNumber { number }, _)) => Ok(number),
            Ok((Response::Failed { reason }, from)) => Err(PaxosError::Remote {
                replica: from,
                reason,
            }),
            Ok((other, from)) => Err(PaxosError::Remote {
                replica: from,
                reason: format!("unexpected response {other:?}"),
            }),
            Err(RequestError::Timeout { .. }) => Err(PaxosError::Timeout),
            Err(RequestError::Closed) => Err(PaxosError::Shutdown),
            Err(err) => Err(PaxosError::Network(err.to_string())),
        }
    }

    /// State of one register on this replica.
    pub fn state(&self, index: LogIndex) -> Result<Option<PaxosState>, PaxosError> {
        self.inner.acceptor.lock().state(index)
    }

    /// Chosen value of one register, if this replica knows it.
    pub fn committed_value(&self, index: LogIndex) -> Result<Option<Value>, PaxosError> {
        self.inner.committed_value(index)
    }

    /// Highest index applied to the state machine.
    pub fn last_applied(&self) -> Option<LogIndex> {
        let next = self.inner.next_to_apply();
        (next > LogIndex::FIRST).then(|| LogIndex::new(next.0 - 1))
    }

    /// Requests to peers still waiting for an answer.
    pub fn pending_requests(&self) -> usize {
        self.inner.requests.pending_count()
    }

    /// Stop background tasks and fail everything still waiting.
    pub fn shutdown(&self) {
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
        let requests = self.inner.requests.fail_all(RequestError::Closed);
        let waiters = self.inner.applied.fail_all(RequestError::Closed);
        info!(replica = %self.id(), requests, waiters, "replica shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use distrib_core::TokioTimeProvider;
    use distrib_transport::{LocalNetwork, QuorumError};

    use crate::state_machine::KvOperation;

    fn set(key: &str, value: &str) -> Value {
        KvOperation::Set {
            key: key.into(),
            value: value.into(),
        }
        .encode()
        .expect("encode")
    }

    fn single_replica() -> Replica<TokioTimeProvider> {
        let network = LocalNetwork::new();
        let config = ReplicaConfig::new(ReplicaId(0), vec![ReplicaId(0)]);
        let (endpoint, inbound) = network.register(config.id);
        Replica::builder(config, TokioTimeProvider::new())
            .start(endpoint, inbound)
            .expect("start")
    }

    #[tokio::test]
    async fn test_commits_apply_in_index_order() {
        let replica = single_replica();
        let inner = &replica.inner;
        let generation = inner.next_generation();

        let (index, waiter) = inner.reserve_index(LogIndex::new(2)).expect("reserve");
        assert_eq!(index, LogIndex::new(2));

        // Index 2 cannot apply before index 1.
        inner
            .commit_locally(generation, LogIndex::new(2), set("b", "2"))
            .expect("commit");
        assert_eq!(replica.last_applied(), None);

        inner
            .commit_locally(generation, LogIndex::new(1), set("a", "1"))
            .expect("commit");
        assert_eq!(replica.last_applied(), Some(LogIndex::new(2)));

        let (outcome, from) = waiter.await.expect("applied");
        assert_eq!(outcome, Ok(b"2".to_vec()));
        assert_eq!(from, ReplicaId(0));
        replica.shutdown();
    }

    #[tokio::test]
    async fn test_reserve_skips_pending_and_applied() {
        let replica = single_replica();
        let inner = &replica.inner;
        inner
            .commit_locally(inner.next_generation(), LogIndex::FIRST, set("a", "1"))
            .expect("commit");

        let (first, _w1) = inner.reserve_index(LogIndex::FIRST).expect("reserve");
        let (second, _w2) = inner.reserve_index(LogIndex::FIRST).expect("reserve");
        assert_eq!(first, LogIndex::new(2));
        assert_eq!(second, LogIndex::new(3));

        inner.release_index(first);
        let (again, _w3) = inner.reserve_index(LogIndex::FIRST).expect("reserve");
        assert_eq!(again, LogIndex::new(2));
        replica.shutdown();
    }

    #[tokio::test]
    async fn test_next_generation_is_strictly_increasing() {
        let replica = single_replica();
        let inner = &replica.inner;
        let first = inner.next_generation();
        inner.observe(GenerationId::new(40, ReplicaId(3)));
        let second = inner.next_generation();
        assert!(second > first);
        assert_eq!(second, GenerationId::new(41, ReplicaId(0)));
        replica.shutdown();
    }

    /// Always draws the low end of the range and counts the draws.
    #[derive(Clone, Default)]
    struct LowestRandom {
        draws: Arc<AtomicU64>,
    }

    impl RandomProvider for LowestRandom {
        fn random_range<R>(&self, range: std::ops::Range<R>) -> R
        where
            R: rand::distr::uniform::SampleUniform + PartialOrd,
        {
            self.draws.fetch_add(1, Ordering::SeqCst);
            range.start
        }
    }

    #[tokio::test]
    async fn test_backoff_draws_from_configured_random() {
        let network = LocalNetwork::new();
        let config = ReplicaConfig::new(ReplicaId(0), vec![ReplicaId(0)])
            .with_retry_delay(Duration::from_millis(1), Duration::from_secs(10));
        let (endpoint, inbound) = network.register(config.id);
        let random = LowestRandom::default();
        let replica = Replica::builder(config, TokioTimeProvider::new())
            .random(random.clone())
            .start(endpoint, inbound)
            .expect("start");

        // Ten seconds of jitter, but the provider always picks zero.
        tokio::time::timeout(Duration::from_secs(1), replica.inner.backoff())
            .await
            .expect("no jitter added")
            .expect("backoff");
        assert_eq!(random.draws.load(Ordering::SeqCst), 1);
        replica.shutdown();
    }

    #[tokio::test]
    async fn test_failed_send_reports_immediately() {
        let network = LocalNetwork::new();
        let configs = ReplicaConfig::local_cluster(3);
        let (endpoint, inbound) = network.register(configs[0].id);
        // Replicas 1 and 2 never registered: sends fail with UnknownReplica.
        let replica = Replica::builder(configs[0].clone(), TokioTimeProvider::new())
            .start(endpoint, inbound)
            .expect("start");

        let result = replica
            .inner
            .quorum_round(
                Request::GenerationPrepare {
                    candidate: GenerationId::new(1, ReplicaId(0)),
                },
                Response::is_generation_promised,
            )
            .await;
        // Decided by the two failed sends, without waiting on replica 0.
        match result {
            Err(QuorumError::Unreachable { errors, .. }) => assert_eq!(errors.len(), 2),
            other => panic!("expected unreachable quorum, got {other:?}"),
        }
        replica.shutdown();
    }
}
