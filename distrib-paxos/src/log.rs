//! Replicated log: one Paxos register per index.
//!
//! Two ways of filling the log:
//!
//! | Mode | Per append | Conflicts |
//! |---|---|---|
//! | [`LogMode::PerIndex`] | prepare + accept + commit | losing an index moves to the next one |
//! | [`LogMode::LeaderBased`] | accept + commit | a higher generation forces a new election |
//!
//! ## Leader election
//!
//! [`PaxosLog::elect`] runs one full-log prepare. The quorum reports every
//! index from the first unapplied one that holds a value. Per index the
//! committed value wins, otherwise the value with the highest accepted
//! generation. The new leader re-proposes and commits each of them, fills the
//! holes between them with no-op entries, and caches its generation. Later
//! appends skip phase 1 until an accept is rejected.
//!
//! ## Waiting for apply
//!
//! An append returns once the entry has been applied by this replica's state
//! machine, with the state machine's result. The index is reserved and its
//! waiter registered in one step, so the entry can never be applied before
//! anyone listens.

use std::collections::BTreeMap;

use distrib_core::{GenerationId, TimeProvider};
use distrib_transport::{RequestError, ResponseFuture};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::message::{PrepareTarget, Promise};
use crate::replica::{ApplyOutcome, Replica};
use crate::types::{LogIndex, PaxosError, Value};

/// How a [`PaxosLog`] runs consensus for each append.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogMode {
    /// Every append runs all three phases on its own index.
    PerIndex,
    /// An elected leader skips phase 1.
    LeaderBased,
}

/// Result of a successful append.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendOutcome {
    /// Where the entry landed.
    pub index: LogIndex,
    /// What the state machine returned for it.
    pub result: Value,
}

/// Per index: the committed value, or else the highest-generation accepted
/// one.
fn merge_reported(promises: &[Promise]) -> BTreeMap<LogIndex, Value> {
    let mut best: BTreeMap<LogIndex, (bool, GenerationId, Value)> = BTreeMap::new();
    for promise in promises {
        for (index, state) in &promise.uncommitted {
            let candidate = match (&state.committed_value, state.accepted()) {
                (Some(value), _) => (
                    true,
                    state.committed_generation.unwrap_or_default(),
                    value.clone(),
                ),
                (None, Some((generation, value))) => (false, generation, value.clone()),
                (None, None) => continue,
            };
            let better = best
                .get(index)
                .map_or(true, |current| (candidate.0, candidate.1) > (current.0, current.1));
            if better {
                best.insert(*index, candidate);
            }
        }
    }
    best.into_iter()
        .map(|(index, (_, _, value))| (index, value))
        .collect()
}

async fn await_applied(waiter: ResponseFuture<ApplyOutcome>) -> Result<Value, PaxosError> {
    match waiter.await {
        Ok((outcome, _)) => outcome.map_err(PaxosError::Apply),
        Err(RequestError::Timeout { .. }) => Err(PaxosError::Timeout),
        Err(_) => Err(PaxosError::Shutdown),
    }
}

/// Client side of the replicated log on one replica.
pub struct PaxosLog<T: TimeProvider> {
    replica: Replica<T>,
    mode: LogMode,
    leader: Mutex<Option<GenerationId>>,
}

impl<T: TimeProvider> PaxosLog<T> {
    /// Append through `replica` in the given mode.
    pub fn new(replica: Replica<T>, mode: LogMode) -> Self {
        Self {
            replica,
            mode,
            leader: Mutex::new(None),
        }
    }

    /// The replica appending on behalf of this log.
    pub fn replica(&self) -> &Replica<T> {
        &self.replica
    }

    /// The mode this log runs in.
    pub fn mode(&self) -> LogMode {
        self.mode
    }

    /// The cached leader generation, if this replica believes it leads.
    pub fn leader_generation(&self) -> Option<GenerationId> {
        *self.leader.lock()
    }

    /// Append `command` and wait until it is applied here.
    pub async fn append(&self, command: Value) -> Result<AppendOutcome, PaxosError> {
        match self.mode {
            LogMode::PerIndex => self.append_per_index(command).await,
            LogMode::LeaderBased => self.append_as_leader(command).await,
        }
    }

    /// Append a no-op and wait for it.
    ///
    /// Once this returns, the state machine reflects every entry committed
    /// before the call.
    pub async fn barrier(&self) -> Result<LogIndex, PaxosError> {
        Ok(self.append(Value::new()).await?.index)
    }

    async fn append_per_index(&self, command: Value) -> Result<AppendOutcome, PaxosError> {
        let inner = &self.replica.inner;
        let mut at_least = LogIndex::FIRST;
        loop {
            let (index, waiter) = inner.reserve_index(at_least)?;
            match inner.propose(index, Some(command.clone())).await {
                Ok(Some(chosen)) if chosen.value == command => {
                    let result = await_applied(waiter).await?;
                    return Ok(AppendOutcome { index, result });
                }
                Ok(_) => {
                    debug!(replica = %inner.config.id, index = %index, "index taken, moving on");
                    inner.release_index(index);
                    at_least = index.next();
                }
                Err(err) => {
                    inner.release_index(index);
                    return Err(err);
                }
            }
        }
    }

    async fn append_as_leader(&self, command: Value) -> Result<AppendOutcome, PaxosError> {
        let inner = &self.replica.inner;
        let attempts = inner.config.max_attempts;
        for attempt in 1..=attempts {
            let cached = *self.leader.lock();
            let generation = match cached {
                Some(generation) => generation,
                None => self.elect().await?,
            };

            let (index, waiter) = inner.reserve_index(inner.next_free_index()?)?;
            match inner.accept(generation, index, command.clone()).await {
                Ok(()) => {
                    inner.commit(generation, index, command);
                    let result = await_applied(waiter).await?;
                    return Ok(AppendOutcome { index, result });
                }
                Err(PaxosError::StaleGeneration { seen, .. }) => {
                    inner.release_index(index);
                    self.step_down(generation);
                    warn!(
                        replica = %inner.config.id,
                        generation = %generation,
                        seen = %seen,
                        attempt,
                        "leadership lost, re-electing"
                    );
                    inner.backoff().await?;
                }
                Err(err) => {
                    inner.release_index(index);
                    self.step_down(generation);
                    return Err(err);
                }
            }
        }
        Err(PaxosError::RetriesExhausted { attempts })
    }

    fn step_down(&self, generation: GenerationId) {
        let mut leader = self.leader.lock();
        if *leader == Some(generation) {
            *leader = None;
        }
    }

    /// Become leader: promise the whole log at a fresh generation and settle
    /// everything other proposers left behind.
    pub async fn elect(&self) -> Result<GenerationId, PaxosError> {
        let inner = &self.replica.inner;
        let attempts = inner.config.max_attempts;
        for attempt in 1..=attempts {
            match self.try_elect().await {
                Err(PaxosError::StaleGeneration { attempted, seen }) => {
                    warn!(
                        replica = %inner.config.id,
                        attempted = %attempted,
                        seen = %seen,
                        attempt,
                        "election preempted, retrying"
                    );
                    inner.backoff().await?;
                }
                other => return other,
            }
        }
        Err(PaxosError::RetriesExhausted { attempts })
    }

    async fn try_elect(&self) -> Result<GenerationId, PaxosError> {
        let inner = &self.replica.inner;
        let generation = inner.next_generation();
        let from = inner.next_to_apply();
        let promises = inner
            .prepare(generation, PrepareTarget::FullLog { from })
            .await?;

        let reported = merge_reported(&promises);
        if let Some(last) = reported.keys().next_back().copied() {
            let mut index = from;
            while index <= last {
                // Nothing was accepted here anywhere in the quorum.
                let value = reported.get(&index).cloned().unwrap_or_default();
                inner.accept(generation, index, value.clone()).await?;
                inner.commit(generation, index, value);
                index = index.next();
            }
        }

        *self.leader.lock() = Some(generation);
        info!(
            replica = %inner.config.id,
            generation = %generation,
            recovered = reported.len(),
            "elected leader"
        );
        Ok(generation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PaxosState;
    use distrib_core::ReplicaId;

    fn generation(counter: u64) -> GenerationId {
        GenerationId::new(counter, ReplicaId(0))
    }

    fn report(entries: Vec<(u64, PaxosState)>) -> Promise {
        Promise {
            promised: true,
            promised_generation: generation(20),
            accepted_generation: None,
            accepted_value: None,
            committed_value: None,
            uncommitted: entries
                .into_iter()
                .map(|(index, state)| (LogIndex::new(index), state))
                .collect(),
        }
    }

    fn accepted(counter: u64, value: &[u8]) -> PaxosState {
        PaxosState {
            promised_generation: generation(counter),
            accepted_generation: Some(generation(counter)),
            accepted_value: Some(value.to_vec()),
            ..PaxosState::default()
        }
    }

    fn committed(counter: u64, value: &[u8]) -> PaxosState {
        PaxosState {
            committed_generation: Some(generation(counter)),
            committed_value: Some(value.to_vec()),
            ..accepted(counter, value)
        }
    }

    #[test]
    fn test_merge_prefers_highest_generation() {
        let merged = merge_reported(&[
            report(vec![(1, accepted(2, b"a-old")), (2, accepted(3, b"b"))]),
            report(vec![(1, accepted(4, b"a-new"))]),
        ]);
        assert_eq!(merged[&LogIndex::new(1)], b"a-new".to_vec());
        assert_eq!(merged[&LogIndex::new(2)], b"b".to_vec());
    }

    #[test]
    fn test_merge_prefers_committed_value() {
        let merged = merge_reported(&[
            report(vec![(5, committed(1, b"chosen"))]),
            report(vec![(5, accepted(9, b"later"))]),
        ]);
        assert_eq!(merged[&LogIndex::new(5)], b"chosen".to_vec());
    }
}
