//! Proposer: drives prepare, accept and commit rounds for one register.
//!
//! ```text
//! run_round(index, proposal)
//!   generation = next(highest seen, self)
//!   Prepare ──quorum(promised)──▶ promises
//!     ├─ someone knows the chosen value ──▶ commit it, done
//!     ├─ someone accepted a value       ──▶ re-propose the highest-generation one
//!     └─ nothing accepted               ──▶ propose ours (or report nothing, for reads)
//!   Accept ──quorum(accepted)──▶ chosen
//!   Commit ──best effort──▶ every replica
//! ```
//!
//! A rejection carrying a higher generation is recoverable: the round is
//! retried with a fresh generation after a randomized delay, up to
//! `max_attempts`. Failures without such a rejection abort the operation.

use std::sync::Arc;

use distrib_core::{GenerationId, ReplicaId, TimeProvider};
use distrib_transport::{QuorumError, RequestCallback, RequestError};
use tracing::{debug, warn};

use crate::message::{PrepareTarget, Promise, Request, Response};
use crate::replica::ReplicaInner;
use crate::types::{LogIndex, PaxosError, Value};

/// A value settled at an index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chosen {
    /// Register the value was chosen for.
    pub index: LogIndex,
    /// Generation of the round that settled it here.
    pub generation: GenerationId,
    /// The chosen value.
    pub value: Value,
}

/// Highest generation reported by a rejection at or above `attempted`.
pub(crate) fn highest_rejection(
    attempted: GenerationId,
    rejected: &[(ReplicaId, Response)],
) -> Option<GenerationId> {
    rejected
        .iter()
        .filter_map(|(_, response)| response.seen_generation())
        .filter(|seen| *seen >= attempted)
        .max()
}

/// Value with the highest accepted generation among `promises`.
fn highest_accepted(promises: &[Promise]) -> Option<Value> {
    promises
        .iter()
        .filter_map(|promise| {
            Some((
                promise.accepted_generation?,
                promise.accepted_value.as_ref()?,
            ))
        })
        .max_by_key(|(generation, _)| *generation)
        .map(|(_, value)| value.clone())
}

/// Logs the outcome of best-effort commits.
struct CommitLogger {
    index: LogIndex,
}

impl RequestCallback<Response> for CommitLogger {
    fn on_response(&self, response: Response, from: ReplicaId) {
        if let Response::Failed { reason } = response {
            warn!(index = %self.index, from = %from, reason = %reason, "commit failed on peer");
        }
    }

    fn on_error(&self, error: RequestError) {
        debug!(index = %self.index, error = %error, "commit not acknowledged");
    }
}

impl<T: TimeProvider> ReplicaInner<T> {
    fn round_failure(&self, attempted: GenerationId, error: QuorumError<Response>) -> PaxosError {
        match error {
            QuorumError::Unreachable { rejected, errors } => {
                match highest_rejection(attempted, &rejected) {
                    Some(seen) => {
                        self.observe(seen);
                        PaxosError::StaleGeneration { attempted, seen }
                    }
                    None => PaxosError::QuorumUnreachable {
                        rejections: rejected.len(),
                        errors: errors.len(),
                    },
                }
            }
            QuorumError::Timeout => PaxosError::Timeout,
            QuorumError::Abandoned => PaxosError::Shutdown,
        }
    }

    /// Phase 1. Returns the quorum's promises.
    pub(crate) async fn prepare(
        &self,
        generation: GenerationId,
        target: PrepareTarget,
    ) -> Result<Vec<Promise>, PaxosError> {
        let responses = self
            .quorum_round(Request::Prepare { generation, target }, Response::is_promised)
            .await
            .map_err(|err| self.round_failure(generation, err))?;
        Ok(responses
            .into_iter()
            .filter_map(|(_, response)| match response {
                Response::Promise(promise) => Some(promise),
                _ => None,
            })
            .collect())
    }

    /// Phase 2. Succeeds once a quorum accepted `value`.
    pub(crate) async fn accept(
        &self,
        generation: GenerationId,
        index: LogIndex,
        value: Value,
    ) -> Result<(), PaxosError> {
        self.quorum_round(
            Request::Accept {
                generation,
                index,
                value,
            },
            Response::is_accepted,
        )
        .await
        .map(|_| ())
        .map_err(|err| self.round_failure(generation, err))
    }

    /// Phase 3. Settles the value here, then tells every peer without
    /// waiting.
    pub(crate) fn commit(&self, generation: GenerationId, index: LogIndex, value: Value) {
        if let Err(err) = self.commit_locally(generation, index, value.clone()) {
            warn!(replica = %self.config.id, index = %index, error = %err, "local commit failed");
        }
        let callback: Arc<dyn RequestCallback<Response>> = Arc::new(CommitLogger { index });
        let request = Request::Commit {
            generation,
            index,
            value,
        };
        for peer in self.config.peers.iter().filter(|peer| **peer != self.config.id) {
            self.send_request(*peer, request.clone(), callback.clone());
        }
    }

    /// One full round for `index`. `None` only when reading a register
    /// nobody wrote.
    pub(crate) async fn run_round(
        &self,
        index: LogIndex,
        proposal: Option<Value>,
    ) -> Result<Option<Chosen>, PaxosError> {
        let generation = self.next_generation();
        let promises = self
            .prepare(generation, PrepareTarget::Register(index))
            .await?;

        if let Some(value) = promises
            .iter()
            .find_map(|promise| promise.committed_value.clone())
        {
            debug!(replica = %self.config.id, index = %index, "register already settled");
            self.commit(generation, index, value.clone());
            return Ok(Some(Chosen {
                index,
                generation,
                value,
            }));
        }

        let value = match highest_accepted(&promises) {
            Some(value) => {
                debug!(replica = %self.config.id, index = %index, "re-proposing accepted value");
                value
            }
            None => match proposal {
                Some(value) => value,
                None => return Ok(None),
            },
        };

        self.accept(generation, index, value.clone()).await?;
        self.commit(generation, index, value.clone());
        Ok(Some(Chosen {
            index,
            generation,
            value,
        }))
    }

    /// [`run_round`](Self::run_round) retried while competing proposers
    /// preempt it.
    pub(crate) async fn propose(
        &self,
        index: LogIndex,
        proposal: Option<Value>,
    ) -> Result<Option<Chosen>, PaxosError> {
        let attempts = self.config.max_attempts;
        for attempt in 1..=attempts {
            match self.run_round(index, proposal.clone()).await {
                Err(PaxosError::StaleGeneration { attempted, seen }) => {
                    warn!(
                        replica = %self.config.id,
                        index = %index,
                        attempted = %attempted,
                        seen = %seen,
                        attempt,
                        "proposal preempted, retrying with a higher generation"
                    );
                    self.backoff().await?;
                }
                other => return other,
            }
        }
        Err(PaxosError::RetriesExhausted { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn generation(counter: u64) -> GenerationId {
        GenerationId::new(counter, ReplicaId(0))
    }

    fn promise(accepted: Option<(u64, &[u8])>) -> Promise {
        Promise {
            promised: true,
            promised_generation: generation(10),
            accepted_generation: accepted.map(|(counter, _)| generation(counter)),
            accepted_value: accepted.map(|(_, value)| value.to_vec()),
            committed_value: None,
            uncommitted: BTreeMap::new(),
        }
    }

    #[test]
    fn test_highest_accepted_generation_wins() {
        let promises = vec![
            promise(Some((2, b"old"))),
            promise(None),
            promise(Some((5, b"newer"))),
        ];
        assert_eq!(highest_accepted(&promises), Some(b"newer".to_vec()));
        assert_eq!(highest_accepted(&[promise(None)]), None);
    }

    #[test]
    fn test_highest_rejection_ignores_lower_generations() {
        let rejected = vec![
            (
                ReplicaId(1),
                Response::Accepted {
                    accepted: false,
                    promised_generation: generation(7),
                },
            ),
            (
                ReplicaId(2),
                Response::Failed {
                    reason: "disk".into(),
                },
            ),
        ];
        assert_eq!(highest_rejection(generation(3), &rejected), Some(generation(7)));
        assert_eq!(highest_rejection(generation(8), &rejected), None);
    }
}
