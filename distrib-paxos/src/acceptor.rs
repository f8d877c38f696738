//! Acceptor: the replica-side half of the protocol.
//!
//! An acceptor answers three kinds of messages, per register:
//!
//! 1. **Prepare**: promise iff the generation is strictly above everything
//!    promised so far (the register's own promise and the full-log floor).
//!    The reply carries any value accepted earlier, so the proposer can
//!    re-propose it.
//! 2. **Accept**: store the value iff the generation is at least the promise.
//! 3. **Commit**: record the chosen value. Unconditional, and a second commit
//!    for a settled register is ignored.
//!
//! A **full-log prepare** promises for every index at once. It must beat the
//! floor and the promise of every unsettled register, then raises the floor
//! and reports every index from the requested start that holds a value.
//!
//! ## Key Invariant
//!
//! An acceptor never accepts below a generation it promised. Rejections report
//! the generation held so the proposer can jump past it.
//!
//! ```text
//! Acceptor {
//!     floor: GenerationId,                // full-log promise
//!     slots: Map<LogIndex, PaxosState>,   // per-register promise/accept/commit
//! }
//! ```

use std::collections::BTreeMap;

use distrib_core::GenerationId;
use tracing::{debug, warn};

use crate::message::Promise;
use crate::storage::PaxosStorage;
use crate::types::{LogIndex, PaxosError, PaxosState, Value};

/// The acceptor's state, wrapping a [`PaxosStorage`] backend.
pub struct Acceptor<S: PaxosStorage> {
    storage: S,
}

impl<S: PaxosStorage> Acceptor<S> {
    /// Create an acceptor over `storage`.
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Handle a prepare for one register.
    pub fn handle_prepare(
        &mut self,
        generation: GenerationId,
        index: LogIndex,
    ) -> Result<Promise, PaxosError> {
        let floor = self.storage.load_floor()?;
        let mut state = self.storage.load_slot(index)?.unwrap_or_default();
        let held = state.promised_generation.max(floor);

        let promised = generation > held;
        if promised {
            state.promised_generation = generation;
            self.storage.store_slot(index, state.clone())?;
            debug!(index = %index, generation = %generation, "promised");
        } else {
            debug!(
                index = %index,
                generation = %generation,
                held = %held,
                "rejecting stale prepare"
            );
        }

        Ok(Promise {
            promised,
            promised_generation: if promised { generation } else { held },
            accepted_generation: state.accepted_generation,
            accepted_value: state.accepted_value,
            committed_value: state.committed_value,
            uncommitted: BTreeMap::new(),
        })
    }

    /// Handle a prepare covering the whole log.
    pub fn handle_full_log_prepare(
        &mut self,
        generation: GenerationId,
        from: LogIndex,
    ) -> Result<Promise, PaxosError> {
        let floor = self.storage.load_floor()?;
        let slots = self.storage.load_slots_from(LogIndex::REGISTER)?;
        let held = slots
            .values()
            .filter(|state| !state.is_committed())
            .map(|state| state.promised_generation)
            .fold(floor, GenerationId::max);

        if generation <= held {
            debug!(generation = %generation, held = %held, "rejecting stale full-log prepare");
            return Ok(Promise {
                promised: false,
                promised_generation: held,
                accepted_generation: None,
                accepted_value: None,
                committed_value: None,
                uncommitted: BTreeMap::new(),
            });
        }

        self.storage.store_floor(generation)?;
        let uncommitted: BTreeMap<LogIndex, PaxosState> = slots
            .into_iter()
            .filter(|(index, state)| *index >= from && state.accepted().is_some())
            .collect();
        debug!(
            generation = %generation,
            from = %from,
            reported = uncommitted.len(),
            "promised full log"
        );
        Ok(Promise {
            promised: true,
            promised_generation: generation,
            accepted_generation: None,
            accepted_value: None,
            committed_value: None,
            uncommitted,
        })
    }

    /// Handle an accept. Returns whether the value was accepted and the
    /// generation now held for the register.
    pub fn handle_accept(
        &mut self,
        generation: GenerationId,
        index: LogIndex,
        value: Value,
    ) -> Result<(bool, GenerationId), PaxosError> {
        let floor = self.storage.load_floor()?;
        let mut state = self.storage.load_slot(index)?.unwrap_or_default();
        let held = state.promised_generation.max(floor);

        if generation < held {
            warn!(
                index = %index,
                generation = %generation,
                held = %held,
                "rejecting stale accept"
            );
            return Ok((false, held));
        }

        state.promised_generation = generation;
        state.accepted_generation = Some(generation);
        state.accepted_value = Some(value);
        self.storage.store_slot(index, state)?;
        debug!(index = %index, generation = %generation, "accepted");
        Ok((true, generation))
    }

    /// Handle a commit. Returns `true` when the register was newly settled.
    pub fn handle_commit(
        &mut self,
        generation: GenerationId,
        index: LogIndex,
        value: Value,
    ) -> Result<bool, PaxosError> {
        let mut state = self.storage.load_slot(index)?.unwrap_or_default();
        if state.is_committed() {
            debug!(index = %index, "ignoring repeated commit");
            return Ok(false);
        }

        state.promised_generation = state.promised_generation.max(generation);
        state.accepted_generation = Some(generation);
        state.accepted_value = Some(value.clone());
        state.committed_generation = Some(generation);
        state.committed_value = Some(value);
        self.storage.store_slot(index, state)?;
        debug!(index = %index, generation = %generation, "committed");
        Ok(true)
    }

    /// State of one register, if any was stored.
    pub fn state(&self, index: LogIndex) -> Result<Option<PaxosState>, PaxosError> {
        self.storage.load_slot(index)
    }

    /// Chosen value of one register, if known here.
    pub fn committed_value(&self, index: LogIndex) -> Result<Option<Value>, PaxosError> {
        Ok(self
            .storage
            .load_slot(index)?
            .and_then(|state| state.committed_value))
    }

    /// Highest index with stored state.
    pub fn highest_index(&self) -> Result<Option<LogIndex>, PaxosError> {
        self.storage.highest_index()
    }

    /// Highest generation this acceptor has promised anywhere.
    pub fn highest_promised(&self) -> Result<GenerationId, PaxosError> {
        let floor = self.storage.load_floor()?;
        Ok(self
            .storage
            .load_slots_from(LogIndex::REGISTER)?
            .values()
            .map(|state| state.promised_generation)
            .fold(floor, GenerationId::max))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryPaxosStorage;
    use distrib_core::ReplicaId;

    fn make_acceptor() -> Acceptor<InMemoryPaxosStorage> {
        Acceptor::new(InMemoryPaxosStorage::new())
    }

    fn generation(counter: u64) -> GenerationId {
        GenerationId::new(counter, ReplicaId(1))
    }

    // =========================================================================
    // Prepare tests
    // =========================================================================

    #[test]
    fn test_first_prepare_promises() {
        let mut acceptor = make_acceptor();

        let promise = acceptor
            .handle_prepare(generation(1), LogIndex::REGISTER)
            .expect("prepare");

        assert!(promise.promised);
        assert_eq!(promise.promised_generation, generation(1));
        assert!(promise.accepted_generation.is_none());
        assert!(promise.accepted_value.is_none());
    }

    #[test]
    fn test_prepare_returns_prior_accept() {
        let mut acceptor = make_acceptor();
        acceptor
            .handle_accept(generation(1), LogIndex::REGISTER, b"hello".to_vec())
            .expect("accept");

        let promise = acceptor
            .handle_prepare(generation(2), LogIndex::REGISTER)
            .expect("prepare");

        assert!(promise.promised);
        assert_eq!(promise.accepted_generation, Some(generation(1)));
        assert_eq!(promise.accepted_value, Some(b"hello".to_vec()));
    }

    #[test]
    fn test_equal_generation_prepare_rejected() {
        let mut acceptor = make_acceptor();
        acceptor
            .handle_prepare(generation(5), LogIndex::REGISTER)
            .expect("prepare");

        // Strictly greater is required.
        let promise = acceptor
            .handle_prepare(generation(5), LogIndex::REGISTER)
            .expect("prepare");
        assert!(!promise.promised);
        assert_eq!(promise.promised_generation, generation(5));

        let promise = acceptor
            .handle_prepare(generation(3), LogIndex::REGISTER)
            .expect("prepare");
        assert!(!promise.promised);
    }

    #[test]
    fn test_owner_breaks_prepare_tie() {
        let mut acceptor = make_acceptor();
        acceptor
            .handle_prepare(GenerationId::new(4, ReplicaId(1)), LogIndex::REGISTER)
            .expect("prepare");

        let promise = acceptor
            .handle_prepare(GenerationId::new(4, ReplicaId(2)), LogIndex::REGISTER)
            .expect("prepare");
        assert!(promise.promised);
    }

    #[test]
    fn test_registers_are_independent() {
        let mut acceptor = make_acceptor();
        acceptor
            .handle_prepare(generation(9), LogIndex::new(1))
            .expect("prepare");

        let promise = acceptor
            .handle_prepare(generation(2), LogIndex::new(2))
            .expect("prepare");
        assert!(promise.promised);
    }

    // =========================================================================
    // Accept tests
    // =========================================================================

    #[test]
    fn test_accept_at_promised_generation() {
        let mut acceptor = make_acceptor();
        acceptor
            .handle_prepare(generation(1), LogIndex::FIRST)
            .expect("prepare");

        let (accepted, held) = acceptor
            .handle_accept(generation(1), LogIndex::FIRST, b"command-1".to_vec())
            .expect("accept");
        assert!(accepted);
        assert_eq!(held, generation(1));

        let state = acceptor
            .state(LogIndex::FIRST)
            .expect("load")
            .expect("should exist");
        assert_eq!(state.accepted_value, Some(b"command-1".to_vec()));
        assert_eq!(state.accepted_generation, Some(generation(1)));
    }

    #[test]
    fn test_stale_accept_rejected() {
        let mut acceptor = make_acceptor();
        acceptor
            .handle_prepare(generation(5), LogIndex::FIRST)
            .expect("prepare");

        let (accepted, held) = acceptor
            .handle_accept(generation(3), LogIndex::FIRST, b"stale".to_vec())
            .expect("accept");
        assert!(!accepted, "stale generation should be rejected");
        assert_eq!(held, generation(5));
        assert!(acceptor
            .state(LogIndex::FIRST)
            .expect("load")
            .and_then(|state| state.accepted_value)
            .is_none());
    }

    #[test]
    fn test_higher_accept_overwrites() {
        let mut acceptor = make_acceptor();
        acceptor
            .handle_accept(generation(1), LogIndex::FIRST, b"first".to_vec())
            .expect("accept");
        acceptor
            .handle_accept(generation(2), LogIndex::FIRST, b"second".to_vec())
            .expect("accept");

        let state = acceptor
            .state(LogIndex::FIRST)
            .expect("load")
            .expect("should exist");
        assert_eq!(state.accepted_value, Some(b"second".to_vec()));
        assert!(state.accepted_generation <= Some(state.promised_generation));
    }

    // =========================================================================
    // Commit tests
    // =========================================================================

    #[test]
    fn test_commit_is_final() {
        let mut acceptor = make_acceptor();

        assert!(acceptor
            .handle_commit(generation(2), LogIndex::FIRST, b"chosen".to_vec())
            .expect("commit"));
        assert!(!acceptor
            .handle_commit(generation(7), LogIndex::FIRST, b"other".to_vec())
            .expect("commit"));

        assert_eq!(
            acceptor.committed_value(LogIndex::FIRST).expect("load"),
            Some(b"chosen".to_vec())
        );
    }

    #[test]
    fn test_commit_applies_without_promise() {
        let mut acceptor = make_acceptor();
        acceptor
            .handle_prepare(generation(9), LogIndex::FIRST)
            .expect("prepare");

        // A commit from a lower generation still settles the register.
        assert!(acceptor
            .handle_commit(generation(3), LogIndex::FIRST, b"v".to_vec())
            .expect("commit"));
        let state = acceptor
            .state(LogIndex::FIRST)
            .expect("load")
            .expect("should exist");
        assert_eq!(state.promised_generation, generation(9));
        assert_eq!(state.committed_generation, Some(generation(3)));
    }

    // =========================================================================
    // Full-log prepare tests
    // =========================================================================

    #[test]
    fn test_full_log_prepare_reports_values_from_start() {
        let mut acceptor = make_acceptor();
        acceptor
            .handle_commit(generation(1), LogIndex::new(1), b"a".to_vec())
            .expect("commit");
        acceptor
            .handle_accept(generation(1), LogIndex::new(2), b"b".to_vec())
            .expect("accept");
        acceptor
            .handle_prepare(generation(1), LogIndex::new(3))
            .expect("prepare");

        let promise = acceptor
            .handle_full_log_prepare(generation(2), LogIndex::new(2))
            .expect("prepare");
        assert!(promise.promised);
        // Index 1 is before the start, index 3 holds no value.
        let reported: Vec<LogIndex> = promise.uncommitted.keys().copied().collect();
        assert_eq!(reported, vec![LogIndex::new(2)]);
        assert_eq!(
            promise.uncommitted[&LogIndex::new(2)].accepted_value,
            Some(b"b".to_vec())
        );
    }

    #[test]
    fn test_full_log_prepare_must_beat_open_registers() {
        let mut acceptor = make_acceptor();
        acceptor
            .handle_prepare(generation(6), LogIndex::new(4))
            .expect("prepare");

        let promise = acceptor
            .handle_full_log_prepare(generation(5), LogIndex::FIRST)
            .expect("prepare");
        assert!(!promise.promised);
        assert_eq!(promise.promised_generation, generation(6));
    }

    #[test]
    fn test_floor_blocks_lower_generations_everywhere() {
        let mut acceptor = make_acceptor();
        acceptor
            .handle_full_log_prepare(generation(5), LogIndex::FIRST)
            .expect("prepare");

        // Never-touched indices are covered by the floor.
        let promise = acceptor
            .handle_prepare(generation(4), LogIndex::new(40))
            .expect("prepare");
        assert!(!promise.promised);
        let (accepted, held) = acceptor
            .handle_accept(generation(4), LogIndex::new(41), b"x".to_vec())
            .expect("accept");
        assert!(!accepted);
        assert_eq!(held, generation(5));

        // The floor owner may accept anywhere without a per-index prepare.
        let (accepted, _) = acceptor
            .handle_accept(generation(5), LogIndex::new(42), b"y".to_vec())
            .expect("accept");
        assert!(accepted);
        assert_eq!(acceptor.highest_promised().expect("highest"), generation(5));
    }

    #[test]
    fn test_accept_then_prepare_flow() {
        let mut acceptor = make_acceptor();

        // Generation 1 accepts a value.
        acceptor
            .handle_accept(generation(1), LogIndex::FIRST, b"original".to_vec())
            .expect("accept");

        // Generation 2 discovers it in phase 1 and must re-propose it.
        let promise = acceptor
            .handle_prepare(generation(2), LogIndex::FIRST)
            .expect("prepare");
        assert_eq!(promise.accepted_value, Some(b"original".to_vec()));

        let (accepted, _) = acceptor
            .handle_accept(generation(2), LogIndex::FIRST, b"original".to_vec())
            .expect("accept");
        assert!(accepted);

        // The older proposer can no longer write.
        let (accepted, _) = acceptor
            .handle_accept(generation(1), LogIndex::FIRST, b"late".to_vec())
            .expect("accept");
        assert!(!accepted);
    }
}
