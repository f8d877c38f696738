//! Single-value Paxos: one register, chosen once.

use distrib_core::TimeProvider;

use crate::replica::Replica;
use crate::types::{LogIndex, PaxosError, Value};

/// A write-once register agreed on by the cluster.
///
/// Whatever value is proposed, every caller gets back the same chosen value.
pub struct SingleValuePaxos<T: TimeProvider> {
    replica: Replica<T>,
}

impl<T: TimeProvider> SingleValuePaxos<T> {
    /// Use `replica` as the proposer.
    pub fn new(replica: Replica<T>) -> Self {
        Self { replica }
    }

    /// The replica proposing on behalf of this register.
    pub fn replica(&self) -> &Replica<T> {
        &self.replica
    }

    /// Propose `value` and return the value actually chosen.
    ///
    /// The result differs from `value` when another value was accepted first.
    pub async fn propose(&self, value: Value) -> Result<Value, PaxosError> {
        self.replica
            .inner
            .propose(LogIndex::REGISTER, Some(value))
            .await?
            .map(|chosen| chosen.value)
            .ok_or(PaxosError::NothingChosen)
    }

    /// Read the chosen value through a consensus round.
    ///
    /// A value accepted but not yet committed gets committed on the way.
    /// Returns `None` without writing anything if nobody proposed.
    pub async fn read(&self) -> Result<Option<Value>, PaxosError> {
        Ok(self
            .replica
            .inner
            .propose(LogIndex::REGISTER, None)
            .await?
            .map(|chosen| chosen.value))
    }

    /// The chosen value if this replica already learned it, without a round.
    pub fn local_value(&self) -> Result<Option<Value>, PaxosError> {
        self.replica.committed_value(LogIndex::REGISTER)
    }
}
