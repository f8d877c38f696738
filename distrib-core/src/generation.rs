//! Replica identity and generation numbers.
//!
//! A [`GenerationId`] is the single ordering primitive used everywhere a
//! replica has to win over a competitor: Paxos ballots, leader generations,
//! and the cluster-unique numbers handed out by generation voting.
//!
//! Two replicas may pick the same counter concurrently. The owner id breaks
//! the tie, so two generations are equal only when both fields are equal.

use serde::{Deserialize, Serialize};

/// Identifier of a replica in the cluster.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct ReplicaId(pub u32);

impl ReplicaId {
    /// Create a new replica id.
    pub const fn new(id: u32) -> Self {
        Self(id)
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "replica-{}", self.0)
    }
}

/// Totally ordered generation (ballot) number.
///
/// Ordering compares `counter` first and `owner` second. The derived
/// `Ord` relies on the field declaration order, do not reorder the fields.
///
/// ```
/// use distrib_core::{GenerationId, ReplicaId};
///
/// let a = GenerationId::new(3, ReplicaId(1));
/// let b = GenerationId::new(3, ReplicaId(2));
/// assert!(a < b);
/// assert!(b < a.next(ReplicaId(0)));
/// ```
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct GenerationId {
    /// Monotonic counter, compared first.
    pub counter: u64,
    /// Replica that issued this generation, compared on counter ties.
    pub owner: ReplicaId,
}

impl GenerationId {
    /// The lowest generation, "nothing promised yet".
    pub const ZERO: Self = Self {
        counter: 0,
        owner: ReplicaId(0),
    };

    /// Create a generation from its parts.
    pub const fn new(counter: u64, owner: ReplicaId) -> Self {
        Self { counter, owner }
    }

    /// The generation following `self`, issued by `owner`.
    ///
    /// Always strictly greater than `self`, whatever the owner.
    pub const fn next(self, owner: ReplicaId) -> Self {
        Self {
            counter: self.counter + 1,
            owner,
        }
    }
}

impl std::fmt::Display for GenerationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gen({}.{})", self.counter, self.owner.0)
    }
}
