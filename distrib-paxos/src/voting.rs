//! Generation voting: cluster-unique, increasing numbers from one quorum round.
//!
//! ```text
//! coordinator                                 every replica (self included)
//! ───────────                                 ─────────────────────────────
//! candidate = next(max(watermark, seen), self)
//! GenerationPrepare(candidate) ─────────────▶ promise iff candidate > watermark
//!                                             watermark = candidate (durable)
//! quorum of promises ◀─────────────────────── GenerationPromise { promised, watermark }
//! return candidate
//! ```
//!
//! Two candidates that both reach a quorum share at least one voter, and a
//! voter only promises strictly increasing candidates, so the numbers handed
//! out are unique. A rejection reports the voter's watermark and the
//! coordinator retries above it.
//!
//! The coordinator does not record its candidate locally before the
//! broadcast: its own voter receives the same prepare as everyone else and
//! persists it there.

use distrib_core::{GenerationId, TimeProvider};
use distrib_transport::QuorumError;
use tracing::{debug, info, warn};

use crate::message::{Request, Response};
use crate::proposer::highest_rejection;
use crate::replica::ReplicaInner;
use crate::storage::PaxosStorage;
use crate::types::PaxosError;

/// Replica-side state of generation voting.
///
/// The watermark is persisted as the storage floor.
pub struct GenerationVoter<S: PaxosStorage> {
    storage: S,
}

impl<S: PaxosStorage> GenerationVoter<S> {
    /// Create a voter over `storage`.
    pub fn new(storage: S) -> Self {
        Self { storage }
    }

    /// Highest candidate promised so far.
    pub fn watermark(&self) -> Result<GenerationId, PaxosError> {
        self.storage.load_floor()
    }

    /// Promise `candidate` iff it is above the watermark.
    ///
    /// Returns whether it was promised and the watermark afterwards.
    pub fn handle_prepare(
        &mut self,
        candidate: GenerationId,
    ) -> Result<(bool, GenerationId), PaxosError> {
        let watermark = self.storage.load_floor()?;
        if candidate > watermark {
            self.storage.store_floor(candidate)?;
            debug!(candidate = %candidate, "promised generation");
            Ok((true, candidate))
        } else {
            debug!(candidate = %candidate, watermark = %watermark, "rejecting generation");
            Ok((false, watermark))
        }
    }
}

impl<T: TimeProvider> ReplicaInner<T> {
    /// Coordinate one generation vote, retrying above any rejection.
    pub(crate) async fn next_number(&self) -> Result<GenerationId, PaxosError> {
        let attempts = self.config.max_attempts;
        for attempt in 1..=attempts {
            let watermark = self.voter.lock().watermark()?;
            let candidate = {
                let mut seen = self.voting_seen.lock();
                let candidate = watermark.max(*seen).next(self.config.id);
                *seen = candidate;
                candidate
            };

            match self
                .quorum_round(
                    Request::GenerationPrepare { candidate },
                    Response::is_generation_promised,
                )
                .await
            {
                Ok(_) => {
                    info!(
                        replica = %self.config.id,
                        candidate = %candidate,
                        attempt,
                        "allocated generation"
                    );
                    return Ok(candidate);
                }
                Err(QuorumError::Unreachable { rejected, errors }) => {
                    if rejected.is_empty() {
                        return Err(PaxosError::QuorumUnreachable {
                            rejections: 0,
                            errors: errors.len(),
                        });
                    }
                    if let Some(seen) = highest_rejection(candidate, &rejected) {
                        let mut voting_seen = self.voting_seen.lock();
                        *voting_seen = (*voting_seen).max(seen);
                    }
                    warn!(
                        replica = %self.config.id,
                        candidate = %candidate,
                        attempt,
                        rejections = rejected.len(),
                        "generation vote lost, retrying"
                    );
                    self.backoff().await?;
                }
                Err(QuorumError::Timeout) => return Err(PaxosError::Timeout),
                Err(QuorumError::Abandoned) => return Err(PaxosError::Shutdown),
            }
        }
        Err(PaxosError::RetriesExhausted { attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{InMemoryPaxosStorage, WalPaxosStorage};
    use distrib_core::{MemoryStorageProvider, ReplicaId};
    use distrib_wal::WalConfig;

    #[test]
    fn test_promises_strictly_increasing() {
        let mut voter = GenerationVoter::new(InMemoryPaxosStorage::new());
        let one = GenerationId::new(1, ReplicaId(0));
        let two = GenerationId::new(2, ReplicaId(0));

        assert_eq!(voter.handle_prepare(one).expect("prepare"), (true, one));
        assert_eq!(voter.handle_prepare(one).expect("prepare"), (false, one));
        assert_eq!(voter.handle_prepare(two).expect("prepare"), (true, two));
        assert_eq!(voter.handle_prepare(one).expect("prepare"), (false, two));
        assert_eq!(voter.watermark().expect("watermark"), two);
    }

    #[test]
    fn test_watermark_survives_restart() {
        let disk = MemoryStorageProvider::new();
        let config = WalConfig::new("/votes");
        let candidate = GenerationId::new(7, ReplicaId(2));
        {
            let storage = WalPaxosStorage::open(disk.clone(), config.clone()).expect("open");
            let mut voter = GenerationVoter::new(storage);
            voter.handle_prepare(candidate).expect("prepare");
        }

        let storage = WalPaxosStorage::open(disk, config).expect("reopen");
        let mut voter = GenerationVoter::new(storage);
        assert_eq!(voter.watermark().expect("watermark"), candidate);
        let (promised, _) = voter.handle_prepare(candidate).expect("prepare");
        assert!(!promised);
    }
}
