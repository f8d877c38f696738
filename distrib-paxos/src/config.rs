//! Configuration for a consensus replica.

use std::time::Duration;

use distrib_core::ReplicaId;
use distrib_transport::WaitingListConfig;

/// Configuration for a [`Replica`](crate::Replica).
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// This replica.
    pub id: ReplicaId,

    /// Every replica of the cluster, this one included.
    pub peers: Vec<ReplicaId>,

    /// Expiry of outstanding requests to peers.
    pub waiting_list: WaitingListConfig,

    /// How long a log client waits for its entry to be applied.
    pub apply_wait_timeout: Duration,

    /// Attempts before a contended operation gives up.
    pub max_attempts: usize,

    /// Minimum pause between two attempts.
    pub retry_base_delay: Duration,

    /// Random extra pause between two attempts, so competing proposers drift
    /// apart.
    pub retry_jitter: Duration,
}

impl ReplicaConfig {
    /// Configuration for `id` in a cluster of `peers`.
    pub fn new(id: ReplicaId, peers: Vec<ReplicaId>) -> Self {
        Self {
            id,
            peers,
            waiting_list: WaitingListConfig::default(),
            apply_wait_timeout: Duration::from_secs(5),
            max_attempts: 5,
            retry_base_delay: Duration::from_millis(10),
            retry_jitter: Duration::from_millis(90),
        }
    }

    /// One configuration per replica of a cluster of `size` replicas,
    /// numbered from 0.
    pub fn local_cluster(size: u32) -> Vec<Self> {
        let peers: Vec<ReplicaId> = (0..size).map(ReplicaId).collect();
        peers
            .iter()
            .map(|id| Self::new(*id, peers.clone()))
            .collect()
    }

    /// Number of replicas in the cluster.
    pub fn cluster_size(&self) -> usize {
        self.peers.len()
    }

    /// Set the waiting-list configuration.
    pub fn with_waiting_list(mut self, waiting_list: WaitingListConfig) -> Self {
        self.waiting_list = waiting_list;
        self
    }

    /// Set the apply wait timeout.
    pub fn with_apply_wait_timeout(mut self, timeout: Duration) -> Self {
        self.apply_wait_timeout = timeout;
        self
    }

    /// Set the number of attempts.
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the retry delay as base plus random jitter.
    pub fn with_retry_delay(mut self, base: Duration, jitter: Duration) -> Self {
        self.retry_base_delay = base;
        self.retry_jitter = jitter;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_cluster_includes_self() {
        let configs = ReplicaConfig::local_cluster(3);
        assert_eq!(configs.len(), 3);
        for (i, config) in configs.iter().enumerate() {
            assert_eq!(config.id, ReplicaId(i as u32));
            assert!(config.peers.contains(&config.id));
            assert_eq!(config.cluster_size(), 3);
        }
    }

    #[test]
    fn test_builders() {
        let config = ReplicaConfig::new(ReplicaId(0), vec![ReplicaId(0)])
            .with_max_attempts(9)
            .with_retry_delay(Duration::from_millis(1), Duration::ZERO);
        assert_eq!(config.max_attempts, 9);
        assert_eq!(config.retry_jitter, Duration::ZERO);
    }
}
