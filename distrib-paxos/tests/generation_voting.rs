//! Generation voting: unique, increasing numbers from a quorum vote.

mod common;

use std::collections::HashSet;

use common::{init_logging, test_config, Cluster};
use distrib_core::{FsStorageProvider, GenerationId, TokioTimeProvider};
use distrib_paxos::{PaxosError, Replica, ReplicaConfig, WalPaxosStorage};
use distrib_transport::LocalNetwork;
use distrib_wal::WalConfig;

async fn allocate(replica: &common::TestReplica, count: usize) -> Vec<GenerationId> {
    let mut numbers = Vec::with_capacity(count);
    for _ in 0..count {
        numbers.push(replica.next_number().await.expect("next number"));
    }
    numbers
}

#[tokio::test]
async fn test_concurrent_coordinators_never_collide() {
    init_logging();
    let cluster = Cluster::start(3);
    let (a, b, c) = (cluster.replica(0), cluster.replica(1), cluster.replica(2));

    let (na, nb, nc) = tokio::join!(allocate(&a, 5), allocate(&b, 5), allocate(&c, 5));

    for numbers in [&na, &nb, &nc] {
        assert!(numbers.windows(2).all(|pair| pair[0] < pair[1]));
    }
    let all: HashSet<GenerationId> = na.iter().chain(&nb).chain(&nc).copied().collect();
    assert_eq!(all.len(), 15);
    cluster.shutdown();
}

#[tokio::test]
async fn test_numbers_increase_across_coordinators() {
    init_logging();
    let cluster = Cluster::start(3);

    let mut previous = GenerationId::ZERO;
    for i in [0, 1, 2, 1, 0] {
        let number = cluster.replica(i).next_number().await.expect("next number");
        assert!(number > previous, "{number} not above {previous}");
        assert_eq!(number.owner, cluster.id(i));
        previous = number;
    }
    cluster.shutdown();
}

#[tokio::test]
async fn test_remote_coordinator_allocates() {
    init_logging();
    let cluster = Cluster::start(3);

    let local = cluster.replica(2).next_number().await.expect("next number");
    let remote = cluster
        .replica(1)
        .request_next_number(cluster.id(0))
        .await
        .expect("remote next number");

    assert_eq!(remote.owner, cluster.id(0));
    assert!(remote > local);
    cluster.shutdown();
}

#[tokio::test]
async fn test_vote_fails_without_quorum() {
    init_logging();
    let cluster = Cluster::start(3);
    cluster.network.disconnect(cluster.id(1));
    cluster.network.disconnect(cluster.id(2));

    let result = cluster.replica(0).next_number().await;
    assert!(
        matches!(result, Err(PaxosError::QuorumUnreachable { .. })),
        "unexpected result {result:?}"
    );
    cluster.shutdown();
}

#[tokio::test]
async fn test_watermark_survives_restart() {
    init_logging();
    let dir = tempfile::tempdir().expect("tempdir");
    let config = WalConfig::new(dir.path().join("votes"));

    let start = |config: WalConfig| {
        let network = LocalNetwork::new();
        let replica_config = test_config(ReplicaConfig::local_cluster(1).remove(0));
        let (endpoint, inbound) = network.register(replica_config.id);
        let storage =
            WalPaxosStorage::open(FsStorageProvider::new(), config).expect("open storage");
        Replica::builder(replica_config, TokioTimeProvider::new())
            .voter_storage(storage)
            .start(endpoint, inbound)
            .expect("start replica")
    };

    let replica = start(config.clone());
    let before = allocate(&replica, 3).await;
    replica.shutdown();
    drop(replica);

    let restarted = start(config);
    let after = restarted.next_number().await.expect("next number");
    assert!(after > before[2], "{after} not above {}", before[2]);
    restarted.shutdown();
}
