//! In-process cluster harness for the consensus integration tests.
//!
//! Every replica runs on the test's tokio runtime and talks through one
//! [`LocalNetwork`], so tests can cut links between replicas.

#![allow(dead_code)]

use std::time::Duration;

use distrib_core::{ReplicaId, TokioTimeProvider};
use distrib_paxos::{
    Envelope, KvOperation, KvStateMachine, KvView, LogIndex, Replica, ReplicaConfig, Value,
};
use distrib_transport::{LocalNetwork, WaitingListConfig};

pub type TestReplica = Replica<TokioTimeProvider>;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .try_init();
}

/// Short timeouts so failure paths resolve quickly.
pub fn test_config(config: ReplicaConfig) -> ReplicaConfig {
    config
        .with_waiting_list(
            WaitingListConfig::default()
                .with_expiry_timeout(Duration::from_millis(300))
                .with_sweep_interval(Duration::from_millis(50)),
        )
        .with_apply_wait_timeout(Duration::from_secs(3))
        .with_max_attempts(30)
        .with_retry_delay(Duration::from_millis(5), Duration::from_millis(40))
}

pub fn set(key: &str, value: &str) -> Value {
    KvOperation::Set {
        key: key.into(),
        value: value.into(),
    }
    .encode()
    .expect("encode")
}

pub fn get(key: &str) -> Value {
    KvOperation::Get { key: key.into() }
        .encode()
        .expect("encode")
}

pub struct Cluster {
    pub network: LocalNetwork<Envelope>,
    pub replicas: Vec<TestReplica>,
    pub views: Vec<KvView>,
}

impl Cluster {
    /// Start `size` replicas with in-memory storage and a key/value state
    /// machine each.
    pub fn start(size: u32) -> Self {
        let network = LocalNetwork::new();
        let mut replicas = Vec::new();
        let mut views = Vec::new();
        for config in ReplicaConfig::local_cluster(size) {
            let config = test_config(config);
            let (endpoint, inbound) = network.register(config.id);
            let machine = KvStateMachine::new();
            views.push(machine.view());
            let replica = Replica::builder(config, TokioTimeProvider::new())
                .state_machine(machine)
                .start(endpoint, inbound)
                .expect("start replica");
            replicas.push(replica);
        }
        Self {
            network,
            replicas,
            views,
        }
    }

    pub fn replica(&self, i: usize) -> TestReplica {
        self.replicas[i].clone()
    }

    pub fn id(&self, i: usize) -> ReplicaId {
        self.replicas[i].id()
    }

    /// Committed values of `1..=last` as seen by replica `i`.
    pub fn committed_log(&self, i: usize, last: u64) -> Vec<Option<Value>> {
        (1..=last)
            .map(|n| {
                self.replicas[i]
                    .committed_value(LogIndex::new(n))
                    .expect("read committed value")
            })
            .collect()
    }

    pub fn shutdown(&self) {
        for replica in &self.replicas {
            replica.shutdown();
        }
    }
}

/// Poll `condition` until it holds or two seconds pass.
pub async fn eventually(condition: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
