//! One-way message delivery between replicas.
//!
//! The consensus core only needs [`Network::send_one_way`]; responses come back
//! as ordinary inbound messages and are correlated by the waiting list. Wire
//! framing and sockets belong to whatever implements this trait.
//!
//! [`LocalNetwork`] is the in-process implementation: every replica gets a
//! mailbox, and tests can cut links to reproduce partitions.
//!
//! | Control | Effect |
//! |---|---|
//! | [`drop_messages_to`](LocalNetwork::drop_messages_to) | messages on `from -> to` vanish silently |
//! | [`disconnect`](LocalNetwork::disconnect) | sends to or from the replica fail with an error |

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use distrib_core::ReplicaId;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::trace;

/// Errors returned when a message cannot be handed to the transport.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NetworkError {
    /// The destination is not reachable from here.
    #[error("{to} unreachable")]
    Unreachable {
        /// Destination replica.
        to: ReplicaId,
    },

    /// No replica is registered under this id.
    #[error("unknown replica {to}")]
    UnknownReplica {
        /// Destination replica.
        to: ReplicaId,
    },
}

/// Fire-and-forget delivery of `M` to a replica.
pub trait Network<M>: Send + Sync {
    /// Hand `message` to the transport for `to`.
    ///
    /// `Ok` does not mean the message was delivered.
    fn send_one_way(&self, to: ReplicaId, message: M) -> Result<(), NetworkError>;
}

struct Links<M> {
    mailboxes: HashMap<ReplicaId, mpsc::UnboundedSender<M>>,
    dropped: HashSet<(ReplicaId, ReplicaId)>,
    disconnected: HashSet<ReplicaId>,
}

/// In-process network connecting replicas through unbounded channels.
pub struct LocalNetwork<M> {
    links: Arc<Mutex<Links<M>>>,
}

impl<M> Clone for LocalNetwork<M> {
    fn clone(&self) -> Self {
        Self {
            links: self.links.clone(),
        }
    }
}

impl<M> Default for LocalNetwork<M> {
    fn default() -> Self {
        Self {
            links: Arc::new(Mutex::new(Links {
                mailboxes: HashMap::new(),
                dropped: HashSet::new(),
                disconnected: HashSet::new(),
            })),
        }
    }
}

impl<M: Send + 'static> LocalNetwork<M> {
    /// Create an empty network.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach replica `id`, returning its sending side and its mailbox.
    ///
    /// Registering an id again replaces the previous mailbox.
    pub fn register(&self, id: ReplicaId) -> (LocalEndpoint<M>, mpsc::UnboundedReceiver<M>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        self.links.lock().mailboxes.insert(id, sender);
        (
            LocalEndpoint {
                id,
                network: self.clone(),
            },
            receiver,
        )
    }

    /// Silently drop every message sent from `from` to `to`.
    pub fn drop_messages_to(&self, from: ReplicaId, to: ReplicaId) {
        self.links.lock().dropped.insert((from, to));
    }

    /// Drop messages in both directions between `a` and `b`.
    pub fn partition(&self, a: ReplicaId, b: ReplicaId) {
        let mut links = self.links.lock();
        links.dropped.insert((a, b));
        links.dropped.insert((b, a));
    }

    /// Fail every send to or from `id`.
    pub fn disconnect(&self, id: ReplicaId) {
        self.links.lock().disconnected.insert(id);
    }

    /// Undo [`disconnect`](Self::disconnect) for `id`.
    pub fn reconnect(&self, id: ReplicaId) {
        self.links.lock().disconnected.remove(&id);
    }

    /// Remove every dropped link and disconnection.
    pub fn heal(&self) {
        let mut links = self.links.lock();
        links.dropped.clear();
        links.disconnected.clear();
    }

    fn deliver(&self, from: ReplicaId, to: ReplicaId, message: M) -> Result<(), NetworkError> {
        let links = self.links.lock();
        if links.disconnected.contains(&from) || links.disconnected.contains(&to) {
            return Err(NetworkError::Unreachable { to });
        }
        if links.dropped.contains(&(from, to)) {
            trace!(from = %from, to = %to, "dropping message");
            return Ok(());
        }
        let mailbox = links
            .mailboxes
            .get(&to)
            .ok_or(NetworkError::UnknownReplica { to })?;
        mailbox
            .send(message)
            .map_err(|_| NetworkError::Unreachable { to })
    }
}

/// Sending side of one replica attached to a [`LocalNetwork`].
pub struct LocalEndpoint<M> {
    id: ReplicaId,
    network: LocalNetwork<M>,
}

impl<M> LocalEndpoint<M> {
    /// The replica this endpoint sends as.
    pub fn id(&self) -> ReplicaId {
        self.id
    }
}

impl<M: Send + 'static> Network<M> for LocalEndpoint<M> {
    fn send_one_way(&self, to: ReplicaId, message: M) -> Result<(), NetworkError> {
        self.network.deliver(self.id, to, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_delivers_to_mailbox() {
        let network = LocalNetwork::<String>::new();
        let (a, _a_rx) = network.register(ReplicaId(1));
        let (_b, mut b_rx) = network.register(ReplicaId(2));

        a.send_one_way(ReplicaId(2), "hello".into()).expect("send");
        assert_eq!(b_rx.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_dropped_link_is_silent_and_one_way() {
        let network = LocalNetwork::<u32>::new();
        let (a, mut a_rx) = network.register(ReplicaId(1));
        let (b, mut b_rx) = network.register(ReplicaId(2));

        network.drop_messages_to(ReplicaId(1), ReplicaId(2));
        a.send_one_way(ReplicaId(2), 1).expect("silently dropped");
        b.send_one_way(ReplicaId(1), 2).expect("send");

        assert!(b_rx.try_recv().is_err());
        assert_eq!(a_rx.recv().await, Some(2));

        network.heal();
        a.send_one_way(ReplicaId(2), 3).expect("send");
        assert_eq!(b_rx.recv().await, Some(3));
    }

    #[test]
    fn test_disconnect_reports_error() {
        let network = LocalNetwork::<u32>::new();
        let (a, _a_rx) = network.register(ReplicaId(1));
        let (_b, _b_rx) = network.register(ReplicaId(2));

        network.disconnect(ReplicaId(2));
        assert_eq!(
            a.send_one_way(ReplicaId(2), 1),
            Err(NetworkError::Unreachable { to: ReplicaId(2) })
        );

        network.reconnect(ReplicaId(2));
        assert!(a.send_one_way(ReplicaId(2), 1).is_ok());
    }

    #[test]
    fn test_unknown_replica() {
        let network = LocalNetwork::<u32>::new();
        let (a, _a_rx) = network.register(ReplicaId(1));
        assert_eq!(
            a.send_one_way(ReplicaId(9), 1),
            Err(NetworkError::UnknownReplica { to: ReplicaId(9) })
        );
    }
}
