//! Cluster membership as seen by one node.
//!
//! [`ClusterRegistry`] is where a node announces the users it serves, and
//! [`PeerClient`] stands in for a session that lives on another node.

use crate::client::Mailbox;
use courier_protocol::{Message, Uid};
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Announces which users are connected to this node.
pub trait ClusterRegistry: Send + Sync {
    /// Announce that `uid` logged in here at `timestamp` (unix seconds).
    fn add_client(&self, uid: Uid, timestamp: u64);

    /// Retract the announcement for `uid`.
    fn remove_client(&self, uid: Uid);
}

/// Identifier of a cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(String);

impl PeerId {
    /// Create a peer ID.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A session on another node.
///
/// One `PeerClient` exists per remote node; every user on that node resolves
/// to the same instance. Messages enqueued here are picked up by whatever
/// link forwards traffic to the node.
pub struct PeerClient {
    id: PeerId,
    tx: mpsc::UnboundedSender<Message>,
}

impl PeerClient {
    /// Create a peer and the receiver its forwarding link drains.
    #[must_use]
    pub fn new(id: impl Into<String>) -> (Arc<Self>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = Arc::new(Self {
            id: PeerId::new(id),
            tx,
        });
        (peer, rx)
    }

    /// The node this peer represents.
    #[must_use]
    pub fn id(&self) -> &PeerId {
        &self.id
    }
}

impl Mailbox for PeerClient {
    fn enqueue(&self, message: Message) -> Result<(), Message> {
        trace!(peer = %self.id, cmd = ?message.cmd(), "Forwarding to peer");
        self.tx.send(message).map_err(|err| err.0)
    }
}

impl fmt::Debug for PeerClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeerClient").field("id", &self.id).finish()
    }
}

/// The in-process registry for a single node.
pub struct Cluster {
    node_id: PeerId,
    /// Users connected here, with their login time.
    online: DashMap<Uid, u64>,
}

impl Cluster {
    /// Create a registry for `node_id`.
    #[must_use]
    pub fn new(node_id: impl Into<String>) -> Self {
        Self {
            node_id: PeerId::new(node_id),
            online: DashMap::new(),
        }
    }

    /// This node's identifier.
    #[must_use]
    pub fn node_id(&self) -> &PeerId {
        &self.node_id
    }

    /// Whether `uid` is announced on this node.
    #[must_use]
    pub fn is_online(&self, uid: Uid) -> bool {
        self.online.contains_key(&uid)
    }

    /// Login time announced for `uid`.
    #[must_use]
    pub fn login_time(&self, uid: Uid) -> Option<u64> {
        self.online.get(&uid).map(|e| *e.value())
    }

    /// Number of announced users.
    #[must_use]
    pub fn len(&self) -> usize {
        self.online.len()
    }

    /// Whether no user is announced.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.online.is_empty()
    }
}

impl ClusterRegistry for Cluster {
    fn add_client(&self, uid: Uid, timestamp: u64) {
        debug!(node = %self.node_id, uid, "Announcing user");
        self.online.insert(uid, timestamp);
    }

    fn remove_client(&self, uid: Uid) {
        if self.online.remove(&uid).is_some() {
            debug!(node = %self.node_id, uid, "Retracting user");
        }
    }
}
