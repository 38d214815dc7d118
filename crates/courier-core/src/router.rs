//! Routing table for connected users.
//!
//! The router knows which users have a live session on this node and which
//! ones are reachable through a peer node.

use crate::client::Client;
use crate::cluster::PeerClient;
use courier_protocol::Uid;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Lookup of local sessions and remote peers.
pub trait Route: Send + Sync {
    /// Register a session under its uid. A later registration replaces an
    /// earlier one for the same uid.
    fn add_client(&self, client: Arc<Client>);

    /// Deregister a session. Only removes the entry if it is this very
    /// connection; returns whether anything was removed.
    fn remove_client(&self, client: &Client) -> bool;

    /// Find the live local session of a user.
    fn find_client(&self, uid: Uid) -> Option<Arc<Client>>;

    /// Find the peer node a user is connected to.
    fn find_peer_client(&self, uid: Uid) -> Option<Arc<PeerClient>>;
}

/// The in-process router.
///
/// Both tables are sharded concurrent maps, so sessions register and look
/// each other up without a global lock.
pub struct Router {
    /// Local sessions indexed by uid.
    clients: DashMap<Uid, Arc<Client>>,
    /// Users on other nodes, indexed by uid.
    peers: DashMap<Uid, Arc<PeerClient>>,
}

impl Router {
    /// Create an empty router.
    #[must_use]
    pub fn new() -> Self {
        info!("Creating router");
        Self {
            clients: DashMap::new(),
            peers: DashMap::new(),
        }
    }

    /// Record that `uid` is connected through `peer`.
    pub fn add_peer_client(&self, uid: Uid, peer: Arc<PeerClient>) {
        debug!(uid, peer = %peer.id(), "Peer client added");
        self.peers.insert(uid, peer);
    }

    /// Forget the remote location of `uid`.
    pub fn remove_peer_client(&self, uid: Uid) -> Option<Arc<PeerClient>> {
        let removed = self.peers.remove(&uid).map(|(_, peer)| peer);
        if removed.is_some() {
            debug!(uid, "Peer client removed");
        }
        removed
    }

    /// Get router statistics.
    #[must_use]
    pub fn stats(&self) -> RouterStats {
        RouterStats {
            online_users: self.clients.len(),
            remote_users: self.peers.len(),
        }
    }

    /// Uids with a live local session.
    #[must_use]
    pub fn online_uids(&self) -> Vec<Uid> {
        self.clients.iter().map(|e| *e.key()).collect()
    }
}

impl Route for Router {
    fn add_client(&self, client: Arc<Client>) {
        let uid = client.uid();
        debug!(uid, connection = %client.id(), "Client registered");
        self.clients.insert(uid, client);
    }

    fn remove_client(&self, client: &Client) -> bool {
        let removed = self
            .clients
            .remove_if(&client.uid(), |_, current| current.id() == client.id())
            .is_some();
        if removed {
            debug!(uid = client.uid(), connection = %client.id(), "Client deregistered");
        }
        removed
    }

    fn find_client(&self, uid: Uid) -> Option<Arc<Client>> {
        self.clients.get(&uid).map(|e| Arc::clone(e.value()))
    }

    fn find_peer_client(&self, uid: Uid) -> Option<Arc<PeerClient>> {
        self.peers.get(&uid).map(|e| Arc::clone(e.value()))
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

/// Router statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouterStats {
    /// Users with a session on this node.
    pub online_users: usize,
    /// Users known to be on other nodes.
    pub remote_users: usize,
}
