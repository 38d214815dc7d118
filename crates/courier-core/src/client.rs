//! The shared half of a session.
//!
//! A [`Client`] is what the router hands out: it carries the session's
//! identity, its login state, the outbound mailbox and the list of messages
//! written but not yet acknowledged. The connection itself stays with the
//! session's reader and writer tasks.

use courier_protocol::{Message, Uid};
use courier_transport::ConnectionId;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

use crate::unacked::UnackedList;

/// Anything that accepts messages for delivery.
pub trait Mailbox: Send + Sync {
    /// Queue a message for delivery.
    ///
    /// # Errors
    ///
    /// Hands the message back if the target no longer accepts mail.
    fn enqueue(&self, message: Message) -> Result<(), Message>;
}

/// Items travelling through a session's mailbox.
#[derive(Debug)]
pub(crate) enum Mail {
    /// A message to write.
    Deliver(Message),
    /// The reader is gone; flush and stop.
    Shutdown,
}

/// Session lifecycle.
///
/// States only move forward, in declaration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    /// Connected, no successful AUTH yet.
    Unauthenticated = 0,
    /// Logged in.
    Authenticated = 1,
    /// Disconnect or reset in progress.
    Closing = 2,
    /// Writer finished and the socket is closed.
    Closed = 3,
}

impl SessionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SessionState::Unauthenticated,
            1 => SessionState::Authenticated,
            2 => SessionState::Closing,
            _ => SessionState::Closed,
        }
    }
}

/// A connected client as seen by the rest of the server.
pub struct Client {
    id: ConnectionId,
    uid: AtomicU64,
    authenticated_at: AtomicU64,
    state: AtomicU8,
    mailbox: mpsc::UnboundedSender<Mail>,
    unacked: UnackedList,
    /// Flips to `true` once the writer has flushed and closed the socket.
    closed: watch::Sender<bool>,
}

impl Client {
    /// Create a client handle and the receiving end of its mailbox.
    pub(crate) fn new(id: ConnectionId) -> (Arc<Self>, mpsc::UnboundedReceiver<Mail>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let client = Arc::new(Self {
            id,
            uid: AtomicU64::new(0),
            authenticated_at: AtomicU64::new(0),
            state: AtomicU8::new(SessionState::Unauthenticated as u8),
            mailbox: tx,
            unacked: UnackedList::new(),
            closed: watch::channel(false).0,
        });
        (client, rx)
    }

    /// Connection identifier.
    #[must_use]
    pub fn id(&self) -> &ConnectionId {
        &self.id
    }

    /// Logged in user, `0` before authentication.
    #[must_use]
    pub fn uid(&self) -> Uid {
        self.uid.load(Ordering::Acquire)
    }

    /// Whether a user has logged in on this connection.
    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.uid() != 0
    }

    /// Unix time in seconds of the last successful AUTH.
    #[must_use]
    pub fn authenticated_at(&self) -> u64 {
        self.authenticated_at.load(Ordering::Acquire)
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Messages written to this connection and not acknowledged yet.
    #[must_use]
    pub fn unacked(&self) -> &UnackedList {
        &self.unacked
    }

    pub(crate) fn authenticate(&self, uid: Uid, at: u64) {
        self.uid.store(uid, Ordering::Release);
        self.authenticated_at.store(at, Ordering::Release);
        let _ = self.state.compare_exchange(
            SessionState::Unauthenticated as u8,
            SessionState::Authenticated as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    pub(crate) fn begin_closing(&self) {
        self.state.fetch_max(SessionState::Closing as u8, Ordering::AcqRel);
    }

    /// Resolves once the session is [`SessionState::Closed`].
    ///
    /// By then every message the session still held has been handed to the
    /// offline store.
    pub async fn closed(&self) {
        let mut rx = self.closed.subscribe();
        // The sender lives in `self`, so waiting cannot fail
        let _ = rx.wait_for(|closed| *closed).await;
    }

    pub(crate) fn mark_closed(&self) {
        self.state.store(SessionState::Closed as u8, Ordering::Release);
        self.closed.send_replace(true);
    }

    /// Queue the termination sentinel behind everything already in the mailbox.
    pub(crate) fn shutdown(&self) {
        let _ = self.mailbox.send(Mail::Shutdown);
    }
}

impl Mailbox for Client {
    fn enqueue(&self, message: Message) -> Result<(), Message> {
        self.mailbox
            .send(Mail::Deliver(message))
            .map_err(|err| match err.0 {
                Mail::Deliver(message) => message,
                Mail::Shutdown => unreachable!("enqueue only sends Deliver"),
            })
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("uid", &self.uid())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
