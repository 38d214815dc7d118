//! Messages written to a connection and waiting for the client's ACK.

use courier_protocol::{Message, Seq};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// Ordered list of unacknowledged outbound messages.
///
/// The lock is only held for the duration of a single call and never
/// across an await point.
#[derive(Debug, Default)]
pub struct UnackedList {
    inner: Mutex<Vec<Message>>,
}

impl UnackedList {
    /// Create an empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Message>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a message that was just assigned its sequence number.
    pub fn push(&self, message: Message) {
        self.lock().push(message);
    }

    /// Remove the message carrying `seq`.
    ///
    /// Only the matching entry is removed. Returns `None`, leaving the list
    /// untouched, if no entry carries `seq`.
    pub fn remove(&self, seq: Seq) -> Option<Message> {
        let mut list = self.lock();
        let pos = list.iter().position(|m| m.seq == seq)?;
        Some(list.remove(pos))
    }

    /// Take every pending message, oldest first.
    pub fn drain(&self) -> Vec<Message> {
        std::mem::take(&mut *self.lock())
    }

    /// Number of pending messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is pending.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Sequence numbers of the pending messages, oldest first.
    #[must_use]
    pub fn seqs(&self) -> Vec<Seq> {
        self.lock().iter().map(|m| m.seq).collect()
    }
}
