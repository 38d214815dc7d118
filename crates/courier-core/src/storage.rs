//! Offline message storage.
//!
//! Messages that cannot be delivered right away are queued per user and
//! replayed on the user's next login.

use async_trait::async_trait;
use courier_protocol::{Message, Uid};
use dashmap::DashMap;
use thiserror::Error;
use tracing::{debug, trace};

/// Storage errors.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store cannot be reached.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Durable per-user message queues.
///
/// Implementations must accept concurrent callers.
#[async_trait]
pub trait OfflineStore: Send + Sync {
    /// Append a message to the queue of `uid`.
    async fn save_offline_message(&self, uid: Uid, message: Message) -> Result<(), StoreError>;

    /// Read the pending messages of `uid`, oldest first.
    async fn load_offline_message(&self, uid: Uid) -> Result<Vec<Message>, StoreError>;

    /// Delete the queue of `uid`.
    async fn clear_offline_message(&self, uid: Uid) -> Result<(), StoreError>;
}

/// Offline store kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    queues: DashMap<Uid, Vec<Message>>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of messages queued for `uid`.
    #[must_use]
    pub fn pending(&self, uid: Uid) -> usize {
        self.queues.get(&uid).map(|q| q.len()).unwrap_or(0)
    }

    /// Number of messages queued across all users.
    #[must_use]
    pub fn total_pending(&self) -> usize {
        self.queues.iter().map(|q| q.len()).sum()
    }
}

#[async_trait]
impl OfflineStore for MemoryStore {
    async fn save_offline_message(&self, uid: Uid, message: Message) -> Result<(), StoreError> {
        trace!(uid, cmd = ?message.cmd(), "Saving offline message");
        self.queues.entry(uid).or_default().push(message);
        Ok(())
    }

    async fn load_offline_message(&self, uid: Uid) -> Result<Vec<Message>, StoreError> {
        Ok(self
            .queues
            .get(&uid)
            .map(|q| q.value().clone())
            .unwrap_or_default())
    }

    async fn clear_offline_message(&self, uid: Uid) -> Result<(), StoreError> {
        if let Some((_, queue)) = self.queues.remove(&uid) {
            debug!(uid, count = queue.len(), "Cleared offline messages");
        }
        Ok(())
    }
}
