//! In-process transport backed by channels.
//!
//! [`pair`] returns the server side of a connection together with a
//! [`MemoryClient`] that plays the remote end. No encoding takes place.

use async_trait::async_trait;
use courier_protocol::Message;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::traits::{Connection, ConnectionId, MessageReader, MessageWriter, TransportError};

static MEMORY_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Create a connected pair: the server-side [`Connection`] and the client end.
#[must_use]
pub fn pair() -> (Connection, MemoryClient) {
    let (to_server, from_client) = mpsc::unbounded_channel();
    let (to_client, from_server) = mpsc::unbounded_channel();

    let id = ConnectionId::new(format!(
        "mem_{}",
        MEMORY_COUNTER.fetch_add(1, Ordering::Relaxed)
    ));

    let conn = Connection::new(
        id,
        MemoryReader { rx: from_client },
        MemoryWriter {
            tx: Some(to_client),
        },
    )
    .with_remote_addr("memory");

    let client = MemoryClient {
        tx: Some(to_server),
        rx: from_server,
    };

    (conn, client)
}

/// Server-side read half.
pub struct MemoryReader {
    rx: mpsc::UnboundedReceiver<Message>,
}

#[async_trait]
impl MessageReader for MemoryReader {
    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        Ok(self.rx.recv().await)
    }
}

/// Server-side write half.
pub struct MemoryWriter {
    tx: Option<mpsc::UnboundedSender<Message>>,
}

#[async_trait]
impl MessageWriter for MemoryWriter {
    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(message.clone())
            .map_err(|_| TransportError::ConnectionClosed)
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        self.tx = None;
        Ok(())
    }
}

/// The remote end of an in-memory connection.
#[derive(Debug)]
pub struct MemoryClient {
    tx: Option<mpsc::UnboundedSender<Message>>,
    rx: mpsc::UnboundedReceiver<Message>,
}

impl MemoryClient {
    /// Send a message to the server.
    ///
    /// # Errors
    ///
    /// Returns an error if either side has hung up.
    pub fn send(&self, message: Message) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::ConnectionClosed)?;
        tx.send(message).map_err(|_| TransportError::ConnectionClosed)
    }

    /// Receive the next message from the server.
    ///
    /// Returns `None` once the server closed its write half.
    pub async fn recv(&mut self) -> Option<Message> {
        self.rx.recv().await
    }

    /// Receive the next message, giving up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Timeout`] if nothing arrived in time.
    pub async fn recv_timeout(
        &mut self,
        timeout: Duration,
    ) -> Result<Option<Message>, TransportError> {
        tokio::time::timeout(timeout, self.rx.recv())
            .await
            .map_err(|_| TransportError::Timeout)
    }

    /// Take a message that is already waiting, if any.
    pub fn try_recv(&mut self) -> Option<Message> {
        self.rx.try_recv().ok()
    }

    /// Hang up, as if the socket dropped. The server reader sees end of stream.
    pub fn disconnect(&mut self) {
        self.tx = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair() {
        let (mut conn, mut client) = pair();

        client.send(Message::auth(5)).unwrap();
        assert_eq!(conn.reader.recv().await.unwrap(), Some(Message::auth(5)));

        conn.writer.send(&Message::ack(1)).await.unwrap();
        assert_eq!(client.recv().await, Some(Message::ack(1)));
    }

    #[tokio::test]
    async fn test_memory_close_and_disconnect() {
        let (mut conn, mut client) = pair();

        conn.writer.close().await.unwrap();
        assert!(conn.writer.send(&Message::heartbeat()).await.is_err());
        assert_eq!(client.recv().await, None);

        client.disconnect();
        assert!(client.send(Message::heartbeat()).is_err());
        assert_eq!(conn.reader.recv().await.unwrap(), None);
    }

    #[test]
    fn test_memory_ids_are_unique() {
        let (a, _ca) = pair();
        let (b, _cb) = pair();
        assert_ne!(a.id, b.id);
    }
}
