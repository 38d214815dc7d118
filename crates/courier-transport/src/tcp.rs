//! Plain TCP transport.
//!
//! Messages travel as length-prefixed MessagePack, exactly as produced by
//! [`courier_protocol::codec`].

use async_trait::async_trait;
use bytes::BytesMut;
use courier_protocol::{codec, Message};
use std::net::SocketAddr;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::traits::{
    Connection, ConnectionId, MessageReader, MessageWriter, Transport, TransportError,
};

/// TCP transport configuration.
#[derive(Debug, Clone)]
pub struct TcpConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum inbound message size in bytes.
    pub max_message_size: usize,
    /// Disable Nagle's algorithm on accepted sockets.
    pub nodelay: bool,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 23000)),
            max_message_size: 64 * 1024, // 64 KB
            nodelay: true,
        }
    }
}

/// TCP transport.
pub struct TcpTransport {
    listener: TcpListener,
    config: TcpConfig,
}

impl TcpTransport {
    /// Create a new TCP transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: TcpConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr).await?;

        info!("TCP transport listening on {}", config.bind_addr);

        Ok(Self { listener, config })
    }

    /// Create a new TCP transport with default settings.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(TcpConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn accept(&self) -> Result<Connection, TransportError> {
        let (stream, addr) = self.listener.accept().await?;

        debug!("Accepted TCP connection from {}", addr);

        if self.config.nodelay {
            if let Err(e) = stream.set_nodelay(true) {
                warn!("Failed to set TCP_NODELAY for {}: {}", addr, e);
            }
        }

        Ok(split_stream(stream, addr, self.config.max_message_size))
    }

    fn name(&self) -> &'static str {
        "tcp"
    }
}

/// Split a connected stream into a [`Connection`].
#[must_use]
pub fn split_stream(stream: TcpStream, addr: SocketAddr, max_message_size: usize) -> Connection {
    let (read_half, write_half) = stream.into_split();

    let reader = TcpMessageReader {
        inner: read_half,
        read_buffer: BytesMut::with_capacity(4096),
        max_message_size,
    };
    let writer = TcpMessageWriter {
        inner: write_half,
        write_buffer: BytesMut::with_capacity(4096),
        open: true,
    };

    Connection::new(ConnectionId::generate(), reader, writer).with_remote_addr(addr.to_string())
}

/// Read half of a TCP connection.
pub struct TcpMessageReader {
    inner: OwnedReadHalf,
    read_buffer: BytesMut,
    max_message_size: usize,
}

#[async_trait]
impl MessageReader for TcpMessageReader {
    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        loop {
            if let Some(message) =
                codec::decode_from_with_limit(&mut self.read_buffer, self.max_message_size)?
            {
                return Ok(Some(message));
            }

            let n = self.inner.read_buf(&mut self.read_buffer).await?;
            if n == 0 {
                if self.read_buffer.is_empty() {
                    return Ok(None);
                }
                // Peer hung up in the middle of a message
                return Err(TransportError::ConnectionClosed);
            }
        }
    }
}

/// Write half of a TCP connection.
pub struct TcpMessageWriter {
    inner: OwnedWriteHalf,
    write_buffer: BytesMut,
    open: bool,
}

#[async_trait]
impl MessageWriter for TcpMessageWriter {
    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }

        self.write_buffer.clear();
        codec::encode_into(message, &mut self.write_buffer)?;
        self.inner
            .write_all(&self.write_buffer)
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.open, false) {
            return Ok(());
        }

        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use courier_protocol::ImMessage;

    #[test]
    fn test_tcp_config_default() {
        let config = TcpConfig::default();
        assert_eq!(config.bind_addr.port(), 23000);
        assert_eq!(config.max_message_size, 64 * 1024);
        assert!(config.nodelay);
    }

    #[tokio::test]
    async fn test_tcp_send_recv() {
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();

        let client = tokio::spawn(async move {
            let stream = TcpStream::connect(addr).await.unwrap();
            let mut conn = split_stream(stream, addr, 64 * 1024);
            conn.writer.send(&Message::auth(7)).await.unwrap();
            let reply = conn.reader.recv().await.unwrap();
            conn.writer.close().await.unwrap();
            reply
        });

        let mut conn = transport.accept().await.unwrap();
        assert!(conn.remote_addr.is_some());

        let first = conn.reader.recv().await.unwrap();
        assert_eq!(first, Some(Message::auth(7)));

        let im = Message::im(ImMessage::new(1, 7, "hi")).with_seq(1);
        conn.writer.send(&im).await.unwrap();

        assert_eq!(client.await.unwrap(), Some(im));
        // Client shut down its write half
        assert_eq!(conn.reader.recv().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_tcp_send_after_close() {
        let transport = TcpTransport::bind("127.0.0.1:0".parse().unwrap())
            .await
            .unwrap();
        let addr = transport.local_addr().unwrap();

        let _client = TcpStream::connect(addr).await.unwrap();
        let mut conn = transport.accept().await.unwrap();

        conn.writer.close().await.unwrap();
        conn.writer.close().await.unwrap();
        assert!(matches!(
            conn.writer.send(&Message::heartbeat()).await,
            Err(TransportError::ConnectionClosed)
        ));
    }
}
