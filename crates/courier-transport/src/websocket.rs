//! WebSocket transport implementation.
//!
//! Each binary WebSocket frame carries one or more length-prefixed messages,
//! the same byte stream the TCP transport uses.

use async_trait::async_trait;
use bytes::BytesMut;
use courier_protocol::{codec, Message, ProtocolError};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::{
    accept_async,
    tungstenite::{Error as WsError, Message as WsMessage},
    WebSocketStream,
};
use tracing::{debug, info, trace, warn};

use crate::traits::{
    Connection, ConnectionId, MessageReader, MessageWriter, Transport, TransportError,
};

/// Handshaken connections waiting for `accept`.
const READY_BACKLOG: usize = 128;

/// WebSocket transport configuration.
#[derive(Debug, Clone)]
pub struct WebSocketConfig {
    /// Address to bind to.
    pub bind_addr: SocketAddr,
    /// Maximum message size in bytes.
    pub max_message_size: usize,
    /// Time a client gets to complete the upgrade request.
    pub handshake_timeout: Duration,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 23080)),
            max_message_size: 64 * 1024, // 64 KB
            handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// WebSocket transport.
///
/// A background task accepts TCP sockets and runs every upgrade handshake in
/// its own task, so a client that never finishes the handshake holds up
/// nobody but itself. [`Transport::accept`] hands out connections in the
/// order their handshakes complete.
pub struct WebSocketTransport {
    local_addr: Option<SocketAddr>,
    ready: Mutex<mpsc::Receiver<Connection>>,
    listener_task: JoinHandle<()>,
}

impl WebSocketTransport {
    /// Create a new WebSocket transport.
    ///
    /// # Errors
    ///
    /// Returns an error if binding to the address fails.
    pub async fn new(config: WebSocketConfig) -> Result<Self, TransportError> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(TransportError::Io)?;
        let local_addr = listener.local_addr().ok();

        info!("WebSocket transport listening on {}", config.bind_addr);

        let (tx, rx) = mpsc::channel(READY_BACKLOG);
        let listener_task = tokio::spawn(listen(listener, config, tx));

        Ok(Self {
            local_addr,
            ready: Mutex::new(rx),
            listener_task,
        })
    }

    /// Create a new WebSocket transport with default config.
    ///
    /// # Errors
    ///
    /// Returns an error if binding fails.
    pub async fn bind(addr: SocketAddr) -> Result<Self, TransportError> {
        Self::new(WebSocketConfig {
            bind_addr: addr,
            ..Default::default()
        })
        .await
    }

    /// Get the local address this transport is bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for WebSocketTransport {
    fn drop(&mut self) {
        self.listener_task.abort();
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn accept(&self) -> Result<Connection, TransportError> {
        self.ready
            .lock()
            .await
            .recv()
            .await
            .ok_or(TransportError::ConnectionClosed)
    }

    fn name(&self) -> &'static str {
        "websocket"
    }
}

async fn listen(listener: TcpListener, config: WebSocketConfig, ready: mpsc::Sender<Connection>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "TCP accept failed");
                // Usually out of file descriptors; give the process a moment
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };

        let ready = ready.clone();
        let timeout = config.handshake_timeout;
        let max_message_size = config.max_message_size;

        tokio::spawn(async move {
            match tokio::time::timeout(timeout, accept_async(stream)).await {
                Ok(Ok(ws_stream)) => {
                    debug!(remote = %addr, "WebSocket client connected");
                    let connection = split_websocket(ws_stream, addr, max_message_size);
                    if ready.send(connection).await.is_err() {
                        debug!(remote = %addr, "Transport closed, dropping connection");
                    }
                }
                Ok(Err(e)) => warn!(remote = %addr, error = %e, "Handshake failed"),
                Err(_) => warn!(remote = %addr, ?timeout, "Handshake timed out"),
            }
        });
    }
}

fn split_websocket(
    stream: WebSocketStream<TcpStream>,
    addr: SocketAddr,
    max_message_size: usize,
) -> Connection {
    let (sink, stream) = stream.split();

    let reader = WebSocketReader {
        stream,
        read_buffer: BytesMut::with_capacity(4096),
        max_message_size,
    };
    let writer = WebSocketWriter { sink, open: true };

    Connection::new(ConnectionId::generate(), reader, writer).with_remote_addr(addr.to_string())
}

/// Read half of a WebSocket connection.
pub struct WebSocketReader {
    stream: SplitStream<WebSocketStream<TcpStream>>,
    read_buffer: BytesMut,
    max_message_size: usize,
}

#[async_trait]
impl MessageReader for WebSocketReader {
    async fn recv(&mut self) -> Result<Option<Message>, TransportError> {
        loop {
            // A single frame may have carried more than one message
            if let Some(message) =
                codec::decode_from_with_limit(&mut self.read_buffer, self.max_message_size)?
            {
                return Ok(Some(message));
            }

            match self.stream.next().await {
                Some(Ok(WsMessage::Binary(data))) => {
                    let size = self.read_buffer.len() + data.len();
                    if size > self.max_message_size + codec::LENGTH_PREFIX_SIZE {
                        warn!(size, limit = self.max_message_size, "Oversized frame");
                        return Err(ProtocolError::MessageTooLarge {
                            size,
                            limit: self.max_message_size,
                        }
                        .into());
                    }
                    self.read_buffer.extend_from_slice(&data);
                }
                Some(Ok(WsMessage::Text(text))) => {
                    // Some browser clients only send text frames
                    self.read_buffer.extend_from_slice(text.as_bytes());
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_) | WsMessage::Frame(_))) => {
                    // Pongs are queued by tungstenite and flushed with the next write
                }
                Some(Ok(WsMessage::Close(_))) => {
                    trace!("Close frame");
                    return Ok(None);
                }
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
                    trace!("Stream ended");
                    return Ok(None);
                }
                Some(Err(e)) => {
                    return Err(TransportError::ReceiveFailed(e.to_string()));
                }
            }
        }
    }
}

/// Write half of a WebSocket connection.
pub struct WebSocketWriter {
    sink: SplitSink<WebSocketStream<TcpStream>, WsMessage>,
    open: bool,
}

#[async_trait]
impl MessageWriter for WebSocketWriter {
    async fn send(&mut self, message: &Message) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::ConnectionClosed);
        }

        let data = codec::encode(message)?;
        self.sink
            .send(WsMessage::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !std::mem::replace(&mut self.open, false) {
            return Ok(());
        }

        self.sink
            .close()
            .await
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }
}
