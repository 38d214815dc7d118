//! # courier-transport
//!
//! Transport abstraction layer for the Courier IM server.
//!
//! This crate provides a unified interface over the ways a client can reach
//! the server:
//!
//! - **TCP** - Length-prefixed MessagePack on a raw socket
//! - **WebSocket** - The same byte stream inside binary frames
//! - **Memory** - Channel-backed pairs for tests and embedding
//!
//! ## Transport Abstraction
//!
//! Every accepted [`Connection`] is split into a [`MessageReader`] and a
//! [`MessageWriter`] so the two halves can be driven from separate tasks.
//!
//! ```rust,ignore
//! use courier_transport::{Connection, Transport};
//!
//! async fn serve(transport: impl Transport) {
//!     while let Ok(Connection { mut reader, mut writer, .. }) = transport.accept().await {
//!         tokio::spawn(async move {
//!             while let Ok(Some(message)) = reader.recv().await {
//!                 // Process message
//!             }
//!         });
//!     }
//! }
//! ```

pub mod memory;
pub mod tcp;
pub mod traits;

#[cfg(feature = "websocket")]
pub mod websocket;

pub use tcp::{TcpConfig, TcpTransport};
pub use traits::{
    Connection, ConnectionId, MessageReader, MessageWriter, Transport, TransportError,
};

#[cfg(feature = "websocket")]
pub use websocket::{WebSocketConfig, WebSocketTransport};
