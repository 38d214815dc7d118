//! # courier-protocol
//!
//! Message schema and wire codec for the Courier instant-messaging server.
//!
//! Every message is an envelope `{ seq, body }` where the body is selected
//! by its command:
//!
//! - `Auth` / `AuthStatus` - Login and its result
//! - `Im` / `GroupIm` - Point-to-point and group chat messages
//! - `Ack` - Acknowledges a sequence number assigned by the peer
//! - `Heartbeat` - Keepalive
//! - `Rst` - Tells a superseded session to go away
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, ImMessage, Message};
//!
//! let message = Message::im(ImMessage::new(1, 2, "hello"));
//!
//! let encoded = codec::encode(&message).unwrap();
//! let decoded = codec::decode(&encoded).unwrap();
//! assert_eq!(message, decoded);
//! ```

pub mod codec;
pub mod message;

pub use codec::{decode, encode, ProtocolError};
pub use message::{
    Authentication, AuthenticationStatus, Body, Command, Gid, ImMessage, Message, MessageAck,
    Seq, Uid, AUTH_STATUS_INVALID, AUTH_STATUS_OK,
};
