//! Message types for the Courier protocol.
//!
//! Every message on the wire is an envelope carrying a per-connection
//! sequence number and a body whose shape is selected by its command.

use serde::{Deserialize, Serialize};

/// A user identifier. `0` is reserved for "not authenticated".
pub type Uid = u64;

/// A group identifier.
pub type Gid = u64;

/// A per-connection sequence number.
pub type Seq = u32;

/// Authentication succeeded.
pub const AUTH_STATUS_OK: i32 = 0;

/// Authentication was refused.
pub const AUTH_STATUS_INVALID: i32 = 1;

/// Command identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum Command {
    Heartbeat = 1,
    Auth = 2,
    AuthStatus = 3,
    Im = 4,
    Ack = 5,
    Rst = 6,
    GroupIm = 8,
}

impl From<Command> for u8 {
    fn from(cmd: Command) -> u8 {
        cmd as u8
    }
}

impl TryFrom<u8> for Command {
    type Error = &'static str;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Command::Heartbeat),
            2 => Ok(Command::Auth),
            3 => Ok(Command::AuthStatus),
            4 => Ok(Command::Im),
            5 => Ok(Command::Ack),
            6 => Ok(Command::Rst),
            8 => Ok(Command::GroupIm),
            _ => Err("Invalid command"),
        }
    }
}

/// Login request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Authentication {
    /// The user logging in.
    pub uid: Uid,
}

/// Login result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticationStatus {
    /// `AUTH_STATUS_OK` on success.
    pub code: i32,
}

/// A point-to-point or group chat message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImMessage {
    /// Sending user.
    pub sender: Uid,
    /// Receiving user, or the group id for group messages.
    pub receiver: Uid,
    /// Client supplied timestamp, opaque to the server.
    #[serde(default)]
    pub timestamp: u64,
    /// Message content, opaque to the server.
    pub content: String,
}

impl ImMessage {
    /// Create a new chat message.
    #[must_use]
    pub fn new(sender: Uid, receiver: Uid, content: impl Into<String>) -> Self {
        Self {
            sender,
            receiver,
            timestamp: 0,
            content: content.into(),
        }
    }

    /// Set the client timestamp.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Acknowledgment of a sequence number assigned by the peer's writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageAck {
    /// The acknowledged sequence number.
    pub seq: Seq,
}

/// Message body, discriminated by command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum Body {
    /// Keepalive.
    Heartbeat,
    /// Login request.
    Auth(Authentication),
    /// Login result.
    AuthStatus(AuthenticationStatus),
    /// Point-to-point message.
    Im(ImMessage),
    /// Acknowledgment.
    Ack(MessageAck),
    /// Connection reset, sent to a session superseded by a newer login.
    Rst,
    /// Group message.
    GroupIm(ImMessage),
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Sequence number assigned by the sending connection's writer.
    pub seq: Seq,
    /// The message body.
    pub body: Body,
}

impl Message {
    /// Create a message with an unassigned sequence number.
    #[must_use]
    pub fn new(body: Body) -> Self {
        Self { seq: 0, body }
    }

    /// Set the sequence number.
    #[must_use]
    pub fn with_seq(mut self, seq: Seq) -> Self {
        self.seq = seq;
        self
    }

    /// Get the command of this message.
    #[must_use]
    pub fn cmd(&self) -> Command {
        match self.body {
            Body::Heartbeat => Command::Heartbeat,
            Body::Auth(_) => Command::Auth,
            Body::AuthStatus(_) => Command::AuthStatus,
            Body::Im(_) => Command::Im,
            Body::Ack(_) => Command::Ack,
            Body::Rst => Command::Rst,
            Body::GroupIm(_) => Command::GroupIm,
        }
    }

    /// Whether the receiver is expected to acknowledge this message.
    #[must_use]
    pub fn requires_ack(&self) -> bool {
        matches!(self.body, Body::Im(_) | Body::GroupIm(_))
    }

    /// Create a Heartbeat message.
    #[must_use]
    pub fn heartbeat() -> Self {
        Self::new(Body::Heartbeat)
    }

    /// Create an Auth message.
    #[must_use]
    pub fn auth(uid: Uid) -> Self {
        Self::new(Body::Auth(Authentication { uid }))
    }

    /// Create an AuthStatus message.
    #[must_use]
    pub fn auth_status(code: i32) -> Self {
        Self::new(Body::AuthStatus(AuthenticationStatus { code }))
    }

    /// Create an IM message.
    #[must_use]
    pub fn im(im: ImMessage) -> Self {
        Self::new(Body::Im(im))
    }

    /// Create a group IM message.
    #[must_use]
    pub fn group_im(im: ImMessage) -> Self {
        Self::new(Body::GroupIm(im))
    }

    /// Create an Ack message for the given sequence number.
    #[must_use]
    pub fn ack(seq: Seq) -> Self {
        Self::new(Body::Ack(MessageAck { seq }))
    }

    /// Create an Rst message.
    #[must_use]
    pub fn rst() -> Self {
        Self::new(Body::Rst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_cmd() {
        assert_eq!(Message::auth(7).cmd(), Command::Auth);
        assert_eq!(Message::ack(3).cmd(), Command::Ack);
        assert_eq!(
            Message::group_im(ImMessage::new(1, 9, "hi")).cmd(),
            Command::GroupIm
        );
        assert_eq!(Message::rst().cmd(), Command::Rst);
    }

    #[test]
    fn test_requires_ack() {
        assert!(Message::im(ImMessage::new(1, 2, "hi")).requires_ack());
        assert!(Message::group_im(ImMessage::new(1, 2, "hi")).requires_ack());
        assert!(!Message::ack(1).requires_ack());
        assert!(!Message::heartbeat().requires_ack());
        assert!(!Message::rst().requires_ack());
    }

    #[test]
    fn test_command_conversion() {
        assert_eq!(Command::try_from(4), Ok(Command::Im));
        assert_eq!(Command::try_from(8), Ok(Command::GroupIm));
        assert_eq!(u8::from(Command::Rst), 6);
        assert!(Command::try_from(7).is_err());
        assert!(Command::try_from(0).is_err());
    }

    #[test]
    fn test_new_message_has_no_seq() {
        let msg = Message::im(ImMessage::new(1, 2, "hi"));
        assert_eq!(msg.seq, 0);
        assert_eq!(msg.with_seq(5).seq, 5);
    }
}
