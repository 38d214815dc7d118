//! Codec for encoding and decoding Courier messages.
//!
//! This module provides MessagePack-based serialization with length-prefixed framing.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::message::Message;

/// Maximum encoded message size (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Length prefix size in bytes.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Protocol errors that can occur during encoding/decoding.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Message exceeds maximum size.
    #[error("Message size {size} exceeds maximum {limit}")]
    MessageTooLarge { size: usize, limit: usize },

    /// Not enough data to decode a message.
    #[error("Incomplete message: need {0} more bytes")]
    Incomplete(usize),

    /// MessagePack encoding error.
    #[error("Encoding error: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    /// MessagePack decoding error.
    #[error("Decoding error: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

fn encode_payload(message: &Message) -> Result<Vec<u8>, ProtocolError> {
    let payload = rmp_serde::to_vec_named(message)?;

    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: payload.len(),
            limit: MAX_MESSAGE_SIZE,
        });
    }

    Ok(payload)
}

/// Encode a message to bytes.
///
/// The encoded format is:
/// - 4 bytes: Big-endian length prefix
/// - N bytes: MessagePack-encoded message
///
/// # Errors
///
/// Returns an error if the message is too large or encoding fails.
pub fn encode(message: &Message) -> Result<Bytes, ProtocolError> {
    let mut buf = BytesMut::new();
    encode_into(message, &mut buf)?;
    Ok(buf.freeze())
}

/// Encode a message into an existing buffer.
///
/// # Errors
///
/// Returns an error if the message is too large or encoding fails.
pub fn encode_into(message: &Message, buf: &mut BytesMut) -> Result<(), ProtocolError> {
    let payload = encode_payload(message)?;

    buf.reserve(LENGTH_PREFIX_SIZE + payload.len());
    buf.put_u32(payload.len() as u32);
    buf.extend_from_slice(&payload);

    Ok(())
}

/// Decode a message from bytes.
///
/// # Errors
///
/// Returns an error if the data is incomplete, too large, or invalid.
pub fn decode(data: &[u8]) -> Result<Message, ProtocolError> {
    if data.len() < LENGTH_PREFIX_SIZE {
        return Err(ProtocolError::Incomplete(LENGTH_PREFIX_SIZE - data.len()));
    }

    let length = u32::from_be_bytes([data[0], data[1], data[2], data[3]]) as usize;

    if length > MAX_MESSAGE_SIZE {
        return Err(ProtocolError::MessageTooLarge {
            size: length,
            limit: MAX_MESSAGE_SIZE,
        });
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if data.len() < total_size {
        return Err(ProtocolError::Incomplete(total_size - data.len()));
    }

    let message = rmp_serde::from_slice(&data[LENGTH_PREFIX_SIZE..total_size])?;
    Ok(message)
}

/// Try to decode a message from a buffer, advancing it if successful.
///
/// Returns `Ok(Some(message))` if a complete message was decoded,
/// `Ok(None)` if more data is needed, or `Err` on protocol error.
///
/// # Errors
///
/// Returns an error if the message is too large or invalid.
pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Message>, ProtocolError> {
    decode_from_with_limit(buf, MAX_MESSAGE_SIZE)
}

/// Like [`decode_from`], rejecting any message whose length prefix exceeds `limit`.
///
/// # Errors
///
/// Returns an error if the message is too large or invalid.
pub fn decode_from_with_limit(
    buf: &mut BytesMut,
    limit: usize,
) -> Result<Option<Message>, ProtocolError> {
    if buf.len() < LENGTH_PREFIX_SIZE {
        return Ok(None);
    }

    let length = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;

    let limit = limit.min(MAX_MESSAGE_SIZE);
    if length > limit {
        return Err(ProtocolError::MessageTooLarge {
            size: length,
            limit,
        });
    }

    let total_size = LENGTH_PREFIX_SIZE + length;
    if buf.len() < total_size {
        return Ok(None);
    }

    buf.advance(LENGTH_PREFIX_SIZE);
    let payload = buf.split_to(length);
    let message = rmp_serde::from_slice(&payload)?;

    Ok(Some(message))
}
