//! Encoding and decoding of the server-list-ping wire format.
//!
//! Every function in here is pure: packets are built into fresh buffers and
//! parsed from borrowed slices. Socket handling lives in
//! [`crate::scanner::prober`].
//!
//! ```rust
//! use craftscan::protocol::{decode_varint, encode_varint};
//!
//! let bytes = encode_varint(25_565);
//! assert_eq!(bytes, [0xDD, 0xC7, 0x01]);
//! assert_eq!(decode_varint(&bytes, 0).unwrap(), (25_565, 3));
//! ```
use std::str;

use thiserror::Error;

/// Longest varint the protocol allows for a 32-bit value.
pub const MAX_VARINT_LEN: usize = 5;

/// Largest packet length a client will accept, the ceiling of a 3-byte varint.
pub const MAX_PACKET_LEN: usize = 2_097_151;

/// Longest server address the handshake may carry, in bytes.
pub const MAX_HOST_LEN: usize = 255;

/// Protocol version sent in the handshake when none is configured (1.8).
pub const DEFAULT_PROTOCOL_VERSION: u32 = 47;

const HANDSHAKE_PACKET_ID: u8 = 0x00;
const STATUS_PACKET_ID: u8 = 0x00;
const PING_PACKET_ID: u8 = 0x01;
const NEXT_STATE_STATUS: u32 = 1;

const SEGMENT_BITS: u32 = 0x7F;
const CONTINUE_BIT: u8 = 0x80;

/// Errors produced while encoding packets or decoding bytes received from a
/// peer.
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed varint: {0}")]
    MalformedVarint(&'static str),

    #[error("truncated string: declared {declared} bytes, {available} available")]
    TruncatedString { declared: usize, available: usize },

    #[error("string is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] str::Utf8Error),

    #[error("unexpected packet id {found:#04x}, expected {expected:#04x}")]
    UnexpectedPacketId { expected: u32, found: u32 },

    #[error("incomplete response: expected {expected} bytes, received {received}")]
    IncompleteResponse { expected: usize, received: usize },

    #[error("packet of {0} bytes exceeds the protocol maximum")]
    PacketTooLarge(usize),

    #[error("server address of {0} bytes exceeds the {MAX_HOST_LEN} byte limit")]
    HostTooLong(usize),
}

/// Appends the varint encoding of `value` to `buf`.
pub fn write_varint(buf: &mut Vec<u8>, mut value: u32) {
    while value > SEGMENT_BITS {
        buf.push((value & SEGMENT_BITS) as u8 | CONTINUE_BIT);
        value >>= 7;
    }
    buf.push(value as u8);
}

/// Encodes `value` as a varint.
#[must_use]
pub fn encode_varint(value: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(MAX_VARINT_LEN);
    write_varint(&mut buf, value);
    buf
}

/// Decodes the varint starting at `offset`.
///
/// Returns the value together with the number of bytes it occupied.
pub fn decode_varint(buf: &[u8], offset: usize) -> Result<(u32, usize), ProtocolError> {
    let mut value: u32 = 0;

    for position in 0..MAX_VARINT_LEN {
        let Some(&byte) = buf.get(offset + position) else {
            return Err(ProtocolError::MalformedVarint("buffer ended before the last byte"));
        };

        let segment = u32::from(byte) & SEGMENT_BITS;
        // the fifth byte may only carry the top four bits of a u32
        if position == MAX_VARINT_LEN - 1 && segment > 0x0F {
            return Err(ProtocolError::MalformedVarint("value does not fit in 32 bits"));
        }
        value |= segment << (7 * position);

        if byte & CONTINUE_BIT == 0 {
            return Ok((value, position + 1));
        }
    }

    Err(ProtocolError::MalformedVarint("longer than 5 bytes"))
}

/// Appends a varint-length-prefixed UTF-8 string to `buf`.
///
/// # Panics
///
/// If `text` is longer than `u32::MAX` bytes.
pub fn write_string(buf: &mut Vec<u8>, text: &str) {
    write_varint(buf, prefix_len(text.len()));
    buf.extend_from_slice(text.as_bytes());
}

/// Encodes `text` as a varint-length-prefixed UTF-8 string.
#[must_use]
pub fn encode_string(text: &str) -> Vec<u8> {
    let mut buf = Vec::with_capacity(text.len() + MAX_VARINT_LEN);
    write_string(&mut buf, text);
    buf
}

/// Decodes the length-prefixed string starting at `offset`.
///
/// The returned count includes the length prefix.
pub fn decode_string(buf: &[u8], offset: usize) -> Result<(String, usize), ProtocolError> {
    let (declared, prefix) = decode_varint(buf, offset)?;
    let declared = declared as usize;
    let start = offset + prefix;
    let available = buf.len().saturating_sub(start);

    if available < declared {
        return Err(ProtocolError::TruncatedString {
            declared,
            available,
        });
    }

    let text = str::from_utf8(&buf[start..start + declared])?;
    Ok((text.to_owned(), prefix + declared))
}

/// Builds the handshake packet announcing `next state = status`.
///
/// `host` is limited to [`MAX_HOST_LEN`] bytes.
pub fn build_handshake_packet(
    host: &str,
    port: u16,
    protocol_version: u32,
) -> Result<Vec<u8>, ProtocolError> {
    if host.len() > MAX_HOST_LEN {
        return Err(ProtocolError::HostTooLong(host.len()));
    }

    let mut payload = Vec::with_capacity(host.len() + 16);
    payload.push(HANDSHAKE_PACKET_ID);
    write_varint(&mut payload, protocol_version);
    write_string(&mut payload, host);
    payload.extend_from_slice(&port.to_be_bytes());
    write_varint(&mut payload, NEXT_STATE_STATUS);
    Ok(frame(&payload))
}

/// Builds the empty status request packet.
#[must_use]
pub fn build_status_request_packet() -> Vec<u8> {
    frame(&[STATUS_PACKET_ID])
}

/// Builds a ping packet carrying `payload`.
#[must_use]
pub fn build_ping_packet(payload: i64) -> Vec<u8> {
    let mut body = Vec::with_capacity(9);
    body.push(PING_PACKET_ID);
    body.extend_from_slice(&payload.to_be_bytes());
    frame(&body)
}

/// Extracts the JSON document from a complete status response frame.
///
/// `buf` must start at the frame's length prefix. Bytes past the declared
/// length are ignored.
pub fn parse_status_response(buf: &[u8]) -> Result<String, ProtocolError> {
    let (length, prefix) = decode_varint(buf, 0)?;
    let length = length as usize;
    if length > MAX_PACKET_LEN {
        return Err(ProtocolError::PacketTooLarge(length));
    }

    let received = buf.len() - prefix;
    if received < length {
        return Err(ProtocolError::IncompleteResponse {
            expected: length,
            received,
        });
    }

    let packet = &buf[prefix..prefix + length];
    let (packet_id, id_len) = decode_varint(packet, 0)?;
    if packet_id != u32::from(STATUS_PACKET_ID) {
        return Err(ProtocolError::UnexpectedPacketId {
            expected: u32::from(STATUS_PACKET_ID),
            found: packet_id,
        });
    }

    let (json, _) = decode_string(packet, id_len)?;
    Ok(json)
}

/// Prefixes `payload` with its own varint length.
fn frame(payload: &[u8]) -> Vec<u8> {
    let mut packet = Vec::with_capacity(payload.len() + MAX_VARINT_LEN);
    write_varint(&mut packet, prefix_len(payload.len()));
    packet.extend_from_slice(payload);
    packet
}

/// Lengths written by this crate are bounded by host names and fixed bodies,
/// so exceeding `u32` is a caller bug rather than a runtime condition.
fn prefix_len(len: usize) -> u32 {
    u32::try_from(len).expect("length prefix exceeds the varint range")
}
