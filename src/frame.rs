//! Header parsing for each kind of message crossing the proxy.
//!
//! A [`Framing`] looks at the header bytes read so far and reports either how
//! many header bytes it still needs or the declared total length of the message.
//! The relay engine drives every direction through the same read loop, so the
//! only thing that differs between requests, replies and the two setup halves is
//! the implementation of this trait.
//!
//! Wire layouts (all integers little-endian, lengths in 4-byte units):
//!
//! - Request: `opcode:u8 data:u8 length:u16`, or with `length == 0` the
//!   BIG-REQUESTS form followed by `length:u32`.
//! - Server message: `category:u8 detail:u8 sequence:u16 length:u32 ...`,
//!   errors are always 32 bytes, everything else is `32 + length * 4`.
//! - Client setup: `order:u8 pad:u8 major:u16 minor:u16 auth_name:u16 auth_data:u16 pad:u16`
//!   followed by both authorization strings padded to 4.
//! - Server setup: `status:u8 reason_len:u8 major:u16 minor:u16 length:u16`.

use bytes::Bytes;

use crate::fields::{uint16le, uint32le, uint8};
use crate::types::{
    Category, Direction, RelayError, BIG_REQUEST_EXTRA_LEN, CLIENT_SETUP_PREFIX_LEN,
    REPLY_BASE_LEN, REPLY_HEADER_LEN, REQUEST_HEADER_LEN, SERVER_SETUP_BASE_LEN,
    SERVER_SETUP_PREFIX_LEN, UNIT,
};

/// Little-endian byte order marker in the client setup prefix.
pub const BYTE_ORDER_LSB: u8 = b'l';

/// GenericEvent carries its own length like a reply.
const GENERIC_EVENT: u8 = 35;

/// Set on events delivered through SendEvent.
const SEND_EVENT_MASK: u8 = 0x80;

/// Outcome of inspecting a (possibly partial) header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderStatus {
    /// The header is longer than what has been read; total header bytes required.
    NeedHeader(usize),
    /// Declared total length of the message, header included.
    Complete(usize),
}

/// Direction-specific header parsing.
pub trait Framing {
    fn direction(&self) -> Direction;

    /// Bytes that must be read before [`Framing::declared_len`] can be asked.
    fn header_len(&self) -> usize;

    /// Compute the total message length from the header bytes read so far.
    fn declared_len(&self, header: &[u8], max_len: usize) -> Result<HeaderStatus, RelayError>;

    /// Sequence number carried in the header, if this kind of message has one.
    fn sequence(&self, _header: &[u8]) -> Option<u16> {
        None
    }
}

fn pad4(n: usize) -> usize {
    (n + UNIT - 1) & !(UNIT - 1)
}

fn checked_total(
    direction: Direction,
    total: u64,
    header_len: usize,
    max_len: usize,
) -> Result<HeaderStatus, RelayError> {
    if total < header_len as u64 {
        return Err(RelayError::MalformedLength {
            direction,
            declared: total,
            reason: "shorter than its own header",
            partial: Bytes::new(),
        });
    }
    if total > max_len as u64 {
        return Err(RelayError::MalformedLength {
            direction,
            declared: total,
            reason: "exceeds the maximum message size",
            partial: Bytes::new(),
        });
    }
    Ok(HeaderStatus::Complete(total as usize))
}

/// Client requests.
#[derive(Debug, Clone, Copy)]
pub struct RequestFraming {
    /// Read a zero 16-bit length as the BIG-REQUESTS extended form.
    /// When off, a zero length is rejected as malformed.
    pub big_requests: bool,
}

impl Default for RequestFraming {
    fn default() -> Self {
        Self { big_requests: true }
    }
}

impl Framing for RequestFraming {
    fn direction(&self) -> Direction {
        Direction::ClientToServer
    }

    fn header_len(&self) -> usize {
        REQUEST_HEADER_LEN
    }

    fn declared_len(&self, header: &[u8], max_len: usize) -> Result<HeaderStatus, RelayError> {
        let units = uint16le(header, 2)?;
        if units != 0 {
            let total = units as u64 * UNIT as u64;
            return checked_total(self.direction(), total, REQUEST_HEADER_LEN, max_len);
        }

        if !self.big_requests {
            return Err(RelayError::MalformedLength {
                direction: self.direction(),
                declared: 0,
                reason: "zero length without BIG-REQUESTS",
                partial: Bytes::new(),
            });
        }
        let big_header = REQUEST_HEADER_LEN + BIG_REQUEST_EXTRA_LEN;
        if header.len() < big_header {
            return Ok(HeaderStatus::NeedHeader(big_header));
        }
        let total = uint32le(header, REQUEST_HEADER_LEN)? as u64 * UNIT as u64;
        checked_total(self.direction(), total, big_header, max_len)
    }
}

/// Server replies, errors and events.
#[derive(Debug, Clone, Copy, Default)]
pub struct ReplyFraming {
    /// Frame core events as exactly 32 bytes instead of trusting bytes 4..8.
    pub fixed_size_events: bool,
}

impl ReplyFraming {
    fn is_core_event(code: u8) -> bool {
        let code = code & !SEND_EVENT_MASK;
        code >= 2 && code != GENERIC_EVENT
    }
}

impl Framing for ReplyFraming {
    fn direction(&self) -> Direction {
        Direction::ServerToClient
    }

    fn header_len(&self) -> usize {
        REPLY_HEADER_LEN
    }

    fn declared_len(&self, header: &[u8], max_len: usize) -> Result<HeaderStatus, RelayError> {
        let code = uint8(header, 0)?;
        let units = uint32le(header, 4)? as u64;

        let fixed = match Category::from(code) {
            Category::Error => true,
            Category::Reply => false,
            Category::Event(_) => self.fixed_size_events && Self::is_core_event(code),
        };
        let total = if fixed {
            REPLY_BASE_LEN as u64
        } else {
            REPLY_BASE_LEN as u64 + units * UNIT as u64
        };
        checked_total(self.direction(), total, REPLY_HEADER_LEN, max_len)
    }

    fn sequence(&self, header: &[u8]) -> Option<u16> {
        uint16le(header, 2).ok()
    }
}

/// The client's connection setup prefix and authorization data.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientSetupFraming;

impl Framing for ClientSetupFraming {
    fn direction(&self) -> Direction {
        Direction::ClientToServer
    }

    fn header_len(&self) -> usize {
        CLIENT_SETUP_PREFIX_LEN
    }

    fn declared_len(&self, header: &[u8], max_len: usize) -> Result<HeaderStatus, RelayError> {
        let order = uint8(header, 0)?;
        if order != BYTE_ORDER_LSB {
            return Err(RelayError::UnsupportedByteOrder(order));
        }
        let auth_name = uint16le(header, 6)? as usize;
        let auth_data = uint16le(header, 8)? as usize;
        let total = CLIENT_SETUP_PREFIX_LEN + pad4(auth_name) + pad4(auth_data);
        checked_total(
            self.direction(),
            total as u64,
            CLIENT_SETUP_PREFIX_LEN,
            max_len,
        )
    }
}

/// The server's connection setup reply.
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerSetupFraming;

impl Framing for ServerSetupFraming {
    fn direction(&self) -> Direction {
        Direction::ServerToClient
    }

    fn header_len(&self) -> usize {
        SERVER_SETUP_PREFIX_LEN
    }

    fn declared_len(&self, header: &[u8], max_len: usize) -> Result<HeaderStatus, RelayError> {
        let status = uint8(header, 0)?;
        let additional = uint16le(header, 6)? as usize * UNIT;
        if status == 1 && additional < SERVER_SETUP_BASE_LEN {
            return Err(RelayError::MalformedLength {
                direction: self.direction(),
                declared: (SERVER_SETUP_PREFIX_LEN + additional) as u64,
                reason: "successful setup shorter than the fixed setup body",
                partial: Bytes::new(),
            });
        }
        checked_total(
            self.direction(),
            (SERVER_SETUP_PREFIX_LEN + additional) as u64,
            SERVER_SETUP_PREFIX_LEN,
            max_len,
        )
    }
}
