//! Core types for the relay engine: directions, packets and the error taxonomy.

use std::fmt;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;

/// Size of one protocol length unit in bytes.
pub const UNIT: usize = 4;

/// Request header: opcode, data byte, 16-bit length in units.
pub const REQUEST_HEADER_LEN: usize = 4;

/// Extra header bytes carried by a BIG-REQUESTS request (32-bit length in units).
pub const BIG_REQUEST_EXTRA_LEN: usize = 4;

/// Bytes of reply header read before the total length is known.
pub const REPLY_HEADER_LEN: usize = 8;

/// Fixed total size of errors, events and the base of every reply.
pub const REPLY_BASE_LEN: usize = 32;

/// Client connection setup prefix.
pub const CLIENT_SETUP_PREFIX_LEN: usize = 12;

/// Server connection setup reply prefix.
pub const SERVER_SETUP_PREFIX_LEN: usize = 8;

/// Fixed part of a successful server setup body.
pub const SERVER_SETUP_BASE_LEN: usize = 32;

/// Which way a packet travels through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client to upstream server.
    ClientToServer,
    /// Upstream server to client.
    ServerToClient,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::ClientToServer => f.write_str("client->server"),
            Direction::ServerToClient => f.write_str("server->client"),
        }
    }
}

/// Reply-side category, taken from byte 0 of a server message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Error,
    Reply,
    Event(u8),
}

impl From<u8> for Category {
    fn from(code: u8) -> Self {
        match code {
            0 => Category::Error,
            1 => Category::Reply,
            other => Category::Event(other),
        }
    }
}

/// Exactly one complete protocol message, immutable once assembled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    direction: Direction,
    sequence: Option<u16>,
    data: Bytes,
}

impl Packet {
    pub(crate) fn new(direction: Direction, sequence: Option<u16>, data: Bytes) -> Self {
        Self {
            direction,
            sequence,
            data,
        }
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Opcode (requests) or category code (server messages) at offset 0.
    pub fn code(&self) -> u8 {
        self.data.first().copied().unwrap_or_default()
    }

    /// Reply-side category; meaningful only for server-to-client packets.
    pub fn category(&self) -> Category {
        Category::from(self.code())
    }

    /// Wire sequence number, present on server-to-client packets.
    pub fn sequence(&self) -> Option<u16> {
        self.sequence
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn into_bytes(self) -> Bytes {
        self.data
    }
}

/// Errors that end a proxied connection.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("failed to connect to upstream {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("timed out connecting to upstream {addr} after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("{direction} message incomplete after {timeout:?}: received {received} of {expected} bytes")]
    ReadTimeout {
        direction: Direction,
        received: usize,
        expected: usize,
        timeout: Duration,
        /// Bytes accumulated before the deadline passed.
        partial: Bytes,
    },

    #[error("{direction} header declares a malformed length of {declared} bytes: {reason}")]
    MalformedLength {
        direction: Direction,
        declared: u64,
        reason: &'static str,
        /// Header bytes read before the length was rejected.
        partial: Bytes,
    },

    #[error("unsupported byte order marker {0:#04x}")]
    UnsupportedByteOrder(u8),

    #[error("{direction} peer closed mid-message: received {received} of {expected} bytes")]
    PeerClosed {
        direction: Direction,
        received: usize,
        expected: usize,
        /// Bytes of the unfinished message.
        partial: Bytes,
    },

    #[error("field of {width} bytes at offset {offset} is out of range for a {len}-byte buffer")]
    OutOfRange {
        offset: usize,
        width: usize,
        len: usize,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RelayError {
    /// Bytes of the message being assembled when the error occurred, if any.
    pub fn partial(&self) -> Option<&Bytes> {
        match self {
            RelayError::ReadTimeout { partial, .. }
            | RelayError::MalformedLength { partial, .. }
            | RelayError::PeerClosed { partial, .. } => Some(partial),
            _ => None,
        }
    }

    /// Attach the bytes read so far to a length or closure error.
    pub(crate) fn with_partial(mut self, bytes: &[u8]) -> Self {
        if let RelayError::MalformedLength { partial, .. } | RelayError::PeerClosed { partial, .. } =
            &mut self
        {
            *partial = Bytes::copy_from_slice(bytes);
        }
        self
    }
}
