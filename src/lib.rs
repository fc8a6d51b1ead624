//! # xrelay
//!
//! A transparent proxy for the X11 wire protocol. Bytes from the client are
//! forwarded unchanged to an upstream display server and vice versa, but the
//! stream is cut into whole protocol messages on the way through so that each
//! message is forwarded in one write and logged on its own.
//!
//! ## Quick Start
//!
//! ```no_run
//! use xrelay::{ProxyConfig, ProxyServer};
//!
//! # async fn start() -> Result<(), xrelay::RelayError> {
//! let config = ProxyConfig::new("0.0.0.0:6003", "127.0.0.1:6002");
//! let server = ProxyServer::bind(config).await?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Framing
//!
//! | Direction       | Header | Length field           | Total length                     |
//! |-----------------|--------|------------------------|----------------------------------|
//! | client → server | 4B     | CARD16 at offset 2     | `length * 4`                     |
//! | server → client | 8B     | CARD32 at offset 4     | `32 + length * 4`, errors `32`   |
//! | client setup    | 12B    | CARD16 at 6 and 8      | `12 + pad(name) + pad(data)`     |
//! | server setup    | 8B     | CARD16 at offset 6     | `8 + length * 4`                 |
//!
//! Once the first byte of a message arrives the rest of it must follow within
//! the body timeout (3 seconds by default) or the connection is dropped.
//! Failures only ever tear down the connection they happened on.

pub mod config;
pub mod fields;
pub mod frame;
pub mod handshake;
pub mod relay;
pub mod tcp;
pub mod types;

// Re-export main types for convenience
pub use config::{ProxyConfig, ReadLimits};
pub use frame::{Framing, HeaderStatus, ReplyFraming, RequestFraming};
pub use relay::{forward, read_packet, read_reply, read_request};
pub use tcp::ProxyServer;
pub use types::{Category, Direction, Packet, RelayError};
