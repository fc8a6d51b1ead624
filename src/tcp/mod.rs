//! TCP listener and per-connection supervision.

mod server;

pub use server::{connect_upstream, handle_connection, ProxyServer};
