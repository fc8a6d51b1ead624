//! Proxy configuration.

use std::time::Duration;

/// Default port the proxy listens on.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:6003";

/// Default upstream display server.
pub const DEFAULT_UPSTREAM_ADDR: &str = "127.0.0.1:6002";

/// Largest message accepted in either direction (4M length units).
pub const DEFAULT_MAX_MESSAGE_LEN: usize = 16 * 1024 * 1024;

/// Configuration handed to the proxy server at construction.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Address to accept client connections on
    pub listen_addr: String,
    /// Display server every accepted client is relayed to
    pub upstream_addr: String,
    /// Upper bound on establishing the upstream connection
    pub connect_timeout: Duration,
    /// Time a message may take to complete once its first byte has arrived
    pub body_timeout: Duration,
    /// Largest declared message length accepted before the connection is dropped
    pub max_message_len: usize,
    /// Frame core events as fixed 32-byte messages
    pub fixed_size_events: bool,
    /// Accept zero-length requests as BIG-REQUESTS
    pub big_requests: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            upstream_addr: DEFAULT_UPSTREAM_ADDR.to_string(),
            connect_timeout: Duration::from_secs(2),
            body_timeout: Duration::from_secs(3),
            max_message_len: DEFAULT_MAX_MESSAGE_LEN,
            fixed_size_events: false,
            big_requests: true,
        }
    }
}

impl ProxyConfig {
    pub fn new(listen_addr: impl Into<String>, upstream_addr: impl Into<String>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            upstream_addr: upstream_addr.into(),
            ..Self::default()
        }
    }

    pub fn with_body_timeout(mut self, timeout: Duration) -> Self {
        self.body_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_message_len(mut self, max_len: usize) -> Self {
        self.max_message_len = max_len;
        self
    }

    pub fn with_fixed_size_events(mut self, enabled: bool) -> Self {
        self.fixed_size_events = enabled;
        self
    }

    pub fn with_big_requests(mut self, enabled: bool) -> Self {
        self.big_requests = enabled;
        self
    }

    /// Limits applied by the framing engine to every message.
    pub fn read_limits(&self) -> ReadLimits {
        ReadLimits {
            body_timeout: self.body_timeout,
            max_message_len: self.max_message_len,
        }
    }
}

/// Per-message bounds for [`crate::relay::read_packet`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadLimits {
    pub body_timeout: Duration,
    pub max_message_len: usize,
}

impl Default for ReadLimits {
    fn default() -> Self {
        ProxyConfig::default().read_limits()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_display_proxy_setup() {
        let config = ProxyConfig::default();
        assert_eq!(config.listen_addr, "0.0.0.0:6003");
        assert_eq!(config.upstream_addr, "127.0.0.1:6002");
        assert_eq!(config.read_limits().body_timeout, Duration::from_secs(3));
        assert!(!config.fixed_size_events);
        assert!(config.big_requests);
    }

    #[test]
    fn builders_override_limits() {
        let limits = ProxyConfig::new("127.0.0.1:0", "127.0.0.1:1")
            .with_body_timeout(Duration::from_millis(250))
            .with_max_message_len(4096)
            .read_limits();
        assert_eq!(
            limits,
            ReadLimits {
                body_timeout: Duration::from_millis(250),
                max_message_len: 4096,
            }
        );
    }
}
