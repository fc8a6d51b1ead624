use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::ProxyConfig;
use crate::fields::hex_dump;
use crate::frame::{ReplyFraming, RequestFraming};
use crate::handshake::{relay_handshake, SetupStatus};
use crate::relay::{relay_replies, relay_requests};
use crate::types::RelayError;

/// TCP front end: accepts clients and relays each one to the upstream display server
pub struct ProxyServer {
    listener: TcpListener,
    config: Arc<ProxyConfig>,
}

impl ProxyServer {
    /// Bind to the configured listen address
    pub async fn bind(config: ProxyConfig) -> Result<Self, RelayError> {
        let listener = TcpListener::bind(&config.listen_addr).await?;
        info!(
            "xrelay bound to {}, upstream {}",
            config.listen_addr, config.upstream_addr
        );

        Ok(Self {
            listener,
            config: Arc::new(config),
        })
    }

    /// Get the local address this server is bound to
    pub fn local_addr(&self) -> Result<std::net::SocketAddr, RelayError> {
        self.listener.local_addr().map_err(RelayError::Io)
    }

    /// Accept connections until the process exits
    pub async fn run(self) -> Result<(), RelayError> {
        self.run_until(CancellationToken::new()).await
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// Connections already being relayed are left to finish on their own.
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<(), RelayError> {
        info!("xrelay accepting connections...");

        let mut next_conn = 0u64;
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };

            match accepted {
                Ok((socket, addr)) => {
                    next_conn += 1;
                    let conn = next_conn;
                    info!("conn {} accepted from {}", conn, addr);

                    let config = self.config.clone();
                    tokio::spawn(async move {
                        match handle_connection(conn, socket, &config).await {
                            Ok(()) => info!("conn {} closed", conn),
                            Err(e) => report_failure(conn, &e),
                        }
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                }
            }
        }

        info!("xrelay stopped accepting connections");
        Ok(())
    }
}

/// Open the upstream connection within the configured connect timeout
pub async fn connect_upstream(config: &ProxyConfig) -> Result<TcpStream, RelayError> {
    let addr = &config.upstream_addr;
    let stream =
        connect_within(addr, config.connect_timeout, TcpStream::connect(addr.as_str())).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

async fn connect_within<F, T>(addr: &str, limit: Duration, connect: F) -> Result<T, RelayError>
where
    F: Future<Output = std::io::Result<T>>,
{
    timeout(limit, connect)
        .await
        .map_err(|_| RelayError::ConnectTimeout {
            addr: addr.to_string(),
            timeout: limit,
        })?
        .map_err(|source| RelayError::Connect {
            addr: addr.to_string(),
            source,
        })
}

/// Relay one client connection until either direction ends.
pub async fn handle_connection(
    conn: u64,
    mut client: TcpStream,
    config: &ProxyConfig,
) -> Result<(), RelayError> {
    client.set_nodelay(true)?;
    let mut upstream = connect_upstream(config).await?;
    info!("conn {} connected to upstream {}", conn, config.upstream_addr);

    let limits = config.read_limits();
    let status = relay_handshake(conn, &mut client, &mut upstream, &limits).await?;
    if status != SetupStatus::Success {
        warn!("conn {} setup not accepted: {:?}", conn, status);
        return Ok(());
    }

    let (client_read, client_write) = client.into_split();
    let (upstream_read, upstream_write) = upstream.into_split();
    let requests = RequestFraming {
        big_requests: config.big_requests,
    };
    let replies = ReplyFraming {
        fixed_size_events: config.fixed_size_events,
    };

    // Whichever direction finishes first tears down both sockets.
    tokio::select! {
        result = relay_requests(conn, client_read, upstream_write, requests, limits) => {
            let requests = result?;
            info!("conn {} client side finished after {} requests", conn, requests);
        }
        result = relay_replies(conn, upstream_read, client_write, replies, limits) => {
            let messages = result?;
            info!("conn {} server side finished after {} messages", conn, messages);
        }
    }
    Ok(())
}

fn report_failure(conn: u64, err: &RelayError) {
    error!("conn {} dropped: {}", conn, err);
    if let Some(dump) = partial_dump(err) {
        error!("conn {} partial message: {}", conn, dump);
    }
}

/// Hex dump of the unfinished message carried by `err`, if any bytes were read.
fn partial_dump(err: &RelayError) -> Option<String> {
    err.partial()
        .filter(|partial| !partial.is_empty())
        .map(|partial| hex_dump(partial))
}
