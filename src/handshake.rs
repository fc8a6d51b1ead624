//! One-shot connection setup relay run before steady-state framing.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use crate::config::ReadLimits;
use crate::frame::{ClientSetupFraming, ServerSetupFraming};
use crate::relay::{forward, read_packet};
use crate::types::{Direction, RelayError, CLIENT_SETUP_PREFIX_LEN, SERVER_SETUP_PREFIX_LEN};

/// Status byte of the server's setup reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SetupStatus {
    Failed,
    Success,
    Authenticate,
    Unknown(u8),
}

impl From<u8> for SetupStatus {
    fn from(code: u8) -> Self {
        match code {
            0 => SetupStatus::Failed,
            1 => SetupStatus::Success,
            2 => SetupStatus::Authenticate,
            other => SetupStatus::Unknown(other),
        }
    }
}

/// Relay the client's setup request and the server's setup reply verbatim.
pub async fn relay_handshake<C, S>(
    conn: u64,
    client: &mut C,
    server: &mut S,
    limits: &ReadLimits,
) -> Result<SetupStatus, RelayError>
where
    C: AsyncRead + AsyncWrite + Unpin,
    S: AsyncRead + AsyncWrite + Unpin,
{
    let request = read_packet(client, &ClientSetupFraming, limits)
        .await?
        .ok_or(RelayError::PeerClosed {
            direction: Direction::ClientToServer,
            received: 0,
            expected: CLIENT_SETUP_PREFIX_LEN,
            partial: Bytes::new(),
        })?;
    forward(server, &request).await?;
    debug!("conn {} relayed client setup, length={}", conn, request.len());

    let reply = read_packet(server, &ServerSetupFraming, limits)
        .await?
        .ok_or(RelayError::PeerClosed {
            direction: Direction::ServerToClient,
            received: 0,
            expected: SERVER_SETUP_PREFIX_LEN,
            partial: Bytes::new(),
        })?;
    forward(client, &reply).await?;

    let status = SetupStatus::from(reply.code());
    info!(
        "conn {} relayed setup reply: {:?}, length={}",
        conn,
        status,
        reply.len()
    );
    Ok(status)
}
