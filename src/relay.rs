//! The framing engine: assemble one complete message from a byte stream and
//! forward it to the opposite endpoint.
//!
//! Every direction goes through [`read_packet`]. The first read of a message
//! waits as long as the peer stays idle; from the moment its first byte arrives
//! the whole message must be assembled within [`ReadLimits::body_timeout`]. A
//! message that misses the deadline fails the direction with
//! [`RelayError::ReadTimeout`] and is never forwarded.

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, trace};

use crate::config::ReadLimits;
use crate::fields::hex_dump;
use crate::frame::{Framing, HeaderStatus, ReplyFraming, RequestFraming};
use crate::types::{Direction, Packet, RelayError, UNIT};

/// Read exactly one message framed by `framing`.
///
/// Returns `Ok(None)` when the peer closes the stream on a message boundary.
pub async fn read_packet<R, F>(
    reader: &mut R,
    framing: &F,
    limits: &ReadLimits,
) -> Result<Option<Packet>, RelayError>
where
    R: AsyncRead + Unpin,
    F: Framing,
{
    let direction = framing.direction();
    let mut buf = BytesMut::zeroed(framing.header_len());

    let mut filled = reader.read(&mut buf[..]).await?;
    if filled == 0 {
        return Ok(None);
    }
    trace!("{} received {}/{}", direction, filled, buf.len());

    let deadline = Instant::now() + limits.body_timeout;
    let assembled = timeout_at(
        deadline,
        complete(reader, framing, limits.max_message_len, &mut buf, &mut filled),
    )
    .await;

    match assembled {
        Ok(result) => result?,
        Err(_) => {
            return Err(RelayError::ReadTimeout {
                direction,
                received: filled,
                expected: buf.len(),
                timeout: limits.body_timeout,
                partial: Bytes::copy_from_slice(&buf[..filled]),
            });
        }
    }

    let sequence = framing.sequence(&buf);
    Ok(Some(Packet::new(direction, sequence, buf.freeze())))
}

/// Finish the header, size the buffer to the declared length and fill it.
async fn complete<R, F>(
    reader: &mut R,
    framing: &F,
    max_len: usize,
    buf: &mut BytesMut,
    filled: &mut usize,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
    F: Framing,
{
    let direction = framing.direction();
    fill(reader, direction, buf, filled).await?;

    loop {
        let status = framing
            .declared_len(&buf[..], max_len)
            .map_err(|e| e.with_partial(&buf[..*filled]))?;
        match status {
            HeaderStatus::NeedHeader(len) if len > buf.len() => {
                buf.resize(len, 0);
                fill(reader, direction, buf, filled).await?;
            }
            HeaderStatus::NeedHeader(_) => {
                return Err(RelayError::MalformedLength {
                    direction,
                    declared: buf.len() as u64,
                    reason: "header did not resolve to a length",
                    partial: Bytes::copy_from_slice(&buf[..*filled]),
                });
            }
            HeaderStatus::Complete(total) => {
                if total > buf.len() {
                    buf.resize(total, 0);
                }
                return fill(reader, direction, buf, filled).await;
            }
        }
    }
}

async fn fill<R>(
    reader: &mut R,
    direction: Direction,
    buf: &mut BytesMut,
    filled: &mut usize,
) -> Result<(), RelayError>
where
    R: AsyncRead + Unpin,
{
    while *filled < buf.len() {
        let n = reader.read(&mut buf[*filled..]).await?;
        if n == 0 {
            return Err(RelayError::PeerClosed {
                direction,
                received: *filled,
                expected: buf.len(),
                partial: Bytes::copy_from_slice(&buf[..*filled]),
            });
        }
        *filled += n;
        trace!("{} received {}/{}", direction, filled, buf.len());
    }
    Ok(())
}

/// Write one complete packet to `writer`.
pub async fn forward<W>(writer: &mut W, packet: &Packet) -> Result<(), RelayError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(packet.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one client request.
pub async fn read_request<R>(
    reader: &mut R,
    framing: &RequestFraming,
    limits: &ReadLimits,
) -> Result<Option<Packet>, RelayError>
where
    R: AsyncRead + Unpin,
{
    read_packet(reader, framing, limits).await
}

/// Read one server reply, error or event.
pub async fn read_reply<R>(
    reader: &mut R,
    framing: &ReplyFraming,
    limits: &ReadLimits,
) -> Result<Option<Packet>, RelayError>
where
    R: AsyncRead + Unpin,
{
    read_packet(reader, framing, limits).await
}

/// Forward client requests to the server until the client closes.
///
/// Returns the number of requests relayed.
pub async fn relay_requests<R, W>(
    conn: u64,
    mut client: R,
    mut server: W,
    framing: RequestFraming,
    limits: ReadLimits,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut seq = 0u64;
    while let Some(packet) = read_request(&mut client, &framing, &limits).await? {
        forward(&mut server, &packet).await?;
        seq += 1;
        debug!(
            "conn {} request {}: opcode={}, length={}",
            conn,
            seq,
            packet.code(),
            packet.len() / UNIT
        );
    }
    debug!("conn {} client closed after {} requests", conn, seq);
    Ok(seq)
}

/// Forward server replies, errors and events to the client until the server closes.
///
/// Returns the number of messages relayed.
pub async fn relay_replies<R, W>(
    conn: u64,
    mut server: R,
    mut client: W,
    framing: ReplyFraming,
    limits: ReadLimits,
) -> Result<u64, RelayError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut count = 0u64;
    while let Some(packet) = read_reply(&mut server, &framing, &limits).await? {
        forward(&mut client, &packet).await?;
        count += 1;
        debug!(
            "conn {} {:?} seq={}: length={}",
            conn,
            packet.category(),
            packet.sequence().unwrap_or_default(),
            packet.len()
        );
        trace!("conn {} forwarded {}", conn, hex_dump(packet.as_bytes()));
    }
    debug!("conn {} server closed after {} messages", conn, count);
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio_test::io::Builder;
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl std::io::Write for Captured {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Captured {
        type Writer = Captured;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn reply(category: u8, seq: u16, units: u32, body_len: usize) -> Vec<u8> {
        let mut msg = vec![category, 0];
        msg.extend_from_slice(&seq.to_le_bytes());
        msg.extend_from_slice(&units.to_le_bytes());
        msg.extend((0..body_len).map(|i| i as u8));
        msg
    }

    async fn relay_all_requests<R>(
        client: &mut R,
        upstream: &mut Vec<u8>,
        limits: ReadLimits,
    ) -> Result<u64, RelayError>
    where
        R: AsyncRead + Unpin,
    {
        relay_requests(1, client, upstream, RequestFraming::default(), limits).await
    }

    async fn request(client: &mut tokio_test::io::Mock) -> Result<Option<Packet>, RelayError> {
        read_request(client, &RequestFraming::default(), &ReadLimits::default()).await
    }

    #[tokio::test]
    async fn request_split_across_reads_is_forwarded_whole() {
        let request = [55u8, 0, 3, 0, 1, 2, 3, 4, 5, 6, 7, 8];
        let mut client = Builder::new()
            .read(&request[..2])
            .read(&request[2..7])
            .read(&request[7..])
            .build();
        let mut upstream = Vec::new();

        let relayed = relay_all_requests(&mut client, &mut upstream, ReadLimits::default())
            .await
            .unwrap();

        assert_eq!(relayed, 1);
        assert_eq!(upstream, request);
    }

    #[tokio::test]
    async fn header_only_request() {
        let mut client = Builder::new().read(&[43, 0, 1, 0]).build();
        let packet = request(&mut client).await.unwrap().unwrap();
        assert_eq!(packet.as_bytes(), &[43, 0, 1, 0]);
        assert_eq!(packet.code(), 43);
        assert_eq!(packet.sequence(), None);
    }

    #[tokio::test]
    async fn big_request_reads_extended_length() {
        let mut bytes = vec![72u8, 2, 0, 0, 3, 0, 0, 0];
        bytes.extend_from_slice(&[9, 9, 9, 9]);
        let mut client = Builder::new().read(&bytes[..6]).read(&bytes[6..]).build();
        let packet = request(&mut client).await.unwrap().unwrap();
        assert_eq!(packet.as_bytes(), &bytes[..]);
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_request_times_out_without_forwarding() {
        let bytes = [55u8, 0, 4, 0, 1, 2, 3, 4, 5, 6];
        let mut client = Builder::new()
            .read(&bytes)
            .wait(Duration::from_secs(10))
            .build();
        let mut upstream = Vec::new();

        let err = relay_all_requests(&mut client, &mut upstream, ReadLimits::default())
            .await
            .unwrap_err();

        match err {
            RelayError::ReadTimeout {
                direction,
                received,
                expected,
                partial,
                ..
            } => {
                assert_eq!(direction, Direction::ClientToServer);
                assert_eq!(received, 10);
                assert_eq!(expected, 16);
                assert_eq!(&partial[..], &bytes[..]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(upstream.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn reply_assembled_from_delayed_chunks() {
        let msg = reply(1, 4, 5, 44);
        assert_eq!(msg.len(), 52);
        let mut server = Builder::new()
            .read(&msg[..3])
            .wait(Duration::from_millis(500))
            .read(&msg[3..12])
            .wait(Duration::from_millis(900))
            .read(&msg[12..])
            .build();
        let mut client = Vec::new();

        let relayed = relay_replies(
            1,
            &mut server,
            &mut client,
            ReplyFraming::default(),
            ReadLimits::default(),
        )
        .await
        .unwrap();

        assert_eq!(relayed, 1);
        assert_eq!(client, msg);
    }

    #[tokio::test]
    async fn error_ignores_length_field() {
        let mut msg = reply(0, 2, 0xdead_beef, 24);
        msg.extend_from_slice(&reply(1, 3, 0, 24));
        let mut server = Builder::new().read(&msg).build();
        let limits = ReadLimits::default();
        let framing = ReplyFraming::default();

        let error = read_reply(&mut server, &framing, &limits).await.unwrap().unwrap();
        assert_eq!(error.len(), 32);
        assert_eq!(error.sequence(), Some(2));

        let next = read_reply(&mut server, &framing, &limits).await.unwrap().unwrap();
        assert_eq!(next.sequence(), Some(3));
        assert!(read_reply(&mut server, &framing, &limits).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn stalled_reply_times_out_without_forwarding() {
        let msg = reply(1, 8, 5, 44);
        let mut server = Builder::new()
            .read(&msg[..20])
            .wait(Duration::from_secs(10))
            .build();
        let mut client = Vec::new();

        let err = relay_replies(
            1,
            &mut server,
            &mut client,
            ReplyFraming::default(),
            ReadLimits::default(),
        )
        .await
        .unwrap_err();

        match err {
            RelayError::ReadTimeout {
                direction,
                received,
                expected,
                partial,
                ..
            } => {
                assert_eq!(direction, Direction::ServerToClient);
                assert_eq!(received, 20);
                assert_eq!(expected, 52);
                assert_eq!(&partial[..], &msg[..20]);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(client.is_empty());
    }

    #[tokio::test]
    async fn eof_mid_message_keeps_received_bytes() {
        let msg = [1u8, 0, 1, 0, 2, 0, 0, 0, 0xde, 0xad, 0xbe, 0xef];
        let mut server = Builder::new().read(&msg).build();
        let err = read_reply(&mut server, &ReplyFraming::default(), &ReadLimits::default())
            .await
            .unwrap_err();

        match err {
            RelayError::PeerClosed {
                direction,
                received,
                expected,
                partial,
            } => {
                assert_eq!(direction, Direction::ServerToClient);
                assert_eq!(received, 12);
                assert_eq!(expected, 40);
                assert_eq!(&partial[..], &msg[..]);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn malformed_reply_length_keeps_header() {
        let header = [1u8, 0, 1, 0, 0xff, 0xff, 0xff, 0xff];
        let mut server = Builder::new().read(&header).build();
        let err = read_reply(&mut server, &ReplyFraming::default(), &ReadLimits::default())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            RelayError::MalformedLength {
                declared: 17179869212,
                ..
            }
        ));
        assert_eq!(err.partial().map(|b| &b[..]), Some(&header[..]));
    }

    #[tokio::test]
    async fn oversized_request_is_rejected_before_reading_body() {
        let mut client = Builder::new().read(&[1, 0, 0xff, 0xff]).build();
        let limits = ReadLimits {
            max_message_len: 1024,
            ..ReadLimits::default()
        };
        let mut upstream = Vec::new();
        let err = relay_all_requests(&mut client, &mut upstream, limits)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::MalformedLength { .. }));
        assert!(upstream.is_empty());
    }

    #[tokio::test]
    async fn requests_forwarded_in_order() {
        let first = [1u8, 0, 2, 0, 0xaa, 0xbb, 0xcc, 0xdd];
        let second = [2u8, 0, 1, 0];
        let mut stream = first.to_vec();
        stream.extend_from_slice(&second);
        let mut client = Builder::new().read(&stream).build();
        let mut upstream = Vec::new();

        let relayed = relay_all_requests(&mut client, &mut upstream, ReadLimits::default())
            .await
            .unwrap();
        assert_eq!(relayed, 2);
        assert_eq!(upstream, stream);
    }

    #[tokio::test]
    async fn header_arrival_and_forwarded_reply_are_traced() {
        let captured = Captured::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::TRACE)
            .with_ansi(false)
            .with_writer(captured.clone())
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        let msg = reply(1, 1, 0, 24);
        let mut server = Builder::new().read(&msg).build();
        let mut client = Vec::new();
        relay_replies(
            7,
            &mut server,
            &mut client,
            ReplyFraming::default(),
            ReadLimits::default(),
        )
        .await
        .unwrap();

        let logs = String::from_utf8(captured.0.lock().unwrap().clone()).unwrap();
        assert!(logs.contains("server->client received 8/8"));
        assert!(logs.contains("server->client received 32/32"));
        assert!(logs.contains("conn 7 forwarded length=32"));
        assert!(logs.contains("000000: 01 00 01 00"));
    }
}
