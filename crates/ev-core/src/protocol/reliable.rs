//! Acknowledged request/response primitives on top of the frame codec.
//!
//! Every framed message is confirmed by the receiver with one raw byte:
//! [`ACK`] when the frame decoded cleanly, [`NACK`] otherwise.  The two
//! halves of that contract are:
//!
//! - [`send_and_await_ack`] – write a frame, then wait (bounded) for the
//!   single confirmation byte.
//! - [`receive_and_ack`] – read one frame, decode it, and answer ACK/NACK.
//!
//! There is no retry here.  A failed exchange means "not confirmed", which is
//! not the same as "not delivered"; callers that need at-least-once delivery
//! re-send on their own cadence (monitors re-send `AUTH` as a heartbeat).
//!
//! Reads assume one frame per read; see [`crate::protocol::frame`].
//!
//! Both functions are generic over tokio's byte-stream traits, so they work
//! with `TcpStream`, `tokio::io::DuplexStream`, and `tokio_test::io::Mock`.

use std::time::Duration;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::debug;

use crate::protocol::frame::{decode_frame, encode_frame, FrameError, ACK, NACK};

/// Size of the buffer used for a single frame read.
pub const READ_CHUNK: usize = 4096;

/// Reply timeout used when a caller has no configured value.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

/// Failures of a single acknowledged exchange.
#[derive(Debug, Error)]
pub enum ExchangeError {
    #[error("stream I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("no data within {0:?}")]
    Timeout(Duration),

    #[error("peer rejected the frame (NACK)")]
    Nack,

    #[error("peer answered 0x{0:02X} instead of ACK")]
    UnexpectedReply(u8),

    #[error("peer closed the stream")]
    Closed,
}

/// Outcome of decoding one received frame.
///
/// A corrupt frame is not an error of the exchange itself: it has already
/// been answered with NACK and the connection stays usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(String),
    Corrupt(FrameError),
}

impl Inbound {
    /// `true` when the frame decoded and was acknowledged with ACK.
    pub fn is_valid(&self) -> bool {
        matches!(self, Inbound::Frame(_))
    }

    /// The decoded payload, if the frame was valid.
    pub fn payload(&self) -> Option<&str> {
        match self {
            Inbound::Frame(p) => Some(p),
            Inbound::Corrupt(_) => None,
        }
    }
}

// ── Sender side ───────────────────────────────────────────────────────────────

/// Writes `payload` as a frame and waits up to `wait` for the confirmation byte.
///
/// # Errors
///
/// - [`ExchangeError::Nack`] / [`ExchangeError::UnexpectedReply`] when the
///   peer answers with anything but ACK.
/// - [`ExchangeError::Timeout`] when no byte arrives in time.
/// - [`ExchangeError::Closed`] / [`ExchangeError::Io`] on stream failure.
pub async fn send_and_await_ack<S>(
    stream: &mut S,
    payload: &str,
    wait: Duration,
) -> Result<(), ExchangeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    stream.write_all(&encode_frame(payload)).await?;
    stream.flush().await?;

    let mut reply = [0u8; 1];
    let n = timeout(wait, stream.read(&mut reply))
        .await
        .map_err(|_| ExchangeError::Timeout(wait))??;
    if n == 0 {
        return Err(ExchangeError::Closed);
    }

    match reply[0] {
        ACK => Ok(()),
        NACK => Err(ExchangeError::Nack),
        other => Err(ExchangeError::UnexpectedReply(other)),
    }
}

// ── Receiver side ─────────────────────────────────────────────────────────────

/// Reads whatever bytes are available (up to [`READ_CHUNK`]) within `wait`.
///
/// Cancel-safe: dropping the future before it completes consumes nothing,
/// which lets connection loops race it against an outbound queue.
///
/// # Errors
///
/// [`ExchangeError::Closed`] on EOF, [`ExchangeError::Timeout`] when idle.
pub async fn read_chunk<R>(reader: &mut R, wait: Duration) -> Result<Vec<u8>, ExchangeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_CHUNK];
    let n = timeout(wait, reader.read(&mut buf))
        .await
        .map_err(|_| ExchangeError::Timeout(wait))??;
    if n == 0 {
        return Err(ExchangeError::Closed);
    }
    buf.truncate(n);
    Ok(buf)
}

/// Decodes `raw` and answers ACK when it is a valid frame, NACK otherwise.
///
/// # Errors
///
/// Only fails when writing the confirmation byte fails.
pub async fn acknowledge<W>(writer: &mut W, raw: &[u8]) -> Result<Inbound, ExchangeError>
where
    W: AsyncWrite + Unpin,
{
    let inbound = match decode_frame(raw) {
        Ok(payload) => Inbound::Frame(payload),
        Err(e) => Inbound::Corrupt(e),
    };
    if let Inbound::Corrupt(e) = &inbound {
        debug!("answering NACK to {} byte(s): {e}", raw.len());
    }
    let reply = if inbound.is_valid() { ACK } else { NACK };
    writer.write_all(&[reply]).await?;
    writer.flush().await?;
    Ok(inbound)
}

/// Reads one frame within `wait` and confirms it.
///
/// The decoded result is returned even when it was NACKed so the caller can
/// log it.
///
/// # Errors
///
/// Propagates the errors of [`read_chunk`] and [`acknowledge`].
pub async fn receive_and_ack<S>(stream: &mut S, wait: Duration) -> Result<Inbound, ExchangeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let raw = read_chunk(stream, wait).await?;
    acknowledge(stream, &raw).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::duplex;
    use tokio_test::io::Builder;

    const SHORT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_send_succeeds_on_ack() {
        // Arrange
        let mut stream = Builder::new()
            .write(&encode_frame("AUTH#ALC1"))
            .read(&[ACK])
            .build();

        // Act
        let result = send_and_await_ack(&mut stream, "AUTH#ALC1", SHORT).await;

        // Assert
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_send_fails_on_nack() {
        let mut stream = Builder::new()
            .write(&encode_frame("AUTH#ALC1"))
            .read(&[NACK])
            .build();

        let result = send_and_await_ack(&mut stream, "AUTH#ALC1", SHORT).await;
        assert!(matches!(result, Err(ExchangeError::Nack)));
    }

    #[tokio::test]
    async fn test_send_fails_on_any_other_byte() {
        let mut stream = Builder::new()
            .write(&encode_frame("AUTH#ALC1"))
            .read(b"X")
            .build();

        let result = send_and_await_ack(&mut stream, "AUTH#ALC1", SHORT).await;
        assert!(matches!(result, Err(ExchangeError::UnexpectedReply(b'X'))));
    }

    #[tokio::test]
    async fn test_send_times_out_when_peer_stays_silent() {
        // Arrange – keep the far end alive but never answer.
        let (mut near, _far) = duplex(256);

        // Act
        let result = send_and_await_ack(&mut near, "AUTH#ALC1", SHORT).await;

        // Assert
        assert!(matches!(result, Err(ExchangeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_send_reports_closed_when_peer_hangs_up() {
        // Arrange – the far end reads the frame and then drops.
        let (mut near, mut far) = duplex(256);
        let reader = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let _ = far.read(&mut buf).await;
        });

        // Act
        let result = send_and_await_ack(&mut near, "AUTH#ALC1", Duration::from_secs(2)).await;
        reader.await.unwrap();

        // Assert
        assert!(matches!(result, Err(ExchangeError::Closed)));
    }

    #[tokio::test]
    async fn test_receive_acks_valid_frame() {
        // Arrange
        let mut stream = Builder::new()
            .read(&encode_frame("REQ#D1#ALC1"))
            .write(&[ACK])
            .build();

        // Act
        let inbound = receive_and_ack(&mut stream, SHORT).await.unwrap();

        // Assert
        assert_eq!(inbound, Inbound::Frame("REQ#D1#ALC1".to_string()));
        assert_eq!(inbound.payload(), Some("REQ#D1#ALC1"));
    }

    #[tokio::test]
    async fn test_receive_nacks_corrupt_frame() {
        // Arrange
        let mut corrupt = encode_frame("REQ#D1#ALC1");
        corrupt[3] ^= 0x01;
        let mut stream = Builder::new().read(&corrupt).write(&[NACK]).build();

        // Act
        let inbound = receive_and_ack(&mut stream, SHORT).await.unwrap();

        // Assert
        assert!(!inbound.is_valid());
        assert!(matches!(
            inbound,
            Inbound::Corrupt(FrameError::ChecksumMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_receive_reports_closed_on_eof() {
        let (mut near, far) = duplex(64);
        drop(far);

        let result = receive_and_ack(&mut near, SHORT).await;
        assert!(matches!(result, Err(ExchangeError::Closed)));
    }

    #[tokio::test]
    async fn test_receive_times_out_when_idle() {
        let (mut near, _far) = duplex(64);

        let result = receive_and_ack(&mut near, SHORT).await;
        assert!(matches!(result, Err(ExchangeError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_exchange_over_duplex_end_to_end() {
        // Arrange
        let (mut sender, mut receiver) = duplex(256);
        let server = tokio::spawn(async move { receive_and_ack(&mut receiver, SHORT * 20).await });

        // Act
        let sent = send_and_await_ack(&mut sender, "FINISH#ALC1#D1", SHORT * 20).await;
        let received = server.await.unwrap().unwrap();

        // Assert
        assert!(sent.is_ok());
        assert_eq!(received.payload(), Some("FINISH#ALC1#D1"));
    }

    #[test]
    fn test_corrupt_inbound_clones_with_its_reason() {
        let inbound = Inbound::Corrupt(FrameError::MissingEnd);

        let copy = inbound.clone();

        assert_eq!(copy, inbound);
        assert_eq!(copy.payload(), None);
    }
}
