//! Checksum-verified framing for the text command protocol.
//!
//! Wire format:
//! ```text
//! [STX 0x02][payload:N][ETX 0x03][lrc:1][\n]
//! ```
//! `lrc` is the XOR of every payload byte (a longitudinal redundancy check).
//! The trailing newline is a record terminator.  Decoding accepts a frame
//! that stops right after the checksum byte and ignores whatever follows the
//! terminator; any other byte after the checksum marks the frame invalid.
//!
//! # Known boundary
//!
//! A frame is assumed to occupy exactly one read on the receiving side.  Two
//! frames delivered in a single read decode as the first one (the rest is
//! ignored), and a frame split across two reads decodes as invalid.  Peers of
//! this protocol send one frame and then wait for its ACK, which keeps them
//! inside that assumption.
//!
//! Payloads must not contain the STX or ETX bytes.  That is a caller
//! contract and is not checked on encode.

use thiserror::Error;

/// Start-of-text marker opening every frame.
pub const STX: u8 = 0x02;
/// End-of-text marker closing the payload.
pub const ETX: u8 = 0x03;
/// Positive transport acknowledgment.
pub const ACK: u8 = 0x06;
/// Negative transport acknowledgment.
pub const NACK: u8 = 0x15;
/// Record terminator appended after the checksum byte.
pub const TERMINATOR: u8 = b'\n';

/// Reasons a received byte sequence is not a valid frame.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer is empty or its first byte is not [`STX`].
    #[error("frame does not start with STX")]
    MissingStart,

    /// No [`ETX`] byte follows the payload.
    #[error("frame has no ETX marker")]
    MissingEnd,

    /// The buffer ends right after [`ETX`], so there is no checksum byte.
    #[error("frame truncated after ETX")]
    MissingChecksum,

    /// Something other than the record terminator follows the checksum byte,
    /// which means the ETX found was not the real end marker.
    #[error("checksum byte not followed by the record terminator")]
    MissingTerminator,

    /// The checksum byte disagrees with the XOR of the payload.
    #[error("checksum mismatch: frame carries 0x{received:02X}, payload computes 0x{computed:02X}")]
    ChecksumMismatch { received: u8, computed: u8 },

    /// The payload is not valid UTF-8 text.
    #[error("payload is not valid UTF-8")]
    InvalidText,
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Computes the XOR checksum of `bytes`.
pub fn lrc(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc ^ b)
}

/// Wraps `payload` in a frame ready to be written to the wire.
///
/// # Examples
///
/// ```rust
/// use ev_core::protocol::frame::{decode_frame, encode_frame};
///
/// let frame = encode_frame("AUTH#ALC1");
/// assert_eq!(frame.first(), Some(&0x02));
/// assert_eq!(decode_frame(&frame).unwrap(), "AUTH#ALC1");
/// ```
pub fn encode_frame(payload: &str) -> Vec<u8> {
    let data = payload.as_bytes();
    let mut buf = Vec::with_capacity(data.len() + 4);
    buf.push(STX);
    buf.extend_from_slice(data);
    buf.push(ETX);
    buf.push(lrc(data));
    buf.push(TERMINATOR);
    buf
}

/// Extracts and verifies the payload of the frame at the start of `raw`.
///
/// # Errors
///
/// Returns [`FrameError`] when the frame is structurally broken or its
/// checksum does not match.  The caller answers such frames with a NACK.
pub fn decode_frame(raw: &[u8]) -> Result<String, FrameError> {
    if raw.first() != Some(&STX) {
        return Err(FrameError::MissingStart);
    }

    let end = raw[1..]
        .iter()
        .position(|&b| b == ETX)
        .map(|offset| offset + 1)
        .ok_or(FrameError::MissingEnd)?;

    let received = *raw.get(end + 1).ok_or(FrameError::MissingChecksum)?;
    if raw.get(end + 2).is_some_and(|&b| b != TERMINATOR) {
        return Err(FrameError::MissingTerminator);
    }
    let data = &raw[1..end];
    let computed = lrc(data);
    if received != computed {
        return Err(FrameError::ChecksumMismatch { received, computed });
    }

    String::from_utf8(data.to_vec()).map_err(|_| FrameError::InvalidText)
}
