//! Integration tests for frame integrity guarantees.
//!
//! # Purpose
//!
//! These tests exercise the codec through the crate's public API the way the
//! transports use it, checking the two properties the reliability protocol
//! rests on:
//!
//! - **Round-trip**: any payload free of STX/ETX decodes back to itself.
//! - **Corruption detection**: flipping any single payload byte makes the
//!   frame invalid, so the receiver answers NACK instead of acting on it.

use ev_core::protocol::command::FramedCommand;
use ev_core::protocol::frame::{decode_frame, encode_frame, FrameError, ETX, STX};

fn sample_payloads() -> Vec<String> {
    let mut payloads: Vec<String> = [
        "",
        "A",
        "AUTH#ALC1",
        "FAULT#ALC1#overheat above 90C",
        "REQ#driver-0042#MAD-CENTRO-07",
        "FINISH#ALC1#D1",
        "AUTH_GRANTED#ALC1#D1#RECONNECT",
        "ñandú ünïcødé #€",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    payloads.push("x".repeat(1024));
    payloads
}

#[test]
fn test_round_trip_preserves_every_sample_payload() {
    for payload in sample_payloads() {
        // Arrange
        let frame = encode_frame(&payload);

        // Act
        let decoded = decode_frame(&frame);

        // Assert
        assert_eq!(decoded.as_deref(), Ok(payload.as_str()), "payload {payload:?}");
    }
}

#[test]
fn test_flipping_any_payload_byte_is_detected() {
    for payload in sample_payloads().into_iter().filter(|p| !p.is_empty()) {
        let frame = encode_frame(&payload);
        let payload_range = 1..=payload.len();

        for index in payload_range {
            for mask in [0x01u8, 0x20, 0x80] {
                // Arrange
                let mut corrupt = frame.clone();
                corrupt[index] ^= mask;

                // Act
                let result = decode_frame(&corrupt);

                // Assert
                assert!(
                    result.is_err(),
                    "payload {payload:?} byte {index} mask {mask:#04x} decoded as {result:?}"
                );
            }
        }
    }
}

#[test]
fn test_structural_damage_is_classified() {
    let frame = encode_frame("AUTH#ALC1");

    // Leading marker replaced.
    let mut no_start = frame.clone();
    no_start[0] = b'X';
    assert_eq!(decode_frame(&no_start), Err(FrameError::MissingStart));

    // End marker removed together with everything after it.
    let end = frame.iter().position(|&b| b == ETX).unwrap();
    assert_eq!(decode_frame(&frame[..end]), Err(FrameError::MissingEnd));

    // Cut right after the end marker.
    assert_eq!(decode_frame(&frame[..=end]), Err(FrameError::MissingChecksum));
    assert_eq!(frame[0], STX);
}

#[test]
fn test_decoded_payload_parses_as_command() {
    let frame = encode_frame(&FramedCommand::Request {
        driver_id: "D1".to_string(),
        cp_id: "ALC1".to_string(),
    }
    .render());

    let payload = decode_frame(&frame).unwrap();
    let command = FramedCommand::parse(&payload).unwrap();

    assert_eq!(command.identity(), "D1");
}
