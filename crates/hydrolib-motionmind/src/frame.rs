//! MotionMind 3 frame encoder/decoder.
//!
//! The controller uses fixed-layout binary frames on a half-duplex serial
//! bus (bridged to TCP in the field). This module handles the pure
//! byte-level encoding: frame construction, the additive checksum, and
//! little-endian register value conversion.
//!
//! # Frame format
//!
//! ```text
//! <cmd> <address> [<payload>...] <checksum>
//! ```
//!
//! - `cmd`: command byte (see the `command` constants)
//! - `address`: device address on the bus (1 unless rewired)
//! - `payload`: command-dependent, fixed length per command kind
//! - `checksum`: 8-bit sum of all preceding bytes, overflow discarded
//!
//! Replies use the same trailing checksum; a successful command reply
//! leads with [`ACK`] or with the echoed device address.

use bytes::{BufMut, BytesMut};

/// Positive acknowledgement byte leading a successful reply.
pub const ACK: u8 = 0x06;

/// Command bytes for the binary interface.
pub mod command {
    /// Change velocity while a move is in progress (16-bit payload).
    pub const CHANGE_SPEED: u8 = 0x14;
    /// Move to an absolute position (32-bit payload).
    pub const MOVE_ABSOLUTE: u8 = 0x15;
    /// Move relative to the current position (32-bit payload).
    pub const MOVE_RELATIVE: u8 = 0x16;
    /// Move at a constant velocity (16-bit payload).
    pub const MOVE_AT: u8 = 0x17;
    /// Write a register (payload: position + value).
    pub const WRITE: u8 = 0x18;
    /// Write a register and store to EEPROM (payload: position + value).
    pub const WRITE_STORE: u8 = 0x19;
    /// Batched register read (payload: 32-bit register bitmask).
    pub const READ: u8 = 0x1A;
    /// Restore factory defaults from EEPROM.
    pub const RESTORE: u8 = 0x1B;
    /// Reset the controller.
    pub const RESET: u8 = 0x1C;
    /// Read a single register (payload: position).
    pub const READ_REGISTER: u8 = 0x1D;
}

/// 8-bit additive checksum over `bytes` (overflow discarded).
pub fn checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |sum, b| sum.wrapping_add(*b))
}

/// Build a complete frame: command, address, payload, trailing checksum.
pub fn build_frame(cmd: u8, address: u8, payload: &[u8]) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(2 + payload.len() + 1);
    buf.put_u8(cmd);
    buf.put_u8(address);
    buf.put_slice(payload);
    buf.put_u8(checksum(&buf));
    buf.to_vec()
}

/// Verify the trailing checksum of a frame or reply.
///
/// A frame shorter than two bytes cannot carry a checksum and never
/// verifies.
pub fn verify(frame: &[u8]) -> bool {
    match frame.split_last() {
        Some((last, body)) if !body.is_empty() => checksum(body) == *last,
        _ => false,
    }
}

/// Encode a register value as little-endian bytes of the given width.
///
/// The value is truncated to the register's width; the controller ignores
/// bits a register cannot hold.
pub fn encode_value(value: i32, width: usize) -> Vec<u8> {
    (0..width).map(|i| (value >> (8 * i)) as u8).collect()
}

/// Decode little-endian bytes into a sign-extended register value.
pub fn decode_value(bytes: &[u8]) -> i32 {
    let mut value: u32 = 0;
    for (i, b) in bytes.iter().enumerate() {
        value |= (*b as u32) << (8 * i);
    }
    let bits = 8 * bytes.len() as u32;
    if bits >= 32 {
        value as i32
    } else {
        // Shift up and back down arithmetically to sign-extend.
        ((value << (32 - bits)) as i32) >> (32 - bits)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn checksum_is_modulo_256_sum() {
        assert_eq!(checksum(&[0x18, 0x01, 0x04, 0xE8, 0x03]), 0x08);
        assert_eq!(checksum(&[0xFF, 0x01]), 0x00);
        assert_eq!(checksum(&[]), 0x00);
    }

    #[test]
    fn build_appends_checksum_last() {
        let frame = build_frame(command::READ_REGISTER, 1, &[3]);
        assert_eq!(frame, vec![0x1D, 0x01, 0x03, 0x21]);
        assert_eq!(*frame.last().unwrap(), checksum(&frame[..frame.len() - 1]));
    }

    #[test]
    fn built_frames_verify() {
        let frames = [
            build_frame(command::MOVE_AT, 1, &encode_value(250, 2)),
            build_frame(command::RESET, 1, &[]),
            build_frame(command::WRITE, 1, &[4, 0xE8, 0x03]),
        ];
        for frame in &frames {
            assert!(verify(frame), "frame {frame:02X?} failed to verify");
        }
    }

    #[test]
    fn any_single_byte_corruption_fails_verify() {
        let frame = build_frame(command::WRITE, 1, &[4, 0xE8, 0x03]);
        for i in 0..frame.len() {
            let mut corrupted = frame.clone();
            corrupted[i] ^= 0x40;
            assert!(
                !verify(&corrupted),
                "corruption at byte {i} went undetected"
            );
        }
    }

    #[test]
    fn verify_rejects_short_input() {
        assert!(!verify(&[]));
        assert!(!verify(&[0x06]));
    }

    #[test]
    fn encode_is_little_endian() {
        assert_eq!(encode_value(1000, 2), vec![0xE8, 0x03]);
        assert_eq!(encode_value(1, 4), vec![0x01, 0x00, 0x00, 0x00]);
        assert_eq!(encode_value(-1, 2), vec![0xFF, 0xFF]);
    }

    #[test]
    fn decode_sign_extends() {
        assert_eq!(decode_value(&[0xFF]), -1);
        assert_eq!(decode_value(&[0xFF, 0xFF]), -1);
        assert_eq!(decode_value(&[0xFF, 0x7F]), 32767);
        assert_eq!(decode_value(&[0x00, 0x80]), -32768);
        assert_eq!(decode_value(&[0xE8, 0x03]), 1000);
    }

    #[test]
    fn value_round_trip_at_every_width() {
        for &(value, width) in &[
            (0i32, 1),
            (127, 1),
            (-128, 1),
            (32767, 2),
            (-32768, 2),
            (1000, 2),
            (i32::MAX, 4),
            (i32::MIN, 4),
            (-250, 4),
        ] {
            assert_eq!(
                decode_value(&encode_value(value, width)),
                value,
                "round trip failed for {value} at width {width}"
            );
        }
    }
}
