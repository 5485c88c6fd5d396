//! Device wire format.
//!
//! ```text
//! AA 55 | led_count: u16 LE | payload: led_count * 3 bytes | checksum: u16 LE
//! ```
//!
//! The checksum is the sum of the payload bytes modulo 65536. Header and count
//! are not covered.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::show::model::Rgb;

pub const HEADER: [u8; 2] = [0xAA, 0x55];
/// Header + count + checksum
pub const OVERHEAD: usize = 6;

/// Channel order the LED driver expects on the wire.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ColorOrder {
    Rgb,
    #[default]
    Grb,
    Brg,
    Rbg,
    Gbr,
    Bgr,
}

impl ColorOrder {
    pub fn arrange(self, [r, g, b]: Rgb) -> [u8; 3] {
        match self {
            ColorOrder::Rgb => [r, g, b],
            ColorOrder::Grb => [g, r, b],
            ColorOrder::Brg => [b, r, g],
            ColorOrder::Rbg => [r, b, g],
            ColorOrder::Gbr => [g, b, r],
            ColorOrder::Bgr => [b, g, r],
        }
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet too short ({0} bytes)")]
    Truncated(usize),

    #[error("bad header {0:02X?}")]
    BadHeader([u8; 2]),

    #[error("length mismatch: header says {expected} LEDs, payload has {actual} bytes")]
    Length { expected: usize, actual: usize },

    #[error("checksum mismatch: expected {expected:#06X}, computed {actual:#06X}")]
    Checksum { expected: u16, actual: u16 },
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FramePacket {
    pub led_count: u16,
    /// Already in device color order
    pub payload: Vec<u8>,
}

impl FramePacket {
    pub fn new(payload: Vec<u8>) -> Self {
        Self {
            led_count: (payload.len() / 3) as u16,
            payload,
        }
    }

    pub fn checksum(payload: &[u8]) -> u16 {
        payload.iter().fold(0u16, |acc, &b| acc.wrapping_add(b as u16))
    }

    pub fn encoded_len(&self) -> usize {
        OVERHEAD + self.payload.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len());
        out.extend_from_slice(&HEADER);
        out.extend_from_slice(&self.led_count.to_le_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&Self::checksum(&self.payload).to_le_bytes());
        out
    }

    /// Parse one complete packet, validating the checksum the way the receiver does.
    pub fn decode(bytes: &[u8]) -> Result<Self, PacketError> {
        if bytes.len() < OVERHEAD {
            return Err(PacketError::Truncated(bytes.len()));
        }
        let header = [bytes[0], bytes[1]];
        if header != HEADER {
            return Err(PacketError::BadHeader(header));
        }
        let led_count = u16::from_le_bytes([bytes[2], bytes[3]]);
        let payload = &bytes[4..bytes.len() - 2];
        if payload.len() != led_count as usize * 3 {
            return Err(PacketError::Length {
                expected: led_count as usize,
                actual: payload.len(),
            });
        }
        let tail = &bytes[bytes.len() - 2..];
        let expected = u16::from_le_bytes([tail[0], tail[1]]);
        let actual = Self::checksum(payload);
        if expected != actual {
            return Err(PacketError::Checksum { expected, actual });
        }
        Ok(Self {
            led_count,
            payload: payload.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FramePacket {
        FramePacket::new(vec![255, 0, 10, 1, 2, 3, 200, 200, 200])
    }

    #[test]
    fn encode_layout() {
        let bytes = sample().encode();
        assert_eq!(&bytes[..4], &[0xAA, 0x55, 3, 0]);
        // 255+10+1+2+3+600 = 871 = 0x0367
        assert_eq!(&bytes[bytes.len() - 2..], &[0x67, 0x03]);
        assert_eq!(bytes.len(), 2 + 2 + 9 + 2);
    }

    #[test]
    fn decode_recovers_payload() {
        let packet = sample();
        assert_eq!(FramePacket::decode(&packet.encode()), Ok(packet));
    }

    #[test]
    fn flipped_payload_byte_is_detected() {
        let mut bytes = sample().encode();
        bytes[6] ^= 0x01;
        assert!(matches!(
            FramePacket::decode(&bytes),
            Err(PacketError::Checksum { .. })
        ));
    }

    #[test]
    fn checksum_wraps() {
        let payload = vec![0xFF; 300];
        assert_eq!(FramePacket::checksum(&payload), ((300 * 255) % 65536) as u16);
    }

    #[test]
    fn malformed_packets() {
        assert_eq!(FramePacket::decode(&[0xAA]), Err(PacketError::Truncated(1)));
        let mut bytes = sample().encode();
        bytes[0] = 0x00;
        assert!(matches!(FramePacket::decode(&bytes), Err(PacketError::BadHeader(_))));
        let mut bytes = sample().encode();
        bytes[2] = 4;
        assert!(matches!(FramePacket::decode(&bytes), Err(PacketError::Length { .. })));
    }

    #[test]
    fn default_strip_layout_packet_size() {
        let total = 150 + 300 + 300 + 300;
        let packet = FramePacket::new(vec![0; total * 3]);
        assert_eq!(packet.encode().len(), 2 + 2 + total * 3 + 2);
        assert_eq!(packet.led_count as usize, total);
    }

    #[test]
    fn color_orders() {
        assert_eq!(ColorOrder::Grb.arrange([1, 2, 3]), [2, 1, 3]);
        assert_eq!(ColorOrder::Rgb.arrange([1, 2, 3]), [1, 2, 3]);
        assert_eq!(ColorOrder::Bgr.arrange([1, 2, 3]), [3, 2, 1]);
    }
}
