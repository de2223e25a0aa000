//! Binary encoding of packets and transport frames.
//!
//! Uses bincode with variable-length integers, which turns the enum variant
//! index into a single leading tag byte. Decoding is all-or-nothing: a
//! payload that is truncated, has trailing bytes, or exceeds the size limit
//! is rejected as a whole.

use crate::packets::{Frame, Packet};
use bincode::Options;
use thiserror::Error;

/// Largest encoded packet accepted or produced.
pub const MAX_PACKET_SIZE: u64 = 8 * 1024;

/// Largest encoded frame (packet plus envelope).
pub const MAX_FRAME_SIZE: u64 = MAX_PACKET_SIZE + 64;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("empty payload")]
    Empty,
    #[error("malformed payload: {0}")]
    Malformed(#[from] bincode::Error),
}

fn options(limit: u64) -> impl Options {
    bincode::DefaultOptions::new()
        .with_varint_encoding()
        .with_little_endian()
        .with_limit(limit)
        .reject_trailing_bytes()
}

pub fn encode_packet(packet: &Packet) -> Result<Vec<u8>, CodecError> {
    Ok(options(MAX_PACKET_SIZE).serialize(packet)?)
}

pub fn decode_packet(bytes: &[u8]) -> Result<Packet, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    Ok(options(MAX_PACKET_SIZE).deserialize(bytes)?)
}

pub fn encode_frame(frame: &Frame) -> Result<Vec<u8>, CodecError> {
    Ok(options(MAX_FRAME_SIZE).serialize(frame)?)
}

pub fn decode_frame(bytes: &[u8]) -> Result<Frame, CodecError> {
    if bytes.is_empty() {
        return Err(CodecError::Empty);
    }
    Ok(options(MAX_FRAME_SIZE).deserialize(bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::math::{Color, Vec3};
    use crate::packets::{ChatType, DisconnectReason, PacketKind};

    #[test]
    fn test_first_byte_is_packet_tag() {
        let packets = vec![
            Packet::PositionData {
                position: Vec3::new(1.0, 2.0, 3.0),
            },
            Packet::ChatMessage {
                player_id: 3,
                chat_type: ChatType::Team,
                value: "hello".to_string(),
            },
            Packet::FogColor {
                color: Color::new(1, 2, 3),
            },
            Packet::StopSound { sound_id: 9 },
        ];

        for packet in packets {
            let bytes = encode_packet(&packet).unwrap();
            assert_eq!(bytes[0], packet.kind() as u8);
            assert_eq!(decode_packet(&bytes).unwrap(), packet);
        }
    }

    #[test]
    fn test_last_packet_kind_tag() {
        let bytes = encode_packet(&Packet::StopSound { sound_id: 1 }).unwrap();
        assert_eq!(bytes[0], PacketKind::StopSound as u8);
        assert_eq!(PacketKind::StopSound as u8, 28);
    }

    #[test]
    fn test_truncated_packet_rejected() {
        let bytes = encode_packet(&Packet::OrientationData {
            orientation: Vec3::new(0.0, 1.0, 0.0),
        })
        .unwrap();
        assert!(decode_packet(&bytes[..bytes.len() - 1]).is_err());
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let mut bytes = encode_packet(&Packet::PackResponse { cached: true }).unwrap();
        bytes.push(0);
        assert!(decode_packet(&bytes).is_err());
    }

    #[test]
    fn test_unknown_tag_rejected() {
        assert!(decode_packet(&[200, 0, 0]).is_err());
        assert!(matches!(decode_packet(&[]), Err(CodecError::Empty)));
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let packet = Packet::MapChunk {
            data: vec![0u8; MAX_PACKET_SIZE as usize * 2],
        };
        assert!(encode_packet(&packet).is_err());
    }

    #[test]
    fn test_frame_roundtrip() {
        let frame = Frame::Disconnect {
            reason: DisconnectReason::WrongVersion,
        };
        let bytes = encode_frame(&frame).unwrap();
        assert_eq!(decode_frame(&bytes).unwrap(), frame);
    }
}
