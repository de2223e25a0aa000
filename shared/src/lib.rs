//! Wire vocabulary shared by the server and any client: protocol constants,
//! packet and frame definitions, the codec, and the small math types that
//! travel inside packets.

pub mod codec;
pub mod math;
pub mod packets;
pub mod weapons;

pub use codec::{decode_frame, decode_packet, encode_frame, encode_packet, CodecError};
pub use math::{bad_float, Color, Vec3};
pub use packets::*;
pub use weapons::ToolStats;

/// Clients presenting any other version are turned away at connect time.
pub const PROTOCOL_VERSION: u32 = 3;
pub const DEFAULT_PORT: u16 = 32887;

pub const MAX_PLAYERS: u8 = 32;
pub const MAX_NAME_LEN: usize = 15;
pub const MAX_CHAT_SIZE: usize = 90;
pub const MAX_HP: u8 = 100;

/// Map and pack payloads are streamed in chunks of this many bytes.
pub const CHUNK_SIZE: usize = 1024;

/// Player id used for messages that come from the server itself.
pub const SYSTEM_PLAYER_ID: u8 = 0xFF;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_team_other() {
        assert_eq!(TeamId::Team1.other(), Some(TeamId::Team2));
        assert_eq!(TeamId::Team2.other(), Some(TeamId::Team1));
        assert_eq!(TeamId::Spectator.other(), None);
    }

    #[test]
    fn test_packet_kind_matches_variant() {
        let packet = Packet::KillAction {
            player_id: 1,
            killer_id: 2,
            kill_type: KillType::Headshot,
            respawn_time: 4,
        };
        assert_eq!(packet.kind(), PacketKind::KillAction);
        assert_eq!(encode_packet(&packet).unwrap()[0], PacketKind::KillAction as u8);
    }

    #[test]
    fn test_chunk_fits_in_packet() {
        let packet = Packet::MapChunk {
            data: vec![0xAB; CHUNK_SIZE],
        };
        assert!(encode_packet(&packet).is_ok());
    }
}
