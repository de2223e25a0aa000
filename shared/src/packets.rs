//! Every message exchanged between server and clients.
//!
//! The variant order of [`Packet`] is the wire tag: the codec encodes the
//! variant index as a single leading byte, so new packets must only ever be
//! appended. [`PacketKind`] mirrors that order and is what correlation waits
//! and dispatch are keyed on.

use crate::math::{Color, Vec3};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TeamId {
    Spectator,
    Team1,
    Team2,
}

impl TeamId {
    /// The opposing team; spectators have no opponent.
    pub fn other(&self) -> Option<TeamId> {
        match self {
            TeamId::Team1 => Some(TeamId::Team2),
            TeamId::Team2 => Some(TeamId::Team1),
            TeamId::Spectator => None,
        }
    }
}

/// Equippable tool slots, in the order clients index them.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tool {
    Spade,
    Block,
    Weapon,
    Grenade,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WeaponKind {
    Semi,
    Smg,
    Shotgun,
    Rpg,
}

/// Thrown or launched items announced with `UseOrientedItem`.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    Grenade,
    Rocket,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Hit {
    Torso,
    Head,
    Arms,
    Legs,
    Melee,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum KillType {
    Weapon,
    Headshot,
    Melee,
    Grenade,
    Fall,
    TeamChange,
    ClassChange,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum DamageKind {
    SelfInflicted,
    Other,
    Heal,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum ChatType {
    All,
    Team,
    System,
    Big,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum BlockActionKind {
    Build,
    Destroy,
    Spade,
    Grenade,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Undefined,
    Banned,
    IpConnected,
    WrongVersion,
    ServerFull,
    Kicked,
    Timeout,
    ShuttingDown,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    Flag,
    Base,
    CommandPost,
    Crate,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct InputState {
    pub up: bool,
    pub down: bool,
    pub left: bool,
    pub right: bool,
    pub jump: bool,
    pub crouch: bool,
    pub sneak: bool,
    pub sprint: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PlayerSnapshot {
    pub player_id: u8,
    pub position: Vec3,
    pub orientation: Vec3,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct EntityData {
    pub entity_id: u8,
    pub kind: EntityKind,
    pub team: Option<TeamId>,
    pub position: Vec3,
    pub carrier: Option<u8>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SoundData {
    pub sound_id: Option<u8>,
    pub name: String,
    pub position: Option<Vec3>,
    pub looping: bool,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct TeamState {
    pub name: String,
    pub color: Color,
    pub score: u32,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Packet {
    PositionData {
        position: Vec3,
    },
    OrientationData {
        orientation: Vec3,
    },
    WorldUpdate {
        players: Vec<PlayerSnapshot>,
    },
    InputData {
        player_id: u8,
        input: InputState,
    },
    WeaponInput {
        player_id: u8,
        primary: bool,
        secondary: bool,
    },
    HitPacket {
        player_id: u8,
        value: Hit,
    },
    SetHp {
        hp: u8,
        kind: DamageKind,
        source: Vec3,
    },
    UseOrientedItem {
        player_id: u8,
        item: ItemKind,
        value: f32,
        position: Vec3,
        velocity: Vec3,
    },
    SetTool {
        player_id: u8,
        tool: Tool,
    },
    SetColor {
        player_id: u8,
        color: Color,
    },
    ExistingPlayer {
        player_id: u8,
        team: TeamId,
        weapon: WeaponKind,
        tool: Tool,
        kills: u32,
        color: Color,
        name: String,
    },
    CreatePlayer {
        player_id: u8,
        weapon: WeaponKind,
        team: TeamId,
        position: Vec3,
        name: String,
    },
    BlockAction {
        player_id: u8,
        action: BlockActionKind,
        x: i32,
        y: i32,
        z: i32,
    },
    StateData {
        player_id: u8,
        fog_color: Color,
        team1: TeamState,
        team2: TeamState,
        mode_name: String,
        score_limit: u32,
        entities: Vec<EntityData>,
    },
    KillAction {
        player_id: u8,
        killer_id: u8,
        kill_type: KillType,
        respawn_time: u8,
    },
    ChatMessage {
        player_id: u8,
        chat_type: ChatType,
        value: String,
    },
    MapStart {
        size: u32,
    },
    MapChunk {
        data: Vec<u8>,
    },
    PlayerLeft {
        player_id: u8,
    },
    Restock {
        player_id: u8,
    },
    FogColor {
        color: Color,
    },
    WeaponReload {
        player_id: u8,
        clip_ammo: u16,
        reserve_ammo: u16,
    },
    PackStart {
        size: u32,
        checksum: u32,
    },
    PackResponse {
        cached: bool,
    },
    PackChunk {
        data: Vec<u8>,
    },
    CreateEntity {
        entity: EntityData,
    },
    DestroyEntity {
        entity_id: u8,
    },
    PlaySound {
        sound: SoundData,
    },
    StopSound {
        sound_id: u8,
    },
}

/// Packet type tags. Discriminants equal the wire tag byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum PacketKind {
    PositionData = 0,
    OrientationData,
    WorldUpdate,
    InputData,
    WeaponInput,
    HitPacket,
    SetHp,
    UseOrientedItem,
    SetTool,
    SetColor,
    ExistingPlayer,
    CreatePlayer,
    BlockAction,
    StateData,
    KillAction,
    ChatMessage,
    MapStart,
    MapChunk,
    PlayerLeft,
    Restock,
    FogColor,
    WeaponReload,
    PackStart,
    PackResponse,
    PackChunk,
    CreateEntity,
    DestroyEntity,
    PlaySound,
    StopSound,
}

impl Packet {
    pub fn kind(&self) -> PacketKind {
        match self {
            Packet::PositionData { .. } => PacketKind::PositionData,
            Packet::OrientationData { .. } => PacketKind::OrientationData,
            Packet::WorldUpdate { .. } => PacketKind::WorldUpdate,
            Packet::InputData { .. } => PacketKind::InputData,
            Packet::WeaponInput { .. } => PacketKind::WeaponInput,
            Packet::HitPacket { .. } => PacketKind::HitPacket,
            Packet::SetHp { .. } => PacketKind::SetHp,
            Packet::UseOrientedItem { .. } => PacketKind::UseOrientedItem,
            Packet::SetTool { .. } => PacketKind::SetTool,
            Packet::SetColor { .. } => PacketKind::SetColor,
            Packet::ExistingPlayer { .. } => PacketKind::ExistingPlayer,
            Packet::CreatePlayer { .. } => PacketKind::CreatePlayer,
            Packet::BlockAction { .. } => PacketKind::BlockAction,
            Packet::StateData { .. } => PacketKind::StateData,
            Packet::KillAction { .. } => PacketKind::KillAction,
            Packet::ChatMessage { .. } => PacketKind::ChatMessage,
            Packet::MapStart { .. } => PacketKind::MapStart,
            Packet::MapChunk { .. } => PacketKind::MapChunk,
            Packet::PlayerLeft { .. } => PacketKind::PlayerLeft,
            Packet::Restock { .. } => PacketKind::Restock,
            Packet::FogColor { .. } => PacketKind::FogColor,
            Packet::WeaponReload { .. } => PacketKind::WeaponReload,
            Packet::PackStart { .. } => PacketKind::PackStart,
            Packet::PackResponse { .. } => PacketKind::PackResponse,
            Packet::PackChunk { .. } => PacketKind::PackChunk,
            Packet::CreateEntity { .. } => PacketKind::CreateEntity,
            Packet::DestroyEntity { .. } => PacketKind::DestroyEntity,
            Packet::PlaySound { .. } => PacketKind::PlaySound,
            Packet::StopSound { .. } => PacketKind::StopSound,
        }
    }
}

/// Transport envelope carried in one UDP datagram.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub enum Frame {
    /// Opens a session; `version` is checked before anything else happens.
    Connect { version: u32 },
    /// Delivered exactly once and in `seq` order.
    Reliable { seq: u32, payload: Vec<u8> },
    /// May be dropped or reordered.
    Unreliable { payload: Vec<u8> },
    Ack { seq: u32 },
    Ping,
    Disconnect { reason: DisconnectReason },
}
