//! Named hook points game modes and scripts can subscribe to.
//!
//! `try_*` hooks run before an action is committed and may cancel it or
//! replace its parameters. `on_*` hooks run afterwards and only observe.
//! Arguments are owned snapshots so subscribers never hold borrows into
//! protocol state.

use crate::event::{AsyncEvent, Event};
use shared::{BlockActionKind, ChatType, DamageKind, KillType, TeamId, Vec3};

#[derive(Debug, Clone, PartialEq)]
pub struct PlayerInfo {
    pub player_id: u8,
    pub name: String,
    pub team: TeamId,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SpawnAttempt {
    pub player_id: u8,
    pub position: Vec3,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HurtAttempt {
    pub player_id: u8,
    pub damage: i32,
    pub damager: Option<u8>,
    pub cause: KillType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HurtEvent {
    pub player_id: u8,
    pub damage: i32,
    pub damager: Option<u8>,
    pub kind: DamageKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KillEvent {
    pub player_id: u8,
    pub killer_id: Option<u8>,
    pub kill_type: KillType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BlockAttempt {
    pub player_id: u8,
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub action: BlockActionKind,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChatAttempt {
    pub player_id: u8,
    pub message: String,
    pub chat_type: ChatType,
}

pub struct Hooks {
    pub on_player_connect: Event<PlayerInfo>,
    pub on_player_join: Event<PlayerInfo>,
    pub on_player_leave: Event<PlayerInfo>,

    /// May move the spawn position.
    pub try_player_spawn: AsyncEvent<SpawnAttempt, Vec3>,
    pub on_player_spawn: Event<SpawnAttempt>,

    /// May change the damage amount.
    pub try_player_hurt: AsyncEvent<HurtAttempt, i32>,
    pub on_player_hurt: Event<HurtEvent>,
    pub on_player_kill: Event<KillEvent>,

    /// May move the block.
    pub try_build_block: AsyncEvent<BlockAttempt, (i32, i32, i32)>,
    pub on_build_block: Event<BlockAttempt>,
    pub try_destroy_block: AsyncEvent<BlockAttempt, (i32, i32, i32)>,
    pub on_destroy_block: Event<BlockAttempt>,

    /// May rewrite the message text.
    pub try_chat_message: AsyncEvent<ChatAttempt, String>,
    pub on_chat_message: Event<ChatAttempt>,
}

impl Hooks {
    pub fn new() -> Self {
        Self {
            on_player_connect: Event::new(),
            on_player_join: Event::new(),
            on_player_leave: Event::new(),
            try_player_spawn: AsyncEvent::overridable(),
            on_player_spawn: Event::new(),
            try_player_hurt: AsyncEvent::overridable(),
            on_player_hurt: Event::new(),
            on_player_kill: Event::new(),
            try_build_block: AsyncEvent::overridable(),
            on_build_block: Event::new(),
            try_destroy_block: AsyncEvent::overridable(),
            on_destroy_block: Event::new(),
            try_chat_message: AsyncEvent::overridable(),
            on_chat_message: Event::new(),
        }
    }
}

impl Default for Hooks {
    fn default() -> Self {
        Self::new()
    }
}
