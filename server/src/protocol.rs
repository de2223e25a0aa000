//! The session coordinator.
//!
//! [`Protocol`] owns every connection, the world and the id pools. It is
//! driven by the server loop through [`Protocol::handle`] for network
//! events and [`Protocol::tick`] on the fixed simulation rate, and it is the
//! only place game state is mutated. Player actions go through the hook
//! registry in two steps: an awaited `try_*` hook that may cancel or rewrite
//! the action, then the commit and a plain `on_*` notification.

use crate::client_manager::PeerId;
use crate::config::{Pack, ServerConfig};
use crate::connection::{send_map, Connection, ConnectionState, Handshake};
use crate::entity::{Entity, Explosive, Sound, ROCKET_LIFETIME};
use crate::error::ServerResult;
use crate::event::Verdict;
use crate::game::{FreeForAll, GameMode, Teams};
use crate::hooks::{BlockAttempt, ChatAttempt, HurtAttempt, HurtEvent, KillEvent, Hooks, SpawnAttempt};
use crate::id_pool::{IdPool, PoolError};
use crate::network::{Channel, Outbox, ServerMessage};
use crate::tools::{Equipment, ToolEvent, Weapon};
use crate::world::{FlatMap, VoxelMap};
use log::{debug, error, info, warn};
use shared::{
    bad_float, decode_packet, BlockActionKind, ChatType, Color, DamageKind, DisconnectReason,
    EntityKind, Hit, InputState, ItemKind, KillType, Packet, PacketKind, PlayerSnapshot, TeamId,
    Tool, Vec3, WeaponKind, MAX_CHAT_SIZE, MAX_HP, MAX_NAME_LEN, MAX_PLAYERS, PROTOCOL_VERSION,
    SYSTEM_PLAYER_ID,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

/// Client positions further than this from the tracked one are snapped back.
const MAX_POSITION_DRIFT: f32 = 3.0;

/// Alpha byte stored with every placed voxel.
const BLOCK_ALPHA: u8 = 0x7F;

/// Who a broadcast goes to. `All` and `Filter` only reach peers that have
/// finished their handshake.
pub enum Target<'a> {
    All,
    Filter(&'a dyn Fn(&Connection) -> bool),
    Only(Vec<PeerId>),
}

pub struct Protocol {
    config: ServerConfig,
    outbox: Outbox,
    events: tokio::sync::mpsc::UnboundedSender<ServerMessage>,

    connections: HashMap<PeerId, Connection>,
    players: BTreeMap<u8, PeerId>,
    entities: BTreeMap<u8, Entity>,
    sounds: BTreeMap<u8, Sound>,
    objects: Vec<Explosive>,

    player_ids: IdPool,
    // Player ids from 32 up are colour slots for server-placed blocks.
    color_ids: IdPool,
    entity_ids: IdPool,
    sound_ids: IdPool,

    pub teams: Teams,
    mode: Box<dyn GameMode>,
    map: Box<dyn VoxelMap>,
    packs: Arc<Vec<Pack>>,
    time: f64,
    fog_color: Color,
    pub hooks: Hooks,
}

impl Protocol {
    pub fn new(
        config: ServerConfig,
        packs: Vec<Pack>,
        outbox: Outbox,
        events: tokio::sync::mpsc::UnboundedSender<ServerMessage>,
    ) -> Self {
        let map = FlatMap::new(
            config.map_width,
            config.map_length,
            config.map_depth,
            config.ground_height,
        );
        Self::with_world(
            config,
            packs,
            outbox,
            events,
            Box::new(map),
            Box::new(FreeForAll::new()),
        )
    }

    pub fn with_world(
        config: ServerConfig,
        packs: Vec<Pack>,
        outbox: Outbox,
        events: tokio::sync::mpsc::UnboundedSender<ServerMessage>,
        map: Box<dyn VoxelMap>,
        mode: Box<dyn GameMode>,
    ) -> Self {
        let fog_color = config.fog_color;
        Self {
            config,
            outbox,
            events,
            connections: HashMap::new(),
            players: BTreeMap::new(),
            entities: BTreeMap::new(),
            sounds: BTreeMap::new(),
            objects: Vec::new(),
            player_ids: IdPool::new(0, MAX_PLAYERS),
            color_ids: IdPool::new(MAX_PLAYERS, 255),
            entity_ids: IdPool::new(0, 255),
            sound_ids: IdPool::new(0, 255),
            teams: Teams::default(),
            mode,
            map,
            packs: Arc::new(packs),
            time: 0.0,
            fog_color,
            hooks: Hooks::new(),
        }
    }

    pub fn start(&mut self) {
        self.mode.init(self.map.as_ref());
    }

    pub fn time(&self) -> f64 {
        self.time
    }

    pub fn map(&self) -> &dyn VoxelMap {
        self.map.as_ref()
    }

    pub fn fog_color(&self) -> Color {
        self.fog_color
    }

    pub fn connection(&self, peer: PeerId) -> Option<&Connection> {
        self.connections.get(&peer)
    }

    pub fn connection_mut(&mut self, peer: PeerId) -> Option<&mut Connection> {
        self.connections.get_mut(&peer)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn peer_of(&self, player_id: u8) -> Option<PeerId> {
        self.players.get(&player_id).copied()
    }

    pub fn player(&self, player_id: u8) -> Option<&Connection> {
        self.peer_of(player_id)
            .and_then(|peer| self.connections.get(&peer))
    }

    /// Joined players in id order.
    pub fn players(&self) -> impl Iterator<Item = &Connection> + '_ {
        self.players
            .values()
            .filter_map(move |peer| self.connections.get(peer))
    }

    pub fn free_player_ids(&self) -> usize {
        self.player_ids.available()
    }

    pub fn entities(&self) -> &BTreeMap<u8, Entity> {
        &self.entities
    }

    pub fn sounds(&self) -> &BTreeMap<u8, Sound> {
        &self.sounds
    }

    pub fn objects(&self) -> &[Explosive] {
        &self.objects
    }

    /// Routes one message from the network or a handshake task.
    pub async fn handle(&mut self, message: ServerMessage) -> ServerResult<()> {
        match message {
            ServerMessage::PeerConnected { peer, version } => self.on_connect(peer, version),
            ServerMessage::PacketReceived { peer, payload } => self.on_receive(peer, &payload).await,
            ServerMessage::PeerDisconnected { peer } => self.on_disconnect(peer),
            ServerMessage::PeerTimeout { peer } => {
                info!("Peer {} timed out", peer);
                self.on_disconnect(peer)
            }
            ServerMessage::PacksStreamed { peer } => self.finish_handshake(peer),
            ServerMessage::Shutdown => Ok(()),
        }
    }

    // Connection lifecycle

    fn on_connect(&mut self, peer: PeerId, version: u32) -> ServerResult<()> {
        if self.connections.contains_key(&peer) {
            debug!("Peer {} connected twice", peer);
            return Ok(());
        }
        if version != PROTOCOL_VERSION {
            info!(
                "Peer {} has protocol version {}, expected {}",
                peer, version, PROTOCOL_VERSION
            );
            self.outbox.disconnect(peer, DisconnectReason::WrongVersion);
            return Ok(());
        }

        let player_id = match self.player_ids.pop() {
            Ok(id) => id,
            Err(PoolError::Exhausted) => {
                warn!("No player slot left for peer {}", peer);
                self.outbox.disconnect(peer, DisconnectReason::ServerFull);
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        let mut connection = Connection::new(peer, self.time);
        connection.player_id = Some(player_id);
        connection.state = ConnectionState::Handshaking;
        let pack_replies = self
            .packs
            .iter()
            .map(|_| connection.wait_for(PacketKind::PackResponse, self.config.handshake_timeout))
            .collect();
        self.connections.insert(peer, connection);

        info!("Peer {} is player #{}, starting handshake", peer, player_id);
        let handshake = Handshake {
            peer,
            packs: Arc::clone(&self.packs),
            pack_replies,
            outbox: self.outbox.clone(),
            events: self.events.clone(),
        };
        tokio::spawn(handshake.run());
        Ok(())
    }

    /// Sends the map, game state and roster once the packs are out, then
    /// activates the peer. The map is snapshotted here, in the same step that
    /// makes the peer a broadcast target, so it cannot miss a block change.
    /// The peer may have left or been kicked while its packs were streaming.
    fn finish_handshake(&mut self, peer: PeerId) -> ServerResult<()> {
        let Some(connection) = self.connections.get(&peer) else {
            debug!("Handshake finished for departed peer {}", peer);
            return Ok(());
        };
        if connection.state != ConnectionState::Handshaking {
            return Ok(());
        }
        let Some(player_id) = connection.player_id else {
            return Ok(());
        };

        match send_map(&self.outbox, peer, &self.map.get_bytes()) {
            Ok(size) => debug!("Sent {} byte map to peer {}", size, peer),
            Err(e) => {
                warn!("Compressing the map for peer {} failed: {}", peer, e);
                return self.disconnect(peer, DisconnectReason::Undefined);
            }
        }
        let state = self.get_state(player_id);
        self.send_to(peer, &state);
        let roster: Vec<Packet> = self
            .players()
            .filter_map(Connection::to_existing_player)
            .collect();
        for packet in &roster {
            self.send_to(peer, packet);
        }

        let Some(connection) = self.connections.get_mut(&peer) else {
            return Ok(());
        };
        connection.state = ConnectionState::Active;
        if let Some(info) = connection.info() {
            self.hooks.on_player_connect.call(&info);
        }
        info!("Player #{} finished handshake", player_id);
        Ok(())
    }

    async fn on_receive(&mut self, peer: PeerId, payload: &[u8]) -> ServerResult<()> {
        let packet = match decode_packet(payload) {
            Ok(packet) => packet,
            Err(e) => {
                warn!("Malformed packet from peer {}: {}", peer, e);
                return self.disconnect(peer, DisconnectReason::Undefined);
            }
        };

        let accepted = self
            .connections
            .get(&peer)
            .map_or(false, |c| c.player_id.is_some());
        if !accepted {
            warn!("Peer {} sent {:?} before being accepted", peer, packet.kind());
            return self.disconnect(peer, DisconnectReason::Undefined);
        }
        let Some(connection) = self.connections.get_mut(&peer) else {
            return Ok(());
        };

        let resolved = connection.resolve_waiter(&packet);
        match connection.state {
            ConnectionState::Active => self.dispatch(peer, packet, resolved).await,
            ConnectionState::Handshaking if resolved => Ok(()),
            ConnectionState::Handshaking => {
                warn!("Peer {} sent {:?} during handshake", peer, packet.kind());
                self.disconnect(peer, DisconnectReason::Undefined)
            }
            _ => Ok(()),
        }
    }

    async fn dispatch(&mut self, peer: PeerId, packet: Packet, resolved: bool) -> ServerResult<()> {
        match packet {
            Packet::ExistingPlayer {
                team, weapon, name, ..
            } => self.recv_join(peer, team, weapon, &name).await,
            Packet::PositionData { position } => self.recv_position(peer, position),
            Packet::OrientationData { orientation } => self.recv_orientation(peer, orientation),
            Packet::InputData { input, .. } => {
                self.recv_input(peer, input);
                Ok(())
            }
            Packet::WeaponInput {
                primary, secondary, ..
            } => {
                self.recv_weapon_input(peer, primary, secondary);
                Ok(())
            }
            Packet::WeaponReload { .. } => {
                self.recv_weapon_reload(peer);
                Ok(())
            }
            Packet::SetTool { tool, .. } => {
                self.recv_set_tool(peer, tool);
                Ok(())
            }
            Packet::SetColor { color, .. } => {
                self.recv_set_color(peer, color);
                Ok(())
            }
            Packet::BlockAction { action, x, y, z, .. } => {
                self.recv_block_action(peer, action, x, y, z).await
            }
            Packet::ChatMessage {
                chat_type, value, ..
            } => self.recv_chat_message(peer, chat_type, value).await,
            Packet::UseOrientedItem {
                item,
                value,
                position,
                velocity,
                ..
            } => self.recv_oriented_item(peer, item, value, position, velocity),
            Packet::HitPacket { player_id, value } => self.recv_hit(peer, player_id, value).await,
            other => {
                if !resolved {
                    warn!("Unhandled packet {:?} from peer {}", other.kind(), peer);
                }
                Ok(())
            }
        }
    }

    fn on_disconnect(&mut self, peer: PeerId) -> ServerResult<()> {
        let Some(mut connection) = self.connections.remove(&peer) else {
            return Ok(());
        };
        connection.state = ConnectionState::Disconnected;
        connection.cancel_waits();

        if let Some(info) = connection.info() {
            self.hooks.on_player_leave.call(&info);
            self.player_left(info.player_id)?;
        }
        info!("Peer {} left", peer);
        Ok(())
    }

    /// Frees the player id; announces the departure only if the player had
    /// actually joined.
    fn player_left(&mut self, player_id: u8) -> ServerResult<()> {
        if self.players.remove(&player_id).is_some() {
            self.broadcast(&Packet::PlayerLeft { player_id }, Target::All);
        }
        self.player_ids.push(player_id).map_err(|e| {
            error!("Releasing player id {} failed: {}", player_id, e);
            e.into()
        })
    }

    pub fn disconnect(&mut self, peer: PeerId, reason: DisconnectReason) -> ServerResult<()> {
        info!("Disconnecting peer {} ({:?})", peer, reason);
        self.outbox.disconnect(peer, reason);
        self.on_disconnect(peer)
    }

    /// Disconnects everyone. Used on shutdown.
    pub fn stop(&mut self) {
        let peers: Vec<PeerId> = self.connections.keys().copied().collect();
        for peer in peers {
            if let Err(e) = self.disconnect(peer, DisconnectReason::ShuttingDown) {
                error!("Error while disconnecting peer {}: {}", peer, e);
            }
        }
        info!("Protocol stopped");
    }

    // Packet handlers

    async fn recv_join(
        &mut self,
        peer: PeerId,
        team: TeamId,
        weapon: WeaponKind,
        name: &str,
    ) -> ServerResult<()> {
        let Some(connection) = self.connections.get(&peer) else {
            return Ok(());
        };
        let Some(player_id) = connection.player_id else {
            return Ok(());
        };
        if connection.joined {
            warn!("Player #{} tried to join twice", player_id);
            return Ok(());
        }
        if self.teams.get(team).is_none() {
            return self.disconnect(peer, DisconnectReason::Undefined);
        }

        let name = self.validate_name(player_id, name);
        let now = self.time;
        let Some(connection) = self.connections.get_mut(&peer) else {
            return Ok(());
        };
        connection.name = Some(name);
        connection.loadout.weapon = Weapon::new(weapon, now);
        connection.team = team;
        self.player_joined(peer).await
    }

    /// Registers a named connection as a player and spawns it.
    pub async fn player_joined(&mut self, peer: PeerId) -> ServerResult<()> {
        let Some(connection) = self.connections.get_mut(&peer) else {
            return Ok(());
        };
        connection.joined = true;
        let Some(info) = connection.info() else {
            return Ok(());
        };
        info!("{} joined {:?} as player #{}", info.name, info.team, info.player_id);
        self.hooks.on_player_join.call(&info);
        self.players.insert(info.player_id, peer);
        self.spawn(peer, None).await
    }

    /// Trims the requested name, falls back to `Deuce<id>`, and appends a
    /// counter until it is unique among joined players ignoring case.
    pub fn validate_name(&self, player_id: u8, requested: &str) -> String {
        let trimmed = requested.trim();
        let base: String = if trimmed.is_empty() || trimmed == "Deuce" {
            format!("Deuce{}", player_id)
        } else {
            trimmed.chars().take(MAX_NAME_LEN).collect()
        };

        let taken: HashSet<String> = self
            .players()
            .filter_map(|player| player.name.as_deref())
            .map(str::to_lowercase)
            .collect();

        let mut name = base.clone();
        let mut suffix = 0;
        while taken.contains(&name.to_lowercase()) {
            name = format!("{}{}", base, suffix);
            suffix += 1;
        }
        name
    }

    fn recv_position(&mut self, peer: PeerId, position: Vec3) -> ServerResult<()> {
        let Some(connection) = self.connections.get_mut(&peer) else {
            return Ok(());
        };
        if !connection.is_alive() {
            return Ok(());
        }
        if position.is_bad() {
            return self.disconnect(peer, DisconnectReason::Undefined);
        }

        let tracked = connection.position();
        if position.sq_distance(&tracked) >= MAX_POSITION_DRIFT * MAX_POSITION_DRIFT {
            debug!("Snapping peer {} back to {:?}", peer, tracked);
            self.send_to(peer, &Packet::PositionData { position: tracked });
        } else {
            connection.body.set_position(position, false);
        }
        Ok(())
    }

    fn recv_orientation(&mut self, peer: PeerId, orientation: Vec3) -> ServerResult<()> {
        let Some(connection) = self.connections.get_mut(&peer) else {
            return Ok(());
        };
        if !connection.is_alive() {
            return Ok(());
        }
        if orientation.is_bad() {
            return self.disconnect(peer, DisconnectReason::Undefined);
        }
        connection.body.set_orientation(orientation);
        Ok(())
    }

    fn recv_input(&mut self, peer: PeerId, input: InputState) {
        let Some(connection) = self.connections.get_mut(&peer) else {
            return;
        };
        let (true, Some(player_id)) = (connection.is_alive(), connection.player_id) else {
            return;
        };
        connection
            .body
            .set_walk(input.up, input.down, input.left, input.right);
        connection
            .body
            .set_animation(input.jump, input.crouch, input.sneak, input.sprint);
        self.relay(peer, &Packet::InputData { player_id, input });
    }

    fn recv_weapon_input(&mut self, peer: PeerId, primary: bool, secondary: bool) {
        let Some(connection) = self.connections.get_mut(&peer) else {
            return;
        };
        let (true, Some(player_id)) = (connection.is_alive(), connection.player_id) else {
            return;
        };
        let tool = connection.equipped_mut();
        let primary = tool.set_primary(primary);
        let secondary = tool.set_secondary(secondary);
        connection.body.set_fire(primary, secondary);
        self.relay(
            peer,
            &Packet::WeaponInput {
                player_id,
                primary,
                secondary,
            },
        );
    }

    fn recv_weapon_reload(&mut self, peer: PeerId) {
        let now = self.time;
        let Some(connection) = self.connections.get_mut(&peer) else {
            return;
        };
        if !connection.is_alive() || connection.tool != Tool::Weapon {
            return;
        }
        if !connection.loadout.weapon.reload(now) {
            debug!("Peer {} cannot reload right now", peer);
        }
    }

    fn recv_set_tool(&mut self, peer: PeerId, tool: Tool) {
        let Some(connection) = self.connections.get_mut(&peer) else {
            return;
        };
        if !connection.is_alive() {
            return;
        }
        connection.body.set_weapon(tool == Tool::Weapon);
        self.set_tool(peer, tool);
    }

    fn recv_set_color(&mut self, peer: PeerId, color: Color) {
        let Some(connection) = self.connections.get_mut(&peer) else {
            return;
        };
        let (true, Some(player_id)) = (connection.is_alive(), connection.player_id) else {
            return;
        };
        if connection.tool != Tool::Block {
            return;
        }
        connection.loadout.block.color = color;
        self.relay(peer, &Packet::SetColor { player_id, color });
    }

    async fn recv_block_action(
        &mut self,
        peer: PeerId,
        action: BlockActionKind,
        x: i32,
        y: i32,
        z: i32,
    ) -> ServerResult<()> {
        match self.connections.get(&peer) {
            Some(connection) if connection.is_alive() => {}
            _ => return Ok(()),
        }
        match action {
            // Only detonations destroy with this kind.
            BlockActionKind::Grenade => {}
            BlockActionKind::Build => {
                self.build_block(peer, x, y, z, None).await;
            }
            _ => {
                self.destroy_block(peer, x, y, z, action).await;
            }
        }
        Ok(())
    }

    async fn recv_chat_message(
        &mut self,
        peer: PeerId,
        chat_type: ChatType,
        value: String,
    ) -> ServerResult<()> {
        if !matches!(chat_type, ChatType::All | ChatType::Team) {
            return Ok(());
        }
        let Some(connection) = self.connections.get(&peer) else {
            return Ok(());
        };
        let (true, Some(player_id)) = (connection.joined, connection.player_id) else {
            return Ok(());
        };
        let team = connection.team;

        let attempt = ChatAttempt {
            player_id,
            message: value,
            chat_type,
        };
        let message = match self.hooks.try_chat_message.call(attempt.clone()).await {
            Verdict::Cancel => return Ok(()),
            Verdict::Replace(message) => message,
            Verdict::Proceed => attempt.message.clone(),
        };

        let team = (chat_type == ChatType::Team).then_some(team);
        self.broadcast_chat_message(&message, player_id, team);
        self.hooks.on_chat_message.call(&attempt);
        Ok(())
    }

    fn recv_oriented_item(
        &mut self,
        peer: PeerId,
        item: ItemKind,
        value: f32,
        position: Vec3,
        velocity: Vec3,
    ) -> ServerResult<()> {
        let Some(connection) = self.connections.get_mut(&peer) else {
            return Ok(());
        };
        let (true, Some(player_id)) = (connection.is_alive(), connection.player_id) else {
            return Ok(());
        };
        if position.is_bad() || velocity.is_bad() || bad_float(&[value]) {
            return self.disconnect(peer, DisconnectReason::Undefined);
        }

        let fired = match item {
            ItemKind::Grenade => {
                connection.tool == Tool::Grenade && connection.loadout.grenade.on_primary()
            }
            // For rockets `velocity` carries the aim direction.
            ItemKind::Rocket => {
                connection.tool == Tool::Weapon
                    && connection.loadout.weapon.kind == WeaponKind::Rpg
                    && connection.loadout.weapon.on_primary()
            }
        };
        if !fired {
            return Ok(());
        }

        let origin = connection.position();
        let fuse = match item {
            ItemKind::Grenade => value,
            ItemKind::Rocket => ROCKET_LIFETIME,
        };
        self.create_object(Explosive::new(item, player_id, peer, origin, velocity, fuse));
        self.relay(
            peer,
            &Packet::UseOrientedItem {
                player_id,
                item,
                value,
                position: origin,
                velocity,
            },
        );
        Ok(())
    }

    async fn recv_hit(&mut self, peer: PeerId, target_id: u8, hit: Hit) -> ServerResult<()> {
        let Some(shooter) = self.connections.get(&peer) else {
            return Ok(());
        };
        if !shooter.is_alive() || shooter.tool != Tool::Weapon {
            return Ok(());
        }
        if !shooter.loadout.weapon.state().primary {
            return Ok(());
        }
        let Some(damage) = shooter.loadout.weapon.get_damage(hit) else {
            return Ok(());
        };
        let Some(target_peer) = self.peer_of(target_id) else {
            return Ok(());
        };
        if target_peer == peer {
            return Ok(());
        }
        let Some(target) = self.connections.get(&target_peer) else {
            return Ok(());
        };
        if !target.is_alive() {
            return Ok(());
        }

        let direction = (target.eye() - shooter.eye()).normalized();
        if !shooter.orientation().approx_eq(&direction, 1.0) {
            debug!(
                "Rejecting hit from peer {}: aiming {:?}, target at {:?}",
                peer,
                shooter.orientation(),
                direction
            );
            return Ok(());
        }

        let cause = if hit == Hit::Head {
            KillType::Headshot
        } else {
            KillType::Weapon
        };
        self.hurt(target_peer, damage as i32, cause, Some(peer), None)
            .await
    }

    // Player operations

    /// Spawns a joined player at `position`, or at the game mode's spawn
    /// point for their team.
    pub async fn spawn(&mut self, peer: PeerId, position: Option<Vec3>) -> ServerResult<()> {
        let Some(connection) = self.connections.get(&peer) else {
            return Ok(());
        };
        let (true, Some(player_id)) = (connection.joined, connection.player_id) else {
            return Ok(());
        };
        let team = connection.team;

        let default = match position {
            Some(position) => position,
            None => self.mode.get_spawn_point(team, self.map.as_ref()),
        };
        let attempt = SpawnAttempt {
            player_id,
            position: default,
        };
        let position = match self.hooks.try_player_spawn.call(attempt).await {
            Verdict::Cancel => return Ok(()),
            Verdict::Replace(position) => position,
            Verdict::Proceed => default,
        };

        let Some(connection) = self.connections.get_mut(&peer) else {
            return Ok(());
        };
        connection.body.set_dead(false);
        connection.body.set_position(position, true);
        connection.pending_respawn = None;
        let packet = Packet::CreatePlayer {
            player_id,
            weapon: connection.weapon_kind(),
            team,
            position,
            name: connection.name.clone().unwrap_or_default(),
        };
        self.broadcast(&packet, Target::All);
        self.restock(peer);
        self.hooks
            .on_player_spawn
            .call(&SpawnAttempt { player_id, position });
        Ok(())
    }

    /// Sets hp, clamped to `[0, 100]`. Without an explicit kind the change
    /// counts as a heal when hp does not drop.
    pub fn set_hp(&mut self, peer: PeerId, hp: i32, kind: Option<DamageKind>, source: Option<Vec3>) {
        let Some(connection) = self.connections.get_mut(&peer) else {
            return;
        };
        let kind = kind.unwrap_or(if hp >= connection.hp as i32 {
            DamageKind::Heal
        } else {
            DamageKind::SelfInflicted
        });
        connection.hp = hp.clamp(0, MAX_HP as i32) as u8;
        let packet = Packet::SetHp {
            hp: connection.hp,
            kind,
            source: source.unwrap_or(Vec3::ZERO),
        };
        self.send_to(peer, &packet);
    }

    pub async fn hurt(
        &mut self,
        peer: PeerId,
        damage: i32,
        cause: KillType,
        damager: Option<PeerId>,
        source: Option<Vec3>,
    ) -> ServerResult<()> {
        let Some(victim) = self.connections.get(&peer) else {
            return Ok(());
        };
        let Some(player_id) = victim.player_id else {
            return Ok(());
        };
        if !victim.is_alive() {
            return Ok(());
        }

        let attacker = damager
            .and_then(|damager| self.connections.get(&damager))
            .and_then(|c| c.player_id.map(|id| (id, c.position())));
        let (kind, source) = match (source, attacker) {
            (Some(source), _) => (DamageKind::Other, source),
            (None, Some((_, position))) => (DamageKind::Other, position),
            (None, None) => (DamageKind::SelfInflicted, victim.position()),
        };
        let damager_id = attacker.map(|(id, _)| id);

        let attempt = HurtAttempt {
            player_id,
            damage,
            damager: damager_id,
            cause,
        };
        let damage = match self.hooks.try_player_hurt.call(attempt).await {
            Verdict::Cancel => return Ok(()),
            Verdict::Replace(damage) => damage,
            Verdict::Proceed => damage,
        };

        let Some(hp) = self.connections.get(&peer).map(|c| c.hp as i32 - damage) else {
            return Ok(());
        };
        self.set_hp(peer, hp, Some(kind), Some(source));
        if hp <= 0 {
            self.kill(peer, cause, damager);
        } else {
            self.hooks.on_player_hurt.call(&HurtEvent {
                player_id,
                damage,
                damager: damager_id,
                kind,
            });
        }
        Ok(())
    }

    /// Kills the player and schedules the respawn. Ignored if the player is
    /// already dead or waiting to respawn.
    pub fn kill(&mut self, peer: PeerId, kill_type: KillType, killer: Option<PeerId>) {
        let respawn_time = self.get_respawn_time();
        let now = self.time;
        let Some(victim) = self.connections.get_mut(&peer) else {
            return;
        };
        if victim.is_dead() || victim.pending_respawn.is_some() {
            return;
        }
        let Some(player_id) = victim.player_id else {
            return;
        };
        victim.body.set_dead(true);
        victim.pending_respawn = Some(now + respawn_time as f64);

        let killer_id = match killer.filter(|&killer| killer != peer) {
            Some(killer) => self.connections.get_mut(&killer).and_then(|c| {
                c.kills += 1;
                c.player_id
            }),
            None => None,
        };

        let packet = Packet::KillAction {
            player_id,
            killer_id: killer_id.unwrap_or(player_id),
            kill_type,
            respawn_time: (respawn_time + 1).min(u8::MAX as u32) as u8,
        };
        self.broadcast(&packet, Target::All);
        self.hooks.on_player_kill.call(&KillEvent {
            player_id,
            killer_id,
            kill_type,
        });
    }

    /// Seconds until the next respawn wave. Waves run on a fixed cadence of
    /// `max_respawn_time` seconds of server time.
    pub fn get_respawn_time(&self) -> u32 {
        let max = self.config.max_respawn_time.max(1);
        let offset = (self.time % max as f64) as u32;
        max - offset
    }

    pub fn restock(&mut self, peer: PeerId) {
        self.set_hp(peer, MAX_HP as i32, None, None);
        let Some(connection) = self.connections.get_mut(&peer) else {
            return;
        };
        connection.loadout.restock();
        if let Some(player_id) = connection.player_id {
            self.send_to(peer, &Packet::Restock { player_id });
        }
    }

    pub fn set_tool(&mut self, peer: PeerId, tool: Tool) {
        let Some(connection) = self.connections.get_mut(&peer) else {
            return;
        };
        let Some(player_id) = connection.player_id else {
            return;
        };
        connection.equipped_mut().release();
        connection.tool = tool;
        self.broadcast(&Packet::SetTool { player_id, tool }, Target::All);
    }

    /// Moves the player and tells their client. Without `z` the player is
    /// put just above the ground at `(x, y)`.
    pub fn set_position(&mut self, peer: PeerId, x: f32, y: f32, z: Option<f32>, reset: bool) {
        let z = z.unwrap_or_else(|| (self.map.get_z(x as i32, y as i32) - 2) as f32);
        let position = Vec3::new(x, y, z);
        let Some(connection) = self.connections.get_mut(&peer) else {
            return;
        };
        connection.body.set_position(position, reset);
        self.send_to(peer, &Packet::PositionData { position });
    }

    pub async fn build_block(
        &mut self,
        peer: PeerId,
        x: i32,
        y: i32,
        z: i32,
        color: Option<Color>,
    ) -> bool {
        if !self.map.can_build(x, y, z) {
            return false;
        }
        let Some(connection) = self.connections.get_mut(&peer) else {
            return false;
        };
        let Some(player_id) = connection.player_id else {
            return false;
        };
        if connection.loadout.block.blocks() == 0 {
            return false;
        }
        if let Some(color) = color {
            connection.loadout.block.color = color;
        }

        let attempt = BlockAttempt {
            player_id,
            x,
            y,
            z,
            action: BlockActionKind::Build,
        };
        let (x, y, z) = match self.hooks.try_build_block.call(attempt).await {
            Verdict::Cancel => return false,
            Verdict::Replace((x, y, z)) if !self.map.can_build(x, y, z) => return false,
            Verdict::Replace(position) => position,
            Verdict::Proceed => (x, y, z),
        };

        let Some(connection) = self.connections.get_mut(&peer) else {
            return false;
        };
        let voxel = connection.loadout.block.color.to_voxel(BLOCK_ALPHA);
        if !self.map.set_point(x, y, z, true, voxel) {
            return false;
        }
        connection.loadout.block.build();

        let action = BlockActionKind::Build;
        self.broadcast(
            &Packet::BlockAction {
                player_id,
                action,
                x,
                y,
                z,
            },
            Target::All,
        );
        self.hooks.on_build_block.call(&BlockAttempt {
            player_id,
            x,
            y,
            z,
            action,
        });
        true
    }

    /// Destroys a block on behalf of a player. A spade swing with the spade
    /// equipped also takes the blocks above and below; a grenade takes the
    /// surrounding 3x3x3 cube. Destroying with a block tool refunds a block.
    pub async fn destroy_block(
        &mut self,
        peer: PeerId,
        x: i32,
        y: i32,
        z: i32,
        action: BlockActionKind,
    ) -> bool {
        let Some(connection) = self.connections.get(&peer) else {
            return false;
        };
        let Some(player_id) = connection.player_id else {
            return false;
        };

        let attempt = BlockAttempt {
            player_id,
            x,
            y,
            z,
            action,
        };
        let (x, y, z) = match self.hooks.try_destroy_block.call(attempt).await {
            Verdict::Cancel => return false,
            Verdict::Replace(position) => position,
            Verdict::Proceed => (x, y, z),
        };

        let Some(connection) = self.connections.get_mut(&peer) else {
            return false;
        };
        let spade_swing = action == BlockActionKind::Spade && connection.tool == Tool::Spade;
        if action == BlockActionKind::Destroy {
            connection.loadout.block.destroy();
        }

        self.clear_blocks(player_id, x, y, z, action, spade_swing);
        self.hooks.on_destroy_block.call(&BlockAttempt {
            player_id,
            x,
            y,
            z,
            action,
        });
        true
    }

    fn clear_blocks(
        &mut self,
        player_id: u8,
        x: i32,
        y: i32,
        z: i32,
        action: BlockActionKind,
        spade_swing: bool,
    ) {
        let mut targets = vec![(x, y, z)];
        if spade_swing {
            targets.extend([(x, y, z - 1), (x, y, z + 1)]);
        } else if action == BlockActionKind::Grenade {
            for ax in x - 1..=x + 1 {
                for ay in y - 1..=y + 1 {
                    for az in z - 1..=z + 1 {
                        targets.push((ax, ay, az));
                    }
                }
            }
        }

        for (ax, ay, az) in targets {
            if self.map.can_build(ax, ay, az) {
                self.map.set_point(ax, ay, az, false, 0);
            }
        }

        self.broadcast(
            &Packet::BlockAction {
                player_id,
                action,
                x,
                y,
                z,
            },
            Target::All,
        );
    }

    pub fn play_sound_to(&self, peer: PeerId, sound: &Sound) {
        self.play_sound(sound, Target::Only(vec![peer]));
    }

    /// Sends `message` to one player, wrapped into chat-sized lines.
    pub fn send_message(&self, peer: PeerId, message: &str, chat_type: ChatType, player_id: u8) {
        for line in wrap_text(message, MAX_CHAT_SIZE) {
            self.send_to(
                peer,
                &Packet::ChatMessage {
                    player_id,
                    chat_type,
                    value: line,
                },
            );
        }
    }

    pub fn send_chat_message(&self, peer: PeerId, message: &str, sender_id: u8, team: bool) {
        let chat_type = if team { ChatType::Team } else { ChatType::All };
        self.send_message(peer, message, chat_type, sender_id);
    }

    pub fn send_server_message(&self, peer: PeerId, message: &str) {
        self.send_message(
            peer,
            &format!("[*] {}", message),
            ChatType::System,
            SYSTEM_PLAYER_ID,
        );
    }

    pub fn send_hud_message(&self, peer: PeerId, message: &str) {
        self.send_message(peer, message, ChatType::Big, SYSTEM_PLAYER_ID);
    }

    // World operations

    /// Queues `packet` on the reliable channel.
    pub fn broadcast(&self, packet: &Packet, target: Target<'_>) {
        self.send_packet(packet, target, Channel::Reliable);
    }

    fn send_packet(&self, packet: &Packet, target: Target<'_>, channel: Channel) {
        let active = self
            .connections
            .values()
            .filter(|c| c.state == ConnectionState::Active);
        let peers: Vec<PeerId> = match target {
            Target::All => active.map(|c| c.peer).collect(),
            Target::Filter(predicate) => active.filter(|c| predicate(c)).map(|c| c.peer).collect(),
            Target::Only(peers) => peers,
        };
        self.outbox.send(peers, channel, packet);
    }

    pub fn send_to(&self, peer: PeerId, packet: &Packet) {
        self.outbox.send_to(peer, packet);
    }

    /// Broadcast to every active peer except `peer`.
    fn relay(&self, peer: PeerId, packet: &Packet) {
        self.broadcast(packet, Target::Filter(&|c: &Connection| c.peer != peer));
    }

    pub fn broadcast_message(
        &self,
        message: &str,
        chat_type: ChatType,
        player_id: u8,
        team: Option<TeamId>,
    ) {
        for line in wrap_text(message, MAX_CHAT_SIZE) {
            let packet = Packet::ChatMessage {
                player_id,
                chat_type,
                value: line,
            };
            match team {
                Some(team) => {
                    self.broadcast(&packet, Target::Filter(&|c: &Connection| c.team == team))
                }
                None => self.broadcast(&packet, Target::All),
            }
        }
    }

    pub fn broadcast_chat_message(&self, message: &str, sender_id: u8, team: Option<TeamId>) {
        let chat_type = if team.is_some() {
            ChatType::Team
        } else {
            ChatType::All
        };
        self.broadcast_message(message, chat_type, sender_id, team);
    }

    pub fn broadcast_server_message(&self, message: &str, team: Option<TeamId>) {
        self.broadcast_message(message, ChatType::System, SYSTEM_PLAYER_ID, team);
    }

    pub fn broadcast_hud_message(&self, message: &str, team: Option<TeamId>) {
        self.broadcast_message(message, ChatType::Big, SYSTEM_PLAYER_ID, team);
    }

    /// Changes the fog for everyone. Components are masked to 8 bits; with
    /// `save` unset the change is not sent to clients joining later.
    pub fn set_fog_color(&mut self, r: u32, g: u32, b: u32, save: bool) {
        let color = Color::new((r & 0xFF) as u8, (g & 0xFF) as u8, (b & 0xFF) as u8);
        if save {
            self.fog_color = color;
        }
        self.broadcast(&Packet::FogColor { color }, Target::All);
    }

    /// The `StateData` packet for a client finishing its handshake.
    pub fn get_state(&self, player_id: u8) -> Packet {
        Packet::StateData {
            player_id,
            fog_color: self.fog_color,
            team1: self.teams.team1().to_state(),
            team2: self.teams.team2().to_state(),
            mode_name: self.mode.name().to_string(),
            score_limit: self.mode.score_limit(),
            entities: self.entities.values().map(Entity::to_wire).collect(),
        }
    }

    pub fn get_ply_by_name(&self, name: &str) -> Option<&Connection> {
        self.players()
            .find(|player| player.name.as_deref() == Some(name))
    }

    /// Announces the entity before it becomes part of the world.
    pub fn create_entity(
        &mut self,
        kind: EntityKind,
        position: Vec3,
        team: Option<TeamId>,
    ) -> Result<u8, PoolError> {
        let id = self.entity_ids.pop()?;
        let entity = Entity::new(id, kind, position, team);
        self.broadcast(
            &Packet::CreateEntity {
                entity: entity.to_wire(),
            },
            Target::All,
        );
        self.entities.insert(id, entity);
        Ok(id)
    }

    pub fn destroy_entity(&mut self, entity_id: u8) -> ServerResult<()> {
        if !self.entities.contains_key(&entity_id) {
            return Ok(());
        }
        self.broadcast(&Packet::DestroyEntity { entity_id }, Target::All);
        self.entities.remove(&entity_id);
        self.entity_ids.push(entity_id)?;
        Ok(())
    }

    /// Only looping sounds get an id and stay registered until destroyed.
    pub fn create_sound(
        &mut self,
        name: &str,
        position: Option<Vec3>,
        looping: bool,
    ) -> Result<Sound, PoolError> {
        let id = if looping {
            Some(self.sound_ids.pop()?)
        } else {
            None
        };
        let sound = Sound::new(id, name, position);
        if let Some(id) = id {
            self.sounds.insert(id, sound.clone());
        }
        Ok(sound)
    }

    pub fn play_sound(&self, sound: &Sound, target: Target<'_>) {
        self.broadcast(
            &Packet::PlaySound {
                sound: sound.to_wire(),
            },
            target,
        );
    }

    pub fn destroy_sound(&mut self, sound_id: u8) -> ServerResult<()> {
        if self.sounds.remove(&sound_id).is_none() {
            return Ok(());
        }
        self.sound_ids.push(sound_id)?;
        self.broadcast(&Packet::StopSound { sound_id }, Target::All);
        Ok(())
    }

    pub fn create_object(&mut self, object: Explosive) {
        self.objects.push(object);
    }

    /// Runs `f` with a temporary colour slot. The slot is returned to the
    /// pool afterwards whatever `f` does; a panic in `f` is resumed after
    /// the slot is back.
    pub fn block_color<R>(&mut self, f: impl FnOnce(&mut Self, u8) -> R) -> Result<R, PoolError> {
        let slot = self.color_ids.pop()?;
        let result = panic::catch_unwind(AssertUnwindSafe(|| f(self, slot)));
        self.color_ids.push(slot)?;
        match result {
            Ok(result) => Ok(result),
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    /// Places a block in an arbitrary colour on behalf of the server, using a
    /// colour slot so no player's block colour is disturbed.
    pub fn place_block(&mut self, x: i32, y: i32, z: i32, color: Color) -> Result<bool, PoolError> {
        if !self.map.can_build(x, y, z) {
            return Ok(false);
        }
        self.block_color(|protocol, slot| {
            if !protocol.map.set_point(x, y, z, true, color.to_voxel(BLOCK_ALPHA)) {
                return false;
            }
            protocol.broadcast(
                &Packet::SetColor {
                    player_id: slot,
                    color,
                },
                Target::All,
            );
            protocol.broadcast(
                &Packet::BlockAction {
                    player_id: slot,
                    action: BlockActionKind::Build,
                    x,
                    y,
                    z,
                },
                Target::All,
            );
            true
        })
    }

    // Tick

    pub async fn tick(&mut self, dt: f32) -> ServerResult<()> {
        self.time += dt as f64;
        let now = self.time;

        let carried: Vec<(u8, Option<Vec3>)> = self
            .entities
            .values()
            .map(|e| (e.id, e.carrier.and_then(|c| self.player(c)).map(Connection::position)))
            .collect();
        for (id, carrier_position) in carried {
            if let Some(entity) = self.entities.get_mut(&id) {
                entity.update(dt, carrier_position);
            }
        }

        let respawning: Vec<PeerId> = self
            .connections
            .values()
            .filter(|c| c.pending_respawn.map_or(false, |at| now >= at))
            .map(|c| c.peer)
            .collect();
        for peer in respawning {
            if let Some(connection) = self.connections.get_mut(&peer) {
                connection.pending_respawn = None;
            }
            self.spawn(peer, None).await?;
        }

        let peers: Vec<PeerId> = self.players.values().copied().collect();
        for peer in peers {
            self.update_player(peer, dt, now).await?;
        }

        let mut detonated = Vec::new();
        {
            let map = self.map.as_ref();
            self.objects.retain_mut(|object| {
                if object.update(dt, map) {
                    detonated.push(object.clone());
                    false
                } else {
                    true
                }
            });
        }
        for blast in detonated {
            self.detonate(blast).await?;
        }

        self.mode.update(dt);
        self.world_update();
        Ok(())
    }

    async fn update_player(&mut self, peer: PeerId, dt: f32, now: f64) -> ServerResult<()> {
        let Some(connection) = self.connections.get_mut(&peer) else {
            return Ok(());
        };
        let (true, Some(player_id)) = (connection.is_alive(), connection.player_id) else {
            return Ok(());
        };

        let fall_damage = connection.body.update(dt, now);

        let mut events = Vec::new();
        if connection.tool != Tool::Weapon {
            events.extend(connection.loadout.weapon.poll_reload(now));
        }
        events.extend(connection.equipped_mut().update(now));

        for event in events {
            if let ToolEvent::Reloaded { clip, reserve } = event {
                self.send_to(
                    peer,
                    &Packet::WeaponReload {
                        player_id,
                        clip_ammo: clip,
                        reserve_ammo: reserve,
                    },
                );
            }
        }

        if fall_damage > 0 {
            self.hurt(peer, fall_damage, KillType::Fall, None, None)
                .await?;
        }
        Ok(())
    }

    /// A blast whose thrower has left still goes off, but credits no one and
    /// skips the destroy hooks.
    async fn detonate(&mut self, blast: Explosive) -> ServerResult<()> {
        let owner = self
            .connections
            .get(&blast.peer)
            .filter(|c| c.player_id == Some(blast.owner))
            .map(|c| c.peer);
        let (x, y, z) = blast.block();
        match owner {
            Some(peer) => {
                self.destroy_block(peer, x, y, z, BlockActionKind::Grenade)
                    .await;
            }
            None => self.clear_blocks(SYSTEM_PLAYER_ID, x, y, z, BlockActionKind::Grenade, false),
        }

        let victims: Vec<(PeerId, i32)> = self
            .players()
            .filter(|c| c.is_alive())
            .filter_map(|c| blast.damage_at(c.position()).map(|damage| (c.peer, damage)))
            .collect();
        for (victim, damage) in victims {
            self.hurt(victim, damage, KillType::Grenade, owner, Some(blast.position))
                .await?;
        }
        Ok(())
    }

    /// Best-effort snapshot of every named, living player.
    fn world_update(&self) {
        let players: Vec<PlayerSnapshot> = self.players().filter_map(Connection::snapshot).collect();
        self.send_packet(&Packet::WorldUpdate { players }, Target::All, Channel::Unreliable);
    }
}

/// Greedy word wrap. Words longer than `width` are split; whitespace runs
/// collapse to one space. Blank input yields no lines.
pub fn wrap_text(text: &str, width: usize) -> Vec<String> {
    let mut lines = Vec::new();
    let mut line = String::new();
    let mut line_len = 0;

    for word in text.split_whitespace() {
        let mut word: Vec<char> = word.chars().collect();
        loop {
            let space = usize::from(line_len > 0);
            if line_len + space + word.len() <= width {
                if space == 1 {
                    line.push(' ');
                }
                line.extend(word.iter());
                line_len += space + word.len();
                break;
            }
            if line_len > 0 {
                lines.push(std::mem::take(&mut line));
                line_len = 0;
                continue;
            }
            let rest = word.split_off(width);
            lines.push(word.into_iter().collect());
            word = rest;
        }
    }
    if line_len > 0 {
        lines.push(line);
    }
    lines
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::GameMessage;
    use tokio::sync::mpsc;

    fn protocol() -> (Protocol, mpsc::UnboundedReceiver<GameMessage>) {
        let (game_tx, game_rx) = mpsc::unbounded_channel();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();
        let config = ServerConfig {
            map_width: 16,
            map_length: 16,
            map_depth: 16,
            ground_height: 8,
            ..ServerConfig::default()
        };
        let map = FlatMap::new(16, 16, 16, 8);
        let protocol = Protocol::with_world(
            config,
            Vec::new(),
            Outbox::new(game_tx),
            events_tx,
            Box::new(map),
            Box::new(FreeForAll::with_seed(1)),
        );
        (protocol, game_rx)
    }

    fn sent(rx: &mut mpsc::UnboundedReceiver<GameMessage>) -> Vec<(Vec<PeerId>, Packet)> {
        let mut out = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let GameMessage::Send { peers, payload, .. } = message {
                out.push((peers, decode_packet(&payload).unwrap()));
            }
        }
        out
    }

    #[test]
    fn test_wrap_text() {
        assert!(wrap_text("   ", 10).is_empty());
        assert_eq!(wrap_text("hello world", 90), vec!["hello world"]);
        assert_eq!(
            wrap_text("the quick brown fox", 10),
            vec!["the quick", "brown fox"]
        );
        assert_eq!(wrap_text("abcdefghijkl", 5), vec!["abcde", "fghij", "kl"]);
        for line in wrap_text(&"word ".repeat(60), MAX_CHAT_SIZE) {
            assert!(line.chars().count() <= MAX_CHAT_SIZE);
        }
    }

    #[test]
    fn test_respawn_time_cadence() {
        let (mut protocol, _rx) = protocol();
        assert_eq!(protocol.get_respawn_time(), 5);
        protocol.time = 3.5;
        assert_eq!(protocol.get_respawn_time(), 2);
        protocol.time = 9.9;
        assert_eq!(protocol.get_respawn_time(), 1);
    }

    #[test]
    fn test_default_names() {
        let (protocol, _rx) = protocol();
        assert_eq!(protocol.validate_name(3, "  "), "Deuce3");
        assert_eq!(protocol.validate_name(3, "Deuce"), "Deuce3");
        assert_eq!(
            protocol.validate_name(0, "a_very_long_player_name"),
            "a_very_long_pla"
        );
    }

    #[test]
    fn test_entity_lifecycle() {
        let (mut protocol, mut rx) = protocol();
        let id = protocol
            .create_entity(EntityKind::Crate, Vec3::new(1.0, 1.0, 7.0), None)
            .unwrap();
        assert!(protocol.entities().contains_key(&id));
        assert!(!protocol.entity_ids.is_free(id));

        protocol.destroy_entity(id).unwrap();
        assert!(protocol.entities().is_empty());
        assert!(protocol.entity_ids.is_free(id));
        // Destroying twice is a no-op, not a double free.
        protocol.destroy_entity(id).unwrap();
        // Nobody is active, so nothing was queued.
        assert!(sent(&mut rx).is_empty());
    }

    #[test]
    fn test_sound_ids() {
        let (mut protocol, _rx) = protocol();
        let once = protocol.create_sound("pop", None, false).unwrap();
        assert!(once.id.is_none());
        assert!(protocol.sounds().is_empty());

        let looping = protocol.create_sound("horn", None, true).unwrap();
        let id = looping.id.unwrap();
        assert!(protocol.sounds().contains_key(&id));

        protocol.destroy_sound(id).unwrap();
        assert!(protocol.sounds().is_empty());
        assert!(protocol.sound_ids.is_free(id));
    }

    #[test]
    fn test_block_color_slot_is_released() {
        let (mut protocol, _rx) = protocol();
        let before = protocol.color_ids.available();
        let slot = protocol
            .block_color(|protocol, slot| {
                assert!(!protocol.color_ids.is_free(slot));
                slot
            })
            .unwrap();
        assert!(slot >= MAX_PLAYERS);
        assert_eq!(protocol.color_ids.available(), before);
    }

    #[test]
    fn test_block_color_slot_survives_panic() {
        let (mut protocol, _rx) = protocol();
        let before = protocol.color_ids.available();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            protocol.block_color(|_, _| -> () { panic!("placement failed") })
        }));
        assert!(outcome.is_err());
        assert_eq!(protocol.color_ids.available(), before);
    }

    #[test]
    fn test_only_target_skips_state_filter() {
        let (mut protocol, mut rx) = protocol();
        // Neither peer is connected, let alone active.
        protocol.broadcast(&Packet::PlayerLeft { player_id: 3 }, Target::Only(vec![4, 9]));
        protocol.broadcast(&Packet::PlayerLeft { player_id: 3 }, Target::All);

        let out = sent(&mut rx);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].0, vec![4, 9]);

        let sound = protocol.create_sound("horn", None, false).unwrap();
        protocol.play_sound_to(4, &sound);
        assert!(matches!(&sent(&mut rx)[..], [(peers, Packet::PlaySound { .. })] if peers == &vec![4]));
    }

    #[test]
    fn test_place_block() {
        let (mut protocol, _rx) = protocol();
        assert_eq!(protocol.place_block(2, 2, 7, Color::new(255, 0, 0)), Ok(true));
        assert_eq!(protocol.map().get_z(2, 2), 7);
        // Below the water line nothing can be built.
        assert_eq!(protocol.place_block(2, 2, 15, Color::new(255, 0, 0)), Ok(false));
    }

    #[test]
    fn test_fog_color_save() {
        let (mut protocol, _rx) = protocol();
        protocol.set_fog_color(0x1FF, 2, 3, false);
        assert_eq!(protocol.fog_color(), ServerConfig::default().fog_color);
        protocol.set_fog_color(0x1FF, 2, 3, true);
        assert_eq!(protocol.fog_color(), Color::new(0xFF, 2, 3));
    }

    #[tokio::test]
    async fn test_wrong_version_is_refused() {
        let (mut protocol, mut rx) = protocol();
        protocol
            .handle(ServerMessage::PeerConnected {
                peer: 1,
                version: PROTOCOL_VERSION + 1,
            })
            .await
            .unwrap();

        assert_eq!(protocol.connection_count(), 0);
        assert!(matches!(
            rx.try_recv().unwrap(),
            GameMessage::Disconnect {
                peer: 1,
                reason: DisconnectReason::WrongVersion
            }
        ));
    }

    #[tokio::test]
    async fn test_player_slots_run_out() {
        let (mut protocol, mut rx) = protocol();
        for peer in 0..MAX_PLAYERS as PeerId {
            protocol
                .handle(ServerMessage::PeerConnected {
                    peer,
                    version: PROTOCOL_VERSION,
                })
                .await
                .unwrap();
        }
        assert_eq!(protocol.free_player_ids(), 0);
        while rx.try_recv().is_ok() {}

        protocol
            .handle(ServerMessage::PeerConnected {
                peer: 100,
                version: PROTOCOL_VERSION,
            })
            .await
            .unwrap();
        assert!(matches!(
            rx.try_recv().unwrap(),
            GameMessage::Disconnect {
                peer: 100,
                reason: DisconnectReason::ServerFull
            }
        ));

        protocol
            .handle(ServerMessage::PeerDisconnected { peer: 0 })
            .await
            .unwrap();
        assert_eq!(protocol.free_player_ids(), 1);
    }
}
