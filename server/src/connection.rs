//! Per-peer session state and the handshake stream.
//!
//! A [`Connection`] moves through `Connecting -> Handshaking -> Active ->
//! Disconnected`. While handshaking, a separate task ([`Handshake`]) pushes
//! packs through the outbox; the only packets the client may send during
//! that phase are answers to pending waits.

use crate::client_manager::PeerId;
use crate::config::Pack;
use crate::error::WaitError;
use crate::hooks::PlayerInfo;
use crate::network::{Outbox, ServerMessage};
use crate::physics::{KinematicBody, PlayerBody};
use crate::tools::{Equipment, Loadout};
use flate2::write::ZlibEncoder;
use flate2::Compression;
use futures::future::BoxFuture;
use futures::FutureExt;
use log::{debug, warn};
use shared::{
    Packet, PacketKind, PlayerSnapshot, TeamId, Tool, Vec3, WeaponKind, CHUNK_SIZE, MAX_HP,
};
use std::collections::{HashMap, VecDeque};
use std::io::{self, Write};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// A pending correlated wait. Resolves to the first matching packet that
/// arrives after registration.
pub type PacketWait = BoxFuture<'static, Result<Packet, WaitError>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Handshaking,
    Active,
    Disconnected,
}

pub struct Connection {
    pub peer: PeerId,
    pub state: ConnectionState,
    /// Assigned once the protocol version has been accepted
    pub player_id: Option<u8>,
    pub name: Option<String>,
    pub team: TeamId,
    pub hp: u8,
    /// Equipped tool
    pub tool: Tool,
    pub loadout: Loadout,
    pub kills: u32,
    pub body: Box<dyn PlayerBody>,
    /// Set once the client has picked a team and name
    pub joined: bool,
    /// Server time at which the player comes back after dying
    pub pending_respawn: Option<f64>,
    waiters: HashMap<PacketKind, VecDeque<oneshot::Sender<Packet>>>,
}

impl Connection {
    pub fn new(peer: PeerId, now: f64) -> Self {
        Self {
            peer,
            state: ConnectionState::Connecting,
            player_id: None,
            name: None,
            team: TeamId::Spectator,
            hp: MAX_HP,
            tool: Tool::Weapon,
            loadout: Loadout::new(WeaponKind::Semi, now),
            kills: 0,
            body: Box::new(KinematicBody::default()),
            joined: false,
            pending_respawn: None,
            waiters: HashMap::new(),
        }
    }

    pub fn is_dead(&self) -> bool {
        self.body.is_dead()
    }

    /// Joined and not dead. Only living players move, shoot or build.
    pub fn is_alive(&self) -> bool {
        self.joined && !self.body.is_dead()
    }

    pub fn position(&self) -> Vec3 {
        self.body.position()
    }

    pub fn orientation(&self) -> Vec3 {
        self.body.orientation()
    }

    pub fn eye(&self) -> Vec3 {
        self.body.eye()
    }

    pub fn weapon_kind(&self) -> WeaponKind {
        self.loadout.weapon.kind
    }

    pub fn equipped(&self) -> &dyn Equipment {
        self.loadout.get(self.tool)
    }

    pub fn equipped_mut(&mut self) -> &mut dyn Equipment {
        self.loadout.get_mut(self.tool)
    }

    /// Registers interest in the next packet of `kind`.
    ///
    /// Registration happens immediately, so a reply that arrives before the
    /// returned future is first polled is not lost. The timeout starts on
    /// first poll. Dropping the connection's waiters resolves the future
    /// with [`WaitError::Cancelled`].
    pub fn wait_for(&mut self, kind: PacketKind, timeout: Duration) -> PacketWait {
        let (tx, rx) = oneshot::channel();
        self.waiters.entry(kind).or_default().push_back(tx);

        async move {
            match tokio::time::timeout(timeout, rx).await {
                Ok(Ok(packet)) => Ok(packet),
                Ok(Err(_)) => Err(WaitError::Cancelled),
                Err(_) => Err(WaitError::Timeout),
            }
        }
        .boxed()
    }

    /// Hands `packet` to the oldest live waiter for its kind. Waiters whose
    /// futures were dropped (timed out) are skipped. Returns true if one
    /// took it.
    pub fn resolve_waiter(&mut self, packet: &Packet) -> bool {
        let kind = packet.kind();
        let Some(queue) = self.waiters.get_mut(&kind) else {
            return false;
        };

        let mut resolved = false;
        while let Some(waiter) = queue.pop_front() {
            if waiter.send(packet.clone()).is_ok() {
                resolved = true;
                break;
            }
        }
        if queue.is_empty() {
            self.waiters.remove(&kind);
        }
        resolved
    }

    pub fn pending_waits(&self) -> usize {
        self.waiters.values().map(VecDeque::len).sum()
    }

    pub fn cancel_waits(&mut self) {
        self.waiters.clear();
    }

    pub fn info(&self) -> Option<PlayerInfo> {
        Some(PlayerInfo {
            player_id: self.player_id?,
            name: self.name.clone().unwrap_or_default(),
            team: self.team,
        })
    }

    /// Roster entry sent to clients that finish their handshake later.
    pub fn to_existing_player(&self) -> Option<Packet> {
        Some(Packet::ExistingPlayer {
            player_id: self.player_id?,
            team: self.team,
            weapon: self.weapon_kind(),
            tool: self.tool,
            kills: self.kills,
            color: self.loadout.block.color,
            name: self.name.clone()?,
        })
    }

    /// World update entry, for named living players only.
    pub fn snapshot(&self) -> Option<PlayerSnapshot> {
        if !self.is_alive() || self.name.is_none() {
            return None;
        }
        Some(PlayerSnapshot {
            player_id: self.player_id?,
            position: self.position(),
            orientation: self.orientation(),
        })
    }
}

pub fn compress_map(bytes: &[u8]) -> io::Result<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
    encoder.write_all(bytes)?;
    encoder.finish()
}

/// Queues the compressed map for `peer` as `MapStart` followed by
/// `CHUNK_SIZE` chunks. Returns the compressed size.
pub fn send_map(outbox: &Outbox, peer: PeerId, map: &[u8]) -> io::Result<usize> {
    let compressed = compress_map(map)?;
    outbox.send_to(
        peer,
        &Packet::MapStart {
            size: compressed.len() as u32,
        },
    );
    for chunk in compressed.chunks(CHUNK_SIZE) {
        outbox.send_to(
            peer,
            &Packet::MapChunk {
                data: chunk.to_vec(),
            },
        );
    }
    Ok(compressed.len())
}

/// Streams packs to one peer outside the server loop.
///
/// Reports back with `PacksStreamed`. The loop then re-checks that the peer
/// is still handshaking and sends the map, game state and roster in one
/// step, so no world change can fall between the map snapshot and the peer
/// becoming active.
pub struct Handshake {
    pub peer: PeerId,
    pub packs: Arc<Vec<Pack>>,
    /// One pre-registered `PackResponse` wait per pack, in pack order
    pub pack_replies: Vec<PacketWait>,
    pub outbox: Outbox,
    pub events: mpsc::UnboundedSender<ServerMessage>,
}

impl Handshake {
    pub async fn run(self) {
        let peer = self.peer;
        let events = self.events.clone();

        if self.stream().await.is_err() {
            debug!("Handshake with peer {} cancelled", peer);
            return;
        }
        if events.send(ServerMessage::PacksStreamed { peer }).is_err() {
            debug!("Server loop gone before handshake of peer {} finished", peer);
        }
    }

    /// Fails only when the connection went away mid-stream.
    async fn stream(self) -> Result<(), WaitError> {
        let Handshake {
            peer,
            packs,
            pack_replies,
            outbox,
            ..
        } = self;

        for (pack, reply) in packs.iter().zip(pack_replies) {
            outbox.send_to(
                peer,
                &Packet::PackStart {
                    size: pack.size(),
                    checksum: pack.checksum,
                },
            );

            let cached = match reply.await {
                Ok(Packet::PackResponse { cached }) => cached,
                Ok(other) => {
                    warn!("Peer {} answered pack offer with {:?}", peer, other.kind());
                    false
                }
                Err(WaitError::Timeout) => {
                    warn!("Peer {} never answered pack offer, sending pack", peer);
                    false
                }
                Err(WaitError::Cancelled) => return Err(WaitError::Cancelled),
            };

            if !cached {
                for chunk in pack.data.chunks(CHUNK_SIZE) {
                    outbox.send_to(
                        peer,
                        &Packet::PackChunk {
                            data: chunk.to_vec(),
                        },
                    );
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::GameMessage;
    use flate2::read::ZlibDecoder;
    use shared::decode_packet;
    use std::io::Read;

    fn drain(rx: &mut mpsc::UnboundedReceiver<GameMessage>) -> Vec<Packet> {
        let mut packets = Vec::new();
        while let Ok(message) = rx.try_recv() {
            if let GameMessage::Send { payload, .. } = message {
                packets.push(decode_packet(&payload).unwrap());
            }
        }
        packets
    }

    #[tokio::test]
    async fn test_wait_for_resolves() {
        let mut conn = Connection::new(1, 0.0);
        let wait = conn.wait_for(PacketKind::PackResponse, Duration::from_secs(1));
        assert_eq!(conn.pending_waits(), 1);

        assert!(conn.resolve_waiter(&Packet::PackResponse { cached: true }));
        assert_eq!(wait.await, Ok(Packet::PackResponse { cached: true }));
        assert_eq!(conn.pending_waits(), 0);
    }

    #[tokio::test]
    async fn test_wait_stays_pending_until_resolved() {
        let mut conn = Connection::new(1, 0.0);
        let mut wait = tokio_test::task::spawn(
            conn.wait_for(PacketKind::PackResponse, Duration::from_secs(1)),
        );
        tokio_test::assert_pending!(wait.poll());

        conn.resolve_waiter(&Packet::PackResponse { cached: false });
        assert!(wait.is_woken());
        let reply = tokio_test::assert_ready!(wait.poll());
        assert_eq!(reply, Ok(Packet::PackResponse { cached: false }));
    }

    #[tokio::test]
    async fn test_waiters_resolve_in_order() {
        let mut conn = Connection::new(1, 0.0);
        let first = conn.wait_for(PacketKind::PackResponse, Duration::from_secs(1));
        let second = conn.wait_for(PacketKind::PackResponse, Duration::from_secs(1));

        assert!(conn.resolve_waiter(&Packet::PackResponse { cached: false }));
        assert!(conn.resolve_waiter(&Packet::PackResponse { cached: true }));
        assert!(!conn.resolve_waiter(&Packet::PackResponse { cached: true }));

        assert_eq!(first.await, Ok(Packet::PackResponse { cached: false }));
        assert_eq!(second.await, Ok(Packet::PackResponse { cached: true }));
    }

    #[tokio::test]
    async fn test_unrelated_packet_does_not_resolve() {
        let mut conn = Connection::new(1, 0.0);
        let _wait = conn.wait_for(PacketKind::PackResponse, Duration::from_secs(1));
        assert!(!conn.resolve_waiter(&Packet::PlayerLeft { player_id: 0 }));
        assert_eq!(conn.pending_waits(), 1);
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let mut conn = Connection::new(1, 0.0);
        let wait = conn.wait_for(PacketKind::PackResponse, Duration::from_millis(10));
        assert_eq!(wait.await, Err(WaitError::Timeout));

        // The stale waiter is skipped, not handed the packet.
        assert!(!conn.resolve_waiter(&Packet::PackResponse { cached: true }));
    }

    #[tokio::test]
    async fn test_cancel_waits() {
        let mut conn = Connection::new(1, 0.0);
        let wait = conn.wait_for(PacketKind::PackResponse, Duration::from_secs(5));
        conn.cancel_waits();
        assert_eq!(wait.await, Err(WaitError::Cancelled));
    }

    #[test]
    fn test_roster_entry_needs_name() {
        let mut conn = Connection::new(1, 0.0);
        conn.player_id = Some(4);
        assert!(conn.to_existing_player().is_none());

        conn.name = Some("alice".into());
        conn.team = TeamId::Team2;
        match conn.to_existing_player() {
            Some(Packet::ExistingPlayer {
                player_id,
                team,
                name,
                tool,
                ..
            }) => {
                assert_eq!(player_id, 4);
                assert_eq!(team, TeamId::Team2);
                assert_eq!(name, "alice");
                assert_eq!(tool, Tool::Weapon);
            }
            other => panic!("Unexpected packet {:?}", other),
        }
    }

    #[test]
    fn test_new_connection_is_not_alive() {
        let conn = Connection::new(1, 0.0);
        assert_eq!(conn.state, ConnectionState::Connecting);
        assert!(conn.is_dead());
        assert!(!conn.is_alive());
        assert!(conn.snapshot().is_none());
        assert_eq!(conn.hp, MAX_HP);
    }

    #[tokio::test]
    async fn test_handshake_streams_packs() {
        let (game_tx, mut game_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut conn = Connection::new(7, 0.0);

        let packs = Arc::new(vec![
            Pack::new(vec![1u8; CHUNK_SIZE + 10]),
            Pack::new(vec![2u8; 10]),
        ]);
        let pack_replies = packs
            .iter()
            .map(|_| conn.wait_for(PacketKind::PackResponse, Duration::from_secs(1)))
            .collect();
        // First pack must be downloaded, second one is cached.
        conn.resolve_waiter(&Packet::PackResponse { cached: false });
        conn.resolve_waiter(&Packet::PackResponse { cached: true });

        Handshake {
            peer: 7,
            packs: Arc::clone(&packs),
            pack_replies,
            outbox: Outbox::new(game_tx),
            events: events_tx,
        }
        .run()
        .await;

        assert!(matches!(
            events_rx.recv().await,
            Some(ServerMessage::PacksStreamed { peer: 7 })
        ));

        let kinds: Vec<PacketKind> = drain(&mut game_rx).iter().map(Packet::kind).collect();
        assert_eq!(
            kinds,
            vec![
                PacketKind::PackStart,
                PacketKind::PackChunk,
                PacketKind::PackChunk,
                PacketKind::PackStart,
            ]
        );
    }

    #[test]
    fn test_send_map_chunks_compressed_bytes() {
        let (game_tx, mut game_rx) = mpsc::unbounded_channel();
        let map = vec![0xAAu8; 4 * CHUNK_SIZE];

        let size = send_map(&Outbox::new(game_tx), 7, &map).unwrap();

        let packets = drain(&mut game_rx);
        assert!(matches!(packets[0], Packet::MapStart { size: s } if s as usize == size));
        let mut compressed = Vec::new();
        for packet in &packets[1..] {
            match packet {
                Packet::MapChunk { data } => {
                    assert!(data.len() <= CHUNK_SIZE);
                    compressed.extend_from_slice(data);
                }
                other => panic!("Unexpected packet {:?}", other),
            }
        }
        assert_eq!(compressed.len(), size);
        let mut inflated = Vec::new();
        ZlibDecoder::new(&compressed[..])
            .read_to_end(&mut inflated)
            .unwrap();
        assert_eq!(inflated, map);
    }

    #[tokio::test]
    async fn test_handshake_cancelled_on_disconnect() {
        let (game_tx, _game_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut conn = Connection::new(3, 0.0);

        let packs = Arc::new(vec![Pack::new(vec![5u8; 16])]);
        let pack_replies = vec![conn.wait_for(PacketKind::PackResponse, Duration::from_secs(5))];
        drop(conn);

        Handshake {
            peer: 3,
            packs,
            pack_replies,
            outbox: Outbox::new(game_tx),
            events: events_tx,
        }
        .run()
        .await;

        assert!(events_rx.try_recv().is_err());
    }
}
