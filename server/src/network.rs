//! Server network layer handling UDP communications and game loop coordination

use crate::client_manager::{ClientManager, PeerId, PEER_TIMEOUT, RESEND_AFTER};
use crate::config::{Pack, ServerConfig};
use crate::error::ServerResult;
use crate::protocol::Protocol;
use log::{debug, error, info, warn};
use shared::codec::MAX_FRAME_SIZE;
use shared::{decode_frame, encode_frame, encode_packet, DisconnectReason, Frame, Packet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

/// How often unacknowledged frames and silent peers are checked
const MAINTENANCE_INTERVAL: Duration = Duration::from_millis(50);

/// How long shutdown waits for queued frames to leave the socket
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Messages sent from network and handshake tasks to the main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PeerConnected { peer: PeerId, version: u32 },
    PacketReceived { peer: PeerId, payload: Vec<u8> },
    PeerDisconnected { peer: PeerId },
    PeerTimeout { peer: PeerId },
    /// Every pack for this peer has been queued
    PacksStreamed { peer: PeerId },
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Acknowledged, retransmitted and delivered in order
    Reliable,
    /// Fire and forget
    Unreliable,
}

/// Messages sent from the game loop to the network sender task
#[derive(Debug)]
pub enum GameMessage {
    Send {
        peers: Vec<PeerId>,
        channel: Channel,
        payload: Vec<u8>,
    },
    Disconnect {
        peer: PeerId,
        reason: DisconnectReason,
    },
    /// Answered once every message queued before it has been sent
    Flush { done: oneshot::Sender<()> },
}

/// Outbound queue handle. Cheap to clone; handshake tasks hold their own.
#[derive(Debug, Clone)]
pub struct Outbox {
    tx: mpsc::UnboundedSender<GameMessage>,
}

impl Outbox {
    pub fn new(tx: mpsc::UnboundedSender<GameMessage>) -> Self {
        Self { tx }
    }

    /// Encodes `packet` once and queues it for every peer in `peers`
    pub fn send(&self, peers: Vec<PeerId>, channel: Channel, packet: &Packet) {
        if peers.is_empty() {
            return;
        }
        let payload = match encode_packet(packet) {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode {:?}: {}", packet.kind(), e);
                return;
            }
        };
        self.push(GameMessage::Send {
            peers,
            channel,
            payload,
        });
    }

    pub fn send_to(&self, peer: PeerId, packet: &Packet) {
        self.send(vec![peer], Channel::Reliable, packet);
    }

    pub fn disconnect(&self, peer: PeerId, reason: DisconnectReason) {
        self.push(GameMessage::Disconnect { peer, reason });
    }

    pub fn flush(&self) -> oneshot::Receiver<()> {
        let (done, rx) = oneshot::channel();
        self.push(GameMessage::Flush { done });
        rx
    }

    fn push(&self, message: GameMessage) {
        if let Err(e) = self.tx.send(message) {
            error!("Failed to queue outgoing message: {}", e);
        }
    }
}

/// Lets other tasks ask a running server to stop
#[derive(Debug, Clone)]
pub struct ServerHandle {
    tx: mpsc::UnboundedSender<ServerMessage>,
}

impl ServerHandle {
    pub fn shutdown(&self) {
        if self.tx.send(ServerMessage::Shutdown).is_err() {
            debug!("Server loop already stopped");
        }
    }
}

/// Main server coordinating networking and game simulation
pub struct Server {
    socket: Arc<UdpSocket>,
    clients: Arc<RwLock<ClientManager>>,
    protocol: Protocol,
    tick_duration: Duration,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_rx: Option<mpsc::UnboundedReceiver<GameMessage>>,
    outbox: Outbox,
}

impl Server {
    pub async fn new(config: ServerConfig, packs: Vec<Pack>) -> ServerResult<Self> {
        config.validate()?;
        let socket = Arc::new(UdpSocket::bind(config.addr()).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();
        let outbox = Outbox::new(game_tx);

        let tick_duration = config.tick_duration();
        let clients = Arc::new(RwLock::new(ClientManager::new(config.max_connections)));
        let protocol = Protocol::new(config, packs, outbox.clone(), server_tx.clone());

        Ok(Server {
            socket,
            clients,
            protocol,
            tick_duration,
            server_tx,
            server_rx,
            game_rx: Some(game_rx),
            outbox,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            tx: self.server_tx.clone(),
        }
    }

    /// Game modes and scripts attach their hooks through this before `run`
    pub fn protocol_mut(&mut self) -> &mut Protocol {
        &mut self.protocol
    }

    /// Spawns task that continuously listens for incoming frames
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_FRAME_SIZE as usize];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => {
                        let frame = match decode_frame(&buffer[..len]) {
                            Ok(frame) => frame,
                            Err(e) => {
                                warn!("Failed to decode frame from {}: {}", addr, e);
                                continue;
                            }
                        };
                        if let Err(e) =
                            Self::handle_frame(&socket, &clients, &server_tx, frame, addr).await
                        {
                            error!("Failed to send message to main loop: {}", e);
                            break;
                        }
                    }
                    Err(e) => {
                        error!("Error receiving frame: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Applies one inbound frame to the peer table and forwards whatever the
    /// protocol needs to see
    async fn handle_frame(
        socket: &UdpSocket,
        clients: &RwLock<ClientManager>,
        server_tx: &mpsc::UnboundedSender<ServerMessage>,
        frame: Frame,
        addr: SocketAddr,
    ) -> Result<(), mpsc::error::SendError<ServerMessage>> {
        let peer = clients.read().await.find_client_by_addr(addr);

        let Some(peer) = peer else {
            if let Frame::Connect { version } = frame {
                let added = clients.write().await.add_client(addr);
                match added {
                    Some(peer) => server_tx.send(ServerMessage::PeerConnected { peer, version })?,
                    None => {
                        warn!("Rejecting {}: server full", addr);
                        let reason = DisconnectReason::ServerFull;
                        Self::send_frame(socket, &Frame::Disconnect { reason }, addr).await;
                    }
                }
            } else {
                debug!("Ignoring frame from unknown address {}", addr);
            }
            return Ok(());
        };

        match frame {
            Frame::Connect { .. } => debug!("Duplicate connect from peer {}", peer),
            Frame::Reliable { seq, payload } => {
                let ready = {
                    let mut guard = clients.write().await;
                    guard
                        .get_mut(&peer)
                        .and_then(|client| client.receive_reliable(seq, payload))
                };
                // Refused frames stay unacked so the peer resends them.
                let Some(ready) = ready else {
                    return Ok(());
                };
                Self::send_frame(socket, &Frame::Ack { seq }, addr).await;
                for payload in ready {
                    server_tx.send(ServerMessage::PacketReceived { peer, payload })?;
                }
            }
            Frame::Unreliable { payload } => {
                if let Some(client) = clients.write().await.get_mut(&peer) {
                    client.touch();
                }
                server_tx.send(ServerMessage::PacketReceived { peer, payload })?;
            }
            Frame::Ack { seq } => {
                if let Some(client) = clients.write().await.get_mut(&peer) {
                    client.acknowledge(seq);
                }
            }
            Frame::Ping => {
                if let Some(client) = clients.write().await.get_mut(&peer) {
                    client.touch();
                }
            }
            Frame::Disconnect { reason } => {
                info!("Peer {} disconnected ({:?})", peer, reason);
                clients.write().await.remove_client(&peer);
                server_tx.send(ServerMessage::PeerDisconnected { peer })?;
            }
        }
        Ok(())
    }

    /// Spawns task that processes outgoing message queue
    fn spawn_network_sender(&mut self) -> Option<JoinHandle<()>> {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let mut game_rx = self.game_rx.take()?;

        Some(tokio::spawn(async move {
            while let Some(message) = game_rx.recv().await {
                match message {
                    GameMessage::Send {
                        peers,
                        channel,
                        payload,
                    } => {
                        let datagrams = Self::frame_for_peers(&clients, peers, channel, payload).await;
                        for (addr, bytes) in datagrams {
                            if let Err(e) = socket.send_to(&bytes, addr).await {
                                error!("Failed to send to {}: {}", addr, e);
                            }
                        }
                    }
                    GameMessage::Disconnect { peer, reason } => {
                        let client = clients.write().await.remove_client(&peer);
                        if let Some(client) = client {
                            Self::send_frame(&socket, &Frame::Disconnect { reason }, client.addr)
                                .await;
                        }
                    }
                    GameMessage::Flush { done } => {
                        let _ = done.send(());
                    }
                }
            }
        }))
    }

    async fn frame_for_peers(
        clients: &RwLock<ClientManager>,
        peers: Vec<PeerId>,
        channel: Channel,
        payload: Vec<u8>,
    ) -> Vec<(SocketAddr, Vec<u8>)> {
        let mut clients = clients.write().await;
        let mut datagrams = Vec::with_capacity(peers.len());

        match channel {
            Channel::Reliable => {
                for peer in peers {
                    let Some(client) = clients.get_mut(&peer) else {
                        continue;
                    };
                    match client.prepare_reliable(payload.clone()) {
                        Ok(bytes) => datagrams.push((client.addr, bytes)),
                        Err(e) => error!("Failed to frame packet for peer {}: {}", peer, e),
                    }
                }
            }
            Channel::Unreliable => match encode_frame(&Frame::Unreliable { payload }) {
                Ok(bytes) => {
                    for peer in peers {
                        if let Some(addr) = clients.addr_of(&peer) {
                            datagrams.push((addr, bytes.clone()));
                        }
                    }
                }
                Err(e) => error!("Failed to frame unreliable packet: {}", e),
            },
        }
        datagrams
    }

    /// Spawns task that resends unacknowledged frames and drops silent peers
    fn spawn_maintenance(&self) {
        let socket = Arc::clone(&self.socket);
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = interval(MAINTENANCE_INTERVAL);

            loop {
                interval.tick().await;

                let (resend, timed_out) = {
                    let mut clients_guard = clients.write().await;
                    (
                        clients_guard.due_retransmits(RESEND_AFTER),
                        clients_guard.check_timeouts(PEER_TIMEOUT),
                    )
                };

                for (addr, bytes) in resend {
                    if let Err(e) = socket.send_to(&bytes, addr).await {
                        error!("Failed to resend to {}: {}", addr, e);
                    }
                }

                for peer in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::PeerTimeout { peer }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn send_frame(socket: &UdpSocket, frame: &Frame, addr: SocketAddr) {
        match encode_frame(frame) {
            Ok(bytes) => {
                if let Err(e) = socket.send_to(&bytes, addr).await {
                    error!("Failed to send frame to {}: {}", addr, e);
                }
            }
            Err(e) => error!("Failed to encode frame: {}", e),
        }
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> ServerResult<()> {
        // Initialize concurrent tasks
        self.spawn_network_receiver();
        let sender = self.spawn_network_sender();
        self.spawn_maintenance();
        self.protocol.start();

        let mut tick_interval = interval(self.tick_duration);
        tick_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut last_tick = Instant::now();

        info!("Server started successfully");

        let result = loop {
            tokio::select! {
                // Handle network and handshake events
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            break Ok(());
                        }
                        Some(message) => {
                            if let Err(e) = self.protocol.handle(message).await {
                                error!("Fatal protocol error: {}", e);
                                break Err(e);
                            }
                        }
                    }
                },

                // Handle server tick events
                _ = tick_interval.tick() => {
                    let now = Instant::now();
                    let dt = now.duration_since(last_tick).as_secs_f32();
                    last_tick = now;

                    if let Err(e) = self.protocol.tick(dt).await {
                        error!("Fatal error during tick: {}", e);
                        break Err(e);
                    }
                },
            }
        };

        self.protocol.stop();
        if sender.is_some() {
            match tokio::time::timeout(FLUSH_TIMEOUT, self.outbox.flush()).await {
                Ok(_) => debug!("Outgoing queue flushed"),
                Err(_) => warn!("Gave up flushing outgoing queue"),
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shared::decode_packet;

    #[test]
    fn test_outbox_encodes_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbox = Outbox::new(tx);
        let packet = Packet::PlayerLeft { player_id: 3 };

        outbox.send(vec![1, 2], Channel::Reliable, &packet);

        match rx.try_recv().unwrap() {
            GameMessage::Send {
                peers,
                channel,
                payload,
            } => {
                assert_eq!(peers, vec![1, 2]);
                assert_eq!(channel, Channel::Reliable);
                assert_eq!(decode_packet(&payload).unwrap(), packet);
            }
            other => panic!("Unexpected message {:?}", other),
        }
    }

    #[test]
    fn test_outbox_skips_empty_audience() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let outbox = Outbox::new(tx);
        outbox.send(Vec::new(), Channel::Unreliable, &Packet::Restock { player_id: 0 });
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_outbox_disconnect() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        Outbox::new(tx).disconnect(9, DisconnectReason::Kicked);
        assert!(matches!(
            rx.try_recv().unwrap(),
            GameMessage::Disconnect {
                peer: 9,
                reason: DisconnectReason::Kicked
            }
        ));
    }

    #[test]
    fn test_handle_requests_shutdown() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let handle = ServerHandle { tx };
        handle.shutdown();
        assert!(matches!(rx.try_recv().unwrap(), ServerMessage::Shutdown));
    }

    #[tokio::test]
    async fn test_server_binds_ephemeral_port() {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            map_width: 16,
            map_length: 16,
            ..ServerConfig::default()
        };
        let server = Server::new(config, Vec::new()).await.unwrap();
        assert_ne!(server.local_addr().unwrap().port(), 0);
    }
}
