//! Scripted client for poking a running server by hand.
//!
//! Connects, walks through the handshake, joins a team, says hello in chat
//! and disconnects once the server echoes the message back.

use clap::Parser;
use server::client_manager::{Client, RESEND_AFTER};
use shared::{
    decode_frame, decode_packet, encode_frame, encode_packet, ChatType, DisconnectReason, Frame,
    Packet, TeamId, WeaponKind, PROTOCOL_VERSION,
};
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tokio::net::UdpSocket;
use tokio::time::timeout;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Server address
    #[clap(short, long, default_value = "127.0.0.1:32887")]
    server: SocketAddr,
    /// Name to join with
    #[clap(short, long, default_value = "tester")]
    name: String,
    /// Give up after this many seconds
    #[clap(short, long, default_value = "20")]
    timeout: u64,
}

struct Session {
    socket: UdpSocket,
    link: Client,
    player_id: Option<u8>,
    map_bytes: usize,
}

impl Session {
    async fn send_frame(&self, frame: &Frame) -> Result<(), Box<dyn std::error::Error>> {
        self.socket.send_to(&encode_frame(frame)?, self.link.addr).await?;
        Ok(())
    }

    async fn send_reliable(&mut self, packet: &Packet) -> Result<(), Box<dyn std::error::Error>> {
        let bytes = self.link.prepare_reliable(encode_packet(packet)?)?;
        self.socket.send_to(&bytes, self.link.addr).await?;
        Ok(())
    }

    /// Reacts to one packet. Returns true once the script is done.
    async fn on_packet(&mut self, packet: Packet, name: &str) -> Result<bool, Box<dyn std::error::Error>> {
        match packet {
            Packet::PackStart { size, checksum } => {
                println!("Pack offered: {} bytes, crc {:08x}", size, checksum);
                self.send_reliable(&Packet::PackResponse { cached: false }).await?;
            }
            Packet::MapStart { size } => println!("Map incoming: {} bytes compressed", size),
            Packet::MapChunk { data } => self.map_bytes += data.len(),
            Packet::StateData {
                player_id,
                mode_name,
                ..
            } => {
                println!(
                    "Map received ({} bytes), playing '{}' as player #{}",
                    self.map_bytes, mode_name, player_id
                );
                self.player_id = Some(player_id);
                let join = Packet::ExistingPlayer {
                    player_id,
                    team: TeamId::Team1,
                    weapon: WeaponKind::Semi,
                    tool: shared::Tool::Weapon,
                    kills: 0,
                    color: shared::Color::new(112, 112, 112),
                    name: name.to_string(),
                };
                self.send_reliable(&join).await?;
            }
            Packet::ExistingPlayer { player_id, name, .. } => {
                println!("Already playing: #{} {}", player_id, name);
            }
            Packet::CreatePlayer {
                player_id,
                position,
                name,
                ..
            } => {
                println!("#{} {} spawned at {:?}", player_id, name, position);
                if Some(player_id) == self.player_id {
                    let hello = Packet::ChatMessage {
                        player_id,
                        chat_type: ChatType::All,
                        value: "hello from the test client".into(),
                    };
                    self.send_reliable(&hello).await?;
                }
            }
            Packet::ChatMessage {
                player_id, value, ..
            } => {
                println!("<#{}> {}", player_id, value);
                return Ok(Some(player_id) == self.player_id);
            }
            Packet::WorldUpdate { .. } => {}
            other => println!("Received {:?}", other.kind()),
        }
        Ok(false)
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    let mut session = Session {
        socket,
        link: Client::new(0, args.server),
        player_id: None,
        map_bytes: 0,
    };
    session
        .send_frame(&Frame::Connect {
            version: PROTOCOL_VERSION,
        })
        .await?;
    println!("Sent connection request to {}", args.server);

    let deadline = Instant::now() + Duration::from_secs(args.timeout);
    let mut buf = vec![0u8; shared::codec::MAX_FRAME_SIZE as usize];

    while Instant::now() < deadline {
        for bytes in session.link.due_retransmits(Instant::now(), RESEND_AFTER) {
            session.socket.send_to(&bytes, session.link.addr).await?;
        }

        let len = match timeout(Duration::from_millis(100), session.socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => len,
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => continue,
        };

        let payloads = match decode_frame(&buf[..len]) {
            Ok(Frame::Reliable { seq, payload }) => match session.link.receive_reliable(seq, payload) {
                Some(ready) => {
                    session.send_frame(&Frame::Ack { seq }).await?;
                    ready
                }
                None => continue,
            },
            Ok(Frame::Unreliable { payload }) => vec![payload],
            Ok(Frame::Ack { seq }) => {
                session.link.acknowledge(seq);
                continue;
            }
            Ok(Frame::Disconnect { reason }) => {
                println!("Server disconnected us: {:?}", reason);
                return Ok(());
            }
            Ok(other) => {
                println!("Ignoring frame {:?}", other);
                continue;
            }
            Err(e) => {
                println!("Failed to decode frame: {}", e);
                continue;
            }
        };

        for payload in payloads {
            let packet = match decode_packet(&payload) {
                Ok(packet) => packet,
                Err(e) => {
                    println!("Failed to decode packet: {}", e);
                    continue;
                }
            };
            if session.on_packet(packet, &args.name).await? {
                session
                    .send_frame(&Frame::Disconnect {
                        reason: DisconnectReason::Undefined,
                    })
                    .await?;
                println!("Test client finished");
                return Ok(());
            }
        }
    }

    println!("Timed out before the script finished");
    Ok(())
}
