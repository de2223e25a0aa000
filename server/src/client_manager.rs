//! Peer tracking and the reliable-delivery layer on top of UDP
//!
//! This module handles the transport-level side of every peer, including:
//! - Peer lifecycle (connect, disconnect, timeout)
//! - Sequencing, acknowledgement and retransmission of reliable frames
//! - In-order, de-duplicated delivery of received reliable payloads
//! - Capacity management and address lookup
//!
//! It knows nothing about game packets. Payloads are opaque byte strings
//! that the protocol layer decodes.

use log::{debug, info};
use shared::{encode_frame, CodecError, Frame};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Transport-level connection id. Distinct from the 8-bit player id.
pub type PeerId = u32;

/// Peers silent for longer than this are dropped.
pub const PEER_TIMEOUT: Duration = Duration::from_secs(5);

/// Unacknowledged reliable frames are resent after this long.
pub const RESEND_AFTER: Duration = Duration::from_millis(200);

/// Out-of-order frames buffered per peer before new ones are dropped.
const MAX_REORDER: usize = 256;

#[derive(Debug)]
struct PendingFrame {
    bytes: Vec<u8>,
    last_sent: Instant,
}

/// One end of a reliable session
///
/// Tracks:
/// - Connection metadata (ID, address, last activity)
/// - Outgoing sequence numbers and frames awaiting acknowledgement
/// - Incoming frames that arrived ahead of a gap
#[derive(Debug)]
pub struct Client {
    /// Unique peer identifier assigned by the server
    pub id: PeerId,
    /// Network address frames are sent to
    pub addr: SocketAddr,
    /// Last time we received anything from this peer
    pub last_seen: Instant,
    next_outgoing: u32,
    next_expected: u32,
    reorder: BTreeMap<u32, Vec<u8>>,
    unacked: BTreeMap<u32, PendingFrame>,
}

impl Client {
    pub fn new(id: PeerId, addr: SocketAddr) -> Self {
        Self {
            id,
            addr,
            last_seen: Instant::now(),
            next_outgoing: 0,
            next_expected: 0,
            reorder: BTreeMap::new(),
            unacked: BTreeMap::new(),
        }
    }

    pub fn touch(&mut self) {
        self.last_seen = Instant::now();
    }

    /// Accepts a reliable frame and returns every payload that is now
    /// deliverable in sequence order
    ///
    /// Returns `None` when the frame was refused and must not be acked, so
    /// the sender retransmits it later. Duplicates and frames that were
    /// already delivered are acked but yield nothing. A frame ahead of a gap
    /// is held back until the gap is filled. The frame that fills the gap is
    /// always taken, even with a full reorder buffer.
    pub fn receive_reliable(&mut self, seq: u32, payload: Vec<u8>) -> Option<Vec<Vec<u8>>> {
        self.touch();
        if seq < self.next_expected || self.reorder.contains_key(&seq) {
            debug!("Dropping duplicate frame {} from peer {}", seq, self.id);
            return Some(Vec::new());
        }
        if seq != self.next_expected && self.reorder.len() >= MAX_REORDER {
            debug!("Reorder buffer full for peer {}, refusing frame {}", self.id, seq);
            return None;
        }
        self.reorder.insert(seq, payload);

        let mut ready = Vec::new();
        while let Some(payload) = self.reorder.remove(&self.next_expected) {
            ready.push(payload);
            self.next_expected += 1;
        }
        Some(ready)
    }

    /// Wraps `payload` in the next reliable frame and remembers it until acked
    pub fn prepare_reliable(&mut self, payload: Vec<u8>) -> Result<Vec<u8>, CodecError> {
        let seq = self.next_outgoing;
        let bytes = encode_frame(&Frame::Reliable { seq, payload })?;
        self.next_outgoing += 1;
        self.unacked.insert(
            seq,
            PendingFrame {
                bytes: bytes.clone(),
                last_sent: Instant::now(),
            },
        );
        Ok(bytes)
    }

    /// Returns true if `seq` was outstanding
    pub fn acknowledge(&mut self, seq: u32) -> bool {
        self.touch();
        self.unacked.remove(&seq).is_some()
    }

    /// Frames that have gone unacknowledged for at least `resend_after`
    pub fn due_retransmits(&mut self, now: Instant, resend_after: Duration) -> Vec<Vec<u8>> {
        self.unacked
            .values_mut()
            .filter(|frame| now.duration_since(frame.last_sent) >= resend_after)
            .map(|frame| {
                frame.last_sent = now;
                frame.bytes.clone()
            })
            .collect()
    }

    pub fn unacked_count(&self) -> usize {
        self.unacked.len()
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Manages all transport peers
///
/// Shared between the receiver, sender and maintenance tasks behind a lock.
/// Capacity here bounds raw connections; player slots are limited separately
/// by the protocol.
pub struct ClientManager {
    clients: HashMap<PeerId, Client>,
    next_client_id: PeerId,
    max_clients: usize,
}

impl ClientManager {
    pub fn new(max_clients: usize) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
        }
    }

    /// Registers a new peer. Returns None if the server is at capacity.
    pub fn add_client(&mut self, addr: SocketAddr) -> Option<PeerId> {
        if self.clients.len() >= self.max_clients {
            return None;
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        info!("Peer {} connected from {}", client_id, addr);
        self.clients.insert(client_id, Client::new(client_id, addr));
        Some(client_id)
    }

    pub fn remove_client(&mut self, client_id: &PeerId) -> Option<Client> {
        let client = self.clients.remove(client_id)?;
        info!("Peer {} disconnected", client.id);
        Some(client)
    }

    pub fn get_mut(&mut self, client_id: &PeerId) -> Option<&mut Client> {
        self.clients.get_mut(client_id)
    }

    pub fn addr_of(&self, client_id: &PeerId) -> Option<SocketAddr> {
        self.clients.get(client_id).map(|client| client.addr)
    }

    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<PeerId> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    /// Collects every frame due for retransmission along with its destination
    pub fn due_retransmits(&mut self, resend_after: Duration) -> Vec<(SocketAddr, Vec<u8>)> {
        let now = Instant::now();
        self.clients
            .values_mut()
            .flat_map(|client| {
                let addr = client.addr;
                client
                    .due_retransmits(now, resend_after)
                    .into_iter()
                    .map(move |bytes| (addr, bytes))
            })
            .collect()
    }

    /// Removes and returns peers that have been silent for too long
    pub fn check_timeouts(&mut self, timeout: Duration) -> Vec<PeerId> {
        let timed_out: Vec<PeerId> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        for client_id in &timed_out {
            self.remove_client(client_id);
        }

        timed_out
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
