use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs, UdpSocket};
use std::time::{Duration, Instant};

use super::packet::{Channel, MAX_SEND_SIZE};
use super::stats::{NetworkStats, RttEstimator};
use super::stream::Stream;
use crate::config::HostConfig;

pub const PROTOCOL_MAGIC: u32 = 0x4C4B_5354;
pub const PROTOCOL_VERSION: u8 = 1;

const HEADER_SIZE: usize = 6;
const MAX_DATAGRAM: usize = MAX_SEND_SIZE + HEADER_SIZE + 8;
const MAX_REORDER: usize = 256;
const SEQUENCE_WRAP_THRESHOLD: u32 = u32::MAX / 2;

#[inline]
pub fn sequence_greater_than(s1: u32, s2: u32) -> bool {
    ((s1 > s2) && (s1 - s2 <= SEQUENCE_WRAP_THRESHOLD))
        || ((s1 < s2) && (s2 - s1 > SEQUENCE_WRAP_THRESHOLD))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u32);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    Connecting,
    Connected,
    Disconnecting,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Outgoing: the remote accepted. Incoming: a remote asked to connect
    /// and waits for [`Endpoint::accept`] or [`Endpoint::refuse`].
    Connect {
        peer: PeerId,
        service: u32,
        incoming: bool,
    },
    Disconnect {
        peer: PeerId,
    },
    Receive {
        peer: PeerId,
        channel: Channel,
        payload: Vec<u8>,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct TransportSettings {
    pub connect_timeout: Duration,
    pub peer_timeout: Duration,
    pub resend_interval: Duration,
    pub keepalive_interval: Duration,
    pub disconnect_linger: Duration,
}

impl From<&HostConfig> for TransportSettings {
    fn from(config: &HostConfig) -> Self {
        Self {
            connect_timeout: Duration::from_millis(config.connect_timeout_ms),
            peer_timeout: Duration::from_millis(config.peer_timeout_ms),
            resend_interval: Duration::from_millis(config.resend_interval_ms),
            keepalive_interval: Duration::from_millis(config.keepalive_interval_ms),
            disconnect_linger: Duration::from_millis(config.disconnect_linger_ms),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameKind {
    Connect = 1,
    Accept = 2,
    Refuse = 3,
    Disconnect = 4,
    Ping = 5,
    Pong = 6,
    Unreliable = 7,
    Reliable = 8,
    Ack = 9,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Frame<'a> {
    Connect { service: u32, nonce: u32 },
    Accept { nonce: u32 },
    Refuse { nonce: u32 },
    Disconnect { nonce: u32 },
    Ping,
    Pong,
    Unreliable(&'a [u8]),
    Reliable { seq: u32, payload: &'a [u8] },
    Ack { seq: u32 },
}

impl<'a> Frame<'a> {
    fn encode(&self, out: &mut Vec<u8>) {
        out.clear();
        out.extend_from_slice(&PROTOCOL_MAGIC.to_be_bytes());
        out.push(PROTOCOL_VERSION);
        match self {
            Frame::Connect { service, nonce } => {
                out.push(FrameKind::Connect as u8);
                out.extend_from_slice(&service.to_be_bytes());
                out.extend_from_slice(&nonce.to_be_bytes());
            }
            Frame::Accept { nonce } => {
                out.push(FrameKind::Accept as u8);
                out.extend_from_slice(&nonce.to_be_bytes());
            }
            Frame::Refuse { nonce } => {
                out.push(FrameKind::Refuse as u8);
                out.extend_from_slice(&nonce.to_be_bytes());
            }
            Frame::Disconnect { nonce } => {
                out.push(FrameKind::Disconnect as u8);
                out.extend_from_slice(&nonce.to_be_bytes());
            }
            Frame::Ping => out.push(FrameKind::Ping as u8),
            Frame::Pong => out.push(FrameKind::Pong as u8),
            Frame::Unreliable(payload) => {
                out.push(FrameKind::Unreliable as u8);
                out.extend_from_slice(payload);
            }
            Frame::Reliable { seq, payload } => {
                out.push(FrameKind::Reliable as u8);
                out.extend_from_slice(&seq.to_be_bytes());
                out.extend_from_slice(payload);
            }
            Frame::Ack { seq } => {
                out.push(FrameKind::Ack as u8);
                out.extend_from_slice(&seq.to_be_bytes());
            }
        }
    }

    fn decode(data: &'a [u8]) -> Option<Self> {
        if data.len() < HEADER_SIZE {
            return None;
        }
        let mut stream = Stream::new(data);
        if stream.read_u32() != PROTOCOL_MAGIC || stream.read_u8() != PROTOCOL_VERSION {
            return None;
        }
        let kind = stream.read_u8();
        let frame = match kind {
            1 => Frame::Connect {
                service: stream.read_u32(),
                nonce: stream.read_u32(),
            },
            2 => Frame::Accept {
                nonce: stream.read_u32(),
            },
            3 => Frame::Refuse {
                nonce: stream.read_u32(),
            },
            4 => Frame::Disconnect {
                nonce: stream.read_u32(),
            },
            5 => Frame::Ping,
            6 => Frame::Pong,
            7 => Frame::Unreliable(stream.rest()),
            8 => Frame::Reliable {
                seq: stream.read_u32(),
                payload: stream.rest(),
            },
            9 => Frame::Ack {
                seq: stream.read_u32(),
            },
            _ => return None,
        };
        (!stream.overrun()).then_some(frame)
    }
}

#[derive(Debug)]
struct Unacked {
    seq: u32,
    payload: Vec<u8>,
    sent_at: Instant,
    resends: u32,
}

#[derive(Debug)]
struct Peer {
    addr: SocketAddr,
    state: PeerState,
    incoming: bool,
    service: u32,
    nonce: u32,
    created: Instant,
    last_receive: Instant,
    last_send: Instant,
    linger_deadline: Option<Instant>,
    send_sequence: u32,
    unacked: VecDeque<Unacked>,
    next_deliver: u32,
    reorder: HashMap<u32, Vec<u8>>,
    rtt: RttEstimator,
}

impl Peer {
    fn new(addr: SocketAddr, service: u32, nonce: u32, incoming: bool) -> Self {
        let now = Instant::now();
        Self {
            addr,
            state: PeerState::Connecting,
            incoming,
            service,
            nonce,
            created: now,
            last_receive: now,
            last_send: now,
            linger_deadline: None,
            send_sequence: 0,
            unacked: VecDeque::new(),
            next_deliver: 0,
            reorder: HashMap::new(),
            rtt: RttEstimator::default(),
        }
    }

    fn process_ack(&mut self, seq: u32) {
        let Some(index) = self.unacked.iter().position(|u| u.seq == seq) else {
            return;
        };
        if let Some(acked) = self.unacked.remove(index) {
            // Only first transmissions give an unambiguous sample.
            if acked.resends == 0 {
                self.rtt.update(acked.sent_at.elapsed());
            }
        }
    }
}

/// Connection-oriented endpoint over one non-blocking UDP socket.
///
/// Drive it with [`Endpoint::service`], which drains the socket, runs
/// resends, keepalives and timeouts, and returns the events that happened.
pub struct Endpoint {
    socket: UdpSocket,
    local_addr: SocketAddr,
    settings: TransportSettings,
    peers: HashMap<PeerId, Peer>,
    peers_by_addr: HashMap<SocketAddr, PeerId>,
    next_peer_id: u32,
    next_nonce: u32,
    events: VecDeque<TransportEvent>,
    stats: NetworkStats,
    recv_buffer: Box<[u8; MAX_DATAGRAM]>,
    send_buffer: Vec<u8>,
}

impl Endpoint {
    pub fn bind<A: ToSocketAddrs>(addr: A, settings: TransportSettings) -> io::Result<Self> {
        let socket = UdpSocket::bind(addr)?;
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;

        Ok(Self {
            socket,
            local_addr,
            settings,
            peers: HashMap::new(),
            peers_by_addr: HashMap::new(),
            next_peer_id: 1,
            next_nonce: seed_nonce(),
            events: VecDeque::new(),
            stats: NetworkStats::default(),
            recv_buffer: Box::new([0u8; MAX_DATAGRAM]),
            send_buffer: Vec::with_capacity(MAX_DATAGRAM),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stats(&self) -> &NetworkStats {
        &self.stats
    }

    pub fn peer_state(&self, peer: PeerId) -> PeerState {
        self.peers
            .get(&peer)
            .map_or(PeerState::Disconnected, |p| p.state)
    }

    pub fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.peers.get(&peer).map(|p| p.addr)
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Starts connecting to `addr`. The result arrives later as a
    /// `Connect` or `Disconnect` event for the returned peer. An existing
    /// live peer for the same address is reused.
    pub fn connect(&mut self, addr: SocketAddr, service: u32) -> PeerId {
        if let Some(&id) = self.peers_by_addr.get(&addr) {
            match self.peer_state(id) {
                PeerState::Connecting | PeerState::Connected => return id,
                _ => self.drop_peer(id, true),
            }
        }

        let nonce = self.mint_nonce();
        let id = self.insert_peer(Peer::new(addr, service, nonce, false));
        log::debug!("Connecting to {} as {} (service {})", addr, id, service);
        self.send_frame(addr, &Frame::Connect { service, nonce });
        id
    }

    /// Completes an incoming connection announced by a `Connect` event.
    pub fn accept(&mut self, peer: PeerId) {
        let Some(p) = self.peers.get_mut(&peer) else {
            return;
        };
        if !p.incoming || p.state != PeerState::Connecting {
            return;
        }
        p.state = PeerState::Connected;
        let (addr, nonce) = (p.addr, p.nonce);
        self.stats.connects += 1;
        self.send_frame(addr, &Frame::Accept { nonce });
    }

    /// Turns down an incoming connection. No disconnect event is raised.
    pub fn refuse(&mut self, peer: PeerId) {
        let Some(p) = self.peers.get(&peer) else {
            return;
        };
        let (addr, nonce) = (p.addr, p.nonce);
        self.send_frame(addr, &Frame::Refuse { nonce });
        self.forget_peer(peer);
    }

    /// Graceful close: guaranteed frames still in flight get up to the
    /// linger timeout to be acknowledged before the peer is dropped.
    pub fn disconnect(&mut self, peer: PeerId) {
        let linger = self.settings.disconnect_linger;
        let Some(p) = self.peers.get_mut(&peer) else {
            return;
        };
        match p.state {
            PeerState::Connected if !p.unacked.is_empty() => {
                p.state = PeerState::Disconnecting;
                p.linger_deadline = Some(Instant::now() + linger);
            }
            PeerState::Disconnecting => {}
            _ => self.drop_peer(peer, true),
        }
    }

    pub fn disconnect_now(&mut self, peer: PeerId) {
        self.drop_peer(peer, true);
    }

    pub fn send(&mut self, peer: PeerId, channel: Channel, payload: &[u8]) -> io::Result<()> {
        if payload.len() > MAX_SEND_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "payload exceeds maximum send size",
            ));
        }
        let p = self
            .peers
            .get_mut(&peer)
            .filter(|p| p.state == PeerState::Connected)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "peer not connected"))?;
        let addr = p.addr;

        match channel {
            Channel::BestEffort => {
                p.last_send = Instant::now();
                Frame::Unreliable(payload).encode(&mut self.send_buffer);
            }
            Channel::Guaranteed => {
                let seq = p.send_sequence;
                p.send_sequence = p.send_sequence.wrapping_add(1);
                let now = Instant::now();
                p.last_send = now;
                p.unacked.push_back(Unacked {
                    seq,
                    payload: payload.to_vec(),
                    sent_at: now,
                    resends: 0,
                });
                Frame::Reliable { seq, payload }.encode(&mut self.send_buffer);
            }
        }

        match self.socket.send_to(&self.send_buffer, addr) {
            Ok(bytes) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += bytes as u64;
                Ok(())
            }
            // Queued for resend already.
            Err(e) if channel == Channel::Guaranteed => {
                log::debug!("Send to {} failed, will resend: {}", addr, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    pub fn service(&mut self) -> io::Result<Vec<TransportEvent>> {
        self.receive()?;
        self.update(Instant::now());
        Ok(self.events.drain(..).collect())
    }

    fn receive(&mut self) -> io::Result<()> {
        loop {
            match self.socket.recv_from(&mut self.recv_buffer[..]) {
                Ok((size, addr)) => {
                    let data = self.recv_buffer[..size].to_vec();
                    match Frame::decode(&data) {
                        Some(frame) => {
                            self.stats.packets_received += 1;
                            self.stats.bytes_received += size as u64;
                            self.handle_frame(addr, frame);
                        }
                        None => {
                            self.stats.packets_dropped += 1;
                            log::trace!("Dropping malformed datagram from {}", addr);
                        }
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                // ICMP unreachable from a peer that went away.
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionRefused
                    ) =>
                {
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn handle_frame(&mut self, addr: SocketAddr, frame: Frame<'_>) {
        if let Frame::Connect { service, nonce } = frame {
            self.handle_connect(addr, service, nonce);
            return;
        }

        let Some(&id) = self.peers_by_addr.get(&addr) else {
            log::trace!("Ignoring frame from unknown address {}", addr);
            return;
        };
        let Some(peer) = self.peers.get_mut(&id) else {
            return;
        };
        peer.last_receive = Instant::now();

        match frame {
            Frame::Connect { .. } => {}
            Frame::Accept { nonce } => {
                if !peer.incoming && peer.nonce == nonce && peer.state == PeerState::Connecting {
                    peer.state = PeerState::Connected;
                    let service = peer.service;
                    self.stats.connects += 1;
                    self.events.push_back(TransportEvent::Connect {
                        peer: id,
                        service,
                        incoming: false,
                    });
                }
            }
            Frame::Refuse { nonce } => {
                if peer.nonce == nonce {
                    log::warn!("{} refused connection", addr);
                    self.drop_peer(id, false);
                }
            }
            Frame::Disconnect { nonce } => {
                if peer.nonce == nonce {
                    log::debug!("{} ({}) disconnected", id, addr);
                    self.remove_peer(id);
                }
            }
            Frame::Ping => {
                peer.last_send = Instant::now();
                self.send_frame(addr, &Frame::Pong);
            }
            Frame::Pong => {}
            Frame::Unreliable(payload) => {
                if matches!(peer.state, PeerState::Connected | PeerState::Disconnecting) {
                    self.events.push_back(TransportEvent::Receive {
                        peer: id,
                        channel: Channel::BestEffort,
                        payload: payload.to_vec(),
                    });
                }
            }
            Frame::Reliable { seq, payload } => {
                if !matches!(peer.state, PeerState::Connected | PeerState::Disconnecting) {
                    return;
                }
                let mut delivered = Vec::new();
                if seq == peer.next_deliver {
                    delivered.push(payload.to_vec());
                    peer.next_deliver = peer.next_deliver.wrapping_add(1);
                    while let Some(next) = peer.reorder.remove(&peer.next_deliver) {
                        delivered.push(next);
                        peer.next_deliver = peer.next_deliver.wrapping_add(1);
                    }
                } else if sequence_greater_than(seq, peer.next_deliver) {
                    if peer.reorder.len() >= MAX_REORDER && !peer.reorder.contains_key(&seq) {
                        // Not acked, so the sender will try again.
                        self.stats.packets_dropped += 1;
                        return;
                    }
                    peer.reorder.entry(seq).or_insert_with(|| payload.to_vec());
                }
                // Duplicates of delivered frames are acked again and dropped.
                self.send_frame(addr, &Frame::Ack { seq });
                for payload in delivered {
                    self.events.push_back(TransportEvent::Receive {
                        peer: id,
                        channel: Channel::Guaranteed,
                        payload,
                    });
                }
            }
            Frame::Ack { seq } => {
                peer.process_ack(seq);
                self.stats.rtt_ms = peer.rtt.srtt();
                self.stats.rtt_variance = peer.rtt.rtt_var();
            }
        }
    }

    fn handle_connect(&mut self, addr: SocketAddr, service: u32, nonce: u32) {
        if let Some(&id) = self.peers_by_addr.get(&addr) {
            let Some(peer) = self.peers.get_mut(&id) else {
                return;
            };
            if peer.nonce == nonce {
                peer.last_receive = Instant::now();
                // Our accept was lost; repeat it.
                if peer.incoming && peer.state == PeerState::Connected {
                    self.send_frame(addr, &Frame::Accept { nonce });
                }
                return;
            }
            // The remote restarted its side of the connection.
            log::debug!("{} reconnected, replacing {}", addr, id);
            self.drop_peer(id, false);
        }

        let id = self.insert_peer(Peer::new(addr, service, nonce, true));
        self.events.push_back(TransportEvent::Connect {
            peer: id,
            service,
            incoming: true,
        });
    }

    fn update(&mut self, now: Instant) {
        let settings = self.settings;
        let mut expired = Vec::new();
        let mut lingered = Vec::new();
        let mut outgoing: Vec<(SocketAddr, u32, Vec<u8>)> = Vec::new();
        let mut connects = Vec::new();
        let mut pings = Vec::new();

        for (&id, peer) in &mut self.peers {
            match peer.state {
                PeerState::Connecting => {
                    if now.duration_since(peer.created) > settings.connect_timeout {
                        expired.push(id);
                    } else if !peer.incoming
                        && now.duration_since(peer.last_send) >= settings.resend_interval
                    {
                        peer.last_send = now;
                        connects.push((peer.addr, peer.service, peer.nonce));
                    }
                    continue;
                }
                PeerState::Disconnecting => {
                    if peer.unacked.is_empty() || peer.linger_deadline.is_some_and(|d| now >= d) {
                        lingered.push(id);
                        continue;
                    }
                }
                PeerState::Connected => {}
                PeerState::Disconnected => continue,
            }

            if now.duration_since(peer.last_receive) > settings.peer_timeout {
                log::warn!("{} ({}) timed out", id, peer.addr);
                expired.push(id);
                continue;
            }

            let rto = peer.rtt.resend_timeout(settings.resend_interval);
            let mut resent = false;
            for unacked in peer.unacked.iter_mut() {
                if now.duration_since(unacked.sent_at) >= rto {
                    unacked.sent_at = now;
                    unacked.resends += 1;
                    outgoing.push((peer.addr, unacked.seq, unacked.payload.clone()));
                    resent = true;
                }
            }
            if resent {
                peer.last_send = now;
            }

            if peer.state == PeerState::Connected
                && now.duration_since(peer.last_send) >= settings.keepalive_interval
            {
                peer.last_send = now;
                pings.push(peer.addr);
            }
        }

        for (addr, service, nonce) in connects {
            self.send_frame(addr, &Frame::Connect { service, nonce });
        }
        for (addr, seq, payload) in outgoing {
            self.stats.packets_resent += 1;
            self.send_frame(
                addr,
                &Frame::Reliable {
                    seq,
                    payload: &payload,
                },
            );
        }
        for addr in pings {
            self.send_frame(addr, &Frame::Ping);
        }
        for id in lingered {
            self.drop_peer(id, true);
        }
        for id in expired {
            self.drop_peer(id, false);
        }
    }

    /// Removes the peer and raises a disconnect event, optionally telling
    /// the remote first. Peers still awaiting local acceptance vanish
    /// without an event since nobody was told about them.
    fn drop_peer(&mut self, id: PeerId, notify: bool) {
        let Some(peer) = self.peers.get(&id) else {
            return;
        };
        let (addr, nonce) = (peer.addr, peer.nonce);
        let announced = !(peer.incoming && peer.state == PeerState::Connecting);
        if notify {
            self.send_frame(addr, &Frame::Disconnect { nonce });
        }
        if announced {
            self.remove_peer(id);
        } else {
            self.forget_peer(id);
        }
    }

    fn remove_peer(&mut self, id: PeerId) {
        if self.forget_peer(id).is_some() {
            self.stats.disconnects += 1;
            self.events.push_back(TransportEvent::Disconnect { peer: id });
        }
    }

    fn forget_peer(&mut self, id: PeerId) -> Option<Peer> {
        let peer = self.peers.remove(&id)?;
        self.peers_by_addr.remove(&peer.addr);
        Some(peer)
    }

    fn insert_peer(&mut self, peer: Peer) -> PeerId {
        let id = PeerId(self.next_peer_id);
        self.next_peer_id = self.next_peer_id.wrapping_add(1).max(1);
        self.peers_by_addr.insert(peer.addr, id);
        self.peers.insert(id, peer);
        id
    }

    fn mint_nonce(&mut self) -> u32 {
        self.next_nonce = self
            .next_nonce
            .wrapping_mul(0x0019_660D)
            .wrapping_add(0x3C6E_F35F);
        self.next_nonce
    }

    fn send_frame(&mut self, addr: SocketAddr, frame: &Frame<'_>) {
        frame.encode(&mut self.send_buffer);
        match self.socket.send_to(&self.send_buffer, addr) {
            Ok(bytes) => {
                self.stats.packets_sent += 1;
                self.stats.bytes_sent += bytes as u64;
            }
            Err(e) => log::debug!("Send to {} failed: {}", addr, e),
        }
    }
}

fn seed_nonce() -> u32 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_u128(
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map_or(0, |d| d.as_nanos()),
    );
    hasher.finish() as u32
}
