use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bitflags::bitflags;

use super::connection::{
    HandlerId, HandlerRegistry, InboundConnection, InboundConnections, OutboundConnections,
};
use super::packet::{kind_name, Channel, LocalPacket, PacketKind, MAX_SEND_SIZE};
use super::request::{RequestPool, RequestStatus, RequestTicket};
use super::stats::NetworkStats;
use super::stream::Stream;
use super::transport::{Endpoint, PeerId, PeerState, TransportEvent, TransportSettings};
use crate::config::HostConfig;
use crate::error::{NetError, WaitOutcome};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HostFlags: u8 {
        const ACTIVE = 1 << 0;
        const PAUSED = 1 << 1;
        const KILL_ME = 1 << 2;
        const TERMINATED = 1 << 3;
    }
}

/// A data packet on its way to a [`PacketSink`]. The stream is positioned
/// just past the 16-bit kind tag.
#[derive(Debug)]
pub struct IncomingPacket<'a> {
    pub peer: PeerId,
    pub channel: Channel,
    pub handler: HandlerId,
    pub raw_kind: u16,
    pub kind: Option<PacketKind>,
    pub stream: Stream<'a>,
}

impl IncomingPacket<'_> {
    pub fn kind_name(&self) -> &'static str {
        kind_name(self.raw_kind)
    }
}

/// Logic that owns a handler id on a host: a client session, a server
/// session, or anything else sharing the socket.
///
/// Called from the host's worker thread with no host lock held, so
/// implementations may call back into the host freely.
pub trait PacketSink: Send + Sync {
    /// Returns false if the packet was not understood.
    fn handle_packet(&self, host: &NetHost, packet: &mut IncomingPacket<'_>) -> bool;

    fn on_connect(&self, _host: &NetHost, _peer: PeerId, _incoming: bool) {}

    fn on_disconnect(&self, _host: &NetHost, _peer: PeerId) {}
}

enum Delivery {
    Connect {
        sink: Arc<dyn PacketSink>,
        peer: PeerId,
        incoming: bool,
    },
    Disconnect {
        sink: Arc<dyn PacketSink>,
        peer: PeerId,
    },
    Packet {
        sink: Arc<dyn PacketSink>,
        handler: HandlerId,
        peer: PeerId,
        channel: Channel,
        payload: Vec<u8>,
    },
}

struct HostState {
    endpoint: Option<Endpoint>,
    inbound: InboundConnections,
    outbound: OutboundConnections,
    handlers: HandlerRegistry,
}

struct HostShared {
    config: HostConfig,
    flags: AtomicU8,
    state: Mutex<HostState>,
    requests: RequestPool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

/// One network endpoint plus the registries, request pool and worker
/// thread that service it. Cheap to clone; clones share everything.
#[derive(Clone)]
pub struct NetHost {
    shared: Arc<HostShared>,
}

impl NetHost {
    pub fn new(config: HostConfig) -> Self {
        let requests = RequestPool::new(
            config.request_slots,
            config.request_buffer_size,
            config.dispatch_interval(),
        );
        let state = HostState {
            endpoint: None,
            inbound: InboundConnections::new(config.max_connections),
            outbound: OutboundConnections::new(config.max_connections),
            handlers: HandlerRegistry::new(config.max_connections),
        };
        Self {
            shared: Arc::new(HostShared {
                config,
                flags: AtomicU8::new(0),
                state: Mutex::new(state),
                requests,
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &HostConfig {
        &self.shared.config
    }

    fn lock_state(&self) -> MutexGuard<'_, HostState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn flags(&self) -> HostFlags {
        HostFlags::from_bits_truncate(self.shared.flags.load(Ordering::SeqCst))
    }

    fn set_flags(&self, flags: HostFlags) {
        self.shared.flags.store(flags.bits(), Ordering::SeqCst);
    }

    fn insert_flags(&self, flags: HostFlags) {
        self.shared.flags.fetch_or(flags.bits(), Ordering::SeqCst);
    }

    fn remove_flags(&self, flags: HostFlags) {
        self.shared.flags.fetch_and(!flags.bits(), Ordering::SeqCst);
    }

    pub fn is_active(&self) -> bool {
        let flags = self.flags();
        flags.contains(HostFlags::ACTIVE) && !flags.contains(HostFlags::KILL_ME)
    }

    /// Binds all interfaces on `port` (0 picks one) and starts the worker.
    pub fn start_up(&self, port: u16) -> Result<(), NetError> {
        self.start_up_on(SocketAddr::from(([0, 0, 0, 0], port)))
    }

    /// Calling this again while running succeeds without rebinding.
    pub fn start_up_on(&self, addr: SocketAddr) -> Result<(), NetError> {
        let mut worker = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if worker.is_some() && self.is_active() {
            return Ok(());
        }

        let endpoint = Endpoint::bind(addr, TransportSettings::from(&self.shared.config))
            .map_err(|source| NetError::Bind {
                port: addr.port(),
                source,
            })?;
        let local_addr = endpoint.local_addr();
        self.lock_state().endpoint = Some(endpoint);
        self.set_flags(HostFlags::ACTIVE);

        let weak = Arc::downgrade(&self.shared);
        let handle = thread::Builder::new()
            .name(format!("net-host-{}", local_addr.port()))
            .spawn(move || run_worker(weak))
            .map_err(|e| {
                self.set_flags(HostFlags::TERMINATED);
                self.lock_state().endpoint = None;
                NetError::Thread(e)
            })?;
        *worker = Some(handle);

        log::info!("Network host started on {}", local_addr);
        Ok(())
    }

    /// Stops the worker, drops every connection and closes the socket.
    /// Registered handlers survive so a later `start_up` keeps routing.
    pub fn shut_down(&self) -> Result<(), NetError> {
        self.insert_flags(HostFlags::KILL_ME);

        let handle = self
            .shared
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() && handle.join().is_err() {
                log::error!("Network worker thread panicked");
            }
        }

        let mut state = self.lock_state();
        if let Some(mut endpoint) = state.endpoint.take() {
            let peers: Vec<PeerId> = state
                .inbound
                .iter()
                .map(|c| c.peer)
                .chain(state.outbound.iter().map(|c| c.peer))
                .collect();
            for peer in peers {
                endpoint.disconnect_now(peer);
            }
            log::info!("Network host on {} shut down", endpoint.local_addr());
        }
        state.inbound.clear();
        state.outbound.clear();
        drop(state);

        self.set_flags(HostFlags::TERMINATED);
        Ok(())
    }

    pub fn pause(&self) {
        self.insert_flags(HostFlags::PAUSED);
    }

    pub fn unpause(&self) {
        self.remove_flags(HostFlags::PAUSED);
    }

    pub fn register(
        &self,
        sink: Arc<dyn PacketSink>,
        requested: Option<HandlerId>,
    ) -> Result<HandlerId, NetError> {
        let id = self.lock_state().handlers.register(sink, requested)?;
        log::debug!("Registered {}", id);
        Ok(id)
    }

    /// Removes the handler and closes the connections it opened or
    /// accepted. Packets still addressed to it are dropped.
    pub fn unregister(&self, id: HandlerId) {
        let mut state = self.lock_state();
        let HostState {
            endpoint,
            inbound,
            outbound,
            handlers,
        } = &mut *state;
        if handlers.unregister(id).is_none() {
            return;
        }
        let accepted = inbound.remove_service(id).into_iter().map(|c| c.peer);
        for peer in outbound.remove_owner(id).into_iter().chain(accepted) {
            if let Some(endpoint) = endpoint.as_mut() {
                endpoint.disconnect(peer);
            }
        }
        log::debug!("Unregistered {}", id);
    }

    /// Drains all queued network events once and routes them.
    pub fn dispatch(&self) -> Result<usize, NetError> {
        let deliveries = self.collect_deliveries()?;
        let count = deliveries.len();

        for delivery in deliveries {
            match delivery {
                Delivery::Connect {
                    sink,
                    peer,
                    incoming,
                } => sink.on_connect(self, peer, incoming),
                Delivery::Disconnect { sink, peer } => sink.on_disconnect(self, peer),
                Delivery::Packet {
                    sink,
                    handler,
                    peer,
                    channel,
                    payload,
                } => {
                    let mut stream = Stream::new(&payload);
                    let raw_kind = stream.read_u16();
                    let mut packet = IncomingPacket {
                        peer,
                        channel,
                        handler,
                        raw_kind,
                        kind: PacketKind::from_u16(raw_kind),
                        stream,
                    };
                    if !sink.handle_packet(self, &mut packet) {
                        log::debug!(
                            "{} from {} not handled by {}",
                            kind_name(raw_kind),
                            peer,
                            handler
                        );
                    }
                }
            }
        }

        Ok(count)
    }

    fn collect_deliveries(&self) -> Result<Vec<Delivery>, NetError> {
        let mut state = self.lock_state();
        let HostState {
            endpoint,
            inbound,
            outbound,
            handlers,
        } = &mut *state;
        let endpoint = endpoint.as_mut().ok_or(NetError::NotStarted)?;
        let events = endpoint.service()?;

        let mut deliveries = Vec::new();
        for event in events {
            match event {
                TransportEvent::Connect {
                    peer,
                    service,
                    incoming: true,
                } => {
                    let service = HandlerId(service);
                    let Some(sink) = handlers.get(service) else {
                        log::warn!("Refusing {}: no handler {}", peer, service);
                        endpoint.refuse(peer);
                        continue;
                    };
                    let Some(addr) = endpoint.peer_addr(peer) else {
                        continue;
                    };
                    match inbound.add(peer, addr, service) {
                        Ok(connection) => {
                            log::info!(
                                "Incoming connection from {} as {} (slot {})",
                                addr,
                                peer,
                                connection.slot
                            );
                            endpoint.accept(peer);
                            deliveries.push(Delivery::Connect {
                                sink,
                                peer,
                                incoming: true,
                            });
                        }
                        Err(e) => {
                            log::warn!("Refusing {} from {}: {}", peer, addr, e);
                            endpoint.refuse(peer);
                        }
                    }
                }
                TransportEvent::Connect { peer, .. } => {
                    log::debug!("Connected to {}", peer);
                    for owner in outbound.owners_of(peer) {
                        if let Some(sink) = handlers.get(owner) {
                            deliveries.push(Delivery::Connect {
                                sink,
                                peer,
                                incoming: false,
                            });
                        }
                    }
                }
                TransportEvent::Disconnect { peer } => {
                    let mut targets = Vec::new();
                    if let Some(connection) = inbound.remove(peer) {
                        log::info!("{} ({}) disconnected", peer, connection.addr);
                        targets.push(connection.service);
                    }
                    targets.extend(outbound.remove_peer(peer).into_iter().map(|c| c.owner));
                    if targets.is_empty() {
                        log::debug!("Disconnect for unknown connection {}", peer);
                    }
                    for target in targets {
                        if let Some(sink) = handlers.get(target) {
                            deliveries.push(Delivery::Disconnect { sink, peer });
                        }
                    }
                }
                TransportEvent::Receive {
                    peer,
                    channel,
                    payload,
                } => {
                    let Some(tag) = Stream::new(&payload).peek_u16() else {
                        log::warn!("Dropping {} byte packet from {}", payload.len(), peer);
                        continue;
                    };
                    if self.shared.requests.offer(peer, tag, &payload) {
                        continue;
                    }

                    let targets = match inbound.get(peer) {
                        Some(connection) => vec![connection.service],
                        None => outbound.owners_of(peer),
                    };
                    if targets.is_empty() {
                        log::warn!("Unroutable {} from {}", kind_name(tag), peer);
                        continue;
                    }
                    for handler in targets {
                        match handlers.get(handler) {
                            Some(sink) => deliveries.push(Delivery::Packet {
                                sink,
                                handler,
                                peer,
                                channel,
                                payload: payload.clone(),
                            }),
                            None => log::debug!(
                                "Dropping {} from {}: {} is gone",
                                kind_name(tag),
                                peer,
                                handler
                            ),
                        }
                    }
                }
            }
        }

        Ok(deliveries)
    }

    /// Opens (or adds a reference to) a connection to `service` on the
    /// remote host, owned by the local handler `owner`.
    pub fn open(
        &self,
        addr: SocketAddr,
        service: HandlerId,
        owner: HandlerId,
    ) -> Result<PeerId, NetError> {
        let mut state = self.lock_state();
        let HostState {
            endpoint,
            outbound,
            handlers,
            ..
        } = &mut *state;
        let endpoint = endpoint.as_mut().ok_or(NetError::NotStarted)?;
        if !handlers.contains(owner) {
            return Err(NetError::UnknownHandler(owner));
        }

        outbound.prune(|peer| endpoint.peer_state(peer) != PeerState::Disconnected);
        let peer = endpoint.connect(addr, service.0);
        if let Err(e) = outbound.add(owner, peer) {
            if !outbound.contains_peer(peer) {
                endpoint.disconnect_now(peer);
            }
            return Err(e);
        }
        Ok(peer)
    }

    /// Drops one of `owner`'s references; the last one disconnects.
    pub fn release_peer(&self, owner: HandlerId, peer: PeerId) {
        let mut state = self.lock_state();
        let HostState {
            endpoint, outbound, ..
        } = &mut *state;
        if outbound.release(owner, peer) {
            if let Some(endpoint) = endpoint.as_mut() {
                endpoint.disconnect(peer);
            }
        }
    }

    /// Closes a connection whichever side opened it.
    pub fn close_peer(&self, peer: PeerId) {
        let mut state = self.lock_state();
        let HostState {
            endpoint, outbound, ..
        } = &mut *state;
        outbound.remove_peer(peer);
        if let Some(endpoint) = endpoint.as_mut() {
            endpoint.disconnect(peer);
        }
    }

    /// Closes every connection `owner` opened.
    pub fn close_owner(&self, owner: HandlerId) {
        let mut state = self.lock_state();
        let HostState {
            endpoint, outbound, ..
        } = &mut *state;
        for peer in outbound.remove_owner(owner) {
            if let Some(endpoint) = endpoint.as_mut() {
                endpoint.disconnect(peer);
            }
        }
    }

    pub fn send(&self, peer: PeerId, channel: Channel, packet: &LocalPacket) -> Result<(), NetError> {
        if packet.overflowed() {
            return Err(NetError::PacketOverflow {
                size: packet.len(),
                limit: MAX_SEND_SIZE,
            });
        }
        let mut state = self.lock_state();
        let endpoint = state.endpoint.as_mut().ok_or(NetError::NotStarted)?;
        match endpoint.peer_state(peer) {
            PeerState::Connected => {}
            PeerState::Disconnected => return Err(NetError::UnknownPeer(peer)),
            _ => return Err(NetError::NotConnected(peer)),
        }
        log::trace!(
            "Sending {} ({} bytes) to {} on {:?}",
            packet.kind().map_or("UNKNOWN", PacketKind::name),
            packet.len(),
            peer,
            channel
        );
        endpoint.send(peer, channel, packet.as_bytes())?;
        Ok(())
    }

    /// Sends to every inbound connection the filter accepts. Returns how
    /// many peers the packet went to.
    pub fn broadcast(
        &self,
        channel: Channel,
        packet: &LocalPacket,
        filter: impl Fn(&InboundConnection) -> bool,
    ) -> Result<usize, NetError> {
        if packet.overflowed() {
            return Err(NetError::PacketOverflow {
                size: packet.len(),
                limit: MAX_SEND_SIZE,
            });
        }
        let mut state = self.lock_state();
        let HostState {
            endpoint, inbound, ..
        } = &mut *state;
        let endpoint = endpoint.as_mut().ok_or(NetError::NotStarted)?;

        let mut sent = 0;
        for connection in inbound.iter().filter(|c| filter(c)) {
            if endpoint.peer_state(connection.peer) != PeerState::Connected {
                continue;
            }
            match endpoint.send(connection.peer, channel, packet.as_bytes()) {
                Ok(()) => sent += 1,
                Err(e) => log::warn!("Broadcast to {} failed: {}", connection.peer, e),
            }
        }
        Ok(sent)
    }

    pub fn prepare_wait(
        &self,
        peer: PeerId,
        timeout: Duration,
        kind: PacketKind,
    ) -> Result<RequestTicket, NetError> {
        self.shared.requests.prepare_wait(peer, timeout, kind)
    }

    /// Blocks until `kind` arrives from `peer` or `timeout` passes.
    pub fn wait_for_packet(
        &self,
        peer: PeerId,
        timeout: Duration,
        kind: PacketKind,
        out: &mut [u8],
    ) -> Result<WaitOutcome, NetError> {
        self.shared.requests.wait_for_packet(peer, timeout, kind, out)
    }

    pub fn finish_wait(&self, ticket: RequestTicket, out: &mut [u8]) -> WaitOutcome {
        self.shared.requests.finish_wait(ticket, out)
    }

    pub fn test(&self, ticket: RequestTicket) -> bool {
        self.shared.requests.test(ticket)
    }

    pub fn poll(&self, ticket: RequestTicket) -> RequestStatus {
        self.shared.requests.poll(ticket)
    }

    pub fn request_payload(&self, ticket: RequestTicket) -> Option<Vec<u8>> {
        self.shared.requests.payload(ticket)
    }

    pub fn release(&self, ticket: RequestTicket) {
        self.shared.requests.release(ticket);
    }

    pub fn pending_requests(&self) -> usize {
        self.shared.requests.in_use()
    }

    pub fn set_connection_name(&self, peer: PeerId, name: &str) -> bool {
        self.lock_state().inbound.set_name(peer, name)
    }

    pub fn inbound_snapshot(&self) -> Vec<InboundConnection> {
        self.lock_state().inbound.iter().cloned().collect()
    }

    pub fn outbound_count(&self) -> usize {
        self.lock_state().outbound.len()
    }

    pub fn peer_state(&self, peer: PeerId) -> PeerState {
        self.lock_state()
            .endpoint
            .as_ref()
            .map_or(PeerState::Disconnected, |e| e.peer_state(peer))
    }

    pub fn peer_addr(&self, peer: PeerId) -> Option<SocketAddr> {
        self.lock_state().endpoint.as_ref()?.peer_addr(peer)
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_state().endpoint.as_ref().map(Endpoint::local_addr)
    }

    /// Loopback address of this host, for connecting to it in-process.
    pub fn loopback_addr(&self) -> Option<SocketAddr> {
        self.local_addr()
            .map(|addr| SocketAddr::from(([127, 0, 0, 1], addr.port())))
    }

    pub fn stats(&self) -> NetworkStats {
        self.lock_state()
            .endpoint
            .as_ref()
            .map(|e| e.stats().clone())
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for NetHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NetHost")
            .field("flags", &self.flags())
            .field("local_addr", &self.local_addr())
            .finish()
    }
}

/// Resolves `"name"` or `"name:port"`, preferring IPv4.
pub fn resolve(hostname: &str, default_port: u16) -> Result<SocketAddr, NetError> {
    if let Ok(addr) = hostname.parse::<SocketAddr>() {
        return Ok(addr);
    }
    let addrs: Vec<SocketAddr> = match (hostname, default_port).to_socket_addrs() {
        Ok(addrs) => addrs.collect(),
        Err(_) => hostname
            .to_socket_addrs()
            .map_err(|_| NetError::Resolve(hostname.to_owned()))?
            .collect(),
    };
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| NetError::Resolve(hostname.to_owned()))
}

fn run_worker(weak: Weak<HostShared>) {
    loop {
        let Some(shared) = weak.upgrade() else {
            return;
        };
        let host = NetHost { shared };
        let flags = host.flags();
        if flags.contains(HostFlags::KILL_ME) || !flags.contains(HostFlags::ACTIVE) {
            break;
        }
        if !flags.contains(HostFlags::PAUSED) {
            if let Err(e) = host.dispatch() {
                log::error!("Network dispatch failed: {}", e);
            }
        }
        let interval = host.config().dispatch_interval();
        drop(host);
        thread::sleep(interval);
    }
    log::debug!("Network worker stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct CountingSink {
        packets: AtomicUsize,
        connects: AtomicUsize,
        disconnects: AtomicUsize,
    }

    impl PacketSink for CountingSink {
        fn handle_packet(&self, _host: &NetHost, _packet: &mut IncomingPacket<'_>) -> bool {
            self.packets.fetch_add(1, Ordering::SeqCst);
            true
        }

        fn on_connect(&self, _host: &NetHost, _peer: PeerId, _incoming: bool) {
            self.connects.fetch_add(1, Ordering::SeqCst);
        }

        fn on_disconnect(&self, _host: &NetHost, _peer: PeerId) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn fast_config() -> HostConfig {
        HostConfig {
            dispatch_interval_ms: 2,
            resend_interval_ms: 20,
            connect_timeout_ms: 1000,
            ..HostConfig::default()
        }
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let start = std::time::Instant::now();
        while start.elapsed() < timeout {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(1));
        }
        condition()
    }

    #[test]
    fn test_start_up_is_idempotent() {
        let host = NetHost::new(fast_config());
        host.start_up(0).unwrap();
        let addr = host.local_addr();
        host.start_up(0).unwrap();
        assert_eq!(host.local_addr(), addr);
        assert!(host.is_active());

        host.shut_down().unwrap();
        assert!(host.flags().contains(HostFlags::TERMINATED));
        assert_eq!(host.local_addr(), None);
    }

    #[test]
    fn test_dispatch_requires_start() {
        let host = NetHost::new(fast_config());
        assert!(matches!(host.dispatch(), Err(NetError::NotStarted)));
    }

    #[test]
    fn test_routes_to_service_and_owner() {
        let server = NetHost::new(fast_config());
        let client = NetHost::new(fast_config());
        server.start_up(0).unwrap();
        client.start_up(0).unwrap();

        let server_sink = Arc::new(CountingSink::default());
        let client_sink = Arc::new(CountingSink::default());
        let service = server
            .register(server_sink.clone(), Some(HandlerId(77)))
            .unwrap();
        let owner = client.register(client_sink.clone(), None).unwrap();

        let peer = client
            .open(server.loopback_addr().unwrap(), service, owner)
            .unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            client.peer_state(peer) == PeerState::Connected
        }));
        assert!(wait_until(Duration::from_secs(2), || {
            server_sink.connects.load(Ordering::SeqCst) == 1
        }));
        assert!(wait_until(Duration::from_secs(2), || {
            client_sink.connects.load(Ordering::SeqCst) == 1
        }));

        let packet = LocalPacket::new(PacketKind::ToAnyText);
        client.send(peer, Channel::Guaranteed, &packet).unwrap();
        assert!(wait_until(Duration::from_secs(2), || {
            server_sink.packets.load(Ordering::SeqCst) == 1
        }));

        let sent = server
            .broadcast(Channel::Guaranteed, &packet, |_| true)
            .unwrap();
        assert_eq!(sent, 1);
        assert!(wait_until(Duration::from_secs(2), || {
            client_sink.packets.load(Ordering::SeqCst) == 1
        }));

        client.close_owner(owner);
        assert!(wait_until(Duration::from_secs(2), || {
            server_sink.disconnects.load(Ordering::SeqCst) == 1
        }));
        assert!(server.inbound_snapshot().is_empty());

        client.shut_down().unwrap();
        server.shut_down().unwrap();
    }

    #[test]
    fn test_unknown_service_is_refused() {
        let server = NetHost::new(fast_config());
        let client = NetHost::new(fast_config());
        server.start_up(0).unwrap();
        client.start_up(0).unwrap();

        let owner = client
            .register(Arc::new(CountingSink::default()), None)
            .unwrap();
        let peer = client
            .open(server.loopback_addr().unwrap(), HandlerId(12345), owner)
            .unwrap();

        assert!(wait_until(Duration::from_secs(2), || {
            client.outbound_count() == 0
        }));
        assert_eq!(client.peer_state(peer), PeerState::Disconnected);

        client.shut_down().unwrap();
        server.shut_down().unwrap();
    }

    #[test]
    fn test_resolve() {
        assert_eq!(
            resolve("127.0.0.1:9000", 1).unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 9000))
        );
        assert_eq!(
            resolve("127.0.0.1", 0x8742).unwrap(),
            SocketAddr::from(([127, 0, 0, 1], 0x8742))
        );
        assert!(resolve("no such host.invalid", 1).is_err());
    }
}
