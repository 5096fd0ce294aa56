use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use lockstep::net::RequestStatus;
use lockstep::{
    Channel, HandlerId, HostConfig, IncomingPacket, LocalPacket, NetError, NetHost, PacketKind, PacketSink,
    PeerId, PeerState, Stream, WaitOutcome,
};

/// Answers every `TO_HOST_MODULE` with a text packet naming the request.
struct EchoSink;

impl PacketSink for EchoSink {
    fn handle_packet(&self, host: &NetHost, packet: &mut IncomingPacket<'_>) -> bool {
        if packet.kind != Some(PacketKind::ToHostModule) {
            return false;
        }
        let mut reply = LocalPacket::new(PacketKind::ToAnyText);
        reply.add_string("echo");
        host.send(packet.peer, Channel::Guaranteed, &reply).is_ok()
    }
}

struct Quiet;

impl PacketSink for Quiet {
    fn handle_packet(&self, _host: &NetHost, _packet: &mut IncomingPacket<'_>) -> bool {
        true
    }
}

/// Counts the packets it is handed.
#[derive(Default)]
struct Counter {
    packets: AtomicUsize,
}

impl Counter {
    fn count(&self) -> usize {
        self.packets.load(Ordering::SeqCst)
    }
}

impl PacketSink for Counter {
    fn handle_packet(&self, _host: &NetHost, _packet: &mut IncomingPacket<'_>) -> bool {
        self.packets.fetch_add(1, Ordering::SeqCst);
        true
    }
}

fn host_with(config: HostConfig) -> NetHost {
    let host = NetHost::new(HostConfig {
        dispatch_interval_ms: 2,
        resend_interval_ms: 20,
        ..config
    });
    host.start_up(0).unwrap();
    host
}

fn fast_host() -> NetHost {
    host_with(HostConfig {
        connect_timeout_ms: 1000,
        ..HostConfig::default()
    })
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let start = Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    condition()
}

/// Opens a connection from `client` to a fresh [`Counter`] on `server`.
fn connect_counter(server: &NetHost, client: &NetHost) -> (Arc<Counter>, HandlerId, PeerId) {
    let counter = Arc::new(Counter::default());
    let service = server.register(counter.clone(), None).unwrap();
    let owner = client.register(Arc::new(Quiet), None).unwrap();
    let peer = client
        .open(server.loopback_addr().unwrap(), service, owner)
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        client.peer_state(peer) == PeerState::Connected
    }));
    (counter, service, peer)
}

fn text(body: &str) -> LocalPacket {
    let mut packet = LocalPacket::new(PacketKind::ToAnyText);
    packet.add_string(body);
    packet
}

fn connected_pair() -> (NetHost, NetHost, PeerId) {
    let server = fast_host();
    let client = fast_host();
    let service = server.register(Arc::new(EchoSink), None).unwrap();
    let owner = client.register(Arc::new(Quiet), None).unwrap();
    let peer = client
        .open(server.loopback_addr().unwrap(), service, owner)
        .unwrap();

    let start = Instant::now();
    while client.peer_state(peer) != PeerState::Connected {
        assert!(start.elapsed() < Duration::from_secs(2), "never connected");
        thread::sleep(Duration::from_millis(1));
    }
    (server, client, peer)
}

#[test]
fn test_wait_for_packet_receives_reply() {
    let (server, client, peer) = connected_pair();

    let ticket = client
        .prepare_wait(peer, Duration::from_secs(2), PacketKind::ToAnyText)
        .unwrap();
    let request = LocalPacket::new(PacketKind::ToHostModule);
    client.send(peer, Channel::Guaranteed, &request).unwrap();

    let mut buffer = [0u8; 64];
    let WaitOutcome::Received(len) = client.finish_wait(ticket, &mut buffer) else {
        panic!("no reply");
    };
    let mut stream = Stream::new(&buffer[..len]);
    assert_eq!(stream.read_u16(), PacketKind::ToAnyText as u16);
    assert_eq!(stream.read_string(), "echo");
    assert_eq!(client.pending_requests(), 0);

    client.shut_down().unwrap();
    server.shut_down().unwrap();
}

#[test]
fn test_wait_for_packet_timeout_bounds() {
    let (server, client, peer) = connected_pair();
    let timeout = Duration::from_millis(150);

    let start = Instant::now();
    let mut buffer = [0u8; 16];
    let outcome = client
        .wait_for_packet(peer, timeout, PacketKind::ToRemoteStart, &mut buffer)
        .unwrap();
    let elapsed = start.elapsed();

    assert_eq!(outcome, WaitOutcome::Timeout);
    assert!(elapsed >= timeout);
    // One poll interval plus scheduling slack.
    assert!(elapsed < timeout + Duration::from_millis(100), "{:?}", elapsed);
    assert_eq!(client.pending_requests(), 0);

    client.shut_down().unwrap();
    server.shut_down().unwrap();
}

#[test]
fn test_one_wait_per_peer_and_kind() {
    let (server, client, peer) = connected_pair();

    let ticket = client
        .prepare_wait(peer, Duration::from_secs(1), PacketKind::ToRemoteLogon)
        .unwrap();
    assert!(matches!(
        client.prepare_wait(peer, Duration::from_secs(1), PacketKind::ToRemoteLogon),
        Err(NetError::DuplicateRequest { .. })
    ));
    // A different kind from the same peer is fine.
    let other = client
        .prepare_wait(peer, Duration::from_secs(1), PacketKind::ToRemoteStart)
        .unwrap();

    client.release(ticket);
    assert_eq!(client.poll(ticket), RequestStatus::Expired);
    client.release(other);
    assert_eq!(client.pending_requests(), 0);

    client.shut_down().unwrap();
    server.shut_down().unwrap();
}

#[test]
fn test_paused_host_holds_packets_until_unpaused() {
    let server = fast_host();
    let client = fast_host();
    let (counter, _, peer) = connect_counter(&server, &client);

    server.pause();
    client.send(peer, Channel::Guaranteed, &text("held")).unwrap();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(counter.count(), 0);

    server.unpause();
    assert!(wait_until(Duration::from_secs(2), || counter.count() == 1));
    // Resends made while paused are not delivered twice.
    thread::sleep(Duration::from_millis(60));
    assert_eq!(counter.count(), 1);

    client.shut_down().unwrap();
    server.shut_down().unwrap();
}

#[test]
fn test_unregister_drops_packets_and_closes_connections() {
    let server = fast_host();
    let client = fast_host();
    let (counter, service, peer) = connect_counter(&server, &client);

    client.send(peer, Channel::Guaranteed, &text("first")).unwrap();
    assert!(wait_until(Duration::from_secs(2), || counter.count() == 1));
    assert_eq!(server.inbound_snapshot().len(), 1);

    // Queue a packet the service will never see.
    server.pause();
    client.send(peer, Channel::Guaranteed, &text("second")).unwrap();
    thread::sleep(Duration::from_millis(50));
    server.unregister(service);
    assert!(server.inbound_snapshot().is_empty());
    server.unpause();

    assert!(wait_until(Duration::from_secs(2), || {
        client.peer_state(peer) == PeerState::Disconnected
    }));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(counter.count(), 1);
    assert_eq!(client.outbound_count(), 0);

    client.shut_down().unwrap();
    server.shut_down().unwrap();
}

#[test]
fn test_unregistering_the_owner_closes_its_connections() {
    let server = fast_host();
    let client = fast_host();
    let owner = client.register(Arc::new(Quiet), None).unwrap();
    let service = server.register(Arc::new(Counter::default()), None).unwrap();
    let peer = client
        .open(server.loopback_addr().unwrap(), service, owner)
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        server.inbound_snapshot().len() == 1
    }));

    client.unregister(owner);
    assert_eq!(client.outbound_count(), 0);
    assert!(wait_until(Duration::from_secs(2), || {
        server.inbound_snapshot().is_empty()
    }));
    assert_eq!(client.peer_state(peer), PeerState::Disconnected);

    client.shut_down().unwrap();
    server.shut_down().unwrap();
}

#[test]
fn test_full_registry_refuses_connections() {
    let server = host_with(HostConfig {
        max_connections: 1,
        ..HostConfig::default()
    });
    let first = fast_host();
    let (_, service, _) = connect_counter(&server, &first);

    let second = host_with(HostConfig {
        connect_timeout_ms: 5000,
        ..HostConfig::default()
    });
    let owner = second.register(Arc::new(Quiet), None).unwrap();
    let start = Instant::now();
    let peer = second
        .open(server.loopback_addr().unwrap(), service, owner)
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        second.peer_state(peer) == PeerState::Disconnected
    }));
    // Turned away, not timed out.
    assert!(start.elapsed() < Duration::from_secs(2));
    assert_eq!(server.inbound_snapshot().len(), 1);

    second.shut_down().unwrap();
    first.shut_down().unwrap();
    server.shut_down().unwrap();
}
