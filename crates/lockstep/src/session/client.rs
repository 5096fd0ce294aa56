use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use super::files::{file_packets, DiscardFiles, FileTransferSink};
use super::module::ModuleDescriptor;
use super::GAME_SERVICE;
use crate::config::{ClientConfig, MAX_NET_PLAYER};
use crate::error::{JoinOutcome, NetError, WaitOutcome};
use crate::latch::{Latch, SyncCounts, SyncMonitor, TimeLatchBuffer, START_TALK};
use crate::net::{
    resolve, Channel, HandlerId, IncomingPacket, LocalPacket, NetHost, PacketKind, PacketSink,
    PeerId, PeerState, RequestStatus, RequestTicket, Stream,
};
use crate::protocol::{
    DirCreate, FileChunk, FileCount, LatchUpdate, LogonReply, LogonRequest, Logoff, Message,
    ModuleOffer,
};

/// One candidate host being asked for its module.
#[derive(Debug)]
struct ModuleQuery {
    host: String,
    peer: PeerId,
    ticket: Option<RequestTicket>,
    refused: bool,
}

#[derive(Debug, Default)]
struct ClientState {
    logged_on: bool,
    waiting: bool,
    session_id: Option<u8>,
    joined: Option<SocketAddr>,
    game_peer: Option<PeerId>,
    seed: u32,
    modules: Vec<ModuleDescriptor>,
    selected_module: Option<usize>,
    queries: Vec<ModuleQuery>,
}

/// The client's half of the session, driven by the host's worker thread.
pub struct ClientSink {
    state: Mutex<ClientState>,
    latches: Mutex<TimeLatchBuffer>,
    monitor: SyncMonitor,
    now: AtomicU32,
    files: Arc<dyn FileTransferSink>,
}

impl ClientSink {
    fn new(max_entities: usize, files: Arc<dyn FileTransferSink>) -> Self {
        Self {
            state: Mutex::new(ClientState::default()),
            latches: Mutex::new(TimeLatchBuffer::new(max_entities)),
            monitor: SyncMonitor::default(),
            now: AtomicU32::new(0),
            files,
        }
    }

    fn state(&self) -> MutexGuard<'_, ClientState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn latches(&self) -> MutexGuard<'_, TimeLatchBuffer> {
        self.latches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_kick(&self, host: &NetHost, handler: HandlerId) {
        let peer = {
            let mut state = self.state();
            state.logged_on = false;
            state.waiting = true;
            state.game_peer.take()
        };
        log::warn!("Kicked by the host");
        if let Some(peer) = peer {
            host.release_peer(handler, peer);
        }
    }

    fn handle_module_offer(&self, host: &NetHost, packet: &mut IncomingPacket<'_>) -> bool {
        let Some(offer) = ModuleOffer::read(&mut packet.stream) else {
            return false;
        };

        let (reply, target) = {
            let mut state = self.state();
            if !state.waiting {
                log::debug!("Ignoring module offer {} while not waiting", offer.load_name);
                return true;
            }
            state.seed = offer.seed;
            let found = state
                .modules
                .iter()
                .position(|m| m.load_name == offer.load_name);
            let reply = match found {
                Some(index) => {
                    state.selected_module = Some(index);
                    state.waiting = false;
                    log::info!("Host selected module {}", offer.load_name);
                    PacketKind::ToHostModuleOk
                }
                None => {
                    log::warn!("Host offered unknown module {}", offer.load_name);
                    PacketKind::ToHostModuleBad
                }
            };
            (reply, state.game_peer.unwrap_or(packet.peer))
        };

        if let Err(e) = host.send(target, Channel::Guaranteed, &LocalPacket::new(reply)) {
            log::warn!("Could not answer module offer: {}", e);
        }
        true
    }

    fn handle_latch(&self, packet: &mut IncomingPacket<'_>) -> bool {
        let Some(update) = LatchUpdate::read(&mut packet.stream) else {
            return false;
        };
        let now = self.now.load(Ordering::SeqCst);
        let anomaly = self.latches().receive(now, update.stamp, &update.entries);
        self.monitor.record(anomaly, update.stamp);
        true
    }
}

impl PacketSink for ClientSink {
    fn handle_packet(&self, host: &NetHost, packet: &mut IncomingPacket<'_>) -> bool {
        let Some(kind) = packet.kind else {
            return false;
        };

        match kind {
            PacketKind::ToAnyText => {
                log::info!("{}: {}", packet.peer, packet.stream.read_string());
                true
            }
            PacketKind::ToRemoteKick => {
                self.handle_kick(host, packet.handler);
                true
            }
            PacketKind::ToRemoteLogon => {
                let mut state = self.state();
                if state.game_peer == Some(packet.peer) {
                    state.logged_on = true;
                }
                true
            }
            PacketKind::ToRemoteLogoff => {
                let mut state = self.state();
                if state.game_peer == Some(packet.peer) {
                    log::info!("Host ended the game");
                    state.logged_on = false;
                }
                true
            }
            PacketKind::ToRemoteModule => self.handle_module_offer(host, packet),
            PacketKind::ToRemoteModuleBad => {
                let mut state = self.state();
                if let Some(query) = state.queries.iter_mut().find(|q| q.peer == packet.peer) {
                    log::info!("{} is not hosting a module", query.host);
                    query.refused = true;
                }
                true
            }
            // Arrived after its request expired.
            PacketKind::ToRemoteModuleInfo => true,
            PacketKind::ToRemoteStart => {
                log::info!("Game started");
                self.state().waiting = false;
                true
            }
            PacketKind::ToRemoteLatch => self.handle_latch(packet),
            PacketKind::ToRemoteFile => match FileChunk::read(&mut packet.stream) {
                Some(chunk) => {
                    self.files.file_chunk(packet.peer, &chunk);
                    true
                }
                None => false,
            },
            PacketKind::ToRemoteDir => match DirCreate::read(&mut packet.stream) {
                Some(dir) => {
                    self.files.create_dir(packet.peer, &dir.path);
                    true
                }
                None => false,
            },
            PacketKind::ToRemoteFileCount => match FileCount::read(&mut packet.stream) {
                Some(count) => {
                    self.files.file_count(packet.peer, count.count);
                    true
                }
                None => false,
            },
            PacketKind::ToRemoteRts | PacketKind::ToRemoteChrSpawn => {
                log::debug!("Ignoring {} from {}", kind, packet.peer);
                true
            }
            _ => false,
        }
    }

    fn on_disconnect(&self, _host: &NetHost, peer: PeerId) {
        let mut state = self.state();
        if state.game_peer == Some(peer) {
            log::info!("Lost connection to the host");
            state.game_peer = None;
            state.logged_on = false;
        }
    }
}

/// Client side of a game: joining, module discovery and the per-tick
/// latch exchange with the host.
pub struct ClientSession {
    host: NetHost,
    config: ClientConfig,
    handler: HandlerId,
    sink: Arc<ClientSink>,
    local_entities: Vec<u16>,
}

impl ClientSession {
    pub fn new(host: NetHost, config: ClientConfig) -> Result<Self, NetError> {
        Self::with_files(host, config, Arc::new(DiscardFiles))
    }

    pub fn with_files(
        host: NetHost,
        config: ClientConfig,
        files: Arc<dyn FileTransferSink>,
    ) -> Result<Self, NetError> {
        let sink = Arc::new(ClientSink::new(config.max_entities, files));
        let handler = host.register(sink.clone(), None)?;
        Ok(Self {
            host,
            config,
            handler,
            sink,
            local_entities: Vec::new(),
        })
    }

    pub fn host(&self) -> &NetHost {
        &self.host
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn handler(&self) -> HandlerId {
        self.handler
    }

    fn open(&self, hostname: &str) -> Result<PeerId, NetError> {
        let addr = resolve(hostname, self.config.server_port)?;
        self.open_addr(addr)
    }

    fn open_addr(&self, addr: SocketAddr) -> Result<PeerId, NetError> {
        self.host.open(addr, GAME_SERVICE, self.handler)
    }

    fn wait_connected(&self, peer: PeerId) -> bool {
        let poll = Duration::from_millis(self.config.connect_poll_ms);
        for _ in 0..self.config.connect_attempts {
            match self.host.peer_state(peer) {
                PeerState::Connected => return true,
                PeerState::Disconnected => return false,
                _ => thread::sleep(poll),
            }
        }
        self.host.peer_state(peer) == PeerState::Connected
    }

    /// Opens the game connection. Any previous one is dropped first.
    pub fn connect(&self, hostname: &str) -> bool {
        self.disconnect();

        let peer = match self.open(hostname) {
            Ok(peer) => peer,
            Err(e) => {
                log::warn!("Cannot connect to {}: {}", hostname, e);
                return false;
            }
        };
        if !self.wait_connected(peer) {
            log::warn!("Connection to {} failed", hostname);
            self.host.release_peer(self.handler, peer);
            return false;
        }

        log::info!("Connected to {} as {}", hostname, peer);
        self.sink.state().game_peer = Some(peer);
        true
    }

    pub fn disconnect(&self) {
        let peer = self.sink.state().game_peer.take();
        if let Some(peer) = peer {
            log::debug!("Closing game connection {}", peer);
            self.host.release_peer(self.handler, peer);
        }
    }

    /// Logs on to `hostname` over a connection that is closed again
    /// whatever the outcome.
    pub fn join_game(&self, hostname: &str) -> JoinOutcome {
        if !self.host.is_active() {
            return JoinOutcome::Unreachable;
        }
        let addr = match resolve(hostname, self.config.server_port) {
            Ok(addr) => addr,
            Err(e) => {
                log::warn!("Cannot join {}: {}", hostname, e);
                return JoinOutcome::Unreachable;
            }
        };
        let peer = match self.open_addr(addr) {
            Ok(peer) => peer,
            Err(e) => {
                log::warn!("Cannot join {}: {}", hostname, e);
                return JoinOutcome::Unreachable;
            }
        };
        if !self.wait_connected(peer) {
            self.host.release_peer(self.handler, peer);
            return JoinOutcome::Unreachable;
        }

        let outcome = self.logon(peer);
        self.host.release_peer(self.handler, peer);
        if outcome.is_accepted() {
            self.sink.state().joined = Some(addr);
        }
        log::info!("Joining {}: {}", hostname, outcome.as_str());
        outcome
    }

    fn logon(&self, peer: PeerId) -> JoinOutcome {
        let timeout = Duration::from_millis(self.config.join_timeout_ms);
        let ticket = match self.host.prepare_wait(peer, timeout, PacketKind::ToRemoteLogon) {
            Ok(ticket) => ticket,
            Err(e) => {
                log::warn!("Cannot wait for logon reply: {}", e);
                return JoinOutcome::Unreachable;
            }
        };

        // A module offer may follow the reply closely.
        self.sink.state().waiting = true;

        let request = LogonRequest {
            name: self.config.display_name.clone(),
        }
        .to_packet(PacketKind::ToHostLogon);
        if let Err(e) = self.host.send(peer, Channel::Guaranteed, &request) {
            log::warn!("Logon request failed: {}", e);
            self.host.release(ticket);
            self.sink.state().waiting = false;
            return JoinOutcome::Unreachable;
        }

        let mut buffer = [0u8; 16];
        let len = match self.host.finish_wait(ticket, &mut buffer) {
            WaitOutcome::Received(len) => len,
            WaitOutcome::Timeout => {
                self.sink.state().waiting = false;
                return JoinOutcome::TimedOut;
            }
        };

        let mut stream = Stream::new(&buffer[..len]);
        stream.read_u16();
        match LogonReply::read(&mut stream) {
            Some(reply) if reply.accepted => {
                let mut state = self.sink.state();
                state.session_id = Some(reply.session_id);
                state.logged_on = true;
                state.waiting = true;
                JoinOutcome::Accepted {
                    session_id: reply.session_id,
                }
            }
            Some(_) => {
                let mut state = self.sink.state();
                state.session_id = None;
                state.waiting = false;
                JoinOutcome::Refused
            }
            None => {
                log::warn!("Malformed logon reply from {}", peer);
                self.sink.state().waiting = false;
                JoinOutcome::Refused
            }
        }
    }

    /// Tells the host we are leaving, if logged on, then drops the game
    /// connection. Without a game connection the notice goes over a
    /// connection of its own. Returns whether the notice went out.
    pub fn unjoin_game(&self) -> bool {
        let (notice, peer, joined) = {
            let mut state = self.sink.state();
            let notice = state.logged_on.then(|| Logoff {
                name: self.config.display_name.clone(),
                session_id: state.session_id.unwrap_or(LogonReply::REFUSED_ID),
            });
            state.logged_on = false;
            state.session_id = None;
            (notice, state.game_peer, state.joined.take())
        };

        let sent = match notice.map(|n| n.to_packet(PacketKind::ToHostLogoff)) {
            Some(packet) => {
                log::info!("Telling the host we are logging off");
                match (peer, joined) {
                    (Some(peer), _) => self.send_notice(peer, &packet),
                    (None, Some(addr)) => self.send_notice_once(addr, &packet),
                    (None, None) => false,
                }
            }
            None => false,
        };
        self.disconnect();
        sent
    }

    fn send_notice(&self, peer: PeerId, packet: &LocalPacket) -> bool {
        match self.host.send(peer, Channel::Guaranteed, packet) {
            Ok(()) => true,
            Err(e) => {
                log::debug!("Notice not sent to {}: {}", peer, e);
                false
            }
        }
    }

    /// Sends `packet` over a short-lived connection and waits, up to the
    /// linger time, for that connection to close once it is delivered.
    fn send_notice_once(&self, addr: SocketAddr, packet: &LocalPacket) -> bool {
        let peer = match self.open_addr(addr) {
            Ok(peer) => peer,
            Err(e) => {
                log::debug!("Cannot reach {}: {}", addr, e);
                return false;
            }
        };
        let sent = self.wait_connected(peer) && self.send_notice(peer, packet);
        self.host.release_peer(self.handler, peer);

        if sent {
            let linger = Duration::from_millis(self.host.config().disconnect_linger_ms);
            let poll = Duration::from_millis(self.config.connect_poll_ms.max(1));
            let start = Instant::now();
            while self.host.peer_state(peer) != PeerState::Disconnected && start.elapsed() < linger {
                thread::sleep(poll);
            }
        }
        sent
    }

    /// Opens a connection to every configured candidate host. Returns how
    /// many are being tried.
    pub fn begin_request_module(&self) -> usize {
        self.end_request_module();
        self.sink.state().modules.clear();

        let mut queries = Vec::new();
        for hostname in self.config.candidate_hosts.iter().take(MAX_NET_PLAYER) {
            match self.open(hostname) {
                Ok(peer) => queries.push(ModuleQuery {
                    host: hostname.clone(),
                    peer,
                    ticket: None,
                    refused: false,
                }),
                Err(e) => log::warn!("Skipping candidate {}: {}", hostname, e),
            }
        }

        let count = queries.len();
        self.sink.state().queries = queries;
        count
    }

    /// Asks every candidate that has connected and not been asked yet.
    /// Returns how many requests went out.
    pub fn request_module_info(&self) -> usize {
        let timeout = Duration::from_millis(self.config.module_info_timeout_ms);
        let mut state = self.sink.state();
        let mut asked = 0;

        for query in state.queries.iter_mut() {
            if query.ticket.is_some() || query.refused {
                continue;
            }
            if self.host.peer_state(query.peer) != PeerState::Connected {
                continue;
            }
            let ticket =
                match self
                    .host
                    .prepare_wait(query.peer, timeout, PacketKind::ToRemoteModuleInfo)
                {
                    Ok(ticket) => ticket,
                    Err(e) => {
                        log::warn!("Cannot ask {} for its module: {}", query.host, e);
                        continue;
                    }
                };
            let request = LocalPacket::new(PacketKind::ToHostModule);
            match self.host.send(query.peer, Channel::Guaranteed, &request) {
                Ok(()) => {
                    query.ticket = Some(ticket);
                    asked += 1;
                }
                Err(e) => {
                    self.host.release(ticket);
                    log::warn!("Module request to {} failed: {}", query.host, e);
                }
            }
        }
        asked
    }

    /// Collects any module descriptions that have arrived. Returns true
    /// while some candidates have still not answered.
    pub fn load_module_info(&self) -> bool {
        let mut state = self.sink.state();
        let ClientState {
            queries, modules, ..
        } = &mut *state;
        let mut outstanding = false;

        queries.retain_mut(|query| {
            let finished = match query.ticket {
                _ if query.refused => true,
                None => {
                    let gone = self.host.peer_state(query.peer) == PeerState::Disconnected;
                    if gone {
                        log::info!("{} did not answer", query.host);
                    }
                    gone
                }
                Some(ticket) => match self.host.poll(ticket) {
                    RequestStatus::Pending => false,
                    RequestStatus::Received(_) => {
                        match self.host.request_payload(ticket).and_then(|payload| {
                            let mut stream = Stream::new(&payload);
                            stream.read_u16();
                            ModuleDescriptor::read(&mut stream)
                        }) {
                            Some(mut descriptor) => {
                                log::info!("{} hosts {}", query.host, descriptor.long_name);
                                descriptor.host = query.host.clone();
                                modules.push(descriptor);
                            }
                            None => log::warn!("Malformed module info from {}", query.host),
                        }
                        true
                    }
                    RequestStatus::Expired => {
                        log::info!("No module info from {}", query.host);
                        true
                    }
                },
            };

            if finished {
                if let Some(ticket) = query.ticket.take() {
                    self.host.release(ticket);
                }
                self.host.release_peer(self.handler, query.peer);
            } else {
                outstanding = true;
            }
            !finished
        });

        outstanding
    }

    /// Abandons discovery and closes every candidate connection.
    pub fn end_request_module(&self) {
        let queries = std::mem::take(&mut self.sink.state().queries);
        for query in queries {
            if let Some(ticket) = query.ticket {
                self.host.release(ticket);
            }
            self.host.release_peer(self.handler, query.peer);
        }
    }

    pub fn modules(&self) -> Vec<ModuleDescriptor> {
        self.sink.state().modules.clone()
    }

    pub fn select_module(&self, index: usize) -> bool {
        let mut state = self.sink.state();
        if index >= state.modules.len() {
            return false;
        }
        state.selected_module = Some(index);
        true
    }

    pub fn selected_module(&self) -> Option<ModuleDescriptor> {
        let state = self.sink.state();
        state
            .selected_module
            .and_then(|index| state.modules.get(index).cloned())
    }

    /// Entities whose input this client samples and sends.
    pub fn set_local_entities(&mut self, entities: Vec<u16>) {
        self.local_entities = entities;
    }

    pub fn local_entities(&self) -> &[u16] {
        &self.local_entities
    }

    /// Buffers input sampled at `tick`; it applies to the tick after.
    pub fn buffer_local_latch(&self, entity: u16, tick: u32, latch: Latch) {
        self.sink
            .latches()
            .buffer_local(entity as usize, tick, latch.quantized());
    }

    /// Sends the local latches buffered for the tick after `frame`.
    /// Returns false when there was nothing to send yet.
    pub fn send_latches(&self, frame: u32) -> Result<bool, NetError> {
        if frame <= START_TALK || self.local_entities.is_empty() {
            return Ok(false);
        }
        let Some(peer) = self.sink.state().game_peer else {
            return Ok(false);
        };

        let stamp = frame.wrapping_add(1);
        let entries = self
            .sink
            .latches()
            .entries_at(stamp, self.local_entities.iter().map(|&e| e as usize));
        let packet = LatchUpdate { stamp, entries }.to_packet(PacketKind::ToHostLatch);
        self.host.send(peer, Channel::BestEffort, &packet)?;
        Ok(true)
    }

    /// Applies every latch for `tick` and moves the session clock there.
    pub fn unbuffer_latches(&self, tick: u32, apply: impl FnMut(usize, Latch)) -> usize {
        self.sink.now.store(tick, Ordering::SeqCst);
        self.sink.latches().consume(tick, apply)
    }

    /// Latch waiting to be applied at `tick`, without consuming it.
    pub fn pending_latch(&self, entity: usize, tick: u32) -> Option<Latch> {
        self.sink.latches().latch_at(entity, tick)
    }

    pub fn applied_latch(&self, entity: usize) -> Latch {
        self.sink.latches().applied(entity)
    }

    pub fn reset_latches(&self) {
        self.sink.latches().reset();
        self.sink.now.store(0, Ordering::SeqCst);
    }

    pub fn is_out_of_sync(&self) -> bool {
        self.sink.monitor.is_out_of_sync()
    }

    pub fn take_out_of_sync(&self) -> bool {
        self.sink.monitor.take_out_of_sync()
    }

    pub fn sync_counts(&self) -> SyncCounts {
        self.sink.monitor.counts()
    }

    /// Tells the host this client has loaded the module.
    pub fn send_loaded(&self) -> Result<bool, NetError> {
        let Some(peer) = self.sink.state().game_peer else {
            return Ok(false);
        };
        let packet = LocalPacket::new(PacketKind::ToHostImLoaded);
        self.host.send(peer, Channel::Guaranteed, &packet)?;
        Ok(true)
    }

    /// Sends a file to the host. Returns the number of packets queued.
    pub fn send_file(&self, path: &str, data: &[u8]) -> Result<usize, NetError> {
        let peer = self
            .sink
            .state()
            .game_peer
            .ok_or(NetError::NotStarted)?;
        let packets = file_packets(PacketKind::ToHostFile, path, data);
        for packet in &packets {
            self.host.send(peer, Channel::Guaranteed, packet)?;
        }
        self.host.send(
            peer,
            Channel::Guaranteed,
            &LocalPacket::new(PacketKind::ToHostFileSent),
        )?;
        Ok(packets.len())
    }

    pub fn is_logged_on(&self) -> bool {
        self.sink.state().logged_on
    }

    pub fn is_waiting(&self) -> bool {
        self.sink.state().waiting
    }

    pub fn set_waiting(&self, waiting: bool) {
        self.sink.state().waiting = waiting;
    }

    pub fn session_id(&self) -> Option<u8> {
        self.sink.state().session_id
    }

    pub fn game_peer(&self) -> Option<PeerId> {
        self.sink.state().game_peer
    }

    pub fn seed(&self) -> u32 {
        self.sink.state().seed
    }

    /// Logs off, stops discovery and unregisters from the host.
    pub fn shut_down(&self) {
        self.unjoin_game();
        self.end_request_module();
        self.host.unregister(self.handler);
    }
}
