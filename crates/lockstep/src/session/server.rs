use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use super::files::{DiscardFiles, FileTransferSink};
use super::module::ModuleDescriptor;
use super::GAME_SERVICE;
use crate::config::ServerConfig;
use crate::error::NetError;
use crate::latch::{Latch, LatchEntry, TimeLatchBuffer, MAX_LAG, START_TALK};
use crate::net::{
    Channel, HandlerId, IncomingPacket, LocalPacket, NetHost, PacketKind, PacketSink, PeerId,
};
use crate::protocol::{
    DirCreate, FileChunk, LatchUpdate, LogonReply, LogonRequest, Logoff, Message, ModuleOffer,
};

const MAX_PENDING_EVENTS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    Closed,
    Kicked,
}

impl DisconnectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DisconnectReason::Closed => "closed",
            DisconnectReason::Kicked => "kicked",
        }
    }
}

/// Things that happened on the server since the last drain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ClientConnected {
        peer: PeerId,
        addr: Option<SocketAddr>,
    },
    ClientDisconnected {
        peer: PeerId,
        reason: DisconnectReason,
    },
    LoggedOn {
        peer: PeerId,
        name: String,
        session_id: u8,
    },
    LogonRefused {
        peer: PeerId,
        name: String,
    },
    LoggedOff {
        name: String,
        session_id: u8,
    },
    ModuleRequested {
        peer: PeerId,
    },
    ModuleAccepted {
        peer: PeerId,
    },
    ModuleRejected {
        peer: PeerId,
    },
    PlayerLoaded {
        peer: PeerId,
        loaded: usize,
    },
    GameStarted {
        players: usize,
    },
    FileReceived {
        peer: PeerId,
        path: String,
    },
    Kicked {
        peer: PeerId,
    },
}

#[derive(Debug, Clone)]
struct HostedModule {
    descriptor: ModuleDescriptor,
    seed: u32,
}

/// A logged-on player. The logon lasts as long as the connection it was
/// made on, or until the player logs off.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Logon {
    session_id: u8,
    peer: PeerId,
}

#[derive(Debug, Default)]
struct ServerState {
    module: Option<HostedModule>,
    logons: HashMap<String, Logon>,
    next_session_id: u8,
    loaded: HashSet<PeerId>,
    ready: bool,
    kicked: HashSet<PeerId>,
    events: VecDeque<ServerEvent>,
}

impl ServerState {
    fn push(&mut self, event: ServerEvent) {
        if self.events.len() >= MAX_PENDING_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(event);
    }

    fn allocate_session_id(&mut self) -> Option<u8> {
        for _ in 0..LogonReply::REFUSED_ID {
            let id = self.next_session_id;
            self.next_session_id = match id.wrapping_add(1) {
                LogonReply::REFUSED_ID => 0,
                next => next,
            };
            if !self.logons.values().any(|logon| logon.session_id == id) {
                return Some(id);
            }
        }
        None
    }

    /// Drops whatever `peer` held: its logons and its loaded mark.
    fn forget_peer(&mut self, peer: PeerId) {
        self.loaded.remove(&peer);
        let names: Vec<String> = self
            .logons
            .iter()
            .filter(|(_, logon)| logon.peer == peer)
            .map(|(name, _)| name.clone())
            .collect();
        for name in names {
            if let Some(logon) = self.logons.remove(&name) {
                log::info!("{} left with {}", name, peer);
                self.push(ServerEvent::LoggedOff {
                    name,
                    session_id: logon.session_id,
                });
            }
        }
    }
}

/// The host's half of the session, driven by the host's worker thread.
pub struct ServerSink {
    state: Mutex<ServerState>,
    incoming: Mutex<TimeLatchBuffer>,
    files: Arc<dyn FileTransferSink>,
}

impl ServerSink {
    fn new(max_entities: usize, files: Arc<dyn FileTransferSink>) -> Self {
        Self {
            state: Mutex::new(ServerState::default()),
            incoming: Mutex::new(TimeLatchBuffer::new(max_entities)),
            files,
        }
    }

    fn state(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn incoming(&self) -> MutexGuard<'_, TimeLatchBuffer> {
        self.incoming.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle_logon(&self, host: &NetHost, packet: &mut IncomingPacket<'_>) -> bool {
        let Some(request) = LogonRequest::read(&mut packet.stream) else {
            return false;
        };

        let reply = {
            let mut state = self.state();
            let session_id = if state.logons.contains_key(&request.name) {
                None
            } else {
                state.allocate_session_id()
            };
            match session_id {
                Some(session_id) => {
                    state.logons.insert(
                        request.name.clone(),
                        Logon {
                            session_id,
                            peer: packet.peer,
                        },
                    );
                    state.push(ServerEvent::LoggedOn {
                        peer: packet.peer,
                        name: request.name.clone(),
                        session_id,
                    });
                    LogonReply {
                        accepted: true,
                        session_id,
                    }
                }
                None => {
                    state.push(ServerEvent::LogonRefused {
                        peer: packet.peer,
                        name: request.name.clone(),
                    });
                    LogonReply::refused()
                }
            }
        };

        if reply.accepted {
            log::info!("{} logged on as session {}", request.name, reply.session_id);
            host.set_connection_name(packet.peer, &request.name);
        } else {
            log::warn!("Refusing logon for {}: name in use", request.name);
        }
        if let Err(e) = host.send(
            packet.peer,
            Channel::Guaranteed,
            &reply.to_packet(PacketKind::ToRemoteLogon),
        ) {
            log::warn!("Logon reply to {} failed: {}", packet.peer, e);
        }
        true
    }

    fn handle_logoff(&self, packet: &mut IncomingPacket<'_>) -> bool {
        let Some(logoff) = Logoff::read(&mut packet.stream) else {
            return false;
        };
        let mut state = self.state();
        let known = state
            .logons
            .get(&logoff.name)
            .is_some_and(|logon| logon.session_id == logoff.session_id);
        if known {
            state.logons.remove(&logoff.name);
            log::info!("{} logged off", logoff.name);
            state.push(ServerEvent::LoggedOff {
                name: logoff.name,
                session_id: logoff.session_id,
            });
        } else {
            log::debug!("Logoff for unknown logon {}", logoff.name);
        }
        true
    }

    fn handle_module_request(&self, host: &NetHost, peer: PeerId) -> bool {
        let reply = {
            let mut state = self.state();
            state.push(ServerEvent::ModuleRequested { peer });
            match &state.module {
                Some(hosted) => hosted.descriptor.to_packet(PacketKind::ToRemoteModuleInfo),
                None => LocalPacket::new(PacketKind::ToRemoteModuleBad),
            }
        };
        if let Err(e) = host.send(peer, Channel::Guaranteed, &reply) {
            log::warn!("Module reply to {} failed: {}", peer, e);
        }
        true
    }

    fn handle_latch(&self, packet: &mut IncomingPacket<'_>) -> bool {
        let Some(update) = LatchUpdate::read(&mut packet.stream) else {
            return false;
        };
        let mut incoming = self.incoming();
        for entry in &update.entries {
            incoming.store(entry.entity as usize, update.stamp, entry.latch);
        }
        true
    }

    fn handle_loaded(&self, host: &NetHost, peer: PeerId) -> bool {
        let start = {
            let mut state = self.state();
            if !state.loaded.insert(peer) {
                log::debug!("{} reported loaded twice", peer);
            }
            let loaded = state.loaded.len();
            state.push(ServerEvent::PlayerLoaded { peer, loaded });

            let in_range = state
                .module
                .as_ref()
                .is_some_and(|hosted| hosted.descriptor.accepts_players(loaded));
            if in_range && !state.ready {
                state.ready = true;
                state.push(ServerEvent::GameStarted { players: loaded });
            }
            in_range
        };

        if start {
            let packet = LocalPacket::new(PacketKind::ToRemoteStart);
            match host.broadcast(Channel::Guaranteed, &packet, |_| true) {
                Ok(count) => log::info!("Sent start to {} clients", count),
                Err(e) => log::warn!("Start broadcast failed: {}", e),
            }
        }
        true
    }

    fn handle_file(&self, packet: &mut IncomingPacket<'_>) -> bool {
        let Some(chunk) = FileChunk::read(&mut packet.stream) else {
            return false;
        };
        self.files.file_chunk(packet.peer, &chunk);
        let end = chunk.offset as usize + chunk.data.len();
        if end >= chunk.total_size as usize {
            self.state().push(ServerEvent::FileReceived {
                peer: packet.peer,
                path: chunk.path,
            });
        }
        true
    }

    fn take_latches(&self, stamp: u32) -> Vec<LatchEntry> {
        self.incoming().take_entries_at(stamp)
    }
}

impl PacketSink for ServerSink {
    fn handle_packet(&self, host: &NetHost, packet: &mut IncomingPacket<'_>) -> bool {
        let Some(kind) = packet.kind else {
            return false;
        };

        match kind {
            PacketKind::ToAnyText => {
                log::info!("{}: {}", packet.peer, packet.stream.read_string());
                true
            }
            PacketKind::ToHostLogon => self.handle_logon(host, packet),
            PacketKind::ToHostLogoff => self.handle_logoff(packet),
            PacketKind::ToHostModule | PacketKind::ToHostRequestModule => {
                self.handle_module_request(host, packet.peer)
            }
            PacketKind::ToHostModuleOk => {
                log::info!("{} has the module", packet.peer);
                self.state()
                    .push(ServerEvent::ModuleAccepted { peer: packet.peer });
                true
            }
            PacketKind::ToHostModuleBad => {
                log::warn!("{} does not have the module", packet.peer);
                self.state()
                    .push(ServerEvent::ModuleRejected { peer: packet.peer });
                true
            }
            PacketKind::ToHostLatch => self.handle_latch(packet),
            PacketKind::ToHostImLoaded => self.handle_loaded(host, packet.peer),
            PacketKind::ToHostFile => self.handle_file(packet),
            PacketKind::ToHostDir => match DirCreate::read(&mut packet.stream) {
                Some(dir) => {
                    self.files.create_dir(packet.peer, &dir.path);
                    true
                }
                None => false,
            },
            PacketKind::ToHostFileSent => {
                self.files.transfer_done(packet.peer);
                true
            }
            PacketKind::ToHostRts => {
                log::debug!("Ignoring RTS order from {}", packet.peer);
                true
            }
            _ => false,
        }
    }

    fn on_connect(&self, host: &NetHost, peer: PeerId, incoming: bool) {
        if incoming {
            let addr = host.peer_addr(peer);
            self.state().push(ServerEvent::ClientConnected { peer, addr });
        }
    }

    fn on_disconnect(&self, _host: &NetHost, peer: PeerId) {
        let mut state = self.state();
        let reason = if state.kicked.remove(&peer) {
            DisconnectReason::Kicked
        } else {
            DisconnectReason::Closed
        };
        state.forget_peer(peer);
        state.push(ServerEvent::ClientDisconnected { peer, reason });
    }
}

/// Host side of a game: answers logons and module queries, and relays
/// every client's latches to everyone.
pub struct ServerSession {
    host: NetHost,
    config: ServerConfig,
    handler: HandlerId,
    sink: Arc<ServerSink>,
    relayed: TimeLatchBuffer,
}

impl ServerSession {
    pub fn new(host: NetHost, config: ServerConfig) -> Result<Self, NetError> {
        Self::with_files(host, config, Arc::new(DiscardFiles))
    }

    pub fn with_files(
        host: NetHost,
        config: ServerConfig,
        files: Arc<dyn FileTransferSink>,
    ) -> Result<Self, NetError> {
        let sink = Arc::new(ServerSink::new(config.max_entities, files));
        let handler = host.register(sink.clone(), Some(GAME_SERVICE))?;
        if handler != GAME_SERVICE {
            log::warn!("{} is taken, serving the game as {}", GAME_SERVICE, handler);
        }
        Ok(Self {
            host,
            relayed: TimeLatchBuffer::new(config.max_entities),
            config,
            handler,
            sink,
        })
    }

    pub fn host(&self) -> &NetHost {
        &self.host
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn handler(&self) -> HandlerId {
        self.handler
    }

    pub fn host_module(&self, descriptor: ModuleDescriptor, seed: u32) {
        log::info!("Hosting {} ({})", descriptor.long_name, descriptor.load_name);
        let mut state = self.sink.state();
        state.module = Some(HostedModule { descriptor, seed });
        state.loaded.clear();
        state.ready = false;
    }

    pub fn hosted_module(&self) -> Option<ModuleDescriptor> {
        self.sink
            .state()
            .module
            .as_ref()
            .map(|hosted| hosted.descriptor.clone())
    }

    /// Tells every connected client which module to load.
    pub fn offer_module(&self) -> Result<usize, NetError> {
        let offer = {
            let state = self.sink.state();
            let Some(hosted) = &state.module else {
                return Ok(0);
            };
            ModuleOffer {
                seed: hosted.seed,
                load_name: hosted.descriptor.load_name.clone(),
            }
        };
        self.host.broadcast(
            Channel::Guaranteed,
            &offer.to_packet(PacketKind::ToRemoteModule),
            |_| true,
        )
    }

    /// Buffers input for an entity the host itself controls.
    pub fn buffer_latch(&self, entity: u16, stamp: u32, latch: Latch) {
        self.sink
            .incoming()
            .store(entity as usize, stamp, latch.quantized());
    }

    /// Relays every buffered latch from the last [`MAX_LAG`] ticks, oldest
    /// stamp first. Returns the number of packets broadcast.
    pub fn talk_to_remotes(&mut self, frame: u32) -> Result<usize, NetError> {
        if frame <= START_TALK {
            return Ok(0);
        }

        let oldest = frame.saturating_sub(MAX_LAG as u32 - 1);
        let mut sent = 0;
        for stamp in oldest..=frame {
            let entries = self.sink.take_latches(stamp);
            if entries.is_empty() {
                continue;
            }
            for entry in &entries {
                self.relayed.store(entry.entity as usize, stamp, entry.latch);
            }
            let packet = LatchUpdate { stamp, entries }.to_packet(PacketKind::ToRemoteLatch);
            self.host.broadcast(Channel::BestEffort, &packet, |_| true)?;
            sent += 1;
        }
        Ok(sent)
    }

    /// Applies the latches relayed for `frame` to the host's simulation.
    pub fn unbuffer_latches(&mut self, frame: u32, apply: impl FnMut(usize, Latch)) -> usize {
        self.relayed.consume(frame, apply)
    }

    /// Sends `KICK` and drops the connection once it is delivered.
    pub fn kick(&self, peer: PeerId) -> Result<(), NetError> {
        {
            let mut state = self.sink.state();
            state.kicked.insert(peer);
            state.push(ServerEvent::Kicked { peer });
            state.forget_peer(peer);
        }
        let result = self.host.send(
            peer,
            Channel::Guaranteed,
            &LocalPacket::new(PacketKind::ToRemoteKick),
        );
        self.host.close_peer(peer);
        result
    }

    /// Ends the game: everyone is told if it had started, then every
    /// client connection is closed.
    pub fn unhost_game(&mut self) -> Result<(), NetError> {
        let ready = {
            let mut state = self.sink.state();
            let ready = state.ready;
            state.module = None;
            state.logons.clear();
            state.loaded.clear();
            state.ready = false;
            ready
        };

        if ready {
            let notice = Logoff {
                name: String::new(),
                session_id: LogonReply::REFUSED_ID,
            };
            self.host.broadcast(
                Channel::Guaranteed,
                &notice.to_packet(PacketKind::ToRemoteLogoff),
                |_| true,
            )?;
        }
        for connection in self.host.inbound_snapshot() {
            if connection.service == self.handler {
                self.host.close_peer(connection.peer);
            }
        }
        self.sink.incoming().reset();
        self.relayed.reset();
        log::info!("Game unhosted");
        Ok(())
    }

    pub fn drain_events(&self) -> Vec<ServerEvent> {
        self.sink.state().events.drain(..).collect()
    }

    pub fn logged_on_count(&self) -> usize {
        self.sink.state().logons.len()
    }

    pub fn loaded_count(&self) -> usize {
        self.sink.state().loaded.len()
    }

    pub fn is_ready(&self) -> bool {
        self.sink.state().ready
    }

    pub fn shut_down(&mut self) -> Result<(), NetError> {
        let result = self.unhost_game();
        self.host.unregister(self.handler);
        result
    }
}
