use std::net::SocketAddr;
use std::time::{Duration, Instant};

use lockstep::{
    HostConfig, ModuleDescriptor, NetError, NetHost, ServerConfig, ServerEvent, ServerSession,
};

use crate::simulation::{apply_latch, simulate_avatar, Avatar};

pub struct GameServer {
    host: NetHost,
    session: ServerSession,
    avatars: Vec<Avatar>,
    frame: u32,
    tick_duration: Duration,
    last_tick_time: Instant,
    accumulator: Duration,
}

impl GameServer {
    pub fn new(
        bind_addr: SocketAddr,
        host_config: HostConfig,
        config: ServerConfig,
        module: ModuleDescriptor,
        seed: u32,
    ) -> Result<Self, NetError> {
        let host = NetHost::new(host_config);
        host.start_up_on(bind_addr)?;

        let tick_duration = Duration::from_secs_f64(1.0 / config.tick_rate.max(1) as f64);
        let avatars = vec![Avatar::default(); config.max_entities];
        let session = ServerSession::new(host.clone(), config)?;
        session.host_module(module, seed);

        Ok(Self {
            host,
            session,
            avatars,
            frame: 0,
            tick_duration,
            last_tick_time: Instant::now(),
            accumulator: Duration::ZERO,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.host.local_addr()
    }

    /// Ticks until `limit` has passed, or forever without one.
    pub fn run(&mut self, limit: Option<Duration>) {
        let start = Instant::now();
        while limit.is_none_or(|limit| start.elapsed() < limit) {
            self.tick_once();
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    pub fn tick_once(&mut self) {
        let now = Instant::now();
        self.accumulator += now - self.last_tick_time;
        self.last_tick_time = now;

        self.handle_events();

        while self.accumulator >= self.tick_duration {
            self.accumulator -= self.tick_duration;
            self.tick();
        }
    }

    fn tick(&mut self) {
        // The clock only runs once every player has loaded.
        if !self.session.is_ready() {
            return;
        }

        if let Err(e) = self.session.talk_to_remotes(self.frame) {
            log::warn!("Latch relay failed at frame {}: {}", self.frame, e);
        }

        let avatars = &mut self.avatars;
        self.session.unbuffer_latches(self.frame, |entity, latch| {
            if let Some(avatar) = avatars.get_mut(entity) {
                apply_latch(avatar, latch);
            }
        });

        let dt = self.tick_duration.as_secs_f32();
        for avatar in &mut self.avatars {
            simulate_avatar(avatar, dt);
        }

        self.frame = self.frame.wrapping_add(1);
    }

    fn handle_events(&mut self) {
        for event in self.session.drain_events() {
            match event {
                ServerEvent::ClientConnected { peer, addr } => {
                    match addr {
                        Some(addr) => log::info!("Client {} connected from {}", peer, addr),
                        None => log::info!("Client {} connected", peer),
                    }
                }
                ServerEvent::ClientDisconnected { peer, reason } => {
                    log::info!("Client {} {}", peer, reason.as_str());
                }
                ServerEvent::LoggedOn {
                    name, session_id, ..
                } => {
                    log::info!("{} joined as player {}", name, session_id);
                    // Players still waiting pick the module up here.
                    if let Err(e) = self.session.offer_module() {
                        log::warn!("Module offer failed: {}", e);
                    }
                }
                ServerEvent::LogonRefused { peer, name } => {
                    log::warn!("Refused {} from {}", name, peer);
                }
                ServerEvent::LoggedOff { name, .. } => {
                    log::info!("{} left", name);
                }
                ServerEvent::ModuleRequested { peer } => {
                    log::debug!("Module info requested by {}", peer);
                }
                ServerEvent::ModuleAccepted { peer } => {
                    log::info!("{} accepted the module", peer);
                }
                ServerEvent::ModuleRejected { peer } => {
                    log::warn!("{} cannot load the module", peer);
                }
                ServerEvent::PlayerLoaded { peer, loaded } => {
                    log::info!("{} loaded ({} ready)", peer, loaded);
                }
                ServerEvent::GameStarted { players } => {
                    log::info!("Game started with {} players", players);
                    self.frame = 0;
                }
                ServerEvent::FileReceived { peer, path } => {
                    log::info!("Received {} from {}", path, peer);
                }
                ServerEvent::Kicked { peer } => {
                    log::info!("Kicked {}", peer);
                }
            }
        }
    }

    pub fn shut_down(&mut self) -> Result<(), NetError> {
        let stats = self.host.stats();
        log::info!(
            "Stopping at frame {}: {} packets sent, {} received, {:.1}% resent",
            self.frame,
            stats.packets_sent,
            stats.packets_received,
            stats.resend_percent()
        );
        self.session.shut_down()?;
        self.host.shut_down()
    }
}
