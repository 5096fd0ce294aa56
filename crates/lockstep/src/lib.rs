pub mod config;
pub mod error;
pub mod latch;
pub mod net;
pub mod protocol;
pub mod session;

pub use config::{ClientConfig, HostConfig, ServerConfig, MAX_NET_PLAYER};
pub use error::{JoinOutcome, NetError, WaitOutcome};
pub use latch::{
    Buttons, Latch, LatchAnomaly, LatchEntry, SyncCounts, SyncMonitor, TimeLatch,
    TimeLatchBuffer, MAX_LAG, SHORT_LATCH, START_TALK,
};
pub use net::{
    Channel, HandlerId, IncomingPacket, LocalPacket, NetHost, NetworkStats, PacketKind,
    PacketSink, PeerId, PeerState, Stream, SERVER_PORT,
};
pub use session::{
    ClientSession, DisconnectReason, ModuleDescriptor, RespawnMode, ServerEvent, ServerSession,
    GAME_SERVICE,
};
