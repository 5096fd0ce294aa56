mod connection;
mod host;
mod packet;
mod request;
mod slots;
mod stats;
mod stream;
mod transport;

pub const MAX_CONNECTION: usize = 16;
pub const REQUEST_COUNT: usize = 32;
pub const REQUEST_BUFFER_SIZE: usize = MAX_SEND_SIZE;
pub const SERVER_PORT: u16 = 0x8742;

pub use connection::{
    HandlerId, HandlerRegistry, InboundConnection, InboundConnections, OutboundConnection,
    OutboundConnections,
};
pub use host::{resolve, HostFlags, IncomingPacket, NetHost, PacketSink};
pub use packet::{kind_name, Channel, LocalPacket, PacketKind, MAX_SEND_SIZE};
pub use request::{RequestPool, RequestStatus, RequestTicket};
pub use slots::Slots;
pub use stats::{NetworkStats, RttEstimator};
pub use stream::Stream;
pub use transport::{
    sequence_greater_than, Endpoint, PeerId, PeerState, TransportEvent, TransportSettings,
    PROTOCOL_MAGIC, PROTOCOL_VERSION,
};
