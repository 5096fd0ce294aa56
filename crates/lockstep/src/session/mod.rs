mod client;
mod files;
mod module;
mod server;

use crate::net::HandlerId;

/// Handler id a game server registers under; clients name it when they
/// connect.
pub const GAME_SERVICE: HandlerId = HandlerId(0x0000_8742);

pub use client::{ClientSession, ClientSink};
pub use files::{file_packets, DiscardFiles, FileTransferSink};
pub use module::{ModuleDescriptor, RespawnMode};
pub use server::{DisconnectReason, ServerEvent, ServerSession, ServerSink};
