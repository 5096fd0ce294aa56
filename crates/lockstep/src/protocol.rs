//! Typed payloads for the session packets. Every packet is its kind tag
//! followed by the fields below, big-endian, strings `u16`-prefixed.

use crate::latch::{Latch, LatchEntry};
use crate::net::{LocalPacket, PacketKind, Stream};
use crate::session::{ModuleDescriptor, RespawnMode};

/// Bytes per entity in a latch packet: id, buttons, dx, dy.
pub const LATCH_ENTRY_SIZE: usize = 7;

pub trait Message: Sized {
    fn write(&self, packet: &mut LocalPacket);

    /// `None` when the payload is truncated.
    fn read(stream: &mut Stream<'_>) -> Option<Self>;

    fn to_packet(&self, kind: PacketKind) -> LocalPacket {
        let mut packet = LocalPacket::new(kind);
        self.write(&mut packet);
        packet
    }
}

fn complete<T>(stream: &Stream<'_>, value: T) -> Option<T> {
    (!stream.overrun()).then_some(value)
}

/// `TO_HOST_LOGON`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogonRequest {
    pub name: String,
}

impl Message for LogonRequest {
    fn write(&self, packet: &mut LocalPacket) {
        packet.add_string(&self.name);
    }

    fn read(stream: &mut Stream<'_>) -> Option<Self> {
        let name = stream.read_string();
        complete(stream, Self { name })
    }
}

/// `TO_REMOTE_LOGON`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogonReply {
    pub accepted: bool,
    pub session_id: u8,
}

impl LogonReply {
    pub const REFUSED_ID: u8 = 0xFF;

    pub fn refused() -> Self {
        Self {
            accepted: false,
            session_id: Self::REFUSED_ID,
        }
    }
}

impl Message for LogonReply {
    fn write(&self, packet: &mut LocalPacket) {
        packet.add_bool(self.accepted);
        packet.add_u8(self.session_id);
    }

    fn read(stream: &mut Stream<'_>) -> Option<Self> {
        let accepted = stream.read_bool();
        let session_id = stream.read_u8();
        complete(stream, Self { accepted, session_id })
    }
}

/// `TO_HOST_LOGOFF`, and `TO_REMOTE_LOGOFF` when the host goes away.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Logoff {
    pub name: String,
    pub session_id: u8,
}

impl Message for Logoff {
    fn write(&self, packet: &mut LocalPacket) {
        packet.add_string(&self.name);
        packet.add_u8(self.session_id);
    }

    fn read(stream: &mut Stream<'_>) -> Option<Self> {
        let name = stream.read_string();
        let session_id = stream.read_u8();
        complete(stream, Self { name, session_id })
    }
}

/// `TO_REMOTE_MODULE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleOffer {
    pub seed: u32,
    pub load_name: String,
}

impl Message for ModuleOffer {
    fn write(&self, packet: &mut LocalPacket) {
        packet.add_u32(self.seed);
        packet.add_string(&self.load_name);
    }

    fn read(stream: &mut Stream<'_>) -> Option<Self> {
        let seed = stream.read_u32();
        let load_name = stream.read_string();
        complete(stream, Self { seed, load_name })
    }
}

/// `TO_REMOTE_MODULEINFO`
impl Message for ModuleDescriptor {
    fn write(&self, packet: &mut LocalPacket) {
        packet.add_string(&self.rank);
        packet.add_string(&self.long_name);
        packet.add_string(&self.load_name);
        packet.add_u8(self.import_amount);
        packet.add_bool(self.allow_export);
        packet.add_u8(self.min_players);
        packet.add_u8(self.max_players);
        packet.add_bool(self.monsters_only);
        packet.add_bool(self.rts_control);
        packet.add_u8(self.respawn_mode as u8);
    }

    fn read(stream: &mut Stream<'_>) -> Option<Self> {
        let descriptor = Self {
            host: String::new(),
            rank: stream.read_string(),
            long_name: stream.read_string(),
            load_name: stream.read_string(),
            import_amount: stream.read_u8(),
            allow_export: stream.read_bool(),
            min_players: stream.read_u8(),
            max_players: stream.read_u8(),
            monsters_only: stream.read_bool(),
            rts_control: stream.read_bool(),
            respawn_mode: RespawnMode::from_u8(stream.read_u8()),
        };
        complete(stream, descriptor)
    }
}

/// `TO_HOST_LATCH` / `TO_REMOTE_LATCH`: a stamp, then entries until the
/// packet runs out.
#[derive(Debug, Clone, PartialEq)]
pub struct LatchUpdate {
    pub stamp: u32,
    pub entries: Vec<LatchEntry>,
}

impl Message for LatchUpdate {
    fn write(&self, packet: &mut LocalPacket) {
        packet.add_u32(self.stamp);
        for entry in &self.entries {
            let [dx, dy] = entry.latch.encode_motion();
            packet.add_u16(entry.entity);
            packet.add_u8(entry.latch.buttons.bits());
            packet.add_i16(dx);
            packet.add_i16(dy);
        }
    }

    fn read(stream: &mut Stream<'_>) -> Option<Self> {
        let stamp = stream.read_u32();
        if stream.overrun() {
            return None;
        }
        let mut entries = Vec::with_capacity(stream.remaining_size() / LATCH_ENTRY_SIZE);
        while stream.remaining_size() >= LATCH_ENTRY_SIZE {
            let entity = stream.read_u16();
            let buttons = stream.read_u8();
            let dx = stream.read_i16();
            let dy = stream.read_i16();
            entries.push(LatchEntry {
                entity,
                latch: Latch::from_wire(buttons, dx, dy),
            });
        }
        if !stream.is_empty() {
            log::debug!(
                "Ignoring {} trailing bytes in latch update",
                stream.remaining_size()
            );
        }
        Some(Self { stamp, entries })
    }
}

/// `TO_HOST_FILE` / `TO_REMOTE_FILE`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChunk {
    pub path: String,
    pub total_size: u32,
    pub offset: u32,
    pub data: Vec<u8>,
}

impl Message for FileChunk {
    fn write(&self, packet: &mut LocalPacket) {
        packet.add_string(&self.path);
        packet.add_u32(self.total_size);
        packet.add_u32(self.offset);
        packet.add_bytes(&self.data);
    }

    fn read(stream: &mut Stream<'_>) -> Option<Self> {
        let path = stream.read_string();
        let total_size = stream.read_u32();
        let offset = stream.read_u32();
        let data = stream.rest().to_vec();
        complete(
            stream,
            Self {
                path,
                total_size,
                offset,
                data,
            },
        )
    }
}

/// `TO_HOST_DIR` / `TO_REMOTE_DIR`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirCreate {
    pub path: String,
}

impl Message for DirCreate {
    fn write(&self, packet: &mut LocalPacket) {
        packet.add_string(&self.path);
    }

    fn read(stream: &mut Stream<'_>) -> Option<Self> {
        let path = stream.read_string();
        complete(stream, Self { path })
    }
}

/// `TO_REMOTE_FILE_COUNT`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileCount {
    pub count: u32,
}

impl Message for FileCount {
    fn write(&self, packet: &mut LocalPacket) {
        packet.add_u32(self.count);
    }

    fn read(stream: &mut Stream<'_>) -> Option<Self> {
        let count = stream.read_u32();
        complete(stream, Self { count })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::latch::{Buttons, SHORT_LATCH};
    use glam::Vec2;

    fn body(packet: &LocalPacket) -> Stream<'_> {
        let mut stream = Stream::from_packet(packet);
        stream.read_u16();
        stream
    }

    #[test]
    fn test_latch_update_recovers_entries() {
        let update = LatchUpdate {
            stamp: 4242,
            entries: vec![
                LatchEntry {
                    entity: 3,
                    latch: Latch::new(Vec2::new(0.5, -0.25), Buttons::LEFT | Buttons::JUMP),
                },
                LatchEntry {
                    entity: 511,
                    latch: Latch::new(Vec2::new(-0.999, 0.0004), Buttons::empty()),
                },
            ],
        };
        let packet = update.to_packet(PacketKind::ToRemoteLatch);
        assert_eq!(packet.len(), 2 + 4 + 2 * LATCH_ENTRY_SIZE);

        let decoded = LatchUpdate::read(&mut body(&packet)).unwrap();
        assert_eq!(decoded.stamp, 4242);
        assert_eq!(decoded.entries.len(), 2);
        for (got, want) in decoded.entries.iter().zip(&update.entries) {
            assert_eq!(got.entity, want.entity);
            assert_eq!(got.latch.buttons, want.latch.buttons);
            assert!((got.latch.motion - want.latch.motion).abs().max_element() <= 1.0 / SHORT_LATCH);
        }
    }

    #[test]
    fn test_empty_latch_update() {
        let packet = LatchUpdate {
            stamp: 9,
            entries: Vec::new(),
        }
        .to_packet(PacketKind::ToHostLatch);
        let decoded = LatchUpdate::read(&mut body(&packet)).unwrap();
        assert_eq!(decoded.stamp, 9);
        assert!(decoded.entries.is_empty());
    }

    #[test]
    fn test_module_info_layout() {
        let descriptor = ModuleDescriptor {
            host: "ignored".into(),
            rank: "A".into(),
            long_name: "Adventurer".into(),
            load_name: "adventurer.mod".into(),
            import_amount: 1,
            allow_export: true,
            min_players: 1,
            max_players: 4,
            monsters_only: false,
            rts_control: false,
            respawn_mode: RespawnMode::Anytime,
        };
        let packet = descriptor.to_packet(PacketKind::ToRemoteModuleInfo);
        let decoded = ModuleDescriptor::read(&mut body(&packet)).unwrap();

        assert_eq!(decoded.host, "");
        assert_eq!(
            decoded,
            ModuleDescriptor {
                host: String::new(),
                ..descriptor
            }
        );
    }

    #[test]
    fn test_truncated_reply_rejected() {
        let data = [0x76, 0x3A, 0x01];
        let mut stream = Stream::new(&data);
        stream.read_u16();
        assert_eq!(LogonReply::read(&mut stream), None);
    }

    #[test]
    fn test_refused_logon_reply() {
        let packet = LogonReply::refused().to_packet(PacketKind::ToRemoteLogon);
        assert_eq!(packet.as_bytes(), &[0x76, 0x3A, 0x00, 0xFF]);
    }
}
