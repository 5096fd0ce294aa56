use std::fmt;

pub const MAX_SEND_SIZE: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Channel {
    BestEffort = 0,
    Guaranteed = 1,
}

impl Channel {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::BestEffort),
            1 => Some(Self::Guaranteed),
            _ => None,
        }
    }
}

macro_rules! packet_kinds {
    ($($variant:ident = $tag:literal => $name:literal,)*) => {
        /// Every packet starts with one of these 16-bit tags.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u16)]
        pub enum PacketKind {
            $($variant = $tag,)*
        }

        impl PacketKind {
            pub fn from_u16(tag: u16) -> Option<Self> {
                match tag {
                    $($tag => Some(Self::$variant),)*
                    _ => None,
                }
            }

            pub fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)*
                }
            }
        }
    };
}

packet_kinds! {
    ToAnyText = 0x1D66 => "TO_ANY_TEXT",

    ToHostLogon = 0xF8E1 => "TO_HOST_LOGON",
    ToHostLogoff = 0x3E46 => "TO_HOST_LOGOFF",
    ToHostRequestModule = 0x5DB6 => "TO_HOST_REQUEST_MODULE",
    ToHostModule = 0xEFD0 => "TO_HOST_MODULE",
    ToHostModuleOk = 0xA31A => "TO_HOST_MODULEOK",
    ToHostModuleBad = 0xB473 => "TO_HOST_MODULEBAD",
    ToHostLatch = 0xF296 => "TO_HOST_LATCH",
    ToHostRts = 0x0A47 => "TO_HOST_RTS",
    ToHostImLoaded = 0xDD2C => "TO_HOST_IM_LOADED",
    ToHostFile = 0xBC6B => "TO_HOST_FILE",
    ToHostDir = 0xDB29 => "TO_HOST_DIR",
    ToHostFileSent = 0x6437 => "TO_HOST_FILESENT",

    ToRemoteLogon = 0x763A => "TO_REMOTE_LOGON",
    ToRemoteLogoff = 0x989B => "TO_REMOTE_LOGOFF",
    ToRemoteKick = 0xA64F => "TO_REMOTE_KICK",
    ToRemoteModule = 0xF068 => "TO_REMOTE_MODULE",
    ToRemoteModuleBad = 0x2FE9 => "TO_REMOTE_MODULEBAD",
    ToRemoteModuleInfo = 0x00E8 => "TO_REMOTE_MODULEINFO",
    ToRemoteLatch = 0x9526 => "TO_REMOTE_LATCH",
    ToRemoteFile = 0xA04E => "TO_REMOTE_FILE",
    ToRemoteDir = 0x13E2 => "TO_REMOTE_DIR",
    ToRemoteRts = 0x4817 => "TO_REMOTE_RTS",
    ToRemoteStart = 0x27AF => "TO_REMOTE_START",
    ToRemoteFileCount = 0x81B9 => "TO_REMOTE_FILE_COUNT",
    ToRemoteChrSpawn = 0x9840 => "TO_REMOTE_CHR_SPAWN",

    NetCheckCrc = 0x88CF => "NET_CHECK_CRC",
    NetAcknowledgeCrc = 0x6240 => "NET_ACKNOWLEDGE_CRC",
    NetSendCrc = 0xA0E1 => "NET_SEND_CRC",
    NetTransferFile = 0x16B5 => "NET_TRANSFER_FILE",
    NetRequestFile = 0x9ABF => "NET_REQUEST_FILE",
    NetTransferAck = 0x2B22 => "NET_TRANSFER_ACK",
    NetCreateDirectory = 0xCFC9 => "NET_CREATE_DIRECTORY",
    NetDoneSendingFiles = 0xCB08 => "NET_DONE_SENDING_FILES",
    NetNumFilesToSend = 0x9E40 => "NET_NUM_FILES_TO_SEND",
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Name for a raw tag, `"UNKNOWN"` if it is not part of the vocabulary.
pub fn kind_name(tag: u16) -> &'static str {
    PacketKind::from_u16(tag).map_or("UNKNOWN", PacketKind::name)
}

/// Outbound packet under construction. Fields are written big-endian into a
/// fixed buffer; a write that does not fit is dropped and marks the packet
/// as overflowed so the send can be refused.
#[derive(Clone)]
pub struct LocalPacket {
    buffer: Box<[u8; MAX_SEND_SIZE]>,
    size: usize,
    overflowed: bool,
}

impl LocalPacket {
    pub fn new(kind: PacketKind) -> Self {
        let mut packet = Self {
            buffer: Box::new([0u8; MAX_SEND_SIZE]),
            size: 0,
            overflowed: false,
        };
        packet.add_u16(kind as u16);
        packet
    }

    pub fn kind(&self) -> Option<PacketKind> {
        PacketKind::from_u16(u16::from_be_bytes([self.buffer[0], self.buffer[1]]))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buffer[..self.size]
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    pub fn remaining(&self) -> usize {
        MAX_SEND_SIZE - self.size
    }

    pub fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub fn add_bytes(&mut self, bytes: &[u8]) {
        if bytes.len() > self.remaining() {
            self.overflowed = true;
            return;
        }
        self.buffer[self.size..self.size + bytes.len()].copy_from_slice(bytes);
        self.size += bytes.len();
    }

    pub fn add_u8(&mut self, value: u8) {
        self.add_bytes(&[value]);
    }

    pub fn add_i8(&mut self, value: i8) {
        self.add_bytes(&value.to_be_bytes());
    }

    pub fn add_bool(&mut self, value: bool) {
        self.add_u8(value as u8);
    }

    pub fn add_u16(&mut self, value: u16) {
        self.add_bytes(&value.to_be_bytes());
    }

    pub fn add_i16(&mut self, value: i16) {
        self.add_bytes(&value.to_be_bytes());
    }

    pub fn add_u32(&mut self, value: u32) {
        self.add_bytes(&value.to_be_bytes());
    }

    /// `u16` length prefix then the UTF-8 bytes. Strings longer than
    /// `u16::MAX` bytes mark the packet overflowed.
    pub fn add_string(&mut self, value: &str) {
        let Ok(len) = u16::try_from(value.len()) else {
            self.overflowed = true;
            return;
        };
        if value.len() + 2 > self.remaining() {
            self.overflowed = true;
            return;
        }
        self.add_u16(len);
        self.add_bytes(value.as_bytes());
    }
}

impl fmt::Debug for LocalPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalPacket")
            .field("kind", &self.kind())
            .field("size", &self.size)
            .field("overflowed", &self.overflowed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_lookup() {
        assert_eq!(PacketKind::from_u16(0xF8E1), Some(PacketKind::ToHostLogon));
        assert_eq!(PacketKind::from_u16(0x00E8), Some(PacketKind::ToRemoteModuleInfo));
        assert_eq!(PacketKind::from_u16(0x1234), None);
        assert_eq!(kind_name(0x9526), "TO_REMOTE_LATCH");
        assert_eq!(kind_name(0x1234), "UNKNOWN");
    }

    #[test]
    fn test_header_written_first() {
        let packet = LocalPacket::new(PacketKind::ToRemoteStart);
        assert_eq!(packet.as_bytes(), &[0x27, 0xAF]);
        assert_eq!(packet.kind(), Some(PacketKind::ToRemoteStart));
    }

    #[test]
    fn test_overflow_is_flagged() {
        let mut packet = LocalPacket::new(PacketKind::ToHostFile);
        packet.add_bytes(&[0u8; MAX_SEND_SIZE - 4]);
        assert!(!packet.overflowed());
        assert_eq!(packet.remaining(), 2);

        packet.add_u32(7);
        assert!(packet.overflowed());
        assert_eq!(packet.len(), MAX_SEND_SIZE - 2);
    }

    #[test]
    fn test_string_is_length_prefixed() {
        let mut packet = LocalPacket::new(PacketKind::ToHostDir);
        packet.add_string("ab");
        assert_eq!(&packet.as_bytes()[2..], &[0x00, 0x02, b'a', b'b']);
    }
}
