use super::packet::LocalPacket;

/// Big-endian read cursor over a borrowed byte buffer.
///
/// The cursor never owns its bytes. Point it at an owned `Vec<u8>`, at
/// the contents of a file read with `std::fs::read`, or at an arrived
/// payload (the host hands sinks one in [`IncomingPacket`]).
///
/// Reads past the end never panic: they return zero (or an empty string),
/// leave the cursor at the end and set [`Stream::overrun`].
///
/// [`IncomingPacket`]: super::IncomingPacket
#[derive(Debug, Clone)]
pub struct Stream<'a> {
    data: &'a [u8],
    pos: usize,
    overrun: bool,
}

impl<'a> Stream<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self {
            data,
            pos: 0,
            overrun: false,
        }
    }

    pub fn from_packet(packet: &'a LocalPacket) -> Self {
        Self::new(packet.as_bytes())
    }

    pub fn remaining_size(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn is_empty(&self) -> bool {
        self.remaining_size() == 0
    }

    pub fn overrun(&self) -> bool {
        self.overrun
    }

    fn take<const N: usize>(&mut self) -> [u8; N] {
        let mut out = [0u8; N];
        match self.data.get(self.pos..self.pos + N) {
            Some(bytes) => {
                out.copy_from_slice(bytes);
                self.pos += N;
            }
            None => {
                self.pos = self.data.len();
                self.overrun = true;
            }
        }
        out
    }

    pub fn read_u8(&mut self) -> u8 {
        u8::from_be_bytes(self.take())
    }

    pub fn read_i8(&mut self) -> i8 {
        i8::from_be_bytes(self.take())
    }

    pub fn read_u16(&mut self) -> u16 {
        u16::from_be_bytes(self.take())
    }

    pub fn peek_u16(&self) -> Option<u16> {
        let bytes = self.data.get(self.pos..self.pos + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    pub fn read_i16(&mut self) -> i16 {
        i16::from_be_bytes(self.take())
    }

    pub fn read_u32(&mut self) -> u32 {
        u32::from_be_bytes(self.take())
    }

    pub fn read_bool(&mut self) -> bool {
        self.read_u8() != 0
    }

    /// Reads a `u16` length prefix followed by that many bytes of UTF-8.
    /// A truncated string yields whatever bytes are present.
    pub fn read_string(&mut self) -> String {
        let len = self.read_u16() as usize;
        String::from_utf8_lossy(self.read_bytes(len)).into_owned()
    }

    pub fn read_bytes(&mut self, len: usize) -> &'a [u8] {
        let end = self.pos.saturating_add(len);
        if end > self.data.len() {
            self.overrun = true;
        }
        let end = end.min(self.data.len());
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        bytes
    }

    /// Everything left in the buffer; consumes it.
    pub fn rest(&mut self) -> &'a [u8] {
        let bytes = &self.data[self.pos..];
        self.pos = self.data.len();
        bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::PacketKind;

    #[test]
    fn test_reads_big_endian() {
        let data = [0x12, 0x34, 0xFF, 0xFE, 0x00, 0x00, 0x01, 0x00];
        let mut stream = Stream::new(&data);

        assert_eq!(stream.read_u16(), 0x1234);
        assert_eq!(stream.read_i16(), -2);
        assert_eq!(stream.read_u32(), 256);
        assert_eq!(stream.remaining_size(), 0);
        assert!(!stream.overrun());
    }

    #[test]
    fn test_reads_file_contents() {
        let path = std::env::temp_dir().join(format!("lockstep-stream-{}.bin", std::process::id()));
        std::fs::write(&path, [0x00, 0x03, b'a', b'b', b'c', 0x07]).unwrap();
        let contents = std::fs::read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        let mut stream = Stream::new(&contents);
        assert_eq!(stream.read_string(), "abc");
        assert_eq!(stream.read_u8(), 7);
        assert!(stream.is_empty());
        assert!(!stream.overrun());
    }

    #[test]
    fn test_overrun_clamps_to_zero() {
        let data = [0xAB];
        let mut stream = Stream::new(&data);

        assert_eq!(stream.read_u32(), 0);
        assert!(stream.overrun());
        assert_eq!(stream.remaining_size(), 0);
        assert_eq!(stream.read_u8(), 0);
        assert_eq!(stream.read_string(), "");
    }

    #[test]
    fn test_truncated_string() {
        let data = [0x00, 0x05, b'a', b'b'];
        let mut stream = Stream::new(&data);

        assert_eq!(stream.read_string(), "ab");
        assert!(stream.overrun());
    }

    #[test]
    fn test_reads_what_packet_wrote() {
        let mut packet = LocalPacket::new(PacketKind::ToHostLogon);
        packet.add_string("alice");
        packet.add_i8(-3);
        packet.add_u32(0xDEAD_BEEF);

        let mut stream = Stream::from_packet(&packet);
        assert_eq!(stream.peek_u16(), Some(PacketKind::ToHostLogon as u16));
        assert_eq!(stream.read_u16(), PacketKind::ToHostLogon as u16);
        assert_eq!(stream.read_string(), "alice");
        assert_eq!(stream.read_i8(), -3);
        assert_eq!(stream.read_u32(), 0xDEAD_BEEF);
        assert!(stream.is_empty());
    }
}
