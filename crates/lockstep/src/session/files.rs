use crate::net::{LocalPacket, PacketKind, PeerId, MAX_SEND_SIZE};
use crate::protocol::{FileChunk, Message};

/// Receives the file-transfer traffic of a session. Writing anything to
/// disk is up to the implementation.
pub trait FileTransferSink: Send + Sync {
    fn file_chunk(&self, from: PeerId, chunk: &FileChunk);

    fn create_dir(&self, from: PeerId, path: &str);

    fn file_count(&self, _from: PeerId, _count: u32) {}

    fn transfer_done(&self, _from: PeerId) {}
}

/// Logs and drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct DiscardFiles;

impl FileTransferSink for DiscardFiles {
    fn file_chunk(&self, from: PeerId, chunk: &FileChunk) {
        log::debug!(
            "Discarding {} bytes of {} at {} from {}",
            chunk.data.len(),
            chunk.path,
            chunk.offset,
            from
        );
    }

    fn create_dir(&self, from: PeerId, path: &str) {
        log::debug!("Ignoring directory {} from {}", path, from);
    }
}

/// Splits `data` into file packets of `kind` that each fit one send.
pub fn file_packets(kind: PacketKind, path: &str, data: &[u8]) -> Vec<LocalPacket> {
    // tag, path, total size, offset
    let overhead = 2 + 2 + path.len() + 4 + 4;
    let chunk_size = MAX_SEND_SIZE.saturating_sub(overhead).max(1);
    let total_size = data.len() as u32;

    if data.is_empty() {
        let chunk = FileChunk {
            path: path.to_owned(),
            total_size,
            offset: 0,
            data: Vec::new(),
        };
        return vec![chunk.to_packet(kind)];
    }

    data.chunks(chunk_size)
        .enumerate()
        .map(|(i, bytes)| {
            FileChunk {
                path: path.to_owned(),
                total_size,
                offset: (i * chunk_size) as u32,
                data: bytes.to_vec(),
            }
            .to_packet(kind)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::Stream;

    #[test]
    fn test_large_file_is_chunked() {
        let data: Vec<u8> = (0..20_000u32).map(|i| i as u8).collect();
        let packets = file_packets(PacketKind::ToRemoteFile, "maps/level.dat", &data);
        assert_eq!(packets.len(), 3);

        let mut rebuilt = Vec::new();
        for packet in &packets {
            assert!(!packet.overflowed());
            let mut stream = Stream::from_packet(packet);
            assert_eq!(stream.read_u16(), PacketKind::ToRemoteFile as u16);
            let chunk = FileChunk::read(&mut stream).unwrap();
            assert_eq!(chunk.total_size, 20_000);
            assert_eq!(chunk.offset as usize, rebuilt.len());
            rebuilt.extend_from_slice(&chunk.data);
        }
        assert_eq!(rebuilt, data);
    }

    #[test]
    fn test_empty_file_still_sends_one_packet() {
        let packets = file_packets(PacketKind::ToHostFile, "empty.txt", &[]);
        assert_eq!(packets.len(), 1);
    }
}
