use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use super::packet::{kind_name, PacketKind};
use super::transport::PeerId;
use crate::error::{NetError, WaitOutcome};

/// Handle to a claimed request slot. The generation makes a ticket go
/// stale once its slot has been released, so late calls are harmless.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestTicket {
    slot: usize,
    generation: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    Pending,
    Received(usize),
    Expired,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    Idle,
    Waiting,
    Received,
}

#[derive(Debug)]
struct RequestSlot {
    generation: u32,
    state: SlotState,
    peer: PeerId,
    kind: PacketKind,
    start: Instant,
    expiry: Instant,
    buffer: Box<[u8]>,
    len: usize,
}

impl RequestSlot {
    fn new(buffer_size: usize) -> Self {
        let now = Instant::now();
        Self {
            generation: 0,
            state: SlotState::Idle,
            peer: PeerId(0),
            kind: PacketKind::ToAnyText,
            start: now,
            expiry: now,
            buffer: vec![0u8; buffer_size].into_boxed_slice(),
            len: 0,
        }
    }

    fn status(&self, now: Instant) -> RequestStatus {
        match self.state {
            SlotState::Received => RequestStatus::Received(self.len),
            SlotState::Waiting if now >= self.expiry => RequestStatus::Expired,
            _ => RequestStatus::Pending,
        }
    }
}

/// Fixed pool of "waiting for packet kind K from peer P" slots, filled by
/// the dispatch thread and polled or waited on by callers.
#[derive(Debug)]
pub struct RequestPool {
    slots: Mutex<Vec<RequestSlot>>,
    arrived: Condvar,
    poll_interval: Duration,
}

impl RequestPool {
    pub fn new(count: usize, buffer_size: usize, poll_interval: Duration) -> Self {
        Self {
            slots: Mutex::new((0..count).map(|_| RequestSlot::new(buffer_size)).collect()),
            arrived: Condvar::new(),
            poll_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<RequestSlot>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn prepare_wait(
        &self,
        peer: PeerId,
        timeout: Duration,
        kind: PacketKind,
    ) -> Result<RequestTicket, NetError> {
        let mut slots = self.lock();

        if slots
            .iter()
            .any(|s| s.state != SlotState::Idle && s.peer == peer && s.kind == kind)
        {
            return Err(NetError::DuplicateRequest { peer, kind });
        }

        let count = slots.len();
        let Some((index, slot)) = slots
            .iter_mut()
            .enumerate()
            .find(|(_, s)| s.state == SlotState::Idle)
        else {
            log::warn!("Request pool exhausted waiting for {} from {}", kind, peer);
            return Err(NetError::RequestPoolExhausted(count));
        };

        let now = Instant::now();
        slot.state = SlotState::Waiting;
        slot.peer = peer;
        slot.kind = kind;
        slot.start = now;
        slot.expiry = now + timeout;
        slot.len = 0;

        Ok(RequestTicket {
            slot: index,
            generation: slot.generation,
        })
    }

    /// Hands an arrived packet to a waiting slot. Returns false when
    /// nobody is waiting for it, in which case it should be routed on.
    pub fn offer(&self, peer: PeerId, tag: u16, payload: &[u8]) -> bool {
        let mut slots = self.lock();
        let now = Instant::now();

        let Some(slot) = slots.iter_mut().find(|s| {
            s.state == SlotState::Waiting && s.peer == peer && s.kind as u16 == tag && now < s.expiry
        }) else {
            return false;
        };

        let len = payload.len().min(slot.buffer.len());
        if len < payload.len() {
            log::warn!(
                "{} from {} truncated to {} of {} bytes",
                kind_name(tag),
                peer,
                len,
                payload.len()
            );
        }
        slot.buffer[..len].copy_from_slice(&payload[..len]);
        slot.len = len;
        slot.state = SlotState::Received;
        log::trace!(
            "{} from {} satisfied a request after {:?}",
            kind_name(tag),
            peer,
            slot.start.elapsed()
        );
        drop(slots);

        self.arrived.notify_all();
        true
    }

    pub fn test(&self, ticket: RequestTicket) -> bool {
        matches!(self.poll(ticket), RequestStatus::Received(_))
    }

    pub fn poll(&self, ticket: RequestTicket) -> RequestStatus {
        let slots = self.lock();
        match slots.get(ticket.slot) {
            Some(slot) if slot.generation == ticket.generation => slot.status(Instant::now()),
            _ => RequestStatus::Expired,
        }
    }

    /// Copies a received payload out. `None` until the reply has arrived.
    pub fn take_into(&self, ticket: RequestTicket, out: &mut [u8]) -> Option<usize> {
        let slots = self.lock();
        let slot = slots
            .get(ticket.slot)
            .filter(|s| s.generation == ticket.generation && s.state == SlotState::Received)?;
        let len = slot.len.min(out.len());
        out[..len].copy_from_slice(&slot.buffer[..len]);
        Some(len)
    }

    pub fn payload(&self, ticket: RequestTicket) -> Option<Vec<u8>> {
        let slots = self.lock();
        let slot = slots
            .get(ticket.slot)
            .filter(|s| s.generation == ticket.generation && s.state == SlotState::Received)?;
        Some(slot.buffer[..slot.len].to_vec())
    }

    /// Returns the slot to the pool. Stale tickets are ignored.
    pub fn release(&self, ticket: RequestTicket) {
        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(ticket.slot) {
            if slot.generation == ticket.generation {
                slot.state = SlotState::Idle;
                slot.len = 0;
                slot.generation = slot.generation.wrapping_add(1);
            }
        }
    }

    /// Blocks until the reply arrives or the request expires.
    pub fn wait(&self, ticket: RequestTicket) -> RequestStatus {
        let mut slots = self.lock();
        loop {
            let now = Instant::now();
            let slot = match slots.get(ticket.slot) {
                Some(slot) if slot.generation == ticket.generation => slot,
                _ => return RequestStatus::Expired,
            };
            match slot.status(now) {
                RequestStatus::Pending => {}
                status => return status,
            }

            let remaining = slot.expiry.saturating_duration_since(now);
            slots = self
                .arrived
                .wait_timeout(slots, remaining.min(self.poll_interval))
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Registers a wait, blocks on it and releases it again.
    pub fn wait_for_packet(
        &self,
        peer: PeerId,
        timeout: Duration,
        kind: PacketKind,
        out: &mut [u8],
    ) -> Result<WaitOutcome, NetError> {
        let ticket = self.prepare_wait(peer, timeout, kind)?;
        Ok(self.finish_wait(ticket, out))
    }

    /// Waits on an already registered ticket and always releases it.
    pub fn finish_wait(&self, ticket: RequestTicket, out: &mut [u8]) -> WaitOutcome {
        let outcome = match self.wait(ticket) {
            RequestStatus::Received(_) => self
                .take_into(ticket, out)
                .map_or(WaitOutcome::Timeout, WaitOutcome::Received),
            _ => WaitOutcome::Timeout,
        };
        self.release(ticket);
        outcome
    }

    pub fn in_use(&self) -> usize {
        self.lock()
            .iter()
            .filter(|s| s.state != SlotState::Idle)
            .count()
    }

    pub fn capacity(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn pool(count: usize) -> RequestPool {
        RequestPool::new(count, 16, Duration::from_millis(5))
    }

    #[test]
    fn test_duplicate_request_rejected() {
        let pool = pool(4);
        let peer = PeerId(1);
        let ticket = pool
            .prepare_wait(peer, Duration::from_secs(1), PacketKind::ToRemoteLogon)
            .unwrap();

        let err = pool
            .prepare_wait(peer, Duration::from_secs(1), PacketKind::ToRemoteLogon)
            .unwrap_err();
        assert!(matches!(err, NetError::DuplicateRequest { .. }));

        // Other kinds and other peers are fine.
        pool.prepare_wait(peer, Duration::from_secs(1), PacketKind::ToRemoteModuleInfo)
            .unwrap();
        pool.prepare_wait(PeerId(2), Duration::from_secs(1), PacketKind::ToRemoteLogon)
            .unwrap();

        pool.release(ticket);
        pool.prepare_wait(peer, Duration::from_secs(1), PacketKind::ToRemoteLogon)
            .unwrap();
    }

    #[test]
    fn test_pool_exhausted() {
        let pool = pool(2);
        pool.prepare_wait(PeerId(1), Duration::from_secs(1), PacketKind::ToRemoteLogon)
            .unwrap();
        pool.prepare_wait(PeerId(2), Duration::from_secs(1), PacketKind::ToRemoteLogon)
            .unwrap();
        let err = pool
            .prepare_wait(PeerId(3), Duration::from_secs(1), PacketKind::ToRemoteLogon)
            .unwrap_err();
        assert!(matches!(err, NetError::RequestPoolExhausted(2)));
    }

    #[test]
    fn test_offer_matches_peer_and_kind() {
        let pool = pool(4);
        let ticket = pool
            .prepare_wait(PeerId(1), Duration::from_secs(1), PacketKind::ToRemoteLogon)
            .unwrap();

        assert!(!pool.offer(PeerId(2), PacketKind::ToRemoteLogon as u16, &[1]));
        assert!(!pool.offer(PeerId(1), PacketKind::ToRemoteKick as u16, &[1]));
        assert!(!pool.test(ticket));

        assert!(pool.offer(PeerId(1), PacketKind::ToRemoteLogon as u16, &[0x76, 0x3A, 1, 3]));
        assert!(pool.test(ticket));
        assert_eq!(pool.payload(ticket), Some(vec![0x76, 0x3A, 1, 3]));

        // Already satisfied, the next copy goes to the handler.
        assert!(!pool.offer(PeerId(1), PacketKind::ToRemoteLogon as u16, &[1]));
    }

    #[test]
    fn test_oversized_payload_truncated() {
        let pool = pool(1);
        let ticket = pool
            .prepare_wait(PeerId(1), Duration::from_secs(1), PacketKind::ToRemoteFile)
            .unwrap();
        assert!(pool.offer(PeerId(1), PacketKind::ToRemoteFile as u16, &[7u8; 40]));
        assert_eq!(pool.poll(ticket), RequestStatus::Received(16));
    }

    #[test]
    fn test_default_slots_hold_long_module_info() {
        use crate::config::HostConfig;
        use crate::net::Stream;
        use crate::protocol::Message;
        use crate::session::ModuleDescriptor;

        let config = HostConfig::default();
        let pool = RequestPool::new(1, config.request_buffer_size, Duration::from_millis(5));
        let mut descriptor = ModuleDescriptor::new(&"m".repeat(1500), &"Long".repeat(400));
        descriptor.rank = "r".repeat(900);
        let packet = descriptor.to_packet(PacketKind::ToRemoteModuleInfo);
        assert!(!packet.overflowed());
        assert!(packet.len() > 1024);

        let ticket = pool
            .prepare_wait(PeerId(1), Duration::from_secs(1), PacketKind::ToRemoteModuleInfo)
            .unwrap();
        assert!(pool.offer(PeerId(1), PacketKind::ToRemoteModuleInfo as u16, packet.as_bytes()));
        assert_eq!(pool.poll(ticket), RequestStatus::Received(packet.len()));

        let payload = pool.payload(ticket).unwrap();
        let mut stream = Stream::new(&payload);
        stream.read_u16();
        assert_eq!(ModuleDescriptor::read(&mut stream), Some(descriptor));
    }

    #[test]
    fn test_stale_ticket_release_is_noop() {
        let pool = pool(1);
        let old = pool
            .prepare_wait(PeerId(1), Duration::from_secs(1), PacketKind::ToRemoteLogon)
            .unwrap();
        pool.release(old);

        let new = pool
            .prepare_wait(PeerId(2), Duration::from_secs(1), PacketKind::ToRemoteLogon)
            .unwrap();
        pool.release(old);
        assert_eq!(pool.in_use(), 1);
        assert_eq!(pool.poll(old), RequestStatus::Expired);
        assert_eq!(pool.poll(new), RequestStatus::Pending);
    }

    #[test]
    fn test_wait_times_out_within_bounds() {
        let pool = pool(1);
        let timeout = Duration::from_millis(50);
        let mut out = [0u8; 16];

        let start = Instant::now();
        let outcome = pool
            .wait_for_packet(PeerId(1), timeout, PacketKind::ToRemoteLogon, &mut out)
            .unwrap();
        let elapsed = start.elapsed();

        assert_eq!(outcome, WaitOutcome::Timeout);
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(250));
        assert_eq!(pool.in_use(), 0);
    }

    #[test]
    fn test_wait_wakes_on_offer() {
        let pool = Arc::new(pool(1));
        let ticket = pool
            .prepare_wait(PeerId(1), Duration::from_secs(5), PacketKind::ToRemoteLogon)
            .unwrap();

        let offering = Arc::clone(&pool);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            offering.offer(PeerId(1), PacketKind::ToRemoteLogon as u16, &[9, 9, 1])
        });

        let mut out = [0u8; 16];
        let start = Instant::now();
        let outcome = pool.finish_wait(ticket, &mut out);
        assert!(handle.join().unwrap());
        assert_eq!(outcome, WaitOutcome::Received(3));
        assert_eq!(&out[..3], &[9, 9, 1]);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(pool.in_use(), 0);
    }
}
