//! Time-indexed input buffering for the lockstep simulation.
//!
//! Every simulated entity owns a ring of [`MAX_LAG`] [`TimeLatch`] slots.
//! A latch for tick `t` lives in slot `t % MAX_LAG` and is only trusted
//! while its stored stamp equals `t`, so data left over from a previous
//! lap of the ring is never applied.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bitflags::bitflags;
use glam::Vec2;

pub const MAX_LAG: usize = 64;
/// Ticks to simulate before latches are exchanged.
pub const START_TALK: u32 = (MAX_LAG >> 3) as u32;
/// Fixed-point scale for motion on the wire.
pub const SHORT_LATCH: f32 = 1024.0;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Buttons: u8 {
        const LEFT = 1 << 0;
        const RIGHT = 1 << 1;
        const JUMP = 1 << 2;
        const ALT_LEFT = 1 << 3;
        const ALT_RIGHT = 1 << 4;
        const PACK_LEFT = 1 << 5;
        const PACK_RIGHT = 1 << 6;
        const RESPAWN = 1 << 7;
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct LatchAnomaly: u8 {
        /// Stamp is older than the one expected next.
        const OUT_OF_ORDER = 1 << 0;
        /// Stamp names a tick that has already been simulated.
        const LATE = 1 << 1;
        /// Stamp skipped past the expected one.
        const MISSED = 1 << 2;
    }
}

/// One entity's input for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Latch {
    pub motion: Vec2,
    pub buttons: Buttons,
}

impl Latch {
    pub fn new(motion: Vec2, buttons: Buttons) -> Self {
        Self { motion, buttons }
    }

    pub fn encode_motion(&self) -> [i16; 2] {
        [quantize(self.motion.x), quantize(self.motion.y)]
    }

    pub fn from_wire(buttons: u8, dx: i16, dy: i16) -> Self {
        Self {
            motion: Vec2::new(dx as f32 / SHORT_LATCH, dy as f32 / SHORT_LATCH),
            buttons: Buttons::from_bits_retain(buttons),
        }
    }

    /// The value a remote side will see after a trip over the wire.
    pub fn quantized(&self) -> Self {
        let [dx, dy] = self.encode_motion();
        Self::from_wire(self.buttons.bits(), dx, dy)
    }
}

fn quantize(value: f32) -> i16 {
    (value * SHORT_LATCH)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct TimeLatch {
    pub valid: bool,
    pub stamp: u32,
    pub latch: Latch,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatchEntry {
    pub entity: u16,
    pub latch: Latch,
}

#[derive(Debug, Clone)]
pub struct TimeLatchBuffer {
    entities: Vec<[TimeLatch; MAX_LAG]>,
    applied: Vec<Latch>,
    next_stamp: Option<u32>,
    received: u32,
}

impl TimeLatchBuffer {
    pub fn new(entity_count: usize) -> Self {
        Self {
            entities: vec![[TimeLatch::default(); MAX_LAG]; entity_count],
            applied: vec![Latch::default(); entity_count],
            next_stamp: None,
            received: 0,
        }
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn next_stamp(&self) -> Option<u32> {
        self.next_stamp
    }

    pub fn received_count(&self) -> u32 {
        self.received
    }

    fn slot(stamp: u32) -> usize {
        stamp as usize % MAX_LAG
    }

    /// Buffers a locally sampled latch for the tick after `tick`.
    pub fn buffer_local(&mut self, entity: usize, tick: u32, latch: Latch) {
        self.store(entity, tick.wrapping_add(1), latch);
    }

    pub fn store(&mut self, entity: usize, stamp: u32, latch: Latch) {
        if let Some(ring) = self.entities.get_mut(entity) {
            ring[Self::slot(stamp)] = TimeLatch {
                valid: true,
                stamp,
                latch,
            };
        }
    }

    /// Applies a latch packet stamped `stamp` while the simulation is at
    /// `now`. Only the stamp expected next is written; anything else is
    /// reported. A skipped-ahead stamp becomes the new expectation so the
    /// stream recovers after loss.
    pub fn receive(&mut self, now: u32, stamp: u32, entries: &[LatchEntry]) -> LatchAnomaly {
        let mut anomaly = LatchAnomaly::empty();
        let mut expected = *self.next_stamp.get_or_insert(stamp);

        if stamp < expected {
            anomaly |= LatchAnomaly::OUT_OF_ORDER;
        }
        if stamp <= now {
            anomaly |= LatchAnomaly::LATE;
        }
        if stamp > expected {
            anomaly |= LatchAnomaly::MISSED;
            expected = stamp;
            self.next_stamp = Some(stamp);
        }

        if stamp == expected {
            let slot = Self::slot(stamp);
            // Entities the packet leaves out get no new latch for this tick.
            for ring in &mut self.entities {
                ring[slot].valid = false;
            }
            for entry in entries {
                self.store(entry.entity as usize, stamp, entry.latch);
            }
            self.next_stamp = Some(stamp.saturating_add(1));
            self.received = self.received.wrapping_add(1);
        }

        anomaly
    }

    /// Latch trusted for `tick`, if any.
    pub fn latch_at(&self, entity: usize, tick: u32) -> Option<Latch> {
        let slot = self.entities.get(entity)?[Self::slot(tick)];
        (slot.valid && slot.stamp == tick).then_some(slot.latch)
    }

    /// Hands every entity's latch for `tick` to `apply` and invalidates it.
    /// Entities without one keep their last applied latch.
    pub fn consume(&mut self, tick: u32, mut apply: impl FnMut(usize, Latch)) -> usize {
        let slot = Self::slot(tick);
        let mut consumed = 0;
        for (entity, ring) in self.entities.iter_mut().enumerate() {
            let entry = &mut ring[slot];
            if entry.valid && entry.stamp == tick {
                entry.valid = false;
                self.applied[entity] = entry.latch;
                apply(entity, entry.latch);
                consumed += 1;
            }
        }
        consumed
    }

    pub fn applied(&self, entity: usize) -> Latch {
        self.applied.get(entity).copied().unwrap_or_default()
    }

    /// Valid latches stamped `stamp` for the given entities, without
    /// consuming them.
    pub fn entries_at(&self, stamp: u32, entities: impl IntoIterator<Item = usize>) -> Vec<LatchEntry> {
        entities
            .into_iter()
            .filter_map(|entity| {
                let latch = self.latch_at(entity, stamp)?;
                Some(LatchEntry {
                    entity: u16::try_from(entity).ok()?,
                    latch,
                })
            })
            .collect()
    }

    pub fn all_entries_at(&self, stamp: u32) -> Vec<LatchEntry> {
        self.entries_at(stamp, 0..self.entities.len())
    }

    /// Like [`Self::all_entries_at`], but invalidates what it returns.
    pub fn take_entries_at(&mut self, stamp: u32) -> Vec<LatchEntry> {
        let slot = Self::slot(stamp);
        let mut taken = Vec::new();
        for (entity, ring) in self.entities.iter_mut().enumerate() {
            let entry = &mut ring[slot];
            if !entry.valid || entry.stamp != stamp {
                continue;
            }
            let Ok(entity) = u16::try_from(entity) else {
                break;
            };
            entry.valid = false;
            taken.push(LatchEntry {
                entity,
                latch: entry.latch,
            });
        }
        taken
    }

    pub fn reset(&mut self) {
        for ring in &mut self.entities {
            *ring = [TimeLatch::default(); MAX_LAG];
        }
        self.applied.fill(Latch::default());
        self.next_stamp = None;
        self.received = 0;
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncCounts {
    pub out_of_order: u64,
    pub late: u64,
    pub missed: u64,
}

/// Advisory out-of-sync indicator plus per-kind anomaly counts. The
/// indicator stays set until read with [`SyncMonitor::take_out_of_sync`].
#[derive(Debug, Default)]
pub struct SyncMonitor {
    out_of_sync: AtomicBool,
    out_of_order: AtomicU64,
    late: AtomicU64,
    missed: AtomicU64,
}

impl SyncMonitor {
    /// Returns true when this report set a previously clear indicator.
    pub fn record(&self, anomaly: LatchAnomaly, stamp: u32) -> bool {
        if anomaly.is_empty() {
            return false;
        }
        if anomaly.contains(LatchAnomaly::OUT_OF_ORDER) {
            self.out_of_order.fetch_add(1, Ordering::Relaxed);
        }
        if anomaly.contains(LatchAnomaly::LATE) {
            self.late.fetch_add(1, Ordering::Relaxed);
        }
        if anomaly.contains(LatchAnomaly::MISSED) {
            self.missed.fetch_add(1, Ordering::Relaxed);
        }

        let was_set = self.out_of_sync.swap(true, Ordering::SeqCst);
        if !was_set {
            log::warn!("Out of sync at stamp {}: {:?}", stamp, anomaly);
        }
        !was_set
    }

    pub fn is_out_of_sync(&self) -> bool {
        self.out_of_sync.load(Ordering::SeqCst)
    }

    pub fn take_out_of_sync(&self) -> bool {
        self.out_of_sync.swap(false, Ordering::SeqCst)
    }

    pub fn counts(&self) -> SyncCounts {
        SyncCounts {
            out_of_order: self.out_of_order.load(Ordering::Relaxed),
            late: self.late.load(Ordering::Relaxed),
            missed: self.missed.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(entity: u16, x: f32) -> LatchEntry {
        LatchEntry {
            entity,
            latch: Latch::new(Vec2::new(x, 0.0), Buttons::JUMP),
        }
    }

    #[test]
    fn test_in_order_stamps() {
        let mut buffer = TimeLatchBuffer::new(2);
        for stamp in 10..=12 {
            let anomaly = buffer.receive(5, stamp, &[entry(0, stamp as f32)]);
            assert!(anomaly.is_empty());
        }
        assert_eq!(buffer.next_stamp(), Some(13));
        assert_eq!(buffer.received_count(), 3);
        assert_eq!(buffer.latch_at(0, 11).unwrap().motion.x, 11.0);
    }

    #[test]
    fn test_dropped_stamp_is_missed() {
        let mut buffer = TimeLatchBuffer::new(1);
        buffer.receive(5, 10, &[entry(0, 1.0)]);
        buffer.consume(10, |_, _| {});

        let anomaly = buffer.receive(5, 12, &[entry(0, 3.0)]);
        assert_eq!(anomaly, LatchAnomaly::MISSED);
        assert_eq!(buffer.next_stamp(), Some(13));

        // Nothing for 11, so the entity keeps the latch from 10.
        assert_eq!(buffer.consume(11, |_, _| {}), 0);
        assert_eq!(buffer.applied(0).motion.x, 1.0);
        assert_eq!(buffer.latch_at(0, 12).unwrap().motion.x, 3.0);
    }

    #[test]
    fn test_old_stamp_is_discarded() {
        let mut buffer = TimeLatchBuffer::new(1);
        assert!(buffer.receive(5, 12, &[entry(0, 2.0)]).is_empty());

        let anomaly = buffer.receive(11, 10, &[entry(0, 9.0)]);
        assert!(anomaly.contains(LatchAnomaly::OUT_OF_ORDER));
        assert!(anomaly.contains(LatchAnomaly::LATE));
        assert_eq!(buffer.next_stamp(), Some(13));
        assert_eq!(buffer.latch_at(0, 10), None);
        assert_eq!(buffer.received_count(), 1);
    }

    #[test]
    fn test_late_but_expected_still_advances() {
        let mut buffer = TimeLatchBuffer::new(1);
        buffer.receive(0, 4, &[entry(0, 1.0)]);
        let anomaly = buffer.receive(5, 5, &[entry(0, 1.0)]);
        assert_eq!(anomaly, LatchAnomaly::LATE);
        assert_eq!(buffer.next_stamp(), Some(6));
    }

    #[test]
    fn test_unmentioned_entities_are_cleared() {
        let mut buffer = TimeLatchBuffer::new(2);
        buffer.store(1, 20, Latch::default());
        buffer.receive(0, 20, &[entry(0, 1.0)]);
        assert!(buffer.latch_at(0, 20).is_some());
        assert_eq!(buffer.latch_at(1, 20), None);
    }

    #[test]
    fn test_ring_never_applies_stale_lap() {
        let mut buffer = TimeLatchBuffer::new(1);
        buffer.store(0, 3, Latch::new(Vec2::ONE, Buttons::LEFT));

        let stale = 3 + MAX_LAG as u32;
        assert_eq!(buffer.latch_at(0, stale), None);
        assert_eq!(buffer.consume(stale, |_, _| panic!("stale latch applied")), 0);

        assert_eq!(buffer.consume(3, |_, l| assert_eq!(l.buttons, Buttons::LEFT)), 1);
        // Consumed once only.
        assert_eq!(buffer.consume(3, |_, _| {}), 0);
    }

    #[test]
    fn test_expectation_is_monotonic() {
        let mut buffer = TimeLatchBuffer::new(1);
        let stamps = [7u32, 8, 3, 12, 12, 9, 13, 40, 20, 41, 2];
        let mut previous = 0;
        for (now, stamp) in stamps.into_iter().enumerate() {
            buffer.receive(now as u32, stamp, &[entry(0, 0.0)]);
            let next = buffer.next_stamp().unwrap();
            assert!(next >= previous, "{} went back to {}", previous, next);
            previous = next;
        }
        assert_eq!(previous, 42);
    }

    #[test]
    fn test_buffer_local_writes_next_tick() {
        let mut buffer = TimeLatchBuffer::new(1);
        buffer.buffer_local(0, 9, Latch::new(Vec2::X, Buttons::RIGHT));
        assert_eq!(buffer.latch_at(0, 9), None);
        assert_eq!(buffer.entries_at(10, [0]).len(), 1);
    }

    #[test]
    fn test_take_entries_invalidates() {
        let mut buffer = TimeLatchBuffer::new(3);
        buffer.store(0, 30, Latch::default());
        buffer.store(2, 30, Latch::default());
        buffer.store(1, 30 + MAX_LAG as u32, Latch::default());

        let taken = buffer.take_entries_at(30);
        assert_eq!(taken.iter().map(|e| e.entity).collect::<Vec<_>>(), vec![0, 2]);
        assert!(buffer.take_entries_at(30).is_empty());
    }

    #[test]
    fn test_quantization_within_one_step() {
        let latch = Latch::new(Vec2::new(0.123_45, -0.987_65), Buttons::JUMP | Buttons::RESPAWN);
        let [dx, dy] = latch.encode_motion();
        let decoded = Latch::from_wire(latch.buttons.bits(), dx, dy);

        assert_eq!(decoded.buttons, latch.buttons);
        assert!((decoded.motion.x - latch.motion.x).abs() <= 1.0 / SHORT_LATCH);
        assert!((decoded.motion.y - latch.motion.y).abs() <= 1.0 / SHORT_LATCH);
        assert_eq!(decoded, latch.quantized());
    }

    #[test]
    fn test_monitor_latches_until_taken() {
        let monitor = SyncMonitor::default();
        assert!(!monitor.record(LatchAnomaly::empty(), 1));
        assert!(monitor.record(LatchAnomaly::MISSED, 2));
        assert!(!monitor.record(LatchAnomaly::LATE | LatchAnomaly::OUT_OF_ORDER, 3));

        assert!(monitor.take_out_of_sync());
        assert!(!monitor.take_out_of_sync());
        assert_eq!(
            monitor.counts(),
            SyncCounts {
                out_of_order: 1,
                late: 1,
                missed: 1
            }
        );
    }
}
