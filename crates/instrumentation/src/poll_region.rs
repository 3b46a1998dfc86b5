use std::sync::atomic::{fence, AtomicI64, AtomicU64, AtomicU8, Ordering};

use crate::{Address, RegionError, Timestamp};

/// Distance in bytes between consecutive slots of a region
pub const SLOT_STRIDE: u64 = 64;

/// Reads that keep colliding with the writer give up after this many tries
const MAX_READ_ATTEMPTS: usize = 8;

const FREE: u8 = 0;
const IN_USE: u8 = 1;
const QUARANTINED: u8 = 2;

/// Value of one sampled variable.
///
/// Counters only use `total`. Timers accumulate finished intervals in
/// `total`; while `active` is non-zero the timer is running since `start`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SlotValue {
    pub total: i64,
    pub start: Timestamp,
    pub active: u64,
}

impl SlotValue {
    pub fn counter(total: i64) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// Current value, including the running part of an active timer
    pub fn at(&self, now: Timestamp) -> i64 {
        if self.active > 0 {
            self.total + now.saturating_sub(self.start) as i64
        } else {
            self.total
        }
    }
}

#[derive(Debug, Default)]
struct SlotWords {
    total: AtomicI64,
    start: AtomicU64,
    active: AtomicU64,
}

impl SlotWords {
    fn load(&self) -> SlotValue {
        SlotValue {
            total: self.total.load(Ordering::Relaxed),
            start: self.start.load(Ordering::Relaxed),
            active: self.active.load(Ordering::Relaxed),
        }
    }

    fn store(&self, value: SlotValue) {
        self.total.store(value.total, Ordering::Relaxed);
        self.start.store(value.start, Ordering::Relaxed);
        self.active.store(value.active, Ordering::Relaxed);
    }
}

/// A multi-word value guarded by a sequence counter over two buffers.
///
/// `seq` is `2k` after the k-th write completed and `2k + 1` while write
/// `k + 1` is in progress. Write `k` lands in `buffers[k % 2]`, so a reader
/// can always copy the last completed buffer while the next write fills the
/// other one. The copy is torn only if the writer started yet another write
/// into the same buffer, which shows as `seq > 2k + 2` after the copy.
#[derive(Debug, Default)]
struct SeqSlot {
    seq: AtomicU64,
    buffers: [SlotWords; 2],
    state: AtomicU8,
}

impl SeqSlot {
    /// Single writer per slot
    fn write(&self, value: SlotValue) {
        let seq = self.seq.load(Ordering::Relaxed) & !1;
        let next = seq / 2 + 1;
        self.seq.store(seq + 1, Ordering::Relaxed);
        // Pairs with the reader's acquire fence: a reader that sees any
        // buffer word of this write also sees the odd sequence
        fence(Ordering::Release);
        self.buffers[(next % 2) as usize].store(value);
        self.seq.store(seq + 2, Ordering::Release);
    }

    fn read(&self) -> Option<SlotValue> {
        for _ in 0..MAX_READ_ATTEMPTS {
            let before = self.seq.load(Ordering::Acquire);
            let completed = before / 2;
            let value = self.buffers[(completed % 2) as usize].load();
            fence(Ordering::Acquire);
            let after = self.seq.load(Ordering::Relaxed);
            if after <= 2 * completed + 2 {
                return Some(value);
            }
        }
        None
    }
}

/// Shared memory region holding polled data sources.
///
/// The target writes slots, the tool reads them without involving the
/// target. Slots are handed out by [`allocate`](Self::allocate); a slot that
/// stale code in a child process may still write is quarantined and never
/// handed out again.
#[derive(Debug)]
pub struct PollRegion {
    base: Address,
    slots: Box<[SeqSlot]>,
}

impl PollRegion {
    pub fn new(base: Address, num_slots: usize) -> Self {
        let slots: Vec<SeqSlot> = (0..num_slots).map(|_| SeqSlot::default()).collect();
        Self {
            base,
            slots: slots.into_boxed_slice(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of slots currently allocated
    pub fn in_use(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state.load(Ordering::Acquire) == IN_USE)
            .count()
    }

    /// Claims the first free slot
    pub fn allocate(&self) -> Result<usize, RegionError> {
        for (index, slot) in self.slots.iter().enumerate() {
            if slot
                .state
                .compare_exchange(FREE, IN_USE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(index);
            }
        }
        Err(RegionError::Full)
    }

    /// Claims a specific slot, used when a child must mirror its parent's layout
    pub fn allocate_at(&self, index: usize) -> Result<(), RegionError> {
        let slot = self.slot(index)?;
        slot.state
            .compare_exchange(FREE, IN_USE, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| RegionError::BadSlot(index))
    }

    /// Returns an allocated slot to the free pool and clears its value
    pub fn free(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            if slot
                .state
                .compare_exchange(IN_USE, FREE, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                slot.write(SlotValue::default());
            }
        }
    }

    /// Removes a slot from circulation for good
    pub fn quarantine(&self, index: usize) {
        if let Some(slot) = self.slots.get(index) {
            slot.state.store(QUARANTINED, Ordering::Release);
        }
    }

    pub fn is_quarantined(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .map(|s| s.state.load(Ordering::Acquire) == QUARANTINED)
            .unwrap_or(false)
    }

    pub fn is_allocated(&self, index: usize) -> bool {
        self.slots
            .get(index)
            .map(|s| s.state.load(Ordering::Acquire) == IN_USE)
            .unwrap_or(false)
    }

    pub fn slot_address(&self, index: usize) -> Address {
        self.base + index as u64 * SLOT_STRIDE
    }

    /// Writer side. Does not check allocation: stale code writes wherever it points.
    pub fn write(&self, index: usize, value: SlotValue) -> Result<(), RegionError> {
        self.slot(index)?.write(value);
        Ok(())
    }

    /// Writer side read-modify-write
    pub fn update<F>(&self, index: usize, f: F) -> Result<SlotValue, RegionError>
    where
        F: FnOnce(SlotValue) -> SlotValue,
    {
        let slot = self.slot(index)?;
        let current = slot.read().ok_or(RegionError::TornRead(index))?;
        let updated = f(current);
        slot.write(updated);
        Ok(updated)
    }

    /// Reader side: a consistent copy of the slot's last completed write
    pub fn read(&self, index: usize) -> Result<SlotValue, RegionError> {
        self.slot(index)?
            .read()
            .ok_or(RegionError::TornRead(index))
    }

    fn slot(&self, index: usize) -> Result<&SeqSlot, RegionError> {
        self.slots.get(index).ok_or(RegionError::BadSlot(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_allocate_and_free() {
        let region = PollRegion::new(0x1000, 2);
        assert_eq!(region.allocate(), Ok(0));
        assert_eq!(region.allocate(), Ok(1));
        assert_eq!(region.allocate(), Err(RegionError::Full));

        region.free(0);
        assert_eq!(region.in_use(), 1);
        assert_eq!(region.allocate(), Ok(0));
    }

    #[test]
    fn test_quarantined_slot_is_never_reused() {
        let region = PollRegion::new(0x1000, 2);
        region.quarantine(0);
        assert!(region.is_quarantined(0));
        assert_eq!(region.allocate(), Ok(1));
        assert_eq!(region.allocate(), Err(RegionError::Full));
        assert_eq!(region.allocate_at(0), Err(RegionError::BadSlot(0)));
    }

    #[test]
    fn test_slot_address() {
        let region = PollRegion::new(0x1000, 4);
        assert_eq!(region.slot_address(0), 0x1000);
        assert_eq!(region.slot_address(3), 0x1000 + 3 * SLOT_STRIDE);
    }

    #[test]
    fn test_write_then_read() {
        let region = PollRegion::new(0, 1);
        let slot = region.allocate().unwrap();
        let value = SlotValue {
            total: 40,
            start: 100,
            active: 1,
        };
        region.write(slot, value).unwrap();
        assert_eq!(region.read(slot).unwrap(), value);
        assert_eq!(region.read(slot).unwrap().at(110), 50);

        let updated = region
            .update(slot, |v| SlotValue {
                total: v.total + 2,
                active: 0,
                ..v
            })
            .unwrap();
        assert_eq!(updated.total, 42);
        assert_eq!(region.read(slot).unwrap().at(500), 42);
        assert_eq!(region.read(7), Err(RegionError::BadSlot(7)));
    }

    #[test]
    fn test_concurrent_reads_are_never_torn() {
        let region = Arc::new(PollRegion::new(0, 1));
        let slot = region.allocate().unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        // Every value the writer publishes has total == start == active
        let writer = {
            let region = region.clone();
            let stop = stop.clone();
            thread::spawn(move || {
                let mut n = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    n += 1;
                    region
                        .write(
                            slot,
                            SlotValue {
                                total: n as i64,
                                start: n,
                                active: n,
                            },
                        )
                        .unwrap();
                }
            })
        };

        for _ in 0..100_000 {
            match region.read(slot) {
                Ok(v) => {
                    assert_eq!(v.total as u64, v.start);
                    assert_eq!(v.start, v.active);
                }
                Err(e) => assert_eq!(e, RegionError::TornRead(slot)),
            }
        }

        stop.store(true, Ordering::Relaxed);
        writer.join().unwrap();
    }
}
