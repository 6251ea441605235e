//! Bounded call-history ring with epoch-based reset
//!
//! Each function record embeds a fixed ring of call-stack signatures.
//! Recording dedups against live slots (same epoch, identical frames)
//! and otherwise claims the next slot round-robin, overwriting whatever
//! is there: oldest-first eviction, not an LRU. A hot call site with
//! many distinct stack shapes can evict an unrelated slot early; that
//! is the accepted cost of O(1), fixed-memory behavior.
//!
//! Reset never touches the slots: bumping the engine's epoch makes
//! every slot whose tag differs logically empty, so a global reset is
//! a single counter increment no matter how many functions exist.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Maximum return addresses kept per signature.
pub const MAX_CALL_FRAMES: usize = 5;

/// Signature slots per function record.
pub const MAX_CALL_HISTORY: usize = 50;

/// One signature slot. Bytes persist across resets; a slot is live only
/// while its `epoch` matches the engine's current epoch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistorySlot {
    pub frames: [u64; MAX_CALL_FRAMES],
    pub frame_count: usize,
    /// Times this exact signature recurred since the slot was written.
    pub seen_count: u64,
    pub epoch: u32,
}

impl HistorySlot {
    fn matches(&self, frames: &[u64], epoch: u32) -> bool {
        self.epoch == epoch
            && self.frame_count == frames.len()
            && self.frames[..self.frame_count] == *frames
    }
}

/// Fixed ring of signature slots embedded in a function record.
///
/// Concurrent writers may race on the ring; the atomic write index
/// guarantees the ring itself is never corrupted, and the per-slot spin
/// mutex keeps slot contents internally consistent. Two racing writers
/// of the same new signature may each claim a slot; exact interleaving
/// beyond memory safety is unspecified.
pub struct CallHistory {
    slots: [spin::Mutex<HistorySlot>; MAX_CALL_HISTORY],
    /// Claims slots via fetch-and-increment; reported modulo the ring
    /// size as "next slot to write".
    write_index: AtomicUsize,
    /// Monotonic write count; lets a reader detect wraparound.
    total_writes: AtomicU64,
}

impl CallHistory {
    pub fn new() -> Self {
        Self {
            slots: std::array::from_fn(|_| spin::Mutex::new(HistorySlot::default())),
            write_index: AtomicUsize::new(0),
            total_writes: AtomicU64::new(0),
        }
    }

    /// Record a stack signature under the given epoch. Best-effort:
    /// never blocks beyond short spin-held slot locks, never allocates.
    ///
    /// `frames` beyond [`MAX_CALL_FRAMES`] are ignored.
    pub fn record(&self, frames: &[u64], epoch: u32) {
        let frames = &frames[..frames.len().min(MAX_CALL_FRAMES)];
        if frames.is_empty() {
            return;
        }

        // Same signature recurring: bump the existing live slot.
        for slot in &self.slots {
            let mut slot = slot.lock();
            if slot.matches(frames, epoch) {
                slot.seen_count += 1;
                return;
            }
        }

        // New signature: claim the next slot and overwrite it.
        let claimed = self.write_index.fetch_add(1, Ordering::Relaxed) % MAX_CALL_HISTORY;
        let mut slot = self.slots[claimed].lock();
        slot.frames = [0; MAX_CALL_FRAMES];
        slot.frames[..frames.len()].copy_from_slice(frames);
        slot.frame_count = frames.len();
        slot.seen_count = 1;
        slot.epoch = epoch;
        drop(slot);

        self.total_writes.fetch_add(1, Ordering::Relaxed);
    }

    /// Next slot to write, in `[0, MAX_CALL_HISTORY)`.
    pub fn write_index(&self) -> usize {
        self.write_index.load(Ordering::Relaxed) % MAX_CALL_HISTORY
    }

    /// Monotonic count of slot writes (dedup hits do not count).
    pub fn total_writes(&self) -> u64 {
        self.total_writes.load(Ordering::Relaxed)
    }

    /// Copy out the live slots (epoch filter applied), oldest first.
    ///
    /// Once the ring has wrapped, the oldest entries sit in
    /// `[write_index, MAX_CALL_HISTORY)` and the newest in
    /// `[0, write_index)`.
    pub fn live_slots(&self, epoch: u32) -> Vec<HistorySlot> {
        let write_index = self.write_index();
        let wrapped = self.total_writes() > MAX_CALL_HISTORY as u64;

        let order = if wrapped {
            (write_index..MAX_CALL_HISTORY).chain(0..write_index)
        } else {
            (0..MAX_CALL_HISTORY).chain(0..0)
        };

        order
            .map(|i| *self.slots[i].lock())
            .filter(|slot| slot.epoch == epoch && slot.seen_count > 0)
            .collect()
    }
}

impl Default for CallHistory {
    fn default() -> Self {
        Self::new()
    }
}
