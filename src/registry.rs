//! Function registry: immortal, stably-addressed per-function records
//!
//! Records live in a fixed-capacity slice allocated up front, so a
//! record's storage address never changes for the life of the process;
//! an external inspection tool can hold onto records (or raw indexes)
//! indefinitely. A sorted index maps a function's start address to its
//! slot for O(log n) lookup.
//!
//! Records are never removed once created. When the slice is exhausted,
//! later distinct functions are simply not tracked, and the operator is
//! told exactly once.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use crate::error::TraceError;
use crate::history::CallHistory;

/// Default registry capacity. Large enough for any reasonable module;
/// the (N+1)-th distinct function is dropped with a one-time warning.
pub const DEFAULT_MAX_FUNCTIONS: usize = 2000;

/// Per-function tracking record. Created at most once per distinct
/// start address, never destroyed; only its counters and history ring
/// mutate after creation.
pub struct FunctionRecord {
    start_address: AtomicU64,
    /// Cumulative elapsed ticks across all completed calls.
    call_ticks: AtomicU64,
    /// Completed call count.
    call_count: AtomicU64,
    history: CallHistory,
}

impl FunctionRecord {
    fn vacant() -> Self {
        Self {
            start_address: AtomicU64::new(0),
            call_ticks: AtomicU64::new(0),
            call_count: AtomicU64::new(0),
            history: CallHistory::new(),
        }
    }

    pub fn start_address(&self) -> u64 {
        self.start_address.load(Ordering::Relaxed)
    }

    pub fn call_ticks(&self) -> u64 {
        self.call_ticks.load(Ordering::Relaxed)
    }

    pub fn call_count(&self) -> u64 {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn history(&self) -> &CallHistory {
        &self.history
    }

    /// Fold one completed call into the aggregates. Lock-free; a reader
    /// may observe the count bumped before the ticks land, no snapshot
    /// consistency across the two fields is promised.
    pub(crate) fn record_call(&self, delta_ticks: u64) {
        self.call_ticks.fetch_add(delta_ticks, Ordering::Relaxed);
        self.call_count.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reset_counters(&self) {
        self.call_ticks.store(0, Ordering::Relaxed);
        self.call_count.store(0, Ordering::Relaxed);
    }
}

/// Fixed-capacity function registry with a sorted lookup index.
pub struct FunctionRegistry {
    records: Box<[FunctionRecord]>,
    /// Slots `[0, in_use)` are claimed. Only mutated under the write
    /// lock; the Release store pairs with the Acquire load in `iter`.
    in_use: AtomicUsize,
    index: spin::RwLock<BTreeMap<u64, usize>>,
    /// Latch so sustained overflow nags the operator exactly once.
    overflow_reported: AtomicBool,
}

impl FunctionRegistry {
    /// Allocate all `capacity` records up front. Hooks never allocate
    /// registry storage afterwards.
    pub fn new(capacity: usize) -> Self {
        let records: Vec<FunctionRecord> = (0..capacity).map(|_| FunctionRecord::vacant()).collect();
        Self {
            records: records.into_boxed_slice(),
            in_use: AtomicUsize::new(0),
            index: spin::RwLock::new(BTreeMap::new()),
            overflow_reported: AtomicBool::new(false),
        }
    }

    pub fn with_default_capacity() -> Self {
        Self::new(DEFAULT_MAX_FUNCTIONS)
    }

    /// Find or create the record for a function start address,
    /// returning its stable slot index.
    ///
    /// Idempotent and thread-safe: the same address always resolves to
    /// the same slot. The shared-lock probe is the common path once a
    /// function has been seen; a miss upgrades to the exclusive lock
    /// and re-probes, since another thread may have inserted the key
    /// between the two acquisitions.
    pub fn lookup_or_create(&self, address: u64) -> Result<usize, TraceError> {
        {
            let index = self.index.read();
            if let Some(&slot) = index.get(&address) {
                return Ok(slot);
            }
        }

        let mut index = self.index.write();
        // Double-checked: lost the insert race to another thread?
        if let Some(&slot) = index.get(&address) {
            return Ok(slot);
        }

        let slot = self.in_use.load(Ordering::Relaxed);
        if slot >= self.records.len() {
            if !self.overflow_reported.swap(true, Ordering::Relaxed) {
                tracing::warn!(
                    capacity = self.records.len(),
                    "out of function registry slots; further functions will not be tracked"
                );
            }
            return Err(TraceError::RegistryFull);
        }

        self.records[slot]
            .start_address
            .store(address, Ordering::Relaxed);
        index.insert(address, slot);
        self.in_use.store(slot + 1, Ordering::Release);

        Ok(slot)
    }

    /// Record at a slot index previously returned by
    /// [`lookup_or_create`](Self::lookup_or_create).
    ///
    /// # Panics
    ///
    /// Panics if `slot` was never claimed.
    pub fn get(&self, slot: usize) -> &FunctionRecord {
        assert!(slot < self.in_use.load(Ordering::Acquire));
        &self.records[slot]
    }

    /// Number of claimed records.
    pub fn len(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.records.len()
    }

    /// Iterate the claimed records in creation order.
    pub fn iter(&self) -> impl Iterator<Item = &FunctionRecord> {
        self.records[..self.len()].iter()
    }

    /// Zero the tick/count aggregates on every claimed record. History
    /// slots are untouched; the caller invalidates them by bumping the
    /// epoch.
    pub(crate) fn reset_counters(&self) {
        for record in self.iter() {
            record.reset_counters();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_or_create_is_idempotent() {
        let registry = FunctionRegistry::new(8);
        let first = registry.lookup_or_create(0x4000).unwrap();
        let second = registry.lookup_or_create(0x4000).unwrap();
        assert_eq!(first, second);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(first).start_address(), 0x4000);
    }

    #[test]
    fn test_distinct_addresses_never_collide() {
        let registry = FunctionRegistry::new(8);
        let a = registry.lookup_or_create(0x4000).unwrap();
        let b = registry.lookup_or_create(0x5000).unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.get(a).start_address(), 0x4000);
        assert_eq!(registry.get(b).start_address(), 0x5000);
    }

    #[test]
    fn test_capacity_exceeded_reports_full() {
        let registry = FunctionRegistry::new(2);
        registry.lookup_or_create(0x1000).unwrap();
        registry.lookup_or_create(0x2000).unwrap();

        assert_eq!(
            registry.lookup_or_create(0x3000),
            Err(TraceError::RegistryFull)
        );
        assert_eq!(
            registry.lookup_or_create(0x4000),
            Err(TraceError::RegistryFull)
        );

        // Existing records remain valid and keep aggregating.
        assert_eq!(registry.len(), 2);
        let slot = registry.lookup_or_create(0x1000).unwrap();
        registry.get(slot).record_call(10);
        assert_eq!(registry.get(slot).call_ticks(), 10);
    }

    #[test]
    fn test_overflow_latch_fires_once() {
        let registry = FunctionRegistry::new(1);
        registry.lookup_or_create(0x1000).unwrap();
        assert!(!registry.overflow_reported.load(Ordering::Relaxed));

        let _ = registry.lookup_or_create(0x2000);
        assert!(registry.overflow_reported.load(Ordering::Relaxed));
        // Latch already set; a second overflow must not re-arm it.
        assert!(registry.overflow_reported.swap(true, Ordering::Relaxed));
    }

    #[test]
    fn test_record_call_accumulates() {
        let registry = FunctionRegistry::new(4);
        let slot = registry.lookup_or_create(0x1000).unwrap();
        let record = registry.get(slot);

        record.record_call(100);
        record.record_call(250);
        assert_eq!(record.call_count(), 2);
        assert_eq!(record.call_ticks(), 350);
    }

    #[test]
    fn test_reset_counters_preserves_identity() {
        let registry = FunctionRegistry::new(4);
        let slot = registry.lookup_or_create(0x1000).unwrap();
        registry.get(slot).record_call(100);

        registry.reset_counters();
        let record = registry.get(slot);
        assert_eq!(record.call_count(), 0);
        assert_eq!(record.call_ticks(), 0);
        assert_eq!(record.start_address(), 0x1000);
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_concurrent_lookup_same_address_yields_one_record() {
        use std::sync::Arc;
        use std::thread;

        let registry = Arc::new(FunctionRegistry::new(64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let registry = Arc::clone(&registry);
            handles.push(thread::spawn(move || {
                let mut slots = Vec::new();
                for address in [0x1000u64, 0x2000, 0x3000] {
                    slots.push(registry.lookup_or_create(address).unwrap());
                }
                slots
            }));
        }

        let results: Vec<Vec<usize>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for window in results.windows(2) {
            assert_eq!(window[0], window[1]);
        }
        assert_eq!(registry.len(), 3);
    }

    #[test]
    fn test_iter_in_creation_order() {
        let registry = FunctionRegistry::new(4);
        registry.lookup_or_create(0x9000).unwrap();
        registry.lookup_or_create(0x1000).unwrap();

        let addresses: Vec<u64> = registry.iter().map(FunctionRecord::start_address).collect();
        assert_eq!(addresses, vec![0x9000, 0x1000]);
    }
}
