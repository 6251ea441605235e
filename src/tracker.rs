//! Thread call-stack tracker: transient, reference-counted records
//!
//! A thread has a record here only while it has instrumented calls
//! outstanding, so the tracker's footprint follows currently-active
//! threads, not historical ones. Membership in the index is governed by
//! a manual reference count: one reference per in-flight call plus one
//! per in-progress lookup. The `Arc` wrapper only keeps the memory
//! alive for holders that outlast index removal; it does not decide
//! index membership.
//!
//! The delicate part is teardown: the decrement and the remove-at-zero
//! happen inside one exclusive critical section, so a concurrent
//! acquire can never observe a still-indexed record whose count already
//! hit zero and resurrect it mid-destruction.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use crate::error::TraceError;

/// In-flight calls tracked per thread before the bounded stack refuses
/// pushes. Deeper recursion degrades to untracked calls, the same as an
/// allocation failure.
pub const MAX_CALL_DEPTH: usize = 512;

/// Bookkeeping for one currently-executing instrumented call, pushed at
/// entry and popped at the matching exit.
#[derive(Debug, Clone, Copy)]
pub(crate) struct InFlightCall {
    /// Registry slot of the called function.
    pub fn_slot: usize,
    /// Tick value captured at entry.
    pub start_ticks: u64,
}

/// Per-thread record holding the LIFO chain of in-flight calls.
pub struct ThreadRecord {
    thread_id: u64,
    /// Holders: one per outstanding call, one per transient lookup.
    /// Mutated only while the tracker index lock is held.
    ref_count: AtomicI64,
    /// LIFO of in-flight calls, newest last. Storage is preallocated to
    /// [`MAX_CALL_DEPTH`]; only the owning thread pushes and pops.
    call_stack: spin::Mutex<Vec<InFlightCall>>,
}

impl ThreadRecord {
    fn new(thread_id: u64) -> Self {
        Self {
            thread_id,
            ref_count: AtomicI64::new(1),
            call_stack: spin::Mutex::new(Vec::with_capacity(MAX_CALL_DEPTH)),
        }
    }

    pub fn thread_id(&self) -> u64 {
        self.thread_id
    }

    /// Current holder count. Diagnostic only; stale the moment it is
    /// read.
    pub fn references(&self) -> i64 {
        self.ref_count.load(Ordering::Relaxed)
    }

    /// Outstanding in-flight calls.
    pub fn depth(&self) -> usize {
        self.call_stack.lock().len()
    }

    pub(crate) fn push_call(&self, call: InFlightCall) -> Result<(), TraceError> {
        let mut stack = self.call_stack.lock();
        if stack.len() >= MAX_CALL_DEPTH {
            return Err(TraceError::CallStackFull);
        }
        stack.push(call);
        Ok(())
    }

    pub(crate) fn pop_call(&self) -> Option<InFlightCall> {
        self.call_stack.lock().pop()
    }
}

/// Index of live thread records.
pub struct ThreadTracker {
    index: spin::RwLock<BTreeMap<u64, Arc<ThreadRecord>>>,
}

impl ThreadTracker {
    pub fn new() -> Self {
        Self {
            index: spin::RwLock::new(BTreeMap::new()),
        }
    }

    /// Look up the record for `thread_id`, taking a reference on it.
    ///
    /// On a miss with `create_if_missing` set, upgrades to the
    /// exclusive lock and re-probes before inserting: another thread
    /// may have created the record between the two lock acquisitions,
    /// in which case that record is referenced instead and the
    /// speculative one is discarded. Without `create_if_missing` a miss
    /// returns `None`; the exit hook uses this to detect a broken
    /// entry/exit pairing.
    pub fn acquire(&self, thread_id: u64, create_if_missing: bool) -> Option<Arc<ThreadRecord>> {
        {
            let index = self.index.read();
            if let Some(record) = index.get(&thread_id) {
                record.ref_count.fetch_add(1, Ordering::Relaxed);
                return Some(Arc::clone(record));
            }
        }

        if !create_if_missing {
            return None;
        }

        let mut index = self.index.write();
        if let Some(record) = index.get(&thread_id) {
            record.ref_count.fetch_add(1, Ordering::Relaxed);
            return Some(Arc::clone(record));
        }

        let record = Arc::new(ThreadRecord::new(thread_id));
        index.insert(thread_id, Arc::clone(&record));
        Some(record)
    }

    /// Drop one reference. When the count reaches zero the record is
    /// removed from the index in the same exclusive critical section as
    /// the decrement.
    pub fn release(&self, record: &ThreadRecord) {
        let mut index = self.index.write();
        let previous = record.ref_count.fetch_sub(1, Ordering::Relaxed);
        debug_assert!(previous > 0, "thread record over-released");
        if previous == 1 {
            let removed = index.remove(&record.thread_id);
            debug_assert!(removed.is_some(), "zero-ref thread record not indexed");
        }
    }

    /// Whether `thread_id` currently has a record. A thread with zero
    /// outstanding calls is never observable here.
    pub fn contains(&self, thread_id: u64) -> bool {
        self.index.read().contains_key(&thread_id)
    }

    /// Number of threads with outstanding calls.
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }
}

impl Default for ThreadTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_without_create_misses() {
        let tracker = ThreadTracker::new();
        assert!(tracker.acquire(7, false).is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn test_acquire_with_create_inserts_with_one_reference() {
        let tracker = ThreadTracker::new();
        let record = tracker.acquire(7, true).unwrap();
        assert_eq!(record.thread_id(), 7);
        assert_eq!(record.references(), 1);
        assert!(tracker.contains(7));
        assert_eq!(tracker.len(), 1);
    }

    #[test]
    fn test_acquire_hit_increments_reference() {
        let tracker = ThreadTracker::new();
        let first = tracker.acquire(7, true).unwrap();
        let second = tracker.acquire(7, false).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.references(), 2);
    }

    #[test]
    fn test_release_to_zero_removes_from_index() {
        let tracker = ThreadTracker::new();
        let record = tracker.acquire(7, true).unwrap();
        tracker.acquire(7, false).unwrap();

        tracker.release(&record);
        assert!(tracker.contains(7));

        tracker.release(&record);
        assert!(!tracker.contains(7));

        // A later lookup must not resurrect the destroyed record.
        assert!(tracker.acquire(7, false).is_none());
    }

    #[test]
    fn test_recreate_after_removal_is_fresh() {
        let tracker = ThreadTracker::new();
        let first = tracker.acquire(7, true).unwrap();
        first.push_call(InFlightCall {
            fn_slot: 0,
            start_ticks: 1,
        })
        .unwrap();
        first.pop_call().unwrap();
        tracker.release(&first);

        let second = tracker.acquire(7, true).unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(second.references(), 1);
        assert_eq!(second.depth(), 0);
    }

    #[test]
    fn test_call_stack_is_lifo() {
        let tracker = ThreadTracker::new();
        let record = tracker.acquire(7, true).unwrap();
        for slot in 0..3 {
            record.push_call(InFlightCall {
                fn_slot: slot,
                start_ticks: slot as u64 * 10,
            })
            .unwrap();
        }
        assert_eq!(record.depth(), 3);

        assert_eq!(record.pop_call().unwrap().fn_slot, 2);
        assert_eq!(record.pop_call().unwrap().fn_slot, 1);
        assert_eq!(record.pop_call().unwrap().fn_slot, 0);
        assert!(record.pop_call().is_none());
    }

    #[test]
    fn test_call_stack_depth_bound() {
        let tracker = ThreadTracker::new();
        let record = tracker.acquire(7, true).unwrap();
        for i in 0..MAX_CALL_DEPTH {
            record.push_call(InFlightCall {
                fn_slot: 0,
                start_ticks: i as u64,
            })
            .unwrap();
        }

        let overflow = record.push_call(InFlightCall {
            fn_slot: 0,
            start_ticks: 0,
        });
        assert_eq!(overflow, Err(TraceError::CallStackFull));
        assert_eq!(record.depth(), MAX_CALL_DEPTH);
    }

    #[test]
    fn test_concurrent_acquire_release_churn() {
        use std::thread;

        let tracker = Arc::new(ThreadTracker::new());
        let mut handles = Vec::new();
        for thread_id in 0..8u64 {
            let tracker = Arc::clone(&tracker);
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    let record = tracker.acquire(thread_id % 4, true).unwrap();
                    tracker.release(&record);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        // Every reference was released, so no thread is observable.
        assert!(tracker.is_empty());
    }
}
