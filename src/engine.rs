//! Hook protocol: the entry/exit state machine over the aggregation parts
//!
//! `TraceEngine` is the explicitly constructed, process-wide context
//! object: registry + thread tracker + epoch counter + the clock and
//! stack-capture seams. Nothing here touches implicit globals, so unit
//! tests run as many independent engines as they like; the global
//! wiring for instrumented code lives in [`crate::hooks`].
//!
//! Failure semantics are uniform: tracing is best-effort. Every
//! abandonment path releases whatever it acquired and the monitored
//! call proceeds untracked; a tracing failure never propagates into
//! the monitored program.

use std::num::NonZeroU64;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use crate::clock::{Clock, MonotonicClock};
use crate::error::TraceError;
use crate::history::MAX_CALL_FRAMES;
use crate::registry::{FunctionRegistry, DEFAULT_MAX_FUNCTIONS};
use crate::snapshot::EngineSnapshot;
use crate::stack_capture::{BacktraceCapture, StackCapture};
use crate::tracker::{InFlightCall, ThreadTracker};

/// Length of the call instruction that precedes the entry hook's return
/// address. Subtracting it from the return address yields the monitored
/// function's start address (5 bytes on both x86 and x86-64).
pub const CALL_INSTRUCTION_LEN: u64 = 5;

/// When to capture a call-stack signature at exit. A hook-time policy,
/// not something the aggregation logic dictates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapturePolicy {
    /// Capture on every completed call.
    EveryCall,
    /// Capture on the first call and every n-th after it, counted per
    /// function record.
    EveryNth(NonZeroU64),
    /// Aggregate ticks and counts only.
    Disabled,
}

impl Default for CapturePolicy {
    fn default() -> Self {
        CapturePolicy::EveryCall
    }
}

/// Engine construction parameters.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Registry capacity; the (N+1)-th distinct function is dropped.
    pub max_functions: usize,
    pub capture_policy: CapturePolicy,
    /// Innermost frames to skip when capturing a signature, covering
    /// the hook machinery itself.
    pub capture_skip_frames: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_functions: DEFAULT_MAX_FUNCTIONS,
            capture_policy: CapturePolicy::default(),
            capture_skip_frames: 2,
        }
    }
}

/// In-process call-tracing engine.
pub struct TraceEngine {
    registry: FunctionRegistry,
    tracker: ThreadTracker,
    /// Generation counter; bumping it logically empties every history
    /// slot of every record in O(1).
    current_epoch: AtomicU32,
    clock: Arc<dyn Clock>,
    capture: Arc<dyn StackCapture>,
    config: EngineConfig,
}

impl TraceEngine {
    /// Engine with the production clock and stack capture.
    pub fn new(config: EngineConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(MonotonicClock::new()),
            Arc::new(BacktraceCapture),
        )
    }

    /// Engine with injected time/stack sources, for tests.
    pub fn with_parts(
        config: EngineConfig,
        clock: Arc<dyn Clock>,
        capture: Arc<dyn StackCapture>,
    ) -> Self {
        Self {
            registry: FunctionRegistry::new(config.max_functions),
            tracker: ThreadTracker::new(),
            current_epoch: AtomicU32::new(0),
            clock,
            capture,
            config,
        }
    }

    pub fn registry(&self) -> &FunctionRegistry {
        &self.registry
    }

    pub fn tracker(&self) -> &ThreadTracker {
        &self.tracker
    }

    pub fn current_epoch(&self) -> u32 {
        self.current_epoch.load(Ordering::Relaxed)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Entry hook. `return_address` is where the entry hook will return
    /// to, i.e. the first instruction past the call into the hook.
    pub fn on_enter(&self, thread_id: u64, return_address: u64) {
        let start_address = return_address.wrapping_sub(CALL_INSTRUCTION_LEN);
        if let Err(err) = self.enter_call(thread_id, start_address) {
            tracing::debug!(%err, thread_id, start_address, "entry abandoned");
        }
    }

    /// Exit hook for the most recent in-flight call on `thread_id`.
    pub fn on_exit(&self, thread_id: u64) {
        if let Err(err) = self.exit_call(thread_id) {
            // A miss here means an exit with no matching entry, which
            // is an invariant violation worth surfacing, not a routine
            // resource shortage.
            tracing::warn!(%err, thread_id, "exit abandoned");
        }
    }

    /// Zero every record's aggregates and invalidate all history slots
    /// with a single epoch bump. History bytes are never touched.
    pub fn reset(&self) {
        self.registry.reset_counters();
        self.current_epoch.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(epoch = self.current_epoch(), "trace statistics reset");
    }

    /// Read model for external inspection: all records plus the epoch,
    /// with the epoch filter and wraparound ordering already applied to
    /// each history ring.
    pub fn snapshot(&self) -> EngineSnapshot {
        EngineSnapshot::capture(self)
    }

    fn enter_call(&self, thread_id: u64, start_address: u64) -> Result<(), TraceError> {
        let fn_slot = self.registry.lookup_or_create(start_address)?;

        // The reference taken here is intentionally *not* released at
        // the end of entry; it is held for the lifetime of the
        // in-flight call and dropped by the matching exit.
        let thread = self
            .tracker
            .acquire(thread_id, true)
            .ok_or(TraceError::TrackerMiss(thread_id))?;

        let call = InFlightCall {
            fn_slot,
            start_ticks: self.clock.now(),
        };
        if let Err(err) = thread.push_call(call) {
            // Bounded stack refused the frame; give back the entry
            // reference so the record does not leak.
            self.tracker.release(&thread);
            return Err(err);
        }

        Ok(())
    }

    fn exit_call(&self, thread_id: u64) -> Result<(), TraceError> {
        let end_ticks = self.clock.now();

        let thread = self
            .tracker
            .acquire(thread_id, false)
            .ok_or(TraceError::TrackerMiss(thread_id))?;

        // Drop the transient reference the lookup just took. The record
        // stays alive through the reference held since entry by the
        // in-flight call we are about to pop.
        self.tracker.release(&thread);

        let call = thread
            .pop_call()
            .ok_or(TraceError::TrackerMiss(thread_id))?;

        let record = self.registry.get(call.fn_slot);
        record.record_call(end_ticks.wrapping_sub(call.start_ticks));

        if self.should_capture(record.call_count()) {
            let mut frames = [0u64; MAX_CALL_FRAMES];
            let count = self
                .capture
                .capture(self.config.capture_skip_frames, &mut frames);
            if count > 0 {
                record.history().record(&frames[..count], self.current_epoch());
            }
        }

        // Release the reference held since entry.
        self.tracker.release(&thread);

        Ok(())
    }

    fn should_capture(&self, call_count: u64) -> bool {
        match self.config.capture_policy {
            CapturePolicy::EveryCall => true,
            CapturePolicy::Disabled => false,
            // call_count is the post-increment value, so the first call
            // always captures.
            CapturePolicy::EveryNth(n) => call_count.wrapping_sub(1) % n.get() == 0,
        }
    }
}
