//! Error taxonomy for the tracing engine
//!
//! Every error here is non-fatal to the monitored program: tracing is a
//! side channel, and any failure degrades to "this call is simply not
//! recorded". Hook entry points swallow these values after logging;
//! internal APIs propagate them with `?`.

use thiserror::Error;

/// Errors raised by the aggregation engine.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TraceError {
    /// The fixed-capacity function registry has no free slots left.
    /// Records are never freed, so this is permanent for the process.
    #[error("function registry is full; call not tracked")]
    RegistryFull,

    /// The per-thread in-flight call stack is at capacity. Treated the
    /// same as an allocation failure: the call goes untracked.
    #[error("per-thread call stack is at capacity; call not tracked")]
    CallStackFull,

    /// An exit hook fired for a thread with no tracked record. This
    /// indicates a mismatched entry/exit pair, e.g. stack unwinding
    /// that bypassed the exit hook.
    #[error("no thread record for thread {0} (exit without matching entry)")]
    TrackerMiss(u64),

    /// A hook was invoked before process-wide initialization completed.
    #[error("tracing engine is not initialized")]
    NotInitialized,
}
