//! Process-wide hook layer for instrumented code
//!
//! Instrumented functions cannot carry an engine handle, so one engine
//! lives in a process-wide slot and `trace_enter` / `trace_exit` route
//! to it with the calling thread's identity.
//!
//! Initialization happens lazily on the first `trace_enter` and is
//! guarded against self-recursion: anything the initialization path
//! calls may itself be instrumented, so a re-entrant hook during setup
//! must return immediately instead of recursing until the stack blows.
//! Initialization completes before any call is recorded; an exit hook
//! that arrives first is a no-op.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::OnceLock;

use crate::engine::{EngineConfig, TraceEngine};

static ENGINE: OnceLock<TraceEngine> = OnceLock::new();

// Both flags are needed: `INITIALIZING` cuts off the re-entrant path
// while setup runs, `INITIALIZED` gates recording until setup is done.
static INITIALIZING: AtomicBool = AtomicBool::new(false);
static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Install a configured engine before any instrumented call runs.
///
/// Returns the engine back if one is already installed (including one
/// created implicitly by an earlier `trace_enter`).
pub fn install(engine: TraceEngine) -> Result<(), TraceEngine> {
    ENGINE.set(engine)?;
    INITIALIZING.store(true, Ordering::Relaxed);
    INITIALIZED.store(true, Ordering::Release);
    tracing::debug!("tick tracing engine installed");
    Ok(())
}

/// The process-wide engine, if initialization has completed.
pub fn global() -> Option<&'static TraceEngine> {
    if INITIALIZED.load(Ordering::Acquire) {
        ENGINE.get()
    } else {
        None
    }
}

/// Entry hook. `return_address` is the address the hook stub returns
/// to inside the instrumented function's prologue.
pub fn trace_enter(return_address: u64) {
    if !INITIALIZED.load(Ordering::Acquire) {
        // Nothing between this check and the swap: a hook fired from
        // inside initialization must bail here, or it recurses.
        if INITIALIZING.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = ENGINE.set(TraceEngine::new(EngineConfig::default()));
        tracing::debug!("tick tracing engine initialized");
        INITIALIZED.store(true, Ordering::Release);
    }

    if let Some(engine) = ENGINE.get() {
        engine.on_enter(current_thread_id(), return_address);
    }
}

/// Exit hook for the calling thread's most recent in-flight call.
pub fn trace_exit() {
    if !INITIALIZED.load(Ordering::Acquire) {
        // Never initialized: there cannot be anything to record.
        return;
    }

    if let Some(engine) = ENGINE.get() {
        engine.on_exit(current_thread_id());
    }
}

/// Numeric identity of the calling thread.
#[cfg(target_os = "linux")]
pub fn current_thread_id() -> u64 {
    // gettid never fails and is distinct per live thread.
    (unsafe { libc::gettid() }) as u64
}

#[cfg(not(target_os = "linux"))]
pub fn current_thread_id() -> u64 {
    use std::sync::atomic::AtomicU64;

    static NEXT: AtomicU64 = AtomicU64::new(1);
    thread_local! {
        static ID: u64 = NEXT.fetch_add(1, Ordering::Relaxed);
    }
    ID.with(|id| *id)
}
