//! ticktrace - In-process function call tracing engine
//!
//! Instrumented functions report entry and exit to a shared aggregation
//! layer that accumulates per-function call counts, cumulative tick
//! time, and deduplicated call-stack signatures. The engine is built
//! for preemption-restricted contexts: spin-wait synchronization only,
//! fixed-capacity storage claimed up front, and best-effort semantics:
//! a tracing failure never propagates into the monitored program.

pub mod clock;
pub mod engine;
pub mod error;
pub mod history;
pub mod hooks;
pub mod registry;
pub mod snapshot;
pub mod stack_capture;
pub mod tracker;
