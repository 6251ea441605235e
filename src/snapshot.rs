//! Serializable read model for external inspection tools
//!
//! A consumer (debugger extension, stats dumper) reads aggregated state
//! through these types rather than poking at engine internals. The
//! snapshot applies the epoch filter and wraparound ordering, so
//! history entries arrive live-only and oldest first.

use serde::Serialize;

use crate::engine::TraceEngine;
use crate::history::HistorySlot;
use crate::registry::FunctionRecord;

/// One live call-stack signature.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StackSnapshot {
    /// Return addresses, innermost caller first.
    pub frames: Vec<u64>,
    /// Times this exact signature recurred since it was recorded.
    pub seen_count: u64,
}

impl From<HistorySlot> for StackSnapshot {
    fn from(slot: HistorySlot) -> Self {
        Self {
            frames: slot.frames[..slot.frame_count].to_vec(),
            seen_count: slot.seen_count,
        }
    }
}

/// Aggregated state of one monitored function.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct FunctionSnapshot {
    pub start_address: u64,
    pub call_count: u64,
    pub call_ticks: u64,
    pub history_write_index: usize,
    pub history_total_writes: u64,
    /// Live signatures, oldest first.
    pub history: Vec<StackSnapshot>,
}

impl FunctionSnapshot {
    fn capture(record: &FunctionRecord, epoch: u32) -> Self {
        Self {
            start_address: record.start_address(),
            call_count: record.call_count(),
            call_ticks: record.call_ticks(),
            history_write_index: record.history().write_index(),
            history_total_writes: record.history().total_writes(),
            history: record
                .history()
                .live_slots(epoch)
                .into_iter()
                .map(StackSnapshot::from)
                .collect(),
        }
    }
}

/// Point-in-time view of the whole engine.
///
/// Counters are read individually with relaxed atomics, so a snapshot
/// taken while hooks run is linearizable per field, not a consistent
/// cut across fields.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct EngineSnapshot {
    pub current_epoch: u32,
    /// Records in creation order.
    pub functions: Vec<FunctionSnapshot>,
}

impl EngineSnapshot {
    pub fn capture(engine: &TraceEngine) -> Self {
        let epoch = engine.current_epoch();
        Self {
            current_epoch: epoch,
            functions: engine
                .registry()
                .iter()
                .map(|record| FunctionSnapshot::capture(record, epoch))
                .collect(),
        }
    }
}
