//! Call-stack capture for history signatures
//!
//! The platform stack walk is an external primitive as far as the
//! aggregation engine is concerned: "capture up to K return addresses
//! for the calling thread". Production uses the `backtrace` crate;
//! tests substitute a canned stack so signature dedup is deterministic.

/// Walks the calling thread's stack and reports return addresses.
pub trait StackCapture: Send + Sync {
    /// Fill `out` with up to `out.len()` return addresses, skipping the
    /// innermost `skip` frames (the hook machinery itself). Returns the
    /// number of frames written, innermost caller first.
    fn capture(&self, skip: usize, out: &mut [u64]) -> usize;
}

/// Production capture backed by `backtrace::trace`.
#[derive(Debug, Default)]
pub struct BacktraceCapture;

impl StackCapture for BacktraceCapture {
    fn capture(&self, skip: usize, out: &mut [u64]) -> usize {
        if out.is_empty() {
            return 0;
        }
        let mut skipped = 0;
        let mut count = 0;
        backtrace::trace(|frame| {
            if skipped < skip {
                skipped += 1;
                return true;
            }
            out[count] = frame.ip() as u64;
            count += 1;
            count < out.len()
        });
        count
    }
}

/// Test capture returning a configurable, fixed stack.
#[derive(Debug, Default)]
pub struct FixedStacks {
    frames: spin::Mutex<Vec<u64>>,
}

impl FixedStacks {
    pub fn new(frames: Vec<u64>) -> Self {
        Self {
            frames: spin::Mutex::new(frames),
        }
    }

    /// Replace the stack reported by subsequent captures.
    pub fn set(&self, frames: Vec<u64>) {
        *self.frames.lock() = frames;
    }
}

impl StackCapture for FixedStacks {
    fn capture(&self, _skip: usize, out: &mut [u64]) -> usize {
        let frames = self.frames.lock();
        let count = frames.len().min(out.len());
        out[..count].copy_from_slice(&frames[..count]);
        count
    }
}
