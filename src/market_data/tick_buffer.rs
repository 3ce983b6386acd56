// =============================================================================
// Tick Buffer — captures live ticks while the history request is in flight
// =============================================================================

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info};

use crate::types::Tick;

#[derive(Default)]
struct BufferState {
    capturing: bool,
    ticks: VecDeque<Tick>,
}

/// Arrival-ordered queue shared between the feed pump (producer) and the
/// seam hand-off (consumer).
#[derive(Default)]
pub struct TickBuffer {
    state: Mutex<BufferState>,
    /// Ticks pushed while not capturing.
    rejected: AtomicU64,
}

impl TickBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin capturing. Ticks pushed before this are rejected.
    pub fn start(&self) {
        self.state.lock().capturing = true;
        info!("tick buffer capturing");
    }

    /// Append a tick. Returns `false` if the buffer is not capturing.
    pub fn push(&self, tick: Tick) -> bool {
        let mut state = self.state.lock();
        if !state.capturing {
            drop(state);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            debug!(seq = tick.seq, "tick buffer not capturing; tick rejected");
            return false;
        }
        state.ticks.push_back(tick);
        true
    }

    /// Take everything captured so far, oldest first.
    pub fn drain(&self) -> Vec<Tick> {
        let mut state = self.state.lock();
        let drained: Vec<Tick> = state.ticks.drain(..).collect();
        debug!(count = drained.len(), "tick buffer drained");
        drained
    }

    /// End capture. Anything still queued stays until the next `drain`.
    pub fn stop(&self) {
        self.state.lock().capturing = false;
        info!("tick buffer stopped");
    }

    pub fn is_capturing(&self) -> bool {
        self.state.lock().capturing
    }

    pub fn len(&self) -> usize {
        self.state.lock().ticks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }
}
