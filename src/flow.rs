//! Ack-based backpressure for terminal output
//!
//! Every chunk sent to the client increments an unacknowledged counter and
//! every `ack` from the client decrements it. Reading from the terminal pauses
//! once more than [`HIGH_WATERMARK`] chunks are outstanding and resumes when
//! fewer than [`LOW_WATERMARK`] remain.

use parking_lot::{Condvar, Mutex};

/// Outstanding chunks above which reading pauses
pub const HIGH_WATERMARK: usize = 20;

/// Outstanding chunks below which reading resumes
pub const LOW_WATERMARK: usize = 2;

/// Transition produced by a counter update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowSignal {
    Pause,
    Resume,
}

/// Counter of unacknowledged chunks with pause hysteresis
#[derive(Debug, Default)]
pub struct FlowControl {
    unacked: usize,
    paused: bool,
}

impl FlowControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unacked(&self) -> usize {
        self.unacked
    }

    pub fn is_paused(&self) -> bool {
        self.paused
    }

    /// Record a chunk sent to the client
    pub fn on_chunk_sent(&mut self) -> Option<FlowSignal> {
        self.unacked += 1;
        if !self.paused && self.unacked > HIGH_WATERMARK {
            self.paused = true;
            return Some(FlowSignal::Pause);
        }
        None
    }

    /// Record an acknowledgement from the client
    pub fn on_ack(&mut self) -> Option<FlowSignal> {
        self.unacked = self.unacked.saturating_sub(1);
        if self.paused && self.unacked < LOW_WATERMARK {
            self.paused = false;
            return Some(FlowSignal::Resume);
        }
        None
    }
}

/// Blocks the terminal reader thread while output is paused
#[derive(Debug, Default)]
pub struct ReadGate {
    state: Mutex<GateState>,
    cond: Condvar,
}

#[derive(Debug, Default)]
struct GateState {
    paused: bool,
    closed: bool,
}

impl ReadGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&self, signal: FlowSignal) {
        let mut state = self.state.lock();
        state.paused = signal == FlowSignal::Pause;
        if !state.paused {
            self.cond.notify_all();
        }
    }

    /// Release any waiter for good; used when the session ends
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.cond.notify_all();
    }

    /// Wait until reading may continue. Returns `false` once the gate is closed.
    pub fn wait_open(&self) -> bool {
        let mut state = self.state.lock();
        while state.paused && !state.closed {
            self.cond.wait(&mut state);
        }
        !state.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_pauses_after_high_watermark() {
        let mut flow = FlowControl::new();
        for _ in 0..HIGH_WATERMARK {
            assert_eq!(flow.on_chunk_sent(), None);
        }
        assert!(!flow.is_paused());

        assert_eq!(flow.on_chunk_sent(), Some(FlowSignal::Pause));
        assert!(flow.is_paused());
        assert_eq!(flow.unacked(), 21);

        // Already paused, no repeated signal
        assert_eq!(flow.on_chunk_sent(), None);
    }

    #[test]
    fn test_resumes_below_low_watermark() {
        let mut flow = FlowControl::new();
        for _ in 0..21 {
            flow.on_chunk_sent();
        }

        for _ in 0..19 {
            assert_eq!(flow.on_ack(), None);
        }
        assert_eq!(flow.unacked(), 2);
        assert!(flow.is_paused());

        assert_eq!(flow.on_ack(), Some(FlowSignal::Resume));
        assert_eq!(flow.unacked(), 1);
        assert!(!flow.is_paused());
    }

    #[test]
    fn test_acks_without_pause_do_not_resume() {
        let mut flow = FlowControl::new();
        flow.on_chunk_sent();
        assert_eq!(flow.on_ack(), None);
    }

    #[test]
    fn test_counter_never_negative() {
        let mut flow = FlowControl::new();
        assert_eq!(flow.on_ack(), None);
        assert_eq!(flow.on_ack(), None);
        assert_eq!(flow.unacked(), 0);

        flow.on_chunk_sent();
        assert_eq!(flow.unacked(), 1);
    }

    #[test]
    fn test_gate_blocks_until_resume() {
        let gate = Arc::new(ReadGate::new());
        gate.apply(FlowSignal::Pause);

        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.wait_open())
        };

        std::thread::sleep(Duration::from_millis(50));
        assert!(!waiter.is_finished());

        gate.apply(FlowSignal::Resume);
        assert!(waiter.join().unwrap());
    }

    #[test]
    fn test_closed_gate_releases_waiter() {
        let gate = Arc::new(ReadGate::new());
        gate.apply(FlowSignal::Pause);

        let waiter = {
            let gate = Arc::clone(&gate);
            std::thread::spawn(move || gate.wait_open())
        };

        gate.close();
        assert!(!waiter.join().unwrap());
        assert!(!gate.wait_open());
    }
}
