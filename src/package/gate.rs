//! Single-flight gate: at most one operation per owner, rejecting rather
//! than queueing.

use std::sync::atomic::{AtomicBool, Ordering};

/// Observable gate state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    Idle,
    InFlight,
}

/// Atomic Idle -> InFlight -> Idle state machine.
#[derive(Debug, Default)]
pub struct OperationGate {
    busy: AtomicBool,
}

impl OperationGate {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            busy: AtomicBool::new(false),
        }
    }

    /// Moves the gate to `InFlight`, or returns `None` if it already is.
    ///
    /// The gate returns to `Idle` when the pass is dropped.
    pub fn try_enter(&self) -> Option<GatePass<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| GatePass { gate: self })
    }

    #[must_use]
    pub fn state(&self) -> GateState {
        if self.busy.load(Ordering::Acquire) {
            GateState::InFlight
        } else {
            GateState::Idle
        }
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.state() == GateState::InFlight
    }
}

/// Proof of entry; dropping it releases the gate.
#[derive(Debug)]
pub struct GatePass<'a> {
    gate: &'a OperationGate,
}

impl Drop for GatePass<'_> {
    fn drop(&mut self) {
        self.gate.busy.store(false, Ordering::Release);
    }
}
