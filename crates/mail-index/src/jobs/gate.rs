//! Exactly-once execution gate of a job instance

use std::sync::atomic::{AtomicU8, Ordering};

const OPEN: u8 = 0;
const PERFORMING: u8 = 1;
const REPLACED: u8 = 2;

/// Observable state of a [`JobGate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateState {
    /// Idle and mergeable
    Open,
    /// Running or ran; terminal for this instance
    Performing,
    /// A merge is copying fields in; returns to `Open`
    Replaced,
}

/// Tri-state gate driven by compare-and-swap loops
///
/// Once `Performing` is reached the gate never leaves it.
#[derive(Debug, Default)]
pub struct JobGate(AtomicU8);

/// Puts a replaced gate back to OPEN, also when the merge panics
struct Reopen<'a>(&'a AtomicU8);

impl Drop for Reopen<'_> {
    fn drop(&mut self) {
        self.0.store(OPEN, Ordering::Release);
    }
}

impl JobGate {
    pub fn new() -> Self {
        Self(AtomicU8::new(OPEN))
    }

    pub fn state(&self) -> GateState {
        match self.0.load(Ordering::Acquire) {
            OPEN => GateState::Open,
            PERFORMING => GateState::Performing,
            _ => GateState::Replaced,
        }
    }

    /// Transition OPEN to PERFORMING
    ///
    /// Returns false if the gate already is PERFORMING. Spins while a merge
    /// holds the gate in REPLACED.
    pub fn try_begin_perform(&self) -> bool {
        loop {
            match self
                .0
                .compare_exchange_weak(OPEN, PERFORMING, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => return true,
                Err(PERFORMING) => return false,
                Err(_) => std::hint::spin_loop(),
            }
        }
    }

    /// Run `merge` with the gate held in REPLACED
    ///
    /// Returns `None` without running `merge` once the gate is PERFORMING.
    pub fn replace<R>(&self, merge: impl FnOnce() -> R) -> Option<R> {
        loop {
            match self
                .0
                .compare_exchange_weak(OPEN, REPLACED, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(PERFORMING) => return None,
                Err(_) => std::hint::spin_loop(),
            }
        }

        let _reopen = Reopen(&self.0);
        Some(merge())
    }
}
