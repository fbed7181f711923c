//! Submitted vs. completed work tracking.
//!
//! Three watermarks describe a queue:
//! - `last_submitted`: the newest serial handed to the GPU.
//! - `completed`: the newest serial the GPU finished.
//! - `pending`: `last_submitted + 1`, the serial the next submission will carry.
//!
//! `completed <= last_submitted < pending` always holds.

#[cfg(all(feature = "loom", test))]
use loom::sync::atomic::AtomicU64;
#[cfg(not(all(feature = "loom", test)))]
use std::sync::atomic::AtomicU64;

use std::fmt;
use std::sync::atomic::Ordering;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExecutionSerial(pub u64);

impl ExecutionSerial {
    pub const ZERO: ExecutionSerial = ExecutionSerial(0);

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn next(self) -> ExecutionSerial {
        ExecutionSerial(self.0 + 1)
    }

    pub fn checked_next(self) -> Option<ExecutionSerial> {
        self.0.checked_add(1).map(ExecutionSerial)
    }
}

impl fmt::Display for ExecutionSerial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The part of a queue that talks to the actual GPU.
pub trait QueueBackend: Send + Sync {
    /// Newest serial the GPU has finished. `last_submitted` is the newest serial
    /// that could possibly have completed.
    fn completed_serial(&self, last_submitted: ExecutionSerial) -> ExecutionSerial;

    /// Whether recorded work is waiting to be submitted.
    fn has_pending_commands(&self) -> bool;
}

pub struct ExecutionQueue {
    last_submitted: AtomicU64,
    completed: AtomicU64,
    backend: Box<dyn QueueBackend>,
}

impl ExecutionQueue {
    pub fn new(backend: Box<dyn QueueBackend>) -> Self {
        Self {
            last_submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            backend,
        }
    }

    pub fn backend(&self) -> &dyn QueueBackend {
        self.backend.as_ref()
    }

    pub fn last_submitted_command_serial(&self) -> ExecutionSerial {
        ExecutionSerial(self.last_submitted.load(Ordering::Acquire))
    }

    pub fn completed_command_serial(&self) -> ExecutionSerial {
        ExecutionSerial(self.completed.load(Ordering::Acquire))
    }

    pub fn pending_command_serial(&self) -> ExecutionSerial {
        self.last_submitted_command_serial().next()
    }

    /// Serial after which everything recorded so far will have executed.
    ///
    /// With nothing waiting to be submitted, no new serial will be produced, so
    /// the answer is the last submitted one.
    pub fn scheduled_work_done_serial(&self) -> ExecutionSerial {
        if self.backend.has_pending_commands() {
            self.pending_command_serial()
        } else {
            self.last_submitted_command_serial()
        }
    }

    pub fn has_pending_commands(&self) -> bool {
        self.backend.has_pending_commands()
    }

    /// Records a submission and returns its serial.
    pub fn increment_last_submitted_command_serial(&self) -> ExecutionSerial {
        ExecutionSerial(self.last_submitted.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Asks the backend for progress and advances `completed`. Never moves it backwards.
    pub fn check_passed_serials(&self) -> ExecutionSerial {
        let last_submitted = self.last_submitted_command_serial();
        let reported = self.backend.completed_serial(last_submitted).min(last_submitted);
        self.advance_completed(reported.0);
        self.completed_command_serial()
    }

    /// Treats every submitted serial as complete, e.g. once the device is lost.
    pub fn assume_commands_complete(&self) {
        let last_submitted = self.last_submitted.load(Ordering::Acquire);
        self.advance_completed(last_submitted);
    }

    fn advance_completed(&self, target: u64) {
        let mut current = self.completed.load(Ordering::Acquire);
        while target > current {
            match self.completed.compare_exchange_weak(
                current,
                target,
                Ordering::Release,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
}

impl fmt::Debug for ExecutionQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionQueue")
            .field("last_submitted", &self.last_submitted_command_serial())
            .field("completed", &self.completed_command_serial())
            .finish()
    }
}
