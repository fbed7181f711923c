use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

use crate::sync::lock;
use crate::ExecutionSerial;

/// Why a queued callback is being run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CallbackStatus {
    /// The serial it waited for completed.
    Success,
    /// The device was lost before the serial completed.
    DeviceLost,
    /// The device is being torn down.
    Shutdown,
}

pub type CallbackTask = Box<dyn FnOnce(CallbackStatus) + Send>;

/// Callbacks waiting for an execution serial to complete.
///
/// Tasks are returned to the caller instead of being run under the lock, so a
/// task may enqueue more work without deadlocking.
#[derive(Default)]
pub struct CallbackQueue {
    tasks: Mutex<BTreeMap<ExecutionSerial, Vec<CallbackTask>>>,
}

impl CallbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn enqueue(&self, serial: ExecutionSerial, task: CallbackTask) {
        lock(&self.tasks).entry(serial).or_default().push(task);
    }

    /// Removes every task due at or before `serial`, ordered by serial and then
    /// by enqueue order.
    pub fn acquire_callbacks_with_finished_serial(
        &self,
        serial: ExecutionSerial,
    ) -> Vec<CallbackTask> {
        let mut tasks = lock(&self.tasks);
        let due = match serial.checked_next() {
            Some(first_not_due) => {
                let not_due = tasks.split_off(&first_not_due);
                std::mem::replace(&mut *tasks, not_due)
            }
            None => std::mem::take(&mut *tasks),
        };
        due.into_values().flatten().collect()
    }

    pub fn acquire_all_callbacks(&self) -> Vec<CallbackTask> {
        std::mem::take(&mut *lock(&self.tasks))
            .into_values()
            .flatten()
            .collect()
    }

    pub fn has_callbacks(&self) -> bool {
        !lock(&self.tasks).is_empty()
    }

    pub fn len(&self) -> usize {
        lock(&self.tasks).values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        !self.has_callbacks()
    }
}

impl fmt::Debug for CallbackQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackQueue")
            .field("len", &self.len())
            .finish()
    }
}

/// Runs tasks in order with the same status.
pub fn run_callbacks(tasks: Vec<CallbackTask>, status: CallbackStatus) {
    for task in tasks {
        task(status);
    }
}
