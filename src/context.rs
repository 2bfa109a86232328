//! Per-unit mutation buffer.
//!
//! Each worker step runs against a fresh [`GraphBuildingContext`] and merges
//! it into the shared state afterwards. Newly runnable tasks and captured
//! faults therefore become visible atomically per unit, and a unit that
//! panics mid-way leaks nothing but its own task.

use tracing::warn;

use crate::builder::Shared;
use crate::task::TaskId;

#[derive(Default)]
pub(crate) struct GraphBuildingContext {
    runnable: Vec<TaskId>,
    faults: Vec<String>,
    pub(crate) steps: u64,
}

impl GraphBuildingContext {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Marks a task runnable. The caller must have set the task's `enqueued`
    /// flag under its lock.
    pub(crate) fn enqueue(&mut self, id: TaskId) {
        self.runnable.push(id);
    }

    /// Captures an infrastructure fault, keyed by its root cause.
    pub(crate) fn record_fault(&mut self, error: &anyhow::Error) {
        self.faults.push(error.root_cause().to_string());
    }

    /// Captures a panic unwound out of a work unit.
    pub(crate) fn record_panic(&mut self, message: &str) {
        warn!("work unit panicked: {message}");
        self.faults.push(format!("panic: {message}"));
    }

    /// Folds this context into the shared state and wakes workers if new
    /// work appeared.
    pub(crate) fn merge_into(self, shared: &Shared) {
        for fault in self.faults {
            *shared.faults.entry(fault).or_insert(0) += 1;
        }
        shared
            .steps
            .fetch_add(self.steps, std::sync::atomic::Ordering::Relaxed);
        let had_work = !self.runnable.is_empty();
        for id in self.runnable {
            shared.run_queue.push(id);
        }
        if had_work {
            shared.maybe_spawn();
        }
    }
}
