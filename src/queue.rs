//! The two scheduling queues.
//!
//! Both the run queue and the deferred queue are plain FIFO queues of task
//! ids. Nothing blocks on them; workers poll, and `push` reports whether the
//! queue was empty so the caller knows a wake/spawn may be needed.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::task::TaskId;

#[derive(Debug, Default)]
pub(crate) struct WorkQueue {
    items: Mutex<VecDeque<TaskId>>,
}

impl WorkQueue {
    /// Appends a task, returning `true` if the queue was empty before.
    pub(crate) fn push(&self, task: TaskId) -> bool {
        let mut items = self.items.lock();
        let was_empty = items.is_empty();
        items.push_back(task);
        was_empty
    }

    /// Removes and returns the oldest task, if any.
    pub(crate) fn take_next(&self) -> Option<TaskId> {
        self.items.lock().pop_front()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let q = WorkQueue::default();
        assert!(q.push(TaskId(1)));
        assert!(!q.push(TaskId(2)));
        assert_eq!(q.take_next(), Some(TaskId(1)));
        assert_eq!(q.take_next(), Some(TaskId(2)));
        assert_eq!(q.take_next(), None);
    }

    #[test]
    fn push_reports_empty_transition() {
        let q = WorkQueue::default();
        assert!(q.push(TaskId(7)));
        let _ = q.take_next();
        assert!(q.is_empty());
        assert!(q.push(TaskId(8)));
    }
}
