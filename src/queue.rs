//! `WorkStealQueue`: the FIFO task queue each Development batch's
//! Developer pool pulls from.
//!
//! Deliberately *not* lock-free — a plain `Mutex<VecDeque<Task>>` is both
//! correct and sufficient at this concurrency scale (a handful of
//! Developer subprocesses, not thousands of threads).

use std::collections::VecDeque;
use std::sync::Mutex;

use crate::model::{Task, WorkStatus};

pub struct WorkStealQueue {
    inner: Mutex<VecDeque<Task>>,
}

impl WorkStealQueue {
    pub fn new(tasks: Vec<Task>) -> Self {
        Self {
            inner: Mutex::new(tasks.into()),
        }
    }

    /// Pops the next pending task, marking it `Running` as it leaves the
    /// queue. Returns `None` once every task has been claimed.
    pub fn pop(&self) -> Option<Task> {
        let mut guard = self.inner.lock().expect("queue mutex poisoned");
        guard.pop_front().map(|mut task| {
            task.status = WorkStatus::Running;
            task
        })
    }

    /// Returns a claimed task to the *tail* of the queue for a retry,
    /// incrementing its retry counter and recording the failure reason —
    /// so other pending tasks get a turn before it's retried.
    pub fn requeue(&self, mut task: Task, failure_reason: impl Into<String>) {
        task.retry_count += 1;
        task.status = WorkStatus::Pending;
        task.last_failure_reason = Some(failure_reason.into());
        let mut guard = self.inner.lock().expect("queue mutex poisoned");
        guard.push_back(task);
    }

    /// Number of tasks still pending (neither running, complete, nor
    /// permanently failed).
    pub fn remaining(&self) -> usize {
        self.inner.lock().expect("queue mutex poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.remaining() == 0
    }

    /// Drains every task currently in the queue, e.g. once a batch has
    /// been abandoned and its remaining tasks need to be marked failed.
    pub fn drain(&self) -> Vec<Task> {
        let mut guard = self.inner.lock().expect("queue mutex poisoned");
        guard.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pop_returns_tasks_in_fifo_order() {
        let queue = WorkStealQueue::new(vec![
            Task::new("1", "first", ""),
            Task::new("2", "second", ""),
        ]);
        assert_eq!(queue.pop().unwrap().id, "1");
        assert_eq!(queue.pop().unwrap().id, "2");
        assert!(queue.pop().is_none());
    }

    #[test]
    fn pop_marks_task_running() {
        let queue = WorkStealQueue::new(vec![Task::new("1", "t", "")]);
        let task = queue.pop().unwrap();
        assert_eq!(task.status, WorkStatus::Running);
    }

    #[test]
    fn requeue_goes_to_tail_and_increments_retry_count() {
        let queue = WorkStealQueue::new(vec![
            Task::new("1", "first", ""),
            Task::new("2", "second", ""),
        ]);
        let first = queue.pop().unwrap();
        queue.requeue(first, "build failed");

        // second task now comes before the requeued first
        let next = queue.pop().unwrap();
        assert_eq!(next.id, "2");
        let requeued = queue.pop().unwrap();
        assert_eq!(requeued.id, "1");
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.last_failure_reason.as_deref(), Some("build failed"));
    }

    #[test]
    fn drain_empties_queue_and_returns_all_tasks() {
        let queue = WorkStealQueue::new(vec![Task::new("1", "t", ""), Task::new("2", "t", "")]);
        let drained = queue.drain();
        assert_eq!(drained.len(), 2);
        assert!(queue.is_empty());
    }
}
