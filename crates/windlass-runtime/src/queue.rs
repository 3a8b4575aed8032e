//! FIFO pull-queue with pending-set tracking.
//!
//! Ready tasks live in a FIFO; a pulled task moves to the pending table
//! until it is completed or requeued. Requeue increments the attempt number,
//! which is what makes a post-requeue commit carry a fresh idempotency key.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use uuid::Uuid;

use crate::models::Task;

#[derive(Default)]
struct QueueInner {
    ready: VecDeque<Task>,
    pending: HashMap<String, Task>,
}

/// Single-writer owner of the ready FIFO and the pending table.
#[derive(Default)]
pub struct TaskQueue {
    inner: Mutex<QueueInner>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task to the tail; O(1).
    pub fn enqueue(
        &self,
        workflow_id: &str,
        step: &str,
        attempt: u32,
        priority: u32,
        enqueued_at: u64,
    ) -> String {
        let task = Task {
            task_id: Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            step: step.to_string(),
            attempt,
            priority,
            enqueued_at,
        };
        let task_id = task.task_id.clone();
        self.lock().ready.push_back(task);
        task_id
    }

    /// Removes the head and parks it in the pending table.
    pub fn pull(&self) -> Option<Task> {
        let mut inner = self.lock();
        let task = inner.ready.pop_front()?;
        inner.pending.insert(task.task_id.clone(), task.clone());
        Some(task)
    }

    /// Resolves a pending task; true when it was pending.
    pub fn complete(&self, task_id: &str) -> bool {
        self.lock().pending.remove(task_id).is_some()
    }

    /// Moves a pending task back to the tail with its attempt incremented.
    pub fn requeue(&self, task_id: &str) -> bool {
        let mut inner = self.lock();
        match inner.pending.remove(task_id) {
            Some(mut task) => {
                task.attempt += 1;
                inner.ready.push_back(task);
                true
            }
            None => false,
        }
    }

    pub fn depth(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn pending_count(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn list_pending(&self) -> Vec<Task> {
        self.lock().pending.values().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
