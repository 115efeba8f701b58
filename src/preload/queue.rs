//! Priority queue for pending preload tasks.
//!
//! Tasks are kept in descending priority order. Tasks with equal priority
//! keep their insertion order, so a requeued task goes behind its peers.

use std::collections::VecDeque;

use crate::types::{PreloadStatus, PreloadTask};

/// A priority queue of preload tasks shared by batch workers.
#[derive(Debug, Default)]
pub struct PreloadQueue {
    tasks: VecDeque<PreloadTask>,
}

impl PreloadQueue {
    /// Creates a new empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a queue from tasks, ordering them by priority.
    pub fn from_tasks(tasks: impl IntoIterator<Item = PreloadTask>) -> Self {
        let mut queue = Self::new();
        for task in tasks {
            queue.add(task);
        }
        queue
    }

    /// Adds a task behind every task of equal or higher priority.
    ///
    /// Returns the position the task was inserted at.
    pub fn add(&mut self, task: PreloadTask) -> usize {
        let position = self
            .tasks
            .iter()
            .position(|t| t.priority < task.priority)
            .unwrap_or(self.tasks.len());
        self.tasks.insert(position, task);
        position
    }

    /// Puts a failed task back for another attempt.
    pub fn requeue(&mut self, mut task: PreloadTask) -> usize {
        task.status = PreloadStatus::Pending;
        self.add(task)
    }

    /// Removes and returns the highest priority task.
    pub fn pop_next(&mut self) -> Option<PreloadTask> {
        self.tasks.pop_front()
    }

    /// Returns the number of queued tasks.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}
