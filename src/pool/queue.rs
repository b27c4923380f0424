// Copyright (c) 2025 Steve Wagner (ciroque@live.com)
// SPDX-License-Identifier: MIT

//! Priority queue for tasks waiting on an idle isolation context.
//!
//! Higher priority dequeues first. Equal priorities dequeue in submission order, so a task is
//! effectively inserted before the first queued task of strictly lower priority.

use super::task::QueuedTask;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

impl PartialEq for QueuedTask {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for QueuedTask {}

impl PartialOrd for QueuedTask {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedTask {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap: higher priority first, then the older submission
        self.priority
            .cmp(&other.priority)
            .then_with(|| Reverse(self.sequence).cmp(&Reverse(other.sequence)))
    }
}

#[derive(Debug, Default)]
pub(crate) struct TaskQueue {
    heap: BinaryHeap<QueuedTask>,
}

impl TaskQueue {
    pub fn push(&mut self, task: QueuedTask) {
        self.heap.push(task);
    }

    pub fn pop_next(&mut self) -> Option<QueuedTask> {
        self.heap.pop()
    }

    /// Remove a queued task by id. Returns `None` when it is not (or no longer) queued.
    pub fn remove(&mut self, task_id: &str) -> Option<QueuedTask> {
        if !self.heap.iter().any(|task| task.id == task_id) {
            return None;
        }
        let mut tasks = std::mem::take(&mut self.heap).into_vec();
        let position = tasks.iter().position(|task| task.id == task_id)?;
        let removed = tasks.swap_remove(position);
        self.heap = BinaryHeap::from(tasks);
        Some(removed)
    }

    pub fn drain(&mut self) -> Vec<QueuedTask> {
        self.heap.drain().collect()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::time::Instant;

    fn task(id: &str, priority: u8, sequence: u64) -> QueuedTask {
        QueuedTask {
            id: id.to_string(),
            function_name: "f".to_string(),
            input: Value::Null,
            priority,
            sequence,
            created_at: Instant::now(),
        }
    }

    fn drain_ids(queue: &mut TaskQueue) -> Vec<String> {
        std::iter::from_fn(|| queue.pop_next()).map(|t| t.id).collect()
    }

    #[test]
    fn test_higher_priority_first() {
        let mut queue = TaskQueue::default();
        queue.push(task("low", 1, 1));
        queue.push(task("high", 9, 2));
        queue.push(task("mid", 5, 3));

        assert_eq!(drain_ids(&mut queue), vec!["high", "mid", "low"]);
    }

    #[test]
    fn test_equal_priority_is_fifo() {
        let mut queue = TaskQueue::default();
        for (sequence, id) in ["a", "b", "c", "d"].iter().enumerate() {
            queue.push(task(id, 5, sequence as u64));
        }
        queue.push(task("urgent", 10, 10));

        assert_eq!(drain_ids(&mut queue), vec!["urgent", "a", "b", "c", "d"]);
    }

    #[test]
    fn test_requeued_task_keeps_its_place() {
        let mut queue = TaskQueue::default();
        queue.push(task("first", 5, 1));
        queue.push(task("second", 5, 2));

        let first = queue.pop_next().unwrap();
        queue.push(task("third", 5, 3));
        queue.push(first);

        assert_eq!(drain_ids(&mut queue), vec!["first", "second", "third"]);
    }

    #[test]
    fn test_remove_by_id() {
        let mut queue = TaskQueue::default();
        queue.push(task("a", 5, 1));
        queue.push(task("b", 7, 2));
        queue.push(task("c", 3, 3));

        let removed = queue.remove("b").unwrap();
        assert_eq!(removed.id, "b");
        assert!(queue.remove("b").is_none());
        assert!(queue.remove("missing").is_none());
        assert_eq!(queue.len(), 2);
        assert_eq!(drain_ids(&mut queue), vec!["a", "c"]);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_drain_empties_queue() {
        let mut queue = TaskQueue::default();
        queue.push(task("a", 5, 1));
        queue.push(task("b", 5, 2));

        assert_eq!(queue.drain().len(), 2);
        assert!(queue.is_empty());
    }
}
