// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0
//! # Task Dispatch Queue
//!
//! Priority-major, arrival-minor ordering. A task is inserted before the first
//! queued task with a strictly lower priority, so equal priorities keep their
//! arrival order.

use std::collections::VecDeque;

use autocoder_core::domain::task::{TaskId, TaskPriority};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedTask {
    pub task_id: TaskId,
    pub priority: TaskPriority,
}

#[derive(Debug, Default)]
pub struct TaskQueue {
    entries: VecDeque<QueuedTask>,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, task_id: TaskId, priority: TaskPriority) {
        let position = self
            .entries
            .iter()
            .position(|queued| queued.priority < priority)
            .unwrap_or(self.entries.len());
        self.entries.insert(position, QueuedTask { task_id, priority });
    }

    pub fn pop(&mut self) -> Option<QueuedTask> {
        self.entries.pop_front()
    }

    pub fn remove(&mut self, task_id: TaskId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|queued| queued.task_id != task_id);
        self.entries.len() != before
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedTask> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_major_order() {
        let mut queue = TaskQueue::new();
        let order = [
            TaskPriority::Low,
            TaskPriority::Critical,
            TaskPriority::Medium,
            TaskPriority::High,
        ];
        for priority in order {
            queue.push(TaskId::new(), priority);
        }

        let popped: Vec<TaskPriority> = std::iter::from_fn(|| queue.pop()).map(|q| q.priority).collect();
        assert_eq!(
            popped,
            vec![
                TaskPriority::Critical,
                TaskPriority::High,
                TaskPriority::Medium,
                TaskPriority::Low
            ]
        );
    }

    #[test]
    fn test_ties_keep_arrival_order() {
        let mut queue = TaskQueue::new();
        let first = TaskId::new();
        let second = TaskId::new();
        let urgent = TaskId::new();
        queue.push(first, TaskPriority::High);
        queue.push(second, TaskPriority::High);
        queue.push(urgent, TaskPriority::Critical);

        assert_eq!(queue.pop().unwrap().task_id, urgent);
        assert_eq!(queue.pop().unwrap().task_id, first);
        assert_eq!(queue.pop().unwrap().task_id, second);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_remove() {
        let mut queue = TaskQueue::new();
        let id = TaskId::new();
        queue.push(id, TaskPriority::Low);
        assert!(queue.remove(id));
        assert!(!queue.remove(id));
        assert_eq!(queue.len(), 0);
    }
}
