//! Bounded FIFO of pending jobs
//!
//! Insertion beyond capacity is an explicit rejection, never a wait and
//! never unbounded growth.

use crate::job::JobId;
use std::collections::VecDeque;

pub(crate) struct PendingQueue {
    items: VecDeque<JobId>,
    capacity: usize,
}

impl PendingQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a job; returns false (leaving the queue untouched) when the
    /// queue is at capacity.
    pub fn push(&mut self, id: JobId) -> bool {
        if self.items.len() >= self.capacity {
            return false;
        }
        self.items.push_back(id);
        true
    }

    /// Removes and returns the oldest pending job.
    pub fn pop(&mut self) -> Option<JobId> {
        self.items.pop_front()
    }

    /// Removes a specific job (queued cancellation). Returns false if the
    /// job was not queued, e.g. already dispatched.
    pub fn remove(&mut self, id: JobId) -> bool {
        match self.items.iter().position(|&queued| queued == id) {
            Some(index) => {
                self.items.remove(index);
                true
            }
            None => false,
        }
    }

    /// Empties the queue, returning the jobs in FIFO order.
    pub fn drain(&mut self) -> Vec<JobId> {
        self.items.drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn test_fifo_order() {
        let mut queue = PendingQueue::new(4);
        let ids: Vec<JobId> = (0..3).map(|_| Uuid::new_v4()).collect();
        for &id in &ids {
            assert!(queue.push(id));
        }
        assert_eq!(queue.pop(), Some(ids[0]));
        assert_eq!(queue.pop(), Some(ids[1]));
        assert_eq!(queue.pop(), Some(ids[2]));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_rejects_at_capacity() {
        let mut queue = PendingQueue::new(2);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        assert!(queue.push(a));
        assert!(queue.push(b));
        assert!(!queue.push(Uuid::new_v4()));
        // The rejected push must not disturb the queue.
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop(), Some(a));
        assert_eq!(queue.pop(), Some(b));
    }

    #[test]
    fn test_remove_preserves_order() {
        let mut queue = PendingQueue::new(4);
        let ids: Vec<JobId> = (0..3).map(|_| Uuid::new_v4()).collect();
        for &id in &ids {
            queue.push(id);
        }
        assert!(queue.remove(ids[1]));
        assert!(!queue.remove(ids[1]));
        assert_eq!(queue.pop(), Some(ids[0]));
        assert_eq!(queue.pop(), Some(ids[2]));
    }

    #[test]
    fn test_drain() {
        let mut queue = PendingQueue::new(4);
        let ids: Vec<JobId> = (0..3).map(|_| Uuid::new_v4()).collect();
        for &id in &ids {
            queue.push(id);
        }
        assert_eq!(queue.drain(), ids);
        assert_eq!(queue.len(), 0);
    }
}
