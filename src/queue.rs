//! Thread-safe min-heap of scheduled events.
//!
//! Ordering is total: earlier arrival first, ties broken by id ascending,
//! so identical timelines always dispatch in the same order.

use std::cmp::Ordering as CmpOrdering;
use std::collections::BinaryHeap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use thiserror::Error;

use crate::events::ScheduledEvent;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue is empty")]
    Empty,

    #[error("queue capacity {capacity} exceeded")]
    Full { capacity: usize },

    #[error("event {0:?} not found")]
    NotFound(String),
}

/// Wrapper with reversed ordering so the std max-heap pops the minimum key.
struct HeapEntry(Arc<ScheduledEvent>);

impl HeapEntry {
    fn key(&self) -> (Duration, &str) {
        (self.0.arrival, self.0.id.as_str())
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other.key().cmp(&self.key())
    }
}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for HeapEntry {}

struct Inner {
    heap: BinaryHeap<HeapEntry>,
    /// 0 means unbounded.
    capacity: usize,
}

pub struct EventQueue {
    inner: Mutex<Inner>,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self::with_capacity(0)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                capacity,
            }),
        }
    }

    pub fn push(&self, event: Arc<ScheduledEvent>) -> Result<(), QueueError> {
        let mut inner = self.lock();
        if inner.capacity != 0 && inner.heap.len() >= inner.capacity {
            return Err(QueueError::Full {
                capacity: inner.capacity,
            });
        }
        inner.heap.push(HeapEntry(event));
        Ok(())
    }

    pub fn pop(&self) -> Result<Arc<ScheduledEvent>, QueueError> {
        self.lock()
            .heap
            .pop()
            .map(|entry| entry.0)
            .ok_or(QueueError::Empty)
    }

    pub fn peek(&self) -> Result<Arc<ScheduledEvent>, QueueError> {
        self.lock()
            .heap
            .peek()
            .map(|entry| Arc::clone(&entry.0))
            .ok_or(QueueError::Empty)
    }

    /// Pops the head only if it is due at `elapsed` since scheduler start.
    /// Single lock acquisition, so a concurrent push cannot slip between
    /// the due-check and the pop.
    pub fn pop_due(&self, elapsed: Duration) -> Option<Arc<ScheduledEvent>> {
        let mut inner = self.lock();
        if inner.heap.peek()?.0.arrival <= elapsed {
            inner.heap.pop().map(|entry| entry.0)
        } else {
            None
        }
    }

    /// Cancels and removes the event with the given id.
    pub fn remove(&self, id: &str) -> Result<(), QueueError> {
        let mut inner = self.lock();
        let mut found = false;
        inner.heap.retain(|entry| {
            if entry.0.id == id {
                entry.0.cancel();
                found = true;
                false
            } else {
                true
            }
        });
        if found {
            Ok(())
        } else {
            Err(QueueError::NotFound(id.to_string()))
        }
    }

    pub fn len(&self) -> usize {
        self.lock().heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().heap.is_empty()
    }

    /// Copy of the queued events in dispatch order. Inspection only.
    pub fn snapshot(&self) -> Vec<Arc<ScheduledEvent>> {
        let inner = self.lock();
        let mut events: Vec<Arc<ScheduledEvent>> =
            inner.heap.iter().map(|entry| Arc::clone(&entry.0)).collect();
        events.sort_by(|a, b| (a.arrival, &a.id).cmp(&(b.arrival, &b.id)));
        events
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().expect("event queue lock poisoned")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventStatus;

    fn delete_event(id: &str, arrival_ms: u64) -> Arc<ScheduledEvent> {
        Arc::new(ScheduledEvent::delete_pod(
            id,
            Duration::from_millis(arrival_ms),
            "default",
            id,
        ))
    }

    #[test]
    fn pops_in_arrival_order() {
        let queue = EventQueue::new();
        for (id, at) in [("c", 500), ("a", 100), ("d", 900), ("b", 300)] {
            queue.push(delete_event(id, at)).unwrap();
        }

        let order: Vec<String> = std::iter::from_fn(|| queue.pop().ok())
            .map(|e| e.id.clone())
            .collect();
        assert_eq!(order, ["a", "b", "c", "d"]);
        assert_eq!(queue.pop().unwrap_err(), QueueError::Empty);
    }

    #[test]
    fn equal_arrivals_tiebreak_by_id() {
        let queue = EventQueue::new();
        queue.push(delete_event("b", 200)).unwrap();
        queue.push(delete_event("a", 200)).unwrap();

        assert_eq!(queue.pop().unwrap().id, "a");
        assert_eq!(queue.pop().unwrap().id, "b");
    }

    #[test]
    fn peek_returns_minimum_without_removing() {
        let queue = EventQueue::new();
        queue.push(delete_event("late", 900)).unwrap();
        queue.push(delete_event("early", 100)).unwrap();

        assert_eq!(queue.peek().unwrap().id, "early");
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn capacity_limit_rejects_push_without_mutation() {
        let queue = EventQueue::with_capacity(2);
        queue.push(delete_event("a", 1)).unwrap();
        queue.push(delete_event("b", 2)).unwrap();

        let err = queue.push(delete_event("c", 3)).unwrap_err();
        assert_eq!(err, QueueError::Full { capacity: 2 });
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.peek().unwrap().id, "a");
    }

    #[test]
    fn remove_cancels_the_event() {
        let queue = EventQueue::new();
        let target = delete_event("gone", 100);
        queue.push(Arc::clone(&target)).unwrap();
        queue.push(delete_event("stays", 200)).unwrap();

        queue.remove("gone").unwrap();
        assert_eq!(target.status(), EventStatus::Canceled);
        assert_eq!(queue.len(), 1);
        assert_eq!(
            queue.remove("gone").unwrap_err(),
            QueueError::NotFound("gone".to_string())
        );
    }

    #[test]
    fn pop_due_respects_arrival() {
        let queue = EventQueue::new();
        queue.push(delete_event("a", 100)).unwrap();
        queue.push(delete_event("b", 5_000)).unwrap();

        assert!(queue.pop_due(Duration::from_millis(50)).is_none());
        assert_eq!(queue.pop_due(Duration::from_millis(150)).unwrap().id, "a");
        assert!(queue.pop_due(Duration::from_millis(150)).is_none());
    }

    #[test]
    fn snapshot_is_sorted_and_does_not_mutate() {
        let queue = EventQueue::new();
        queue.push(delete_event("b", 300)).unwrap();
        queue.push(delete_event("a", 100)).unwrap();

        let ids: Vec<String> = queue.snapshot().iter().map(|e| e.id.clone()).collect();
        assert_eq!(ids, ["a", "b"]);
        assert_eq!(queue.len(), 2);
    }
}
