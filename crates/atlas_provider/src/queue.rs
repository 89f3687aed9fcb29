//! Bounded concurrent request queue
//!
//! Gates how many low-level fetches run at once. Requests past the limit
//! wait in arrival order and are admitted as slots free, preserving FIFO
//! fairness. Each runtime instance owns its own queue; independent
//! runtimes never share concurrency limits.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::Mutex;

struct QueueInner {
    limit: usize,
    active: HashSet<u64>,
    waiting: VecDeque<u64>,
    next_id: u64,
}

impl QueueInner {
    fn admit(&mut self) {
        while self.limit == 0 || self.active.len() < self.limit {
            match self.waiting.pop_front() {
                Some(id) => {
                    self.active.insert(id);
                }
                None => break,
            }
        }
    }
}

/// FIFO admission queue with a concurrency limit. A limit of zero means
/// unbounded.
pub struct RequestQueue {
    inner: Mutex<QueueInner>,
}

impl RequestQueue {
    pub fn new(limit: usize) -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(QueueInner {
                limit,
                active: HashSet::new(),
                waiting: VecDeque::new(),
                next_id: 1,
            }),
        })
    }

    /// Join the queue. The returned slot reports `ready` once admitted
    /// and gives its place back when dropped.
    pub fn enqueue(self: &Arc<Self>) -> QueueSlot {
        let mut inner = self.inner.lock();
        let id = inner.next_id;
        inner.next_id += 1;
        inner.waiting.push_back(id);
        inner.admit();
        QueueSlot {
            queue: self.clone(),
            id,
        }
    }

    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    pub fn waiting_count(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    fn is_admitted(&self, id: u64) -> bool {
        let mut inner = self.inner.lock();
        inner.admit();
        inner.active.contains(&id)
    }

    fn leave(&self, id: u64) {
        let mut inner = self.inner.lock();
        if !inner.active.remove(&id) {
            inner.waiting.retain(|&w| w != id);
        }
        inner.admit();
    }
}

/// A place in the request queue.
pub struct QueueSlot {
    queue: Arc<RequestQueue>,
    id: u64,
}

impl QueueSlot {
    /// Whether this request has been admitted into the active set
    pub fn ready(&self) -> bool {
        self.queue.is_admitted(self.id)
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        self.queue.leave(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_admits_up_to_limit() {
        let queue = RequestQueue::new(2);
        let a = queue.enqueue();
        let b = queue.enqueue();
        let c = queue.enqueue();

        assert!(a.ready());
        assert!(b.ready());
        assert!(!c.ready());
        assert_eq!(queue.active_count(), 2);
        assert_eq!(queue.waiting_count(), 1);
    }

    #[test]
    fn test_fifo_admission_as_slots_free() {
        let queue = RequestQueue::new(1);
        let a = queue.enqueue();
        let b = queue.enqueue();
        let c = queue.enqueue();

        assert!(a.ready());
        assert!(!b.ready() && !c.ready());

        drop(a);
        // b entered the queue first, so b is admitted before c
        assert!(b.ready());
        assert!(!c.ready());

        drop(b);
        assert!(c.ready());
    }

    #[test]
    fn test_abandoning_a_waiting_slot_keeps_order() {
        let queue = RequestQueue::new(1);
        let a = queue.enqueue();
        let b = queue.enqueue();
        let c = queue.enqueue();

        drop(b);
        drop(a);
        assert!(c.ready());
        assert_eq!(queue.waiting_count(), 0);
    }

    #[test]
    fn test_zero_limit_is_unbounded() {
        let queue = RequestQueue::new(0);
        let slots: Vec<_> = (0..16).map(|_| queue.enqueue()).collect();
        assert!(slots.iter().all(|s| s.ready()));
    }
}
