//! Generic multithreading queue with a producer-registering mechanism.
//!
//! `pop` blocks until an item arrives or every registered producer has called
//! `mark_completed`, so consumers can distinguish "waiting for data" from
//! "no more data will ever come".

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

struct Inner<T> {
    queue: VecDeque<T>,
    n_producers: u32,
}

pub struct RegisteringQueue<T> {
    inner: Mutex<Inner<T>>,
    cv: Condvar,
}

impl<T> RegisteringQueue<T> {
    pub fn new(n_producers: u32) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                n_producers,
            }),
            cv: Condvar::new(),
        }
    }

    pub fn push(&self, item: T) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.push_back(item);
        self.cv.notify_one();
    }

    pub fn push_range(&self, items: Vec<T>) {
        let mut inner = self.inner.lock().unwrap();
        inner.queue.extend(items);
        self.cv.notify_all();
    }

    /// Block until an item is available or all producers are done.
    /// Returns `None` only when the queue is drained and completed.
    pub fn pop(&self) -> Option<T> {
        let mut inner = self.inner.lock().unwrap();
        loop {
            if let Some(item) = inner.queue.pop_front() {
                return Some(item);
            }
            if inner.n_producers == 0 {
                return None;
            }
            inner = self.cv.wait(inner).unwrap();
        }
    }

    /// One producer signals it will push no further items.
    pub fn mark_completed(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.n_producers = inner.n_producers.saturating_sub(1);
        if inner.n_producers == 0 {
            self.cv.notify_all();
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().unwrap().queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let q = RegisteringQueue::new(1);
        q.push(1);
        q.push(2);
        q.push(3);
        q.mark_completed();
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn test_consumers_drain_then_terminate() {
        let q = Arc::new(RegisteringQueue::new(1));
        let n_items = 1000u32;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let q = Arc::clone(&q);
                std::thread::spawn(move || {
                    let mut seen = 0u32;
                    while q.pop().is_some() {
                        seen += 1;
                    }
                    seen
                })
            })
            .collect();

        for i in 0..n_items {
            q.push(i);
        }
        q.mark_completed();

        let total: u32 = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(total, n_items);
    }

    #[test]
    fn test_pop_blocks_until_push() {
        let q = Arc::new(RegisteringQueue::new(1));
        let q2 = Arc::clone(&q);
        let h = std::thread::spawn(move || q2.pop());
        std::thread::sleep(std::time::Duration::from_millis(20));
        q.push(7u32);
        assert_eq!(h.join().unwrap(), Some(7));
    }
}
