//! Bounded cross-thread handoff queue.
//!
//! The reactor is single-threaded and never touches this type. It exists
//! for applications that decode packets on the reactor thread and hand the
//! work to other threads (or the reverse).
//!
//! Push and non-blocking pop go straight to a lock-free crossbeam
//! `ArrayQueue`. The mutex/condvar pair is only used to park consumers that
//! asked to wait; producers take the lock just long enough to notify, which
//! closes the window between a consumer's last empty check and its wait.

use crossbeam_queue::ArrayQueue;

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Fixed-capacity MPMC queue with blocking and timed pop.
pub struct BoundedQueue<T> {
    items: ArrayQueue<T>,
    lock: Mutex<()>,
    ready: Condvar,
}

impl<T> BoundedQueue<T> {
    /// Create a queue holding at most `capacity` items.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(capacity: usize) -> Self {
        Self {
            items: ArrayQueue::new(capacity),
            lock: Mutex::new(()),
            ready: Condvar::new(),
        }
    }

    /// Append `item`. Returns it back if the queue is full.
    pub fn push(&self, item: T) -> Result<(), T> {
        self.items.push(item)?;
        self.wake_one();
        Ok(())
    }

    /// Append every item of `batch`, or none of them if they do not all fit.
    ///
    /// The capacity check and the pushes are not one atomic step, so with
    /// several concurrent producers a batch can still be cut short; the
    /// items that did not fit are handed back.
    pub fn push_batch(&self, batch: Vec<T>) -> Result<(), Vec<T>> {
        if self.items.capacity() - self.items.len() < batch.len() {
            return Err(batch);
        }
        let mut iter = batch.into_iter();
        while let Some(item) = iter.next() {
            if let Err(item) = self.items.push(item) {
                let mut rest = vec![item];
                rest.extend(iter);
                self.wake_all();
                return Err(rest);
            }
        }
        self.wake_all();
        Ok(())
    }

    /// Non-blocking pop.
    #[inline]
    pub fn try_pop(&self) -> Option<T> {
        self.items.pop()
    }

    /// Pop, waiting at most `timeout` for an item.
    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        if let Some(item) = self.items.pop() {
            return Some(item);
        }
        if timeout.is_zero() {
            return None;
        }

        let deadline = Instant::now() + timeout;
        let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(item) = self.items.pop() {
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            guard = match self.ready.wait_timeout(guard, deadline - now) {
                Ok((g, _)) => g,
                Err(e) => e.into_inner().0,
            };
        }
    }

    /// Pop, waiting as long as it takes.
    pub fn pop_blocking(&self) -> T {
        if let Some(item) = self.items.pop() {
            return item;
        }
        let mut guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        loop {
            if let Some(item) = self.items.pop() {
                return item;
            }
            guard = self.ready.wait(guard).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Move everything currently queued into `out`, waiting up to `timeout`
    /// for the first item. Returns the number of items moved.
    pub fn drain_into(&self, out: &mut Vec<T>, timeout: Duration) -> usize {
        let first = match self.pop_timeout(timeout) {
            Some(item) => item,
            None => return 0,
        };
        let before = out.len();
        out.push(first);
        while let Some(item) = self.items.pop() {
            out.push(item);
        }
        out.len() - before
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.items.is_full()
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }

    /// Discard every queued item.
    pub fn clear(&self) {
        while self.items.pop().is_some() {}
    }

    fn wake_one(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.ready.notify_one();
    }

    fn wake_all(&self) {
        let _guard = self.lock.lock().unwrap_or_else(|e| e.into_inner());
        self.ready.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_capacity_is_enforced() {
        let q = BoundedQueue::new(2);
        assert!(q.push(1).is_ok());
        assert!(q.push(2).is_ok());
        assert_eq!(q.push(3), Err(3));
        assert!(q.is_full());
        assert_eq!(q.try_pop(), Some(1));
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn test_batch_all_or_nothing() {
        let q = BoundedQueue::new(3);
        q.push(0).unwrap();
        assert_eq!(q.push_batch(vec![1, 2, 3]), Err(vec![1, 2, 3]));
        assert_eq!(q.len(), 1);
        assert!(q.push_batch(vec![1, 2]).is_ok());
        let mut out = Vec::new();
        assert_eq!(q.drain_into(&mut out, Duration::ZERO), 3);
        assert_eq!(out, vec![0, 1, 2]);
    }

    #[test]
    fn test_pop_timeout_expires() {
        let q: BoundedQueue<u32> = BoundedQueue::new(4);
        let start = Instant::now();
        assert_eq!(q.pop_timeout(Duration::from_millis(30)), None);
        assert!(start.elapsed() >= Duration::from_millis(30));
        assert_eq!(q.pop_timeout(Duration::ZERO), None);
    }

    #[test]
    fn test_blocking_pop_wakes_on_push() {
        let q = Arc::new(BoundedQueue::new(8));
        let consumer = {
            let q = q.clone();
            thread::spawn(move || q.pop_blocking())
        };
        thread::sleep(Duration::from_millis(20));
        q.push(42u64).unwrap();
        assert_eq!(consumer.join().unwrap(), 42);
    }

    #[test]
    fn test_many_producers() {
        let q = Arc::new(BoundedQueue::new(64));
        let mut producers = Vec::new();
        for p in 0..4u64 {
            let q = q.clone();
            producers.push(thread::spawn(move || {
                for i in 0..250u64 {
                    let mut item = p * 1000 + i;
                    loop {
                        match q.push(item) {
                            Ok(()) => break,
                            Err(back) => {
                                item = back;
                                thread::yield_now();
                            }
                        }
                    }
                }
            }));
        }

        let mut seen = Vec::new();
        while seen.len() < 1000 {
            if let Some(v) = q.pop_timeout(Duration::from_secs(5)) {
                seen.push(v);
            } else {
                panic!("producers stalled");
            }
        }
        for p in producers {
            p.join().unwrap();
        }
        seen.sort_unstable();
        seen.dedup();
        assert_eq!(seen.len(), 1000);
    }
}
