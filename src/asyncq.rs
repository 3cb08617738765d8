//! Lock-free single-producer single-consumer queue with pollable wakeups.
//!
//! [`AsyncQueue`] is a fixed-capacity, power-of-two-sized ring of boxed
//! items. Cells are `AtomicPtr` slots that cycle between empty and holding
//! exactly one item; two [`FdSem`]s layer blocking semantics and the
//! before/after-poll protocol on top of the wait-free fast path, so a queue
//! can be one of several event sources an RT poll loop sleeps on without
//! busy-polling.
//!
//! # Contract
//!
//! Exactly one producer thread and exactly one consumer thread per instance.
//! This is a documented precondition checked with debug assertions, not a
//! runtime-enforced invariant — the hot path stays wait-free. Full duplex
//! between two threads uses two independent instances.

use crate::error::Result;
use crate::fdsem::FdSem;
use std::os::unix::io::RawFd;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
#[cfg(debug_assertions)]
use std::sync::atomic::AtomicBool;

/// Default capacity when 0 is requested.
pub const DEFAULT_CAPACITY: usize = 128;

/// A wait-free SPSC ring buffer of boxed items.
pub struct AsyncQueue<T> {
    cells: Box<[AtomicPtr<T>]>,
    /// Capacity - 1; capacity is a power of two.
    mask: usize,
    /// Monotonic write position, advanced only by the producer.
    write_idx: AtomicUsize,
    /// Monotonic read position, advanced only by the consumer.
    read_idx: AtomicUsize,
    /// Posted by the consumer after a pop (space available).
    read_sem: FdSem,
    /// Posted by the producer after a push (data available).
    write_sem: FdSem,
    #[cfg(debug_assertions)]
    in_push: AtomicBool,
    #[cfg(debug_assertions)]
    in_pop: AtomicBool,
}

impl<T: Send> AsyncQueue<T> {
    /// Create a queue with the given capacity.
    ///
    /// The capacity is rounded up to the next power of two; 0 selects the
    /// default of [`DEFAULT_CAPACITY`].
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = if capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            capacity.next_power_of_two()
        };
        let cells: Vec<AtomicPtr<T>> = (0..capacity)
            .map(|_| AtomicPtr::new(ptr::null_mut()))
            .collect();
        Ok(Self {
            cells: cells.into_boxed_slice(),
            mask: capacity - 1,
            write_idx: AtomicUsize::new(0),
            read_idx: AtomicUsize::new(0),
            read_sem: FdSem::new()?,
            write_sem: FdSem::new()?,
            #[cfg(debug_assertions)]
            in_push: AtomicBool::new(false),
            #[cfg(debug_assertions)]
            in_pop: AtomicBool::new(false),
        })
    }

    /// The queue capacity.
    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Number of items currently queued (approximate across threads).
    pub fn len(&self) -> usize {
        self.write_idx
            .load(Ordering::Acquire)
            .wrapping_sub(self.read_idx.load(Ordering::Acquire))
    }

    /// Whether the queue is currently empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Try to push an item without blocking (producer side).
    ///
    /// Returns the item back if the queue is full.
    pub fn try_push(&self, item: Box<T>) -> std::result::Result<(), Box<T>> {
        let _guard = self.debug_enter_push();
        self.try_push_inner(item)
    }

    fn try_push_inner(&self, item: Box<T>) -> std::result::Result<(), Box<T>> {
        let idx = self.write_idx.load(Ordering::Relaxed) & self.mask;
        let raw = Box::into_raw(item);
        if self.cells[idx]
            .compare_exchange(ptr::null_mut(), raw, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // SAFETY: the CAS failed, so ownership of `raw` never left us.
            return Err(unsafe { Box::from_raw(raw) });
        }
        self.write_idx.fetch_add(1, Ordering::Release);
        self.write_sem.post();
        Ok(())
    }

    /// Push an item, blocking on the consumer's semaphore while the queue
    /// is full (producer side).
    pub fn push(&self, item: Box<T>) {
        let _guard = self.debug_enter_push();
        let mut item = item;
        loop {
            match self.try_push_inner(item) {
                Ok(()) => return,
                Err(back) => {
                    item = back;
                    self.read_sem.wait();
                }
            }
        }
    }

    /// Try to pop an item without blocking (consumer side).
    pub fn try_pop(&self) -> Option<Box<T>> {
        let _guard = self.debug_enter_pop();
        self.try_pop_inner()
    }

    fn try_pop_inner(&self) -> Option<Box<T>> {
        let idx = self.read_idx.load(Ordering::Relaxed) & self.mask;
        let raw = self.cells[idx].swap(ptr::null_mut(), Ordering::AcqRel);
        if raw.is_null() {
            return None;
        }
        self.read_idx.fetch_add(1, Ordering::Release);
        self.read_sem.post();
        // SAFETY: the slot held exactly one item, published by the producer
        // via the CAS in `try_push_inner`.
        Some(unsafe { Box::from_raw(raw) })
    }

    /// Pop an item, blocking on the producer's semaphore while the queue is
    /// empty (consumer side).
    pub fn pop(&self) -> Box<T> {
        let _guard = self.debug_enter_pop();
        loop {
            if let Some(item) = self.try_pop_inner() {
                return item;
            }
            self.write_sem.wait();
        }
    }

    /// Descriptor that becomes readable when data is available (consumer
    /// side).
    pub fn read_fd(&self) -> RawFd {
        self.write_sem.fd()
    }

    /// Consumer-side first poll phase.
    ///
    /// Returns `true` when an item is already visible (skip the poll);
    /// `false` when armed for polling, to be paired with
    /// [`AsyncQueue::read_after_poll`].
    pub fn read_before_poll(&self) -> bool {
        loop {
            let idx = self.read_idx.load(Ordering::Relaxed) & self.mask;
            if !self.cells[idx].load(Ordering::Acquire).is_null() {
                return true;
            }
            if !self.write_sem.before_poll() {
                return false;
            }
            // The semaphore was already signaled; re-check the cell.
        }
    }

    /// Consumer-side second poll phase; returns `true` if the data signal
    /// was observed.
    pub fn read_after_poll(&self) -> bool {
        self.write_sem.after_poll()
    }

    /// Descriptor that becomes readable when space is available (producer
    /// side).
    pub fn write_fd(&self) -> RawFd {
        self.read_sem.fd()
    }

    /// Producer-side first poll phase: `true` when a free slot is already
    /// available.
    pub fn write_before_poll(&self) -> bool {
        loop {
            let idx = self.write_idx.load(Ordering::Relaxed) & self.mask;
            if self.cells[idx].load(Ordering::Acquire).is_null() {
                return true;
            }
            if !self.read_sem.before_poll() {
                return false;
            }
        }
    }

    /// Producer-side second poll phase.
    pub fn write_after_poll(&self) -> bool {
        self.read_sem.after_poll()
    }

    #[cfg(debug_assertions)]
    fn debug_enter_push(&self) -> DebugGuard<'_> {
        let was = self.in_push.swap(true, Ordering::SeqCst);
        debug_assert!(!was, "concurrent producers on an SPSC queue");
        DebugGuard { flag: &self.in_push }
    }

    #[cfg(not(debug_assertions))]
    fn debug_enter_push(&self) {}

    #[cfg(debug_assertions)]
    fn debug_enter_pop(&self) -> DebugGuard<'_> {
        let was = self.in_pop.swap(true, Ordering::SeqCst);
        debug_assert!(!was, "concurrent consumers on an SPSC queue");
        DebugGuard { flag: &self.in_pop }
    }

    #[cfg(not(debug_assertions))]
    fn debug_enter_pop(&self) {}
}

#[cfg(debug_assertions)]
struct DebugGuard<'a> {
    flag: &'a AtomicBool,
}

#[cfg(debug_assertions)]
impl Drop for DebugGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

impl<T> Drop for AsyncQueue<T> {
    fn drop(&mut self) {
        for cell in self.cells.iter() {
            let raw = cell.swap(ptr::null_mut(), Ordering::AcqRel);
            if !raw.is_null() {
                // SAFETY: the queue is being dropped, nobody else can touch
                // the cells; each non-null cell holds exactly one item.
                drop(unsafe { Box::from_raw(raw) });
            }
        }
    }
}

// SAFETY: items cross threads by ownership transfer through the cells; the
// SPSC contract restricts each side to one thread at a time.
unsafe impl<T: Send> Send for AsyncQueue<T> {}
unsafe impl<T: Send> Sync for AsyncQueue<T> {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_fifo_order() {
        let q: AsyncQueue<u32> = AsyncQueue::new(8).unwrap();
        for i in 0..8 {
            q.try_push(Box::new(i)).unwrap();
        }
        for i in 0..8 {
            assert_eq!(*q.try_pop().unwrap(), i);
        }
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn test_capacity_rounding_and_default() {
        let q: AsyncQueue<u8> = AsyncQueue::new(3).unwrap();
        assert_eq!(q.capacity(), 4);

        let q: AsyncQueue<u8> = AsyncQueue::new(0).unwrap();
        assert_eq!(q.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn test_backpressure_at_capacity_four() {
        let q: AsyncQueue<u32> = AsyncQueue::new(4).unwrap();

        for i in 0..4 {
            assert!(q.try_push(Box::new(i)).is_ok());
        }
        // Fifth non-blocking push fails and hands the item back
        let back = q.try_push(Box::new(4)).unwrap_err();
        assert_eq!(*back, 4);

        // After one pop the push succeeds
        assert_eq!(*q.try_pop().unwrap(), 0);
        assert!(q.try_push(back).is_ok());
    }

    #[test]
    fn test_wraparound() {
        let q: AsyncQueue<u32> = AsyncQueue::new(4).unwrap();
        for round in 0..10u32 {
            for i in 0..4 {
                q.try_push(Box::new(round * 4 + i)).unwrap();
            }
            for i in 0..4 {
                assert_eq!(*q.try_pop().unwrap(), round * 4 + i);
            }
        }
    }

    #[test]
    fn test_threaded_fifo_with_blocking() {
        let q: Arc<AsyncQueue<u64>> = Arc::new(AsyncQueue::new(16).unwrap());
        let q2 = Arc::clone(&q);

        const N: u64 = 10_000;
        let producer = std::thread::spawn(move || {
            for i in 0..N {
                q2.push(Box::new(i));
            }
        });

        for i in 0..N {
            assert_eq!(*q.pop(), i, "FIFO order preserved under contention");
        }
        producer.join().unwrap();
        assert!(q.try_pop().is_none());
    }

    #[test]
    fn test_read_before_poll_sees_queued_item() {
        let q: AsyncQueue<u8> = AsyncQueue::new(4).unwrap();
        q.try_push(Box::new(1)).unwrap();
        assert!(q.read_before_poll(), "data ready cancels the poll");
        assert_eq!(*q.try_pop().unwrap(), 1);
    }

    #[test]
    fn test_read_poll_protocol_catches_racing_push() {
        let q: AsyncQueue<u8> = AsyncQueue::new(4).unwrap();
        assert!(!q.read_before_poll(), "empty queue arms for polling");
        // Push lands while the consumer would be in poll()
        q.try_push(Box::new(9)).unwrap();
        assert!(q.read_after_poll(), "signal observed after the poll");
        assert_eq!(*q.try_pop().unwrap(), 9);
    }

    #[test]
    fn test_write_poll_protocol() {
        let q: AsyncQueue<u8> = AsyncQueue::new(2).unwrap();
        assert!(q.write_before_poll(), "space available, no need to poll");

        q.try_push(Box::new(1)).unwrap();
        q.try_push(Box::new(2)).unwrap();
        assert!(!q.write_before_poll(), "full queue arms for polling");

        assert_eq!(*q.try_pop().unwrap(), 1);
        assert!(q.write_after_poll(), "space signal observed");
    }

    #[test]
    fn test_drop_releases_queued_items() {
        let item = Arc::new(0u8);
        let q: AsyncQueue<Arc<u8>> = AsyncQueue::new(4).unwrap();
        q.try_push(Box::new(Arc::clone(&item))).unwrap();
        q.try_push(Box::new(Arc::clone(&item))).unwrap();
        assert_eq!(Arc::strong_count(&item), 3);
        drop(q);
        assert_eq!(Arc::strong_count(&item), 1);
    }
}
