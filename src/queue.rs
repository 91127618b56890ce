//! Unbounded, interruptible FIFO used to hand spills from device threads to the MCA worker.
//!
//! # Contract
//!
//! - [`SpillQueue::push`] never blocks. Devices are the rate source, so no backpressure
//!   is applied here.
//! - [`SpillQueue::pop`] blocks until an item arrives, the timeout elapses, or the
//!   caller's cancel flag becomes true. The wait is cut into slices of at most
//!   `poll_interval` so that a cancel request is observed within one slice even if
//!   nobody calls [`SpillQueue::wake_all`].
//! - Items are moved in and moved out. The queue never inspects or clones them.
//!
//! Items from one producer come out in the order they went in. Interleaving between
//! producers is unspecified.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

/// Default slice length for cancellable waits.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Outcome of [`SpillQueue::pop`].
#[derive(Debug, PartialEq, Eq)]
pub enum Popped<T> {
    /// An item was removed from the front of the queue.
    Item(T),
    /// The timeout elapsed with the queue still empty.
    TimedOut,
    /// The cancel flag was observed while the queue was empty.
    Cancelled,
}

impl<T> Popped<T> {
    /// The item, if one was popped.
    pub fn into_item(self) -> Option<T> {
        match self {
            Popped::Item(item) => Some(item),
            Popped::TimedOut | Popped::Cancelled => None,
        }
    }
}

/// Thread-safe blocking queue.
#[derive(Debug)]
pub struct SpillQueue<T> {
    items: Mutex<VecDeque<T>>,
    available: Condvar,
    poll_interval: Duration,
}

impl<T> Default for SpillQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> SpillQueue<T> {
    /// Queue with the default 1 s poll slice.
    pub fn new() -> Self {
        Self::with_poll_interval(DEFAULT_POLL_INTERVAL)
    }

    /// Queue with a custom poll slice (clamped to at least 1 ms).
    pub fn with_poll_interval(poll_interval: Duration) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            poll_interval: poll_interval.max(Duration::from_millis(1)),
        }
    }

    /// Slice length used by [`pop`](Self::pop).
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Append an item and wake one waiter.
    pub fn push(&self, item: T) {
        self.items.lock().push_back(item);
        self.available.notify_one();
    }

    /// Remove the front item, waiting up to `timeout` or until `cancel` is set.
    ///
    /// Queued items take precedence over the cancel flag, so a consumer that keeps
    /// popping after cancellation still sees everything that was already pushed.
    pub fn pop(&self, timeout: Duration, cancel: &AtomicBool) -> Popped<T> {
        let deadline = Instant::now().checked_add(timeout);
        let mut items = self.items.lock();

        loop {
            if let Some(item) = items.pop_front() {
                return Popped::Item(item);
            }
            if cancel.load(Ordering::Acquire) {
                return Popped::Cancelled;
            }

            let now = Instant::now();
            let slice = match deadline {
                Some(deadline) if now >= deadline => return Popped::TimedOut,
                Some(deadline) => (deadline - now).min(self.poll_interval),
                None => self.poll_interval,
            };
            self.available.wait_for(&mut items, slice);
        }
    }

    /// Remove the front item without waiting.
    pub fn try_pop(&self) -> Option<T> {
        self.items.lock().pop_front()
    }

    /// Take everything currently queued, in order.
    pub fn drain(&self) -> Vec<T> {
        self.items.lock().drain(..).collect()
    }

    /// Wake every waiter so it re-checks its cancel flag immediately.
    pub fn wake_all(&self) {
        self.available.notify_all();
    }

    /// Number of queued items.
    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    /// No items queued.
    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}
