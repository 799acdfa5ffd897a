//! Release-time priority queue
//!
//! A min-heap of items keyed by their release time on the packet clock.
//! Ties are broken by insertion order, so two packets scheduled for the
//! same millisecond leave in submission order.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::clock::PacketClock;

/// Default high-water mark (entries) before tail-drop
pub const DEFAULT_HIGH_WATER: usize = 4096;

struct Entry<T> {
    release_at_ms: u64,
    seq: u64,
    item: T,
}

// Reversed ordering turns the std max-heap into a min-heap on
// (release_at_ms, seq).
impl<T> Ord for Entry<T> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .release_at_ms
            .cmp(&self.release_at_ms)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl<T> PartialOrd for Entry<T> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl<T> PartialEq for Entry<T> {
    fn eq(&self, other: &Self) -> bool {
        self.release_at_ms == other.release_at_ms && self.seq == other.seq
    }
}

impl<T> Eq for Entry<T> {}

struct Inner<T> {
    heap: BinaryHeap<Entry<T>>,
    next_seq: u64,
}

/// Thread-safe delay queue
///
/// `push` never blocks; draining is available in non-blocking
/// ([`pop_ready`](Self::pop_ready)) and bounded-wait
/// ([`pop_ready_blocking`](Self::pop_ready_blocking)) forms.
pub struct DelayQueue<T> {
    inner: Mutex<Inner<T>>,
    notify: Notify,
    clock: Arc<dyn PacketClock>,
    high_water: usize,
}

impl<T> DelayQueue<T> {
    /// Create a queue on the given clock with a high-water mark
    pub fn new(clock: Arc<dyn PacketClock>, high_water: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_seq: 0,
            }),
            notify: Notify::new(),
            clock,
            high_water,
        }
    }

    /// Schedule an item for release at `release_at_ms`
    ///
    /// Returns `false` (tail-drop) when the queue is at its high-water
    /// mark; the caller accounts the drop. Wakes any blocked drainer.
    pub fn push(&self, item: T, release_at_ms: u64) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner.heap.len() >= self.high_water {
                return false;
            }
            let seq = inner.next_seq;
            inner.next_seq += 1;
            inner.heap.push(Entry {
                release_at_ms,
                seq,
                item,
            });
        }
        self.notify.notify_one();
        true
    }

    /// Pop the head iff its release time has arrived
    pub fn pop_ready(&self) -> Option<T> {
        let mut inner = self.inner.lock();
        let now = self.clock.now_ms();
        match inner.heap.peek() {
            Some(head) if head.release_at_ms <= now => inner.heap.pop().map(|e| e.item),
            _ => None,
        }
    }

    /// Wait until the head becomes ready or `max_wait_ms` elapses
    ///
    /// When the head is scheduled at `t`, the sleep is
    /// `min(t - now, remaining budget)`; state is re-checked under the lock
    /// after every wake. `None` means the wait budget ran out (or the
    /// future was cancelled) with nothing ready.
    pub async fn pop_ready_blocking(&self, max_wait_ms: u64) -> Option<T> {
        let deadline = self.clock.now_ms().saturating_add(max_wait_ms);
        loop {
            // Arm the wakeup before the locked check so a push landing
            // between the check and the await still wakes us.
            let notified = self.notify.notified();

            let wait_ms = {
                let mut inner = self.inner.lock();
                let now = self.clock.now_ms();
                match inner.heap.peek() {
                    Some(head) if head.release_at_ms <= now => {
                        return inner.heap.pop().map(|e| e.item);
                    }
                    Some(head) => {
                        if now >= deadline {
                            return None;
                        }
                        (head.release_at_ms - now).min(deadline - now)
                    }
                    None => {
                        if now >= deadline {
                            return None;
                        }
                        deadline - now
                    }
                }
            };

            tokio::select! {
                () = notified => {}
                () = tokio::time::sleep(Duration::from_millis(wait_ms)) => {}
            }
        }
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.inner.lock().heap.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop everything queued (used on shutdown)
    pub fn clear(&self) {
        self.inner.lock().heap.clear();
        self.notify.notify_one();
    }
}
