//! Single-producer/multi-consumer dispatch ring.
//!
//! The main reactor publishes accepted connections at monotonically
//! increasing sequences; one consumer per loop observes every committed
//! sequence in order but claims only those where `seq mod n == its index`.
//! The hot path is a release store of the published cursor and acquire loads
//! by consumers; the mutex/condvar pair is only for parking idle consumers.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex};

/// Slots in the ring. Power of two so the slot index is `seq & MASK`.
pub(crate) const RING_SIZE: usize = 1024;
const RING_MASK: i64 = (RING_SIZE - 1) as i64;

pub(crate) struct DispatchRing<T> {
    slots: Box<[UnsafeCell<Option<T>>]>,
    /// Highest committed sequence; -1 before the first publish.
    published: AtomicI64,
    /// Per-consumer progress: the last sequence each consumer has fully
    /// observed. The producer must not lap the slowest consumer.
    cursors: Box<[CachePadded<AtomicI64>]>,
    closed: AtomicBool,
    park: Mutex<()>,
    unpark: Condvar,
}

// Slot S is written by the single producer before the release store of
// `published`, and read only by the consumer owning S after an acquire load
// observing it. Consumers never touch slots they do not own.
unsafe impl<T: Send> Send for DispatchRing<T> {}
unsafe impl<T: Send> Sync for DispatchRing<T> {}

impl<T> DispatchRing<T> {
    pub(crate) fn new(consumers: usize) -> Self {
        let slots = (0..RING_SIZE)
            .map(|_| UnsafeCell::new(None))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        let cursors = (0..consumers)
            .map(|_| CachePadded::new(AtomicI64::new(-1)))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        DispatchRing {
            slots,
            published: AtomicI64::new(-1),
            cursors,
            closed: AtomicBool::new(false),
            park: Mutex::new(()),
            unpark: Condvar::new(),
        }
    }

    fn min_cursor(&self) -> i64 {
        self.cursors
            .iter()
            .map(|c| c.load(Ordering::Acquire))
            .min()
            .unwrap_or(-1)
    }

    /// Publish `value` at `seq`. Single producer only; `seq` must advance by
    /// one per call. Returns the value back if the ring closed before space
    /// became available.
    pub(crate) fn publish(&self, seq: i64, value: T) -> Result<(), T> {
        // Slot `seq & MASK` still holds `seq - RING_SIZE` until every
        // consumer has moved past it.
        while seq - RING_SIZE as i64 > self.min_cursor() {
            if self.closed.load(Ordering::Acquire) {
                return Err(value);
            }
            std::thread::yield_now();
        }
        unsafe {
            *self.slots[(seq & RING_MASK) as usize].get() = Some(value);
        }
        self.published.store(seq, Ordering::Release);
        let _guard = self.park.lock();
        self.unpark.notify_all();
        Ok(())
    }

    /// Claim the value at `seq`. Only the owning consumer may call this.
    pub(crate) fn take(&self, seq: i64) -> Option<T> {
        unsafe { (*self.slots[(seq & RING_MASK) as usize].get()).take() }
    }

    /// Block until a sequence at or beyond `next` has been published.
    /// Returns `None` once the ring is closed and fully drained.
    pub(crate) fn wait_published(&self, next: i64) -> Option<i64> {
        loop {
            let published = self.published.load(Ordering::Acquire);
            if published >= next {
                return Some(published);
            }
            if self.closed.load(Ordering::Acquire) {
                return None;
            }
            let mut guard = self.park.lock();
            // Recheck under the lock so a publish between the load above and
            // the park cannot be missed.
            if self.published.load(Ordering::Acquire) >= next || self.closed.load(Ordering::Acquire)
            {
                continue;
            }
            let _ = self
                .unpark
                .wait_for(&mut guard, Duration::from_millis(100));
        }
    }

    /// Record that `consumer` has observed everything up to `seq`.
    pub(crate) fn advance(&self, consumer: usize, seq: i64) {
        self.cursors[consumer].store(seq, Ordering::Release);
    }

    /// Close the ring, unparking all consumers. Published-but-unclaimed
    /// entries remain until [`drain_remaining`](Self::drain_remaining).
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let _guard = self.park.lock();
        self.unpark.notify_all();
    }

    /// Hand every still-occupied slot to `f`. Call only after all consumers
    /// have exited.
    pub(crate) fn drain_remaining(&self, mut f: impl FnMut(T)) {
        for slot in self.slots.iter() {
            if let Some(value) = unsafe { (*slot.get()).take() } {
                f(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn round_robin_claim_counts() {
        // K accepts over N consumers: consumer i owns ceil((K - i) / N).
        let n = 3usize;
        let k = 32i64;
        let ring = DispatchRing::<i64>::new(n);
        for seq in 0..k {
            ring.publish(seq, seq * 10).unwrap();
        }
        let mut counts = vec![0usize; n];
        for (idx, count) in counts.iter_mut().enumerate() {
            for seq in 0..k {
                if (seq % n as i64) as usize == idx {
                    assert_eq!(ring.take(seq), Some(seq * 10));
                    *count += 1;
                }
            }
        }
        for (i, count) in counts.iter().enumerate() {
            let expected = (k as usize - i).div_ceil(n);
            assert_eq!(*count, expected, "consumer {}", i);
        }
    }

    #[test]
    fn take_is_at_most_once() {
        let ring = DispatchRing::<u32>::new(1);
        ring.publish(0, 7).unwrap();
        assert_eq!(ring.take(0), Some(7));
        assert_eq!(ring.take(0), None);
    }

    #[test]
    fn consumers_drain_across_threads() {
        let n = 4usize;
        let total = 4096i64;
        let ring = Arc::new(DispatchRing::<i64>::new(n));

        let consumers: Vec<_> = (0..n)
            .map(|idx| {
                let ring = ring.clone();
                std::thread::spawn(move || {
                    let mut claimed = Vec::new();
                    let mut next = 0i64;
                    while let Some(published) = ring.wait_published(next) {
                        for seq in next..=published {
                            if (seq % n as i64) as usize == idx {
                                claimed.push(ring.take(seq).expect("owned slot must be occupied"));
                            }
                        }
                        ring.advance(idx, published);
                        next = published + 1;
                    }
                    claimed
                })
            })
            .collect();

        for seq in 0..total {
            ring.publish(seq, seq).unwrap();
        }
        ring.close();

        let mut all: Vec<i64> = consumers
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        let expected: Vec<i64> = (0..total).collect();
        assert_eq!(all, expected);
    }

    #[test]
    fn publish_fails_after_close_when_full() {
        let ring = DispatchRing::<u8>::new(1);
        for seq in 0..RING_SIZE as i64 {
            ring.publish(seq, 1).unwrap();
        }
        ring.close();
        // Consumer never advanced, so the ring is full; publish must give
        // the value back instead of spinning forever.
        assert_eq!(ring.publish(RING_SIZE as i64, 9), Err(9));
    }

    #[test]
    fn drain_remaining_returns_unclaimed() {
        let ring = DispatchRing::<u8>::new(2);
        ring.publish(0, 10).unwrap();
        ring.publish(1, 11).unwrap();
        assert_eq!(ring.take(0), Some(10));
        ring.close();
        let mut left = Vec::new();
        ring.drain_remaining(|v| left.push(v));
        assert_eq!(left, vec![11]);
    }
}
