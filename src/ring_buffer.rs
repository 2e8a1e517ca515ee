use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;
use crossbeam_utils::{Backoff, CachePadded};
use smallvec::{Array, SmallVec};

pub use crate::error::RingFull;

/// Ring counters, kept apart from the slots so the master can monitor rings
/// of any message type.
pub struct RingCounters {
    name: String,
    capacity: usize,
    // Producer and consumer counters live on separate cache lines
    produced: CachePadded<AtomicU64>,
    consumed: CachePadded<AtomicU64>,
    full_events: CachePadded<AtomicU64>,
}

struct RingShared<T> {
    slots: ArrayQueue<T>,
    counters: Arc<RingCounters>,
}

/// Write half of a single-producer/single-consumer ring. Not `Clone`: exactly
/// one core produces into a ring.
pub struct RingProducer<T> {
    shared: Arc<RingShared<T>>,
}

/// Read half of a ring. Not `Clone`.
pub struct RingConsumer<T> {
    shared: Arc<RingShared<T>>,
}

/// Read-only view of a ring's counters.
#[derive(Clone)]
pub struct RingMonitor {
    counters: Arc<RingCounters>,
}

#[derive(Debug, Clone)]
pub struct RingBufferStats {
    pub name: String,
    pub capacity: usize,
    pub produced: u64,
    pub consumed: u64,
    pub occupancy: u64,
    pub full_events: u64,
    pub utilization: f64,
}

/// Create a bounded ring holding up to `capacity` messages.
pub fn ring<T>(name: &str, capacity: usize) -> (RingProducer<T>, RingConsumer<T>) {
    let capacity = capacity.max(1);
    let shared = Arc::new(RingShared {
        slots: ArrayQueue::new(capacity),
        counters: Arc::new(RingCounters {
            name: name.to_string(),
            capacity,
            produced: CachePadded::new(AtomicU64::new(0)),
            consumed: CachePadded::new(AtomicU64::new(0)),
            full_events: CachePadded::new(AtomicU64::new(0)),
        }),
    });
    (RingProducer { shared: shared.clone() }, RingConsumer { shared })
}

impl<T> RingProducer<T> {
    /// Non-blocking enqueue. On success the ring owns `msg`; when full the
    /// message is handed back untouched inside `RingFull`.
    pub fn enqueue(&mut self, msg: T) -> Result<(), RingFull<T>> {
        match self.shared.slots.push(msg) {
            Ok(()) => {
                self.shared.counters.produced.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(msg) => {
                self.shared.counters.full_events.fetch_add(1, Ordering::Relaxed);
                Err(RingFull(msg))
            }
        }
    }

    /// Enqueue, retrying a full ring at most `attempts` times with backoff.
    /// Only for shutdown synchronization; the data path never waits.
    pub fn enqueue_bounded(&mut self, mut msg: T, attempts: u32) -> Result<(), RingFull<T>> {
        let backoff = Backoff::new();
        for _ in 0..attempts.max(1) {
            match self.enqueue(msg) {
                Ok(()) => return Ok(()),
                Err(RingFull(back)) => {
                    msg = back;
                    backoff.snooze();
                }
            }
        }
        Err(RingFull(msg))
    }

    pub fn is_full(&self) -> bool {
        self.shared.slots.is_full()
    }

    pub fn monitor(&self) -> RingMonitor {
        RingMonitor { counters: self.shared.counters.clone() }
    }
}

impl<T> RingConsumer<T> {
    pub fn dequeue(&mut self) -> Option<T> {
        let msg = self.shared.slots.pop()?;
        self.shared.counters.consumed.fetch_add(1, Ordering::Relaxed);
        Some(msg)
    }

    /// Move up to `max` messages into `out`, oldest first.
    pub fn dequeue_burst<A: Array<Item = T>>(&mut self, max: usize, out: &mut SmallVec<A>) -> usize {
        let mut taken = 0;
        while taken < max {
            match self.shared.slots.pop() {
                Some(msg) => {
                    out.push(msg);
                    taken += 1;
                }
                None => break,
            }
        }
        if taken > 0 {
            self.shared.counters.consumed.fetch_add(taken as u64, Ordering::Relaxed);
        }
        taken
    }

    pub fn len(&self) -> usize {
        self.shared.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.slots.is_empty()
    }

    pub fn monitor(&self) -> RingMonitor {
        RingMonitor { counters: self.shared.counters.clone() }
    }
}

impl RingMonitor {
    pub fn name(&self) -> &str {
        &self.counters.name
    }

    pub fn get_stats(&self) -> RingBufferStats {
        let c = &self.counters;
        let produced = c.produced.load(Ordering::Relaxed);
        let consumed = c.consumed.load(Ordering::Relaxed);
        let occupancy = produced.saturating_sub(consumed);
        RingBufferStats {
            name: c.name.clone(),
            capacity: c.capacity,
            produced,
            consumed,
            occupancy,
            full_events: c.full_events.load(Ordering::Relaxed),
            utilization: (occupancy as f64 / c.capacity as f64) * 100.0,
        }
    }
}
