use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crossbeam_queue::ArrayQueue;

use crate::packet::{Frame, PacketBuf};

/// Free list shared by every buffer taken from one pool.
pub struct PoolShared {
    free: ArrayQueue<Box<Frame>>,
    capacity: usize,
    allocs: AtomicU64,
    alloc_failures: AtomicU64,
}

impl PoolShared {
    pub(crate) fn release(&self, frame: Box<Frame>) {
        // The queue is sized to the pool, so a push cannot fail for a frame
        // that came from here.
        let _ = self.free.push(frame);
    }
}

/// Fixed-size packet buffer pool. Nothing is allocated after construction;
/// an empty pool is an allocation failure, never a fallback to the heap.
#[derive(Clone)]
pub struct MbufPool {
    shared: Arc<PoolShared>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub available: usize,
    pub in_use: usize,
    pub allocs: u64,
    pub alloc_failures: u64,
}

impl MbufPool {
    pub fn new(count: usize) -> Self {
        let count = count.max(1);
        let free = ArrayQueue::new(count);
        for _ in 0..count {
            let _ = free.push(Box::new(Frame::new()));
        }
        Self {
            shared: Arc::new(PoolShared {
                free,
                capacity: count,
                allocs: AtomicU64::new(0),
                alloc_failures: AtomicU64::new(0),
            }),
        }
    }

    /// Take an empty buffer, or `None` when the pool is exhausted.
    pub fn alloc(&self) -> Option<PacketBuf> {
        match self.shared.free.pop() {
            Some(frame) => {
                self.shared.allocs.fetch_add(1, Ordering::Relaxed);
                Some(PacketBuf::from_pool(frame, self.shared.clone()))
            }
            None => {
                self.shared.alloc_failures.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Take a buffer and fill it with `data`.
    pub fn alloc_with(&self, data: &[u8]) -> Option<PacketBuf> {
        let mut buf = self.alloc()?;
        if buf.set_data(data) { Some(buf) } else { None }
    }

    pub fn stats(&self) -> PoolStats {
        let available = self.shared.free.len();
        PoolStats {
            capacity: self.shared.capacity,
            available,
            in_use: self.shared.capacity - available,
            allocs: self.shared.allocs.load(Ordering::Relaxed),
            alloc_failures: self.shared.alloc_failures.load(Ordering::Relaxed),
        }
    }

    pub fn reset_counters(&self) {
        self.shared.allocs.store(0, Ordering::Relaxed);
        self.shared.alloc_failures.store(0, Ordering::Relaxed);
    }
}
