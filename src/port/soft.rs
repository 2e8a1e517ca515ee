use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use crossbeam_queue::ArrayQueue;

use super::{Burst, NicPort, PortCounters, PortIo, PortStats, SteerDecision, SteeringState};
use crate::error::EngineError;
use crate::packet::{PacketBuf, SideBand};

pub const DEFAULT_RX_DEPTH: usize = 1024;

/// In-memory NIC. Ports are created in back-to-back pairs: whatever one
/// transmits arrives on the other, filtered by the receiver's steering.
pub struct SoftPort {
    id: u16,
    driver: String,
    rx: Vec<ArrayQueue<PacketBuf>>,
    tx_queues: u16,
    rx_claims: Vec<AtomicBool>,
    tx_claims: Vec<AtomicBool>,
    link: AtomicBool,
    steering: SteeringState,
    counters: PortCounters,
    this: Weak<SoftPort>,
    peer: OnceLock<Weak<SoftPort>>,
}

impl SoftPort {
    fn new(id: u16, driver: &str, rx_queues: u16, tx_queues: u16, rx_depth: usize) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            id,
            driver: driver.to_string(),
            rx: (0..rx_queues).map(|_| ArrayQueue::new(rx_depth.max(1))).collect(),
            tx_queues,
            rx_claims: (0..rx_queues).map(|_| AtomicBool::new(false)).collect(),
            tx_claims: (0..tx_queues).map(|_| AtomicBool::new(false)).collect(),
            link: AtomicBool::new(true),
            steering: SteeringState::default(),
            counters: PortCounters::default(),
            this: this.clone(),
            peer: OnceLock::new(),
        })
    }

    /// Two ports wired to each other.
    pub fn pair(
        a: u16,
        b: u16,
        driver: &str,
        rx_queues: u16,
        tx_queues: u16,
        rx_depth: usize,
    ) -> (Arc<SoftPort>, Arc<SoftPort>) {
        let pa = SoftPort::new(a, driver, rx_queues, tx_queues, rx_depth);
        let pb = SoftPort::new(b, driver, rx_queues, tx_queues, rx_depth);
        let _ = pa.peer.set(Arc::downgrade(&pb));
        let _ = pb.peer.set(Arc::downgrade(&pa));
        (pa, pb)
    }

    /// `count` ports wired as pairs (0,1), (2,3), ...
    pub fn pairs(
        count: u16,
        driver: &str,
        rx_queues: u16,
        tx_queues: u16,
        rx_depth: usize,
    ) -> Vec<Arc<dyn NicPort>> {
        let mut ports: Vec<Arc<dyn NicPort>> = Vec::with_capacity(usize::from(count));
        for first in (0..count).step_by(2) {
            let (a, b) = SoftPort::pair(first, first + 1, driver, rx_queues, tx_queues, rx_depth);
            ports.push(a);
            ports.push(b);
        }
        ports
    }

    pub fn set_link(&self, up: bool) {
        self.link.store(up, Ordering::Release);
    }

    /// Frames waiting on an RX queue.
    pub fn rx_pending(&self, queue: u16) -> usize {
        self.rx.get(usize::from(queue)).map_or(0, |q| q.len())
    }

    /// Receive-side filter. `Err` hands the frame back when the target RX
    /// queue is full; the sender treats that as TX backpressure.
    fn deliver(&self, mut pkt: PacketBuf) -> Result<(), PacketBuf> {
        let rx_count = self.rx.len() as u16;
        match self.steering.decide(pkt.data(), rx_count) {
            SteerDecision::DropError => {
                self.counters.ierrors.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            SteerDecision::DropQueue => {
                self.counters.hw_drops.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            SteerDecision::Queue { queue, rss_hash } => {
                let Some(ring) = self.rx.get(usize::from(queue)) else {
                    self.counters.hw_drops.fetch_add(1, Ordering::Relaxed);
                    return Ok(());
                };
                let len = pkt.len();
                pkt.port = self.id;
                pkt.queue = queue;
                pkt.side_band = rss_hash.map_or(SideBand::None, SideBand::RssHash);
                match ring.push(pkt) {
                    Ok(()) => {
                        self.counters.record_rx(len);
                        Ok(())
                    }
                    Err(pkt) => {
                        self.counters.imissed.fetch_add(1, Ordering::Relaxed);
                        Err(pkt)
                    }
                }
            }
        }
    }

    fn claim(claims: &[AtomicBool], queue: u16) -> bool {
        claims
            .get(usize::from(queue))
            .is_some_and(|c| c.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire).is_ok())
    }
}

impl NicPort for SoftPort {
    fn id(&self) -> u16 {
        self.id
    }

    fn driver_name(&self) -> &str {
        &self.driver
    }

    fn rx_queue_count(&self) -> u16 {
        self.rx.len() as u16
    }

    fn tx_queue_count(&self) -> u16 {
        self.tx_queues
    }

    fn link_up(&self) -> bool {
        self.link.load(Ordering::Acquire)
    }

    fn open_queues(&self, rx: Option<u16>, tx: Option<u16>) -> Result<Box<dyn PortIo>, EngineError> {
        if let Some(q) = rx {
            if !Self::claim(&self.rx_claims, q) {
                return Err(EngineError::QueueBusy { port: self.id, queue: q });
            }
        }
        if let Some(q) = tx {
            if !Self::claim(&self.tx_claims, q) {
                if let Some(r) = rx {
                    self.rx_claims[usize::from(r)].store(false, Ordering::Release);
                }
                return Err(EngineError::QueueBusy { port: self.id, queue: q });
            }
        }
        Ok(Box::new(SoftQueue { port: self.this.clone(), rx, tx }))
    }

    fn steering(&self) -> &SteeringState {
        &self.steering
    }

    fn counters(&self) -> &PortCounters {
        &self.counters
    }
}

/// Exclusive queue pair of a `SoftPort`.
pub struct SoftQueue {
    port: Weak<SoftPort>,
    rx: Option<u16>,
    tx: Option<u16>,
}

impl PortIo for SoftQueue {
    fn port_id(&self) -> u16 {
        self.port.upgrade().map_or(u16::MAX, |p| p.id)
    }

    fn tx_queue(&self) -> Option<u16> {
        self.tx
    }

    fn rx_queue(&self) -> Option<u16> {
        self.rx
    }

    fn send_burst(&mut self, pkts: &mut Burst) -> usize {
        if self.tx.is_none() || pkts.is_empty() {
            return 0;
        }
        let Some(port) = self.port.upgrade() else {
            return 0;
        };
        let Some(peer) = port.peer.get().and_then(Weak::upgrade) else {
            return 0;
        };
        if !port.link_up() || !peer.link_up() {
            port.counters.oerrors.fetch_add(pkts.len() as u64, Ordering::Relaxed);
            return 0;
        }

        let pending = std::mem::take(pkts);
        let mut sent = 0;
        let mut rest = pending.into_iter();
        while let Some(pkt) = rest.next() {
            let len = pkt.len();
            match peer.deliver(pkt) {
                Ok(()) => {
                    port.counters.record_tx(len);
                    sent += 1;
                }
                Err(pkt) => {
                    pkts.push(pkt);
                    pkts.extend(rest);
                    break;
                }
            }
        }
        if !pkts.is_empty() {
            port.counters.oerrors.fetch_add(pkts.len() as u64, Ordering::Relaxed);
        }
        sent
    }

    fn receive_burst(&mut self, max: usize, out: &mut Burst) -> usize {
        let (Some(q), Some(port)) = (self.rx, self.port.upgrade()) else {
            return 0;
        };
        let Some(ring) = port.rx.get(usize::from(q)) else {
            return 0;
        };
        let mut taken = 0;
        while taken < max {
            match ring.pop() {
                Some(pkt) => {
                    out.push(pkt);
                    taken += 1;
                }
                None => break,
            }
        }
        taken
    }

    fn link_up(&self) -> bool {
        self.port.upgrade().is_some_and(|p| p.link_up())
    }

    fn stats(&self) -> PortStats {
        self.port.upgrade().map(|p| p.counters.snapshot()).unwrap_or_default()
    }
}

impl Drop for SoftQueue {
    fn drop(&mut self) {
        if let Some(port) = self.port.upgrade() {
            if let Some(q) = self.rx {
                port.rx_claims[usize::from(q)].store(false, Ordering::Release);
            }
            if let Some(q) = self.tx {
                port.tx_claims[usize::from(q)].store(false, Ordering::Release);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mbuf_pool::MbufPool;
    use crate::port::RxSteering;
    use crate::wire::{build_udp, FlowTuple};
    use std::net::Ipv4Addr;

    fn frame(src_port: u16) -> Vec<u8> {
        let flow = FlowTuple {
            src: Ipv4Addr::new(16, 0, 0, 1),
            dst: Ipv4Addr::new(48, 0, 0, 1),
            src_port,
            dst_port: 80,
        };
        build_udp(&flow, &[], 64).to_vec()
    }

    fn burst(pool: &MbufPool, n: usize) -> Burst {
        (0..n).map(|i| pool.alloc_with(&frame(1000 + i as u16)).unwrap()).collect()
    }

    #[test]
    fn test_send_within_capacity_sends_all() {
        let pool = MbufPool::new(64);
        let (a, b) = SoftPort::pair(0, 1, "soft", 1, 1, 32);
        let mut tx = a.open_queues(None, Some(0)).unwrap();
        let mut rx = b.open_queues(Some(0), None).unwrap();

        for _ in 0..3 {
            let mut pkts = burst(&pool, 8);
            assert_eq!(tx.send_burst(&mut pkts), 8);
            assert!(pkts.is_empty());
            let mut got = Burst::new();
            assert_eq!(rx.receive_burst(32, &mut got), 8);
            assert!(got.iter().all(|p| p.port == 1 && p.queue == 0));
        }
        assert_eq!(a.counters().snapshot().opackets, 24);
        assert_eq!(b.counters().snapshot().ipackets, 24);
    }

    #[test]
    fn test_send_beyond_capacity_keeps_remainder_in_order() {
        let pool = MbufPool::new(64);
        let (a, b) = SoftPort::pair(0, 1, "soft", 1, 1, 5);
        let mut tx = a.open_queues(None, Some(0)).unwrap();

        let mut pkts = burst(&pool, 8);
        let requested = pkts.len();
        let sent = tx.send_burst(&mut pkts);
        assert_eq!(sent, 5);
        assert_eq!(pkts.len(), requested - sent);
        // Unsent buffers are still ours, first unsent first
        let first_unsent = &pkts[0].data()[34..36];
        assert_eq!(first_unsent, &1005u16.to_be_bytes());
        assert_eq!(b.rx_pending(0), 5);
        assert_eq!(a.counters().snapshot().oerrors, 3);
        assert_eq!(b.counters().snapshot().imissed, 1);
    }

    #[test]
    fn test_queue_claims_are_exclusive() {
        let (a, _b) = SoftPort::pair(0, 1, "soft", 2, 2, 8);
        let first = a.open_queues(Some(1), Some(1)).unwrap();
        assert!(matches!(
            a.open_queues(Some(1), None),
            Err(EngineError::QueueBusy { port: 0, queue: 1 })
        ));
        // A failed tx claim does not leak the rx claim
        assert!(a.open_queues(Some(0), Some(1)).is_err());
        assert!(a.open_queues(Some(0), None).is_ok());
        drop(first);
        assert!(a.open_queues(Some(1), Some(1)).is_ok());
    }

    #[test]
    fn test_link_down_refuses_everything() {
        let pool = MbufPool::new(16);
        let (a, b) = SoftPort::pair(0, 1, "soft", 1, 1, 8);
        let mut tx = a.open_queues(None, Some(0)).unwrap();
        b.set_link(false);
        let mut pkts = burst(&pool, 4);
        assert_eq!(tx.send_burst(&mut pkts), 0);
        assert_eq!(pkts.len(), 4);
    }

    #[test]
    fn test_drop_queue_counts_as_sent() {
        let pool = MbufPool::new(16);
        let (a, b) = SoftPort::pair(0, 1, "soft", 2, 1, 8);
        b.steering().program(Some(RxSteering {
            drop_errors: true,
            latency_queue: Some(1),
            drop_queue: true,
            rss_start: 0,
            rss_end: 0,
        }));
        let mut tx = a.open_queues(None, Some(0)).unwrap();
        let mut pkts = burst(&pool, 4);
        assert_eq!(tx.send_burst(&mut pkts), 4);
        assert_eq!(b.counters().snapshot().hw_drops, 4);
        assert_eq!(pool.stats().in_use, 0);
    }
}
