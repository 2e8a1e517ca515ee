//! Port I/O: the per-queue burst interface the cores drive, and the
//! port-level handle the driver programs.

use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};

use smallvec::SmallVec;

use crate::classify::{classify, PacketClass};
use crate::error::EngineError;
use crate::packet::PacketBuf;
use crate::wire;

pub mod soft;
pub mod udp;

pub use soft::SoftPort;
pub use udp::UdpPort;

pub const BURST_INLINE: usize = 32;

/// A batch of buffers handed to or taken from a queue in one call.
pub type Burst = SmallVec<[PacketBuf; BURST_INLINE]>;

/// Burst I/O on one exclusively owned (RX queue, TX queue) pair of a port.
pub trait PortIo: Send {
    fn port_id(&self) -> u16;

    fn tx_queue(&self) -> Option<u16>;

    fn rx_queue(&self) -> Option<u16>;

    /// Non-blocking. Sends buffers from the front of `pkts` and removes the
    /// ones the queue accepted; the rest stay in `pkts`, still owned by the
    /// caller. Returns how many were accepted.
    fn send_burst(&mut self, pkts: &mut Burst) -> usize;

    /// Append up to `max` received buffers to `out`.
    fn receive_burst(&mut self, max: usize, out: &mut Burst) -> usize;

    fn link_up(&self) -> bool;

    fn stats(&self) -> PortStats;
}

/// Port-level handle: queue ownership, link, steering and counters.
pub trait NicPort: Send + Sync {
    fn id(&self) -> u16;

    /// Name of the driver family backing this port.
    fn driver_name(&self) -> &str;

    fn rx_queue_count(&self) -> u16;

    fn tx_queue_count(&self) -> u16;

    fn link_up(&self) -> bool;

    /// Claim queues for exclusive use. Claims are released when the returned
    /// handle is dropped.
    fn open_queues(&self, rx: Option<u16>, tx: Option<u16>) -> Result<Box<dyn PortIo>, EngineError>;

    fn steering(&self) -> &SteeringState;

    fn counters(&self) -> &PortCounters;
}

/// Port counters. One writer per field in steady state; readers may see
/// slightly stale values.
#[derive(Debug, Default)]
pub struct PortCounters {
    pub opackets: AtomicU64,
    pub obytes: AtomicU64,
    pub ipackets: AtomicU64,
    pub ibytes: AtomicU64,
    /// Frames the TX queue refused.
    pub oerrors: AtomicU64,
    /// Bad or oversize frames dropped by the receive filter.
    pub ierrors: AtomicU64,
    /// Frames lost because the RX queue was full.
    pub imissed: AtomicU64,
    /// Frames discarded by the drop queue.
    pub hw_drops: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PortStats {
    pub opackets: u64,
    pub obytes: u64,
    pub ipackets: u64,
    pub ibytes: u64,
    pub oerrors: u64,
    pub ierrors: u64,
    pub imissed: u64,
    pub hw_drops: u64,
}

impl PortCounters {
    #[inline]
    pub fn record_tx(&self, bytes: usize) {
        self.opackets.fetch_add(1, Ordering::Relaxed);
        self.obytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    #[inline]
    pub fn record_rx(&self, bytes: usize) {
        self.ipackets.fetch_add(1, Ordering::Relaxed);
        self.ibytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> PortStats {
        PortStats {
            opackets: self.opackets.load(Ordering::Relaxed),
            obytes: self.obytes.load(Ordering::Relaxed),
            ipackets: self.ipackets.load(Ordering::Relaxed),
            ibytes: self.ibytes.load(Ordering::Relaxed),
            oerrors: self.oerrors.load(Ordering::Relaxed),
            ierrors: self.ierrors.load(Ordering::Relaxed),
            imissed: self.imissed.load(Ordering::Relaxed),
            hw_drops: self.hw_drops.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for counter in [
            &self.opackets,
            &self.obytes,
            &self.ipackets,
            &self.ibytes,
            &self.oerrors,
            &self.ierrors,
            &self.imissed,
            &self.hw_drops,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

/// Receive steering rules, as a driver would program them into the NIC.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxSteering {
    pub drop_errors: bool,
    pub latency_queue: Option<u16>,
    /// Discard whatever lands on queue 0.
    pub drop_queue: bool,
    /// Queues `[start, end)` sharing ordinary traffic by flow hash. Empty
    /// sends ordinary traffic to queue 0.
    pub rss_start: u16,
    pub rss_end: u16,
}

const NO_QUEUE: u16 = u16::MAX;

/// Steering rules held in atomics so the receive path never takes a lock.
#[derive(Debug)]
pub struct SteeringState {
    enabled: AtomicBool,
    promiscuous: AtomicBool,
    drop_errors: AtomicBool,
    drop_queue: AtomicBool,
    latency_queue: AtomicU16,
    rss_start: AtomicU16,
    rss_end: AtomicU16,
}

impl Default for SteeringState {
    fn default() -> Self {
        Self {
            enabled: AtomicBool::new(false),
            promiscuous: AtomicBool::new(false),
            drop_errors: AtomicBool::new(false),
            drop_queue: AtomicBool::new(false),
            latency_queue: AtomicU16::new(NO_QUEUE),
            rss_start: AtomicU16::new(0),
            rss_end: AtomicU16::new(0),
        }
    }
}

/// Where the receive filter puts one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SteerDecision {
    Queue { queue: u16, rss_hash: Option<u32> },
    DropError,
    DropQueue,
}

impl SteeringState {
    pub fn program(&self, rules: Option<RxSteering>) {
        match rules {
            Some(r) => {
                self.drop_errors.store(r.drop_errors, Ordering::Relaxed);
                self.drop_queue.store(r.drop_queue, Ordering::Relaxed);
                self.latency_queue.store(r.latency_queue.unwrap_or(NO_QUEUE), Ordering::Relaxed);
                self.rss_start.store(r.rss_start, Ordering::Relaxed);
                self.rss_end.store(r.rss_end, Ordering::Relaxed);
                self.enabled.store(true, Ordering::Release);
            }
            None => {
                self.enabled.store(false, Ordering::Release);
                self.drop_errors.store(false, Ordering::Relaxed);
                self.drop_queue.store(false, Ordering::Relaxed);
                self.latency_queue.store(NO_QUEUE, Ordering::Relaxed);
                self.rss_start.store(0, Ordering::Relaxed);
                self.rss_end.store(0, Ordering::Relaxed);
            }
        }
    }

    pub fn current(&self) -> Option<RxSteering> {
        if !self.enabled.load(Ordering::Acquire) {
            return None;
        }
        let latency = self.latency_queue.load(Ordering::Relaxed);
        Some(RxSteering {
            drop_errors: self.drop_errors.load(Ordering::Relaxed),
            latency_queue: (latency != NO_QUEUE).then_some(latency),
            drop_queue: self.drop_queue.load(Ordering::Relaxed),
            rss_start: self.rss_start.load(Ordering::Relaxed),
            rss_end: self.rss_end.load(Ordering::Relaxed),
        })
    }

    pub fn set_promiscuous(&self, on: bool) {
        self.promiscuous.store(on, Ordering::Relaxed);
    }

    pub fn promiscuous(&self) -> bool {
        self.promiscuous.load(Ordering::Relaxed)
    }

    /// Choose the RX queue for `frame` on a port with `rx_queues` queues.
    pub fn decide(&self, frame: &[u8], rx_queues: u16) -> SteerDecision {
        if self.promiscuous() || !self.enabled.load(Ordering::Acquire) {
            return SteerDecision::Queue { queue: 0, rss_hash: None };
        }
        let class = classify(frame);
        if class == PacketClass::Malformed && self.drop_errors.load(Ordering::Relaxed) {
            return SteerDecision::DropError;
        }
        let latency = self.latency_queue.load(Ordering::Relaxed);
        if class.is_latency_core_bound() && latency < rx_queues {
            return SteerDecision::Queue { queue: latency, rss_hash: None };
        }
        let start = self.rss_start.load(Ordering::Relaxed);
        let end = self.rss_end.load(Ordering::Relaxed).min(rx_queues);
        if start < end {
            let hash = flow_hash(frame);
            let queue = start + (hash % u32::from(end - start)) as u16;
            return SteerDecision::Queue { queue, rss_hash: Some(hash) };
        }
        if self.drop_queue.load(Ordering::Relaxed) {
            return SteerDecision::DropQueue;
        }
        SteerDecision::Queue { queue: 0, rss_hash: None }
    }
}

/// FNV-1a over addresses, protocol and L4 ports. Non-IPv4 frames hash to 0.
pub fn flow_hash(frame: &[u8]) -> u32 {
    let Ok(view) = wire::parse_ipv4(frame) else {
        return 0;
    };
    let mut h: u32 = 0x811c_9dc5;
    let mut mix = |bytes: &[u8]| {
        for b in bytes {
            h ^= u32::from(*b);
            h = h.wrapping_mul(0x0100_0193);
        }
    };
    mix(&view.src.octets());
    mix(&view.dst.octets());
    mix(&[view.protocol]);
    let l4 = view.l4(frame);
    if l4.len() >= 4 {
        mix(&l4[..4]);
    }
    h
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wire::{build_sctp, build_udp, FlowTuple};
    use std::net::Ipv4Addr;

    fn udp(src_port: u16) -> Vec<u8> {
        let flow = FlowTuple {
            src: Ipv4Addr::new(16, 0, 0, 1),
            dst: Ipv4Addr::new(48, 0, 0, 1),
            src_port,
            dst_port: 80,
        };
        build_udp(&flow, &[], 64).to_vec()
    }

    fn hardware_rules() -> RxSteering {
        RxSteering {
            drop_errors: true,
            latency_queue: Some(1),
            drop_queue: true,
            rss_start: 2,
            rss_end: 4,
        }
    }

    #[test]
    fn test_unprogrammed_port_uses_queue_zero() {
        let state = SteeringState::default();
        assert_eq!(state.decide(&udp(1), 4), SteerDecision::Queue { queue: 0, rss_hash: None });
        assert_eq!(state.current(), None);
    }

    #[test]
    fn test_latency_steered_to_reserved_queue() {
        let state = SteeringState::default();
        state.program(Some(hardware_rules()));
        let probe = build_sctp(Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(2, 2, 2, 2), &[0; 16], 64);
        assert_eq!(state.decide(&probe, 4), SteerDecision::Queue { queue: 1, rss_hash: None });
        assert_eq!(state.current(), Some(hardware_rules()));
    }

    #[test]
    fn test_rss_spreads_and_is_stable() {
        let state = SteeringState::default();
        state.program(Some(hardware_rules()));
        let mut seen = std::collections::HashSet::new();
        for port in 1000..1064 {
            let frame = udp(port);
            let first = state.decide(&frame, 4);
            assert_eq!(first, state.decide(&frame, 4));
            if let SteerDecision::Queue { queue, rss_hash } = first {
                assert!((2..4).contains(&queue));
                assert!(rss_hash.is_some());
                seen.insert(queue);
            } else {
                panic!("ordinary traffic dropped");
            }
        }
        assert_eq!(seen.len(), 2);
    }

    #[test]
    fn test_errors_and_drop_queue() {
        let state = SteeringState::default();
        state.program(Some(RxSteering { rss_start: 0, rss_end: 0, ..hardware_rules() }));
        assert_eq!(state.decide(&udp(1)[..30], 4), SteerDecision::DropError);
        assert_eq!(state.decide(&udp(1), 4), SteerDecision::DropQueue);

        state.set_promiscuous(true);
        assert_eq!(state.decide(&udp(1)[..30], 4), SteerDecision::Queue { queue: 0, rss_hash: None });
    }

    #[test]
    fn test_counter_reset() {
        let counters = PortCounters::default();
        counters.record_tx(100);
        counters.record_rx(60);
        assert_eq!(counters.snapshot().obytes, 100);
        counters.reset();
        assert_eq!(counters.snapshot(), PortStats::default());
    }
}
