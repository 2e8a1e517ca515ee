use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::driver::ExtendedStats;
use crate::latency::manager::LatencyReport;
use crate::mbuf_pool::PoolStats;
use crate::port::PortStats;
use crate::ring_buffer::RingBufferStats;

/// Counters of one data-plane core. Only that core writes them; the master
/// reads without locking and tolerates slightly stale values.
#[repr(C, align(64))]
#[derive(Debug, Default)]
pub struct CoreCounters {
    pub tx_packets: AtomicU64,
    pub tx_bytes: AtomicU64,
    pub rx_packets: AtomicU64,
    pub rx_bytes: AtomicU64,
    /// Bursts that came back partially sent.
    pub tx_queue_full: AtomicU64,
    /// Retry passes spent on partial sends.
    pub tx_retries: AtomicU64,
    /// Packets given up on after the retry budget.
    pub tx_dropped: AtomicU64,
    pub alloc_failures: AtomicU64,
    /// Latency and verification packets handed to the latency core.
    pub forwarded: AtomicU64,
    /// Forwarding attempts refused by a full ring.
    pub ring_full_drops: AtomicU64,
    pub rx_malformed: AtomicU64,
    pub rx_check_tagged: AtomicU64,
    /// Status messages lost to a full control ring.
    pub status_drops: AtomicU64,
    /// Latency-bound packets received with no ring to the latency core.
    pub latency_unrouted: AtomicU64,
    /// Server packet slots spent waiting for a flow's translation.
    pub nat_held: AtomicU64,
    /// Translations for flows that were not waiting for one.
    pub nat_lookup_no_flow: AtomicU64,
    /// Translations that changed the client address in verify mode.
    pub nat_learn_error: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CoreSnapshot {
    pub tx_packets: u64,
    pub tx_bytes: u64,
    pub rx_packets: u64,
    pub rx_bytes: u64,
    pub tx_queue_full: u64,
    pub tx_retries: u64,
    pub tx_dropped: u64,
    pub alloc_failures: u64,
    pub forwarded: u64,
    pub ring_full_drops: u64,
    pub rx_malformed: u64,
    pub rx_check_tagged: u64,
    pub status_drops: u64,
    pub latency_unrouted: u64,
    pub nat_held: u64,
    pub nat_lookup_no_flow: u64,
    pub nat_learn_error: u64,
}

impl CoreCounters {
    #[inline(always)]
    pub fn add(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_tx(&self, packets: u64, bytes: u64) {
        self.tx_packets.fetch_add(packets, Ordering::Relaxed);
        self.tx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    #[inline(always)]
    pub fn record_rx(&self, bytes: u64) {
        self.rx_packets.fetch_add(1, Ordering::Relaxed);
        self.rx_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CoreSnapshot {
        CoreSnapshot {
            tx_packets: self.tx_packets.load(Ordering::Relaxed),
            tx_bytes: self.tx_bytes.load(Ordering::Relaxed),
            rx_packets: self.rx_packets.load(Ordering::Relaxed),
            rx_bytes: self.rx_bytes.load(Ordering::Relaxed),
            tx_queue_full: self.tx_queue_full.load(Ordering::Relaxed),
            tx_retries: self.tx_retries.load(Ordering::Relaxed),
            tx_dropped: self.tx_dropped.load(Ordering::Relaxed),
            alloc_failures: self.alloc_failures.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            ring_full_drops: self.ring_full_drops.load(Ordering::Relaxed),
            rx_malformed: self.rx_malformed.load(Ordering::Relaxed),
            rx_check_tagged: self.rx_check_tagged.load(Ordering::Relaxed),
            status_drops: self.status_drops.load(Ordering::Relaxed),
            latency_unrouted: self.latency_unrouted.load(Ordering::Relaxed),
            nat_held: self.nat_held.load(Ordering::Relaxed),
            nat_lookup_no_flow: self.nat_lookup_no_flow.load(Ordering::Relaxed),
            nat_learn_error: self.nat_learn_error.load(Ordering::Relaxed),
        }
    }

    /// Explicit user reset. Counters are never cleared otherwise.
    pub fn reset(&self) {
        for counter in [
            &self.tx_packets,
            &self.tx_bytes,
            &self.rx_packets,
            &self.rx_bytes,
            &self.tx_queue_full,
            &self.tx_retries,
            &self.tx_dropped,
            &self.alloc_failures,
            &self.forwarded,
            &self.ring_full_drops,
            &self.rx_malformed,
            &self.rx_check_tagged,
            &self.status_drops,
            &self.latency_unrouted,
            &self.nat_held,
            &self.nat_lookup_no_flow,
            &self.nat_learn_error,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

impl CoreSnapshot {
    pub fn merge(&mut self, other: &CoreSnapshot) {
        self.tx_packets += other.tx_packets;
        self.tx_bytes += other.tx_bytes;
        self.rx_packets += other.rx_packets;
        self.rx_bytes += other.rx_bytes;
        self.tx_queue_full += other.tx_queue_full;
        self.tx_retries += other.tx_retries;
        self.tx_dropped += other.tx_dropped;
        self.alloc_failures += other.alloc_failures;
        self.forwarded += other.forwarded;
        self.ring_full_drops += other.ring_full_drops;
        self.rx_malformed += other.rx_malformed;
        self.rx_check_tagged += other.rx_check_tagged;
        self.status_drops += other.status_drops;
        self.latency_unrouted += other.latency_unrouted;
        self.nat_held += other.nat_held;
        self.nat_lookup_no_flow += other.nat_lookup_no_flow;
        self.nat_learn_error += other.nat_learn_error;
    }
}

/// Named event counters fed by the master: NAT events, status messages,
/// stuck cores. Any thread may bump them.
#[derive(Debug, Default, Clone)]
pub struct EventCounters {
    inner: Arc<DashMap<&'static str, u64>>,
}

impl EventCounters {
    pub fn bump(&self, name: &'static str) {
        *self.inner.entry(name).or_insert(0) += 1;
    }

    pub fn get(&self, name: &str) -> u64 {
        self.inner.get(name).map_or(0, |v| *v)
    }

    pub fn snapshot(&self) -> Vec<(&'static str, u64)> {
        let mut all: Vec<(&'static str, u64)> = self.inner.iter().map(|e| (*e.key(), *e.value())).collect();
        all.sort();
        all
    }

    pub fn reset(&self) {
        self.inner.clear();
    }
}

#[derive(Debug, Clone, Default)]
pub struct PortReport {
    pub port: u16,
    pub link_up: bool,
    pub stats: PortStats,
    /// Counters as the driver reports them, FCS bytes included.
    pub extended: ExtendedStats,
}

/// Everything the master aggregates each poll interval. Rendering it is
/// someone else's job.
#[derive(Debug, Clone, Default)]
pub struct EngineReport {
    pub elapsed_secs: f64,
    pub cores: Vec<CoreSnapshot>,
    pub total: CoreSnapshot,
    pub ports: Vec<PortReport>,
    pub latency: LatencyReport,
    pub pool: PoolStats,
    pub rings: Vec<RingBufferStats>,
    pub events: Vec<(&'static str, u64)>,
    pub stuck_cores: Vec<usize>,
}

impl EngineReport {
    pub fn tx_pps(&self) -> f64 {
        if self.elapsed_secs > 0.0 { self.total.tx_packets as f64 / self.elapsed_secs } else { 0.0 }
    }
}
