use std::cmp::Reverse;
use std::collections::{BinaryHeap, VecDeque};
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::header::{LatencyHeader, INITIAL_SEQ};
use super::histogram::{HistogramSnapshot, LatencyHistogram};
use super::jitter::JitterEstimator;
use super::nat::{decode_learn_option, FlowKey, LearnOutcome, NatStats, NatTable, NAT_OPTION_TYPE};
use crate::clock::{duration_ns, Clock};
use crate::config::{EngineConfig, NatLearnMode, ProbeProtocol};
use crate::dp_core::flow_owner;
use crate::messaging::{LatencyLinks, Message, NatEvent, NatEventKind};
use crate::mbuf_pool::MbufPool;
use crate::port::{Burst, PortIo};
use crate::ring_buffer::{RingConsumer, RingFull, RingProducer};
use crate::rx_check::{self, RxCheckManager, RxCheckStats, RX_CHECK_OPTION_TYPE};
use crate::wire::{self, Ipv4View};

/// Every probe is a minimum-size frame.
pub const PROBE_FRAME_LEN: usize = 64;
const RX_BURST: usize = 64;
const MAX_PENDING_EVENTS: usize = 4096;
const IDLE_SLEEP: Duration = Duration::from_micros(10);

/// NAT events waiting for ring space: every event for the master, traffic
/// flow translations also for the owning data-plane core.
#[derive(Debug, Default)]
struct NatEventQueues {
    control: VecDeque<NatEvent>,
    cores: VecDeque<NatEvent>,
    dropped: u64,
}

impl NatEventQueues {
    fn push(&mut self, event: NatEvent) {
        Self::bounded_push(&mut self.control, &mut self.dropped, event);
        if event.flow != 0 && event.kind != NatEventKind::Refreshed {
            Self::bounded_push(&mut self.cores, &mut self.dropped, event);
        }
    }

    fn bounded_push(queue: &mut VecDeque<NatEvent>, dropped: &mut u64, event: NatEvent) {
        if queue.len() >= MAX_PENDING_EVENTS {
            queue.pop_front();
            *dropped += 1;
        }
        queue.push_back(event);
    }
}

/// Address a port's probes are sourced from.
pub fn port_address(port: u16) -> Ipv4Addr {
    let [hi, lo] = (port / 2 + 1).to_be_bytes();
    if port % 2 == 0 { Ipv4Addr::new(16, 0, hi, lo) } else { Ipv4Addr::new(48, 0, hi, lo) }
}

#[derive(Debug, Clone)]
pub struct LatencySettings {
    pub probe_rate: u32,
    pub protocol: ProbeProtocol,
    pub icmp_reply: bool,
    pub nat_learn: NatLearnMode,
    pub sync_interval: Duration,
    pub nat_timeout: Duration,
    pub rx_check_timeout: Duration,
    pub rx_check_tolerance: u32,
    pub quit_ack_retries: u32,
}

impl From<&EngineConfig> for LatencySettings {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            probe_rate: cfg.probe_rate,
            protocol: cfg.probe_protocol,
            icmp_reply: cfg.icmp_reply,
            nat_learn: cfg.nat_learn,
            sync_interval: cfg.sync_interval,
            nat_timeout: cfg.nat_timeout,
            rx_check_timeout: cfg.rx_check_timeout,
            rx_check_tolerance: cfg.rx_check_tolerance,
            quit_ack_retries: cfg.quit_ack_retries,
        }
    }
}

/// Per-port probe counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LatencyCounters {
    pub tx_ok: u64,
    pub tx_err: u64,
    pub pkt_ok: u64,
    pub unsup_prot: u64,
    pub no_magic: u64,
    pub seq_error: u64,
    pub length_error: u64,
    pub rx_check: u64,
    pub nat_learned: u64,
    pub nat_aged: u64,
    pub no_ipv4_option: u64,
}

impl LatencyCounters {
    pub fn rx_errors(&self) -> u64 {
        self.unsup_prot + self.no_magic + self.seq_error + self.length_error
    }
}

#[derive(Debug, Clone, Default)]
pub struct LatencyPortReport {
    pub port: u16,
    pub counters: LatencyCounters,
    pub histogram: HistogramSnapshot,
    pub jitter_ns: u64,
    pub can_send: bool,
    pub nat_external: Option<Ipv4Addr>,
}

/// Latency core output, published every sync interval.
#[derive(Debug, Clone, Default)]
pub struct LatencyReport {
    pub ports: Vec<LatencyPortReport>,
    pub nat: NatStats,
    pub rx_check: RxCheckStats,
}

impl LatencyReport {
    pub fn total(&self) -> LatencyCounters {
        self.ports.iter().fold(LatencyCounters::default(), |mut acc, p| {
            let c = &p.counters;
            acc.tx_ok += c.tx_ok;
            acc.tx_err += c.tx_err;
            acc.pkt_ok += c.pkt_ok;
            acc.unsup_prot += c.unsup_prot;
            acc.no_magic += c.no_magic;
            acc.seq_error += c.seq_error;
            acc.length_error += c.length_error;
            acc.rx_check += c.rx_check;
            acc.nat_learned += c.nat_learned;
            acc.nat_aged += c.nat_aged;
            acc.no_ipv4_option += c.no_ipv4_option;
            acc
        })
    }
}

pub type SharedLatencyReport = Arc<Mutex<LatencyReport>>;

// Sync ticks sort before probes due at the same instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum EventKind {
    SyncTick,
    SendProbe,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct TimedEvent {
    at: u64,
    kind: EventKind,
}

struct PortState {
    port: u16,
    io: Option<Box<dyn PortIo>>,
    tx_seq: u32,
    rx_seq: u32,
    icmp_tx_seq: u16,
    icmp_rx_seq: u16,
    nat_can_send: bool,
    nat_external: Option<Ipv4Addr>,
    counters: LatencyCounters,
    histogram: LatencyHistogram,
    jitter: JitterEstimator,
}

impl PortState {
    fn new(port: u16, io: Option<Box<dyn PortIo>>) -> Self {
        Self {
            port,
            io,
            tx_seq: INITIAL_SEQ,
            rx_seq: INITIAL_SEQ,
            icmp_tx_seq: 1,
            icmp_rx_seq: 0,
            nat_can_send: false,
            nat_external: None,
            counters: LatencyCounters::default(),
            histogram: LatencyHistogram::new(),
            jitter: JitterEstimator::new(),
        }
    }

    fn is_server(&self) -> bool {
        self.port % 2 == 1
    }

    fn peer(&self) -> u16 {
        self.port ^ 1
    }

    fn reset_counters(&mut self) {
        self.counters = LatencyCounters::default();
        self.histogram.reset();
        self.jitter.reset();
    }
}

/// Owns probe generation, probe measurement, NAT learning and RX-check
/// verification. Runs on exactly one core; nothing here is shared.
pub struct LatencyManager {
    settings: LatencySettings,
    ports: Vec<PortState>,
    nat: NatTable,
    rx_check: RxCheckManager,
    pool: MbufPool,
    clock: Arc<dyn Clock>,
    report: SharedLatencyReport,
    events: BinaryHeap<Reverse<TimedEvent>>,
    probe_interval_ns: u64,
    sync_interval_ns: u64,
    nat_events: NatEventQueues,
    rx_burst: Burst,
}

impl LatencyManager {
    /// `ios[i]` is the queue handle of port `i`. Handles without an RX queue
    /// receive only what data-plane cores forward.
    pub fn new(
        settings: LatencySettings,
        ios: Vec<Box<dyn PortIo>>,
        pool: MbufPool,
        clock: Arc<dyn Clock>,
        report: SharedLatencyReport,
    ) -> Self {
        let ports = ios
            .into_iter()
            .enumerate()
            .map(|(i, io)| PortState::new(i as u16, Some(io)))
            .collect();
        let probe_interval_ns = if settings.probe_rate > 0 { 1_000_000_000 / u64::from(settings.probe_rate) } else { 0 };
        Self {
            nat: NatTable::new(duration_ns(settings.nat_timeout)),
            rx_check: RxCheckManager::new(duration_ns(settings.rx_check_timeout), settings.rx_check_tolerance),
            sync_interval_ns: duration_ns(settings.sync_interval).max(1),
            settings,
            ports,
            pool,
            clock,
            report,
            events: BinaryHeap::new(),
            probe_interval_ns,
            nat_events: NatEventQueues::default(),
            rx_burst: Burst::new(),
        }
    }

    /// Arm the timers. Probes go out immediately, the first sync one
    /// interval later.
    pub fn start(&mut self, now: u64) {
        self.events.clear();
        if self.probe_interval_ns > 0 {
            self.events.push(Reverse(TimedEvent { at: now, kind: EventKind::SendProbe }));
        }
        self.events.push(Reverse(TimedEvent { at: now + self.sync_interval_ns, kind: EventKind::SyncTick }));
        info!(
            "Latency core started: {} ports, {} probes/s, sync every {:?}",
            self.ports.len(),
            self.settings.probe_rate,
            self.settings.sync_interval
        );
    }

    /// Run every timer due at `now`. Returns how many fired.
    pub fn step(&mut self, now: u64) -> usize {
        let mut fired = 0;
        while let Some(Reverse(event)) = self.events.peek().copied() {
            if event.at > now {
                break;
            }
            self.events.pop();
            fired += 1;
            match event.kind {
                EventKind::SendProbe => {
                    self.send_probes(now);
                    let mut next = event.at + self.probe_interval_ns;
                    // Too far behind: resynchronize instead of bursting.
                    if next + self.sync_interval_ns < now {
                        next = now + self.probe_interval_ns;
                    }
                    self.events.push(Reverse(TimedEvent { at: next, kind: EventKind::SendProbe }));
                }
                EventKind::SyncTick => {
                    self.sync_tick(now);
                    let next = (event.at + self.sync_interval_ns).max(now + 1);
                    self.events.push(Reverse(TimedEvent { at: next, kind: EventKind::SyncTick }));
                }
            }
        }
        fired
    }

    /// Drain the latency RX queue of every port.
    pub fn poll_rx(&mut self, now: u64) -> usize {
        let mut burst = std::mem::take(&mut self.rx_burst);
        let mut total = 0;
        for idx in 0..self.ports.len() {
            let received = match self.ports[idx].io.as_mut() {
                Some(io) if io.rx_queue().is_some() => io.receive_burst(RX_BURST, &mut burst),
                _ => 0,
            };
            for pkt in burst.drain(..) {
                self.handle_frame(idx, pkt.data(), now);
            }
            total += received;
        }
        self.rx_burst = burst;
        total
    }

    /// Consume packets forwarded by data-plane cores.
    pub fn poll_rings(&mut self, rings: &mut [RingConsumer<Message>], now: u64) -> usize {
        let mut total = 0;
        for ring in rings.iter_mut() {
            for _ in 0..RX_BURST {
                match ring.dequeue() {
                    Some(Message::LatencyPacket { buf, .. }) => {
                        let idx = usize::from(buf.port);
                        if idx < self.ports.len() {
                            self.handle_frame(idx, buf.data(), now);
                        } else {
                            warn!("Forwarded packet for unknown port {}", buf.port);
                        }
                        total += 1;
                    }
                    Some(other) => debug!("Latency core ignoring '{}' from data plane", other.kind()),
                    None => break,
                }
            }
        }
        total
    }

    /// Classify and account one frame received on port `idx`.
    pub fn handle_frame(&mut self, idx: usize, frame: &[u8], now: u64) {
        let Ok(view) = wire::parse_ipv4(frame) else {
            if rx_check::find_tag(frame).is_some() {
                self.ports[idx].counters.rx_check += 1;
                self.rx_check.on_frame(frame, now);
            } else {
                self.ports[idx].counters.unsup_prot += 1;
            }
            return;
        };
        let probe_proto = match self.settings.protocol {
            ProbeProtocol::Sctp => wire::PROTO_SCTP,
            ProbeProtocol::Icmp => wire::PROTO_ICMP,
        };
        if view.protocol == probe_proto && wire::find_ipv4_option(view.options(frame), RX_CHECK_OPTION_TYPE).is_none() {
            self.handle_probe(idx, frame, &view, now);
        } else {
            self.handle_other(idx, frame, &view, now);
        }
    }

    fn handle_probe(&mut self, idx: usize, frame: &[u8], view: &Ipv4View, now: u64) {
        let l4 = view.l4(frame);
        let l4_hdr = match self.settings.protocol {
            ProbeProtocol::Sctp => wire::SCTP_HDR_LEN,
            ProbeProtocol::Icmp => wire::ICMP_HDR_LEN,
        };
        let Ok(hdr) = LatencyHeader::decode(l4.get(l4_hdr..).unwrap_or(&[])) else {
            self.ports[idx].counters.unsup_prot += 1;
            return;
        };

        let learn = self.settings.nat_learn.enabled();
        let icmp_reply = self.settings.protocol == ProbeProtocol::Icmp && self.settings.icmp_reply;
        let st = &mut self.ports[idx];
        if u16::from(hdr.generator) != st.peer() {
            st.counters.no_magic += 1;
            return;
        }

        if learn && st.is_server() {
            let port = st.port;
            match self.nat.learn(FlowKey::Latency(port), port, view.src, 0, now) {
                LearnOutcome::Learned => {
                    st.nat_can_send = true;
                    st.nat_external = Some(view.src);
                    st.counters.nat_learned += 1;
                    info!("Port {}: learned NAT address {} for probes", port, view.src);
                    self.nat_events.push(NatEvent { port, flow: 0, external: view.src, external_port: 0, kind: NatEventKind::Learned });
                }
                LearnOutcome::Refreshed => {
                    st.nat_external = Some(view.src);
                }
            }
        }

        if icmp_reply && st.is_server() {
            if let Some((_, _, seq)) = wire::icmp_echo_fields(l4) {
                st.icmp_rx_seq = seq;
                st.icmp_tx_seq = seq;
            }
        }

        let mut len = frame.len();
        if len == PROBE_FRAME_LEN + wire::FCS_LEN {
            len -= wire::FCS_LEN;
        }
        if len != PROBE_FRAME_LEN {
            st.counters.length_error += 1;
            return;
        }

        if hdr.seq != st.rx_seq {
            st.counters.seq_error += 1;
            st.rx_seq = hdr.seq.wrapping_add(1);
            return;
        }
        st.rx_seq = st.rx_seq.wrapping_add(1);

        let rtt = now.saturating_sub(hdr.timestamp);
        st.histogram.add(rtt);
        st.jitter.update(rtt);
        st.counters.pkt_ok += 1;
    }

    fn handle_other(&mut self, idx: usize, frame: &[u8], view: &Ipv4View, now: u64) {
        let options = view.options(frame);
        if wire::find_ipv4_option(options, RX_CHECK_OPTION_TYPE).is_some() {
            self.ports[idx].counters.rx_check += 1;
            self.rx_check.on_frame(frame, now);
            return;
        }

        let port = idx as u16;
        let learned = match self.settings.nat_learn {
            NatLearnMode::IpOption => match wire::find_ipv4_option(options, NAT_OPTION_TYPE) {
                Some(opt) => match decode_learn_option(opt) {
                    Ok(flow) => Some(flow),
                    Err(_) => {
                        self.ports[idx].counters.no_ipv4_option += 1;
                        return;
                    }
                },
                None => None,
            },
            NatLearnMode::TcpAck if view.protocol == wire::PROTO_TCP => match wire::tcp_flags_and_ack(view.l4(frame)) {
                Some((flags, ack)) if flags & wire::TCP_SYN != 0 && ack != 0 => Some(u64::from(ack)),
                _ => None,
            },
            _ => None,
        };

        let Some(flow) = learned else {
            self.ports[idx].counters.unsup_prot += 1;
            return;
        };
        let l4 = view.l4(frame);
        let src_port = if l4.len() >= 2 { u16::from_be_bytes([l4[0], l4[1]]) } else { 0 };
        let kind = match self.nat.learn(FlowKey::Traffic(flow), port, view.src, src_port, now) {
            LearnOutcome::Learned => {
                self.ports[idx].counters.nat_learned += 1;
                debug!("Port {}: flow {} translated to {}:{}", port, flow, view.src, src_port);
                NatEventKind::Learned
            }
            LearnOutcome::Refreshed => NatEventKind::Refreshed,
        };
        if kind == NatEventKind::Learned {
            self.nat_events.push(NatEvent { port, flow, external: view.src, external_port: src_port, kind });
        }
    }

    fn can_send(&self, st: &PortState) -> bool {
        if !st.is_server() {
            return true;
        }
        if self.settings.protocol == ProbeProtocol::Icmp && self.settings.icmp_reply {
            return st.icmp_tx_seq <= st.icmp_rx_seq;
        }
        if self.settings.nat_learn.enabled() {
            return st.nat_can_send;
        }
        true
    }

    /// One probe per eligible port. The sequence number advances even when
    /// the send fails so the receiver sees the gap.
    pub fn send_probes(&mut self, now: u64) {
        let icmp_reply = self.settings.icmp_reply;
        for idx in 0..self.ports.len() {
            if !self.can_send(&self.ports[idx]) {
                continue;
            }
            let st = &mut self.ports[idx];
            let hdr = LatencyHeader { timestamp: now, generator: st.port as u8, seq: st.tx_seq };
            st.tx_seq = st.tx_seq.wrapping_add(1);

            let src = port_address(st.port);
            let dst = st.nat_external.unwrap_or_else(|| port_address(st.peer()));
            let frame = match self.settings.protocol {
                ProbeProtocol::Sctp => wire::build_sctp(src, dst, &hdr.encode(), PROBE_FRAME_LEN),
                ProbeProtocol::Icmp => {
                    let icmp_type = if icmp_reply && st.is_server() { wire::ICMP_ECHO_REPLY } else { wire::ICMP_ECHO_REQUEST };
                    let seq = st.icmp_tx_seq;
                    st.icmp_tx_seq = st.icmp_tx_seq.wrapping_add(1);
                    wire::build_icmp(src, dst, icmp_type, st.port, seq, &hdr.encode(), PROBE_FRAME_LEN)
                }
            };

            let Some(buf) = self.pool.alloc_with(&frame) else {
                st.counters.tx_err += 1;
                continue;
            };
            let sent = match st.io.as_mut() {
                Some(io) => {
                    let mut burst = Burst::new();
                    burst.push(buf);
                    io.send_burst(&mut burst)
                }
                None => 0,
            };
            if sent == 1 {
                st.counters.tx_ok += 1;
            } else {
                st.counters.tx_err += 1;
            }
        }
    }

    /// Periodic housekeeping: NAT aging, RX-check expiry, histogram windows
    /// and report publishing.
    pub fn sync_tick(&mut self, now: u64) {
        for (key, entry) in self.nat.age(now) {
            let flow = match key {
                FlowKey::Latency(port) => {
                    if let Some(st) = self.ports.get_mut(usize::from(port)) {
                        st.nat_can_send = false;
                        st.nat_external = None;
                    }
                    0
                }
                FlowKey::Traffic(flow) => flow,
            };
            if let Some(st) = self.ports.get_mut(usize::from(entry.port)) {
                st.counters.nat_aged += 1;
            }
            debug!("Port {}: NAT entry {:?} aged out", entry.port, key);
            self.nat_events.push(NatEvent {
                port: entry.port,
                flow,
                external: entry.external,
                external_port: entry.external_port,
                kind: NatEventKind::Aged,
            });
        }
        self.rx_check.sweep(now);
        for st in &mut self.ports {
            st.histogram.end_window();
        }
        self.publish(false);
    }

    pub fn report(&self) -> LatencyReport {
        LatencyReport {
            ports: self
                .ports
                .iter()
                .map(|st| LatencyPortReport {
                    port: st.port,
                    counters: st.counters,
                    histogram: st.histogram.snapshot(),
                    jitter_ns: st.jitter.get(),
                    can_send: self.can_send(st),
                    nat_external: st.nat_external,
                })
                .collect(),
            nat: self.nat.stats(),
            rx_check: self.rx_check.stats(),
        }
    }

    /// Skips the update if a reader holds the lock, unless `force`.
    fn publish(&self, force: bool) {
        let report = self.report();
        if force {
            *self.report.lock() = report;
        } else if let Some(mut guard) = self.report.try_lock() {
            *guard = report;
        }
    }

    pub fn reset_counters(&mut self) {
        for st in &mut self.ports {
            st.reset_counters();
        }
        self.nat.reset_counters();
        self.rx_check.reset_counters();
        self.publish(true);
    }

    /// Hand queued NAT events to the master, keeping the rest if the ring
    /// is full.
    pub fn flush_events(&mut self, to_control: &mut RingProducer<Message>) -> usize {
        let mut sent = 0;
        while let Some(event) = self.nat_events.control.pop_front() {
            match to_control.enqueue(Message::NatEvent(event)) {
                Ok(()) => sent += 1,
                Err(RingFull(Message::NatEvent(event))) => {
                    self.nat_events.control.push_front(event);
                    break;
                }
                Err(RingFull(_)) => break,
            }
        }
        sent
    }

    /// Hand traffic-flow translations to the data-plane core owning the flow.
    pub fn flush_core_events(&mut self, to_cores: &mut [RingProducer<Message>]) -> usize {
        let mut sent = 0;
        while let Some(event) = self.nat_events.cores.pop_front() {
            let Some(ring) = flow_owner(event.flow).and_then(|core| to_cores.get_mut(core)) else {
                debug!("No data-plane core owns flow {}", event.flow);
                self.nat_events.dropped += 1;
                continue;
            };
            match ring.enqueue(Message::NatEvent(event)) {
                Ok(()) => sent += 1,
                Err(RingFull(Message::NatEvent(event))) => {
                    self.nat_events.cores.push_front(event);
                    break;
                }
                Err(RingFull(_)) => break,
            }
        }
        sent
    }

    pub fn pending_events(&self) -> usize {
        self.nat_events.control.len()
    }

    pub fn pending_core_events(&self) -> usize {
        self.nat_events.cores.len()
    }

    /// Latency core main loop. Returns after a `Quit` from the master has
    /// been acknowledged.
    pub fn run(mut self, mut links: LatencyLinks, core: usize) {
        self.start(self.clock.now_ns());
        loop {
            let now = self.clock.now_ns();
            let mut busy = self.step(now) > 0;
            busy |= self.poll_rx(now) > 0;
            busy |= self.poll_rings(&mut links.from_cores, now) > 0;
            self.flush_events(&mut links.to_control);
            self.flush_core_events(&mut links.to_cores);

            match links.from_control.dequeue() {
                Some(Message::Quit) => break,
                Some(Message::ResetCounters) => self.reset_counters(),
                Some(other) => debug!("Latency core ignoring '{}' from control", other.kind()),
                None => {
                    if !busy {
                        thread::sleep(IDLE_SLEEP);
                    }
                }
            }
        }

        self.publish(true);
        if self.nat_events.dropped > 0 {
            warn!("Latency core dropped {} NAT events", self.nat_events.dropped);
        }
        let total = self.report().total();
        info!("Latency core stopping: {} probes sent, {} measured", total.tx_ok, total.pkt_ok);
        if links
            .to_control
            .enqueue_bounded(Message::QuitAck { core }, self.settings.quit_ack_retries)
            .is_err()
        {
            warn!("Latency core could not acknowledge quit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dp_core::TrafficSource;
    use crate::latency::nat::encode_learn_option;
    use crate::port::{NicPort, RxSteering, SoftPort};
    use crate::rx_check::RxCheckSampler;
    use crate::wire::FlowTuple;

    const MS: u64 = 1_000_000;

    fn settings(rate: u32) -> LatencySettings {
        LatencySettings::from(&EngineConfig { probe_rate: rate, ..EngineConfig::default() })
    }

    fn latency_rules() -> RxSteering {
        RxSteering { drop_errors: true, latency_queue: Some(1), drop_queue: true, rss_start: 2, rss_end: 3 }
    }

    fn manager(settings: LatencySettings, clock: &ManualClock) -> (LatencyManager, Vec<Arc<dyn NicPort>>) {
        let ports = SoftPort::pairs(2, "soft", 4, 4, 256);
        for p in &ports {
            p.steering().program(Some(latency_rules()));
        }
        let ios = ports.iter().map(|p| p.open_queues(Some(1), Some(1)).unwrap()).collect();
        let mgr = LatencyManager::new(
            settings,
            ios,
            MbufPool::new(512),
            Arc::new(clock.clone()),
            SharedLatencyReport::default(),
        );
        (mgr, ports)
    }

    fn drive(mgr: &mut LatencyManager, clock: &ManualClock, until_ms: u64) {
        while clock.now_ns() < until_ms * MS {
            let now = clock.now_ns();
            mgr.step(now);
            mgr.poll_rx(now);
            clock.advance(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_one_second_of_probes() {
        let clock = ManualClock::new();
        let (mut mgr, _ports) = manager(settings(100), &clock);
        mgr.start(0);
        drive(&mut mgr, &clock, 1000);

        let report = mgr.report();
        for p in &report.ports {
            assert_eq!(p.counters.tx_ok, 100, "port {}", p.port);
            assert_eq!(p.counters.pkt_ok, 100, "port {}", p.port);
            assert_eq!(p.counters.rx_errors(), 0);
            assert_eq!(p.histogram.count, p.counters.pkt_ok);
        }
    }

    #[test]
    fn test_sequence_gap_counted_once() {
        let clock = ManualClock::new();
        let (mut mgr, _ports) = manager(settings(0), &clock);
        let send = |seq: u32| {
            let hdr = LatencyHeader { timestamp: 0, generator: 1, seq };
            wire::build_sctp(port_address(1), port_address(0), &hdr.encode(), PROBE_FRAME_LEN)
        };
        mgr.handle_frame(0, &send(INITIAL_SEQ), 10);
        mgr.handle_frame(0, &send(INITIAL_SEQ + 2), 10);
        mgr.handle_frame(0, &send(INITIAL_SEQ + 3), 10);
        let c = mgr.report().ports[0].counters;
        assert_eq!(c.pkt_ok, 2);
        assert_eq!(c.seq_error, 1);
    }

    #[test]
    fn test_wrong_generator_and_length() {
        let clock = ManualClock::new();
        let (mut mgr, _ports) = manager(settings(0), &clock);
        let hdr = LatencyHeader { timestamp: 0, generator: 3, seq: INITIAL_SEQ };
        mgr.handle_frame(0, &wire::build_sctp(port_address(1), port_address(0), &hdr.encode(), 64), 1);

        let hdr = LatencyHeader { timestamp: 0, generator: 1, seq: INITIAL_SEQ };
        mgr.handle_frame(0, &wire::build_sctp(port_address(1), port_address(0), &hdr.encode(), 96), 1);
        // Trailing FCS is tolerated
        let mut with_fcs = wire::build_sctp(port_address(1), port_address(0), &hdr.encode(), 64).to_vec();
        with_fcs.extend([0u8; 4]);
        mgr.handle_frame(0, &with_fcs, 1);

        let c = mgr.report().ports[0].counters;
        assert_eq!(c.no_magic, 1);
        assert_eq!(c.length_error, 1);
        assert_eq!(c.pkt_ok, 1);
    }

    #[test]
    fn test_server_waits_for_nat_learning() {
        let clock = ManualClock::new();
        let mut cfg = settings(100);
        cfg.nat_learn = NatLearnMode::IpOption;
        cfg.nat_timeout = Duration::from_millis(300);
        let (mut mgr, _ports) = manager(cfg, &clock);

        mgr.send_probes(0);
        let report = mgr.report();
        assert_eq!(report.ports[0].counters.tx_ok, 1);
        assert_eq!(report.ports[1].counters.tx_ok, 0);
        assert!(!report.ports[1].can_send);

        mgr.poll_rx(0);
        let report = mgr.report();
        assert!(report.ports[1].can_send);
        assert_eq!(report.ports[1].nat_external, Some(port_address(0)));
        assert_eq!(report.ports[1].counters.nat_learned, 1);
        assert_eq!(mgr.pending_events(), 1);

        // No more client probes arrive: the entry ages out
        mgr.sync_tick(400 * MS);
        let report = mgr.report();
        assert!(!report.ports[1].can_send);
        assert_eq!(report.ports[1].counters.nat_aged, 1);
        assert_eq!(report.nat.aged, 1);
        assert_eq!(mgr.pending_events(), 2);
    }

    #[test]
    fn test_icmp_reply_mode_answers_each_request() {
        let clock = ManualClock::new();
        let mut cfg = settings(100);
        cfg.protocol = ProbeProtocol::Icmp;
        cfg.icmp_reply = true;
        let (mut mgr, _ports) = manager(cfg, &clock);

        mgr.send_probes(0);
        assert_eq!(mgr.report().ports[1].counters.tx_ok, 0);
        mgr.poll_rx(MS);
        mgr.send_probes(2 * MS);
        mgr.poll_rx(3 * MS);
        // A reply goes out only once per received request
        mgr.send_probes(4 * MS);
        let report = mgr.report();
        assert_eq!(report.ports[0].counters.tx_ok, 3);
        assert_eq!(report.ports[1].counters.tx_ok, 2);
        assert_eq!(report.ports[1].counters.pkt_ok, 2);
    }

    #[test]
    fn test_traffic_flow_learning_from_option() {
        let clock = ManualClock::new();
        let mut cfg = settings(0);
        cfg.nat_learn = NatLearnMode::IpOption;
        let (mut mgr, _ports) = manager(cfg, &clock);

        let flow = FlowTuple { src: Ipv4Addr::new(10, 1, 1, 1), dst: port_address(0), src_port: 4000, dst_port: 80 };
        let frame = wire::build_udp(&flow, &encode_learn_option(42), 128);
        mgr.handle_frame(1, &frame, 5);
        mgr.handle_frame(1, &frame, 6);

        let report = mgr.report();
        assert_eq!(report.ports[1].counters.nat_learned, 1);
        assert_eq!(report.nat.learned, 1);
        assert_eq!(report.nat.refreshed, 1);
        assert_eq!(mgr.pending_events(), 1);
    }

    #[test]
    fn test_traffic_translation_routed_to_owning_core() {
        let clock = ManualClock::new();
        let mut cfg = settings(0);
        cfg.nat_learn = NatLearnMode::IpOption;
        let (mut mgr, _ports) = manager(cfg, &clock);
        let (_control, mut cores, mut latency) = crate::messaging::build_fabric(2, false, 8);

        let owned = u64::from(TrafficSource::new(1, 4, 128).flow_id(3));
        let stray = u64::from(TrafficSource::new(9, 4, 128).flow_id(0));
        for (id, src_port) in [(owned, 4000), (stray, 4001)] {
            let flow = FlowTuple { src: Ipv4Addr::new(10, 1, 1, 1), dst: port_address(0), src_port, dst_port: 80 };
            mgr.handle_frame(1, &wire::build_udp(&flow, &encode_learn_option(id), 128), 5);
        }
        assert_eq!(mgr.pending_core_events(), 2);
        assert_eq!(mgr.flush_core_events(&mut latency.to_cores), 1);
        assert_eq!(mgr.pending_core_events(), 0);

        assert!(cores[0].from_latency.dequeue().is_none());
        match cores[1].from_latency.dequeue() {
            Some(Message::NatEvent(event)) => {
                assert_eq!(event.flow, owned);
                assert_eq!(event.external, Ipv4Addr::new(10, 1, 1, 1));
                assert_eq!(event.external_port, 4000);
                assert_eq!(event.kind, NatEventKind::Learned);
            }
            other => panic!("unexpected {:?}", other),
        }
        // The master hears about both
        assert_eq!(mgr.pending_events(), 2);
    }

    #[test]
    fn test_rx_check_frames_reach_checker() {
        let clock = ManualClock::new();
        let (mut mgr, _ports) = manager(settings(0), &clock);
        let pool = MbufPool::new(8);
        let mut sampler = RxCheckSampler::new(1);
        let flow = FlowTuple { src: port_address(0), dst: port_address(1), src_port: 1000, dst_port: 80 };
        let mut buf = pool.alloc_with(&wire::build_udp(&flow, &[], 128)).unwrap();
        assert!(sampler.tag(&mut buf, 7, false, 0));

        mgr.handle_frame(1, buf.data(), 10);
        let report = mgr.report();
        assert_eq!(report.ports[1].counters.rx_check, 1);
        assert_eq!(report.rx_check.total, 1);
        assert_eq!(report.rx_check.in_order, 1);
    }

    #[test]
    fn test_ipv6_rx_check_frames_reach_checker() {
        let clock = ManualClock::new();
        let (mut mgr, _ports) = manager(settings(0), &clock);
        let pool = MbufPool::new(8);
        let mut sampler = RxCheckSampler::new(1);
        let (src, dst) = ("2001:db8::10".parse().unwrap(), "2001:db8::20".parse().unwrap());
        let mut buf = pool.alloc_with(&wire::build_udp_v6(src, dst, 1000, 80, 128)).unwrap();
        assert!(sampler.tag(&mut buf, 9, false, 0));

        mgr.handle_frame(1, buf.data(), 10);
        mgr.handle_frame(1, &wire::build_udp_v6(src, dst, 1000, 80, 128), 11);
        let report = mgr.report();
        assert_eq!(report.ports[1].counters.rx_check, 1);
        assert_eq!(report.ports[1].counters.unsup_prot, 1);
        assert_eq!(report.rx_check.total, 1);
        assert_eq!(report.rx_check.in_order, 1);
    }

    #[test]
    fn test_report_published_on_sync() {
        let clock = ManualClock::new();
        let shared = SharedLatencyReport::default();
        let ports = SoftPort::pairs(2, "soft", 4, 4, 64);
        let ios = ports.iter().map(|p| p.open_queues(Some(1), Some(1)).unwrap()).collect();
        let mut mgr = LatencyManager::new(settings(10), ios, MbufPool::new(64), Arc::new(clock.clone()), shared.clone());
        mgr.start(0);
        mgr.step(0);
        assert!(shared.lock().ports.is_empty());
        // The sync tick runs before the probe due at the same instant
        mgr.step(100 * MS);
        assert_eq!(shared.lock().ports.len(), 2);
        assert_eq!(shared.lock().ports[0].counters.tx_ok, 1);
        assert_eq!(mgr.report().ports[0].counters.tx_ok, 2);
    }

    #[test]
    fn test_quit_is_acknowledged() {
        let clock = ManualClock::new();
        let (mgr, _ports) = manager(settings(10), &clock);
        let (mut control, _cores, latency) = crate::messaging::build_fabric(1, false, 8);
        control.to_latency.enqueue(Message::Quit).unwrap();
        let handle = thread::spawn(move || mgr.run(latency, 5));
        handle.join().unwrap();
        assert!(matches!(control.from_latency.dequeue(), Some(Message::QuitAck { core: 5 })));
    }
}
