use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_utils::Backoff;
use tracing::{debug, info, warn};

use crate::classify::{classify, PacketClass};
use crate::clock::Clock;
use crate::config::{EngineConfig, NatLearnMode};
use crate::latency::nat::encode_learn_option;
use crate::mbuf_pool::MbufPool;
use crate::messaging::{CoreLinks, Message, NatEvent, NatEventKind, StatusKind};
use crate::packet::{Direction, Frame, PacketBuf};
use crate::port::{Burst, PortIo};
use crate::ring_buffer::{RingConsumer, RingFull, RingProducer};
use crate::rx_check::RxCheckSampler;
use crate::stats::CoreCounters;
use crate::wire::{self, FlowTuple};

const IDLE_SLEEP: Duration = Duration::from_micros(10);
const MAX_IDLE: Duration = Duration::from_millis(1);
const LINK_CHECK_EVERY: u32 = 1024;
const FLOW_SLOT_SHIFT: u32 = 16;
/// Server packets remembered per flow while its translation is unknown.
const MAX_HELD_PER_FLOW: u32 = 64;

#[derive(Debug, Clone)]
pub struct DpSettings {
    pub burst_size: usize,
    pub tx_retry_limit: u32,
    pub tx_backoff: Duration,
    /// Packets per second generated on each side. 0 only forwards.
    pub traffic_rate: u64,
    pub flows: u32,
    pub packet_size: usize,
    pub sample_interval: u32,
    pub nat_learn: NatLearnMode,
    /// Count translations that changed the client address as learn errors.
    pub nat_learn_verify: bool,
    pub quit_ack_retries: u32,
}

impl From<&EngineConfig> for DpSettings {
    fn from(cfg: &EngineConfig) -> Self {
        Self {
            burst_size: cfg.burst_size,
            tx_retry_limit: cfg.tx_retry_limit,
            tx_backoff: cfg.tx_backoff,
            traffic_rate: cfg.traffic_rate,
            flows: cfg.flows,
            packet_size: cfg.packet_size,
            sample_interval: cfg.sample_interval,
            nat_learn: cfg.nat_learn,
            nat_learn_verify: cfg.nat_learn_verify,
            quit_ack_retries: cfg.quit_ack_retries,
        }
    }
}

/// Fixed-rate pacer on the engine clock. Never blocks; the run loop decides
/// how to wait for the next slot.
#[derive(Debug)]
pub struct RatePacer {
    interval_ns: u64,
    next_at: Option<u64>,
}

impl RatePacer {
    pub fn new(rate: u64) -> Self {
        let interval_ns = if rate > 0 { (1_000_000_000 / rate).max(1) } else { 0 };
        Self { interval_ns, next_at: None }
    }

    /// Packets due by `now`, at most `max`. A backlog larger than one burst
    /// is forgiven instead of being sent as a storm.
    pub fn due(&mut self, now: u64, max: usize) -> usize {
        if self.interval_ns == 0 || max == 0 {
            return 0;
        }
        let next = *self.next_at.get_or_insert(now);
        if now < next {
            return 0;
        }
        let owed = (now - next) / self.interval_ns + 1;
        let n = owed.min(max as u64);
        let mut following = next + n * self.interval_ns;
        if following + (max as u64) * self.interval_ns < now {
            following = now + self.interval_ns;
        }
        self.next_at = Some(following);
        n as usize
    }

    /// Time until the next slot. `None` when the pacer is disabled.
    pub fn until_next(&self, now: u64) -> Option<Duration> {
        if self.interval_ns == 0 {
            return None;
        }
        let next = self.next_at.unwrap_or(now);
        Some(Duration::from_nanos(next.saturating_sub(now)))
    }
}

/// Sleep for long waits, spin for short ones.
fn pause(wait: Duration) {
    if wait > Duration::from_micros(100) {
        thread::sleep(wait);
    } else {
        let start = Instant::now();
        while start.elapsed() < wait {
            std::hint::spin_loop();
        }
    }
}

/// Data-plane core that generated traffic flow `flow_id`.
pub fn flow_owner(flow_id: u64) -> Option<usize> {
    let raw = flow_id.checked_sub(1)?;
    usize::try_from(raw >> FLOW_SLOT_SHIFT).ok()
}

/// Where the server side of a flow sends once the NAT between the ports
/// has been learned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Translation {
    pub addr: Ipv4Addr,
    pub port: u16,
}

/// Synthetic UDP flows of one core. Client packets go from the even port of
/// the pair to the odd one; server packets travel back on the same tuple,
/// or to the learned translation of the client when NAT learning is on.
#[derive(Debug)]
pub struct TrafficSource {
    flow_base: u32,
    flows: u32,
    packet_size: usize,
    next_flow: [u32; 2],
    started: Vec<bool>,
    nat: bool,
    translations: Vec<Option<Translation>>,
    held: Vec<u32>,
    // Flows whose held server packets are due, with the count
    released: VecDeque<(u32, u32)>,
}

impl TrafficSource {
    /// `slot` numbers the core across the whole engine so flow ids never
    /// collide between cores.
    pub fn new(slot: usize, flows: u32, packet_size: usize) -> Self {
        let flows = flows.clamp(1, 1 << FLOW_SLOT_SHIFT);
        Self {
            flow_base: (slot as u32) << FLOW_SLOT_SHIFT,
            flows,
            packet_size,
            next_flow: [0; 2],
            started: vec![false; flows as usize],
            nat: false,
            translations: vec![None; flows as usize],
            held: vec![0; flows as usize],
            released: VecDeque::new(),
        }
    }

    /// Hold server packets of a flow until its translation is known.
    pub fn with_nat_learning(mut self, enabled: bool) -> Self {
        self.nat = enabled;
        self
    }

    /// Engine-wide id of a local flow. Never zero.
    pub fn flow_id(&self, flow: u32) -> u32 {
        (self.flow_base | flow).wrapping_add(1)
    }

    /// Local index of an engine-wide flow id, if this source owns it.
    pub fn local_flow(&self, flow_id: u64) -> Option<u32> {
        let raw = u32::try_from(flow_id.checked_sub(1)?).ok()?;
        let flow = raw & ((1 << FLOW_SLOT_SHIFT) - 1);
        (raw - flow == self.flow_base && flow < self.flows).then_some(flow)
    }

    fn client_tuple(&self, flow: u32) -> FlowTuple {
        let id = self.flow_base | flow;
        FlowTuple {
            src: Ipv4Addr::from(0x1000_0000 | (id & 0x00ff_ffff)),
            dst: Ipv4Addr::from(0x3000_0000 | (id & 0x00ff_ffff)),
            src_port: 1024 + (flow % 60_000) as u16,
            dst_port: 80,
        }
    }

    pub fn tuple(&self, dir: Direction, flow: u32) -> FlowTuple {
        let client = self.client_tuple(flow);
        match dir {
            Direction::Client => client,
            Direction::Server => {
                let (dst, dst_port) = match self.translation(flow) {
                    Some(t) => (t.addr, t.port),
                    None => (client.src, client.src_port),
                };
                FlowTuple { src: client.dst, dst, src_port: client.dst_port, dst_port }
            }
        }
    }

    pub fn translation(&self, flow: u32) -> Option<Translation> {
        self.translations.get(flow as usize).copied().flatten()
    }

    /// Server packets of `flow` waiting for its translation.
    pub fn held(&self, flow: u32) -> u32 {
        self.held.get(flow as usize).copied().unwrap_or(0)
    }

    /// Round-robin over flows. The flag is set on a flow's first client
    /// packet. `None` when the server packet due belongs to a flow still
    /// waiting for its translation; it is sent once the translation arrives.
    pub fn next(&mut self, dir: Direction) -> Option<(u32, bool)> {
        if dir == Direction::Server {
            if let Some(flow) = self.take_released() {
                return Some((flow, false));
            }
        }
        let slot = &mut self.next_flow[dir.index()];
        let flow = *slot;
        *slot = (*slot + 1) % self.flows;
        let idx = flow as usize;
        let first = dir == Direction::Client && !self.started[idx];
        if first {
            self.started[idx] = true;
        }
        if dir == Direction::Server && self.nat && self.translations[idx].is_none() {
            self.held[idx] = (self.held[idx] + 1).min(MAX_HELD_PER_FLOW);
            return None;
        }
        Some((flow, first))
    }

    fn take_released(&mut self) -> Option<u32> {
        let entry = self.released.front_mut()?;
        let flow = entry.0;
        entry.1 -= 1;
        if entry.1 == 0 {
            self.released.pop_front();
        }
        Some(flow)
    }

    /// Install the translation of a flow waiting for one and release its
    /// held server packets. False if the flow is not waiting.
    pub fn translate(&mut self, flow: u32, translation: Translation) -> bool {
        let idx = flow as usize;
        if !self.nat || idx >= self.translations.len() || !self.started[idx] || self.translations[idx].is_some() {
            return false;
        }
        self.translations[idx] = Some(translation);
        let held = std::mem::take(&mut self.held[idx]);
        if held > 0 {
            self.released.push_back((flow, held));
        }
        true
    }

    /// Drop an aged translation. The next client packet announces the flow
    /// again.
    pub fn forget(&mut self, flow: u32) -> bool {
        let idx = flow as usize;
        match self.translations.get_mut(idx).and_then(Option::take) {
            Some(_) => {
                self.started[idx] = false;
                true
            }
            None => false,
        }
    }

    /// True when `translation` is the flow's own client address, as it is
    /// with no NAT in the path.
    pub fn is_identity(&self, flow: u32, translation: Translation) -> bool {
        let client = self.client_tuple(flow);
        translation.addr == client.src && translation.port == client.src_port
    }

    /// Frame for `flow`. A first client packet announces the flow for NAT
    /// learning when a learn mode is active.
    pub fn build(&self, dir: Direction, flow: u32, first: bool, nat: NatLearnMode) -> Frame {
        let tuple = self.tuple(dir, flow);
        let id = self.flow_id(flow);
        match (first, nat) {
            (true, NatLearnMode::IpOption) => {
                wire::build_udp(&tuple, &encode_learn_option(u64::from(id)), self.packet_size)
            }
            (true, NatLearnMode::TcpAck) => wire::build_tcp_syn(&tuple, id),
            _ => wire::build_udp(&tuple, &[], self.packet_size),
        }
    }
}

struct Side {
    io: Box<dyn PortIo>,
    pending: Burst,
    sampler: RxCheckSampler,
    pacer: RatePacer,
    link_up: bool,
}

/// One data-plane core: a (queue handle, accumulation buffer) pair per
/// direction. Single-threaded; nothing in here is shared except counters.
pub struct DataPlaneCore {
    id: usize,
    settings: DpSettings,
    sides: [Side; 2],
    source: TrafficSource,
    pool: MbufPool,
    counters: Arc<CoreCounters>,
    clock: Arc<dyn Clock>,
    to_latency: Option<RingProducer<Message>>,
    rx_burst: Burst,
}

impl DataPlaneCore {
    /// `client` serves the even port of the pair, `server` the odd one.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: usize,
        settings: DpSettings,
        client: Box<dyn PortIo>,
        server: Box<dyn PortIo>,
        source: TrafficSource,
        pool: MbufPool,
        counters: Arc<CoreCounters>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let side = |io: Box<dyn PortIo>| Side {
            link_up: io.link_up(),
            io,
            pending: Burst::new(),
            sampler: RxCheckSampler::new(settings.sample_interval),
            pacer: RatePacer::new(settings.traffic_rate),
        };
        let sides = [side(client), side(server)];
        Self {
            id,
            settings,
            sides,
            source,
            pool,
            counters,
            clock,
            to_latency: None,
            rx_burst: Burst::new(),
        }
    }

    /// Where latency-bound packets go when this core cannot leave them on
    /// the NIC for the latency core.
    pub fn set_latency_ring(&mut self, ring: Option<RingProducer<Message>>) {
        self.to_latency = ring;
    }

    pub fn pending(&self, dir: Direction) -> usize {
        self.sides[dir.index()].pending.len()
    }

    /// Queue `pkt` for `dir`. A full accumulation buffer is flushed at once.
    pub fn enqueue_for_send(&mut self, dir: Direction, pkt: PacketBuf) {
        let pending = &mut self.sides[dir.index()].pending;
        pending.push(pkt);
        if pending.len() >= self.settings.burst_size {
            self.flush(dir);
        }
    }

    /// Send the accumulation buffer. A partial send is retried at most
    /// `tx_retry_limit` times, snoozing and then sleeping `tx_backoff`
    /// between attempts. What is still unsent after that is dropped.
    /// Returns the number of packets sent.
    pub fn flush(&mut self, dir: Direction) -> usize {
        let side = &mut self.sides[dir.index()];
        if side.pending.is_empty() {
            return 0;
        }
        let bytes_before: usize = side.pending.iter().map(PacketBuf::len).sum();
        let mut sent = side.io.send_burst(&mut side.pending);

        if !side.pending.is_empty() {
            CoreCounters::add(&self.counters.tx_queue_full, 1);
            let backoff = Backoff::new();
            let mut attempts = 0;
            while !side.pending.is_empty() && attempts < self.settings.tx_retry_limit {
                attempts += 1;
                CoreCounters::add(&self.counters.tx_retries, 1);
                if backoff.is_completed() {
                    thread::sleep(self.settings.tx_backoff);
                } else {
                    backoff.snooze();
                }
                sent += side.io.send_burst(&mut side.pending);
            }
        }

        let unsent_bytes: usize = side.pending.iter().map(PacketBuf::len).sum();
        if !side.pending.is_empty() {
            CoreCounters::add(&self.counters.tx_dropped, side.pending.len() as u64);
            side.pending.clear();
        }
        self.counters.record_tx(sent as u64, (bytes_before - unsent_bytes) as u64);
        sent
    }

    /// Receive one burst on `dir` and route every packet: latency-bound
    /// traffic to the latency core, everything else back to the pool.
    pub fn drain_incoming(&mut self, dir: Direction) -> usize {
        let mut burst = std::mem::take(&mut self.rx_burst);
        let received = self.sides[dir.index()].io.receive_burst(self.settings.burst_size, &mut burst);

        for pkt in burst.drain(..) {
            self.counters.record_rx(pkt.len() as u64);
            match classify(pkt.data()) {
                PacketClass::Malformed => CoreCounters::add(&self.counters.rx_malformed, 1),
                class if class.is_latency_core_bound() => {
                    // Hardware steering keeps these off our queues unless the
                    // port is virtualized.
                    match self.to_latency.as_mut() {
                        Some(ring) => match ring.enqueue(Message::LatencyPacket { direction: dir, buf: pkt }) {
                            Ok(()) => CoreCounters::add(&self.counters.forwarded, 1),
                            Err(RingFull(_)) => CoreCounters::add(&self.counters.ring_full_drops, 1),
                        },
                        None => CoreCounters::add(&self.counters.latency_unrouted, 1),
                    }
                }
                _ => {}
            }
        }
        self.rx_burst = burst;
        received
    }

    /// Generate the packets `dir` owes at `now`.
    pub fn generate(&mut self, dir: Direction, now: u64) -> usize {
        let due = self.sides[dir.index()].pacer.due(now, self.settings.burst_size);
        let mut made = 0;
        for _ in 0..due {
            let Some((flow, first)) = self.source.next(dir) else {
                CoreCounters::add(&self.counters.nat_held, 1);
                continue;
            };
            let learn = first && self.settings.nat_learn.enabled();
            let frame = self.source.build(dir, flow, first, self.settings.nat_learn);
            let Some(mut buf) = self.pool.alloc_with(&frame) else {
                CoreCounters::add(&self.counters.alloc_failures, 1);
                break;
            };
            // Learn packets must reach the NAT learner, not the checker.
            let side = &mut self.sides[dir.index()];
            if !learn
                && side.sampler.should_sample()
                && side.sampler.tag(&mut buf, self.source.flow_id(flow), dir == Direction::Server, now)
            {
                CoreCounters::add(&self.counters.rx_check_tagged, 1);
            }
            self.enqueue_for_send(dir, buf);
            made += 1;
        }
        made
    }

    /// One pass over both sides. Returns true if anything moved.
    pub fn poll_once(&mut self, now: u64) -> bool {
        let mut busy = false;
        for dir in Direction::BOTH {
            busy |= self.generate(dir, now) > 0;
            if self.flush(dir) > 0 {
                busy = true;
            }
            busy |= self.drain_incoming(dir) > 0;
        }
        busy
    }

    /// Apply a translation event from the latency core.
    pub fn apply_nat(&mut self, event: &NatEvent) {
        let Some(flow) = self.source.local_flow(event.flow) else {
            CoreCounters::add(&self.counters.nat_lookup_no_flow, 1);
            return;
        };
        match event.kind {
            NatEventKind::Learned => {
                let translation = Translation { addr: event.external, port: event.external_port };
                if !self.source.translate(flow, translation) {
                    CoreCounters::add(&self.counters.nat_lookup_no_flow, 1);
                    return;
                }
                debug!("Core {}: flow {} translated to {}:{}", self.id, event.flow, event.external, event.external_port);
                if self.settings.nat_learn_verify && !self.source.is_identity(flow, translation) {
                    CoreCounters::add(&self.counters.nat_learn_error, 1);
                }
            }
            NatEventKind::Aged => {
                self.source.forget(flow);
            }
            NatEventKind::Refreshed => {}
        }
    }

    /// Apply pending events from the latency core, at most one burst.
    pub fn drain_nat_events(&mut self, from_latency: &mut RingConsumer<Message>) -> usize {
        let mut applied = 0;
        for _ in 0..self.settings.burst_size {
            match from_latency.dequeue() {
                Some(Message::NatEvent(event)) => {
                    self.apply_nat(&event);
                    applied += 1;
                }
                Some(other) => debug!("Core {} ignoring '{}' from latency core", self.id, other.kind()),
                None => break,
            }
        }
        applied
    }

    /// Status messages are advisory; a full ring costs only the message.
    fn send_status(counters: &CoreCounters, to_control: &mut RingProducer<Message>, core: usize, kind: StatusKind) {
        if to_control.enqueue(Message::Status { core, kind }).is_err() {
            CoreCounters::add(&counters.status_drops, 1);
        }
    }

    fn check_links(&mut self, to_control: &mut RingProducer<Message>) {
        for side in &mut self.sides {
            let up = side.io.link_up();
            if side.link_up && !up {
                let port = side.io.port_id();
                warn!("Core {}: link lost on port {}", self.id, port);
                Self::send_status(&self.counters, to_control, self.id, StatusKind::LinkLost(port));
            }
            side.link_up = up;
        }
    }

    fn idle(&self, now: u64) {
        let wait = self
            .sides
            .iter()
            .filter_map(|s| s.pacer.until_next(now))
            .min()
            .unwrap_or(IDLE_SLEEP)
            .min(MAX_IDLE);
        pause(wait);
    }

    /// Run to completion until the master sends `Quit`. The control ring is
    /// checked between bursts only.
    pub fn run(mut self, mut links: CoreLinks) {
        if let Some(ring) = links.to_latency.take() {
            self.to_latency = Some(ring);
        }
        Self::send_status(&self.counters, &mut links.to_control, self.id, StatusKind::Started);
        info!(
            "Core {} running on ports {} and {}",
            self.id,
            self.sides[0].io.port_id(),
            self.sides[1].io.port_id()
        );

        let mut loops: u32 = 0;
        loop {
            match links.from_control.dequeue() {
                Some(Message::Quit) => break,
                Some(other) => debug!("Core {} ignoring '{}' from control", self.id, other.kind()),
                None => {}
            }

            let mut busy = self.drain_nat_events(&mut links.from_latency) > 0;
            let now = self.clock.now_ns();
            busy |= self.poll_once(now);

            loops = loops.wrapping_add(1);
            if loops % LINK_CHECK_EVERY == 0 {
                self.check_links(&mut links.to_control);
            }
            if !busy {
                self.idle(now);
            }
        }

        for dir in Direction::BOTH {
            self.flush(dir);
        }
        let snap = self.counters.snapshot();
        info!(
            "Core {} stopping: {} packets sent, {} received, {} dropped",
            self.id, snap.tx_packets, snap.rx_packets, snap.tx_dropped
        );
        Self::send_status(&self.counters, &mut links.to_control, self.id, StatusKind::Stopped);
        if links
            .to_control
            .enqueue_bounded(Message::QuitAck { core: self.id }, self.settings.quit_ack_retries)
            .is_err()
        {
            warn!("Core {} could not acknowledge quit", self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, MonotonicClock};
    use crate::messaging::build_fabric;
    use crate::port::{NicPort, SoftPort};
    use crate::ring_buffer::ring;

    const MS: u64 = 1_000_000;

    fn settings() -> DpSettings {
        DpSettings { traffic_rate: 0, tx_backoff: Duration::from_micros(1), ..DpSettings::from(&EngineConfig::default()) }
    }

    fn core_with(settings: DpSettings, rx_depth: usize, clock: Arc<dyn Clock>) -> (DataPlaneCore, Vec<Arc<dyn NicPort>>, MbufPool) {
        let ports = SoftPort::pairs(2, "soft", 1, 1, rx_depth);
        let client = ports[0].open_queues(Some(0), Some(0)).unwrap();
        let server = ports[1].open_queues(Some(0), Some(0)).unwrap();
        let pool = MbufPool::new(1024);
        let source = TrafficSource::new(0, settings.flows, settings.packet_size).with_nat_learning(settings.nat_learn.enabled());
        let core = DataPlaneCore::new(
            0,
            settings,
            client,
            server,
            source,
            pool.clone(),
            Arc::new(CoreCounters::default()),
            clock,
        );
        (core, ports, pool)
    }

    fn udp(pool: &MbufPool, src_port: u16) -> PacketBuf {
        let flow = FlowTuple {
            src: Ipv4Addr::new(16, 0, 0, 1),
            dst: Ipv4Addr::new(48, 0, 0, 1),
            src_port,
            dst_port: 80,
        };
        pool.alloc_with(&wire::build_udp(&flow, &[], 100)).unwrap()
    }

    #[test]
    fn test_flush_within_capacity() {
        let (mut core, _ports, pool) = core_with(settings(), 64, Arc::new(ManualClock::new()));
        for i in 0..10 {
            core.enqueue_for_send(Direction::Client, udp(&pool, i));
        }
        assert_eq!(core.pending(Direction::Client), 10);
        assert_eq!(core.flush(Direction::Client), 10);

        let snap = core.counters.snapshot();
        assert_eq!(snap.tx_packets, 10);
        assert_eq!(snap.tx_bytes, 1000);
        assert_eq!(snap.tx_dropped, 0);
        assert_eq!(snap.tx_retries, 0);
    }

    #[test]
    fn test_flush_retry_is_bounded_and_drops_remainder() {
        let cfg = DpSettings { tx_retry_limit: 3, ..settings() };
        let (mut core, ports, pool) = core_with(cfg, 5, Arc::new(ManualClock::new()));
        for i in 0..8 {
            core.enqueue_for_send(Direction::Client, udp(&pool, i));
        }
        let requested = core.pending(Direction::Client);

        // Nobody drains the peer, so retries can never succeed
        let sent = core.flush(Direction::Client);
        assert_eq!(sent, 5);
        let snap = core.counters.snapshot();
        assert_eq!(snap.tx_retries, 3);
        assert_eq!(snap.tx_queue_full, 1);
        assert_eq!(snap.tx_dropped, (requested - sent) as u64);
        assert_eq!(core.pending(Direction::Client), 0);
        // Dropped buffers went back to the pool
        assert_eq!(pool.stats().in_use, 5);
        assert_eq!(ports[0].counters().snapshot().opackets, 5);
    }

    #[test]
    fn test_zero_retry_limit_drops_immediately() {
        let cfg = DpSettings { tx_retry_limit: 0, ..settings() };
        let (mut core, _ports, pool) = core_with(cfg, 2, Arc::new(ManualClock::new()));
        for i in 0..4 {
            core.enqueue_for_send(Direction::Server, udp(&pool, i));
        }
        assert_eq!(core.flush(Direction::Server), 2);
        let snap = core.counters.snapshot();
        assert_eq!(snap.tx_retries, 0);
        assert_eq!(snap.tx_dropped, 2);
    }

    #[test]
    fn test_full_buffer_flushes_automatically() {
        let cfg = DpSettings { burst_size: 4, ..settings() };
        let (mut core, _ports, pool) = core_with(cfg, 64, Arc::new(ManualClock::new()));
        for i in 0..3 {
            core.enqueue_for_send(Direction::Client, udp(&pool, i));
        }
        assert_eq!(core.counters.snapshot().tx_packets, 0);
        core.enqueue_for_send(Direction::Client, udp(&pool, 3));
        assert_eq!(core.pending(Direction::Client), 0);
        assert_eq!(core.counters.snapshot().tx_packets, 4);
    }

    #[test]
    fn test_drain_routes_by_class() {
        let (mut core, _ports, pool) = core_with(settings(), 64, Arc::new(ManualClock::new()));
        let (tx, mut rx) = ring("dp0->latency", 1);
        core.set_latency_ring(Some(tx));

        let probe = wire::build_sctp(Ipv4Addr::new(16, 0, 0, 1), Ipv4Addr::new(48, 0, 0, 1), &[0; 16], 64);
        core.enqueue_for_send(Direction::Client, udp(&pool, 1));
        core.enqueue_for_send(Direction::Client, pool.alloc_with(&probe).unwrap());
        core.enqueue_for_send(Direction::Client, pool.alloc_with(&probe).unwrap());
        let mut bad = udp(&pool, 2);
        // IHL below the minimum header length
        bad.data_mut()[wire::ETH_HDR_LEN] = 0x44;
        core.enqueue_for_send(Direction::Client, bad);
        core.flush(Direction::Client);

        assert_eq!(core.drain_incoming(Direction::Server), 4);
        let snap = core.counters.snapshot();
        assert_eq!(snap.rx_packets, 4);
        assert_eq!(snap.forwarded, 1);
        assert_eq!(snap.ring_full_drops, 1);
        assert_eq!(snap.rx_malformed, 1);

        // Only the forwarded probe is still out of the pool
        assert_eq!(pool.stats().in_use, 1);
        match rx.dequeue() {
            Some(Message::LatencyPacket { direction, buf }) => {
                assert_eq!(direction, Direction::Server);
                assert_eq!(buf.port, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_pacer_due() {
        let mut pacer = RatePacer::new(1000);
        assert_eq!(pacer.due(0, 32), 1);
        assert_eq!(pacer.due(0, 32), 0);
        assert_eq!(pacer.due(10 * MS, 32), 10);
        assert_eq!(pacer.until_next(10 * MS), Some(Duration::from_millis(1)));
        // A long stall is forgiven after one burst
        assert_eq!(pacer.due(1000 * MS, 32), 32);
        assert_eq!(pacer.due(1000 * MS, 32), 0);
        assert_eq!(RatePacer::new(0).due(MS, 32), 0);
        assert_eq!(RatePacer::new(0).until_next(0), None);
    }

    #[test]
    fn test_generate_paced_traffic() {
        let clock = ManualClock::new();
        let cfg = DpSettings { traffic_rate: 1000, ..settings() };
        let (mut core, ports, _pool) = core_with(cfg, 1024, Arc::new(clock.clone()));
        for _ in 0..100 {
            core.poll_once(clock.now_ns());
            clock.advance(Duration::from_millis(1));
        }
        // The last server packet is still waiting on the client port
        core.drain_incoming(Direction::Client);
        let snap = core.counters.snapshot();
        assert_eq!(snap.tx_packets, 200);
        assert_eq!(snap.rx_packets, 200);
        assert_eq!(ports[0].counters().snapshot().opackets, 100);
        assert_eq!(ports[1].counters().snapshot().opackets, 100);
    }

    #[test]
    fn test_first_client_packet_announces_flow() {
        let mut source = TrafficSource::new(1, 2, 128);
        assert_eq!(source.next(Direction::Client), Some((0, true)));
        assert_eq!(source.next(Direction::Client), Some((1, true)));
        assert_eq!(source.next(Direction::Client), Some((0, false)));
        assert_eq!(source.next(Direction::Server), Some((0, false)));

        let frame = source.build(Direction::Client, 0, true, NatLearnMode::IpOption);
        assert_eq!(classify(&frame), PacketClass::NatLearn);
        let frame = source.build(Direction::Client, 0, true, NatLearnMode::TcpAck);
        assert_eq!(classify(&frame), PacketClass::NatLearn);
        let frame = source.build(Direction::Client, 0, true, NatLearnMode::Off);
        assert_eq!(classify(&frame), PacketClass::Ordinary);
        assert_eq!(source.flow_id(0), (1 << 16) + 1);
        assert_eq!(flow_owner(u64::from(source.flow_id(1))), Some(1));
        assert_eq!(flow_owner(0), None);
    }

    #[test]
    fn test_server_packets_wait_for_translation() {
        let mut source = TrafficSource::new(0, 2, 128).with_nat_learning(true);
        assert_eq!(source.next(Direction::Client), Some((0, true)));
        assert_eq!(source.next(Direction::Client), Some((1, true)));
        assert_eq!(source.next(Direction::Server), None);
        assert_eq!(source.next(Direction::Server), None);
        assert_eq!(source.next(Direction::Server), None);
        assert_eq!(source.held(0), 2);
        assert_eq!(source.held(1), 1);

        let translation = Translation { addr: Ipv4Addr::new(10, 0, 0, 9), port: 5000 };
        assert!(source.translate(0, translation));
        assert!(!source.translate(0, translation));
        assert_eq!(source.held(0), 0);
        // Held packets go out first, then the round robin resumes
        assert_eq!(source.next(Direction::Server), Some((0, false)));
        assert_eq!(source.next(Direction::Server), Some((0, false)));
        assert_eq!(source.next(Direction::Server), None);
        assert_eq!(source.held(1), 2);

        let back = source.tuple(Direction::Server, 0);
        assert_eq!((back.dst, back.dst_port), (translation.addr, translation.port));
        let untranslated = source.tuple(Direction::Server, 1);
        assert_eq!(untranslated.dst, source.tuple(Direction::Client, 1).src);

        // An aged translation makes the client announce the flow again
        assert!(source.forget(0));
        assert_eq!(source.translation(0), None);
        assert_eq!(source.next(Direction::Client), Some((0, true)));
    }

    #[test]
    fn test_local_flow_lookup() {
        let source = TrafficSource::new(2, 4, 128);
        let other = TrafficSource::new(3, 4, 128);
        assert_eq!(source.local_flow(u64::from(source.flow_id(3))), Some(3));
        assert_eq!(source.local_flow(u64::from(source.flow_id(4))), None);
        assert_eq!(source.local_flow(u64::from(other.flow_id(0))), None);
        assert_eq!(source.local_flow(0), None);
        assert_eq!(source.local_flow(u64::MAX), None);
    }

    #[test]
    fn test_nat_events_from_latency_core() {
        let clock = ManualClock::new();
        let cfg = DpSettings {
            traffic_rate: 1000,
            flows: 4,
            nat_learn: NatLearnMode::IpOption,
            nat_learn_verify: true,
            ..settings()
        };
        let (mut core, _ports, _pool) = core_with(cfg, 1024, Arc::new(clock.clone()));
        assert_eq!(core.generate(Direction::Client, 0), 1);
        assert_eq!(core.generate(Direction::Server, 0), 0);
        assert_eq!(core.counters.snapshot().nat_held, 1);

        let client = core.source.tuple(Direction::Client, 0);
        let learned = NatEvent {
            port: 1,
            flow: u64::from(core.source.flow_id(0)),
            external: client.src,
            external_port: client.src_port,
            kind: NatEventKind::Learned,
        };
        let foreign = NatEvent { flow: u64::from(TrafficSource::new(5, 4, 128).flow_id(0)), ..learned };
        let (_control, mut links, mut latency) = build_fabric(1, false, 16);
        for event in [learned, learned, foreign] {
            latency.to_cores[0].enqueue(Message::NatEvent(event)).unwrap();
        }
        assert_eq!(core.drain_nat_events(&mut links[0].from_latency), 3);
        let snap = core.counters.snapshot();
        assert_eq!(snap.nat_lookup_no_flow, 2);
        assert_eq!(snap.nat_learn_error, 0);

        // The held server packet is released to the learned address
        assert_eq!(core.generate(Direction::Server, MS), 1);
        let sent = core.sides[1].pending.iter().next().unwrap();
        let view = wire::parse_ipv4(sent.data()).unwrap();
        assert_eq!(view.dst, client.src);

        // A translation that rewrote the client address fails verification
        core.generate(Direction::Client, 2 * MS);
        let rewritten = NatEvent {
            flow: u64::from(core.source.flow_id(1)),
            external: Ipv4Addr::new(198, 51, 100, 7),
            ..learned
        };
        core.apply_nat(&rewritten);
        assert_eq!(core.counters.snapshot().nat_learn_error, 1);
        assert_eq!(core.source.translation(1).map(|t| t.addr), Some(Ipv4Addr::new(198, 51, 100, 7)));
    }

    #[test]
    fn test_latency_traffic_without_ring_counted() {
        let (mut core, _ports, pool) = core_with(settings(), 64, Arc::new(ManualClock::new()));
        let probe = wire::build_sctp(Ipv4Addr::new(16, 0, 0, 1), Ipv4Addr::new(48, 0, 0, 1), &[0; 16], 64);
        core.enqueue_for_send(Direction::Client, pool.alloc_with(&probe).unwrap());
        core.flush(Direction::Client);

        assert_eq!(core.drain_incoming(Direction::Server), 1);
        let snap = core.counters.snapshot();
        assert_eq!(snap.latency_unrouted, 1);
        assert_eq!(snap.forwarded, 0);
        assert_eq!(pool.stats().in_use, 0);
    }

    #[test]
    fn test_sampler_tags_every_nth() {
        let clock = ManualClock::new();
        let cfg = DpSettings { traffic_rate: 1000, sample_interval: 4, ..settings() };
        let (mut core, _ports, _pool) = core_with(cfg, 1024, Arc::new(clock.clone()));
        core.generate(Direction::Client, 0);
        core.generate(Direction::Client, 15 * MS);
        core.flush(Direction::Client);
        assert_eq!(core.counters.snapshot().tx_packets, 16);
        assert_eq!(core.counters.snapshot().rx_check_tagged, 4);

        let mut got = Burst::new();
        assert_eq!(core.sides[1].io.receive_burst(32, &mut got), 16);
        let tagged = got.iter().filter(|p| classify(p.data()) == PacketClass::RxCheckTag).count();
        assert_eq!(tagged, 4);
    }

    #[test]
    fn test_run_acknowledges_quit() {
        let cfg = DpSettings { traffic_rate: 10_000, ..settings() };
        let (core, _ports, _pool) = core_with(cfg, 1024, Arc::new(MonotonicClock));
        let counters = core.counters.clone();
        let (mut control, mut links, _latency) = build_fabric(1, false, 16);
        let links = links.remove(0);

        let handle = thread::spawn(move || core.run(links));
        thread::sleep(Duration::from_millis(20));
        control.to_cores[0].enqueue(Message::Quit).unwrap();
        handle.join().unwrap();

        let mut kinds = Vec::new();
        while let Some(msg) = control.from_cores[0].dequeue() {
            kinds.push(msg.kind());
        }
        assert_eq!(kinds.first(), Some(&"status"));
        assert_eq!(kinds.last(), Some(&"quit-ack"));
        assert!(counters.snapshot().tx_packets > 0);
    }

    #[test]
    fn test_status_dropped_on_full_ring_is_counted() {
        let cfg = DpSettings { traffic_rate: 1000, quit_ack_retries: 1, ..settings() };
        let (core, _ports, _pool) = core_with(cfg, 1024, Arc::new(MonotonicClock));
        let counters = core.counters.clone();
        let (mut control, mut links, _latency) = build_fabric(1, false, 1);
        let links = links.remove(0);

        let handle = thread::spawn(move || core.run(links));
        thread::sleep(Duration::from_millis(10));
        control.to_cores[0].enqueue(Message::Quit).unwrap();
        handle.join().unwrap();

        // Started took the only slot; Stopped had nowhere to go
        assert!(matches!(control.from_cores[0].dequeue(), Some(Message::Status { kind: StatusKind::Started, .. })));
        assert_eq!(counters.snapshot().status_drops, 1);
    }
}
