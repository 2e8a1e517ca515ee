use std::net::Ipv4Addr;

use crate::packet::{Direction, PacketBuf};
use crate::ring_buffer::{ring, RingConsumer, RingMonitor, RingProducer};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatEventKind {
    Learned,
    Refreshed,
    Aged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NatEvent {
    pub port: u16,
    /// Traffic flow id, 0 for the latency flow of `port`.
    pub flow: u64,
    pub external: Ipv4Addr,
    pub external_port: u16,
    pub kind: NatEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusKind {
    Started,
    /// A port served by the core lost link mid-run.
    LinkLost(u16),
    Stopped,
}

/// Everything that crosses a core boundary. Packet-carrying variants own
/// their buffer; a successful enqueue moves it out of the producer.
#[derive(Debug)]
pub enum Message {
    LatencyPacket { direction: Direction, buf: PacketBuf },
    Quit,
    QuitAck { core: usize },
    NatEvent(NatEvent),
    Status { core: usize, kind: StatusKind },
    /// Clear the receiver's counters.
    ResetCounters,
}

impl Message {
    pub fn kind(&self) -> &'static str {
        match self {
            Message::LatencyPacket { .. } => "latency-packet",
            Message::Quit => "quit",
            Message::QuitAck { .. } => "quit-ack",
            Message::NatEvent(_) => "nat-event",
            Message::Status { .. } => "status",
            Message::ResetCounters => "reset-counters",
        }
    }
}

/// Ring endpoints held by one data-plane core.
pub struct CoreLinks {
    pub core: usize,
    pub from_control: RingConsumer<Message>,
    pub to_control: RingProducer<Message>,
    /// Only present when the latency core cannot read NIC queues itself.
    pub to_latency: Option<RingProducer<Message>>,
    /// Translations of this core's flows.
    pub from_latency: RingConsumer<Message>,
}

/// Ring endpoints held by the latency core.
pub struct LatencyLinks {
    pub from_control: RingConsumer<Message>,
    pub to_control: RingProducer<Message>,
    pub from_cores: Vec<RingConsumer<Message>>,
    /// One per data-plane core, indexed by core id.
    pub to_cores: Vec<RingProducer<Message>>,
}

/// Ring endpoints held by the master.
pub struct ControlLinks {
    pub to_cores: Vec<RingProducer<Message>>,
    pub from_cores: Vec<RingConsumer<Message>>,
    pub to_latency: RingProducer<Message>,
    pub from_latency: RingConsumer<Message>,
    monitors: Vec<RingMonitor>,
}

impl ControlLinks {
    pub fn monitors(&self) -> &[RingMonitor] {
        &self.monitors
    }
}

/// Build one ring per producer/consumer pair that is actually used.
pub fn build_fabric(
    dp_cores: usize,
    virtualized: bool,
    capacity: usize,
) -> (ControlLinks, Vec<CoreLinks>, LatencyLinks) {
    let mut monitors = Vec::new();
    let mut to_cores = Vec::with_capacity(dp_cores);
    let mut from_cores = Vec::with_capacity(dp_cores);
    let mut core_links = Vec::with_capacity(dp_cores);
    let mut latency_inputs = Vec::new();
    let mut latency_outputs = Vec::with_capacity(dp_cores);

    for core in 0..dp_cores {
        let (ctl_tx, ctl_rx) = ring(&format!("control->dp{}", core), capacity);
        let (evt_tx, evt_rx) = ring(&format!("dp{}->control", core), capacity);
        let (nat_tx, nat_rx) = ring(&format!("latency->dp{}", core), capacity);
        monitors.push(ctl_tx.monitor());
        monitors.push(evt_tx.monitor());
        monitors.push(nat_tx.monitor());
        latency_outputs.push(nat_tx);

        let to_latency = if virtualized {
            let (lat_tx, lat_rx) = ring(&format!("dp{}->latency", core), capacity);
            monitors.push(lat_tx.monitor());
            latency_inputs.push(lat_rx);
            Some(lat_tx)
        } else {
            None
        };

        to_cores.push(ctl_tx);
        from_cores.push(evt_rx);
        core_links.push(CoreLinks {
            core,
            from_control: ctl_rx,
            to_control: evt_tx,
            to_latency,
            from_latency: nat_rx,
        });
    }

    let (lat_ctl_tx, lat_ctl_rx) = ring("control->latency", capacity);
    let (lat_evt_tx, lat_evt_rx) = ring("latency->control", capacity);
    monitors.push(lat_ctl_tx.monitor());
    monitors.push(lat_evt_tx.monitor());

    let control = ControlLinks {
        to_cores,
        from_cores,
        to_latency: lat_ctl_tx,
        from_latency: lat_evt_rx,
        monitors,
    };
    let latency = LatencyLinks {
        from_control: lat_ctl_rx,
        to_control: lat_evt_tx,
        from_cores: latency_inputs,
        to_cores: latency_outputs,
    };
    (control, core_links, latency)
}
