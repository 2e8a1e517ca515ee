use std::time::Duration;

use crate::error::EngineError;
use crate::rx_check::MAX_TOLERANCE;

/// How a side learns the translated address of its flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NatLearnMode {
    Off,
    /// Learn from a dedicated IPv4 option carried by the first reply.
    IpOption,
    /// Learn from a TCP SYN whose ack field carries the flow id.
    TcpAck,
}

impl NatLearnMode {
    pub fn enabled(self) -> bool {
        self != NatLearnMode::Off
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProbeProtocol {
    Sctp,
    Icmp,
}

pub const MAX_PORTS: u16 = 256;

/// Engine configuration, already validated by whatever loader produced it.
/// `validate()` still re-checks the invariants the engine relies on.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub port_count: u16,
    pub rx_queues: u16,
    pub tx_queues: u16,
    pub dp_cores_per_pair: usize,
    pub driver: String,
    pub virtualized: bool,

    // Latency probes
    pub probe_rate: u32,
    pub probe_protocol: ProbeProtocol,
    pub icmp_reply: bool,
    pub nat_learn: NatLearnMode,
    /// Treat any learned translation that differs from the client address
    /// as an error, for setups without a NAT in the path.
    pub nat_learn_verify: bool,

    // RX correctness checker, every Nth packet per side. 0 disables sampling.
    pub sample_interval: u32,
    pub rx_check_timeout: Duration,
    pub rx_check_tolerance: u32,

    // Data plane
    pub burst_size: usize,
    pub tx_retry_limit: u32,
    pub tx_backoff: Duration,
    pub traffic_rate: u64,
    pub flows: u32,
    pub packet_size: usize,
    pub ring_capacity: usize,
    pub pool_size: usize,

    // Housekeeping
    pub sync_interval: Duration,
    pub nat_timeout: Duration,
    pub poll_interval: Duration,
    pub link_settle: Duration,
    pub quit_ack_retries: u32,
    pub quit_ack_wait: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port_count: 2,
            rx_queues: 4,
            tx_queues: 4,
            dp_cores_per_pair: 1,
            driver: "soft".to_string(),
            virtualized: false,
            probe_rate: 1000,
            probe_protocol: ProbeProtocol::Sctp,
            icmp_reply: false,
            nat_learn: NatLearnMode::Off,
            nat_learn_verify: false,
            sample_interval: 0,
            rx_check_timeout: Duration::from_secs(1),
            rx_check_tolerance: 64,
            burst_size: 32,
            tx_retry_limit: 16,
            tx_backoff: Duration::from_micros(10),
            traffic_rate: 10_000,
            flows: 16,
            packet_size: 128,
            ring_capacity: 1024,
            pool_size: 8192,
            sync_interval: Duration::from_millis(100),
            nat_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_millis(500),
            link_settle: Duration::from_millis(0),
            quit_ack_retries: 20,
            quit_ack_wait: Duration::from_millis(50),
        }
    }
}

impl EngineConfig {
    pub fn pair_count(&self) -> usize {
        usize::from(self.port_count / 2)
    }

    pub fn dp_core_count(&self) -> usize {
        self.pair_count() * self.dp_cores_per_pair
    }

    /// Latency mode needs the reserved queue and the drop queue in hardware.
    pub fn latency_enabled(&self) -> bool {
        self.probe_rate > 0
    }

    pub fn rx_check_enabled(&self) -> bool {
        self.sample_interval > 0
    }

    /// TX queue used by the latency core on every port. Data-plane cores take
    /// the queues below it.
    pub fn latency_tx_queue(&self) -> u16 {
        self.dp_cores_per_pair as u16
    }

    /// First RX queue owned by data-plane cores. Queue 0 is the catch-all
    /// and queue 1 is reserved while latency or verification traffic is
    /// steered in hardware; a virtualized port has no reserved queues.
    pub fn dp_rx_queue_base(&self) -> u16 {
        if self.virtualized {
            0
        } else if self.latency_enabled() || self.rx_check_enabled() {
            2
        } else {
            1
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        let fail = |reason: String| Err(EngineError::InvalidConfig(reason));

        if self.port_count < 2 || self.port_count % 2 != 0 {
            return fail(format!("port count must be even and at least 2, got {}", self.port_count));
        }
        // Probe headers carry the generating port in a single byte
        if self.port_count > MAX_PORTS {
            return fail(format!("port count {} exceeds {}", self.port_count, MAX_PORTS));
        }
        if self.dp_cores_per_pair == 0 {
            return fail("at least one data-plane core per port pair is required".to_string());
        }
        if usize::from(self.tx_queues) < self.dp_cores_per_pair + 1 {
            return fail(format!(
                "{} tx queues cannot serve {} data-plane cores plus the latency core",
                self.tx_queues, self.dp_cores_per_pair
            ));
        }
        let base = usize::from(self.dp_rx_queue_base());
        if usize::from(self.rx_queues) < base + self.dp_cores_per_pair {
            return fail(format!(
                "{} rx queues cannot serve {} data-plane cores starting at queue {}",
                self.rx_queues, self.dp_cores_per_pair, base
            ));
        }
        if self.burst_size == 0 || self.burst_size > 256 {
            return fail(format!("burst size {} out of range 1..=256", self.burst_size));
        }
        if self.ring_capacity == 0 {
            return fail("ring capacity must be positive".to_string());
        }
        if self.pool_size < self.burst_size * 4 {
            return fail(format!("pool of {} buffers is too small for bursts of {}", self.pool_size, self.burst_size));
        }
        if self.probe_rate > 1_000_000 {
            return fail(format!("probe rate {} exceeds 1M/s", self.probe_rate));
        }
        if self.packet_size < 64 || self.packet_size > 1500 {
            return fail(format!("packet size {} out of range 64..=1500", self.packet_size));
        }
        if self.flows == 0 || self.flows > 1 << 16 {
            return fail(format!("flow count {} out of range 1..=65536", self.flows));
        }
        if self.sync_interval.is_zero() || self.poll_interval.is_zero() {
            return fail("sync and poll intervals must be non-zero".to_string());
        }
        if self.rx_check_tolerance == 0 || self.rx_check_tolerance > MAX_TOLERANCE {
            return fail(format!("rx check tolerance {} out of range 1..={}", self.rx_check_tolerance, MAX_TOLERANCE));
        }
        if self.icmp_reply && self.probe_protocol != ProbeProtocol::Icmp {
            return fail("icmp reply mode requires the icmp probe protocol".to_string());
        }
        Ok(())
    }
}
