//! Core lifecycle: `Init -> ProbeLink -> Running -> Stopping -> Done`.
//!
//! Every fatal condition is detected before the first core thread exists.
//! Once running, the master only reads counters and drains status rings;
//! shutdown waits for acknowledgements within a fixed retry budget and never
//! blocks on a core that stopped answering.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::context::EngineContext;
use crate::dp_core::{DataPlaneCore, DpSettings, TrafficSource};
use crate::driver::{FilterRequest, FilterSetup};
use crate::error::EngineError;
use crate::latency::{LatencyManager, LatencySettings};
use crate::messaging::{build_fabric, ControlLinks, Message, NatEventKind, StatusKind};
use crate::port::PortIo;
use crate::stats::{CoreSnapshot, EngineReport, EventCounters, PortReport};

const STOP_CHECK: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Init,
    ProbeLink,
    Running,
    Stopping,
    Done,
}

pub struct Master {
    ctx: EngineContext,
    state: MasterState,
    links_verified: bool,
    setups: Vec<FilterSetup>,
    control: Option<ControlLinks>,
    handles: Vec<(usize, JoinHandle<()>)>,
    started_at: Option<Instant>,
    stuck: Vec<usize>,
    sanity_failed: bool,
}

impl Master {
    pub fn new(ctx: EngineContext) -> Self {
        Self {
            ctx,
            state: MasterState::Init,
            links_verified: false,
            setups: Vec::new(),
            control: None,
            handles: Vec::new(),
            started_at: None,
            stuck: Vec::new(),
            sanity_failed: false,
        }
    }

    pub fn state(&self) -> MasterState {
        self.state
    }

    pub fn context(&self) -> &EngineContext {
        &self.ctx
    }

    /// Filter setup chosen per port during `init`.
    pub fn filter_setups(&self) -> &[FilterSetup] {
        &self.setups
    }

    fn transition(&mut self, next: MasterState) {
        info!("Master: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    fn expect_state(&self, expected: MasterState, op: &str) -> Result<(), EngineError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(EngineError::InvalidConfig(format!("{} called in state {:?}", op, self.state)))
        }
    }

    fn clear_filters(&self) {
        for port in &self.ctx.ports {
            self.ctx.driver.clear_hardware_filters(port.as_ref());
        }
    }

    /// INIT: check that every port belongs to the selected driver, clamp the
    /// sampling interval to what the hardware sustains and program filters.
    /// Any error here is fatal and leaves no filter programmed.
    pub fn init(&mut self) -> Result<(), EngineError> {
        self.expect_state(MasterState::Init, "init")?;
        self.ctx.config.validate()?;

        let driver = self.ctx.driver.clone();
        let expected = driver.name();
        for port in &self.ctx.ports {
            if port.driver_name() != expected {
                return Err(EngineError::DriverMismatch {
                    port: port.id(),
                    expected: expected.to_string(),
                    found: port.driver_name().to_string(),
                });
            }
            if port.rx_queue_count() < self.ctx.config.rx_queues || port.tx_queue_count() < self.ctx.config.tx_queues {
                return Err(EngineError::PortSetup {
                    port: port.id(),
                    reason: format!(
                        "has {}/{} rx/tx queues, {}/{} configured",
                        port.rx_queue_count(),
                        port.tx_queue_count(),
                        self.ctx.config.rx_queues,
                        self.ctx.config.tx_queues
                    ),
                });
            }
        }

        let minimum = driver.minimum_sample_interval();
        let requested = self.ctx.config.sample_interval;
        if requested > 0 && requested < minimum {
            warn!(
                "Sample interval {} is below the '{}' minimum of {}, using {}",
                requested, expected, minimum, minimum
            );
            self.ctx.config.sample_interval = minimum;
        }

        let cfg = &self.ctx.config;
        let base = cfg.dp_rx_queue_base();
        let request = FilterRequest {
            latency: cfg.latency_enabled(),
            rx_check: cfg.rx_check_enabled(),
            rss_queues: (base, base + cfg.dp_cores_per_pair as u16),
            virtualized: cfg.virtualized,
        };
        let mut setups = Vec::with_capacity(self.ctx.ports.len());
        for port in &self.ctx.ports {
            match driver.configure_hardware_filters(port.as_ref(), &request) {
                Ok(setup) => {
                    debug!("Port {}: {:?}", port.id(), setup);
                    setups.push(setup);
                }
                Err(e) => {
                    self.clear_filters();
                    return Err(e);
                }
            }
        }
        self.setups = setups;
        self.transition(MasterState::ProbeLink);
        Ok(())
    }

    /// PROBE_LINK: wait the driver's settle time with capture open, then
    /// require every link up.
    pub fn probe_link(&mut self) -> Result<(), EngineError> {
        self.expect_state(MasterState::ProbeLink, "probe_link")?;
        let driver = self.ctx.driver.clone();
        for port in &self.ctx.ports {
            driver.set_promiscuous_like_capture(port.as_ref(), true);
        }
        info!("Waiting up to {:?} for links to settle", driver.link_wait_budget());
        driver.wait_for_stable_link();

        let down: Vec<u16> = self.ctx.ports.iter().filter(|p| !p.link_up()).map(|p| p.id()).collect();
        for port in &self.ctx.ports {
            driver.set_promiscuous_like_capture(port.as_ref(), false);
        }
        if let Some(&port) = down.first() {
            self.clear_filters();
            return Err(EngineError::LinkDown(port));
        }
        info!("All {} links up", self.ctx.ports.len());
        self.links_verified = true;
        Ok(())
    }

    /// Claim the queues of every data-plane core and of the latency core.
    fn open_all_queues(&self) -> Result<(Vec<(Box<dyn PortIo>, Box<dyn PortIo>)>, Vec<Box<dyn PortIo>>), EngineError> {
        let cfg = &self.ctx.config;
        let dp_cores = cfg.dp_core_count();
        let base = cfg.dp_rx_queue_base();
        let mut dp_queues: Vec<(Box<dyn PortIo>, Box<dyn PortIo>)> = Vec::with_capacity(dp_cores);
        for core in 0..dp_cores {
            let pair = core / cfg.dp_cores_per_pair;
            let slot = (core % cfg.dp_cores_per_pair) as u16;
            let open = |port: usize| -> Result<Box<dyn PortIo>, EngineError> {
                self.ctx.ports[port].open_queues(Some(base + slot), Some(slot))
            };
            dp_queues.push((open(pair * 2)?, open(pair * 2 + 1)?));
        }
        let reserved = !cfg.virtualized && (cfg.latency_enabled() || cfg.rx_check_enabled());
        let latency_rx = reserved.then_some(1);
        let mut latency_ios = Vec::with_capacity(self.ctx.ports.len());
        for port in &self.ctx.ports {
            latency_ios.push(port.open_queues(latency_rx, Some(cfg.latency_tx_queue()))?);
        }
        Ok((dp_queues, latency_ios))
    }

    /// Open every queue, then spawn one pinned thread per data-plane core and
    /// one for the latency core. Queue claims fail before any thread starts.
    pub fn start(&mut self) -> Result<(), EngineError> {
        self.expect_state(MasterState::ProbeLink, "start")?;
        if !self.links_verified {
            return Err(EngineError::InvalidConfig("start called before links were verified".to_string()));
        }
        let cfg = self.ctx.config.clone();
        let dp_cores = cfg.dp_core_count();

        let (dp_queues, latency_ios) = match self.open_all_queues() {
            Ok(queues) => queues,
            Err(e) => {
                // Claims already made are released as the handles drop
                error!("Start failed: {}", e);
                self.clear_filters();
                self.links_verified = false;
                return Err(e);
            }
        };

        let (control, core_links, latency_links) = build_fabric(dp_cores, cfg.virtualized, cfg.ring_capacity);

        let cpus = num_cpus::get();
        if cpus < dp_cores + 2 {
            warn!("{} CPUs for {} data-plane cores, a latency core and the master", cpus, dp_cores);
        }
        let core_ids = match core_affinity::get_core_ids() {
            Some(ids) if !ids.is_empty() => {
                info!("Detected {} CPU cores for affinity", ids.len());
                Some(ids)
            }
            _ => {
                info!("CPU affinity not supported on this platform, continuing without core pinning");
                None
            }
        };
        let cpu_for = |index: usize| core_ids.as_ref().map(|ids| ids[index % ids.len()]);
        let latency_cpu = core_ids.as_ref().and_then(|ids| ids.last().copied());

        self.control = Some(control);
        self.started_at = Some(Instant::now());
        self.transition(MasterState::Running);

        let settings = DpSettings::from(&cfg);
        let mut spawn_error = None;
        for (links, (client, server)) in core_links.into_iter().zip(dp_queues) {
            let core = links.core;
            let dp = DataPlaneCore::new(
                core,
                settings.clone(),
                client,
                server,
                TrafficSource::new(core, cfg.flows, cfg.packet_size).with_nat_learning(cfg.nat_learn.enabled()),
                self.ctx.pool.clone(),
                self.ctx.counters[core].clone(),
                self.ctx.clock.clone(),
            );
            let cpu = cpu_for(core + 1);
            let spawned = thread::Builder::new().name(format!("dp-{}", core)).spawn(move || {
                pin(cpu, core);
                dp.run(links);
            });
            match spawned {
                Ok(handle) => self.handles.push((core, handle)),
                Err(e) => {
                    spawn_error = Some(EngineError::Spawn(format!("data-plane core {}: {}", core, e)));
                    break;
                }
            }
        }

        if spawn_error.is_none() {
            let latency_core = self.ctx.latency_core_id();
            let manager = LatencyManager::new(
                LatencySettings::from(&cfg),
                latency_ios,
                self.ctx.pool.clone(),
                self.ctx.clock.clone(),
                self.ctx.latency_report.clone(),
            );
            let spawned = thread::Builder::new().name("latency".to_string()).spawn(move || {
                pin(latency_cpu, latency_core);
                manager.run(latency_links, latency_core);
            });
            match spawned {
                Ok(handle) => self.handles.push((latency_core, handle)),
                Err(e) => spawn_error = Some(EngineError::Spawn(format!("latency core: {}", e))),
            }
        }

        if let Some(e) = spawn_error {
            error!("Start failed: {}", e);
            self.stop();
            return Err(e);
        }
        info!("Started {} data-plane cores and the latency core", dp_cores);
        Ok(())
    }

    /// Drain status messages from every core and aggregate counters.
    pub fn poll(&mut self) -> EngineReport {
        if let Some(control) = self.control.as_mut() {
            let rings = control.from_cores.iter_mut().chain(std::iter::once(&mut control.from_latency));
            for ring in rings {
                while let Some(msg) = ring.dequeue() {
                    Self::handle_message(&self.ctx.events, msg);
                }
            }
        }
        if self.state == MasterState::Running {
            for (core, handle) in &self.handles {
                if handle.is_finished() && !self.sanity_failed {
                    error!("Core {} exited while running", core);
                    self.ctx.events.bump("core_exited");
                    self.sanity_failed = true;
                }
            }
        }
        self.report()
    }

    /// True once a core died on its own; the run loop then stops the engine.
    pub fn sanity_failed(&self) -> bool {
        self.sanity_failed
    }

    fn handle_message(events: &EventCounters, msg: Message) {
        match msg {
            Message::Status { core, kind } => match kind {
                StatusKind::Started => {
                    debug!("Core {} started", core);
                    events.bump("core_started");
                }
                StatusKind::LinkLost(port) => {
                    warn!("Core {} reports link lost on port {}", core, port);
                    events.bump("link_lost");
                }
                StatusKind::Stopped => events.bump("core_stopped"),
            },
            Message::NatEvent(event) => {
                debug!("NAT {:?} on port {}: flow {} via {}", event.kind, event.port, event.flow, event.external);
                events.bump(match event.kind {
                    NatEventKind::Learned => "nat_learned",
                    NatEventKind::Refreshed => "nat_refreshed",
                    NatEventKind::Aged => "nat_aged",
                });
            }
            other => debug!("Master ignoring '{}'", other.kind()),
        }
    }

    pub fn report(&self) -> EngineReport {
        let cores: Vec<CoreSnapshot> = self.ctx.counters.iter().map(|c| c.snapshot()).collect();
        let mut total = CoreSnapshot::default();
        for snap in &cores {
            total.merge(snap);
        }
        EngineReport {
            elapsed_secs: self.started_at.map_or(0.0, |t| t.elapsed().as_secs_f64()),
            cores,
            total,
            ports: self
                .ctx
                .ports
                .iter()
                .map(|p| PortReport {
                    port: p.id(),
                    link_up: p.link_up(),
                    stats: p.counters().snapshot(),
                    extended: self.ctx.driver.extended_stats(p.as_ref()),
                })
                .collect(),
            latency: self.ctx.latency_report.lock().clone(),
            pool: self.ctx.pool.stats(),
            rings: self
                .control
                .as_ref()
                .map(|c| c.monitors().iter().map(|m| m.get_stats()).collect())
                .unwrap_or_default(),
            events: self.ctx.events.snapshot(),
            stuck_cores: self.stuck.clone(),
        }
    }

    /// Poll every `poll_interval` until `stop` is raised or a core dies,
    /// handing each report to `sink`.
    pub fn run_until<F>(&mut self, stop: &AtomicBool, mut sink: F)
    where
        F: FnMut(&EngineReport),
    {
        let interval = self.ctx.config.poll_interval;
        let mut last = Instant::now();
        while !stop.load(Ordering::Acquire) && !self.sanity_failed {
            thread::sleep(STOP_CHECK.min(interval));
            if last.elapsed() >= interval {
                last = Instant::now();
                let report = self.poll();
                sink(&report);
            }
        }
    }

    /// STOPPING: quit every core, wait for acknowledgements within the retry
    /// budget, then tear down filters. Always ends in `Done`.
    pub fn stop(&mut self) -> EngineReport {
        match self.state {
            MasterState::Done => return self.report(),
            MasterState::Running => {}
            _ => {
                self.clear_filters();
                self.transition(MasterState::Done);
                return self.report();
            }
        }
        self.transition(MasterState::Stopping);

        let retries = self.ctx.config.quit_ack_retries;
        let wait = self.ctx.config.quit_ack_wait;
        let expected: BTreeSet<usize> = self.handles.iter().map(|(core, _)| *core).collect();
        let mut acked = BTreeSet::new();

        if let Some(mut control) = self.control.take() {
            for (core, ring) in control.to_cores.iter_mut().enumerate() {
                if ring.enqueue_bounded(Message::Quit, retries).is_err() {
                    warn!("Could not deliver quit to core {}", core);
                }
            }
            if control.to_latency.enqueue_bounded(Message::Quit, retries).is_err() {
                warn!("Could not deliver quit to the latency core");
            }

            for _ in 0..retries {
                let rings = control.from_cores.iter_mut().chain(std::iter::once(&mut control.from_latency));
                for ring in rings {
                    while let Some(msg) = ring.dequeue() {
                        match msg {
                            Message::QuitAck { core } => {
                                acked.insert(core);
                            }
                            other => Self::handle_message(&self.ctx.events, other),
                        }
                    }
                }
                if acked.is_superset(&expected) {
                    break;
                }
                thread::sleep(wait);
            }
            self.control = Some(control);
        }

        for (core, handle) in std::mem::take(&mut self.handles) {
            if acked.contains(&core) {
                if handle.join().is_err() {
                    error!("Core {} panicked during shutdown", core);
                }
            } else {
                error!("Core {} did not acknowledge quit after {} retries, detaching it", core, retries);
                self.ctx.events.bump("stuck_core");
                self.stuck.push(core);
            }
        }

        self.clear_filters();
        let report = self.report();
        info!(
            "Engine stopped: {} packets sent, {} dropped, {} probes measured",
            report.total.tx_packets,
            report.total.tx_dropped,
            report.latency.total().pkt_ok
        );
        self.transition(MasterState::Done);
        report
    }

    /// Explicit user reset. Nothing else ever clears a counter.
    pub fn reset_counters(&mut self) {
        for counters in &self.ctx.counters {
            counters.reset();
        }
        for port in &self.ctx.ports {
            port.counters().reset();
        }
        self.ctx.pool.reset_counters();
        self.ctx.events.reset();
        let delivered = match self.control.as_mut() {
            Some(control) if self.state == MasterState::Running => {
                control.to_latency.enqueue(Message::ResetCounters).is_ok()
            }
            _ => false,
        };
        if !delivered {
            *self.ctx.latency_report.lock() = Default::default();
        }
        info!("Counters reset");
    }

    /// Full lifecycle: fatal errors surface before any core starts; once
    /// running, stops when `stop` is raised.
    pub fn run<F>(ctx: EngineContext, stop: Arc<AtomicBool>, sink: F) -> Result<EngineReport, EngineError>
    where
        F: FnMut(&EngineReport),
    {
        let mut master = Master::new(ctx);
        master.init()?;
        master.probe_link()?;
        master.start()?;
        master.run_until(&stop, sink);
        if master.sanity_failed() {
            warn!("Stopping after a failed sanity check");
        }
        Ok(master.stop())
    }
}

fn pin(cpu: Option<core_affinity::CoreId>, core: usize) {
    if let Some(cpu) = cpu {
        if core_affinity::set_for_current(cpu) {
            debug!("Core {} pinned to CPU {}", core, cpu.id);
        } else {
            debug!("Failed to set CPU affinity for core {}", core);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MonotonicClock;
    use crate::config::{EngineConfig, NatLearnMode};
    use crate::driver::DriverRegistry;
    use crate::mbuf_pool::MbufPool;
    use crate::port::soft::{SoftPort, DEFAULT_RX_DEPTH};
    use crate::port::NicPort;
    use crate::wire;

    fn fast(cfg: EngineConfig) -> EngineConfig {
        EngineConfig {
            traffic_rate: 2000,
            probe_rate: 200,
            sync_interval: Duration::from_millis(10),
            poll_interval: Duration::from_millis(20),
            quit_ack_wait: Duration::from_millis(20),
            quit_ack_retries: 100,
            ..cfg
        }
    }

    fn context(cfg: EngineConfig, ports: Vec<Arc<dyn NicPort>>) -> EngineContext {
        EngineContext::build(cfg, &DriverRegistry::with_builtins(), Arc::new(MonotonicClock), move |_, _: &MbufPool| {
            Ok(ports)
        })
        .unwrap()
    }

    fn soft_ports(cfg: &EngineConfig, driver: &str) -> Vec<Arc<dyn NicPort>> {
        SoftPort::pairs(cfg.port_count, driver, cfg.rx_queues, cfg.tx_queues, DEFAULT_RX_DEPTH)
    }

    #[test]
    fn test_latency_without_drop_queue_is_fatal() {
        let cfg = EngineConfig { driver: "vnic".to_string(), probe_rate: 100, ..Default::default() };
        let ports = soft_ports(&cfg, "vnic");
        let mut master = Master::new(context(cfg, ports.clone()));

        let err = master.init().unwrap_err();
        assert!(matches!(err, EngineError::CapabilityMissing { capability: "drop queue", .. }));
        assert_eq!(master.state(), MasterState::Init);
        assert!(master.handles.is_empty());
        assert!(ports.iter().all(|p| p.steering().current().is_none()));
        // No core ever started
        assert_eq!(master.report().total, CoreSnapshot::default());
    }

    #[test]
    fn test_driver_mismatch_is_fatal() {
        let cfg = EngineConfig::default();
        let ports = soft_ports(&cfg, "vnic");
        let mut master = Master::new(context(cfg, ports));
        assert!(matches!(master.init(), Err(EngineError::DriverMismatch { port: 0, .. })));
    }

    #[test]
    fn test_link_down_is_fatal() {
        let cfg = EngineConfig::default();
        let (a, b) = SoftPort::pair(0, 1, "soft", cfg.rx_queues, cfg.tx_queues, 64);
        b.set_link(false);
        let ports: Vec<Arc<dyn NicPort>> = vec![a.clone(), b.clone()];
        let mut master = Master::new(context(cfg, ports));

        master.init().unwrap();
        assert!(a.steering().current().is_some());
        assert!(matches!(master.probe_link(), Err(EngineError::LinkDown(1))));
        assert!(a.steering().current().is_none());
        assert!(!a.steering().promiscuous());
        assert!(master.start().is_err());
    }

    #[test]
    fn test_busy_queue_clears_filters() {
        let cfg = EngineConfig::default();
        let ports = soft_ports(&cfg, "soft");
        let mut master = Master::new(context(cfg, ports.clone()));
        master.init().unwrap();
        master.probe_link().unwrap();

        let held = ports[1].open_queues(Some(1), None).unwrap();
        let err = master.start().unwrap_err();
        assert!(matches!(err, EngineError::QueueBusy { port: 1, queue: 1 }));
        assert!(ports.iter().all(|p| p.steering().current().is_none()));
        assert!(master.handles.is_empty());
        assert!(master.start().is_err());

        // Every other claim was released
        drop(held);
        assert!(ports[0].open_queues(Some(1), Some(1)).is_ok());
        assert!(ports[1].open_queues(Some(2), Some(0)).is_ok());
    }

    #[test]
    fn test_sample_interval_clamped_to_driver_minimum() {
        let cfg = EngineConfig { sample_interval: 4, ..Default::default() };
        let ports = soft_ports(&cfg, "soft");
        let mut master = Master::new(context(cfg, ports));
        master.init().unwrap();
        assert_eq!(master.context().config.sample_interval, 13);
        assert_eq!(master.state(), MasterState::ProbeLink);
    }

    #[test]
    fn test_virtualized_filters_are_software() {
        let cfg = EngineConfig { driver: "vnic".to_string(), virtualized: true, ..Default::default() };
        let ports = soft_ports(&cfg, "vnic");
        let mut master = Master::new(context(cfg, ports));
        master.init().unwrap();
        assert!(master.filter_setups().iter().all(|s| matches!(s, FilterSetup::Software { rss_queues: (0, 1) })));
    }

    fn run_for(cfg: EngineConfig, driver: &str, run: Duration) -> (Master, EngineReport) {
        let ports = soft_ports(&cfg, driver);
        let mut master = Master::new(context(cfg, ports));
        master.init().unwrap();
        master.probe_link().unwrap();
        master.start().unwrap();
        assert_eq!(master.state(), MasterState::Running);
        thread::sleep(run);
        master.poll();
        let report = master.stop();
        (master, report)
    }

    #[test]
    fn test_start_and_stop() {
        let cfg = fast(EngineConfig { sample_interval: 16, ..Default::default() });
        let (master, report) = run_for(cfg, "soft", Duration::from_millis(300));

        assert_eq!(master.state(), MasterState::Done);
        assert!(report.stuck_cores.is_empty());
        assert!(report.total.tx_packets > 0);
        assert!(report.total.rx_packets > 0);
        assert!(report.latency.total().tx_ok > 0);
        assert!(report.latency.total().pkt_ok > 0);
        assert_eq!(report.latency.total().seq_error, 0);
        assert!(report.latency.rx_check.total > 0);
        assert_eq!(report.latency.rx_check.duplicate, 0);
        assert!(report.events.contains(&("core_started", 1)));
        assert!(master.context().ports.iter().all(|p| p.steering().current().is_none()));
        assert!(master.handles.is_empty());
    }

    #[test]
    fn test_report_carries_driver_counters() {
        let cfg = fast(EngineConfig::default());
        let (_master, report) = run_for(cfg, "soft", Duration::from_millis(100));
        assert_eq!(report.ports.len(), 2);
        for p in &report.ports {
            assert!(p.extended.opackets > 0, "port {}", p.port);
            assert_eq!(p.extended.opackets, p.stats.opackets);
            assert_eq!(p.extended.obytes, p.stats.obytes + p.stats.opackets * wire::FCS_LEN as u64);
            assert_eq!(p.extended.ibytes, p.stats.ibytes + p.stats.ipackets * wire::FCS_LEN as u64);
        }
    }

    #[test]
    fn test_nat_learning_releases_server_traffic() {
        let cfg = fast(EngineConfig {
            nat_learn: NatLearnMode::IpOption,
            nat_learn_verify: true,
            flows: 4,
            ..Default::default()
        });
        let (_master, report) = run_for(cfg, "soft", Duration::from_millis(300));
        // The first server slot always precedes the translation
        assert!(report.total.nat_held > 0);
        assert_eq!(report.total.nat_lookup_no_flow, 0);
        assert_eq!(report.total.nat_learn_error, 0);
        assert!(report.events.iter().any(|&(name, n)| name == "nat_learned" && n >= 4));
        // Server traffic flowed once learned, well beyond the peer's probes
        let probes_from_server = report.latency.ports[1].counters.tx_ok;
        assert!(report.ports[0].stats.ipackets > probes_from_server + 100);
    }

    #[test]
    fn test_virtualized_forwards_to_latency_core() {
        let cfg = fast(EngineConfig { driver: "vnic".to_string(), virtualized: true, ..Default::default() });
        let (_master, report) = run_for(cfg, "vnic", Duration::from_millis(300));
        assert!(report.total.forwarded > 0);
        assert!(report.latency.total().pkt_ok > 0);
    }

    #[test]
    fn test_stop_is_bounded_without_acks() {
        let cfg = fast(EngineConfig { quit_ack_retries: 0, ..Default::default() });
        let ports = soft_ports(&cfg, "soft");
        let mut master = Master::new(context(cfg, ports));
        master.init().unwrap();
        master.probe_link().unwrap();
        master.start().unwrap();

        // A zero budget never waits, so every core counts as stuck
        let started = Instant::now();
        let report = master.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(master.state(), MasterState::Done);
        assert_eq!(report.stuck_cores, vec![0, 1]);
        assert!(report.events.contains(&("stuck_core", 2)));
    }

    #[test]
    fn test_reset_counters() {
        let cfg = fast(EngineConfig::default());
        let (mut master, report) = run_for(cfg, "soft", Duration::from_millis(100));
        assert!(report.total.tx_packets > 0);
        master.reset_counters();
        let report = master.report();
        assert_eq!(report.total, CoreSnapshot::default());
        assert!(report.ports.iter().all(|p| p.stats.opackets == 0));
        assert!(report.latency.ports.is_empty());
    }
}
