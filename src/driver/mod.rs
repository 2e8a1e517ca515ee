//! The capability contract every NIC family implements, and the registry
//! that selects one by name at start-up.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, info};

use crate::error::EngineError;
use crate::port::{NicPort, RxSteering};

pub mod soft;
pub mod udp;
pub mod vnic;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DriverCaps {
    /// Hardware can discard a queue's traffic, isolating the latency queue.
    pub drop_queue: bool,
    pub rss: bool,
    pub flow_director: bool,
    /// Frames sent while the link is down are dropped, not queued.
    pub drop_on_link_down: bool,
}

/// What the engine needs steered on one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterRequest {
    /// Latency and verification traffic must reach the reserved queue.
    pub latency: bool,
    pub rx_check: bool,
    /// Queues `[start, end)` owned by data-plane cores.
    pub rss_queues: (u16, u16),
    /// No hardware steering possible; cores classify in software.
    pub virtualized: bool,
}

/// Result of programming filters on one port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterSetup {
    Hardware { latency_queue: Option<u16>, rss_queues: (u16, u16) },
    /// Traffic arrives unsteered; data-plane cores forward latency packets
    /// to the latency core over rings.
    Software { rss_queues: (u16, u16) },
}

/// Hardware counters beyond what the queue handles expose.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtendedStats {
    pub ipackets: u64,
    pub opackets: u64,
    /// Byte counts as the wire sees them, FCS included.
    pub ibytes: u64,
    pub obytes: u64,
    pub ierrors: u64,
    pub oerrors: u64,
    pub imissed: u64,
    pub hw_drops: u64,
}

/// Settings shared by every driver instance.
#[derive(Debug, Clone, Default)]
pub struct DriverOptions {
    /// Extra settle time after link-up before traffic is trusted.
    pub link_settle: Duration,
}

pub trait DriverCapability: Send + Sync {
    fn name(&self) -> &'static str;

    fn caps(&self) -> DriverCaps;

    /// Smallest RX-check sampling interval the hardware can sustain.
    fn minimum_sample_interval(&self) -> u32;

    /// Program steering so bad frames are dropped, latency traffic reaches
    /// the reserved queue and, if asked, ordinary traffic is spread by RSS.
    /// Fails when latency is requested without drop-queue support.
    fn configure_hardware_filters(&self, port: &dyn NicPort, req: &FilterRequest) -> Result<FilterSetup, EngineError>;

    fn clear_hardware_filters(&self, port: &dyn NicPort) {
        port.steering().program(None);
    }

    fn extended_stats(&self, port: &dyn NicPort) -> ExtendedStats {
        let s = port.counters().snapshot();
        ExtendedStats {
            ipackets: s.ipackets,
            opackets: s.opackets,
            ibytes: s.ibytes,
            obytes: s.obytes,
            ierrors: s.ierrors,
            oerrors: s.oerrors,
            imissed: s.imissed,
            hw_drops: s.hw_drops,
        }
    }

    /// Upper bound on `wait_for_stable_link`.
    fn link_wait_budget(&self) -> Duration;

    /// Blocking settle time after link-up. Never exceeds `link_wait_budget`.
    fn wait_for_stable_link(&self);

    fn set_promiscuous_like_capture(&self, port: &dyn NicPort, on: bool) {
        debug!("Port {}: promiscuous capture {}", port.id(), if on { "on" } else { "off" });
        port.steering().set_promiscuous(on);
    }
}

/// Sleep for `settle`, clamped to `budget`.
pub(crate) fn settle(settle: Duration, budget: Duration) {
    let wait = settle.min(budget);
    if !wait.is_zero() {
        thread::sleep(wait);
    }
}

/// Steering rules common to drivers that have a drop queue.
pub(crate) fn hardware_rules(caps: DriverCaps, req: &FilterRequest) -> RxSteering {
    let (start, end) = if caps.rss { req.rss_queues } else { (0, 0) };
    let reserved = req.latency || req.rx_check;
    RxSteering {
        drop_errors: true,
        latency_queue: reserved.then_some(1),
        drop_queue: reserved,
        rss_start: start,
        rss_end: end,
    }
}

pub type DriverCtor = fn(&DriverOptions) -> Arc<dyn DriverCapability>;

/// Name to constructor map. Backends register here; nothing else in the
/// engine names a concrete driver.
pub struct DriverRegistry {
    ctors: BTreeMap<&'static str, DriverCtor>,
}

impl DriverRegistry {
    pub fn empty() -> Self {
        Self { ctors: BTreeMap::new() }
    }

    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("soft", soft::SoftDriver::create);
        registry.register("vnic", vnic::VnicDriver::create);
        registry.register("udp", udp::UdpDriver::create);
        registry
    }

    pub fn register(&mut self, name: &'static str, ctor: DriverCtor) {
        self.ctors.insert(name, ctor);
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.ctors.keys().copied().collect()
    }

    pub fn create(&self, name: &str, options: &DriverOptions) -> Result<Arc<dyn DriverCapability>, EngineError> {
        let ctor = self
            .ctors
            .get(name)
            .ok_or_else(|| EngineError::UnknownDriver(name.to_string()))?;
        let driver = ctor(options);
        info!("Selected driver '{}' ({:?})", driver.name(), driver.caps());
        Ok(driver)
    }
}

impl Default for DriverRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_names() {
        let registry = DriverRegistry::with_builtins();
        assert_eq!(registry.names(), vec!["soft", "udp", "vnic"]);
    }

    #[test]
    fn test_unknown_driver() {
        let registry = DriverRegistry::with_builtins();
        assert!(matches!(
            registry.create("ixgbe", &DriverOptions::default()),
            Err(EngineError::UnknownDriver(name)) if name == "ixgbe"
        ));
    }

    #[test]
    fn test_custom_registration() {
        let mut registry = DriverRegistry::empty();
        registry.register("mine", soft::SoftDriver::create);
        let driver = registry.create("mine", &DriverOptions::default()).unwrap();
        assert_eq!(driver.name(), "soft");
    }

    #[test]
    fn test_hardware_rules_without_rss() {
        let caps = DriverCaps { drop_queue: true, ..Default::default() };
        let req = FilterRequest { latency: true, rx_check: false, rss_queues: (2, 4), virtualized: false };
        let rules = hardware_rules(caps, &req);
        assert_eq!(rules.latency_queue, Some(1));
        assert!(rules.drop_queue);
        assert_eq!((rules.rss_start, rules.rss_end), (0, 0));
    }

    #[test]
    fn test_settle_respects_budget() {
        let start = std::time::Instant::now();
        settle(Duration::from_secs(5), Duration::from_millis(5));
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}
