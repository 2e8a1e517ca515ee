use std::sync::Arc;

use tracing::info;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::driver::{DriverCapability, DriverOptions, DriverRegistry};
use crate::error::EngineError;
use crate::latency::SharedLatencyReport;
use crate::mbuf_pool::MbufPool;
use crate::port::NicPort;
use crate::stats::{CoreCounters, EventCounters};

/// Everything the engine shares, built once at start-up and handed to the
/// master. Cores receive clones of the pieces they need.
pub struct EngineContext {
    pub config: EngineConfig,
    pub driver: Arc<dyn DriverCapability>,
    pub ports: Vec<Arc<dyn NicPort>>,
    pub pool: MbufPool,
    /// One entry per data-plane core, indexed by core id.
    pub counters: Vec<Arc<CoreCounters>>,
    pub latency_report: SharedLatencyReport,
    pub events: EventCounters,
    pub clock: Arc<dyn Clock>,
}

impl EngineContext {
    /// Validate `config`, select the driver by name and discover ports.
    /// `discover` stands in for the platform layer that enumerates NICs.
    pub fn build<F>(
        config: EngineConfig,
        registry: &DriverRegistry,
        clock: Arc<dyn Clock>,
        discover: F,
    ) -> Result<Self, EngineError>
    where
        F: FnOnce(&EngineConfig, &MbufPool) -> Result<Vec<Arc<dyn NicPort>>, EngineError>,
    {
        config.validate()?;
        let driver = registry.create(&config.driver, &DriverOptions { link_settle: config.link_settle })?;
        let pool = MbufPool::new(config.pool_size);
        let ports = discover(&config, &pool)?;
        if ports.len() != usize::from(config.port_count) {
            return Err(EngineError::InvalidConfig(format!(
                "configured {} ports, discovered {}",
                config.port_count,
                ports.len()
            )));
        }
        let counters = (0..config.dp_core_count()).map(|_| Arc::new(CoreCounters::default())).collect();

        info!(
            "Engine context: {} ports, {} data-plane cores, {} buffers, driver '{}'",
            ports.len(),
            config.dp_core_count(),
            config.pool_size,
            driver.name()
        );
        Ok(Self {
            config,
            driver,
            ports,
            pool,
            counters,
            latency_report: SharedLatencyReport::default(),
            events: EventCounters::default(),
            clock,
        })
    }

    pub fn port(&self, id: u16) -> Option<&Arc<dyn NicPort>> {
        self.ports.get(usize::from(id))
    }

    /// Id the latency core uses on the control rings.
    pub fn latency_core_id(&self) -> usize {
        self.config.dp_core_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::port::soft::{SoftPort, DEFAULT_RX_DEPTH};

    fn soft(cfg: &EngineConfig, _pool: &MbufPool) -> Result<Vec<Arc<dyn NicPort>>, EngineError> {
        Ok(SoftPort::pairs(cfg.port_count, &cfg.driver, cfg.rx_queues, cfg.tx_queues, DEFAULT_RX_DEPTH))
    }

    #[test]
    fn test_build_soft_context() {
        let cfg = EngineConfig { port_count: 4, ..Default::default() };
        let ctx = EngineContext::build(cfg, &DriverRegistry::with_builtins(), Arc::new(ManualClock::new()), soft).unwrap();
        assert_eq!(ctx.ports.len(), 4);
        assert_eq!(ctx.counters.len(), 2);
        assert_eq!(ctx.latency_core_id(), 2);
        assert_eq!(ctx.driver.name(), "soft");
        assert_eq!(ctx.port(3).map(|p| p.id()), Some(3));
        assert!(ctx.port(4).is_none());
    }

    #[test]
    fn test_unknown_driver_is_fatal() {
        let cfg = EngineConfig { driver: "e1000".to_string(), ..Default::default() };
        let result = EngineContext::build(cfg, &DriverRegistry::with_builtins(), Arc::new(ManualClock::new()), soft);
        assert!(matches!(result, Err(EngineError::UnknownDriver(_))));
    }

    #[test]
    fn test_port_count_must_match_discovery() {
        let cfg = EngineConfig::default();
        let result = EngineContext::build(cfg, &DriverRegistry::with_builtins(), Arc::new(ManualClock::new()), |_, _| {
            Ok(SoftPort::pairs(4, "soft", 4, 4, 16))
        });
        assert!(matches!(result, Err(EngineError::InvalidConfig(_))));
    }
}
