use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use super::{hardware_rules, settle, DriverCapability, DriverCaps, DriverOptions, ExtendedStats, FilterRequest, FilterSetup};
use crate::error::EngineError;
use crate::port::{NicPort, RxSteering};
use crate::wire::FCS_LEN;

const MIN_SAMPLE_INTERVAL: u32 = 13;
const LINK_BUDGET: Duration = Duration::from_secs(10);

/// Full-featured NIC family: drop queue, RSS and flow steering in hardware.
pub struct SoftDriver {
    link_settle: Duration,
}

impl SoftDriver {
    pub fn create(options: &DriverOptions) -> Arc<dyn DriverCapability> {
        Arc::new(SoftDriver { link_settle: options.link_settle })
    }
}

impl DriverCapability for SoftDriver {
    fn name(&self) -> &'static str {
        "soft"
    }

    fn caps(&self) -> DriverCaps {
        DriverCaps {
            drop_queue: true,
            rss: true,
            flow_director: true,
            drop_on_link_down: true,
        }
    }

    fn minimum_sample_interval(&self) -> u32 {
        MIN_SAMPLE_INTERVAL
    }

    fn configure_hardware_filters(&self, port: &dyn NicPort, req: &FilterRequest) -> Result<FilterSetup, EngineError> {
        if req.virtualized {
            let (start, end) = req.rss_queues;
            port.steering().program(Some(RxSteering {
                drop_errors: true,
                latency_queue: None,
                drop_queue: false,
                rss_start: start,
                rss_end: end,
            }));
            return Ok(FilterSetup::Software { rss_queues: req.rss_queues });
        }
        if (req.latency || req.rx_check) && port.rx_queue_count() < 2 {
            return Err(EngineError::CapabilityMissing {
                port: port.id(),
                driver: self.name().to_string(),
                capability: "reserved latency queue",
            });
        }
        let rules = hardware_rules(self.caps(), req);
        info!(
            "Port {}: hardware filters latency_queue={:?} rss={}..{}",
            port.id(),
            rules.latency_queue,
            rules.rss_start,
            rules.rss_end
        );
        let setup = FilterSetup::Hardware {
            latency_queue: rules.latency_queue,
            rss_queues: (rules.rss_start, rules.rss_end),
        };
        port.steering().program(Some(rules));
        Ok(setup)
    }

    fn extended_stats(&self, port: &dyn NicPort) -> ExtendedStats {
        let s = port.counters().snapshot();
        // Hardware byte counters include the FCS the queues never see
        ExtendedStats {
            ipackets: s.ipackets,
            opackets: s.opackets,
            ibytes: s.ibytes + s.ipackets * FCS_LEN as u64,
            obytes: s.obytes + s.opackets * FCS_LEN as u64,
            ierrors: s.ierrors,
            oerrors: s.oerrors,
            imissed: s.imissed,
            hw_drops: s.hw_drops,
        }
    }

    fn link_wait_budget(&self) -> Duration {
        LINK_BUDGET
    }

    fn wait_for_stable_link(&self) {
        debug!("soft: waiting {:?} for link to settle", self.link_settle);
        settle(self.link_settle, LINK_BUDGET);
    }
}
