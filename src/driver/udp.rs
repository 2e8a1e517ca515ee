use std::sync::Arc;
use std::time::Duration;

use super::{hardware_rules, DriverCapability, DriverCaps, DriverOptions, FilterRequest, FilterSetup};
use crate::error::EngineError;
use crate::port::{NicPort, RxSteering};

/// Kernel-socket backend. Steering is emulated by the sender, so it offers
/// the same rules as real hardware but no link settle time.
pub struct UdpDriver;

impl UdpDriver {
    pub fn create(_options: &DriverOptions) -> Arc<dyn DriverCapability> {
        Arc::new(UdpDriver)
    }
}

impl DriverCapability for UdpDriver {
    fn name(&self) -> &'static str {
        "udp"
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
        1
    }

    fn configure_hardware_filters(&self, port: &dyn NicPort, req: &FilterRequest) -> Result<FilterSetup, EngineError> {
        let (start, end) = req.rss_queues;
        if req.virtualized {
            port.steering().program(Some(RxSteering {
                drop_errors: true,
                latency_queue: None,
                drop_queue: false,
                rss_start: start,
                rss_end: end,
            }));
            return Ok(FilterSetup::Software { rss_queues: req.rss_queues });
        }
        let rules = hardware_rules(self.caps(), req);
        let setup = FilterSetup::Hardware {
            latency_queue: rules.latency_queue,
            rss_queues: (rules.rss_start, rules.rss_end),
        };
        port.steering().program(Some(rules));
        Ok(setup)
    }

    fn link_wait_budget(&self) -> Duration {
        Duration::ZERO
    }

    fn wait_for_stable_link(&self) {}
}
