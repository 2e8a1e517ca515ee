use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{settle, DriverCapability, DriverCaps, DriverOptions, FilterRequest, FilterSetup};
use crate::error::EngineError;
use crate::port::{NicPort, RxSteering};

const MIN_SAMPLE_INTERVAL: u32 = 8;
const LINK_BUDGET: Duration = Duration::from_secs(2);

/// Paravirtual NIC: RSS only, no drop queue and no flow steering. Latency
/// and verification traffic must be picked out in software.
pub struct VnicDriver {
    link_settle: Duration,
}

impl VnicDriver {
    pub fn create(options: &DriverOptions) -> Arc<dyn DriverCapability> {
        Arc::new(VnicDriver { link_settle: options.link_settle })
    }
}

impl DriverCapability for VnicDriver {
    fn name(&self) -> &'static str {
        "vnic"
    }

    fn caps(&self) -> DriverCaps {
        DriverCaps {
            drop_queue: false,
            rss: true,
            flow_director: false,
            drop_on_link_down: false,
        }
    }

    fn minimum_sample_interval(&self) -> u32 {
        MIN_SAMPLE_INTERVAL
    }

    fn configure_hardware_filters(&self, port: &dyn NicPort, req: &FilterRequest) -> Result<FilterSetup, EngineError> {
        if (req.latency || req.rx_check) && !req.virtualized {
            return Err(EngineError::CapabilityMissing {
                port: port.id(),
                driver: self.name().to_string(),
                capability: "drop queue",
            });
        }
        let (start, end) = req.rss_queues;
        port.steering().program(Some(RxSteering {
            drop_errors: false,
            latency_queue: None,
            drop_queue: false,
            rss_start: start,
            rss_end: end,
        }));
        Ok(FilterSetup::Software { rss_queues: req.rss_queues })
    }

    fn link_wait_budget(&self) -> Duration {
        LINK_BUDGET
    }

    fn wait_for_stable_link(&self) {
        debug!("vnic: waiting {:?} for link to settle", self.link_settle);
        settle(self.link_settle, LINK_BUDGET);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::SoftPort;

    #[test]
    fn test_latency_without_drop_queue_is_fatal() {
        let (a, _b) = SoftPort::pair(0, 1, "vnic", 4, 4, 8);
        let driver = VnicDriver::create(&DriverOptions::default());
        let req = FilterRequest { latency: true, rx_check: false, rss_queues: (0, 2), virtualized: false };
        let err = driver.configure_hardware_filters(&*a, &req).unwrap_err();
        assert!(matches!(err, EngineError::CapabilityMissing { capability: "drop queue", .. }));
        assert_eq!(a.steering().current(), None);
    }

    #[test]
    fn test_virtualized_falls_back_to_software() {
        let (a, _b) = SoftPort::pair(0, 1, "vnic", 4, 4, 8);
        let driver = VnicDriver::create(&DriverOptions::default());
        let req = FilterRequest { latency: true, rx_check: true, rss_queues: (0, 2), virtualized: true };
        assert_eq!(
            driver.configure_hardware_filters(&*a, &req).unwrap(),
            FilterSetup::Software { rss_queues: (0, 2) }
        );
    }
}
