//! Latency probes: header format, measurement state, NAT learning and the
//! manager that runs on the latency core.

pub mod header;
pub mod histogram;
pub mod jitter;
pub mod manager;
pub mod nat;

pub use manager::{LatencyCounters, LatencyManager, LatencyPortReport, LatencyReport, LatencySettings, SharedLatencyReport};
