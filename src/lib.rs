//! Multi-core traffic generator engine: burst packet I/O on NIC queues,
//! latency probing with NAT learning, sampled RX correctness checking and
//! the master that runs it all.

pub mod classify;
pub mod clock;
pub mod config;
pub mod context;
pub mod dp_core;
pub mod driver;
pub mod error;
pub mod latency;
pub mod master;
pub mod mbuf_pool;
pub mod messaging;
pub mod packet;
pub mod port;
pub mod ring_buffer;
pub mod rx_check;
pub mod stats;
pub mod wire;

pub use config::EngineConfig;
pub use context::EngineContext;
pub use error::EngineError;
pub use master::{Master, MasterState};
pub use stats::EngineReport;
