use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use crossbeam::channel;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use trafgen_core::clock::MonotonicClock;
use trafgen_core::config::{NatLearnMode, ProbeProtocol};
use trafgen_core::driver::DriverRegistry;
use trafgen_core::port::soft::{SoftPort, DEFAULT_RX_DEPTH};
use trafgen_core::port::udp::UdpPort;
use trafgen_core::{EngineConfig, EngineContext, EngineReport, Master};

#[derive(Parser, Debug)]
#[command(name = "trafgen")]
#[command(about = "Multi-core traffic generator with latency probes and RX correctness checks")]
#[command(version = "1.0.0")]
struct Args {
    /// Number of ports, wired back-to-back in pairs
    #[arg(long, default_value = "2")]
    ports: u16,

    /// RX queues per port
    #[arg(long, default_value = "4")]
    rx_queues: u16,

    /// TX queues per port
    #[arg(long, default_value = "4")]
    tx_queues: u16,

    /// Data-plane cores per port pair
    #[arg(long, default_value = "1")]
    cores_per_pair: usize,

    /// Driver backend (soft, vnic, udp)
    #[arg(short, long, default_value = "soft")]
    driver: String,

    /// No hardware steering; data-plane cores forward latency traffic
    #[arg(long)]
    virtualized: bool,

    /// Latency probes per second per port, 0 disables probing
    #[arg(long, default_value = "1000")]
    probe_rate: u32,

    #[arg(long, value_enum, default_value = "sctp")]
    probe_protocol: ProbeArg,

    /// Odd ports answer ICMP echo requests instead of sending their own
    #[arg(long)]
    icmp_reply: bool,

    #[arg(long, value_enum, default_value = "off")]
    nat_learn: NatArg,

    /// Count learned translations that rewrite the client address as errors
    #[arg(long)]
    learn_verify: bool,

    /// Tag every Nth packet for RX checking, 0 disables
    #[arg(long, default_value = "0")]
    sample_interval: u32,

    /// Generated packets per second per side
    #[arg(short, long, default_value = "10000")]
    rate: u64,

    #[arg(long, default_value = "16")]
    flows: u32,

    #[arg(long, default_value = "128")]
    packet_size: usize,

    #[arg(long, default_value = "32")]
    burst: usize,

    /// Stop after this many seconds instead of waiting for Ctrl+C
    #[arg(long)]
    duration: Option<u64>,

    /// Report interval in milliseconds
    #[arg(long, default_value = "1000")]
    poll_ms: u64,

    #[arg(long, default_value = "info")]
    log_level: tracing::Level,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProbeArg {
    Sctp,
    Icmp,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum NatArg {
    Off,
    IpOption,
    TcpAck,
}

impl Args {
    fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            port_count: self.ports,
            rx_queues: self.rx_queues,
            tx_queues: self.tx_queues,
            dp_cores_per_pair: self.cores_per_pair,
            driver: self.driver.clone(),
            virtualized: self.virtualized,
            probe_rate: self.probe_rate,
            probe_protocol: match self.probe_protocol {
                ProbeArg::Sctp => ProbeProtocol::Sctp,
                ProbeArg::Icmp => ProbeProtocol::Icmp,
            },
            icmp_reply: self.icmp_reply,
            nat_learn: match self.nat_learn {
                NatArg::Off => NatLearnMode::Off,
                NatArg::IpOption => NatLearnMode::IpOption,
                NatArg::TcpAck => NatLearnMode::TcpAck,
            },
            nat_learn_verify: self.learn_verify,
            sample_interval: self.sample_interval,
            traffic_rate: self.rate,
            flows: self.flows,
            packet_size: self.packet_size,
            burst_size: self.burst,
            poll_interval: Duration::from_millis(self.poll_ms.max(1)),
            ..EngineConfig::default()
        }
    }
}

fn log_report(report: &EngineReport) {
    let latency = report.latency.total();
    info!(
        "TX: {} pkts ({} pps) - RX: {} pkts - Dropped: {} - Retries: {} - Forwarded: {}",
        report.total.tx_packets,
        report.tx_pps() as u64,
        report.total.rx_packets,
        report.total.tx_dropped,
        report.total.tx_retries,
        report.total.forwarded
    );
    if report.total.nat_lookup_no_flow > 0 || report.total.nat_learn_error > 0 {
        warn!(
            "NAT: {} translations without a waiting flow - {} learn errors",
            report.total.nat_lookup_no_flow, report.total.nat_learn_error
        );
    }
    for port in &report.latency.ports {
        info!(
            "Port {}: probes {}/{} ok, avg {:.1}us max {:.1}us jitter {:.1}us, errors {}",
            port.port,
            port.counters.pkt_ok,
            port.counters.tx_ok,
            port.histogram.avg_ns / 1000.0,
            port.histogram.max_ns as f64 / 1000.0,
            port.jitter_ns as f64 / 1000.0,
            port.counters.rx_errors()
        );
    }
    if report.latency.rx_check.total > 0 {
        let rc = &report.latency.rx_check;
        info!(
            "RX check: {} tagged, {} out of order, {} late, {} duplicate, {} timed out",
            rc.total, rc.out_of_order, rc.late, rc.duplicate, rc.timeout
        );
    }
    if latency.tx_err > 0 || report.pool.alloc_failures > 0 {
        warn!("Probe send errors: {} - buffer alloc failures: {}", latency.tx_err, report.pool.alloc_failures);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(args.log_level)
        .init();

    info!("Starting traffic generator");
    info!("Driver: {} - ports: {} - cores per pair: {}", args.driver, args.ports, args.cores_per_pair);

    let config = args.engine_config();
    let registry = DriverRegistry::with_builtins();
    let ctx = match EngineContext::build(config, &registry, Arc::new(MonotonicClock), |cfg, pool| {
        if cfg.driver == "udp" {
            UdpPort::pairs(cfg.port_count, cfg.rx_queues, cfg.tx_queues, pool)
        } else {
            Ok(SoftPort::pairs(cfg.port_count, &cfg.driver, cfg.rx_queues, cfg.tx_queues, DEFAULT_RX_DEPTH))
        }
    }) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!("Fatal: {}", e);
            std::process::exit(1);
        }
    };

    // Graceful shutdown
    let stop = Arc::new(AtomicBool::new(false));
    {
        let stop = stop.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, shutting down...");
                stop.store(true, Ordering::Release);
            }
        });
    }
    if let Some(secs) = args.duration {
        let stop = stop.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            info!("Run time of {}s elapsed, shutting down...", secs);
            stop.store(true, Ordering::Release);
        });
    }

    // Statistics reporting
    let (report_tx, report_rx) = channel::bounded::<EngineReport>(16);
    let stats_handle = {
        let poll = Duration::from_millis(args.poll_ms.max(1));
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(poll);
            loop {
                interval.tick().await;
                if let Some(report) = report_rx.try_iter().last() {
                    log_report(&report);
                }
            }
        })
    };

    let engine = tokio::task::spawn_blocking(move || {
        Master::run(ctx, stop, |report| {
            let _ = report_tx.try_send(report.clone());
        })
    });
    let result = engine.await.context("engine thread panicked")?;
    stats_handle.abort();

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            error!("Fatal: {}", e);
            std::process::exit(1);
        }
    };

    let latency = report.latency.total();
    info!("======= ENGINE SUMMARY =======");
    info!("Total time: {:.2} seconds", report.elapsed_secs);
    info!("Packets sent: {} ({:.0} pps)", report.total.tx_packets, report.tx_pps());
    info!("Bytes sent: {} ({:.2} MB)", report.total.tx_bytes, report.total.tx_bytes as f64 / (1024.0 * 1024.0));
    info!("Packets received: {}", report.total.rx_packets);
    info!("TX dropped after retries: {}", report.total.tx_dropped);
    info!("Probes: {} sent, {} measured, {} errors", latency.tx_ok, latency.pkt_ok, latency.rx_errors());
    if !report.stuck_cores.is_empty() {
        error!("Cores that never acknowledged quit: {:?}", report.stuck_cores);
    }
    info!("==============================");

    info!("Traffic generator shutdown complete");
    Ok(())
}
