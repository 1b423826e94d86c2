//! udp-scatter: high-throughput UDP packet distributor.
//!
//! Captures UDP datagrams on one interface through kernel-mapped packet
//! rings, filters them by destination port with an in-kernel classic BPF
//! program, rewrites Ethernet/IP/UDP headers and re-emits each datagram
//! toward configured destinations through per-interface TX rings. Reception
//! is spread across a pool of PACKET_FANOUT workers.
//!
//! Two modes:
//!   - load-balancer: each datagram goes to exactly one destination (round-robin)
//!   - broadcaster:   each datagram is replicated to every destination

mod config;
mod distributor;
mod error;
mod filter;
mod forward;
mod ring;
mod worker;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal;
use tracing::{debug, info, trace};

use config::{DestSpec, PortList, RxSpec, TxSpec};
use distributor::Distributor;
use filter::PortRanges;
use forward::Mode;

// ---------------------------------------------------------------------------
// CLI
// ---------------------------------------------------------------------------

#[derive(Parser)]
#[command(
    name = "udp-scatter",
    about = "High-throughput UDP distributor over kernel-mapped packet rings",
    version
)]
struct Cli {
    /// Reception interface: <iface>[,<ring-size>].
    /// Ring sizes accept binary K/M/G suffixes (1M..16G, default 256M).
    #[arg(long, value_parser = config::parse_rx_spec)]
    rx: RxSpec,

    /// Egress interface: <iface>,<mac>,<ipv4>,<ipv6>[,<ring-size>].
    /// Repeatable, up to 32.
    #[arg(long = "tx", value_parser = config::parse_tx_spec, required = true)]
    tx: Vec<TxSpec>,

    /// Destination: <iface>,<mac>,<ip>,<port>. The interface must appear in
    /// the --tx list. Repeatable.
    #[arg(long = "dest", value_parser = config::parse_dest_spec, required = true)]
    dest: Vec<DestSpec>,

    /// Distribution mode.
    #[arg(long = "type", value_enum, default_value = "load-balancer")]
    mode: Mode,

    /// Accepted destination ports: <port>[-<port>][,...]. Repeatable;
    /// without it every UDP port is accepted.
    #[arg(long, value_parser = config::parse_port_list)]
    ports: Vec<PortList>,

    /// Number of fanout workers (1..32).
    #[arg(long = "number-workers", default_value_t = distributor::DEFAULT_WORKERS)]
    number_workers: usize,

    /// Compute the optional UDP checksum on forwarded IPv4 packets.
    #[arg(long, default_value_t = true, action = clap::ArgAction::Set)]
    udp_checksum: bool,

    /// Pin each worker thread to the CPU core matching its index.
    #[arg(long)]
    pin_cpus: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cli.log_level)),
        )
        .with_target(false)
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        rx = %cli.rx.name,
        interfaces = cli.tx.len(),
        destinations = cli.dest.len(),
        workers = cli.number_workers,
        mode = ?cli.mode,
        "starting udp-scatter"
    );

    config::validate(&cli.rx, &cli.tx, &cli.dest, cli.number_workers)?;

    // Canonicalize the port ranges and compile the in-kernel filter.
    let mut ranges = PortRanges::default();
    for list in &cli.ports {
        for &(from, to) in &list.0 {
            ranges
                .add_range(from, to)
                .with_context(|| format!("adding port range {from}-{to}"))?;
        }
    }
    let program = filter::compile(false, false, &ranges).context("compiling packet filter")?;
    debug!(
        instructions = program.len(),
        port_ranges = ranges.len(),
        "compiled packet filter"
    );
    trace!("filter disassembly:\n{}", program.dump());

    // Build the worker pool, then the egress interfaces and destinations.
    // Interfaces must all be registered before the first destination.
    let mut distributor = Distributor::create(
        cli.mode,
        cli.rx.ring_size,
        cli.rx.ifindex,
        &program,
        cli.number_workers,
        cli.dest.len(),
        cli.udp_checksum,
    )
    .context("creating distributor")?;

    for tx in &cli.tx {
        distributor
            .add_interface(
                tx.ring_size,
                tx.ifindex,
                tx.mac,
                tx.addr4.octets(),
                tx.addr6.octets(),
            )
            .with_context(|| format!("adding interface '{}'", tx.name))?;
    }

    for dest in &cli.dest {
        distributor
            .add_destination(dest.ifindex, dest.mac, dest.addr, dest.port)
            .with_context(|| format!("adding destination {}:{}", dest.addr, dest.port))?;
    }

    distributor.start(cli.pin_cpus).context("starting workers")?;

    info!("udp-scatter is running. Press Ctrl+C to stop.");

    shutdown_signal().await;

    info!("shutdown signal received, stopping workers...");
    distributor.stop();

    info!("udp-scatter stopped");
    Ok(())
}

// ---------------------------------------------------------------------------
// Signal Handling
// ---------------------------------------------------------------------------

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl+C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
