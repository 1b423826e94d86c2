//! The distributor: N workers joined into one kernel fanout group.
//!
//! Reception is spread across the workers by `PACKET_FANOUT_HASH`, which
//! keeps each flow on one worker and so preserves per-flow ordering.
//! Destinations are assigned to workers according to the distribution mode:
//! a load-balancer partitions them round-robin, a broadcaster gives every
//! worker the full set.

use std::net::IpAddr;
use std::sync::atomic::Ordering;

use tracing::info;

use crate::error::{Error, Result};
use crate::filter::BpfProgram;
use crate::forward::Mode;
use crate::ring::{FanoutConfig, TpacketVersion, PACKET_FANOUT_HASH};
use crate::worker::Worker;

pub const MIN_WORKERS: usize = 1;
pub const MAX_WORKERS: usize = 32;
pub const DEFAULT_WORKERS: usize = 1;

/// RX rings use the block-based v3 ABI; TX rings the leaner v2.
const RX_VERSION: TpacketVersion = TpacketVersion::V3;
const TX_VERSION: TpacketVersion = TpacketVersion::V2;

pub struct Distributor {
    mode: Mode,
    workers: Vec<Worker>,
    /// Next worker to receive a destination in load-balancer mode.
    next: usize,
}

impl std::fmt::Debug for Distributor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Distributor").finish_non_exhaustive()
    }
}

impl Distributor {
    /// Create `nworkers` workers, each with an RX ring on `rx_ifindex`
    /// filtered by `filter` and joined to a shared fanout group.
    ///
    /// In load-balancer mode the worker count is clamped to the destination
    /// count so no worker sits idle with an empty table.
    pub fn create(
        mode: Mode,
        rx_ring_size: usize,
        rx_ifindex: u32,
        filter: &BpfProgram,
        nworkers: usize,
        ndestinations: usize,
        udp_checksum: bool,
    ) -> Result<Distributor> {
        if !(MIN_WORKERS..=MAX_WORKERS).contains(&nworkers) {
            return Err(Error::Config(format!(
                "worker count {nworkers} outside {MIN_WORKERS}..={MAX_WORKERS}"
            )));
        }
        if ndestinations == 0 {
            return Err(Error::Config("at least one destination is required".into()));
        }

        let mut nworkers = nworkers;
        if mode == Mode::LoadBalancer && nworkers > ndestinations {
            info!(
                requested = nworkers,
                destinations = ndestinations,
                "clamping worker count to destination count"
            );
            nworkers = ndestinations;
        }

        let fanout = FanoutConfig {
            group_id: (std::process::id() & 0xffff) as u16,
            policy: PACKET_FANOUT_HASH,
        };

        let workers = (0..nworkers)
            .map(|id| {
                Worker::create(
                    id,
                    mode,
                    RX_VERSION,
                    rx_ring_size,
                    rx_ifindex,
                    filter,
                    fanout,
                    udp_checksum,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        info!(
            workers = workers.len(),
            fanout_group = fanout.group_id,
            mode = ?mode,
            "distributor created"
        );

        Ok(Distributor {
            mode,
            workers,
            next: 0,
        })
    }

    /// Register an egress interface on every worker; each builds its own TX
    /// ring on it.
    pub fn add_interface(
        &mut self,
        ring_size: usize,
        ifindex: u32,
        mac: [u8; 6],
        addr4: [u8; 4],
        addr6: [u8; 16],
    ) -> Result<()> {
        for worker in &mut self.workers {
            worker.add_interface(TX_VERSION, ring_size, ifindex, mac, addr4, addr6)?;
        }
        Ok(())
    }

    /// Assign a destination: to the next worker in load-balancer mode, to
    /// every worker in broadcaster mode.
    pub fn add_destination(
        &mut self,
        ifindex: u32,
        mac: [u8; 6],
        addr: IpAddr,
        port: u16,
    ) -> Result<()> {
        match self.mode {
            Mode::LoadBalancer => {
                self.workers[self.next].add_destination(ifindex, mac, addr, port)?;
                self.next = (self.next + 1) % self.workers.len();
            }
            Mode::Broadcaster => {
                for worker in &mut self.workers {
                    worker.add_destination(ifindex, mac, addr, port)?;
                }
            }
        }
        Ok(())
    }

    /// Launch every worker thread.
    pub fn start(&mut self, pin_cpus: bool) -> Result<()> {
        for worker in &mut self.workers {
            worker.start(pin_cpus)?;
        }
        info!(workers = self.workers.len(), "all workers running");
        Ok(())
    }

    /// Stop and join every worker, then log per-worker and aggregate
    /// statistics.
    pub fn stop(&mut self) {
        for worker in &self.workers {
            worker.signal_stop();
        }

        let mut total_received = 0u64;
        let mut total_dropped = 0u64;
        let mut total_forwarded = 0u64;

        for worker in &mut self.workers {
            let ring = worker.join();
            let fwd = worker.stats();
            let forwarded = fwd.pkts_forwarded.load(Ordering::Relaxed);

            if let Some(ring) = ring {
                total_received += u64::from(ring.received);
                total_dropped += u64::from(ring.dropped);
                info!(
                    worker = worker.id(),
                    received = ring.received,
                    dropped_by_kernel = ring.dropped,
                    forwarded,
                    dropped = fwd.pkts_dropped.load(Ordering::Relaxed),
                    malformed = fwd.pkts_malformed.load(Ordering::Relaxed),
                    "worker stopped"
                );
            } else {
                info!(worker = worker.id(), forwarded, "worker stopped");
            }
            total_forwarded += forwarded;
        }

        info!(
            received = total_received,
            dropped_by_kernel = total_dropped,
            forwarded = total_forwarded,
            "all workers stopped"
        );
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
