//! Fanout worker: one RX ring, its egress interfaces, and a polling thread.
//!
//! Each worker owns its datapath exclusively once started; there is no
//! cross-worker state. Frames pulled from the RX ring are classified by the
//! high nibble of the first L3 octet and handed to the matching destination
//! table.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::filter::{BpfProgram, ETH_HLEN};
use crate::forward::{
    Destinations, Family, ForwardStats, FrameSender, Interface, Mode, MAX_INTERFACES,
};
use crate::ring::{FanoutConfig, PacketSink, Ring, RingKind, RingStats, TpacketVersion};

/// RX poll timeout; bounds how long a stop request can go unnoticed.
const RECV_TIMEOUT_MS: libc::c_int = 250;

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The per-worker forwarding state: egress interfaces and one destination
/// table per IP family. Implements `PacketSink` so the RX ring can deliver
/// straight into it.
pub(crate) struct Engine {
    interfaces: Vec<Interface>,
    v4: Destinations,
    v6: Destinations,
    stats: Arc<ForwardStats>,
}

impl Engine {
    pub fn new(mode: Mode, udp_checksum: bool, stats: Arc<ForwardStats>) -> Self {
        Engine {
            interfaces: Vec::new(),
            v4: Destinations::new(Family::Ipv4, mode, udp_checksum),
            v6: Destinations::new(Family::Ipv6, mode, true),
            stats,
        }
    }

    /// Register an egress interface. Idempotent by ifindex.
    pub fn add_interface(
        &mut self,
        ifindex: u32,
        mac: [u8; 6],
        addr4: [u8; 4],
        addr6: [u8; 16],
        tx: Box<dyn FrameSender>,
    ) -> Result<()> {
        if self.interfaces.iter().any(|i| i.ifindex == ifindex) {
            return Ok(());
        }
        if self.interfaces.len() == MAX_INTERFACES {
            return Err(Error::Capacity("egress interfaces"));
        }
        self.interfaces.push(Interface::new(ifindex, mac, addr4, addr6, tx));
        Ok(())
    }

    /// Append a destination to the table matching its address family. The
    /// egress interface must already be registered.
    pub fn add_destination(
        &mut self,
        ifindex: u32,
        mac: [u8; 6],
        addr: IpAddr,
        port: u16,
    ) -> Result<()> {
        let iface = self
            .interfaces
            .iter()
            .position(|i| i.ifindex == ifindex)
            .ok_or_else(|| {
                Error::Config(format!(
                    "destination interface index {ifindex} is not registered for transmit"
                ))
            })?;

        match addr {
            IpAddr::V4(a) => self.v4.add(mac, &a.octets(), port, iface),
            IpAddr::V6(a) => self.v6.add(mac, &a.octets(), port, iface),
        }
    }

    fn classify(&mut self, frame: &[u8], defer: bool) {
        if frame.len() <= ETH_HLEN {
            self.stats.pkts_malformed.fetch_add(1, Ordering::Relaxed);
            return;
        }
        // The filter only admits UDP for the enabled families; anything else
        // that slips through is dropped here.
        match frame[ETH_HLEN] & 0xf0 {
            0x40 => self.v4.process(frame, &mut self.interfaces, &self.stats, defer),
            0x60 => self.v6.process(frame, &mut self.interfaces, &self.stats, defer),
            _ => {
                self.stats.pkts_malformed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

impl PacketSink for Engine {
    fn on_packet(&mut self, frame: &[u8]) {
        self.classify(frame, false);
    }

    /// A v3 block delivers frames in bulk: stage each interface's output and
    /// kick its TX ring once for the whole batch.
    fn on_batch(&mut self, frames: &[&[u8]]) {
        for frame in frames {
            self.classify(frame, true);
        }
        for iface in &mut self.interfaces {
            iface.flush_pending(&self.stats);
        }
    }
}

// ---------------------------------------------------------------------------
// Worker
// ---------------------------------------------------------------------------

struct Inner {
    rx: Ring,
    engine: Engine,
}

pub struct Worker {
    id: usize,
    /// Datapath state; moved into the thread on start.
    inner: Option<Inner>,
    running: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<Option<RingStats>>>,
    stats: Arc<ForwardStats>,
}

impl Worker {
    /// Create the worker's RX ring with the filter attached and joined to
    /// the fanout group.
    pub fn create(
        id: usize,
        mode: Mode,
        version: TpacketVersion,
        ring_size: usize,
        ifindex: u32,
        filter: &BpfProgram,
        fanout: FanoutConfig,
        udp_checksum: bool,
    ) -> Result<Worker> {
        let rx = Ring::create(
            version,
            RingKind::Rx,
            ring_size,
            ifindex,
            Some(filter),
            Some(fanout),
        )?;

        let stats = Arc::new(ForwardStats::default());
        Ok(Worker {
            id,
            inner: Some(Inner {
                rx,
                engine: Engine::new(mode, udp_checksum, stats.clone()),
            }),
            running: Arc::new(AtomicBool::new(false)),
            handle: None,
            stats,
        })
    }

    pub fn id(&self) -> usize {
        self.id
    }

    pub fn stats(&self) -> &ForwardStats {
        &self.stats
    }

    fn engine(&mut self) -> Result<&mut Engine> {
        match self.inner.as_mut() {
            Some(inner) => Ok(&mut inner.engine),
            None => Err(Error::Config("worker is already running".into())),
        }
    }

    /// Build a TX ring on `ifindex` and register it as an egress interface.
    /// Idempotent by ifindex.
    pub fn add_interface(
        &mut self,
        version: TpacketVersion,
        ring_size: usize,
        ifindex: u32,
        mac: [u8; 6],
        addr4: [u8; 4],
        addr6: [u8; 16],
    ) -> Result<()> {
        let engine = self.engine()?;
        if engine.interfaces.iter().any(|i| i.ifindex == ifindex) {
            return Ok(());
        }
        let tx = Ring::create(version, RingKind::Tx, ring_size, ifindex, None, None)?;
        engine.add_interface(ifindex, mac, addr4, addr6, Box::new(tx))
    }

    pub fn add_destination(
        &mut self,
        ifindex: u32,
        mac: [u8; 6],
        addr: IpAddr,
        port: u16,
    ) -> Result<()> {
        self.engine()?.add_destination(ifindex, mac, addr, port)
    }

    /// Launch the polling thread. Destinations cannot be added afterwards.
    pub fn start(&mut self, pin_cpu: bool) -> Result<()> {
        let Inner { mut rx, mut engine } = self
            .inner
            .take()
            .ok_or_else(|| Error::Config("worker is already running".into()))?;

        self.running.store(true, Ordering::Release);
        let running = self.running.clone();
        let id = self.id;

        let handle = thread::Builder::new()
            .name(format!("worker-{id}"))
            .spawn(move || {
                if pin_cpu && core_affinity::set_for_current(core_affinity::CoreId { id }) {
                    debug!(worker = id, core = id, "pinned to CPU core");
                }

                debug!(worker = id, "entering receive loop");
                while running.load(Ordering::Acquire) {
                    match rx.recv(RECV_TIMEOUT_MS, &mut engine) {
                        Ok(_) => {}
                        Err(e) => warn!(worker = id, error = %e, "receive error"),
                    }
                }
                debug!(worker = id, "receive loop exited");

                match rx.statistics() {
                    Ok(stats) => Some(stats),
                    Err(e) => {
                        warn!(worker = id, error = %e, "failed to read ring statistics");
                        None
                    }
                }
            })
            .map_err(|e| {
                self.running.store(false, Ordering::Release);
                Error::Os {
                    op: "spawn worker thread",
                    source: e,
                }
            })?;

        self.handle = Some(handle);
        info!(worker = id, "worker started");
        Ok(())
    }

    /// Ask the polling thread to exit at its next poll cycle.
    pub fn signal_stop(&self) {
        self.running.store(false, Ordering::Release);
    }

    /// Wait for the thread and return the kernel ring counters it observed.
    pub fn join(&mut self) -> Option<RingStats> {
        self.handle.take().and_then(|h| h.join().ok().flatten())
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.signal_stop();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::forward::testutil::*;

    fn engine(mode: Mode) -> (Engine, Arc<ForwardStats>) {
        let stats = Arc::new(ForwardStats::default());
        (Engine::new(mode, true, stats.clone()), stats)
    }

    fn add_capture_interface(e: &mut Engine, ifindex: u32) -> CaptureTx {
        let (iface, tx) = capture_interface(ifindex);
        let Interface {
            ifindex,
            mac,
            addr4,
            addr6,
            ..
        } = iface;
        e.add_interface(ifindex, mac, addr4, addr6, Box::new(tx.clone()))
            .unwrap();
        tx
    }

    #[test]
    fn test_interface_idempotent_by_ifindex() {
        let (mut e, _) = engine(Mode::LoadBalancer);
        add_capture_interface(&mut e, 3);
        add_capture_interface(&mut e, 3);
        assert_eq!(e.interfaces.len(), 1);
    }

    #[test]
    fn test_interface_capacity() {
        let (mut e, _) = engine(Mode::LoadBalancer);
        for i in 0..MAX_INTERFACES as u32 {
            add_capture_interface(&mut e, i + 1);
        }
        let (iface, tx) = capture_interface(100);
        let err = e
            .add_interface(iface.ifindex, iface.mac, iface.addr4, iface.addr6, Box::new(tx))
            .unwrap_err();
        assert!(matches!(err, Error::Capacity("egress interfaces")));
    }

    #[test]
    fn test_destination_requires_registered_interface() {
        let (mut e, _) = engine(Mode::LoadBalancer);
        add_capture_interface(&mut e, 1);
        let err = e
            .add_destination(9, [0; 6], "10.0.0.1".parse().unwrap(), 53)
            .unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_classification_by_version_nibble() {
        let (mut e, stats) = engine(Mode::LoadBalancer);
        let tx = add_capture_interface(&mut e, 1);
        e.add_destination(1, [0x0a; 6], "10.0.0.9".parse().unwrap(), 9000)
            .unwrap();
        e.add_destination(1, [0x0b; 6], "fe80::9".parse().unwrap(), 9001)
            .unwrap();

        let v4 = ipv4_udp_frame([1, 1, 1, 1], [2, 2, 2, 2], 1, 5000, b"4", 5, 0);
        let v6 = ipv6_udp_frame(
            "fe80::1".parse().unwrap(),
            "fe80::2".parse().unwrap(),
            1,
            5000,
            b"6",
        );
        e.on_packet(&v4);
        e.on_packet(&v6);

        let out = tx.frames.lock().unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(&out[0][12..14], &0x0800u16.to_be_bytes());
        assert_eq!(&out[1][12..14], &0x86ddu16.to_be_bytes());
        assert_eq!(stats.pkts_forwarded.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_unknown_l3_dropped() {
        let (mut e, stats) = engine(Mode::LoadBalancer);
        let tx = add_capture_interface(&mut e, 1);
        e.add_destination(1, [0x0a; 6], "10.0.0.9".parse().unwrap(), 9000)
            .unwrap();

        // ARP-sized garbage: first L3 octet has neither a 4 nor a 6 nibble.
        let mut frame = vec![0u8; 60];
        frame[ETH_HLEN] = 0x00;
        e.on_packet(&frame);
        // Runt frame.
        e.on_packet(&frame[..ETH_HLEN]);

        assert!(tx.frames.lock().unwrap().is_empty());
        assert_eq!(stats.pkts_malformed.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_load_balance_two_destinations_interleaved() {
        // Scenario: two destinations on one egress interface, four frames
        // on port 5000; expect D0,D1,D0,D1 with full header rewrite.
        let (mut e, stats) = engine(Mode::LoadBalancer);
        let tx = add_capture_interface(&mut e, 1);
        e.add_destination(1, [0x0a, 0, 0, 0, 0, 0], "10.0.0.100".parse().unwrap(), 8000)
            .unwrap();
        e.add_destination(1, [0x0a, 0, 0, 0, 0, 1], "10.0.0.101".parse().unwrap(), 8001)
            .unwrap();

        let frame = ipv4_udp_frame([172, 16, 0, 1], [172, 16, 0, 2], 1111, 5000, b"lb", 5, 0);
        for _ in 0..4 {
            e.on_packet(&frame);
        }

        let out = tx.frames.lock().unwrap();
        assert_eq!(out.len(), 4);
        for (i, f) in out.iter().enumerate() {
            let want_last = (i % 2) as u8;
            assert_eq!(f[5], want_last, "dst MAC of frame {i}");
            assert_eq!(f[ETH_HLEN + 19], 100 + want_last, "dst IP of frame {i}");
            // Source rewrite comes from the interface record.
            assert_eq!(&f[6..12], &[0x02, 0, 0, 0, 0, 1]);
            assert_eq!(&f[ETH_HLEN + 12..ETH_HLEN + 16], &[192, 168, 0, 1]);
            // Source port is the captured destination port.
            let udp = &f[ETH_HLEN + 20..];
            assert_eq!(u16::from_be_bytes([udp[0], udp[1]]), 5000);
            assert_eq!(
                u16::from_be_bytes([udp[2], udp[3]]),
                8000 + want_last as u16
            );
            assert!(ipv4_header_checksum_ok(f));
            assert!(ipv4_udp_checksum_ok(f));
        }
        assert_eq!(stats.pkts_forwarded.load(Ordering::Relaxed), 4);
    }

    #[test]
    fn test_dispatch_fairness() {
        // K packets over M destinations: each receives floor(K/M) or
        // ceil(K/M), in round-robin order.
        let (mut e, _) = engine(Mode::LoadBalancer);
        let tx = add_capture_interface(&mut e, 1);
        for i in 0..3u8 {
            e.add_destination(
                1,
                [0x0a, 0, 0, 0, 0, i],
                format!("10.0.0.{}", 100 + i).parse().unwrap(),
                8000 + u16::from(i),
            )
            .unwrap();
        }

        let frame = ipv4_udp_frame([1, 1, 1, 1], [2, 2, 2, 2], 7, 5000, b"f", 5, 0);
        for _ in 0..8 {
            e.on_packet(&frame);
        }

        let out = tx.frames.lock().unwrap();
        let mut counts = [0usize; 3];
        for (i, f) in out.iter().enumerate() {
            let dest = f[5] as usize;
            assert_eq!(dest, i % 3);
            counts[dest] += 1;
        }
        assert_eq!(counts, [3, 3, 2]);
    }

    #[test]
    fn test_broadcast_one_packet_three_copies() {
        let (mut e, _) = engine(Mode::Broadcaster);
        let tx = add_capture_interface(&mut e, 1);
        for i in 0..3u8 {
            e.add_destination(
                1,
                [0x0a, 0, 0, 0, 0, i],
                format!("10.0.0.{}", 100 + i).parse().unwrap(),
                8000,
            )
            .unwrap();
        }

        let frame = ipv4_udp_frame([1, 1, 1, 1], [2, 2, 2, 2], 7, 5000, b"bc", 5, 0);
        e.on_packet(&frame);

        let out = tx.frames.lock().unwrap();
        assert_eq!(out.len(), 3);
        for (i, f) in out.iter().enumerate() {
            assert_eq!(f[5], i as u8);
        }
    }

    #[test]
    fn test_batch_delivery_matches_per_packet() {
        let (mut e, stats) = engine(Mode::LoadBalancer);
        let tx = add_capture_interface(&mut e, 1);
        e.add_destination(1, [0x0a; 6], "10.0.0.9".parse().unwrap(), 9000)
            .unwrap();

        let a = ipv4_udp_frame([1, 1, 1, 1], [2, 2, 2, 2], 7, 5000, b"a", 5, 0);
        let b = ipv4_udp_frame([1, 1, 1, 1], [2, 2, 2, 2], 7, 5000, b"b", 5, 0);
        e.on_batch(&[&a[..], &b[..]]);

        assert_eq!(tx.frames.lock().unwrap().len(), 2);
        // Both frames left through one batched send.
        assert_eq!(*tx.batches.lock().unwrap(), vec![2]);
        assert_eq!(stats.pkts_forwarded.load(Ordering::Relaxed), 2);
    }
}
