//! Destination tables and frame rewriting.
//!
//! Each worker keeps one table per IP family. A captured UDP frame is handed
//! to the matching table, which picks destinations according to the
//! distribution mode, synthesizes new Ethernet/IP/UDP headers and hands the
//! finished frame to the destination's egress interface as a gather list.
//!
//! The rewritten frame is a transparent mirror from the client's viewpoint:
//! the captured datagram's destination port becomes the source port of the
//! forwarded packet, so downstream replies stay on the same five-tuple
//! class.

use std::sync::atomic::{AtomicU64, Ordering};

use tracing::warn;

use crate::error::{Error, Result};
use crate::filter::{
    ETH_HLEN, ETH_TYPE_OFF, IPPROTO_UDP, IPV4_CHECK_OFF, IPV4_MIN_HLEN, IPV6_HLEN, IPV6_SRC_OFF,
    UDP_HLEN,
};
use crate::ring::Ring;

pub const MAX_INTERFACES: usize = 32;

/// How long a transmit may wait for a free ring slot.
pub const SEND_TIMEOUT_MS: libc::c_int = 100;

// ---------------------------------------------------------------------------
// Distribution Mode
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum Mode {
    /// Every accepted datagram goes to exactly one destination, round-robin.
    LoadBalancer,
    /// Every accepted datagram is replicated to all destinations.
    Broadcaster,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Ipv4,
    Ipv6,
}

// ---------------------------------------------------------------------------
// Egress Interface
// ---------------------------------------------------------------------------

/// Transmit side of an egress interface. The production implementation is a
/// TX packet ring; tests substitute an in-memory sink.
pub trait FrameSender: Send {
    fn send_frame(&mut self, parts: &[&[u8]], timeout_ms: libc::c_int) -> Result<()>;

    /// Send several fully assembled frames, with a single kernel kick where
    /// the transport supports one.
    fn send_many(&mut self, frames: &[&[u8]], timeout_ms: libc::c_int) -> Result<()> {
        for &frame in frames {
            self.send_frame(&[frame], timeout_ms)?;
        }
        Ok(())
    }
}

impl FrameSender for Ring {
    fn send_frame(&mut self, parts: &[&[u8]], timeout_ms: libc::c_int) -> Result<()> {
        match parts {
            [frame] => self.send(frame, timeout_ms),
            _ => self.send_vectored(parts, timeout_ms),
        }
    }

    fn send_many(&mut self, frames: &[&[u8]], timeout_ms: libc::c_int) -> Result<()> {
        Ring::send_many(self, frames, timeout_ms)
    }
}

/// One egress interface: the addresses written into rewritten headers and
/// the TX ring frames leave through.
pub struct Interface {
    pub ifindex: u32,
    pub mac: [u8; 6],
    pub addr4: [u8; 4],
    pub addr6: [u8; 16],
    tx: Box<dyn FrameSender>,
    /// Frames staged during a batch delivery, awaiting one kick.
    pending: Vec<Vec<u8>>,
}

impl Interface {
    pub fn new(
        ifindex: u32,
        mac: [u8; 6],
        addr4: [u8; 4],
        addr6: [u8; 16],
        tx: Box<dyn FrameSender>,
    ) -> Self {
        Interface {
            ifindex,
            mac,
            addr4,
            addr6,
            tx,
            pending: Vec::new(),
        }
    }

    /// Send every staged frame with a single kick and account the outcome.
    pub fn flush_pending(&mut self, stats: &ForwardStats) {
        if self.pending.is_empty() {
            return;
        }
        let n = self.pending.len() as u64;
        let total: u64 = self.pending.iter().map(|f| f.len() as u64).sum();
        let frames: Vec<&[u8]> = self.pending.iter().map(|f| f.as_slice()).collect();
        match self.tx.send_many(&frames, SEND_TIMEOUT_MS) {
            Ok(()) => {
                stats.pkts_forwarded.fetch_add(n, Ordering::Relaxed);
                stats.bytes_forwarded.fetch_add(total, Ordering::Relaxed);
            }
            Err(Error::TxBusy) => {
                stats.tx_busy.fetch_add(1, Ordering::Relaxed);
                stats.pkts_dropped.fetch_add(n, Ordering::Relaxed);
            }
            Err(e) => {
                stats.pkts_dropped.fetch_add(n, Ordering::Relaxed);
                warn!(ifindex = self.ifindex, error = %e, "transmit failed");
            }
        }
        self.pending.clear();
    }
}

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Forwarding counters for one worker.
#[derive(Debug, Default)]
pub struct ForwardStats {
    pub pkts_forwarded: AtomicU64,
    pub pkts_dropped: AtomicU64,
    pub pkts_malformed: AtomicU64,
    pub pkts_no_destination: AtomicU64,
    pub tx_busy: AtomicU64,
    pub bytes_forwarded: AtomicU64,
}

// ---------------------------------------------------------------------------
// Destinations
// ---------------------------------------------------------------------------

struct Destination {
    mac: [u8; 6],
    addr: [u8; 16],
    addr_len: usize,
    /// Network byte order, ready for emission.
    port_be: [u8; 2],
    /// Index into the worker's interface table. Indices stay valid because
    /// interfaces are only appended, never removed.
    iface: usize,
}

/// Append-only destination set for one IP family with its own round-robin
/// cursor. Family and mode are fixed at construction; `process` never
/// re-dispatches per packet.
pub struct Destinations {
    family: Family,
    mode: Mode,
    /// Compute the optional IPv4 UDP checksum (mandatory for IPv6).
    udp_checksum: bool,
    dests: Vec<Destination>,
    idx: usize,
}

impl Destinations {
    pub fn new(family: Family, mode: Mode, udp_checksum: bool) -> Self {
        Destinations {
            family,
            mode,
            udp_checksum,
            dests: Vec::new(),
            idx: 0,
        }
    }

    pub fn add(&mut self, mac: [u8; 6], addr: &[u8], port: u16, iface: usize) -> Result<()> {
        let mut buf = [0u8; 16];
        buf[..addr.len()].copy_from_slice(addr);
        if self.dests.is_empty() {
            self.dests.reserve(4);
        }
        self.dests.push(Destination {
            mac,
            addr: buf,
            addr_len: addr.len(),
            port_be: port.to_be_bytes(),
            iface,
        });
        Ok(())
    }

    /// Forward a captured frame per the configured mode. With `defer` the
    /// rewritten frames are staged on their egress interface instead of
    /// sent; the caller flushes them with one kick per interface.
    pub fn process(
        &mut self,
        frame: &[u8],
        ifaces: &mut [Interface],
        stats: &ForwardStats,
        defer: bool,
    ) {
        if self.dests.is_empty() {
            stats.pkts_no_destination.fetch_add(1, Ordering::Relaxed);
            return;
        }

        match self.mode {
            Mode::LoadBalancer => {
                let dest = &self.dests[self.idx];
                self.dispatch(dest, frame, ifaces, stats, defer);
                self.idx = (self.idx + 1) % self.dests.len();
            }
            Mode::Broadcaster => {
                for dest in &self.dests {
                    self.dispatch(dest, frame, ifaces, stats, defer);
                }
            }
        }
    }

    fn dispatch(
        &self,
        dest: &Destination,
        frame: &[u8],
        ifaces: &mut [Interface],
        stats: &ForwardStats,
        defer: bool,
    ) {
        let iface = &mut ifaces[dest.iface];
        match self.family {
            Family::Ipv4 => send_ipv4(dest, iface, frame, self.udp_checksum, stats, defer),
            Family::Ipv6 => send_ipv6(dest, iface, frame, stats, defer),
        }
    }
}

// ---------------------------------------------------------------------------
// Checksums
// ---------------------------------------------------------------------------

/// Fold carries of a one's-complement accumulator down to 16 bits.
fn fold(mut sum: u32) -> u16 {
    while sum > 0xffff {
        sum = (sum >> 16) + (sum & 0xffff);
    }
    sum as u16
}

/// Sum big-endian 16-bit words; an odd trailing byte is the high half of a
/// zero-padded word.
fn sum_words(bytes: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = bytes.chunks_exact(2);
    for pair in &mut chunks {
        sum += u32::from(u16::from_be_bytes([pair[0], pair[1]]));
    }
    if let [odd] = chunks.remainder() {
        sum += u32::from(*odd) << 8;
    }
    sum
}

// ---------------------------------------------------------------------------
// Header Synthesis
// ---------------------------------------------------------------------------

fn send_ipv4(
    dest: &Destination,
    iface: &mut Interface,
    frame: &[u8],
    with_udp_checksum: bool,
    stats: &ForwardStats,
    defer: bool,
) {
    if frame.len() < ETH_HLEN + IPV4_MIN_HLEN + UDP_HLEN {
        stats.pkts_malformed.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let ip = &frame[ETH_HLEN..];
    let ihl = usize::from(ip[0] & 0x0f) * 4;
    if ihl < IPV4_MIN_HLEN || frame.len() < ETH_HLEN + ihl + UDP_HLEN {
        stats.pkts_malformed.fetch_add(1, Ordering::Relaxed);
        return;
    }

    let udp = &ip[ihl..];
    let udp_len = usize::from(u16::from_be_bytes([udp[4], udp[5]]));
    if udp_len < UDP_HLEN || ETH_HLEN + ihl + udp_len != frame.len() {
        stats.pkts_malformed.fetch_add(1, Ordering::Relaxed);
        return;
    }
    let payload = &udp[UDP_HLEN..udp_len];

    // IPv4 header checksum with the rewritten addresses; options (if any)
    // are carried verbatim and participate unchanged.
    let mut sum = sum_words(&ip[..IPV4_CHECK_OFF]);
    sum += sum_words(&iface.addr4);
    sum += sum_words(&dest.addr[..dest.addr_len]);
    sum += sum_words(&ip[IPV4_MIN_HLEN..ihl]);
    let ip_checksum = (!fold(sum)).to_be_bytes();

    let udp_checksum = if with_udp_checksum {
        let mut sum = sum_words(&iface.addr4);
        sum += sum_words(&dest.addr[..dest.addr_len]);
        sum += u32::from(IPPROTO_UDP);
        sum += udp_len as u32;
        // The captured datagram's destination port becomes the source port.
        sum += u32::from(u16::from_be_bytes([udp[2], udp[3]]));
        sum += u32::from(u16::from_be_bytes(dest.port_be));
        sum += udp_len as u32;
        sum += sum_words(payload);
        (!fold(sum)).to_be_bytes()
    } else {
        [0u8; 2]
    };

    let iface_mac = iface.mac;
    let iface_addr4 = iface.addr4;
    let parts: [&[u8]; 12] = [
        &dest.mac,
        &iface_mac,
        // Ethertype plus the IPv4 header up to the checksum field.
        &frame[ETH_TYPE_OFF..ETH_HLEN + IPV4_CHECK_OFF],
        &ip_checksum,
        &iface_addr4,
        &dest.addr[..dest.addr_len],
        // IPv4 options, verbatim.
        &ip[IPV4_MIN_HLEN..ihl],
        // Source port: the captured destination port.
        &udp[2..4],
        &dest.port_be,
        // UDP length is preserved.
        &udp[4..6],
        &udp_checksum,
        payload,
    ];

    transmit(iface, &parts, stats, defer);
}

fn send_ipv6(
    dest: &Destination,
    iface: &mut Interface,
    frame: &[u8],
    stats: &ForwardStats,
    defer: bool,
) {
    if frame.len() < ETH_HLEN + IPV6_HLEN + UDP_HLEN {
        stats.pkts_malformed.fetch_add(1, Ordering::Relaxed);
        return;
    }

    // Extension headers are not traversed; UDP must follow the fixed header.
    let ip = &frame[ETH_HLEN..];
    let udp = &ip[IPV6_HLEN..];
    let udp_len = usize::from(u16::from_be_bytes([udp[4], udp[5]]));
    if udp_len < UDP_HLEN || ETH_HLEN + IPV6_HLEN + udp_len != frame.len() {
        stats.pkts_malformed.fetch_add(1, Ordering::Relaxed);
        return;
    }
    let payload = &udp[UDP_HLEN..udp_len];

    // UDP checksum is mandatory for IPv6.
    let mut sum = sum_words(&iface.addr6);
    sum += sum_words(&dest.addr[..dest.addr_len]);
    sum += udp_len as u32;
    sum += u32::from(IPPROTO_UDP);
    sum += u32::from(u16::from_be_bytes([udp[2], udp[3]]));
    sum += u32::from(u16::from_be_bytes(dest.port_be));
    sum += udp_len as u32;
    sum += sum_words(payload);
    let udp_checksum = (!fold(sum)).to_be_bytes();

    let iface_mac = iface.mac;
    let iface_addr6 = iface.addr6;
    let parts: [&[u8]; 10] = [
        &dest.mac,
        &iface_mac,
        // Ethertype plus the IPv6 header up to the source address.
        &frame[ETH_TYPE_OFF..ETH_HLEN + IPV6_SRC_OFF],
        &iface_addr6,
        &dest.addr[..dest.addr_len],
        &udp[2..4],
        &dest.port_be,
        &udp[4..6],
        &udp_checksum,
        payload,
    ];

    transmit(iface, &parts, stats, defer);
}

fn transmit(iface: &mut Interface, parts: &[&[u8]], stats: &ForwardStats, defer: bool) {
    if defer {
        iface.pending.push(parts.concat());
        return;
    }

    let total: usize = parts.iter().map(|p| p.len()).sum();
    match iface.tx.send_frame(parts, SEND_TIMEOUT_MS) {
        Ok(()) => {
            stats.pkts_forwarded.fetch_add(1, Ordering::Relaxed);
            stats.bytes_forwarded.fetch_add(total as u64, Ordering::Relaxed);
        }
        Err(Error::TxBusy) => {
            // Already retried once inside the ring; give the packet up.
            stats.tx_busy.fetch_add(1, Ordering::Relaxed);
            stats.pkts_dropped.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            stats.pkts_dropped.fetch_add(1, Ordering::Relaxed);
            warn!(ifindex = iface.ifindex, error = %e, "transmit failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Test Support
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testutil {
    use std::net::Ipv6Addr;
    use std::sync::{Arc, Mutex};

    use super::*;

    /// In-memory stand-in for a TX ring; records every emitted frame and
    /// the size of each batched send.
    #[derive(Clone, Default)]
    pub(crate) struct CaptureTx {
        pub frames: Arc<Mutex<Vec<Vec<u8>>>>,
        pub batches: Arc<Mutex<Vec<usize>>>,
    }

    impl FrameSender for CaptureTx {
        fn send_frame(&mut self, parts: &[&[u8]], _timeout_ms: libc::c_int) -> Result<()> {
            self.frames.lock().unwrap().push(parts.concat());
            Ok(())
        }

        fn send_many(&mut self, frames: &[&[u8]], _timeout_ms: libc::c_int) -> Result<()> {
            self.batches.lock().unwrap().push(frames.len());
            let mut out = self.frames.lock().unwrap();
            for &frame in frames {
                out.push(frame.to_vec());
            }
            Ok(())
        }
    }

    /// Sink whose next slot is permanently busy.
    pub(crate) struct BusyTx;

    impl FrameSender for BusyTx {
        fn send_frame(&mut self, _parts: &[&[u8]], _timeout_ms: libc::c_int) -> Result<()> {
            Err(Error::TxBusy)
        }
    }

    pub(crate) fn capture_interface(ifindex: u32) -> (Interface, CaptureTx) {
        let tx = CaptureTx::default();
        let iface = Interface::new(
            ifindex,
            [0x02, 0x00, 0x00, 0x00, 0x00, ifindex as u8],
            [192, 168, 0, ifindex as u8],
            Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, ifindex as u16).octets(),
            Box::new(tx.clone()),
        );
        (iface, tx)
    }

    /// Build an Ethernet/IPv4/UDP frame. `ihl_words > 5` appends NOP options;
    /// the IP header checksum is valid, the UDP checksum is left zero.
    pub(crate) fn ipv4_udp_frame(
        src: [u8; 4],
        dst: [u8; 4],
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
        ihl_words: u8,
        frag_off: u16,
    ) -> Vec<u8> {
        let ihl = usize::from(ihl_words) * 4;
        let udp_len = UDP_HLEN + payload.len();
        let total_len = ihl + udp_len;

        let mut f = Vec::with_capacity(ETH_HLEN + total_len);
        f.extend_from_slice(&[0xff; 6]);
        f.extend_from_slice(&[0x02, 0, 0, 0, 0, 0xaa]);
        f.extend_from_slice(&0x0800u16.to_be_bytes());

        let ip_start = f.len();
        f.push(0x40 | ihl_words);
        f.push(0);
        f.extend_from_slice(&(total_len as u16).to_be_bytes());
        f.extend_from_slice(&0x1234u16.to_be_bytes());
        f.extend_from_slice(&frag_off.to_be_bytes());
        f.push(64);
        f.push(IPPROTO_UDP);
        f.extend_from_slice(&[0, 0]); // checksum placeholder
        f.extend_from_slice(&src);
        f.extend_from_slice(&dst);
        for _ in IPV4_MIN_HLEN..ihl {
            f.push(0x01); // NOP option
        }
        let csum = !fold(sum_words(&f[ip_start..ip_start + ihl]));
        f[ip_start + IPV4_CHECK_OFF..ip_start + IPV4_CHECK_OFF + 2]
            .copy_from_slice(&csum.to_be_bytes());

        f.extend_from_slice(&src_port.to_be_bytes());
        f.extend_from_slice(&dst_port.to_be_bytes());
        f.extend_from_slice(&(udp_len as u16).to_be_bytes());
        f.extend_from_slice(&[0, 0]);
        f.extend_from_slice(payload);
        f
    }

    /// Build an Ethernet/IPv6/UDP frame with a zero UDP checksum.
    pub(crate) fn ipv6_udp_frame(
        src: Ipv6Addr,
        dst: Ipv6Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let udp_len = UDP_HLEN + payload.len();

        let mut f = Vec::with_capacity(ETH_HLEN + IPV6_HLEN + udp_len);
        f.extend_from_slice(&[0xff; 6]);
        f.extend_from_slice(&[0x02, 0, 0, 0, 0, 0xbb]);
        f.extend_from_slice(&0x86ddu16.to_be_bytes());

        f.extend_from_slice(&[0x60, 0, 0, 0]);
        f.extend_from_slice(&(udp_len as u16).to_be_bytes());
        f.push(IPPROTO_UDP);
        f.push(64);
        f.extend_from_slice(&src.octets());
        f.extend_from_slice(&dst.octets());

        f.extend_from_slice(&src_port.to_be_bytes());
        f.extend_from_slice(&dst_port.to_be_bytes());
        f.extend_from_slice(&(udp_len as u16).to_be_bytes());
        f.extend_from_slice(&[0, 0]);
        f.extend_from_slice(payload);
        f
    }

    /// One's-complement sum over the emitted IPv4 header must be 0xffff.
    pub(crate) fn ipv4_header_checksum_ok(frame: &[u8]) -> bool {
        let ip = &frame[ETH_HLEN..];
        let ihl = usize::from(ip[0] & 0x0f) * 4;
        fold(sum_words(&ip[..ihl])) == 0xffff
    }

    /// Verify the UDP checksum of an emitted IPv4 frame against its own
    /// pseudo-header.
    pub(crate) fn ipv4_udp_checksum_ok(frame: &[u8]) -> bool {
        let ip = &frame[ETH_HLEN..];
        let ihl = usize::from(ip[0] & 0x0f) * 4;
        let udp_len = usize::from(u16::from_be_bytes([ip[ihl + 4], ip[ihl + 5]]));
        let mut sum = sum_words(&ip[12..20]); // src + dst
        sum += u32::from(IPPROTO_UDP);
        sum += udp_len as u32;
        sum += sum_words(&ip[ihl..ihl + udp_len]);
        fold(sum) == 0xffff
    }

    /// Verify the UDP checksum of an emitted IPv6 frame against its own
    /// pseudo-header.
    pub(crate) fn ipv6_udp_checksum_ok(frame: &[u8]) -> bool {
        let ip = &frame[ETH_HLEN..];
        let udp_len = usize::from(u16::from_be_bytes([ip[IPV6_HLEN + 4], ip[IPV6_HLEN + 5]]));
        let mut sum = sum_words(&ip[8..40]); // src + dst
        sum += udp_len as u32;
        sum += u32::from(IPPROTO_UDP);
        sum += sum_words(&ip[IPV6_HLEN..IPV6_HLEN + udp_len]);
        fold(sum) == 0xffff
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
