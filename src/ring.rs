//! Memory-mapped packet ring on a raw `AF_PACKET` socket.
//!
//! Supports the three TPACKET ABI versions. The ring is a shared region the
//! kernel and user space hand frames through without read/write syscalls:
//! each slot carries a status word that says who owns it. RX slots are
//! frames (v1/v2) or whole blocks of packets (v3); TX slots are frames for
//! every version.
//!
//! Ownership protocol:
//! - RX: the kernel sets `TP_STATUS_USER` when a slot is ready; user space
//!   consumes it and stores `TP_STATUS_KERNEL` back.
//! - TX: user space fills a free slot and stores `TP_STATUS_SEND_REQUEST`;
//!   the kernel flips through `TP_STATUS_SENDING` back to available. A
//!   zero-length `sendto` kicks the transmit path.
//!
//! Every status store is preceded by a full fence so the payload access
//! cannot be reordered past the ownership transfer.

use std::io;
use std::mem;
use std::os::fd::RawFd;
use std::ptr;
use std::slice;
use std::sync::atomic::{fence, Ordering};

use tracing::info;

use crate::error::{Error, Result};
use crate::filter::BpfProgram;

// ---------------------------------------------------------------------------
// Ring Size Bounds
// ---------------------------------------------------------------------------

pub const MIN_RING_SIZE: usize = 1024 * 1024; // 1 MiB

#[cfg(target_pointer_width = "64")]
pub const MAX_RING_SIZE: usize = 16 * 1024 * 1024 * 1024; // 16 GiB

#[cfg(not(target_pointer_width = "64"))]
pub const MAX_RING_SIZE: usize = 1024 * 1024 * 1024; // 1 GiB

pub const DEFAULT_RING_SIZE: usize = 256 * 1024 * 1024; // 256 MiB

// ---------------------------------------------------------------------------
// Packet Socket Constants (from <linux/if_packet.h>)
// ---------------------------------------------------------------------------

const SOL_PACKET: libc::c_int = 263;

const PACKET_RX_RING: libc::c_int = 5;
const PACKET_STATISTICS: libc::c_int = 6;
const PACKET_VERSION: libc::c_int = 10;
const PACKET_TX_RING: libc::c_int = 13;
const PACKET_LOSS: libc::c_int = 14;
const PACKET_FANOUT: libc::c_int = 18;
const PACKET_QDISC_BYPASS: libc::c_int = 20;

pub const PACKET_FANOUT_HASH: u32 = 0;

const TP_STATUS_KERNEL: u32 = 0;
const TP_STATUS_USER: u32 = 1;
const TP_STATUS_SEND_REQUEST: u32 = 1;
const TP_STATUS_SENDING: u32 = 2;

const TP_FT_REQ_FILL_RXHASH: u32 = 0x1;

const TPACKET_ALIGNMENT: usize = 16;

const ETH_P_ALL: u16 = 0x0003;

/// Block retire timeout for v3 RX rings, in milliseconds. Bounds the latency
/// of a partially filled block reaching user space.
const BLOCK_RETIRE_TOV_MS: u32 = 64;

/// Maximum frames handed to one `on_batch` call while walking a v3 block.
const MAX_BATCH: usize = 1024;

// ---------------------------------------------------------------------------
// Kernel ABI Structs (repr(C), from <linux/if_packet.h>)
// ---------------------------------------------------------------------------

#[repr(C)]
#[allow(dead_code)]
struct TpacketReq {
    tp_block_size: u32,
    tp_block_nr: u32,
    tp_frame_size: u32,
    tp_frame_nr: u32,
}

#[repr(C)]
#[allow(dead_code)]
struct TpacketReq3 {
    tp_block_size: u32,
    tp_block_nr: u32,
    tp_frame_size: u32,
    tp_frame_nr: u32,
    tp_retire_blk_tov: u32,
    tp_sizeof_priv: u32,
    tp_feature_req_word: u32,
}

#[repr(C)]
#[allow(dead_code)]
struct TpacketHdr {
    tp_status: libc::c_ulong,
    tp_len: u32,
    tp_snaplen: u32,
    tp_mac: u16,
    tp_net: u16,
    tp_sec: u32,
    tp_usec: u32,
}

#[repr(C)]
#[allow(dead_code)]
struct Tpacket2Hdr {
    tp_status: u32,
    tp_len: u32,
    tp_snaplen: u32,
    tp_mac: u16,
    tp_net: u16,
    tp_sec: u32,
    tp_nsec: u32,
    tp_vlan_tci: u16,
    tp_vlan_tpid: u16,
    tp_padding: [u8; 4],
}

#[repr(C)]
#[allow(dead_code)]
struct TpacketHdrVariant1 {
    tp_rxhash: u32,
    tp_vlan_tci: u32,
    tp_vlan_tpid: u16,
    tp_padding: u16,
}

#[repr(C)]
#[allow(dead_code)]
struct Tpacket3Hdr {
    tp_next_offset: u32,
    tp_sec: u32,
    tp_nsec: u32,
    tp_snaplen: u32,
    tp_len: u32,
    tp_status: u32,
    tp_mac: u16,
    tp_net: u16,
    hv1: TpacketHdrVariant1,
    tp_padding: [u8; 8],
}

#[repr(C)]
#[allow(dead_code)]
struct TpacketBdTs {
    ts_sec: u32,
    ts_frac: u32,
}

#[repr(C)]
#[allow(dead_code)]
struct TpacketHdrV1 {
    block_status: u32,
    num_pkts: u32,
    offset_to_first_pkt: u32,
    blk_len: u32,
    seq_num: u64,
    ts_first_pkt: TpacketBdTs,
    ts_last_pkt: TpacketBdTs,
}

#[repr(C)]
#[allow(dead_code)]
struct TpacketBlockDesc {
    version: u32,
    offset_to_priv: u32,
    hdr: TpacketHdrV1,
}

#[repr(C)]
struct TpacketStats {
    tp_packets: u32,
    tp_drops: u32,
}

#[repr(C)]
#[allow(dead_code)]
struct TpacketStatsV3 {
    tp_packets: u32,
    tp_drops: u32,
    tp_freeze_q_cnt: u32,
}

// ---------------------------------------------------------------------------
// Public Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TpacketVersion {
    V1,
    V2,
    V3,
}

impl TpacketVersion {
    fn as_int(self) -> libc::c_int {
        match self {
            TpacketVersion::V1 => 0,
            TpacketVersion::V2 => 1,
            TpacketVersion::V3 => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RingKind {
    Rx,
    Tx,
    RxTx,
}

/// Membership of a kernel fanout group. Frames arriving on the bound
/// interface are spread across all sockets in the group by the policy.
#[derive(Debug, Clone, Copy)]
pub struct FanoutConfig {
    pub group_id: u16,
    pub policy: u32,
}

/// Kernel-side counters for an RX ring.
#[derive(Debug, Clone, Copy, Default)]
pub struct RingStats {
    pub received: u32,
    pub dropped: u32,
}

/// Receiver of frames pulled out of an RX ring. The slices borrow ring
/// memory and are only valid for the duration of the call.
pub trait PacketSink {
    fn on_packet(&mut self, frame: &[u8]);

    fn on_batch(&mut self, frames: &[&[u8]]) {
        for frame in frames {
            self.on_packet(frame);
        }
    }
}

// ---------------------------------------------------------------------------
// Geometry
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Geometry {
    block_size: usize,
    block_count: usize,
    ring_bytes: usize,
    frame_size: usize,
    frame_count: usize,
}

fn ring_geometry(requested: usize, page_size: usize) -> Geometry {
    let block_size = page_size << 2;
    let frame_size = TPACKET_ALIGNMENT << 7;
    let block_count = requested / block_size;
    let ring_bytes = block_count * block_size;
    Geometry {
        block_size,
        block_count,
        ring_bytes,
        frame_size,
        frame_count: ring_bytes / frame_size,
    }
}

fn tpacket_align(v: usize) -> usize {
    (v + TPACKET_ALIGNMENT - 1) & !(TPACKET_ALIGNMENT - 1)
}

/// Offset of the frame payload within a TX slot: the kernel expects data at
/// `TPACKET*_HDRLEN - sizeof(struct sockaddr_ll)`, which reduces to the
/// aligned header size.
fn tx_payload_offset(version: TpacketVersion) -> usize {
    match version {
        TpacketVersion::V1 => tpacket_align(mem::size_of::<TpacketHdr>()),
        TpacketVersion::V2 => tpacket_align(mem::size_of::<Tpacket2Hdr>()),
        TpacketVersion::V3 => tpacket_align(mem::size_of::<Tpacket3Hdr>()),
    }
}

// ---------------------------------------------------------------------------
// Ring
// ---------------------------------------------------------------------------

pub struct Ring {
    version: TpacketVersion,
    kind: RingKind,
    fd: RawFd,
    map: *mut u8,
    map_len: usize,
    /// Bytes of one direction's ring (the map is twice this for RxTx).
    ring_bytes: usize,
    /// RX slots: frames for v1/v2, blocks for v3.
    rx_slot_count: usize,
    rx_slot_size: usize,
    /// TX slots are frame-sized for every version.
    frame_count: usize,
    frame_size: usize,
    rx_idx: usize,
    tx_idx: usize,
}

// The map pointer is only dereferenced by the owning thread.
unsafe impl Send for Ring {}

impl std::fmt::Debug for Ring {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Ring").finish_non_exhaustive()
    }
}

impl Ring {
    /// Create a ring bound to `ifindex`, optionally with an attached BPF
    /// filter and fanout group membership (RX-capable rings only).
    pub fn create(
        version: TpacketVersion,
        kind: RingKind,
        ring_size: usize,
        ifindex: u32,
        filter: Option<&BpfProgram>,
        fanout: Option<FanoutConfig>,
    ) -> Result<Ring> {
        if !(MIN_RING_SIZE..=MAX_RING_SIZE).contains(&ring_size) {
            return Err(Error::Config(format!(
                "ring size {ring_size} outside {MIN_RING_SIZE}..={MAX_RING_SIZE}"
            )));
        }
        if ifindex == 0 {
            return Err(Error::Config("interface index must be nonzero".into()));
        }

        let fd = unsafe { libc::socket(libc::PF_PACKET, libc::SOCK_RAW, 0) };
        if fd < 0 {
            return Err(Error::os("socket(PF_PACKET)"));
        }

        // Partial setup is cleaned up by Drop.
        let mut ring = Ring {
            version,
            kind,
            fd,
            map: ptr::null_mut(),
            map_len: 0,
            ring_bytes: 0,
            rx_slot_count: 0,
            rx_slot_size: 0,
            frame_count: 0,
            frame_size: 0,
            rx_idx: 0,
            tx_idx: 0,
        };

        ring.setup_socket()?;
        ring.setup_ring(ring_size)?;
        ring.map_ring()?;
        ring.bind_ring(ifindex, filter)?;

        if kind != RingKind::Tx {
            if let Some(f) = fanout {
                ring.join_fanout(f)?;
            }
        }

        let slots = if kind == RingKind::Tx {
            ring.frame_count
        } else {
            ring.rx_slot_count
        };
        info!(
            ifindex,
            version = ?version,
            kind = ?kind,
            ring_bytes = ring.ring_bytes,
            slots,
            "packet ring created"
        );

        Ok(ring)
    }

    fn setup_socket(&mut self) -> Result<()> {
        if self.kind != RingKind::Rx {
            // Skip the qdisc on transmit; losses are preferable to blocking.
            let one: libc::c_int = 1;
            if unsafe { self.setopt(PACKET_QDISC_BYPASS, &one) } < 0 {
                return Err(Error::os("setsockopt(PACKET_QDISC_BYPASS)"));
            }
        }

        let version = self.version.as_int();
        if unsafe { self.setopt(PACKET_VERSION, &version) } < 0 {
            return Err(Error::os("setsockopt(PACKET_VERSION)"));
        }

        Ok(())
    }

    fn setup_ring(&mut self, ring_size: usize) -> Result<()> {
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let geo = ring_geometry(ring_size, page);
        if geo.block_count == 0 || geo.frame_count == 0 {
            return Err(Error::Config(format!("ring size {ring_size} too small")));
        }

        self.ring_bytes = geo.ring_bytes;
        self.frame_count = geo.frame_count;
        self.frame_size = geo.frame_size;

        let ret = match self.version {
            TpacketVersion::V1 | TpacketVersion::V2 => {
                if self.kind != RingKind::Rx {
                    // Drop instead of blocking when a TX frame cannot be sent.
                    let one: libc::c_int = 1;
                    if unsafe { self.setopt(PACKET_LOSS, &one) } < 0 {
                        return Err(Error::os("setsockopt(PACKET_LOSS)"));
                    }
                }

                self.rx_slot_count = geo.frame_count;
                self.rx_slot_size = geo.frame_size;

                let req = TpacketReq {
                    tp_block_size: geo.block_size as u32,
                    tp_block_nr: geo.block_count as u32,
                    tp_frame_size: geo.frame_size as u32,
                    tp_frame_nr: geo.frame_count as u32,
                };
                self.request_rings(&req)
            }
            TpacketVersion::V3 => {
                self.rx_slot_count = geo.block_count;
                self.rx_slot_size = geo.block_size;

                let mut req = TpacketReq3 {
                    tp_block_size: geo.block_size as u32,
                    tp_block_nr: geo.block_count as u32,
                    tp_frame_size: geo.frame_size as u32,
                    tp_frame_nr: geo.frame_count as u32,
                    tp_retire_blk_tov: 0,
                    tp_sizeof_priv: 0,
                    tp_feature_req_word: 0,
                };
                if self.kind != RingKind::Tx {
                    req.tp_retire_blk_tov = BLOCK_RETIRE_TOV_MS;
                    req.tp_feature_req_word = TP_FT_REQ_FILL_RXHASH;
                }
                self.request_rings(&req)
            }
        };

        if ret < 0 {
            return Err(Error::os("setsockopt(PACKET_RX_RING/PACKET_TX_RING)"));
        }
        Ok(())
    }

    fn request_rings<T>(&self, req: &T) -> libc::c_int {
        unsafe {
            match self.kind {
                RingKind::Rx => self.setopt(PACKET_RX_RING, req),
                RingKind::Tx => self.setopt(PACKET_TX_RING, req),
                RingKind::RxTx => {
                    let ret = self.setopt(PACKET_RX_RING, req);
                    if ret < 0 {
                        return ret;
                    }
                    self.setopt(PACKET_TX_RING, req)
                }
            }
        }
    }

    fn map_ring(&mut self) -> Result<()> {
        let len = if self.kind == RingKind::RxTx {
            2 * self.ring_bytes
        } else {
            self.ring_bytes
        };

        let p = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_LOCKED | libc::MAP_POPULATE,
                self.fd,
                0,
            )
        };
        if p == libc::MAP_FAILED {
            return Err(Error::os("mmap(packet ring)"));
        }

        self.map = p as *mut u8;
        self.map_len = len;
        Ok(())
    }

    fn bind_ring(&mut self, ifindex: u32, filter: Option<&BpfProgram>) -> Result<()> {
        if let Some(prog) = filter {
            // The kernel copies the program during the call.
            let fprog = prog.as_fprog();
            let ret = unsafe {
                libc::setsockopt(
                    self.fd,
                    libc::SOL_SOCKET,
                    libc::SO_ATTACH_FILTER,
                    &fprog as *const _ as *const libc::c_void,
                    mem::size_of_val(&fprog) as libc::socklen_t,
                )
            };
            if ret < 0 {
                return Err(Error::os("setsockopt(SO_ATTACH_FILTER)"));
            }
        }

        let mut addr: libc::sockaddr_ll = unsafe { mem::zeroed() };
        addr.sll_family = libc::AF_PACKET as u16;
        addr.sll_protocol = ETH_P_ALL.to_be();
        addr.sll_ifindex = ifindex as libc::c_int;

        let ret = unsafe {
            libc::bind(
                self.fd,
                &addr as *const _ as *const libc::sockaddr,
                mem::size_of::<libc::sockaddr_ll>() as libc::socklen_t,
            )
        };
        if ret < 0 {
            return Err(Error::os("bind(AF_PACKET)"));
        }
        Ok(())
    }

    fn join_fanout(&mut self, fanout: FanoutConfig) -> Result<()> {
        let optval: libc::c_int = ((fanout.policy as libc::c_int) << 16) | fanout.group_id as libc::c_int;
        if unsafe { self.setopt(PACKET_FANOUT, &optval) } < 0 {
            return Err(Error::os("setsockopt(PACKET_FANOUT)"));
        }
        Ok(())
    }

    unsafe fn setopt<T>(&self, opt: libc::c_int, val: &T) -> libc::c_int {
        libc::setsockopt(
            self.fd,
            SOL_PACKET,
            opt,
            val as *const T as *const libc::c_void,
            mem::size_of::<T>() as libc::socklen_t,
        )
    }

    // -- Receive ------------------------------------------------------------

    /// Drain one slot if available; otherwise wait up to `timeout_ms` for
    /// readability and retry once. Returns whether a slot was consumed.
    pub fn recv(&mut self, timeout_ms: libc::c_int, sink: &mut dyn PacketSink) -> Result<bool> {
        if self.recv_once(sink) {
            return Ok(true);
        }
        if !self.wait_readable(timeout_ms)? {
            return Ok(false);
        }
        Ok(self.recv_once(sink))
    }

    fn recv_once(&mut self, sink: &mut dyn PacketSink) -> bool {
        match self.version {
            TpacketVersion::V1 => self.recv_v1(sink),
            TpacketVersion::V2 => self.recv_v2(sink),
            TpacketVersion::V3 => self.recv_v3(sink),
        }
    }

    fn recv_v1(&mut self, sink: &mut dyn PacketSink) -> bool {
        unsafe {
            let slot = self.map.add(self.rx_idx * self.rx_slot_size);
            let hdr = slot as *mut TpacketHdr;

            let status = ptr::read_volatile(ptr::addr_of!((*hdr).tp_status));
            if status & TP_STATUS_USER as libc::c_ulong == 0 {
                return false;
            }
            fence(Ordering::Acquire);

            let mac = (*hdr).tp_mac as usize;
            let snaplen = (*hdr).tp_snaplen as usize;
            sink.on_packet(slice::from_raw_parts(slot.add(mac), snaplen));

            fence(Ordering::SeqCst);
            ptr::write_volatile(
                ptr::addr_of_mut!((*hdr).tp_status),
                TP_STATUS_KERNEL as libc::c_ulong,
            );
        }

        self.rx_idx = (self.rx_idx + 1) % self.rx_slot_count;
        true
    }

    fn recv_v2(&mut self, sink: &mut dyn PacketSink) -> bool {
        unsafe {
            let slot = self.map.add(self.rx_idx * self.rx_slot_size);
            let hdr = slot as *mut Tpacket2Hdr;

            let status = ptr::read_volatile(ptr::addr_of!((*hdr).tp_status));
            if status & TP_STATUS_USER == 0 {
                return false;
            }
            fence(Ordering::Acquire);

            let mac = (*hdr).tp_mac as usize;
            let snaplen = (*hdr).tp_snaplen as usize;
            sink.on_packet(slice::from_raw_parts(slot.add(mac), snaplen));

            fence(Ordering::SeqCst);
            ptr::write_volatile(ptr::addr_of_mut!((*hdr).tp_status), TP_STATUS_KERNEL);
        }

        self.rx_idx = (self.rx_idx + 1) % self.rx_slot_count;
        true
    }

    fn recv_v3(&mut self, sink: &mut dyn PacketSink) -> bool {
        unsafe {
            let slot = self.map.add(self.rx_idx * self.rx_slot_size);
            let desc = slot as *mut TpacketBlockDesc;

            let status = ptr::read_volatile(ptr::addr_of!((*desc).hdr.block_status));
            if status & TP_STATUS_USER == 0 {
                return false;
            }
            fence(Ordering::Acquire);

            let num_pkts = (*desc).hdr.num_pkts as usize;
            let mut pkt = slot.add((*desc).hdr.offset_to_first_pkt as usize);

            let mut batch: Vec<&[u8]> = Vec::with_capacity(num_pkts.min(MAX_BATCH));
            for _ in 0..num_pkts {
                if batch.len() == MAX_BATCH {
                    sink.on_batch(&batch);
                    batch.clear();
                }

                let hdr = pkt as *const Tpacket3Hdr;
                let mac = (*hdr).tp_mac as usize;
                let snaplen = (*hdr).tp_snaplen as usize;
                batch.push(slice::from_raw_parts(pkt.add(mac), snaplen));

                pkt = pkt.add((*hdr).tp_next_offset as usize);
                fence(Ordering::SeqCst);
            }
            sink.on_batch(&batch);

            fence(Ordering::SeqCst);
            ptr::write_volatile(
                ptr::addr_of_mut!((*desc).hdr.block_status),
                TP_STATUS_KERNEL,
            );
        }

        self.rx_idx = (self.rx_idx + 1) % self.rx_slot_count;
        true
    }

    // -- Transmit -----------------------------------------------------------

    /// Send one contiguous frame.
    pub fn send(&mut self, pkt: &[u8], timeout_ms: libc::c_int) -> Result<()> {
        self.send_vectored(&[pkt], timeout_ms)
    }

    /// Send one frame assembled from a gather list. Retries once after
    /// waiting for writability when the next slot is busy.
    pub fn send_vectored(&mut self, parts: &[&[u8]], timeout_ms: libc::c_int) -> Result<()> {
        match self.fill_slot(parts) {
            Ok(()) => self.kick(),
            Err(Error::TxBusy) => {
                if !self.wait_writable(timeout_ms)? {
                    return Err(Error::TxBusy);
                }
                self.fill_slot(parts)?;
                self.kick()
            }
            Err(e) => Err(e),
        }
    }

    /// Queue several frames, waiting per slot when necessary, then kick the
    /// kernel once.
    pub fn send_many(&mut self, pkts: &[&[u8]], timeout_ms: libc::c_int) -> Result<()> {
        for &pkt in pkts {
            loop {
                match self.fill_slot(&[pkt]) {
                    Ok(()) => break,
                    Err(Error::TxBusy) => {
                        if !self.wait_writable(timeout_ms)? {
                            return Err(Error::TxBusy);
                        }
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        self.kick()
    }

    /// Copy a frame into the next TX slot and publish it, without kicking.
    fn fill_slot(&mut self, parts: &[&[u8]]) -> Result<()> {
        let payload_off = tx_payload_offset(self.version);
        let total: usize = parts.iter().map(|p| p.len()).sum();
        if payload_off + total > self.frame_size {
            return Err(Error::Config(format!(
                "frame of {total} bytes does not fit a {} byte slot",
                self.frame_size
            )));
        }

        let tx_off = if self.kind == RingKind::RxTx {
            self.ring_bytes
        } else {
            0
        };

        unsafe {
            let slot = self.map.add(tx_off + self.tx_idx * self.frame_size);

            if self.tx_status(slot) & (TP_STATUS_SEND_REQUEST | TP_STATUS_SENDING) != 0 {
                return Err(Error::TxBusy);
            }

            let mut dst = slot.add(payload_off);
            for part in parts {
                ptr::copy_nonoverlapping(part.as_ptr(), dst, part.len());
                dst = dst.add(part.len());
            }

            self.tx_publish(slot, total);
        }

        self.tx_idx = (self.tx_idx + 1) % self.frame_count;
        Ok(())
    }

    unsafe fn tx_status(&self, slot: *mut u8) -> u32 {
        match self.version {
            // tp_status is the first field of every TX header variant.
            TpacketVersion::V1 => ptr::read_volatile(slot as *const libc::c_ulong) as u32,
            TpacketVersion::V2 => ptr::read_volatile(slot as *const u32),
            TpacketVersion::V3 => {
                let hdr = slot as *const Tpacket3Hdr;
                ptr::read_volatile(ptr::addr_of!((*hdr).tp_status))
            }
        }
    }

    unsafe fn tx_publish(&self, slot: *mut u8, len: usize) {
        match self.version {
            TpacketVersion::V1 => {
                let hdr = slot as *mut TpacketHdr;
                (*hdr).tp_len = len as u32;
                fence(Ordering::SeqCst);
                ptr::write_volatile(
                    ptr::addr_of_mut!((*hdr).tp_status),
                    TP_STATUS_SEND_REQUEST as libc::c_ulong,
                );
            }
            TpacketVersion::V2 => {
                let hdr = slot as *mut Tpacket2Hdr;
                (*hdr).tp_len = len as u32;
                fence(Ordering::SeqCst);
                ptr::write_volatile(ptr::addr_of_mut!((*hdr).tp_status), TP_STATUS_SEND_REQUEST);
            }
            TpacketVersion::V3 => {
                let hdr = slot as *mut Tpacket3Hdr;
                (*hdr).tp_len = len as u32;
                (*hdr).tp_next_offset = 0;
                fence(Ordering::SeqCst);
                ptr::write_volatile(ptr::addr_of_mut!((*hdr).tp_status), TP_STATUS_SEND_REQUEST);
            }
        }
    }

    /// Zero-length `sendto` that tells the kernel to walk the TX ring.
    fn kick(&self) -> Result<()> {
        let ret = unsafe { libc::sendto(self.fd, ptr::null(), 0, 0, ptr::null(), 0) };
        if ret < 0 {
            return Err(Error::os("sendto(kick)"));
        }
        Ok(())
    }

    // -- Polling ------------------------------------------------------------

    fn wait_readable(&self, timeout_ms: libc::c_int) -> Result<bool> {
        self.wait(libc::POLLIN | libc::POLLERR, timeout_ms)
    }

    fn wait_writable(&self, timeout_ms: libc::c_int) -> Result<bool> {
        self.wait(libc::POLLOUT | libc::POLLERR, timeout_ms)
    }

    fn wait(&self, events: libc::c_short, timeout_ms: libc::c_int) -> Result<bool> {
        let mut pfd = libc::pollfd {
            fd: self.fd,
            events,
            revents: 0,
        };
        match unsafe { libc::poll(&mut pfd, 1, timeout_ms) } {
            1 => Ok(true),
            0 => Ok(false),
            _ => {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    Ok(false)
                } else {
                    Err(Error::Os {
                        op: "poll",
                        source: err,
                    })
                }
            }
        }
    }

    // -- Statistics ---------------------------------------------------------

    /// Kernel receive/drop counters for this ring. The counters reset on
    /// every query.
    pub fn statistics(&self) -> Result<RingStats> {
        unsafe {
            match self.version {
                TpacketVersion::V3 => {
                    let mut stats: TpacketStatsV3 = mem::zeroed();
                    let mut optlen = mem::size_of::<TpacketStatsV3>() as libc::socklen_t;
                    let ret = libc::getsockopt(
                        self.fd,
                        SOL_PACKET,
                        PACKET_STATISTICS,
                        &mut stats as *mut _ as *mut libc::c_void,
                        &mut optlen,
                    );
                    if ret < 0 {
                        return Err(Error::os("getsockopt(PACKET_STATISTICS)"));
                    }
                    Ok(RingStats {
                        received: stats.tp_packets,
                        dropped: stats.tp_drops,
                    })
                }
                _ => {
                    let mut stats: TpacketStats = mem::zeroed();
                    let mut optlen = mem::size_of::<TpacketStats>() as libc::socklen_t;
                    let ret = libc::getsockopt(
                        self.fd,
                        SOL_PACKET,
                        PACKET_STATISTICS,
                        &mut stats as *mut _ as *mut libc::c_void,
                        &mut optlen,
                    );
                    if ret < 0 {
                        return Err(Error::os("getsockopt(PACKET_STATISTICS)"));
                    }
                    Ok(RingStats {
                        received: stats.tp_packets,
                        dropped: stats.tp_drops,
                    })
                }
            }
        }
    }
}

impl Drop for Ring {
    fn drop(&mut self) {
        unsafe {
            if !self.map.is_null() {
                libc::munmap(self.map as *mut libc::c_void, self.map_len);
            }
            if self.fd >= 0 {
                libc::close(self.fd);
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
