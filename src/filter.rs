//! Destination-port packet filter.
//!
//! Builds a classic BPF program over the raw L2 frame that accepts UDP
//! datagrams for the configured destination ports (IPv4 and/or IPv6) and
//! ignores everything else, including fragmented IPv4. The compiled program
//! is attached to the RX socket with `SO_ATTACH_FILTER` so unwanted traffic
//! never reaches the ring.

use std::fmt::Write as _;

use crate::error::{Error, Result};

// ---------------------------------------------------------------------------
// Ethernet / IP / UDP Layout Constants
// ---------------------------------------------------------------------------

pub(crate) const ETH_HLEN: usize = 14;
pub(crate) const ETH_TYPE_OFF: usize = 12;
pub(crate) const IPV4_MIN_HLEN: usize = 20;
pub(crate) const IPV6_HLEN: usize = 40;
pub(crate) const UDP_HLEN: usize = 8;

pub(crate) const ETHERTYPE_IPV4: u16 = 0x0800;
pub(crate) const ETHERTYPE_IPV6: u16 = 0x86dd;
pub(crate) const IPPROTO_UDP: u8 = 17;

/// Offset of the checksum field within the IPv4 header.
pub(crate) const IPV4_CHECK_OFF: usize = 10;
/// Offset of the source address within the IPv6 header.
pub(crate) const IPV6_SRC_OFF: usize = 8;

const IPV4_PROTO_OFF: usize = 9;
const IPV4_FRAG_OFF: usize = 6;
const IPV6_NEXT_HDR_OFF: usize = 6;
const UDP_DEST_OFF: usize = 2;

const MIN_LEN_IPV4: u32 = (ETH_HLEN + IPV4_MIN_HLEN + UDP_HLEN) as u32;
const MIN_LEN_IPV6: u32 = (ETH_HLEN + IPV6_HLEN + UDP_HLEN) as u32;

// ---------------------------------------------------------------------------
// Classic BPF Constants (from <linux/bpf_common.h> / <linux/filter.h>)
// ---------------------------------------------------------------------------

const BPF_LD: u16 = 0x00;
const BPF_JMP: u16 = 0x05;
const BPF_RET: u16 = 0x06;

const BPF_W: u16 = 0x00;
const BPF_H: u16 = 0x08;
const BPF_B: u16 = 0x10;

const BPF_ABS: u16 = 0x20;
const BPF_LEN: u16 = 0x80;

const BPF_K: u16 = 0x00;

const BPF_JEQ: u16 = 0x10;
const BPF_JGT: u16 = 0x20;
const BPF_JGE: u16 = 0x30;
const BPF_JSET: u16 = 0x40;

/// Accept verdict: snapshot up to 256 KiB of the frame.
const ACCEPT: u32 = 0x40000;
/// Ignore verdict.
const IGNORE: u32 = 0;

/// Program length cap. Far below the kernel's limit, and it keeps every
/// back-patched branch offset within `u8`.
const MAX_INSTRUCTIONS: usize = 255;

// ---------------------------------------------------------------------------
// Port Ranges
// ---------------------------------------------------------------------------

pub const MAX_PORT_RANGES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortRange {
    pub from: u16,
    pub to: u16,
}

/// Ordered set of disjoint, non-touching, closed port ranges.
///
/// Insertion merges any range that overlaps or touches existing entries, so
/// the invariant `ranges[i].to + 1 < ranges[i + 1].from` always holds.
#[derive(Debug, Default)]
pub struct PortRanges {
    ranges: Vec<PortRange>,
}

impl PortRanges {
    pub fn add_port(&mut self, port: u16) -> Result<()> {
        self.add_range(port, port)
    }

    pub fn add_range(&mut self, from: u16, to: u16) -> Result<()> {
        if from == 0 || from > to {
            return Err(Error::Config(format!("invalid port range {from}-{to}")));
        }

        // First entry that ends at `from - 1` or later can touch or overlap
        // the new range; everything before it stays untouched.
        let i = self
            .ranges
            .iter()
            .position(|r| u32::from(r.to) + 1 >= u32::from(from))
            .unwrap_or(self.ranges.len());

        // Entries `[i, j)` touch or overlap `[from, to]`.
        let mut j = i;
        while j < self.ranges.len() && u32::from(to) + 1 >= u32::from(self.ranges[j].from) {
            j += 1;
        }

        if i == j {
            // Disjoint from every existing range.
            if self.ranges.len() == MAX_PORT_RANGES {
                return Err(Error::Capacity("port ranges"));
            }
            self.ranges.insert(i, PortRange { from, to });
        } else {
            let merged = PortRange {
                from: from.min(self.ranges[i].from),
                to: to.max(self.ranges[j - 1].to),
            };
            self.ranges.splice(i..j, [merged]);
        }

        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn as_slice(&self) -> &[PortRange] {
        &self.ranges
    }
}

// ---------------------------------------------------------------------------
// BPF Program
// ---------------------------------------------------------------------------

/// One classic BPF instruction (`struct sock_filter`).
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

/// `struct sock_fprog`, the argument of `SO_ATTACH_FILTER`. The kernel
/// copies the instructions during the call, so this view only needs to
/// outlive the `setsockopt`.
#[repr(C)]
#[allow(dead_code)]
pub struct SockFprog {
    len: libc::c_ushort,
    filter: *const SockFilter,
}

/// A compiled filter program. Owns the instruction storage.
pub struct BpfProgram {
    insns: Vec<SockFilter>,
}

impl BpfProgram {
    pub fn len(&self) -> usize {
        self.insns.len()
    }

    pub fn instructions(&self) -> &[SockFilter] {
        &self.insns
    }

    pub(crate) fn as_fprog(&self) -> SockFprog {
        SockFprog {
            len: self.insns.len() as libc::c_ushort,
            filter: self.insns.as_ptr(),
        }
    }

    /// Human-readable disassembly with resolved branch targets.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, f) in self.instructions().iter().enumerate() {
            let _ = write!(out, "({i:03}) ");
            let _ = match f.code {
                c if c == BPF_LD + BPF_W + BPF_LEN => writeln!(out, "ld       #pktlen"),
                c if c == BPF_LD + BPF_W + BPF_ABS => writeln!(out, "ld       [{}]", f.k),
                c if c == BPF_LD + BPF_H + BPF_ABS => writeln!(out, "ldh      [{}]", f.k),
                c if c == BPF_LD + BPF_B + BPF_ABS => writeln!(out, "ldb      [{}]", f.k),
                c if c == BPF_JMP + BPF_JEQ + BPF_K => writeln!(
                    out,
                    "jeq      #{:#x} jt {} jf {}",
                    f.k,
                    i + 1 + f.jt as usize,
                    i + 1 + f.jf as usize
                ),
                c if c == BPF_JMP + BPF_JGT + BPF_K => writeln!(
                    out,
                    "jgt      #{:#x} jt {} jf {}",
                    f.k,
                    i + 1 + f.jt as usize,
                    i + 1 + f.jf as usize
                ),
                c if c == BPF_JMP + BPF_JGE + BPF_K => writeln!(
                    out,
                    "jge      #{:#x} jt {} jf {}",
                    f.k,
                    i + 1 + f.jt as usize,
                    i + 1 + f.jf as usize
                ),
                c if c == BPF_JMP + BPF_JSET + BPF_K => writeln!(
                    out,
                    "jset     #{:#x} jt {} jf {}",
                    f.k,
                    i + 1 + f.jt as usize,
                    i + 1 + f.jf as usize
                ),
                c if c == BPF_RET + BPF_K => writeln!(out, "ret      #{}", f.k),
                _ => writeln!(out, "unknown  code={:#x} k={:#x}", f.code, f.k),
            };
        }
        out
    }
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

/// Which branch field of a recorded instruction gets back-patched.
#[derive(Clone, Copy)]
struct Patch {
    idx: usize,
    on_true: bool,
}

#[derive(Default)]
struct Builder {
    insns: Vec<SockFilter>,
    // Branches to rewrite once the shared IGNORE / ACCEPT returns exist.
    ignores: Vec<Patch>,
    accepts: Vec<Patch>,
}

impl Builder {
    fn stmt(&mut self, code: u16, k: u32) -> Result<()> {
        if self.insns.len() == MAX_INSTRUCTIONS {
            return Err(Error::Capacity("filter instructions"));
        }
        self.insns.push(SockFilter {
            code,
            jt: 0,
            jf: 0,
            k,
        });
        Ok(())
    }

    fn jump(&mut self, code: u16, k: u32, jt: u8, jf: u8) -> Result<usize> {
        if self.insns.len() == MAX_INSTRUCTIONS {
            return Err(Error::Capacity("filter instructions"));
        }
        self.insns.push(SockFilter { code, jt, jf, k });
        Ok(self.insns.len() - 1)
    }

    fn here(&self) -> usize {
        self.insns.len()
    }

    /// Resolve a recorded branch to the current position.
    fn patch(&mut self, p: Patch) {
        let offset = (self.here() - p.idx - 1) as u8;
        if p.on_true {
            self.insns[p.idx].jt = offset;
        } else {
            self.insns[p.idx].jf = offset;
        }
    }

    /// Emit the per-range destination-port tests. The accumulator must
    /// already hold the UDP destination port. Single ports use one `jeq`;
    /// ranges use `jge from` (skip to the next test if below) followed by
    /// `jgt to` (accept if within, fall through to the next test if above).
    fn port_tests(&mut self, ranges: &PortRanges) -> Result<()> {
        for r in ranges.as_slice() {
            if r.from == r.to {
                let idx = self.jump(BPF_JMP + BPF_JEQ + BPF_K, u32::from(r.from), 0, 0)?;
                self.accepts.push(Patch { idx, on_true: true });
            } else {
                self.jump(BPF_JMP + BPF_JGE + BPF_K, u32::from(r.from), 0, 1)?;
                let idx = self.jump(BPF_JMP + BPF_JGT + BPF_K, u32::from(r.to), 0, 0)?;
                self.accepts.push(Patch {
                    idx,
                    on_true: false,
                });
            }
        }
        Ok(())
    }
}

/// Compile the filter for the enabled IP families and port ranges.
///
/// If neither family is enabled, both are. An empty range set accepts any
/// UDP destination port.
pub fn compile(ipv4: bool, ipv6: bool, ranges: &PortRanges) -> Result<BpfProgram> {
    let (ipv4, ipv6) = if !ipv4 && !ipv6 {
        (true, true)
    } else {
        (ipv4, ipv6)
    };

    let mut b = Builder::default();

    let min_len = if ipv4 { MIN_LEN_IPV4 } else { MIN_LEN_IPV6 };

    // Too-short frames can never be valid UDP for an enabled family.
    b.stmt(BPF_LD + BPF_W + BPF_LEN, 0)?;
    let idx = b.jump(BPF_JMP + BPF_JGE + BPF_K, min_len, 0, 0)?;
    b.ignores.push(Patch {
        idx,
        on_true: false,
    });

    b.stmt(BPF_LD + BPF_H + BPF_ABS, ETH_TYPE_OFF as u32)?;

    if ipv6 {
        // On Ethertype mismatch fall through to the IPv4 section, or to the
        // IGNORE return when IPv4 is disabled.
        let ethertype_jump = b.jump(BPF_JMP + BPF_JEQ + BPF_K, u32::from(ETHERTYPE_IPV6), 0, 0)?;
        if !ipv4 {
            b.ignores.push(Patch {
                idx: ethertype_jump,
                on_true: false,
            });
        }

        if ipv4 {
            // The shared minimum-length check used the shorter IPv4 bound.
            b.stmt(BPF_LD + BPF_W + BPF_LEN, 0)?;
            let idx = b.jump(BPF_JMP + BPF_JGE + BPF_K, MIN_LEN_IPV6, 0, 0)?;
            b.ignores.push(Patch {
                idx,
                on_true: false,
            });
        }

        b.stmt(
            BPF_LD + BPF_B + BPF_ABS,
            (ETH_HLEN + IPV6_NEXT_HDR_OFF) as u32,
        )?;
        let idx = b.jump(BPF_JMP + BPF_JEQ + BPF_K, u32::from(IPPROTO_UDP), 0, 0)?;
        b.ignores.push(Patch {
            idx,
            on_true: false,
        });

        if !ranges.is_empty() {
            b.stmt(
                BPF_LD + BPF_H + BPF_ABS,
                (ETH_HLEN + IPV6_HLEN + UDP_DEST_OFF) as u32,
            )?;
            b.port_tests(ranges)?;
            // No range matched.
            b.stmt(BPF_RET + BPF_K, IGNORE)?;
        } else {
            b.stmt(BPF_RET + BPF_K, ACCEPT)?;
        }

        if ipv4 {
            // The Ethertype mismatch lands at the start of the IPv4 section.
            let offset = (b.here() - ethertype_jump - 1) as u8;
            b.insns[ethertype_jump].jf = offset;
        }
    }

    if ipv4 {
        let idx = b.jump(BPF_JMP + BPF_JEQ + BPF_K, u32::from(ETHERTYPE_IPV4), 0, 0)?;
        b.ignores.push(Patch {
            idx,
            on_true: false,
        });

        b.stmt(BPF_LD + BPF_B + BPF_ABS, (ETH_HLEN + IPV4_PROTO_OFF) as u32)?;
        let idx = b.jump(BPF_JMP + BPF_JEQ + BPF_K, u32::from(IPPROTO_UDP), 0, 0)?;
        b.ignores.push(Patch {
            idx,
            on_true: false,
        });

        // MF flag or a nonzero fragment offset: not a first, whole datagram.
        b.stmt(BPF_LD + BPF_H + BPF_ABS, (ETH_HLEN + IPV4_FRAG_OFF) as u32)?;
        let idx = b.jump(BPF_JMP + BPF_JSET + BPF_K, 0x3fff, 0, 0)?;
        b.ignores.push(Patch { idx, on_true: true });

        if !ranges.is_empty() {
            b.stmt(
                BPF_LD + BPF_H + BPF_ABS,
                (ETH_HLEN + IPV4_MIN_HLEN + UDP_DEST_OFF) as u32,
            )?;
            b.port_tests(ranges)?;
            // Falls through to the shared IGNORE return below.
        } else {
            b.stmt(BPF_RET + BPF_K, ACCEPT)?;
        }
    }

    for p in std::mem::take(&mut b.ignores) {
        b.patch(p);
    }
    b.stmt(BPF_RET + BPF_K, IGNORE)?;

    for p in std::mem::take(&mut b.accepts) {
        b.patch(p);
    }
    b.stmt(BPF_RET + BPF_K, ACCEPT)?;

    Ok(BpfProgram { insns: b.insns })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forward::testutil::{ipv4_udp_frame, ipv6_udp_frame};

    /// Minimal classic BPF interpreter covering the opcodes the compiler
    /// emits. Returns the program's verdict for the frame.
    fn run(prog: &BpfProgram, pkt: &[u8]) -> u32 {
        let insns = prog.instructions();
        let mut a: u32 = 0;
        let mut pc = 0usize;

        loop {
            let f = insns[pc];
            match f.code {
                c if c == BPF_LD + BPF_W + BPF_LEN => a = pkt.len() as u32,
                c if c == BPF_LD + BPF_H + BPF_ABS => {
                    let k = f.k as usize;
                    if k + 2 > pkt.len() {
                        return 0;
                    }
                    a = u32::from(u16::from_be_bytes([pkt[k], pkt[k + 1]]));
                }
                c if c == BPF_LD + BPF_B + BPF_ABS => {
                    let k = f.k as usize;
                    if k >= pkt.len() {
                        return 0;
                    }
                    a = u32::from(pkt[k]);
                }
                c if c == BPF_JMP + BPF_JEQ + BPF_K => {
                    pc += if a == f.k { f.jt } else { f.jf } as usize;
                }
                c if c == BPF_JMP + BPF_JGT + BPF_K => {
                    pc += if a > f.k { f.jt } else { f.jf } as usize;
                }
                c if c == BPF_JMP + BPF_JGE + BPF_K => {
                    pc += if a >= f.k { f.jt } else { f.jf } as usize;
                }
                c if c == BPF_JMP + BPF_JSET + BPF_K => {
                    pc += if a & f.k != 0 { f.jt } else { f.jf } as usize;
                }
                c if c == BPF_RET + BPF_K => return f.k,
                other => panic!("unexpected opcode {other:#x}"),
            }
            pc += 1;
        }
    }

    fn accepts(prog: &BpfProgram, pkt: &[u8]) -> bool {
        run(prog, pkt) != 0
    }

    fn ranges(list: &[(u16, u16)]) -> PortRanges {
        let mut r = PortRanges::default();
        for &(from, to) in list {
            r.add_range(from, to).unwrap();
        }
        r
    }

    #[test]
    fn test_ranges_sorted_and_disjoint_any_order() {
        let mut r = PortRanges::default();
        r.add_range(5000, 5010).unwrap();
        r.add_port(80).unwrap();
        r.add_range(4000, 4999).unwrap();
        r.add_range(9000, 9000).unwrap();
        assert_eq!(
            r.as_slice(),
            &[
                PortRange { from: 80, to: 80 },
                PortRange {
                    from: 4000,
                    to: 5010
                },
                PortRange {
                    from: 9000,
                    to: 9000
                },
            ]
        );
    }

    #[test]
    fn test_touching_ranges_merge() {
        let mut r = PortRanges::default();
        r.add_range(100, 200).unwrap();
        r.add_range(201, 300).unwrap();
        assert_eq!(r.as_slice(), &[PortRange { from: 100, to: 300 }]);

        // Merging several existing entries at once.
        let mut r = PortRanges::default();
        r.add_range(10, 20).unwrap();
        r.add_range(30, 40).unwrap();
        r.add_range(50, 60).unwrap();
        r.add_range(15, 55).unwrap();
        assert_eq!(r.as_slice(), &[PortRange { from: 10, to: 60 }]);
    }

    #[test]
    fn test_range_boundaries() {
        let mut r = PortRanges::default();
        r.add_port(1).unwrap();
        r.add_port(65535).unwrap();
        assert!(r.add_range(0, 10).is_err());
        assert!(r.add_range(10, 5).is_err());
        assert_eq!(r.len(), 2);
    }

    #[test]
    fn test_capacity_33rd_range_rejected() {
        let mut r = PortRanges::default();
        for i in 0..32u16 {
            // Leave gaps so nothing merges.
            r.add_port(1 + i * 10).unwrap();
        }
        assert_eq!(r.len(), 32);
        assert!(matches!(
            r.add_port(20000),
            Err(Error::Capacity("port ranges"))
        ));
        // A merging insert is still fine at capacity.
        r.add_port(2).unwrap();
        assert_eq!(r.len(), 32);
    }

    #[test]
    fn test_filter_accepts_configured_ports() {
        let prog = compile(false, false, &ranges(&[(1000, 1002), (2000, 2000)])).unwrap();
        for (port, expected) in [
            (999, false),
            (1000, true),
            (1001, true),
            (1002, true),
            (1003, false),
            (2000, true),
            (2001, false),
        ] {
            let frame = ipv4_udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1234, port, b"x", 5, 0);
            assert_eq!(accepts(&prog, &frame), expected, "port {port}");
        }
    }

    #[test]
    fn test_filter_no_ranges_accepts_any_udp_port() {
        let prog = compile(false, false, &PortRanges::default()).unwrap();
        let frame = ipv4_udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 40000, b"payload", 5, 0);
        assert!(accepts(&prog, &frame));
    }

    #[test]
    fn test_filter_drops_fragments() {
        let prog = compile(false, false, &ranges(&[(5000, 5000)])).unwrap();
        let whole = ipv4_udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 5000, b"x", 5, 0);
        assert!(accepts(&prog, &whole));

        // Nonzero fragment offset.
        let frag = ipv4_udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 5000, b"x", 5, 0x00b9);
        assert!(!accepts(&prog, &frag));

        // More-fragments flag set, offset zero.
        let mf = ipv4_udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 5000, b"x", 5, 0x2000);
        assert!(!accepts(&prog, &mf));

        // The DF bit alone is not a fragment.
        let df = ipv4_udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 5000, b"x", 5, 0x4000);
        assert!(accepts(&prog, &df));
    }

    #[test]
    fn test_filter_drops_non_udp() {
        let prog = compile(false, false, &PortRanges::default()).unwrap();

        let mut tcp = ipv4_udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 5000, b"x", 5, 0);
        tcp[ETH_HLEN + IPV4_PROTO_OFF] = 6;
        assert!(!accepts(&prog, &tcp));

        let src = "fe80::1".parse().unwrap();
        let dst = "fe80::2".parse().unwrap();
        let mut v6 = ipv6_udp_frame(src, dst, 1, 5000, b"x");
        v6[ETH_HLEN + IPV6_NEXT_HDR_OFF] = 6;
        assert!(!accepts(&prog, &v6));
    }

    #[test]
    fn test_filter_ipv6_ports() {
        let prog = compile(false, false, &ranges(&[(7000, 7001)])).unwrap();
        let src = "fe80::1".parse().unwrap();
        let dst = "fe80::2".parse().unwrap();

        let hit = ipv6_udp_frame(src, dst, 9, 7001, b"abc");
        assert!(accepts(&prog, &hit));

        let miss = ipv6_udp_frame(src, dst, 9, 7002, b"abc");
        assert!(!accepts(&prog, &miss));
    }

    #[test]
    fn test_filter_family_selection() {
        let v4_frame = ipv4_udp_frame([10, 0, 0, 1], [10, 0, 0, 2], 1, 5000, b"x", 5, 0);
        let src = "fe80::1".parse().unwrap();
        let dst = "fe80::2".parse().unwrap();
        let v6_frame = ipv6_udp_frame(src, dst, 1, 5000, b"x");

        let v4_only = compile(true, false, &PortRanges::default()).unwrap();
        assert!(accepts(&v4_only, &v4_frame));
        assert!(!accepts(&v4_only, &v6_frame));

        let v6_only = compile(false, true, &PortRanges::default()).unwrap();
        assert!(!accepts(&v6_only, &v4_frame));
        assert!(accepts(&v6_only, &v6_frame));
    }

    #[test]
    fn test_filter_drops_short_frames() {
        let prog = compile(false, false, &PortRanges::default()).unwrap();
        assert!(!accepts(&prog, &[0u8; 41]));
    }

    #[test]
    fn test_dump_mentions_every_instruction() {
        let prog = compile(false, false, &ranges(&[(80, 80), (443, 445)])).unwrap();
        let dump = prog.dump();
        assert_eq!(dump.lines().count(), prog.len());
        assert!(dump.contains("ret"));
        assert!(dump.contains("jset"));
    }
}
