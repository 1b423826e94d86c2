//! CLI specification parsing and validation.
//!
//! Each `--rx`/`--tx`/`--dest` argument is a comma-separated spec parsed
//! into a typed record at argument-parse time, so by the time `main` runs
//! every interface has resolved to a nonzero ifindex and every address,
//! MAC, size and port has been range-checked.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use anyhow::bail;

use crate::distributor::{MAX_WORKERS, MIN_WORKERS};
use crate::forward::MAX_INTERFACES;
use crate::ring::{DEFAULT_RING_SIZE, MAX_RING_SIZE, MIN_RING_SIZE};

// ---------------------------------------------------------------------------
// Typed Records
// ---------------------------------------------------------------------------

/// `--rx <iface>[,<ring-size>]`
#[derive(Debug, Clone)]
pub struct RxSpec {
    pub name: String,
    pub ifindex: u32,
    pub ring_size: usize,
}

/// `--tx <iface>,<mac>,<ipv4>,<ipv6>[,<ring-size>]`
#[derive(Debug, Clone)]
pub struct TxSpec {
    pub name: String,
    pub ifindex: u32,
    pub mac: [u8; 6],
    pub addr4: Ipv4Addr,
    pub addr6: Ipv6Addr,
    pub ring_size: usize,
}

/// `--dest <iface>,<mac>,<ip>,<port>`
#[derive(Debug, Clone)]
pub struct DestSpec {
    pub name: String,
    pub ifindex: u32,
    pub mac: [u8; 6],
    pub addr: IpAddr,
    pub port: u16,
}

/// One `--ports` argument: closed ranges, not yet canonicalized.
#[derive(Debug, Clone)]
pub struct PortList(pub Vec<(u16, u16)>);

// ---------------------------------------------------------------------------
// Spec Parsers (clap value parsers)
// ---------------------------------------------------------------------------

pub fn parse_rx_spec(s: &str) -> Result<RxSpec, String> {
    let (name, ring_size) = match s.split_once(',') {
        Some((name, size)) => (name, parse_size(size)?),
        None => (s, DEFAULT_RING_SIZE),
    };
    Ok(RxSpec {
        name: name.to_string(),
        ifindex: interface_index(name)?,
        ring_size,
    })
}

pub fn parse_tx_spec(s: &str) -> Result<TxSpec, String> {
    let parts: Vec<&str> = s.split(',').collect();
    if !(4..=5).contains(&parts.len()) {
        return Err(format!(
            "expected <iface>,<mac>,<ipv4>,<ipv6>[,<ring-size>], got '{s}'"
        ));
    }

    let ring_size = if parts.len() == 5 {
        parse_size(parts[4])?
    } else {
        DEFAULT_RING_SIZE
    };

    Ok(TxSpec {
        name: parts[0].to_string(),
        ifindex: interface_index(parts[0])?,
        mac: parse_mac(parts[1])?,
        addr4: parts[2]
            .parse()
            .map_err(|_| format!("invalid IPv4 address '{}'", parts[2]))?,
        addr6: parts[3]
            .parse()
            .map_err(|_| format!("invalid IPv6 address '{}'", parts[3]))?,
        ring_size,
    })
}

pub fn parse_dest_spec(s: &str) -> Result<DestSpec, String> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 4 {
        return Err(format!("expected <iface>,<mac>,<ip>,<port>, got '{s}'"));
    }

    let port: u16 = parts[3]
        .parse()
        .map_err(|_| format!("invalid port '{}'", parts[3]))?;
    if port == 0 {
        return Err("port must be 1..=65535".to_string());
    }

    Ok(DestSpec {
        name: parts[0].to_string(),
        ifindex: interface_index(parts[0])?,
        mac: parse_mac(parts[1])?,
        addr: parts[2]
            .parse()
            .map_err(|_| format!("invalid IP address '{}'", parts[2]))?,
        port,
    })
}

/// Parse `<port>[-<port>][,<port>[-<port>]]*`.
pub fn parse_port_list(s: &str) -> Result<PortList, String> {
    let mut ranges = Vec::new();
    for def in s.split(',') {
        let (from, to) = match def.split_once('-') {
            Some((from, to)) => (parse_port(from)?, parse_port(to)?),
            None => {
                let p = parse_port(def)?;
                (p, p)
            }
        };
        if from > to {
            return Err(format!("invalid port range '{def}'"));
        }
        ranges.push((from, to));
    }
    if ranges.is_empty() {
        return Err("empty port list".to_string());
    }
    Ok(PortList(ranges))
}

fn parse_port(s: &str) -> Result<u16, String> {
    match s.parse::<u16>() {
        Ok(p) if p >= 1 => Ok(p),
        _ => Err(format!("invalid port '{s}' (expected 1..=65535)")),
    }
}

/// Parse a byte size with an optional binary `K`/`M`/`G` suffix and check it
/// against the ring bounds.
pub fn parse_size(s: &str) -> Result<usize, String> {
    let (digits, shift) = match s.as_bytes().last() {
        Some(&b'K') => (&s[..s.len() - 1], 10u32),
        Some(&b'M') => (&s[..s.len() - 1], 20),
        Some(&b'G') => (&s[..s.len() - 1], 30),
        _ => (s, 0),
    };

    let value: u64 = digits
        .parse()
        .map_err(|_| format!("invalid size '{s}'"))?;
    let bytes = value
        .checked_shl(shift)
        .filter(|b| shift == 0 || b >> shift == value)
        .ok_or_else(|| format!("size '{s}' overflows"))?;

    if !(MIN_RING_SIZE as u64..=MAX_RING_SIZE as u64).contains(&bytes) {
        return Err(format!(
            "size '{s}' outside {MIN_RING_SIZE}..={MAX_RING_SIZE} bytes"
        ));
    }
    Ok(bytes as usize)
}

/// Parse `HH:HH:HH:HH:HH:HH`.
pub fn parse_mac(s: &str) -> Result<[u8; 6], String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() != 6 {
        return Err(format!("MAC address must have 6 octets, got '{s}'"));
    }
    let mut mac = [0u8; 6];
    for (i, part) in parts.iter().enumerate() {
        mac[i] = u8::from_str_radix(part, 16)
            .map_err(|_| format!("invalid MAC octet '{part}' in '{s}'"))?;
    }
    Ok(mac)
}

fn interface_index(name: &str) -> Result<u32, String> {
    if name.is_empty() {
        return Err("empty interface name".to_string());
    }
    nix::net::if_::if_nametoindex(name)
        .map_err(|_| format!("interface '{name}' not found"))
}

// ---------------------------------------------------------------------------
// Cross-Validation
// ---------------------------------------------------------------------------

/// Consistency checks across the parsed argument set.
pub fn validate(
    _rx: &RxSpec,
    tx: &[TxSpec],
    dests: &[DestSpec],
    workers: usize,
) -> anyhow::Result<()> {
    if tx.is_empty() {
        bail!("at least one --tx interface is required");
    }
    if tx.len() > MAX_INTERFACES {
        bail!(
            "{} egress interfaces exceeds the maximum of {MAX_INTERFACES}",
            tx.len()
        );
    }
    if dests.is_empty() {
        bail!("at least one --dest is required");
    }
    if !(MIN_WORKERS..=MAX_WORKERS).contains(&workers) {
        bail!("--number-workers must be {MIN_WORKERS}..={MAX_WORKERS}, got {workers}");
    }

    for dest in dests {
        if !tx.iter().any(|t| t.ifindex == dest.ifindex) {
            bail!(
                "destination interface '{}' is not defined in the --tx interface list",
                dest.name
            );
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_mac() {
        let mac = parse_mac("aa:bb:cc:dd:ee:ff").unwrap();
        assert_eq!(mac, [0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        let mac = parse_mac("00:11:22:33:44:55").unwrap();
        assert_eq!(mac, [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);
    }

    #[test]
    fn test_parse_mac_invalid() {
        assert!(parse_mac("aa:bb:cc").is_err());
        assert!(parse_mac("gg:bb:cc:dd:ee:ff").is_err());
        assert!(parse_mac("aabb:cc:dd:ee:ff:00").is_err());
    }

    #[test]
    fn test_parse_size_suffixes() {
        assert_eq!(parse_size("1048576").unwrap(), 1 << 20);
        assert_eq!(parse_size("1024K").unwrap(), 1 << 20);
        assert_eq!(parse_size("256M").unwrap(), 256 << 20);
        assert_eq!(parse_size("1G").unwrap(), 1 << 30);
    }

    #[test]
    fn test_parse_size_bounds() {
        // Exactly at the bounds.
        assert_eq!(parse_size("1M").unwrap(), MIN_RING_SIZE);
        #[cfg(target_pointer_width = "64")]
        assert_eq!(parse_size("16G").unwrap(), MAX_RING_SIZE);

        assert!(parse_size("1023K").is_err());
        assert!(parse_size("17G").is_err());
        assert!(parse_size("0").is_err());
    }

    #[test]
    fn test_parse_size_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("K").is_err());
        assert!(parse_size("12X").is_err());
        assert!(parse_size("12M3").is_err());
        assert!(parse_size("99999999999999999999G").is_err());
    }

    #[test]
    fn test_parse_port_list() {
        let list = parse_port_list("5000").unwrap();
        assert_eq!(list.0, vec![(5000, 5000)]);

        let list = parse_port_list("1000-1002,2000,65535").unwrap();
        assert_eq!(list.0, vec![(1000, 1002), (2000, 2000), (65535, 65535)]);

        let list = parse_port_list("1-65535").unwrap();
        assert_eq!(list.0, vec![(1, 65535)]);
    }

    #[test]
    fn test_parse_port_list_invalid() {
        assert!(parse_port_list("").is_err());
        assert!(parse_port_list("0").is_err());
        assert!(parse_port_list("65536").is_err());
        assert!(parse_port_list("2000-1000").is_err());
        assert!(parse_port_list("5000,").is_err());
        assert!(parse_port_list("a-b").is_err());
    }

    #[test]
    fn test_validate_destination_interface_membership() {
        let rx = RxSpec {
            name: "rx0".into(),
            ifindex: 1,
            ring_size: MIN_RING_SIZE,
        };
        let tx = vec![TxSpec {
            name: "tx0".into(),
            ifindex: 2,
            mac: [0; 6],
            addr4: Ipv4Addr::new(10, 0, 0, 1),
            addr6: Ipv6Addr::LOCALHOST,
            ring_size: MIN_RING_SIZE,
        }];
        let mut dest = vec![DestSpec {
            name: "tx0".into(),
            ifindex: 2,
            mac: [0; 6],
            addr: "10.0.0.2".parse().unwrap(),
            port: 53,
        }];

        validate(&rx, &tx, &dest, 1).unwrap();

        dest[0].ifindex = 7;
        assert!(validate(&rx, &tx, &dest, 1).is_err());
        dest[0].ifindex = 2;

        assert!(validate(&rx, &tx, &[], 1).is_err());
        assert!(validate(&rx, &tx, &dest, 0).is_err());
        assert!(validate(&rx, &tx, &dest, MAX_WORKERS + 1).is_err());
        assert!(validate(&rx, &[], &dest, 1).is_err());
    }
}
