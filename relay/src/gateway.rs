//! Default-gateway discovery.
//!
//! Sandboxes publish their shell port on the host that runs the relay's
//! container, which from inside that container is the default gateway.

use std::net::Ipv4Addr;

const PROC_NET_ROUTE: &str = "/proc/net/route";
const RTF_GATEWAY: u32 = 0x2;

/// Read the default gateway of this network namespace, if there is one.
pub fn default_gateway() -> Option<Ipv4Addr> {
    let table = std::fs::read_to_string(PROC_NET_ROUTE).ok()?;
    parse_default_gateway(&table)
}

/// Parse the kernel routing table format:
///
/// ```text
/// Iface  Destination  Gateway   Flags  RefCnt  Use  Metric  Mask ...
/// eth0   00000000     010011AC  0003   0       0    0       00000000 ...
/// ```
///
/// Addresses are little-endian hex.
pub fn parse_default_gateway(table: &str) -> Option<Ipv4Addr> {
    table.lines().skip(1).find_map(|line| {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 4 {
            return None;
        }
        let destination = u32::from_str_radix(fields[1], 16).ok()?;
        let gateway = u32::from_str_radix(fields[2], 16).ok()?;
        let flags = u32::from_str_radix(fields[3], 16).ok()?;
        if destination != 0 || flags & RTF_GATEWAY == 0 || gateway == 0 {
            return None;
        }
        Some(Ipv4Addr::from(gateway.to_le_bytes()))
    })
}
