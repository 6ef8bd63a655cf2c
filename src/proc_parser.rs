use std::fs;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::path::Path;

use crate::conn::Protocol;

/// One socket row of /proc/net/{tcp,udp}[6].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetEntry {
    pub local_addr: IpAddr,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
    pub inode: u64,
}

/// Reads the socket tables for `protocol` below `proc_root` (normally "/proc").
pub fn read_net_entries(proc_root: &Path, protocol: Protocol) -> Vec<NetEntry> {
    let files: [&str; 2] = match protocol {
        Protocol::Tcp => ["net/tcp", "net/tcp6"],
        Protocol::Udp => ["net/udp", "net/udp6"],
    };

    files
        .iter()
        .filter_map(|name| fs::read_to_string(proc_root.join(name)).ok())
        .flat_map(|content| parse_net_table(&content))
        .collect()
}

/// Parses a whole table, header line included.
pub fn parse_net_table(content: &str) -> Vec<NetEntry> {
    content.lines().skip(1).filter_map(parse_net_line).collect()
}

fn parse_net_line(line: &str) -> Option<NetEntry> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    if parts.len() < 10 {
        return None;
    }

    let (local_addr, local_port) = parse_hex_address(parts[1])?;
    let (remote_addr, remote_port) = parse_hex_address(parts[2])?;
    let inode = parts[9].parse::<u64>().ok()?;

    Some(NetEntry {
        local_addr,
        local_port,
        remote_addr,
        remote_port,
        inode,
    })
}

fn parse_hex_address(s: &str) -> Option<(IpAddr, u16)> {
    let (hex_addr, hex_port) = s.split_once(':')?;
    let port = u16::from_str_radix(hex_port, 16).ok()?;

    match hex_addr.len() {
        // IPv4: one little-endian word
        8 => {
            let word = u32::from_str_radix(hex_addr, 16).ok()?;
            Some((IpAddr::V4(Ipv4Addr::from(word.swap_bytes())), port))
        }
        // IPv6: four little-endian words
        32 => {
            let mut octets = [0u8; 16];
            for i in 0..4 {
                let word = u32::from_str_radix(&hex_addr[i * 8..(i + 1) * 8], 16).ok()?;
                octets[i * 4..(i + 1) * 4].copy_from_slice(&word.swap_bytes().to_be_bytes());
            }
            Some((IpAddr::V6(Ipv6Addr::from(octets)), port))
        }
        _ => None,
    }
}

/// Inode of a `/proc/<pid>/fd/<n>` link target such as `socket:[12345]`.
pub fn socket_inode(link: &str) -> Option<u64> {
    link.strip_prefix("socket:[")?
        .strip_suffix(']')?
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TCP_TABLE: &str = "\
  sl  local_address rem_address   st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 0100007F:0277 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 19042 1 0000000000000000 100 0 0 10 0
   1: 0200000A:C738 22D8B85D:01BB 02 00000001:00000000 01:00000200 00000000  1000        0 88123 2 0000000000000000 200 0 0 10 -1
";

    const TCP6_TABLE: &str = "\
  sl  local_address                         remote_address                        st tx_queue rx_queue tr tm->when retrnsmt   uid  timeout inode
   0: 00000000000000000000000001000000:0277 00000000000000000000000000000000:0000 0A 00000000:00000000 00:00000000 00000000     0        0 19043 1 0000000000000000 100 0 0 10 0
";

    #[test]
    fn parses_ipv4_rows() {
        let entries = parse_net_table(TCP_TABLE);
        assert_eq!(entries.len(), 2);

        assert_eq!(entries[0].local_addr, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(entries[0].local_port, 631);
        assert_eq!(entries[0].inode, 19042);

        assert_eq!(entries[1].local_addr, IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(entries[1].local_port, 51000);
        assert_eq!(entries[1].remote_addr, IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34)));
        assert_eq!(entries[1].remote_port, 443);
        assert_eq!(entries[1].inode, 88123);
    }

    #[test]
    fn parses_ipv6_loopback() {
        let entries = parse_net_table(TCP6_TABLE);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].local_addr, IpAddr::V6(Ipv6Addr::LOCALHOST));
        assert_eq!(entries[0].remote_addr, IpAddr::V6(Ipv6Addr::UNSPECIFIED));
    }

    #[test]
    fn skips_short_lines() {
        assert!(parse_net_table("header\n   0: 0100007F:0277\n").is_empty());
    }

    #[test]
    fn socket_links() {
        assert_eq!(socket_inode("socket:[88123]"), Some(88123));
        assert_eq!(socket_inode("pipe:[1]"), None);
        assert_eq!(socket_inode("/dev/null"), None);
    }
}
