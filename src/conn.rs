//! Network identity of an intercepted packet and the connection it resolves to.

use etherparse::{Ipv4HeaderSlice, Ipv6HeaderSlice, TcpHeaderSlice, UdpHeaderSlice};
use std::fmt;
use std::net::IpAddr;

use crate::process::Process;

const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Addresses and ports of one packet, as seen on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FiveTuple {
    pub protocol: Protocol,
    pub src: IpAddr,
    pub src_port: u16,
    pub dst: IpAddr,
    pub dst_port: u16,
}

/// A parsed packet plus the offset of its transport payload.
#[derive(Debug, Clone, Copy)]
pub struct ParsedPacket {
    pub tuple: FiveTuple,
    pub payload_offset: usize,
}

impl FiveTuple {
    /// Parses an IPv4 or IPv6 datagram carrying TCP or UDP.
    ///
    /// IPv6 extension headers are not walked; such packets return `None`.
    pub fn parse(packet: &[u8]) -> Option<ParsedPacket> {
        let version = packet.first()? >> 4;
        let (src, dst, proto, ip_len) = match version {
            4 => {
                let ip = Ipv4HeaderSlice::from_slice(packet).ok()?;
                (
                    IpAddr::V4(ip.source_addr()),
                    IpAddr::V4(ip.destination_addr()),
                    ip.protocol(),
                    ip.slice().len(),
                )
            }
            6 => {
                let ip = Ipv6HeaderSlice::from_slice(packet).ok()?;
                (
                    IpAddr::V6(ip.source_addr()),
                    IpAddr::V6(ip.destination_addr()),
                    ip.next_header(),
                    ip.slice().len(),
                )
            }
            _ => return None,
        };

        let transport = packet.get(ip_len..)?;
        let (protocol, src_port, dst_port, header_len) = match proto {
            IPPROTO_TCP => {
                let tcp = TcpHeaderSlice::from_slice(transport).ok()?;
                (
                    Protocol::Tcp,
                    tcp.source_port(),
                    tcp.destination_port(),
                    tcp.slice().len(),
                )
            }
            IPPROTO_UDP => {
                let udp = UdpHeaderSlice::from_slice(transport).ok()?;
                (
                    Protocol::Udp,
                    udp.source_port(),
                    udp.destination_port(),
                    udp.slice().len(),
                )
            }
            _ => return None,
        };

        Some(ParsedPacket {
            tuple: FiveTuple {
                protocol,
                src,
                src_port,
                dst,
                dst_port,
            },
            payload_offset: ip_len + header_len,
        })
    }
}

impl fmt::Display for FiveTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}:{} -> {}:{}",
            self.protocol, self.src, self.src_port, self.dst, self.dst_port
        )
    }
}

/// A packet attributed to the process that owns its socket.
#[derive(Debug, Clone)]
pub struct Connection {
    pub tuple: FiveTuple,
    pub process: Process,
    /// Domain last resolved to the destination address, if any.
    pub host: Option<String>,
}

impl Connection {
    pub fn dst_port(&self) -> u16 {
        self.tuple.dst_port
    }

    /// Destination as the user knows it: the tracked domain when there is
    /// one, the address otherwise.
    pub fn to(&self) -> String {
        match &self.host {
            Some(host) => host.clone(),
            None => self.tuple.dst.to_string(),
        }
    }
}

impl fmt::Display for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({}) -> {}:{} ({})",
            self.process.path,
            self.process.pid,
            self.to(),
            self.tuple.dst_port,
            self.tuple.protocol
        )
    }
}
