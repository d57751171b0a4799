pub mod chat;
pub mod frame;
pub mod varint;

use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use serde::Serialize;
use std::net::IpAddr;

/// Link-layer type of the capture, determines how to parse raw packet bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LinkType {
    Ethernet,
    LinuxSll,
    LinuxSll2,
    RawIp,
}

impl LinkType {
    /// Map a pcap DLT value to a link type we can decode.
    pub fn from_dlt(dlt: i32) -> Option<Self> {
        match dlt {
            1 => Some(LinkType::Ethernet),     // DLT_EN10MB
            12 | 101 => Some(LinkType::RawIp), // DLT_RAW
            113 => Some(LinkType::LinuxSll),   // DLT_LINUX_SLL
            276 => Some(LinkType::LinuxSll2),  // DLT_LINUX_SLL2
            _ => None,
        }
    }

    /// Return the pcap link-layer header type value (DLT_*).
    pub fn pcap_link_type(self) -> u32 {
        match self {
            LinkType::Ethernet => 1,
            LinkType::RawIp => 101,
            LinkType::LinuxSll => 113,
            LinkType::LinuxSll2 => 276,
        }
    }
}

/// A decoded TCP segment with the header fields reassembly needs.
#[derive(Debug, Clone)]
pub struct ParsedPacket {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub flags: TcpFlags,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
    pub psh: bool,
}

impl ParsedPacket {
    pub fn session_key(&self) -> SessionKey {
        SessionKey::new(self.src_ip, self.src_port, self.dst_ip, self.dst_port)
    }

    /// True if either endpoint uses one of `ports`.
    pub fn touches_port(&self, ports: &[u16]) -> bool {
        ports.contains(&self.src_port) || ports.contains(&self.dst_port)
    }
}

/// Directional TCP flow identifier. Each direction of a connection is its
/// own session since the two byte streams are framed independently.
#[derive(Debug, Clone, Copy, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct SessionKey {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl SessionKey {
    pub fn new(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16) -> Self {
        // Normalize IPv6-mapped-IPv4 (::ffff:x.x.x.x) to plain IPv4 so that
        // dual-stack captures map to the same session.
        SessionKey {
            src_ip: normalize_ip(src_ip),
            src_port,
            dst_ip: normalize_ip(dst_ip),
            dst_port,
        }
    }

    pub fn reversed(&self) -> Self {
        SessionKey {
            src_ip: self.dst_ip,
            src_port: self.dst_port,
            dst_ip: self.src_ip,
            dst_port: self.src_port,
        }
    }
}

fn normalize_ip(ip: IpAddr) -> IpAddr {
    match ip {
        IpAddr::V6(v6) => match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => ip,
        },
        other => other,
    }
}

impl std::fmt::Display for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}:{} -> {}:{}",
            self.src_ip, self.src_port, self.dst_ip, self.dst_port
        )
    }
}

/// Parse raw packet bytes into a ParsedPacket. Returns `None` for anything
/// that is not a well-formed TCP segment.
pub fn parse_packet(data: &[u8], link_type: LinkType) -> Option<ParsedPacket> {
    let sliced = match link_type {
        LinkType::Ethernet => SlicedPacket::from_ethernet(data).ok()?,
        LinkType::RawIp => SlicedPacket::from_ip(data).ok()?,
        LinkType::LinuxSll => {
            // Linux cooked capture v1: 16-byte header, then IP packet
            SlicedPacket::from_ip(data.get(16..)?).ok()?
        }
        LinkType::LinuxSll2 => {
            // Linux cooked capture v2: 20-byte header, then IP packet
            SlicedPacket::from_ip(data.get(20..)?).ok()?
        }
    };

    let (src_ip, dst_ip) = match &sliced.net {
        Some(NetSlice::Ipv4(ipv4)) => (
            IpAddr::V4(ipv4.header().source_addr()),
            IpAddr::V4(ipv4.header().destination_addr()),
        ),
        Some(NetSlice::Ipv6(ipv6)) => (
            IpAddr::V6(ipv6.header().source_addr()),
            IpAddr::V6(ipv6.header().destination_addr()),
        ),
        _ => return None,
    };

    match &sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => Some(ParsedPacket {
            src_ip,
            dst_ip,
            src_port: tcp.source_port(),
            dst_port: tcp.destination_port(),
            seq: tcp.sequence_number(),
            flags: TcpFlags {
                syn: tcp.syn(),
                ack: tcp.ack(),
                fin: tcp.fin(),
                rst: tcp.rst(),
                psh: tcp.psh(),
            },
            payload: tcp.payload().to_vec(),
        }),
        _ => None,
    }
}
