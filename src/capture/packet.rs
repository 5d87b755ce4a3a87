//! Link-layer, IP and transport header decoding.
//!
//! Only the fields the aggregator needs are extracted: addresses, transport
//! layer and ports. Payloads are never inspected.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use crate::core::TransportLayer;

/// Framing of captured bytes, as recorded in pcap headers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkType {
    /// BSD loopback: 4-byte address family in host byte order.
    Null,
    Ethernet,
    /// Bare IPv4/IPv6 packets.
    RawIp,
    /// OpenBSD loopback: 4-byte address family in network byte order.
    Loop,
    /// Linux "cooked" capture (SLL).
    LinuxSll,
}

impl LinkType {
    /// Map a pcap `LINKTYPE_*` value.
    pub fn from_pcap(linktype: u32) -> Option<Self> {
        match linktype {
            0 => Some(LinkType::Null),
            1 => Some(LinkType::Ethernet),
            101 | 12 | 14 => Some(LinkType::RawIp),
            108 => Some(LinkType::Loop),
            113 => Some(LinkType::LinuxSll),
            _ => None,
        }
    }
}

/// One frame as delivered by a packet source.
#[derive(Debug, Clone)]
pub struct RawPacket {
    /// Capture time, Unix seconds.
    pub timestamp: f64,
    pub link: LinkType,
    pub data: Vec<u8>,
    /// Length of the frame on the wire; may exceed `data.len()` when truncated.
    pub wire_len: u32,
}

/// Addressing and transport information of a decoded packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PacketHeaders {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub layer: TransportLayer,
    pub src_port: Option<u16>,
    pub dst_port: Option<u16>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PacketError {
    #[error("{layer} header truncated: need {needed} bytes, have {got}")]
    Truncated {
        layer: &'static str,
        needed: usize,
        got: usize,
    },
    #[error("not an IP packet (ethertype/family {0:#06x})")]
    NotIp(u32),
    #[error("unsupported IP version {0}")]
    IpVersion(u8),
}

const ETHERTYPE_IPV4: u16 = 0x0800;
const ETHERTYPE_IPV6: u16 = 0x86DD;
const ETHERTYPE_VLAN: u16 = 0x8100;
const ETHERTYPE_QINQ: u16 = 0x88A8;

const IPPROTO_ICMP: u8 = 1;
const IPPROTO_TCP: u8 = 6;
const IPPROTO_UDP: u8 = 17;
const IPPROTO_ICMPV6: u8 = 58;

/// Decode a captured frame down to its transport ports.
pub fn decode(link: LinkType, data: &[u8]) -> Result<PacketHeaders, PacketError> {
    let ip = match link {
        LinkType::Ethernet => strip_ethernet(data)?,
        LinkType::LinuxSll => {
            need("SLL", data, 16)?;
            let proto = u16::from_be_bytes([data[14], data[15]]);
            match proto {
                ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => &data[16..],
                other => return Err(PacketError::NotIp(u32::from(other))),
            }
        }
        LinkType::Null | LinkType::Loop => {
            need("loopback", data, 4)?;
            let raw = [data[0], data[1], data[2], data[3]];
            // Family is host-endian for DLT_NULL; accept either order.
            let family = u32::from_le_bytes(raw).min(u32::from_be_bytes(raw));
            match family {
                2 | 24 | 28 | 30 => &data[4..],
                other => return Err(PacketError::NotIp(other)),
            }
        }
        LinkType::RawIp => data,
    };
    parse_ip_packet(ip)
}

fn strip_ethernet(data: &[u8]) -> Result<&[u8], PacketError> {
    need("ethernet", data, 14)?;
    let mut offset = 12;
    let mut ethertype = u16::from_be_bytes([data[offset], data[offset + 1]]);
    while ethertype == ETHERTYPE_VLAN || ethertype == ETHERTYPE_QINQ {
        offset += 4;
        need("vlan", data, offset + 2)?;
        ethertype = u16::from_be_bytes([data[offset], data[offset + 1]]);
    }
    match ethertype {
        ETHERTYPE_IPV4 | ETHERTYPE_IPV6 => Ok(&data[offset + 2..]),
        other => Err(PacketError::NotIp(u32::from(other))),
    }
}

/// Parse an IPv4 or IPv6 packet and its transport ports.
pub fn parse_ip_packet(data: &[u8]) -> Result<PacketHeaders, PacketError> {
    need("IP", data, 1)?;
    match data[0] >> 4 {
        4 => parse_ipv4(data),
        6 => parse_ipv6(data),
        v => Err(PacketError::IpVersion(v)),
    }
}

fn parse_ipv4(data: &[u8]) -> Result<PacketHeaders, PacketError> {
    need("IPv4", data, 20)?;
    let ihl = usize::from(data[0] & 0x0F) * 4;
    need("IPv4 options", data, ihl.max(20))?;

    let src = Ipv4Addr::new(data[12], data[13], data[14], data[15]);
    let dst = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
    let fragment_offset = u16::from_be_bytes([data[6], data[7]]) & 0x1FFF;

    let (layer, src_port, dst_port) = if fragment_offset == 0 {
        transport(data[9], &data[ihl.max(20)..])
    } else {
        // Non-first fragments carry no transport header.
        (layer_for(data[9]), None, None)
    };

    Ok(PacketHeaders {
        src: IpAddr::V4(src),
        dst: IpAddr::V4(dst),
        layer,
        src_port,
        dst_port,
    })
}

fn parse_ipv6(data: &[u8]) -> Result<PacketHeaders, PacketError> {
    need("IPv6", data, 40)?;
    let addr = |at: usize| {
        let mut octets = [0u8; 16];
        octets.copy_from_slice(&data[at..at + 16]);
        Ipv6Addr::from(octets)
    };
    let src = addr(8);
    let dst = addr(24);

    let mut next = data[6];
    let mut offset = 40;
    loop {
        match next {
            // Hop-by-hop, routing, destination options.
            0 | 43 | 60 => {
                need("IPv6 extension", data, offset + 2)?;
                next = data[offset];
                offset += (usize::from(data[offset + 1]) + 1) * 8;
            }
            // Fragment header has a fixed size.
            44 => {
                need("IPv6 fragment", data, offset + 8)?;
                next = data[offset];
                offset += 8;
            }
            _ => break,
        }
    }

    let rest = data.get(offset..).unwrap_or(&[]);
    let (layer, src_port, dst_port) = transport(next, rest);
    Ok(PacketHeaders {
        src: IpAddr::V6(src),
        dst: IpAddr::V6(dst),
        layer,
        src_port,
        dst_port,
    })
}

fn layer_for(protocol: u8) -> TransportLayer {
    match protocol {
        IPPROTO_TCP => TransportLayer::Tcp,
        IPPROTO_UDP => TransportLayer::Udp,
        IPPROTO_ICMP | IPPROTO_ICMPV6 => TransportLayer::Icmp,
        _ => TransportLayer::Other,
    }
}

/// Transport layer and, for TCP/UDP with at least 4 header bytes, the ports.
fn transport(protocol: u8, payload: &[u8]) -> (TransportLayer, Option<u16>, Option<u16>) {
    let layer = layer_for(protocol);
    match layer {
        TransportLayer::Tcp | TransportLayer::Udp if payload.len() >= 4 => (
            layer,
            Some(u16::from_be_bytes([payload[0], payload[1]])),
            Some(u16::from_be_bytes([payload[2], payload[3]])),
        ),
        _ => (layer, None, None),
    }
}

fn need(layer: &'static str, data: &[u8], needed: usize) -> Result<(), PacketError> {
    if data.len() < needed {
        return Err(PacketError::Truncated {
            layer,
            needed,
            got: data.len(),
        });
    }
    Ok(())
}
