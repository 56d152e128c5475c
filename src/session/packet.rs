//! IPv4/TCP/UDP packet parsing and synthesis for the session manager.
//!
//! Hand-rolled rather than built on a full userspace TCP/IP stack: the
//! session manager only ever needs to parse one incoming segment at a time
//! and synthesize a handful of reply shapes (SYN|ACK, data segments,
//! FIN|ACK, RST, UDP datagrams), so a general-purpose stack's socket/
//! interface machinery would be pure overhead here.

use super::checksum;
use std::net::Ipv4Addr;
use thiserror::Error;

pub const IPV4_HEADER_LEN: usize = 20;
pub const TCP_MIN_HEADER_LEN: usize = 20;
pub const UDP_HEADER_LEN: usize = 8;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PacketError {
    #[error("packet is empty")]
    Empty,
    #[error("unsupported IP version {0}")]
    UnsupportedVersion(u8),
    #[error("malformed IPv4 header")]
    MalformedIpv4,
    #[error("malformed TCP segment")]
    MalformedTcp,
    #[error("malformed UDP datagram")]
    MalformedUdp,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TcpFlags {
    pub syn: bool,
    pub ack: bool,
    pub fin: bool,
    pub rst: bool,
}

impl TcpFlags {
    pub fn to_byte(self) -> u8 {
        (self.fin as u8) | ((self.syn as u8) << 1) | ((self.rst as u8) << 2) | ((self.ack as u8) << 4)
    }

    fn from_byte(byte: u8) -> Self {
        Self {
            fin: byte & 0x01 != 0,
            syn: byte & 0x02 != 0,
            rst: byte & 0x04 != 0,
            ack: byte & 0x10 != 0,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TcpSegment<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: TcpFlags,
    pub window: u16,
    pub mss: Option<u16>,
    pub window_scale: Option<u8>,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone)]
pub struct UdpDatagram<'a> {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

#[derive(Debug, Clone)]
pub enum ParsedIpv4<'a> {
    Tcp(TcpSegment<'a>),
    Udp(UdpDatagram<'a>),
    Icmp,
    Other(u8),
}

/// Returns the first nibble of the packet (the IP version), or `None` if empty.
pub fn ip_version(packet: &[u8]) -> Option<u8> {
    packet.first().map(|byte| byte >> 4)
}

pub fn parse_ipv4(packet: &[u8]) -> Result<ParsedIpv4<'_>, PacketError> {
    if packet.is_empty() {
        return Err(PacketError::Empty);
    }
    if packet.len() < IPV4_HEADER_LEN {
        return Err(PacketError::MalformedIpv4);
    }
    let version = packet[0] >> 4;
    if version != 4 {
        return Err(PacketError::UnsupportedVersion(version));
    }
    let header_len = usize::from(packet[0] & 0x0F) * 4;
    if header_len < IPV4_HEADER_LEN || header_len > packet.len() {
        return Err(PacketError::MalformedIpv4);
    }
    let total_len = u16::from_be_bytes([packet[2], packet[3]]) as usize;
    if total_len < header_len || total_len > packet.len() {
        return Err(PacketError::MalformedIpv4);
    }
    let protocol = packet[9];
    let src = Ipv4Addr::new(packet[12], packet[13], packet[14], packet[15]);
    let dst = Ipv4Addr::new(packet[16], packet[17], packet[18], packet[19]);
    let payload = &packet[header_len..total_len];
    match protocol {
        6 => parse_tcp(src, dst, payload).map(ParsedIpv4::Tcp),
        17 => parse_udp(src, dst, payload).map(ParsedIpv4::Udp),
        1 => Ok(ParsedIpv4::Icmp),
        other => Ok(ParsedIpv4::Other(other)),
    }
}

fn parse_tcp(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> Result<TcpSegment<'_>, PacketError> {
    if segment.len() < TCP_MIN_HEADER_LEN {
        return Err(PacketError::MalformedTcp);
    }
    let data_offset = usize::from(segment[12] >> 4) * 4;
    if data_offset < TCP_MIN_HEADER_LEN || data_offset > segment.len() {
        return Err(PacketError::MalformedTcp);
    }
    let (mss, window_scale) = parse_tcp_options(&segment[TCP_MIN_HEADER_LEN..data_offset]);
    Ok(TcpSegment {
        src,
        dst,
        src_port: u16::from_be_bytes([segment[0], segment[1]]),
        dst_port: u16::from_be_bytes([segment[2], segment[3]]),
        seq: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
        ack: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
        flags: TcpFlags::from_byte(segment[13]),
        window: u16::from_be_bytes([segment[14], segment[15]]),
        mss,
        window_scale,
        payload: &segment[data_offset..],
    })
}

/// Walks TLV-encoded TCP options looking for MSS (kind 2) and window scale
/// (kind 3). Unknown kinds are skipped by their declared length; kind 0
/// (end-of-options) and kind 1 (no-op) are single bytes.
fn parse_tcp_options(options: &[u8]) -> (Option<u16>, Option<u8>) {
    let mut mss = None;
    let mut window_scale = None;
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            0 => break,
            1 => i += 1,
            kind => {
                if i + 1 >= options.len() {
                    break;
                }
                let len = options[i + 1] as usize;
                if len < 2 || i + len > options.len() {
                    break;
                }
                match kind {
                    2 if len == 4 => mss = Some(u16::from_be_bytes([options[i + 2], options[i + 3]])),
                    3 if len == 3 => window_scale = Some(options[i + 2]),
                    _ => {}
                }
                i += len;
            }
        }
    }
    (mss, window_scale)
}

fn parse_udp(src: Ipv4Addr, dst: Ipv4Addr, datagram: &[u8]) -> Result<UdpDatagram<'_>, PacketError> {
    if datagram.len() < UDP_HEADER_LEN {
        return Err(PacketError::MalformedUdp);
    }
    let length = u16::from_be_bytes([datagram[4], datagram[5]]) as usize;
    if length < UDP_HEADER_LEN || length > datagram.len() {
        return Err(PacketError::MalformedUdp);
    }
    Ok(UdpDatagram {
        src,
        dst,
        src_port: u16::from_be_bytes([datagram[0], datagram[1]]),
        dst_port: u16::from_be_bytes([datagram[2], datagram[3]]),
        payload: &datagram[UDP_HEADER_LEN..length],
    })
}

fn ipv4_header(total_len: u16, protocol: u8, src: Ipv4Addr, dst: Ipv4Addr) -> [u8; IPV4_HEADER_LEN] {
    let mut header = [0u8; IPV4_HEADER_LEN];
    header[0] = 0x45; // version 4, IHL 5
    header[2..4].copy_from_slice(&total_len.to_be_bytes());
    header[6] = 0x40; // don't fragment
    header[8] = 64; // TTL
    header[9] = protocol;
    header[12..16].copy_from_slice(&src.octets());
    header[16..20].copy_from_slice(&dst.octets());
    let checksum = checksum::ipv4_header(&header);
    header[10..12].copy_from_slice(&checksum.to_be_bytes());
    header
}

/// Builds a full IPv4 packet carrying one TCP segment with no options.
#[allow(clippy::too_many_arguments)]
pub fn build_tcp_packet(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    src_port: u16,
    dst_port: u16,
    seq: u32,
    ack: u32,
    flags: TcpFlags,
    window: u16,
    payload: &[u8],
) -> Vec<u8> {
    let tcp_len = TCP_MIN_HEADER_LEN + payload.len();
    let mut tcp = vec![0u8; tcp_len];
    tcp[0..2].copy_from_slice(&src_port.to_be_bytes());
    tcp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    tcp[4..8].copy_from_slice(&seq.to_be_bytes());
    tcp[8..12].copy_from_slice(&ack.to_be_bytes());
    tcp[12] = 5 << 4; // data offset = 5 words, no options
    tcp[13] = flags.to_byte();
    tcp[14..16].copy_from_slice(&window.to_be_bytes());
    tcp[18..20].copy_from_slice(&[0, 0]); // urgent pointer
    tcp[TCP_MIN_HEADER_LEN..].copy_from_slice(payload);

    let cksum = checksum::tcp_ipv4(src, dst, &tcp);
    tcp[16..18].copy_from_slice(&cksum.to_be_bytes());

    let total_len = IPV4_HEADER_LEN + tcp_len;
    let mut packet = Vec::with_capacity(total_len);
    packet.extend_from_slice(&ipv4_header(total_len as u16, 6, src, dst));
    packet.extend_from_slice(&tcp);
    packet
}

pub fn build_rst(seg: &TcpSegment<'_>, seq: u32, ack: u32) -> Vec<u8> {
    build_tcp_packet(
        seg.dst,
        seg.src,
        seg.dst_port,
        seg.src_port,
        seq,
        ack,
        TcpFlags {
            rst: true,
            ack: true,
            ..Default::default()
        },
        0,
        &[],
    )
}

/// Builds a full IPv4 packet carrying one UDP datagram.
pub fn build_udp_packet(src: Ipv4Addr, dst: Ipv4Addr, src_port: u16, dst_port: u16, payload: &[u8]) -> Vec<u8> {
    let udp_len = UDP_HEADER_LEN + payload.len();
    let mut udp = vec![0u8; udp_len];
    udp[0..2].copy_from_slice(&src_port.to_be_bytes());
    udp[2..4].copy_from_slice(&dst_port.to_be_bytes());
    udp[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
    udp[UDP_HEADER_LEN..].copy_from_slice(payload);

    let cksum = checksum::udp_ipv4(src, dst, &udp);
    // UDP checksum of zero is transmitted as all-ones.
    let cksum = if cksum == 0 { 0xFFFF } else { cksum };
    udp[6..8].copy_from_slice(&cksum.to_be_bytes());

    let total_len = IPV4_HEADER_LEN + udp_len;
    let mut packet = Vec::with_capacity(total_len);
    packet.extend_from_slice(&ipv4_header(total_len as u16, 17, src, dst));
    packet.extend_from_slice(&udp);
    packet
}
