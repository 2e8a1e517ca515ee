use std::net::{Ipv4Addr, Ipv6Addr};

use pnet::packet::ethernet::{EtherTypes, EthernetPacket};
use pnet::packet::icmp::{self, IcmpPacket};
use pnet::packet::ipv4::{self, Ipv4Packet};
use pnet::packet::ipv6::Ipv6Packet;

use crate::packet::{Frame, PacketBuf};

pub const ETH_HDR_LEN: usize = 14;
pub const IPV4_HDR_LEN: usize = 20;
pub const IPV6_HDR_LEN: usize = 40;
pub const UDP_HDR_LEN: usize = 8;
pub const TCP_HDR_LEN: usize = 20;
pub const SCTP_HDR_LEN: usize = 12;
pub const ICMP_HDR_LEN: usize = 8;
pub const FCS_LEN: usize = 4;
/// Largest frame accepted on receive, VLAN tag and FCS included.
pub const MAX_FRAME_LEN: usize = 1522;
pub const MAX_IPV4_OPTIONS: usize = 40;

pub const PROTO_ICMP: u8 = 1;
pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;
pub const PROTO_SCTP: u8 = 132;
pub const IPV6_DEST_OPTIONS: u8 = 60;

pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMP_ECHO_REQUEST: u8 = 8;

const SRC_MAC: [u8; 6] = [0x00, 0x11, 0x22, 0x33, 0x44, 0x55];
const DST_MAC: [u8; 6] = [0x00, 0xaa, 0xbb, 0xcc, 0xdd, 0xee];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowTuple {
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub src_port: u16,
    pub dst_port: u16,
}

/// Offsets of an IPv4 frame that passed the sanity checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv4View {
    pub protocol: u8,
    pub src: Ipv4Addr,
    pub dst: Ipv4Addr,
    pub header_len: usize,
    pub total_len: usize,
    pub l4_offset: usize,
}

impl Ipv4View {
    pub fn options<'a>(&self, frame: &'a [u8]) -> &'a [u8] {
        &frame[ETH_HDR_LEN + IPV4_HDR_LEN..self.l4_offset]
    }

    pub fn l4<'a>(&self, frame: &'a [u8]) -> &'a [u8] {
        &frame[self.l4_offset..ETH_HDR_LEN + self.total_len]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    /// Not IPv4. Not an error for the data path, just not ours.
    NotIpv4,
    NotIpv6,
    Malformed,
}

pub fn parse_ipv4(frame: &[u8]) -> Result<Ipv4View, ParseError> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(ParseError::Malformed);
    }
    let eth = EthernetPacket::new(frame).ok_or(ParseError::Malformed)?;
    if eth.get_ethertype() != EtherTypes::Ipv4 {
        return Err(ParseError::NotIpv4);
    }
    let ip_bytes = &frame[ETH_HDR_LEN..];
    let ip = Ipv4Packet::new(ip_bytes).ok_or(ParseError::Malformed)?;
    let header_len = usize::from(ip.get_header_length()) * 4;
    let total_len = usize::from(ip.get_total_length());
    if ip.get_version() != 4
        || header_len < IPV4_HDR_LEN
        || total_len < header_len
        || total_len > ip_bytes.len()
    {
        return Err(ParseError::Malformed);
    }
    Ok(Ipv4View {
        protocol: ip.get_next_level_protocol().0,
        src: ip.get_source(),
        dst: ip.get_destination(),
        header_len,
        total_len,
        l4_offset: ETH_HDR_LEN + header_len,
    })
}

/// Offsets of an IPv6 frame. Only a destination-options header directly
/// after the fixed header is looked through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ipv6View {
    /// Upper-layer protocol, past any destination options.
    pub protocol: u8,
    pub src: Ipv6Addr,
    pub dst: Ipv6Addr,
    pub payload_len: usize,
    dest_options: Option<(usize, usize)>,
    pub l4_offset: usize,
}

impl Ipv6View {
    /// The whole destination-options header, next-header and length bytes
    /// included.
    pub fn dest_options<'a>(&self, frame: &'a [u8]) -> Option<&'a [u8]> {
        self.dest_options.map(|(start, end)| &frame[start..end])
    }
}

pub fn is_ipv6(frame: &[u8]) -> bool {
    EthernetPacket::new(frame).is_some_and(|eth| eth.get_ethertype() == EtherTypes::Ipv6)
}

pub fn parse_ipv6(frame: &[u8]) -> Result<Ipv6View, ParseError> {
    if frame.len() > MAX_FRAME_LEN {
        return Err(ParseError::Malformed);
    }
    let eth = EthernetPacket::new(frame).ok_or(ParseError::Malformed)?;
    if eth.get_ethertype() != EtherTypes::Ipv6 {
        return Err(ParseError::NotIpv6);
    }
    let ip_bytes = &frame[ETH_HDR_LEN..];
    let ip = Ipv6Packet::new(ip_bytes).ok_or(ParseError::Malformed)?;
    let payload_len = usize::from(ip.get_payload_length());
    if ip.get_version() != 6 || IPV6_HDR_LEN + payload_len > ip_bytes.len() {
        return Err(ParseError::Malformed);
    }
    let start = ETH_HDR_LEN + IPV6_HDR_LEN;
    let end = start + payload_len;
    let next_header = ip.get_next_header().0;
    let (dest_options, protocol, l4_offset) = if next_header == IPV6_DEST_OPTIONS {
        if start + 2 > end {
            return Err(ParseError::Malformed);
        }
        let len = (usize::from(frame[start + 1]) + 1) * 8;
        if start + len > end {
            return Err(ParseError::Malformed);
        }
        (Some((start, start + len)), frame[start], start + len)
    } else {
        (None, next_header, start)
    };
    Ok(Ipv6View {
        protocol,
        src: ip.get_source(),
        dst: ip.get_destination(),
        payload_len,
        dest_options,
        l4_offset,
    })
}

/// Find an option inside the TLV area of an IPv6 options header (the bytes
/// after next-header and length). Returns type and length bytes included.
pub fn find_ipv6_option(options: &[u8], kind: u8) -> Option<&[u8]> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            0 => i += 1,
            t => {
                let len = usize::from(*options.get(i + 1)?) + 2;
                if i + len > options.len() {
                    return None;
                }
                if t == kind {
                    return Some(&options[i..i + len]);
                }
                i += len;
            }
        }
    }
    None
}

/// Find an IPv4 option by type. Returns the whole option, type and length
/// bytes included.
pub fn find_ipv4_option(options: &[u8], kind: u8) -> Option<&[u8]> {
    let mut i = 0;
    while i < options.len() {
        match options[i] {
            0 => return None,
            1 => i += 1,
            t => {
                let len = usize::from(*options.get(i + 1)?);
                if len < 2 || i + len > options.len() {
                    return None;
                }
                if t == kind {
                    return Some(&options[i..i + len]);
                }
                i += len;
            }
        }
    }
    None
}

/// Every option type present, NOP and EOL excluded.
pub fn ipv4_option_types(options: &[u8]) -> impl Iterator<Item = u8> + '_ {
    let mut i = 0;
    std::iter::from_fn(move || {
        while i < options.len() {
            match options[i] {
                0 => return None,
                1 => i += 1,
                t => {
                    let len = usize::from(*options.get(i + 1)?);
                    if len < 2 {
                        return None;
                    }
                    i += len;
                    return Some(t);
                }
            }
        }
        None
    })
}

fn push_ipv4_header(out: &mut Frame, src: Ipv4Addr, dst: Ipv4Addr, protocol: u8, options: &[u8], l4_len: usize) {
    let header_len = IPV4_HDR_LEN + options.len();
    let total = (header_len + l4_len) as u16;
    out.extend(DST_MAC);
    out.extend(SRC_MAC);
    out.extend(0x0800u16.to_be_bytes());
    out.push(0x40 | (header_len / 4) as u8);
    out.push(0x00);
    out.extend(total.to_be_bytes());
    out.extend(0u16.to_be_bytes());
    out.extend(0x4000u16.to_be_bytes());
    out.push(64);
    out.push(protocol);
    out.extend(0u16.to_be_bytes());
    out.extend(src.octets());
    out.extend(dst.octets());
    out.extend(options.iter().copied());
}

/// Recompute the IPv4 header checksum in place.
pub fn fix_ipv4_checksum(frame: &mut [u8]) {
    let Some(ip) = Ipv4Packet::new(&frame[ETH_HDR_LEN..]) else {
        return;
    };
    let header_len = usize::from(ip.get_header_length()) * 4;
    if header_len < IPV4_HDR_LEN || ETH_HDR_LEN + header_len > frame.len() {
        return;
    }
    // Checksum covers the header only; compute over a header-sized view
    let sum = match Ipv4Packet::new(&frame[ETH_HDR_LEN..ETH_HDR_LEN + header_len]) {
        Some(hdr) => ipv4::checksum(&hdr),
        None => return,
    };
    frame[ETH_HDR_LEN + 10..ETH_HDR_LEN + 12].copy_from_slice(&sum.to_be_bytes());
}

fn pad_to(out: &mut Frame, len: usize) {
    while out.len() < len && !out.is_full() {
        out.push(0);
    }
}

/// UDP/IPv4 frame of exactly `frame_len` bytes (or the minimum that fits the
/// headers).
pub fn build_udp(flow: &FlowTuple, options: &[u8], frame_len: usize) -> Frame {
    let header_total = ETH_HDR_LEN + IPV4_HDR_LEN + options.len() + UDP_HDR_LEN;
    let frame_len = frame_len.max(header_total);
    let l4_len = frame_len - ETH_HDR_LEN - IPV4_HDR_LEN - options.len();
    let mut out = Frame::new();
    push_ipv4_header(&mut out, flow.src, flow.dst, PROTO_UDP, options, l4_len);
    out.extend(flow.src_port.to_be_bytes());
    out.extend(flow.dst_port.to_be_bytes());
    out.extend((l4_len as u16).to_be_bytes());
    out.extend(0u16.to_be_bytes());
    pad_to(&mut out, frame_len);
    fix_ipv4_checksum(&mut out);
    out
}

/// UDP/IPv6 frame of exactly `frame_len` bytes (or the minimum that fits the
/// headers). The UDP checksum is left zero.
pub fn build_udp_v6(src: Ipv6Addr, dst: Ipv6Addr, src_port: u16, dst_port: u16, frame_len: usize) -> Frame {
    let frame_len = frame_len.max(ETH_HDR_LEN + IPV6_HDR_LEN + UDP_HDR_LEN);
    let l4_len = frame_len - ETH_HDR_LEN - IPV6_HDR_LEN;
    let mut out = Frame::new();
    out.extend(DST_MAC);
    out.extend(SRC_MAC);
    out.extend(0x86ddu16.to_be_bytes());
    out.extend(0x6000_0000u32.to_be_bytes());
    out.extend((l4_len as u16).to_be_bytes());
    out.push(PROTO_UDP);
    out.push(64);
    out.extend(src.octets());
    out.extend(dst.octets());
    out.extend(src_port.to_be_bytes());
    out.extend(dst_port.to_be_bytes());
    out.extend((l4_len as u16).to_be_bytes());
    out.extend(0u16.to_be_bytes());
    pad_to(&mut out, frame_len);
    out
}

/// TCP SYN carrying `ack` in the acknowledgment field, used to announce a flow
/// for translation learning.
pub fn build_tcp_syn(flow: &FlowTuple, ack: u32) -> Frame {
    let mut out = Frame::new();
    push_ipv4_header(&mut out, flow.src, flow.dst, PROTO_TCP, &[], TCP_HDR_LEN);
    out.extend(flow.src_port.to_be_bytes());
    out.extend(flow.dst_port.to_be_bytes());
    out.extend(1u32.to_be_bytes());
    out.extend(ack.to_be_bytes());
    out.push(0x50);
    out.push(TCP_SYN);
    out.extend(0xffffu16.to_be_bytes());
    out.extend(0u32.to_be_bytes());
    fix_ipv4_checksum(&mut out);
    out
}

pub const TCP_SYN: u8 = 0x02;

/// TCP flags byte and acknowledgment number, if `l4` holds a TCP header.
pub fn tcp_flags_and_ack(l4: &[u8]) -> Option<(u8, u32)> {
    if l4.len() < TCP_HDR_LEN {
        return None;
    }
    let ack = u32::from_be_bytes([l4[8], l4[9], l4[10], l4[11]]);
    Some((l4[13], ack))
}

/// SCTP-framed probe: common header then `payload`.
pub fn build_sctp(src: Ipv4Addr, dst: Ipv4Addr, payload: &[u8], frame_len: usize) -> Frame {
    let header_total = ETH_HDR_LEN + IPV4_HDR_LEN + SCTP_HDR_LEN + payload.len();
    let frame_len = frame_len.max(header_total);
    let l4_len = frame_len - ETH_HDR_LEN - IPV4_HDR_LEN;
    let mut out = Frame::new();
    push_ipv4_header(&mut out, src, dst, PROTO_SCTP, &[], l4_len);
    out.extend(5000u16.to_be_bytes());
    out.extend(5000u16.to_be_bytes());
    out.extend(0u32.to_be_bytes());
    out.extend(0u32.to_be_bytes());
    out.extend(payload.iter().copied());
    pad_to(&mut out, frame_len);
    fix_ipv4_checksum(&mut out);
    out
}

/// ICMP echo probe: echo header then `payload`.
pub fn build_icmp(
    src: Ipv4Addr,
    dst: Ipv4Addr,
    icmp_type: u8,
    id: u16,
    seq: u16,
    payload: &[u8],
    frame_len: usize,
) -> Frame {
    let header_total = ETH_HDR_LEN + IPV4_HDR_LEN + ICMP_HDR_LEN + payload.len();
    let frame_len = frame_len.max(header_total);
    let l4_len = frame_len - ETH_HDR_LEN - IPV4_HDR_LEN;
    let mut out = Frame::new();
    push_ipv4_header(&mut out, src, dst, PROTO_ICMP, &[], l4_len);
    let l4_start = out.len();
    out.push(icmp_type);
    out.push(0);
    out.extend(0u16.to_be_bytes());
    out.extend(id.to_be_bytes());
    out.extend(seq.to_be_bytes());
    out.extend(payload.iter().copied());
    pad_to(&mut out, frame_len);
    if let Some(pkt) = IcmpPacket::new(&out[l4_start..]) {
        let sum = icmp::checksum(&pkt);
        out[l4_start + 2..l4_start + 4].copy_from_slice(&sum.to_be_bytes());
    }
    fix_ipv4_checksum(&mut out);
    out
}

/// ICMP type, identifier and sequence of an echo header.
pub fn icmp_echo_fields(l4: &[u8]) -> Option<(u8, u16, u16)> {
    if l4.len() < ICMP_HDR_LEN {
        return None;
    }
    Some((
        l4[0],
        u16::from_be_bytes([l4[4], l4[5]]),
        u16::from_be_bytes([l4[6], l4[7]]),
    ))
}

/// Append `option` to the IPv4 header of `buf`, growing the header and
/// fixing length and checksum. `option` must be a multiple of 4 bytes.
pub fn insert_ipv4_option(buf: &mut PacketBuf, option: &[u8]) -> bool {
    if option.len() % 4 != 0 {
        return false;
    }
    let view = match parse_ipv4(buf.data()) {
        Ok(view) => view,
        Err(_) => return false,
    };
    let new_header_len = view.header_len + option.len();
    if new_header_len - IPV4_HDR_LEN > MAX_IPV4_OPTIONS {
        return false;
    }
    if !buf.insert_at(view.l4_offset, option) {
        return false;
    }
    let total = (view.total_len + option.len()) as u16;
    let frame = buf.data_mut();
    frame[ETH_HDR_LEN] = 0x40 | (new_header_len / 4) as u8;
    frame[ETH_HDR_LEN + 2..ETH_HDR_LEN + 4].copy_from_slice(&total.to_be_bytes());
    fix_ipv4_checksum(frame);
    true
}

/// Insert a destination-options header right after the IPv6 header of
/// `buf`. `header` is the complete extension, a multiple of 8 bytes; its
/// next-header byte is overwritten with the frame's current one.
pub fn insert_ipv6_dest_options(buf: &mut PacketBuf, header: &[u8]) -> bool {
    if header.len() < 8 || header.len() % 8 != 0 {
        return false;
    }
    let view = match parse_ipv6(buf.data()) {
        Ok(view) if view.dest_options.is_none() => view,
        _ => return false,
    };
    let at = ETH_HDR_LEN + IPV6_HDR_LEN;
    if !buf.insert_at(at, header) {
        return false;
    }
    let payload = (view.payload_len + header.len()) as u16;
    let frame = buf.data_mut();
    frame[at] = view.protocol;
    frame[ETH_HDR_LEN + 4..ETH_HDR_LEN + 6].copy_from_slice(&payload.to_be_bytes());
    frame[ETH_HDR_LEN + 6] = IPV6_DEST_OPTIONS;
    true
}
