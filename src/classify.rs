use crate::latency::nat::NAT_OPTION_TYPE;
use crate::rx_check::{self, RX_CHECK_OPTION_TYPE};
use crate::wire::{self, ParseError, PROTO_ICMP, PROTO_SCTP, PROTO_TCP, TCP_SYN};

/// Where a received frame goes. Only enough parsing to route it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketClass {
    /// Latency probe, SCTP or ICMP framed.
    Latency,
    /// Carries an RX-check tag, as an IPv4 option or IPv6 destination option.
    RxCheckTag,
    /// Carries translation-learning info: the learn option or a SYN with an ack.
    NatLearn,
    Ordinary,
    /// Fails IPv4 sanity checks or exceeds the largest frame.
    Malformed,
}

impl PacketClass {
    /// Traffic that belongs to the latency core.
    pub fn is_latency_core_bound(self) -> bool {
        matches!(self, PacketClass::Latency | PacketClass::RxCheckTag | PacketClass::NatLearn)
    }
}

pub fn classify(frame: &[u8]) -> PacketClass {
    let view = match wire::parse_ipv4(frame) {
        Ok(view) => view,
        Err(ParseError::NotIpv4) if rx_check::find_tag(frame).is_some() => return PacketClass::RxCheckTag,
        Err(ParseError::NotIpv4) => return PacketClass::Ordinary,
        Err(_) => return PacketClass::Malformed,
    };

    let options = view.options(frame);
    if !options.is_empty() {
        for kind in wire::ipv4_option_types(options) {
            if kind == RX_CHECK_OPTION_TYPE {
                return PacketClass::RxCheckTag;
            }
            if kind == NAT_OPTION_TYPE {
                return PacketClass::NatLearn;
            }
        }
    }

    match view.protocol {
        PROTO_SCTP | PROTO_ICMP => PacketClass::Latency,
        PROTO_TCP => match wire::tcp_flags_and_ack(view.l4(frame)) {
            Some((flags, ack)) if flags & TCP_SYN != 0 && ack != 0 => PacketClass::NatLearn,
            _ => PacketClass::Ordinary,
        },
        _ => PacketClass::Ordinary,
    }
}
