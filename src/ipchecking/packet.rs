//! Wire layouts for the ARP and NDP probes.
//!
//! ARP is sent as a complete Ethernet frame on an AF_PACKET socket. NDP is
//! sent as a bare ICMPv6 message on a raw ICMPv6 socket; the kernel adds the
//! IPv6 header and fills in the checksum.

use macaddr::MacAddr6;
use std::net::{Ipv4Addr, Ipv6Addr};
use zerocopy::byteorder::network_endian::U16;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

pub const ETH_P_ARP: u16 = 0x0806;
const ETH_P_IPV4: u16 = 0x0800;
const ARP_HTYPE_ETHERNET: u16 = 1;
const ETH_MIN_FRAME: usize = 60;

pub const ICMPV6_NEIGHBOR_SOLICIT: u8 = 135;
pub const ICMPV6_NEIGHBOR_ADVERT: u8 = 136;
const NDP_OPT_SOURCE_LL: u8 = 1;
const NDP_OPT_TARGET_LL: u8 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct EtherHdr {
    pub dst: [u8; 6],
    pub src: [u8; 6],
    pub ether_type: U16,
}

/// ARP for IPv4 over Ethernet.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ArpEth4 {
    pub htype: U16,
    pub ptype: U16,
    pub hlen: u8,
    pub plen: u8,
    pub op: U16,
    pub sha: [u8; 6],
    pub spa: [u8; 4],
    pub tha: [u8; 6],
    pub tpa: [u8; 4],
}

/// Fixed part of a Neighbor Solicitation or Advertisement. For a
/// solicitation `flags` is reserved and zero.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct NdpHdr {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: U16,
    pub flags: [u8; 4],
    pub target: [u8; 16],
}

/// Source/target link-layer address option for Ethernet.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct LinkLayerOpt {
    pub kind: u8,
    /// In units of 8 octets.
    pub len: u8,
    pub addr: [u8; 6],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArpOp {
    Request,
    Reply,
}

impl ArpOp {
    fn code(self) -> u16 {
        match self {
            ArpOp::Request => 1,
            ArpOp::Reply => 2,
        }
    }

    fn from_code(code: u16) -> Option<Self> {
        match code {
            1 => Some(ArpOp::Request),
            2 => Some(ArpOp::Reply),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArpPacket {
    pub op: ArpOp,
    pub sender_mac: MacAddr6,
    pub sender_ip: Ipv4Addr,
    pub target_mac: MacAddr6,
    pub target_ip: Ipv4Addr,
}

impl ArpPacket {
    pub fn request(sender_mac: MacAddr6, sender_ip: Ipv4Addr, target_ip: Ipv4Addr) -> Self {
        Self {
            op: ArpOp::Request,
            sender_mac,
            sender_ip,
            target_mac: MacAddr6::nil(),
            target_ip,
        }
    }

    /// Ethernet frame carrying this packet; requests are broadcast.
    pub fn to_frame(&self) -> Vec<u8> {
        let dst = match self.op {
            ArpOp::Request => MacAddr6::broadcast(),
            ArpOp::Reply => self.target_mac,
        };
        let eth = EtherHdr {
            dst: dst.into_array(),
            src: self.sender_mac.into_array(),
            ether_type: U16::new(ETH_P_ARP),
        };
        let arp = ArpEth4 {
            htype: U16::new(ARP_HTYPE_ETHERNET),
            ptype: U16::new(ETH_P_IPV4),
            hlen: 6,
            plen: 4,
            op: U16::new(self.op.code()),
            sha: self.sender_mac.into_array(),
            spa: self.sender_ip.octets(),
            tha: self.target_mac.into_array(),
            tpa: self.target_ip.octets(),
        };
        let mut frame = Vec::with_capacity(ETH_MIN_FRAME);
        frame.extend_from_slice(eth.as_bytes());
        frame.extend_from_slice(arp.as_bytes());
        frame.resize(ETH_MIN_FRAME, 0);
        frame
    }

    /// Parse an Ethernet frame; anything that is not IPv4-over-Ethernet ARP is `None`.
    pub fn parse_frame(frame: &[u8]) -> Option<Self> {
        let (eth, rest) = EtherHdr::ref_from_prefix(frame).ok()?;
        if eth.ether_type.get() != ETH_P_ARP {
            return None;
        }
        let (arp, _) = ArpEth4::ref_from_prefix(rest).ok()?;
        if arp.htype.get() != ARP_HTYPE_ETHERNET
            || arp.ptype.get() != ETH_P_IPV4
            || arp.hlen != 6
            || arp.plen != 4
        {
            return None;
        }
        Some(Self {
            op: ArpOp::from_code(arp.op.get())?,
            sender_mac: MacAddr6::from(arp.sha),
            sender_ip: Ipv4Addr::from(arp.spa),
            target_mac: MacAddr6::from(arp.tha),
            target_ip: Ipv4Addr::from(arp.tpa),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NdpKind {
    Solicit,
    Advert,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NdpPacket {
    pub kind: NdpKind,
    pub target: Ipv6Addr,
    /// Source LL option on a solicitation, target LL option on an advertisement.
    pub link_addr: Option<MacAddr6>,
}

impl NdpPacket {
    pub fn solicit(target: Ipv6Addr, source_mac: Option<MacAddr6>) -> Self {
        Self {
            kind: NdpKind::Solicit,
            target,
            link_addr: source_mac,
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let (icmp_type, opt_kind) = match self.kind {
            NdpKind::Solicit => (ICMPV6_NEIGHBOR_SOLICIT, NDP_OPT_SOURCE_LL),
            NdpKind::Advert => (ICMPV6_NEIGHBOR_ADVERT, NDP_OPT_TARGET_LL),
        };
        let hdr = NdpHdr {
            icmp_type,
            code: 0,
            checksum: U16::ZERO,
            flags: [0; 4],
            target: self.target.octets(),
        };
        let mut out = hdr.as_bytes().to_vec();
        if let Some(mac) = self.link_addr {
            let opt = LinkLayerOpt {
                kind: opt_kind,
                len: 1,
                addr: mac.into_array(),
            };
            out.extend_from_slice(opt.as_bytes());
        }
        out
    }

    /// Parse an ICMPv6 message as received on a raw ICMPv6 socket.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let (hdr, mut opts) = NdpHdr::ref_from_prefix(bytes).ok()?;
        let (kind, wanted_opt) = match hdr.icmp_type {
            ICMPV6_NEIGHBOR_SOLICIT => (NdpKind::Solicit, NDP_OPT_SOURCE_LL),
            ICMPV6_NEIGHBOR_ADVERT => (NdpKind::Advert, NDP_OPT_TARGET_LL),
            _ => return None,
        };
        if hdr.code != 0 {
            return None;
        }

        let mut link_addr = None;
        while opts.len() >= 2 {
            let len = usize::from(opts[1]) * 8;
            if len == 0 || len > opts.len() {
                break;
            }
            if opts[0] == wanted_opt {
                if let Ok((opt, _)) = LinkLayerOpt::ref_from_prefix(opts) {
                    link_addr = Some(MacAddr6::from(opt.addr));
                }
            }
            opts = &opts[len..];
        }

        Some(Self {
            kind,
            target: Ipv6Addr::from(hdr.target),
            link_addr,
        })
    }
}

/// ff02::1:ffXX:XXXX for `target`.
pub fn solicited_node(target: Ipv6Addr) -> Ipv6Addr {
    let o = target.octets();
    Ipv6Addr::new(
        0xff02,
        0,
        0,
        0,
        0,
        1,
        0xff00 | u16::from(o[13]),
        (u16::from(o[14]) << 8) | u16::from(o[15]),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn arb_mac() -> impl Strategy<Value = MacAddr6> {
        any::<[u8; 6]>().prop_map(MacAddr6::from)
    }

    fn arb_arp() -> impl Strategy<Value = ArpPacket> {
        (
            prop_oneof![Just(ArpOp::Request), Just(ArpOp::Reply)],
            arb_mac(),
            any::<[u8; 4]>(),
            arb_mac(),
            any::<[u8; 4]>(),
        )
            .prop_map(|(op, sender_mac, spa, target_mac, tpa)| ArpPacket {
                op,
                sender_mac,
                sender_ip: Ipv4Addr::from(spa),
                target_mac,
                target_ip: Ipv4Addr::from(tpa),
            })
    }

    fn arb_ndp() -> impl Strategy<Value = NdpPacket> {
        (
            prop_oneof![Just(NdpKind::Solicit), Just(NdpKind::Advert)],
            any::<[u8; 16]>(),
            proptest::option::of(arb_mac()),
        )
            .prop_map(|(kind, target, link_addr)| NdpPacket {
                kind,
                target: Ipv6Addr::from(target),
                link_addr,
            })
    }

    proptest! {
        #[test]
        fn arp_frames_decode_to_what_was_encoded(pkt in arb_arp()) {
            let frame = pkt.to_frame();
            prop_assert_eq!(frame.len(), ETH_MIN_FRAME);
            prop_assert_eq!(ArpPacket::parse_frame(&frame), Some(pkt));
        }

        #[test]
        fn ndp_messages_decode_to_what_was_encoded(pkt in arb_ndp()) {
            let bytes = pkt.to_bytes();
            let opt_len = if pkt.link_addr.is_some() { 8 } else { 0 };
            prop_assert_eq!(bytes.len(), 24 + opt_len);
            prop_assert_eq!(NdpPacket::parse(&bytes), Some(pkt));
        }

        #[test]
        fn truncated_ndp_header_never_parses(pkt in arb_ndp(), cut in 0usize..24) {
            let bytes = pkt.to_bytes();
            prop_assert!(NdpPacket::parse(&bytes[..cut]).is_none());
        }
    }

    #[test]
    fn arp_request_frame_layout() {
        let mac: MacAddr6 = "02:00:0a:06:00:0a".parse().unwrap();
        let frame = ArpPacket::request(mac, Ipv4Addr::UNSPECIFIED, "10.6.0.10".parse().unwrap())
            .to_frame();

        assert_eq!(frame.len(), ETH_MIN_FRAME);
        assert_eq!(&frame[0..6], &[0xff; 6]);
        assert_eq!(&frame[12..14], &[0x08, 0x06]);
        // opcode request
        assert_eq!(&frame[20..22], &[0x00, 0x01]);
        // target protocol address
        assert_eq!(&frame[38..42], &[10, 6, 0, 10]);
    }

    #[test]
    fn parse_rejects_non_arp_ethertype() {
        let mut frame = ArpPacket::request(MacAddr6::nil(), Ipv4Addr::UNSPECIFIED, Ipv4Addr::LOCALHOST)
            .to_frame();
        frame[12] = 0x08;
        frame[13] = 0x00;
        assert!(ArpPacket::parse_frame(&frame).is_none());
        assert!(ArpPacket::parse_frame(&frame[..10]).is_none());
    }

    #[test]
    fn parse_arp_reply() {
        let reply = ArpPacket {
            op: ArpOp::Reply,
            sender_mac: "aa:bb:cc:dd:ee:ff".parse().unwrap(),
            sender_ip: "10.6.0.1".parse().unwrap(),
            target_mac: "02:00:0a:06:00:0a".parse().unwrap(),
            target_ip: "10.6.0.10".parse().unwrap(),
        };
        assert_eq!(ArpPacket::parse_frame(&reply.to_frame()), Some(reply));
    }

    #[test]
    fn solicited_node_address() {
        let target: Ipv6Addr = "fd00::12:3456".parse().unwrap();
        assert_eq!(solicited_node(target), "ff02::1:ff12:3456".parse::<Ipv6Addr>().unwrap());
    }

    #[test]
    fn neighbor_advert_with_target_option() {
        let mut bytes = vec![ICMPV6_NEIGHBOR_ADVERT, 0, 0, 0, 0x60, 0, 0, 0];
        bytes.extend_from_slice(&"fd00::10".parse::<Ipv6Addr>().unwrap().octets());
        // an unrelated nonce option first, then the target LL option
        bytes.extend_from_slice(&[14, 1, 0, 0, 0, 0, 0, 0]);
        bytes.extend_from_slice(&[NDP_OPT_TARGET_LL, 1, 0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

        let na = NdpPacket::parse(&bytes).unwrap();
        assert_eq!(na.kind, NdpKind::Advert);
        assert_eq!(na.target, "fd00::10".parse::<Ipv6Addr>().unwrap());
        assert_eq!(na.link_addr, Some("aa:bb:cc:dd:ee:ff".parse().unwrap()));
    }

    #[test]
    fn neighbor_solicit_carries_source_option() {
        let mac: MacAddr6 = "02:00:00:00:00:01".parse().unwrap();
        let ns = NdpPacket::solicit("fd00::1".parse().unwrap(), Some(mac));
        let bytes = ns.to_bytes();
        assert_eq!(bytes.len(), 24 + 8);
        assert_eq!(bytes[0], ICMPV6_NEIGHBOR_SOLICIT);
        assert_eq!(NdpPacket::parse(&bytes), Some(ns));
    }
}
