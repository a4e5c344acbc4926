use crate::ipchecking::packet::{ArpOp, ArpPacket};
use crate::ipchecking::transport::PacketTransport;
use crate::ipchecking::{probe, DetectError, ProbeOptions};
use crate::networking::netns::CancelToken;
use macaddr::MacAddr6;
use std::net::{IpAddr, Ipv4Addr};

/// IPv4 checks over ARP on a single interface.
pub struct ArpProber<T> {
    transport: T,
    iface: String,
    mac: MacAddr6,
}

impl<T: PacketTransport> ArpProber<T> {
    pub fn new(transport: T, iface: &str, mac: MacAddr6) -> Self {
        Self {
            transport,
            iface: iface.to_string(),
            mac,
        }
    }

    /// Probe for `ip` with a zero sender address. Any reply from a MAC other
    /// than ours means the address is in use elsewhere.
    pub fn check_conflict(
        &mut self,
        ip: Ipv4Addr,
        opts: &ProbeOptions,
        cancel: &CancelToken,
    ) -> Result<(), DetectError> {
        let frame = ArpPacket::request(self.mac, Ipv4Addr::UNSPECIFIED, ip).to_frame();
        let own = self.mac;
        let hit = probe(&mut self.transport, &frame, IpAddr::V4(ip), opts, cancel, |bytes| {
            let arp = ArpPacket::parse_frame(bytes)?;
            (arp.op == ArpOp::Reply && arp.sender_ip == ip && arp.sender_mac != own)
                .then_some(arp.sender_mac)
        })?;
        match hit {
            Some(mac) => Err(DetectError::IpConflict {
                iface: self.iface.clone(),
                ip: IpAddr::V4(ip),
                mac,
            }),
            None => {
                tracing::debug!(iface = %self.iface, %ip, "no arp conflict");
                Ok(())
            }
        }
    }

    /// Resolve `gateway` from `src`; no reply within the retry budget is unreachable.
    pub fn check_gateway(
        &mut self,
        src: Ipv4Addr,
        gateway: Ipv4Addr,
        opts: &ProbeOptions,
        cancel: &CancelToken,
    ) -> Result<(), DetectError> {
        let frame = ArpPacket::request(self.mac, src, gateway).to_frame();
        let hit = probe(&mut self.transport, &frame, IpAddr::V4(gateway), opts, cancel, |bytes| {
            let arp = ArpPacket::parse_frame(bytes)?;
            (arp.op == ArpOp::Reply && arp.sender_ip == gateway).then_some(arp.sender_mac)
        })?;
        match hit {
            Some(mac) => {
                tracing::debug!(iface = %self.iface, %gateway, %mac, "gateway reachable");
                Ok(())
            }
            None => Err(DetectError::GatewayUnreachable {
                iface: self.iface.clone(),
                gateway: IpAddr::V4(gateway),
            }),
        }
    }
}
