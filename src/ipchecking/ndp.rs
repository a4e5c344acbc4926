use crate::ipchecking::packet::{solicited_node, NdpKind, NdpPacket};
use crate::ipchecking::transport::PacketTransport;
use crate::ipchecking::{probe, DetectError, ProbeOptions};
use crate::networking::netns::CancelToken;
use macaddr::MacAddr6;
use std::net::{IpAddr, Ipv6Addr};

/// IPv6 checks over neighbor discovery on a single interface.
pub struct NdpProber<T> {
    transport: T,
    iface: String,
    mac: MacAddr6,
}

impl<T: PacketTransport> NdpProber<T> {
    pub fn new(transport: T, iface: &str, mac: MacAddr6) -> Self {
        Self {
            transport,
            iface: iface.to_string(),
            mac,
        }
    }

    fn solicit(
        &mut self,
        target: Ipv6Addr,
        opts: &ProbeOptions,
        cancel: &CancelToken,
        ignore_own: bool,
    ) -> Result<Option<MacAddr6>, DetectError> {
        let packet = NdpPacket::solicit(target, Some(self.mac)).to_bytes();
        let dest = IpAddr::V6(solicited_node(target));
        let own = self.mac;
        probe(&mut self.transport, &packet, dest, opts, cancel, |bytes| {
            let na = NdpPacket::parse(bytes)?;
            if na.kind != NdpKind::Advert || na.target != target {
                return None;
            }
            // An advert without a target link-layer option names nobody.
            let mac = na.link_addr?;
            (!ignore_own || mac != own).then_some(mac)
        })
    }

    /// Solicit our own candidate address; an advertisement from anyone else
    /// means the address is in use.
    pub fn check_conflict(
        &mut self,
        ip: Ipv6Addr,
        opts: &ProbeOptions,
        cancel: &CancelToken,
    ) -> Result<(), DetectError> {
        match self.solicit(ip, opts, cancel, true)? {
            Some(mac) => Err(DetectError::IpConflict {
                iface: self.iface.clone(),
                ip: IpAddr::V6(ip),
                mac,
            }),
            None => {
                tracing::debug!(iface = %self.iface, %ip, "no ndp conflict");
                Ok(())
            }
        }
    }

    pub fn check_gateway(
        &mut self,
        gateway: Ipv6Addr,
        opts: &ProbeOptions,
        cancel: &CancelToken,
    ) -> Result<(), DetectError> {
        match self.solicit(gateway, opts, cancel, false)? {
            Some(mac) => {
                tracing::debug!(iface = %self.iface, %gateway, %mac, "gateway reachable");
                Ok(())
            }
            None => Err(DetectError::GatewayUnreachable {
                iface: self.iface.clone(),
                gateway: IpAddr::V6(gateway),
            }),
        }
    }
}
