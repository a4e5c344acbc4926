use crate::coordinator::mode::Mode;
use crate::networking::netlink::{Address, Link};
use crate::networking::IpFamily;
use ipnet::IpNet;
use macaddr::MacAddr6;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Everything one ADD works out about the pod before it mutates routing.
/// Lives for the duration of the call only.
#[derive(Debug, Clone)]
pub struct RuntimeState {
    pub mode: Mode,
    pub first_invoke: bool,
    pub ip_family: IpFamily,
    pub current_interface: String,
    pub current_rule_table: u32,
    pub host_rule_table: u32,

    /// Pod end of the veth that carries host-bound traffic.
    pub pod_veth: Link,
    /// Host end of the same pair.
    pub host_veth: Link,

    pub hijack_cidr: Vec<IpNet>,
    pub pod_nics: Vec<String>,

    /// Addresses bound to the current interface inside the pod.
    pub current_address: Vec<Address>,
    /// Node addresses the pod must reach through the veth.
    pub host_ip_route_for_pod: Vec<IpAddr>,

    /// Next hop for hijacked prefixes, per family.
    pub v4_gateway: Option<Ipv4Addr>,
    pub v6_gateway: Option<Ipv6Addr>,
}

impl RuntimeState {
    pub fn pod_veth_mac(&self) -> Option<MacAddr6> {
        self.pod_veth.mac
    }

    pub fn host_veth_mac(&self) -> Option<MacAddr6> {
        self.host_veth.mac
    }

    /// Routes go into main as well as the interface's own table only for the
    /// first overlay NIC, so traffic that still follows main keeps working.
    pub fn mirror_to_main(&self) -> bool {
        self.mode == Mode::Overlay
            && self.first_invoke
            && self.current_rule_table != crate::networking::netlink::RT_TABLE_MAIN
    }

    pub fn current_ips(&self) -> Vec<IpAddr> {
        self.current_address.iter().map(|a| a.ip).collect()
    }
}
