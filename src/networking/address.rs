use crate::networking::error::{NetworkError, NetworkResult};
use crate::networking::netlink::{
    Address, IpFamily, Netlink, Route, RT_TABLE_LOCAL, RT_TABLE_MAIN,
};
use ipnet::IpNet;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Interfaces whose addresses never count as node addresses.
const NODE_IFACE_DENYLIST: &[&str] = &[
    "docker",
    "cbr",
    "dummy",
    "virbr",
    "lxcbr",
    "lxc",
    "veth",
    "cali",
    "tunl",
    "flannel",
    "kube-ipvs",
    "cni",
    "cilium",
    "nodelocaldns",
    "vx-submariner",
];

fn is_denied(name: &str) -> bool {
    name == "lo" || NODE_IFACE_DENYLIST.iter().any(|p| name.starts_with(p))
}

/// Global unicast, not link-local, not multicast.
pub fn is_usable(ip: &IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            !(v4.is_unspecified() || v4.is_loopback() || v4.is_multicast() || v4.is_link_local() || v4.is_broadcast())
        }
        IpAddr::V6(v6) => {
            !(v6.is_unspecified() || v6.is_loopback() || v6.is_multicast() || is_v6_link_local(v6))
        }
    }
}

pub fn is_v6_link_local(ip: &Ipv6Addr) -> bool {
    (ip.segments()[0] & 0xffc0) == 0xfe80
}

/// Usable addresses bound to `iface`, optionally restricted to one family.
pub async fn addresses_by_interface<N: Netlink + ?Sized>(
    nl: &N,
    iface: &str,
    family: IpFamily,
) -> NetworkResult<Vec<Address>> {
    let link = nl.link_by_name(iface).await?;
    let addrs = nl.addresses(Some(link.index)).await?;
    Ok(addrs
        .into_iter()
        .filter(|a| family.includes(a.family()) && is_usable(&a.ip))
        .collect())
}

/// Usable addresses of every node interface outside the denylist.
pub async fn node_addresses<N: Netlink + ?Sized>(
    nl: &N,
    family: IpFamily,
) -> NetworkResult<Vec<Address>> {
    let links = nl.links().await?;
    let allowed: Vec<u32> = links
        .iter()
        .filter(|l| !is_denied(&l.name))
        .map(|l| l.index)
        .collect();
    let addrs = nl.addresses(None).await?;
    Ok(addrs
        .into_iter()
        .filter(|a| allowed.contains(&a.link_index))
        .filter(|a| family.includes(a.family()) && is_usable(&a.ip))
        .collect())
}

/// Host route form of an address: /32 or /128.
pub fn max_mask_net(ip: IpAddr) -> IpNet {
    match ip {
        IpAddr::V4(_) => IpNet::new(ip, 32),
        IpAddr::V6(_) => IpNet::new(ip, 128),
    }
    .unwrap_or_else(|_| IpNet::from(ip))
}

/// Longest-prefix match over a route dump, walking the tables in the
/// order the default rules consult them: local, then main.
///
/// This is not a kernel route lookup. Policy rules are not evaluated and
/// tables other than local and main are never consulted, so a `from`/`to`
/// rule steering `dst` elsewhere is invisible here. Callers only resolve
/// the node's own interface addresses, which the local table always
/// answers before any rule could apply.
pub fn lookup_route<'a>(routes: &'a [Route], dst: IpAddr) -> Option<&'a Route> {
    for table in [RT_TABLE_LOCAL, RT_TABLE_MAIN] {
        let best = routes
            .iter()
            .filter(|r| r.table == table && IpFamily::of(&dst) == r.family)
            .filter(|r| r.destination.map_or(true, |d| d.contains(&dst)))
            .max_by_key(|r| r.destination.map_or(0, |d| d.prefix_len()));
        if best.is_some() {
            return best;
        }
    }
    None
}

/// Source address the kernel would pick to reach `dst`.
fn preferred_source(routes: &[Route], dst: IpAddr) -> NetworkResult<IpAddr> {
    let route = lookup_route(routes, dst)
        .ok_or_else(|| NetworkError::NotFound(format!("route to {}", dst)))?;
    match route.pref_src {
        Some(src) => Ok(src),
        // Local routes for our own addresses sometimes omit prefsrc.
        None if route.table == RT_TABLE_LOCAL => Ok(dst),
        None => Err(NetworkError::NotFound(format!(
            "preferred source for {}",
            dst
        ))),
    }
}

/// The node's source address per family for reaching each of `addrs`.
/// A lookup failure is returned, not guessed around.
pub async fn gateway_ips<N: Netlink + ?Sized>(
    nl: &N,
    addrs: &[Address],
) -> NetworkResult<(Option<Ipv4Addr>, Option<Ipv6Addr>)> {
    let routes = nl.routes(IpFamily::All).await?;
    let mut v4 = None;
    let mut v6 = None;
    for addr in addrs {
        match preferred_source(&routes, addr.ip)? {
            IpAddr::V4(ip) if v4.is_none() => v4 = Some(ip),
            IpAddr::V6(ip) if v6.is_none() => v6 = Some(ip),
            _ => {}
        }
    }
    Ok((v4, v6))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::fake::FakeKernel;
    use netlink_packet_route::route::RouteScope;

    #[test]
    fn denylist_matches_prefixes_and_loopback() {
        assert!(is_denied("docker0"));
        assert!(is_denied("cali1234"));
        assert!(is_denied("lo"));
        assert!(!is_denied("local0"));
        assert!(!is_denied("ens192"));
    }

    #[test]
    fn usable_filters_link_local_and_multicast() {
        assert!(is_usable(&"10.6.0.10".parse().unwrap()));
        assert!(!is_usable(&"169.254.1.1".parse().unwrap()));
        assert!(!is_usable(&"fe80::1".parse().unwrap()));
        assert!(!is_usable(&"ff02::1".parse().unwrap()));
        assert!(is_usable(&"fd00::10".parse().unwrap()));
    }

    #[test]
    fn max_mask_uses_full_prefix() {
        assert_eq!(max_mask_net("10.6.0.10".parse().unwrap()).to_string(), "10.6.0.10/32");
        assert_eq!(max_mask_net("fd00::10".parse().unwrap()).to_string(), "fd00::10/128");
    }

    #[test]
    fn lookup_prefers_local_table_then_longest_prefix() {
        let mut local = Route::unicast(IpFamily::V4, RT_TABLE_LOCAL);
        local.destination = Some("192.168.1.10/32".parse().unwrap());
        local.pref_src = Some("192.168.1.10".parse().unwrap());
        local.scope = RouteScope::Host;

        let mut wide = Route::unicast(IpFamily::V4, RT_TABLE_MAIN);
        wide.destination = Some("192.168.0.0/16".parse().unwrap());
        let mut narrow = Route::unicast(IpFamily::V4, RT_TABLE_MAIN);
        narrow.destination = Some("192.168.1.0/24".parse().unwrap());
        narrow.pref_src = Some("192.168.1.10".parse().unwrap());

        let routes = vec![wide, narrow.clone(), local.clone()];
        assert_eq!(lookup_route(&routes, "192.168.1.10".parse().unwrap()), Some(&local));
        assert_eq!(lookup_route(&routes, "192.168.1.77".parse().unwrap()), Some(&narrow));
        assert_eq!(lookup_route(&routes, "10.0.0.1".parse().unwrap()), None);
    }

    #[test]
    fn lookup_ignores_custom_tables() {
        let mut steered = Route::unicast(IpFamily::V4, 100);
        steered.destination = Some("192.168.1.0/24".parse().unwrap());
        steered.pref_src = Some("10.6.0.10".parse().unwrap());
        let mut main = Route::unicast(IpFamily::V4, RT_TABLE_MAIN);
        main.destination = Some("192.168.0.0/16".parse().unwrap());

        let routes = vec![steered, main.clone()];
        assert_eq!(lookup_route(&routes, "192.168.1.77".parse().unwrap()), Some(&main));
        assert_eq!(lookup_route(&routes[..1], "192.168.1.77".parse().unwrap()), None);
    }

    #[tokio::test]
    async fn node_addresses_skip_denied_interfaces() {
        let kernel = FakeKernel::new();
        let host = kernel.host();
        let ens = kernel.add_link(0, "ens192", None);
        let docker = kernel.add_link(0, "docker0", None);
        kernel.add_address(0, ens, "192.168.1.10/24");
        kernel.add_address(0, ens, "fe80::1/64");
        kernel.add_address(0, docker, "172.17.0.1/16");

        let addrs = node_addresses(&host, IpFamily::All).await.unwrap();
        let ips: Vec<String> = addrs.iter().map(|a| a.ip.to_string()).collect();
        assert_eq!(ips, vec!["192.168.1.10"]);
    }

    #[tokio::test]
    async fn gateway_ips_fail_when_no_route_matches() {
        let kernel = FakeKernel::new();
        let host = kernel.host();
        let addrs = vec![Address {
            ip: "10.9.9.9".parse().unwrap(),
            prefix_len: 24,
            link_index: 1,
        }];
        assert!(gateway_ips(&host, &addrs).await.is_err());
    }
}
