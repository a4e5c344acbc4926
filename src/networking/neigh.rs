use crate::networking::error::NetworkResult;
use crate::networking::netlink::{Neighbour, Netlink};
use macaddr::MacAddr6;
use netlink_packet_route::neighbour::NeighbourState;
use std::net::IpAddr;

/// Install a permanent `ip -> mac` entry on `link_index`. Already present is success.
pub async fn add_permanent<N: Netlink + ?Sized>(
    nl: &N,
    link_index: u32,
    ip: IpAddr,
    mac: MacAddr6,
) -> NetworkResult<()> {
    let neigh = Neighbour {
        link_index,
        ip,
        mac: Some(mac),
        state: NeighbourState::Permanent,
    };
    match nl.neighbour_add(&neigh).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_exists() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Remove every entry, on any link, whose IP is in `ips`. Failures are logged
/// and skipped since a stale entry only delays convergence.
pub async fn purge<N: Netlink + ?Sized>(nl: &N, ips: &[IpAddr]) {
    let entries = match nl.neighbours().await {
        Ok(entries) => entries,
        Err(e) => {
            tracing::warn!(error = %e, "failed to list neighbours");
            return;
        }
    };
    for entry in entries.iter().filter(|n| ips.contains(&n.ip)) {
        match nl.neighbour_del(entry).await {
            Ok(()) => tracing::debug!(ip = %entry.ip, link = entry.link_index, "stale neighbour removed"),
            Err(e) if e.is_not_found() => {}
            Err(e) => tracing::warn!(ip = %entry.ip, error = %e, "failed to remove stale neighbour"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::networking::fake::{FakeKernel, HOST};

    #[tokio::test]
    async fn purge_removes_only_matching_entries() {
        let kernel = FakeKernel::new();
        let host = kernel.host();
        let eth0 = kernel.add_link(HOST, "ens192", None);
        let mac: MacAddr6 = "02:00:00:00:00:01".parse().unwrap();

        add_permanent(&host, eth0, "10.6.0.10".parse().unwrap(), mac).await.unwrap();
        add_permanent(&host, eth0, "10.6.0.11".parse().unwrap(), mac).await.unwrap();
        add_permanent(&host, eth0, "10.6.0.11".parse().unwrap(), mac).await.unwrap();

        purge(&host, &["10.6.0.10".parse().unwrap()]).await;
        let left = kernel.snapshot(HOST).neighbours;
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].ip, "10.6.0.11".parse::<IpAddr>().unwrap());
    }
}
