// Virtual Ethernet (veth) pair management
// Creates the auxiliary pod<->host pair and resolves the host end of an
// overlay CNI's pair.

use crate::networking::error::{NetworkError, NetworkResult};
use crate::networking::netlink::{Link, Netlink};
use std::os::unix::io::RawFd;

/// Linux IFNAMSIZ minus the NUL terminator.
const MAX_IFNAME_LEN: usize = 15;
const HOST_VETH_PREFIX: &str = "veth";

/// Both ends of a veth pair as seen from their own namespaces.
#[derive(Debug, Clone)]
pub struct VethPair {
    pub pod: Link,
    pub host: Link,
}

/// Host-side name for a pod's auxiliary veth, derived from the container ID.
pub fn host_veth_name(container_id: &str) -> String {
    let take = MAX_IFNAME_LEN - HOST_VETH_PREFIX.len();
    let suffix: String = container_id.chars().take(take).collect();
    format!("{}{}", HOST_VETH_PREFIX, suffix)
}

pub async fn interface_exists<N: Netlink + ?Sized>(nl: &N, name: &str) -> NetworkResult<bool> {
    match nl.link_by_name(name).await {
        Ok(_) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

async fn delete_if_present<N: Netlink + ?Sized>(nl: &N, name: &str) -> NetworkResult<()> {
    let link = match nl.link_by_name(name).await {
        Ok(link) => link,
        Err(e) if e.is_not_found() => return Ok(()), // already gone
        Err(e) => return Err(e),
    };
    match nl.link_del(link.index).await {
        Ok(()) => {
            tracing::debug!(name, "removed stale link");
            Ok(())
        }
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Create `pod_veth` inside the pod with its peer `host_veth` moved to the
/// host namespace identified by `host_fd`. Stale ends from an earlier
/// attempt are removed first, both sides end up UP.
pub async fn setup_veth<P, H>(
    pod: &P,
    host: &H,
    host_fd: RawFd,
    pod_veth: &str,
    host_veth: &str,
) -> NetworkResult<VethPair>
where
    P: Netlink + ?Sized,
    H: Netlink + ?Sized,
{
    // Clean up stale interfaces first (idempotent)
    delete_if_present(host, host_veth).await?;
    delete_if_present(pod, pod_veth).await?;

    pod.link_add_veth(pod_veth, host_veth).await?;

    let peer = pod.link_by_name(host_veth).await?;
    pod.link_set_netns(peer.index, host_fd).await?;

    let host_link = host.link_by_name(host_veth).await.map_err(|e| {
        NetworkError::NotFound(format!(
            "host veth {} after moving to host netns: {}",
            host_veth, e
        ))
    })?;
    host.link_up(host_link.index).await?;

    let pod_link = pod.link_by_name(pod_veth).await?;
    pod.link_up(pod_link.index).await?;

    tracing::info!(
        pod_veth,
        host_veth,
        pod_mac = ?pod_link.mac,
        host_mac = ?host_link.mac,
        "veth pair created"
    );
    Ok(VethPair {
        pod: pod_link,
        host: host_link,
    })
}

/// Resolve both ends of an existing pair whose pod end is `pod_nic`, using
/// the peer index the pod end advertises.
pub async fn existing_pair<P, H>(pod: &P, host: &H, pod_nic: &str) -> NetworkResult<VethPair>
where
    P: Netlink + ?Sized,
    H: Netlink + ?Sized,
{
    let pod_link = pod.link_by_name(pod_nic).await?;
    let peer_index = pod_link.parent_index.ok_or_else(|| {
        NetworkError::Validation(format!("{} is not one end of a veth pair", pod_nic))
    })?;
    let host_link = host.link_by_index(peer_index).await?;
    Ok(VethPair {
        pod: pod_link,
        host: host_link,
    })
}
