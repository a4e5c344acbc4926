use crate::coordinator::state::RuntimeState;
use crate::coordinator::{Context, Coordinator, CoordinatorError, CoordinatorResult, PodNamespace};
use crate::networking::neigh;
use crate::networking::Netlink;

impl<N, P> Coordinator<N, P>
where
    N: Netlink,
    P: PodNamespace,
{
    /// Pin pod addresses to the pod veth MAC on the host side and, on the
    /// first invocation, node addresses to the host veth MAC inside the pod.
    /// Stale host entries for the same IPs are dropped first.
    pub(crate) async fn populate_neighbours(&self, state: &RuntimeState) -> CoordinatorResult<()> {
        let pod_ips = state.current_ips();
        neigh::purge(&self.host, &pod_ips).await;

        let pod_mac = state.pod_veth_mac().ok_or_else(|| {
            CoordinatorError::Invalid(format!("pod veth {} has no hardware address", state.pod_veth.name))
        })?;
        for ip in &pod_ips {
            neigh::add_permanent(&self.host, state.host_veth.index, *ip, pod_mac)
                .await
                .context(format!("add host neighbour {} on {}", ip, state.host_veth.name))?;
        }

        if state.first_invoke {
            let host_mac = state.host_veth_mac().ok_or_else(|| {
                CoordinatorError::Invalid(format!(
                    "host veth {} has no hardware address",
                    state.host_veth.name
                ))
            })?;
            for ip in &state.host_ip_route_for_pod {
                neigh::add_permanent(&self.pod, state.pod_veth.index, *ip, host_mac)
                    .await
                    .context(format!("add pod neighbour {} on {}", ip, state.pod_veth.name))?;
            }
        }

        tracing::debug!(
            pod_ips = ?pod_ips,
            host_veth = %state.host_veth.name,
            first_invoke = state.first_invoke,
            "neighbour tables populated"
        );
        Ok(())
    }
}
