use crate::coordinator::{Coordinator, Invocation, PodNamespace};
use crate::networking::address::{addresses_by_interface, max_mask_net};
use crate::networking::rule::del_to_rule;
use crate::networking::{IpFamily, Netlink};

impl<N, P> Coordinator<N, P>
where
    N: Netlink,
    P: PodNamespace,
{
    /// Remove the host rules that steer the interface's addresses into the
    /// host table. Teardown never fails: whatever cannot be read or removed
    /// is logged and left to the kernel, which drops it with the namespace.
    pub async fn del(&self, inv: &Invocation, host_rule_table: u32) {
        let addrs = match addresses_by_interface(&self.pod, &inv.if_name, IpFamily::All).await {
            Ok(addrs) => addrs,
            Err(e) => {
                tracing::warn!(iface = %inv.if_name, error = %e, "cannot read pod addresses, nothing to clean");
                return;
            }
        };

        for addr in &addrs {
            let dst = max_mask_net(addr.ip);
            match del_to_rule(&self.host, dst, host_rule_table).await {
                Ok(()) => tracing::debug!(%dst, table = host_rule_table, "host rule removed"),
                Err(e) => tracing::warn!(%dst, table = host_rule_table, error = %e, "failed to remove host rule"),
            }
        }
        tracing::info!(iface = %inv.if_name, addresses = addrs.len(), "pod network released");
    }
}
