use crate::coordinator::mode::rule_table;
use crate::coordinator::state::RuntimeState;
use crate::coordinator::{Context, Coordinator, CoordinatorError, CoordinatorResult, PodNamespace};
use crate::networking::address::{addresses_by_interface, max_mask_net};
use crate::networking::netlink::RT_TABLE_MAIN;
use crate::networking::route::{
    add_route, default_route_interface, delete_stale_routes_to, move_route_table, routes_of_device,
};
use crate::networking::rule::{add_from_rule, add_to_rule, del_from_rule, del_to_rule, ensure_from_all_rule};
use crate::networking::Netlink;
use crate::utils::constants::HOST_RULE_PRIORITY;
use ipnet::IpNet;
use netlink_packet_route::route::RouteScope;

impl<N, P> Coordinator<N, P>
where
    N: Netlink,
    P: PodNamespace,
{
    /// Tables a pod-side route goes into.
    fn pod_tables(state: &RuntimeState) -> Vec<u32> {
        let mut tables = vec![state.current_rule_table];
        if state.mirror_to_main() {
            tables.push(RT_TABLE_MAIN);
        }
        tables
    }

    /// Node addresses become link routes through the pod veth; pod
    /// addresses become link routes through the host veth in the host table.
    pub(crate) async fn install_host_routes(&self, state: &RuntimeState) -> CoordinatorResult<()> {
        for table in Self::pod_tables(state) {
            for ip in &state.host_ip_route_for_pod {
                let dst = max_mask_net(*ip);
                add_route(&self.pod, table, RouteScope::Link, &state.pod_veth.name, None, dst, None, None)
                    .await
                    .context(format!("add pod route {} dev {} table {}", dst, state.pod_veth.name, table))?;
            }
        }

        for addr in &state.current_address {
            let dst = max_mask_net(addr.ip);
            delete_stale_routes_to(&self.host, state.host_rule_table, dst, state.host_veth.index)
                .await
                .context(format!("clear stale host routes to {} in table {}", dst, state.host_rule_table))?;
            add_route(
                &self.host,
                state.host_rule_table,
                RouteScope::Link,
                &state.host_veth.name,
                None,
                dst,
                None,
                None,
            )
            .await
            .context(format!("add host route {} dev {}", dst, state.host_veth.name))?;
            add_to_rule(&self.host, dst, state.host_rule_table)
                .await
                .context(format!("add host rule to {} table {}", dst, state.host_rule_table))?;
        }

        ensure_from_all_rule(&self.host, state.host_rule_table, HOST_RULE_PRIORITY, state.ip_family)
            .await
            .context(format!("repair host rule from all table {}", state.host_rule_table))?;
        Ok(())
    }

    /// Cluster, service and extra prefixes go via the node over the pod veth.
    pub(crate) async fn install_hijack_routes(&self, state: &RuntimeState) -> CoordinatorResult<()> {
        for table in Self::pod_tables(state) {
            for cidr in &state.hijack_cidr {
                let known = match cidr {
                    IpNet::V4(_) => state.v4_gateway.is_some(),
                    IpNet::V6(_) => state.v6_gateway.is_some(),
                };
                if !known {
                    tracing::debug!(%cidr, "no gateway of this family, skipping hijack route");
                    continue;
                }
                add_route(
                    &self.pod,
                    table,
                    RouteScope::Universe,
                    &state.pod_veth.name,
                    None,
                    *cidr,
                    state.v4_gateway,
                    state.v6_gateway,
                )
                .await
                .context(format!("add hijack route {} table {}", cidr, table))?;
            }
        }
        Ok(())
    }

    /// Carve `device`'s main-table routes into `table` and steer its traffic
    /// there with to/from rules.
    async fn carve_into_table(&self, device: &str, table: u32, state: &RuntimeState) -> CoordinatorResult<()> {
        let routes = routes_of_device(&self.pod, device, RT_TABLE_MAIN, state.ip_family)
            .await
            .context(format!("list routes of {}", device))?;
        for dst in routes.iter().filter_map(|r| r.destination) {
            add_to_rule(&self.pod, dst, table)
                .await
                .context(format!("add rule to {} table {}", dst, table))?;
        }

        let addrs = addresses_by_interface(&self.pod, device, state.ip_family)
            .await
            .context(format!("list addresses of {}", device))?;
        for addr in &addrs {
            let src = max_mask_net(addr.ip);
            add_from_rule(&self.pod, src, table)
                .await
                .context(format!("add rule from {} table {}", src, table))?;
        }

        move_route_table(&self.pod, device, RT_TABLE_MAIN, table, state.ip_family)
            .await
            .context(format!("move routes of {} from main to table {}", device, table))
    }

    /// Undo `carve_into_table` for `device`: drop its rules and bring its
    /// routes back from `table` to main.
    async fn restore_to_main(&self, device: &str, table: u32, state: &RuntimeState) -> CoordinatorResult<()> {
        let routes = routes_of_device(&self.pod, device, table, state.ip_family)
            .await
            .context(format!("list routes of {} in table {}", device, table))?;
        for dst in routes.iter().filter_map(|r| r.destination) {
            del_to_rule(&self.pod, dst, table)
                .await
                .context(format!("delete rule to {} table {}", dst, table))?;
        }

        let addrs = addresses_by_interface(&self.pod, device, state.ip_family)
            .await
            .context(format!("list addresses of {}", device))?;
        for addr in &addrs {
            let src = max_mask_net(addr.ip);
            del_from_rule(&self.pod, src, table)
                .await
                .context(format!("delete rule from {} table {}", src, table))?;
        }

        move_route_table(&self.pod, device, table, RT_TABLE_MAIN, state.ip_family)
            .await
            .context(format!("move routes of {} from table {} to main", device, table))
    }

    /// Leave exactly one interface holding the pod's default route; every
    /// other tuned interface keeps working through its own table.
    pub(crate) async fn promote_default_route(
        &self,
        state: &RuntimeState,
        configured: Option<&str>,
    ) -> CoordinatorResult<()> {
        let current = state.current_interface.as_str();
        let pod_default =
            match default_route_interface(&self.pod, Some(current), state.ip_family).await {
                Ok(name) => name,
                Err(e) if e.is_not_found() => {
                    tracing::info!(iface = current, "pod has no other default route, nothing to tune");
                    return Ok(());
                }
                Err(e) => return Err(e).context("find pod default route interface"),
            };
        let wanted = configured.unwrap_or(current);

        tracing::info!(
            current,
            pod_default = %pod_default,
            wanted,
            table = state.current_rule_table,
            "tuning pod default route"
        );

        if wanted == current {
            // The current interface takes over main; the old default moves out.
            return self
                .carve_into_table(&pod_default, state.current_rule_table, state)
                .await;
        }

        self.carve_into_table(current, state.current_rule_table, state).await?;
        if wanted == pod_default {
            return Ok(());
        }

        // A third interface was asked for: bring it back from its own table.
        let table = rule_table(wanted, &state.pod_nics).ok_or_else(|| CoordinatorError::RuleTable {
            iface: wanted.to_string(),
            pod_nics: state.pod_nics.clone(),
        })?;
        if table == RT_TABLE_MAIN {
            return Ok(());
        }
        self.restore_to_main(wanted, table, state).await
    }
}
