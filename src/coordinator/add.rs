use crate::cni::types::PrevResult;
use crate::config::{Config, RP_FILTER_UNSET};
use crate::coordinator::hwaddr;
use crate::coordinator::mode::{self, Mode, Observed, Resolution};
use crate::coordinator::state::RuntimeState;
use crate::coordinator::{
    Context, Coordinator, CoordinatorError, CoordinatorResult, Invocation, PodNamespace,
};
use crate::ipchecking::{IpConfig, Target};
use crate::networking::address::{addresses_by_interface, gateway_ips, node_addresses};
use crate::networking::route::default_route_interface;
use crate::networking::sysctl::{enable_ipv6_settings, rp_filter_settings};
use crate::networking::veth::{self, VethPair};
use crate::networking::{IpFamily, Netlink};
use crate::utils::constants::UNDERLAY_VETH;
use std::net::IpAddr;

/// How an ADD ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Tuning is disabled for this network.
    Skipped,
    /// Only the MAC address was rewritten.
    HardwareOnly,
    Tuned,
}

impl<N, P> Coordinator<N, P>
where
    N: Netlink,
    P: PodNamespace,
{
    pub async fn add(
        &self,
        inv: &Invocation,
        cfg: &Config,
        prev: &PrevResult,
    ) -> CoordinatorResult<AddOutcome> {
        let ip_family = prev.ip_family().ok_or_else(|| {
            CoordinatorError::Invalid("prevResult carries no ip addresses".to_string())
        })?;
        let if_name = inv.if_name.as_str();

        let aux_veth_exists = veth::interface_exists(&self.pod, UNDERLAY_VETH)
            .await
            .context(format!("check for {} in pod", UNDERLAY_VETH))?;
        let observed = Observed {
            is_first_iface: if_name == cfg.pod_first_iface,
            aux_veth_exists,
            is_first_pod_nic: cfg.pod_nics.first().map(String::as_str) == Some(if_name),
        };
        let (mode, first_invoke) =
            match mode::resolve(cfg.tune_mode, observed, if_name, &cfg.pod_first_iface)? {
                Resolution::Skip => {
                    tracing::info!("tune mode disabled, passing result through");
                    return Ok(AddOutcome::Skipped);
                }
                Resolution::Tune { mode, first_invoke } => (mode, first_invoke),
            };
        tracing::info!(%mode, first_invoke, family = ?ip_family, "resolved tune mode");

        let pair = self.veth_pair(inv, cfg, mode, first_invoke, ip_family).await?;

        self.check_addresses(if_name, cfg, prev).await?;

        if let Some(prefix) = cfg.mac_prefix {
            self.overwrite_hw_address(if_name, prefix, prev).await?;
        }
        if cfg.only_hardware {
            tracing::info!("only_hardware set, skipping route tuning");
            return Ok(AddOutcome::HardwareOnly);
        }

        let mut state = self
            .build_state(inv, cfg, mode, first_invoke, ip_family, pair)
            .await?;

        if ip_family.has_v6() {
            self.ns
                .pod_sysctl(enable_ipv6_settings())
                .await
                .context("enable ipv6 in pod")?;
        }
        if cfg.rp_filter != RP_FILTER_UNSET {
            let ifaces = [if_name, state.pod_veth.name.as_str()];
            self.ns
                .pod_sysctl(rp_filter_settings(cfg.rp_filter, &ifaces))
                .await
                .context(format!("set rp_filter={} in pod", cfg.rp_filter))?;
        }

        self.populate_neighbours(&state).await?;

        state.current_rule_table =
            mode::rule_table(if_name, &cfg.pod_nics).ok_or_else(|| CoordinatorError::RuleTable {
                iface: if_name.to_string(),
                pod_nics: cfg.pod_nics.clone(),
            })?;
        tracing::debug!(table = state.current_rule_table, "rule table for interface");

        self.install_host_routes(&state).await?;
        self.install_hijack_routes(&state).await?;

        if cfg.tune_pod_routes && (!first_invoke || mode == Mode::Overlay) {
            self.promote_default_route(&state, cfg.pod_default_route_nic.as_deref())
                .await?;
        }

        tracing::info!(
            table = state.current_rule_table,
            host_veth = %state.host_veth.name,
            "pod network tuned"
        );
        Ok(AddOutcome::Tuned)
    }

    /// Create the auxiliary veth on the first underlay call, or find the pair
    /// that is already there.
    async fn veth_pair(
        &self,
        inv: &Invocation,
        cfg: &Config,
        mode: Mode,
        first_invoke: bool,
        family: IpFamily,
    ) -> CoordinatorResult<VethPair> {
        match (mode, first_invoke) {
            (Mode::Underlay, true) => {
                let host_name = veth::host_veth_name(&inv.container_id);
                let pair = veth::setup_veth(&self.pod, &self.host, self.ns.host_fd(), UNDERLAY_VETH, &host_name)
                    .await
                    .context(format!("create veth pair {}<->{}", UNDERLAY_VETH, host_name))?;
                self.ns.host_baseline(family).await;
                Ok(pair)
            }
            (Mode::Underlay, false) => veth::existing_pair(&self.pod, &self.host, UNDERLAY_VETH)
                .await
                .context(format!("find host peer of {}", UNDERLAY_VETH)),
            (Mode::Overlay, _) => veth::existing_pair(&self.pod, &self.host, &cfg.pod_first_iface)
                .await
                .context(format!("find host peer of overlay interface {}", cfg.pod_first_iface)),
        }
    }

    /// Duplicate-address and gateway checks for the addresses IPAM gave
    /// this interface.
    async fn check_addresses(&self, if_name: &str, cfg: &Config, prev: &PrevResult) -> CoordinatorResult<()> {
        if !cfg.detect_gateway && !cfg.detect_ip_conflict {
            return Ok(());
        }
        let configs: Vec<IpConfig> = prev
            .ips_for(if_name)
            .into_iter()
            .map(|ip| IpConfig {
                nic: if_name.to_string(),
                address: ip.address,
                gateway: ip.gateway,
                enable_gateway_detection: cfg.detect_gateway,
                enable_ip_conflict_detection: cfg.detect_ip_conflict,
            })
            .collect();
        if configs.is_empty() {
            return Ok(());
        }

        let link = self
            .pod
            .link_by_name(if_name)
            .await
            .context(format!("look up {} in pod", if_name))?;
        let mac = link.mac.ok_or_else(|| {
            CoordinatorError::Invalid(format!("{} has no hardware address to probe from", if_name))
        })?;
        let target = Target {
            iface: if_name.to_string(),
            ifindex: link.index,
            mac,
        };
        self.ns
            .detect(target, cfg.detect.clone(), configs)
            .await
            .context(format!("address checks on {}", if_name))
    }

    async fn overwrite_hw_address(&self, if_name: &str, prefix: [u8; 2], prev: &PrevResult) -> CoordinatorResult<()> {
        let Some(first) = prev.ips_for(if_name).first().map(|ip| ip.address.addr()) else {
            tracing::warn!(iface = if_name, "no address for interface, keeping its hardware address");
            return Ok(());
        };
        let mac = hwaddr::derive(prefix, first);
        let link = self
            .pod
            .link_by_name(if_name)
            .await
            .context(format!("look up {} in pod", if_name))?;
        self.pod
            .link_set_mac(link.index, mac)
            .await
            .context(format!("set hardware address of {} to {}", if_name, mac))?;
        tracing::info!(iface = if_name, %mac, ip = %first, "hardware address overwritten");
        Ok(())
    }

    async fn build_state(
        &self,
        inv: &Invocation,
        cfg: &Config,
        mode: Mode,
        first_invoke: bool,
        ip_family: IpFamily,
        pair: VethPair,
    ) -> CoordinatorResult<RuntimeState> {
        let current_address = addresses_by_interface(&self.pod, &inv.if_name, ip_family)
            .await
            .context(format!("list addresses of {}", inv.if_name))?;

        let node = node_addresses(&self.host, ip_family)
            .await
            .context("list node addresses")?;

        let host_iface = default_route_interface(&self.host, None, ip_family)
            .await
            .context("find host default route interface")?;
        let host_iface_addrs = addresses_by_interface(&self.host, &host_iface, ip_family)
            .await
            .context(format!("list addresses of host interface {}", host_iface))?;
        let (v4_gateway, v6_gateway) = gateway_ips(&self.host, &host_iface_addrs)
            .await
            .context(format!("resolve host source addresses on {}", host_iface))?;

        let mut host_ip_route_for_pod: Vec<IpAddr> = node.iter().map(|a| a.ip).collect();
        for gw in [v4_gateway.map(IpAddr::V4), v6_gateway.map(IpAddr::V6)]
            .into_iter()
            .flatten()
        {
            if !host_ip_route_for_pod.contains(&gw) {
                host_ip_route_for_pod.push(gw);
            }
        }

        Ok(RuntimeState {
            mode,
            first_invoke,
            ip_family,
            current_interface: inv.if_name.clone(),
            current_rule_table: 0,
            host_rule_table: cfg.host_rule_table,
            pod_veth: pair.pod,
            host_veth: pair.host,
            hijack_cidr: cfg.hijack_cidr.clone(),
            pod_nics: cfg.pod_nics.clone(),
            current_address,
            host_ip_route_for_pod,
            v4_gateway,
            v6_gateway,
        })
    }
}
