//! CNI protocol surface: command selection, result passthrough and the
//! error object handed back to the runtime.

pub mod types;

use crate::agent::AgentClient;
use crate::config::{ConfigError, NetConf};
use crate::coordinator::mode::TuneMode;
use crate::coordinator::{Coordinator, CoordinatorError, Invocation, PodNetns};
use crate::ipchecking::DetectError;
use crate::networking::{NetNs, NetworkError};
use crate::utils::constants::SUPPORTED_VERSIONS;
use std::path::PathBuf;
use std::str::FromStr;
use types::{
    CniError, K8sArgs, PrevResult, VersionInfo, ERR_DECODING, ERR_GATEWAY_UNREACHABLE,
    ERR_INVALID_ENV, ERR_INVALID_NETCONF, ERR_IO, ERR_IP_CONFLICT, ERR_PLUGIN,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CniCommand {
    Add,
    Del,
    Check,
    Version,
}

impl FromStr for CniCommand {
    type Err = CniError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(CniCommand::Add),
            "DEL" => Ok(CniCommand::Del),
            "CHECK" => Ok(CniCommand::Check),
            "VERSION" => Ok(CniCommand::Version),
            other => Err(CniError::new(ERR_INVALID_ENV, format!("unknown CNI_COMMAND {:?}", other))),
        }
    }
}

/// Inputs the runtime passes through the environment.
#[derive(Debug, Clone)]
pub struct CmdArgs {
    pub command: CniCommand,
    pub container_id: String,
    pub netns: String,
    pub if_name: String,
    pub args: K8sArgs,
    pub path: String,
}

impl CmdArgs {
    /// ADD and DEL need the container, namespace and interface.
    fn require(&self, field: &str, value: &str, env: &str) -> Result<(), CniError> {
        if value.is_empty() {
            return Err(CniError::new(ERR_INVALID_ENV, format!("required env variable {} is missing", env))
                .with_details(format!("{} is empty", field)));
        }
        Ok(())
    }

    fn invocation(&self) -> Result<Invocation, CniError> {
        self.require("container id", &self.container_id, "CNI_CONTAINERID")?;
        self.require("interface name", &self.if_name, "CNI_IFNAME")?;
        Ok(Invocation {
            container_id: self.container_id.clone(),
            if_name: self.if_name.clone(),
            netns: PathBuf::from(&self.netns),
            pod: self.args.pod(),
        })
    }
}

impl From<ConfigError> for CniError {
    fn from(e: ConfigError) -> Self {
        let code = match e {
            ConfigError::Decode(_) => ERR_DECODING,
            _ => ERR_INVALID_NETCONF,
        };
        CniError::new(code, e.to_string())
    }
}

fn network_code(e: &NetworkError) -> u32 {
    match e {
        NetworkError::Io(_) => ERR_IO,
        _ => ERR_PLUGIN,
    }
}

impl From<CoordinatorError> for CniError {
    fn from(e: CoordinatorError) -> Self {
        let code = match &e {
            CoordinatorError::Cni(inner) => return inner.clone(),
            CoordinatorError::Config(ConfigError::Decode(_)) => ERR_DECODING,
            CoordinatorError::Config(_)
            | CoordinatorError::Mode(_)
            | CoordinatorError::RuleTable { .. }
            | CoordinatorError::Invalid(_) => ERR_INVALID_NETCONF,
            CoordinatorError::Detect { source, .. } => match source {
                DetectError::IpConflict { .. } => ERR_IP_CONFLICT,
                DetectError::GatewayUnreachable { .. } => ERR_GATEWAY_UNREACHABLE,
                DetectError::Network(n) => network_code(n),
                _ => ERR_PLUGIN,
            },
            CoordinatorError::Network { source, .. } => network_code(source),
            CoordinatorError::Agent(_) => ERR_PLUGIN,
        };
        CniError::new(code, e.to_string())
    }
}

fn version_json() -> String {
    let info = VersionInfo {
        cni_version: SUPPORTED_VERSIONS[SUPPORTED_VERSIONS.len() - 1].to_string(),
        supported_versions: SUPPORTED_VERSIONS.iter().map(|v| v.to_string()).collect(),
    };
    serde_json::to_string(&info).unwrap_or_default()
}

/// Run one command. `Ok` carries what goes to stdout.
pub async fn dispatch(args: &CmdArgs, stdin: &[u8]) -> Result<String, CniError> {
    if args.command == CniCommand::Version {
        return Ok(version_json());
    }

    let conf = NetConf::parse(stdin)?;
    let version = conf.cni_version.clone();
    let result = match args.command {
        CniCommand::Add => cmd_add(args, &conf).await,
        CniCommand::Del => cmd_del(args, &conf).await.map(|()| String::new()),
        CniCommand::Check => Ok(String::new()),
        CniCommand::Version => Ok(version_json()),
    };
    result.map_err(|e| e.with_version(&version))
}

async fn cmd_add(args: &CmdArgs, conf: &NetConf) -> Result<String, CniError> {
    let inv = args.invocation()?;
    let raw_prev = conf
        .prev_result
        .clone()
        .ok_or_else(|| CniError::from(ConfigError::MissingPrevResult))?;
    let prev = PrevResult::from_value(raw_prev)?;

    // Disabled in stdin wins over anything the agent says.
    if conf.tune_mode == Some(TuneMode::Disable) {
        tracing::info!("tune mode disabled, passing result through");
        return Ok(prev.to_json());
    }

    let agent = AgentClient::new(conf.socket_path());
    agent.healthy().await.map_err(CoordinatorError::from)?;
    let agent_cfg = agent
        .coordinator_config(&args.args.pod_namespace, &args.args.pod_name)
        .await
        .map_err(CoordinatorError::from)?;
    let cfg = conf.resolve(Some(&agent_cfg))?;
    tracing::debug!(?cfg, "effective config");

    let pod_ns = NetNs::open(&inv.netns)
        .map_err(|e| CoordinatorError::Network { context: "open pod netns".to_string(), source: e })?;
    let host_ns = NetNs::current()
        .map_err(|e| CoordinatorError::Network { context: "open host netns".to_string(), source: e })?;
    let pod_nl = pod_ns
        .netlink()
        .await
        .map_err(|e| CoordinatorError::Network { context: "netlink in pod netns".to_string(), source: e })?;
    let host_nl = crate::networking::NetlinkHandle::new()
        .map_err(|e| CoordinatorError::Network { context: "netlink in host netns".to_string(), source: e })?;

    tracing::debug!(pod_netns = %pod_ns.path().display(), host_netns = %host_ns.path().display(), "netlink handles ready");

    let coordinator = Coordinator::new(host_nl, pod_nl, PodNetns::new(pod_ns, host_ns));
    let outcome = coordinator.add(&inv, &cfg, &prev).await?;
    tracing::debug!(?outcome, "add finished");
    Ok(prev.to_json())
}

async fn cmd_del(args: &CmdArgs, conf: &NetConf) -> Result<(), CniError> {
    let inv = args.invocation()?;
    if args.netns.is_empty() {
        tracing::info!("no netns given, nothing to release");
        return Ok(());
    }
    let cfg = conf.resolve(None)?;

    let pod_ns = match NetNs::open(&inv.netns) {
        Ok(ns) => ns,
        Err(e) if e.is_not_found() => {
            tracing::info!(netns = %inv.netns.display(), "pod netns already gone");
            return Ok(());
        }
        Err(e) => {
            tracing::warn!(netns = %inv.netns.display(), error = %e, "cannot open pod netns, skipping teardown");
            return Ok(());
        }
    };

    let handles = async {
        let host_ns = NetNs::current()?;
        let pod_nl = pod_ns.netlink().await?;
        let host_nl = crate::networking::NetlinkHandle::new()?;
        Ok::<_, NetworkError>((host_ns, pod_nl, host_nl))
    };
    let (host_ns, pod_nl, host_nl) = match handles.await {
        Ok(h) => h,
        Err(e) => {
            tracing::warn!(error = %e, "cannot reach kernel for teardown");
            return Ok(());
        }
    };

    Coordinator::new(host_nl, pod_nl, PodNetns::new(pod_ns, host_ns))
        .del(&inv, cfg.host_rule_table)
        .await;
    Ok(())
}
