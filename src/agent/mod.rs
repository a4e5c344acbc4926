//! The node's IPAM agent, reached over a Unix-domain HTTP socket. The
//! coordinator only reads cluster-wide tuning defaults from it.

pub mod client;

use crate::coordinator::mode::TuneMode;
use serde::Deserialize;

pub use client::AgentClient;

#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("failed to connect to agent socket {path}: {source}")]
    Connect {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("agent request failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("failed to build agent request: {0}")]
    Request(#[from] hyper::http::Error),

    #[error("agent returned {status} for {path}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },

    #[error("failed to decode agent response: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("agent did not answer {path} within {timeout:?}")]
    Timeout {
        path: String,
        timeout: std::time::Duration,
    },
}

/// Cluster defaults served at `/v1/coordinator/config`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoordinatorConfig {
    #[serde(rename = "clusterCIDR")]
    pub cluster_cidr: Vec<String>,
    #[serde(rename = "serviceCIDR")]
    pub service_cidr: Vec<String>,
    #[serde(rename = "hijackCIDR")]
    pub hijack_cidr: Vec<String>,
    #[serde(rename = "podMACPrefix")]
    pub pod_mac_prefix: Option<String>,
    #[serde(rename = "podDefaultRouteNIC")]
    pub pod_default_route_nic: Option<String>,
    pub tune_pod_routes: Option<bool>,
    #[serde(rename = "podRPFilter")]
    pub pod_rp_filter: Option<i32>,
    pub host_rule_table: Option<i64>,
    pub tune_mode: Option<TuneMode>,
    pub detect_gateway: Option<bool>,
    #[serde(rename = "detectIPConflict")]
    pub detect_ip_conflict: Option<bool>,
    #[serde(rename = "podNICs")]
    pub pod_nics: Vec<String>,
}
