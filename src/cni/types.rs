use crate::networking::IpFamily;
use ipnet::IpNet;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

pub const ERR_INVALID_ENV: u32 = 4;
pub const ERR_IO: u32 = 5;
pub const ERR_DECODING: u32 = 6;
pub const ERR_INVALID_NETCONF: u32 = 7;
pub const ERR_PLUGIN: u32 = 100;
pub const ERR_IP_CONFLICT: u32 = 101;
pub const ERR_GATEWAY_UNREACHABLE: u32 = 102;

/// The error object the runtime expects on stdout when a command fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
#[error("{msg} (code {code})")]
pub struct CniError {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub details: String,
}

impl CniError {
    pub fn new(code: u32, msg: impl Into<String>) -> Self {
        Self {
            cni_version: String::new(),
            code,
            msg: msg.into(),
            details: String::new(),
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = details.into();
        self
    }

    pub fn with_version(mut self, version: &str) -> Self {
        if self.cni_version.is_empty() {
            self.cni_version = version.to_string();
        }
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(r#"{{"code":{},"msg":"failed to encode error"}}"#, self.code)
        })
    }
}

/// Pod identity from `CNI_ARGS`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct K8sArgs {
    pub pod_name: String,
    pub pod_namespace: String,
    pub infra_container_id: String,
    pub pod_uid: String,
}

impl K8sArgs {
    /// Parse `K=V;K=V`. Unknown keys are skipped, malformed pairs are not.
    pub fn parse(raw: &str) -> Result<Self, CniError> {
        let mut args = K8sArgs::default();
        for pair in raw.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                CniError::new(ERR_INVALID_ENV, "invalid CNI_ARGS")
                    .with_details(format!("pair {:?} has no '='", pair))
            })?;
            match key {
                "K8S_POD_NAME" => args.pod_name = value.to_string(),
                "K8S_POD_NAMESPACE" => args.pod_namespace = value.to_string(),
                "K8S_POD_INFRA_CONTAINER_ID" => args.infra_container_id = value.to_string(),
                "K8S_POD_UID" => args.pod_uid = value.to_string(),
                _ => {}
            }
        }
        Ok(args)
    }

    /// `namespace/name`, for logs.
    pub fn pod(&self) -> String {
        format!("{}/{}", self.pod_namespace, self.pod_name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResultInterface {
    pub name: String,
    #[serde(default)]
    pub mac: String,
    #[serde(default)]
    pub sandbox: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ResultIp {
    pub address: IpNet,
    #[serde(default)]
    pub gateway: Option<IpAddr>,
    #[serde(default)]
    pub interface: Option<usize>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct ResultBody {
    #[serde(default)]
    interfaces: Vec<ResultInterface>,
    #[serde(default)]
    ips: Vec<ResultIp>,
}

/// The previous plugin's result. The raw JSON is kept so it can be handed
/// back to the runtime byte-for-byte in meaning.
#[derive(Debug, Clone)]
pub struct PrevResult {
    raw: serde_json::Value,
    interfaces: Vec<ResultInterface>,
    ips: Vec<ResultIp>,
}

impl PrevResult {
    pub fn from_value(raw: serde_json::Value) -> Result<Self, CniError> {
        let body: ResultBody = serde_json::from_value(raw.clone()).map_err(|e| {
            CniError::new(ERR_DECODING, "failed to parse prevResult").with_details(e.to_string())
        })?;
        Ok(Self {
            raw,
            interfaces: body.interfaces,
            ips: body.ips,
        })
    }

    pub fn ips(&self) -> &[ResultIp] {
        &self.ips
    }

    /// Family covered by all addresses in the result.
    pub fn ip_family(&self) -> Option<IpFamily> {
        let v4 = self.ips.iter().any(|ip| ip.address.addr().is_ipv4());
        let v6 = self.ips.iter().any(|ip| ip.address.addr().is_ipv6());
        match (v4, v6) {
            (true, true) => Some(IpFamily::All),
            (true, false) => Some(IpFamily::V4),
            (false, true) => Some(IpFamily::V6),
            (false, false) => None,
        }
    }

    /// Addresses assigned to `iface`. Entries without an interface index are
    /// attributed to the interface being configured.
    pub fn ips_for(&self, iface: &str) -> Vec<&ResultIp> {
        self.ips
            .iter()
            .filter(|ip| match ip.interface {
                None => true,
                Some(i) => self.interfaces.get(i).map_or(false, |intf| intf.name == iface),
            })
            .collect()
    }

    pub fn to_json(&self) -> String {
        self.raw.to_string()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct VersionInfo {
    #[serde(rename = "cniVersion")]
    pub cni_version: String,
    #[serde(rename = "supportedVersions")]
    pub supported_versions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    const PREV: &str = r#"{
        "cniVersion": "1.0.0",
        "interfaces": [
            {"name": "net1", "mac": "02:00:0a:06:00:0a", "sandbox": "/var/run/netns/p1"},
            {"name": "net2", "sandbox": "/var/run/netns/p1"}
        ],
        "ips": [
            {"address": "10.6.0.10/16", "gateway": "10.6.0.1", "interface": 0},
            {"address": "fd00:10:6::a/64", "gateway": "fd00:10:6::1", "interface": 0},
            {"address": "10.7.0.10/16", "interface": 1}
        ],
        "dns": {}
    }"#;

    #[test]
    fn k8s_args_parse() {
        let args = K8sArgs::parse(
            "IgnoreUnknown=1;K8S_POD_NAMESPACE=default;K8S_POD_NAME=nginx-0;K8S_POD_INFRA_CONTAINER_ID=abc",
        )
        .unwrap();
        assert_eq!(args.pod(), "default/nginx-0");
        assert_eq!(args.infra_container_id, "abc");
        assert!(args.pod_uid.is_empty());
        assert_eq!(K8sArgs::parse("").unwrap(), K8sArgs::default());
    }

    #[test]
    fn k8s_args_reject_bare_key() {
        let err = K8sArgs::parse("K8S_POD_NAME").unwrap_err();
        assert_eq!(err.code, ERR_INVALID_ENV);
    }

    #[test]
    fn prev_result_filters_by_interface() {
        let prev = PrevResult::from_value(serde_json::from_str(PREV).unwrap()).unwrap();
        assert_eq!(prev.ip_family(), Some(IpFamily::All));
        let net1: Vec<String> = prev.ips_for("net1").iter().map(|ip| ip.address.to_string()).collect();
        assert_eq!(net1, vec!["10.6.0.10/16", "fd00:10:6::a/64"]);
        assert_eq!(prev.ips_for("net2").len(), 1);
        assert!(prev.ips_for("eth0").is_empty());
    }

    #[test]
    fn prev_result_is_echoed_unchanged() {
        let value: serde_json::Value = serde_json::from_str(PREV).unwrap();
        let prev = PrevResult::from_value(value.clone()).unwrap();
        let back: serde_json::Value = serde_json::from_str(&prev.to_json()).unwrap();
        assert_eq!(back, value);
    }

    #[test]
    fn malformed_prev_result_is_a_decoding_error() {
        let err = PrevResult::from_value(serde_json::json!({"ips": [{"address": "bogus"}]})).unwrap_err();
        assert_eq!(err.code, ERR_DECODING);
    }

    #[test]
    fn error_json_shape() {
        let err = CniError::new(ERR_IP_CONFLICT, "ip conflict")
            .with_details("10.6.0.10 in use")
            .with_version("1.0.0");
        let v: serde_json::Value = serde_json::from_str(&err.to_json()).unwrap();
        assert_eq!(v["cniVersion"], "1.0.0");
        assert_eq!(v["code"], 101);
        assert_eq!(v["msg"], "ip conflict");
        assert_eq!(v["details"], "10.6.0.10 in use");

        let bare: serde_json::Value =
            serde_json::from_str(&CniError::new(ERR_PLUGIN, "x").to_json()).unwrap();
        assert!(bare.get("details").is_none());
    }
}
