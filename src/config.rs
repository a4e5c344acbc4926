//! Network configuration read from stdin, validated and merged with the
//! cluster defaults the IPAM agent serves.

use crate::agent::CoordinatorConfig;
use crate::coordinator::hwaddr;
use crate::coordinator::mode::TuneMode;
use crate::ipchecking::{DetectOptions, ProbeOptions};
use crate::utils::constants::{
    CONFLICT_ATTEMPT_TIMEOUT_MS, DEFAULT_AGENT_SOCKET, DEFAULT_CONFLICT_CEILING,
    DEFAULT_CONFLICT_RETRIES, DEFAULT_GATEWAY_CEILING, DEFAULT_GATEWAY_INTERVAL,
    DEFAULT_GATEWAY_RETRIES, DEFAULT_HOST_RULE_TABLE, DEFAULT_LOG_FILE, DEFAULT_POD_FIRST_IFACE,
};
use ipnet::IpNet;
use serde::Deserialize;
use std::time::Duration;

/// rp_filter value meaning "leave the kernel setting alone".
pub const RP_FILTER_UNSET: i32 = -1;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to decode network config: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid mac_prefix {0:?}, expected two hex octets such as \"0a:1b\"")]
    MacPrefix(String),

    #[error("invalid {field} entry {value:?}: {reason}")]
    Cidr {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("rp_filter must be one of -1, 0, 1, 2, got {0}")]
    RpFilter(i32),

    #[error("host_rule_table {0} is not a valid routing table id")]
    HostRuleTable(i64),

    #[error("invalid duration for {field}: {value:?}: {reason}")]
    Duration {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("{field} must be greater than 0, got {value}")]
    Retries { field: &'static str, value: i64 },

    #[error("prevResult is required, coordinator must run chained after an IPAM plugin")]
    MissingPrevResult,
}

pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    pub log_level: String,
    pub log_file_path: String,
    /// MiB
    pub log_file_max_size: u64,
    /// days
    pub log_file_max_age: u64,
    pub log_file_max_count: u32,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file_path: DEFAULT_LOG_FILE.to_string(),
            log_file_max_size: 100,
            log_file_max_age: 30,
            log_file_max_count: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct IpConflictConf {
    #[serde(default)]
    pub enabled: Option<bool>,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub retries: Option<i64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DetectOptionsConf {
    #[serde(default)]
    pub retries: Option<i64>,
    #[serde(default)]
    pub interval: Option<String>,
    #[serde(default)]
    pub timeout: Option<String>,
}

/// The JSON network configuration as the runtime hands it over.
#[derive(Debug, Clone, Deserialize)]
pub struct NetConf {
    #[serde(rename = "cniVersion", default)]
    pub cni_version: String,
    #[serde(default)]
    pub name: String,
    #[serde(rename = "type", default)]
    pub plugin_type: String,
    #[serde(rename = "prevResult", default)]
    pub prev_result: Option<serde_json::Value>,

    #[serde(default)]
    pub only_hardware: bool,
    pub detect_gateway: Option<bool>,
    pub mac_prefix: Option<String>,
    pub pod_first_iface: Option<String>,
    pub cluster_cidr: Option<Vec<String>>,
    pub service_cidr: Option<Vec<String>>,
    pub extra_cidr: Option<Vec<String>>,
    pub tune_pod_routes: Option<bool>,
    pub pod_default_route_nic: Option<String>,
    pub tune_mode: Option<TuneMode>,
    pub host_rule_table: Option<i64>,
    pub rp_filter: Option<i32>,
    #[serde(default)]
    pub ip_conflict: IpConflictConf,
    #[serde(default)]
    pub detect_options: DetectOptionsConf,
    #[serde(default)]
    pub log_options: LogOptions,
    pub ipam_unix_socket_path: Option<String>,
}

/// Effective settings for one invocation.
#[derive(Debug, Clone)]
pub struct Config {
    pub cni_version: String,
    pub only_hardware: bool,
    pub detect_gateway: bool,
    pub detect_ip_conflict: bool,
    pub mac_prefix: Option<[u8; 2]>,
    pub pod_first_iface: String,
    /// cluster + service + extra CIDRs, in that order.
    pub hijack_cidr: Vec<IpNet>,
    pub tune_pod_routes: bool,
    pub pod_default_route_nic: Option<String>,
    pub tune_mode: TuneMode,
    pub host_rule_table: u32,
    pub rp_filter: i32,
    pub pod_nics: Vec<String>,
    pub detect: DetectOptions,
}

impl NetConf {
    pub fn parse(stdin: &[u8]) -> ConfigResult<Self> {
        Ok(serde_json::from_slice(stdin)?)
    }

    pub fn socket_path(&self) -> &str {
        self.ipam_unix_socket_path
            .as_deref()
            .filter(|p| !p.is_empty())
            .unwrap_or(DEFAULT_AGENT_SOCKET)
    }

    /// Validate stdin values and fill the gaps from `agent`. Stdin wins
    /// wherever both set a field.
    pub fn resolve(&self, agent: Option<&CoordinatorConfig>) -> ConfigResult<Config> {
        let fallback = CoordinatorConfig::default();
        let agent = agent.unwrap_or(&fallback);

        let rp_filter = self.rp_filter.or(agent.pod_rp_filter).unwrap_or(RP_FILTER_UNSET);
        if !(-1..=2).contains(&rp_filter) {
            return Err(ConfigError::RpFilter(rp_filter));
        }

        let mac_prefix = match self.mac_prefix.as_ref().or(agent.pod_mac_prefix.as_ref()) {
            Some(p) if !p.is_empty() => {
                Some(hwaddr::parse_prefix(p).ok_or_else(|| ConfigError::MacPrefix(p.clone()))?)
            }
            _ => None,
        };

        let host_rule_table = match self.host_rule_table.or(agent.host_rule_table) {
            None => DEFAULT_HOST_RULE_TABLE,
            Some(t) => u32::try_from(t)
                .ok()
                .filter(|t| *t > 0)
                .ok_or(ConfigError::HostRuleTable(t))?,
        };

        let mut hijack_cidr = parse_cidrs(
            "cluster_cidr",
            self.cluster_cidr.as_deref().unwrap_or(&agent.cluster_cidr),
        )?;
        hijack_cidr.extend(parse_cidrs(
            "service_cidr",
            self.service_cidr.as_deref().unwrap_or(&agent.service_cidr),
        )?);
        hijack_cidr.extend(parse_cidrs(
            "extra_cidr",
            self.extra_cidr.as_deref().unwrap_or(&agent.hijack_cidr),
        )?);

        let conflict = ProbeOptions {
            retries: retries("ip_conflict.retries", self.ip_conflict.retries, DEFAULT_CONFLICT_RETRIES)?,
            timeout: Duration::from_millis(CONFLICT_ATTEMPT_TIMEOUT_MS),
            ceiling: duration(
                "ip_conflict.interval",
                self.ip_conflict.interval.as_deref(),
                DEFAULT_CONFLICT_CEILING,
            )?,
        };
        let gateway = ProbeOptions {
            retries: retries("detect_options.retries", self.detect_options.retries, DEFAULT_GATEWAY_RETRIES)?,
            timeout: duration(
                "detect_options.interval",
                self.detect_options.interval.as_deref(),
                DEFAULT_GATEWAY_INTERVAL,
            )?,
            ceiling: duration(
                "detect_options.timeout",
                self.detect_options.timeout.as_deref(),
                DEFAULT_GATEWAY_CEILING,
            )?,
        };

        Ok(Config {
            cni_version: self.cni_version.clone(),
            only_hardware: self.only_hardware,
            detect_gateway: self.detect_gateway.or(agent.detect_gateway).unwrap_or(false),
            detect_ip_conflict: self
                .ip_conflict
                .enabled
                .or(agent.detect_ip_conflict)
                .unwrap_or(false),
            mac_prefix,
            pod_first_iface: self
                .pod_first_iface
                .clone()
                .filter(|s| !s.is_empty())
                .unwrap_or_else(|| DEFAULT_POD_FIRST_IFACE.to_string()),
            hijack_cidr,
            tune_pod_routes: self.tune_pod_routes.or(agent.tune_pod_routes).unwrap_or(true),
            pod_default_route_nic: self
                .pod_default_route_nic
                .clone()
                .or_else(|| agent.pod_default_route_nic.clone())
                .filter(|s| !s.is_empty()),
            tune_mode: self.tune_mode.or(agent.tune_mode).unwrap_or_default(),
            host_rule_table,
            rp_filter,
            pod_nics: agent.pod_nics.clone(),
            detect: DetectOptions { conflict, gateway },
        })
    }
}

fn parse_cidrs(field: &'static str, values: &[String]) -> ConfigResult<Vec<IpNet>> {
    values
        .iter()
        .map(|v| {
            v.trim().parse::<IpNet>().map_err(|e| ConfigError::Cidr {
                field,
                value: v.clone(),
                reason: e.to_string(),
            })
        })
        .collect()
}

fn retries(field: &'static str, value: Option<i64>, default: u32) -> ConfigResult<u32> {
    match value {
        None => Ok(default),
        Some(v) => u32::try_from(v)
            .ok()
            .filter(|n| *n > 0)
            .ok_or(ConfigError::Retries { field, value: v }),
    }
}

fn duration(field: &'static str, value: Option<&str>, default: &str) -> ConfigResult<Duration> {
    let raw = value.filter(|v| !v.is_empty()).unwrap_or(default);
    humantime::parse_duration(raw).map_err(|e| ConfigError::Duration {
        field,
        value: raw.to_string(),
        reason: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conf(extra: &str) -> NetConf {
        let json = format!(
            r#"{{"cniVersion":"1.0.0","name":"macvlan","type":"coordinator"{}}}"#,
            extra
        );
        NetConf::parse(json.as_bytes()).unwrap()
    }

    #[test]
    fn defaults_without_agent() {
        let cfg = conf("").resolve(None).unwrap();
        assert_eq!(cfg.tune_mode, TuneMode::Auto);
        assert_eq!(cfg.pod_first_iface, "eth0");
        assert_eq!(cfg.host_rule_table, 500);
        assert_eq!(cfg.rp_filter, RP_FILTER_UNSET);
        assert!(cfg.tune_pod_routes);
        assert!(!cfg.detect_gateway && !cfg.detect_ip_conflict);
        assert_eq!(cfg.detect.conflict.retries, 3);
        assert_eq!(cfg.detect.conflict.timeout, Duration::from_millis(100));
        assert_eq!(cfg.detect.conflict.ceiling, Duration::from_secs(1));
        assert_eq!(cfg.detect.gateway.timeout, Duration::from_millis(100));
    }

    #[test]
    fn rp_filter_accepts_only_known_values() {
        for v in [-1, 0, 1, 2] {
            let cfg = conf(&format!(r#","rp_filter":{}"#, v)).resolve(None).unwrap();
            assert_eq!(cfg.rp_filter, v);
        }
        for v in [-2, 3, 100] {
            let err = conf(&format!(r#","rp_filter":{}"#, v)).resolve(None).unwrap_err();
            assert!(matches!(err, ConfigError::RpFilter(x) if x == v));
            assert!(err.to_string().contains("rp_filter"));
        }
    }

    #[test]
    fn invalid_mac_prefix_is_rejected() {
        let err = conf(r#","mac_prefix":"zz:00""#).resolve(None).unwrap_err();
        assert!(matches!(err, ConfigError::MacPrefix(_)));
        let cfg = conf(r#","mac_prefix":"0a-1b""#).resolve(None).unwrap();
        assert_eq!(cfg.mac_prefix, Some([0x0a, 0x1b]));
    }

    #[test]
    fn invalid_cidr_names_the_field() {
        let err = conf(r#","service_cidr":["10.233.0.0/18","nope"]"#)
            .resolve(None)
            .unwrap_err();
        match err {
            ConfigError::Cidr { field, value, .. } => {
                assert_eq!(field, "service_cidr");
                assert_eq!(value, "nope");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn ip_conflict_settings_are_validated() {
        assert!(matches!(
            conf(r#","ip_conflict":{"enabled":true,"retries":0}"#).resolve(None),
            Err(ConfigError::Retries { .. })
        ));
        assert!(matches!(
            conf(r#","ip_conflict":{"enabled":true,"interval":"soon"}"#).resolve(None),
            Err(ConfigError::Duration { .. })
        ));
        let cfg = conf(r#","ip_conflict":{"enabled":true,"interval":"2s","retries":5}"#)
            .resolve(None)
            .unwrap();
        assert!(cfg.detect_ip_conflict);
        assert_eq!(cfg.detect.conflict.retries, 5);
        assert_eq!(cfg.detect.conflict.ceiling, Duration::from_secs(2));
    }

    #[test]
    fn stdin_overrides_agent_defaults() {
        let agent = CoordinatorConfig {
            cluster_cidr: vec!["10.244.0.0/16".into()],
            service_cidr: vec!["10.96.0.0/12".into()],
            hijack_cidr: vec!["169.254.25.10/32".into()],
            pod_mac_prefix: Some("0a:1b".into()),
            tune_mode: Some(TuneMode::Overlay),
            host_rule_table: Some(600),
            pod_rp_filter: Some(0),
            pod_nics: vec!["eth0".into(), "net1".into()],
            ..Default::default()
        };
        let cfg = conf(r#","tune_mode":"underlay","service_cidr":["10.233.0.0/18"]"#)
            .resolve(Some(&agent))
            .unwrap();
        assert_eq!(cfg.tune_mode, TuneMode::Underlay);
        assert_eq!(cfg.host_rule_table, 600);
        assert_eq!(cfg.rp_filter, 0);
        assert_eq!(cfg.mac_prefix, Some([0x0a, 0x1b]));
        assert_eq!(cfg.pod_nics, vec!["eth0".to_string(), "net1".to_string()]);
        let hijack: Vec<String> = cfg.hijack_cidr.iter().map(|c| c.to_string()).collect();
        assert_eq!(hijack, vec!["10.244.0.0/16", "10.233.0.0/18", "169.254.25.10/32"]);
    }

    #[test]
    fn unused_fields_are_accepted() {
        let cfg = conf(r#","iface_prefix":"net","pod_first_iface":"eth1""#).resolve(None).unwrap();
        assert_eq!(cfg.pod_first_iface, "eth1");
    }

    #[test]
    fn unknown_tune_mode_fails_to_decode() {
        let err = NetConf::parse(br#"{"cniVersion":"1.0.0","tune_mode":"bridge"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Decode(_)));
    }

    #[test]
    fn log_options_fill_missing_fields() {
        let c = conf(r#","log_options":{"log_level":"debug"}"#);
        assert_eq!(c.log_options.log_level, "debug");
        assert_eq!(c.log_options.log_file_path, DEFAULT_LOG_FILE);
        assert_eq!(c.log_options.log_file_max_count, 10);
    }
}
