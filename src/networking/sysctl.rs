use crate::networking::error::{NetworkError, NetworkResult};
use crate::networking::netlink::IpFamily;
use std::fs;
use std::path::PathBuf;

const PROC_SYS: &str = "/proc/sys";

/// Host-wide settings applied once per node, on the first underlay invocation.
const BASELINE_V4: &[(&str, &str)] = &[
    ("net/ipv4/neigh/default/gc_thresh3", "28160"),
    ("net/ipv4/conf/all/arp_notify", "1"),
    ("net/ipv4/conf/all/forwarding", "1"),
];

const BASELINE_V6: &[(&str, &str)] = &[
    ("net/ipv6/neigh/default/gc_thresh3", "28160"),
    ("net/ipv6/conf/all/forwarding", "1"),
];

/// Writes kernel parameters under `/proc/sys` of whatever namespace the
/// calling thread is in. Keys use `/` separators so interface names that
/// contain dots (VLAN sub-interfaces) stay intact.
#[derive(Debug, Clone)]
pub struct Sysctl {
    root: PathBuf,
}

impl Default for Sysctl {
    fn default() -> Self {
        Self::new()
    }
}

impl Sysctl {
    pub fn new() -> Self {
        Self::with_root(PROC_SYS)
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn get(&self, key: &str) -> NetworkResult<String> {
        let path = self.root.join(key);
        fs::read_to_string(&path)
            .map(|v| v.trim().to_string())
            .map_err(|e| NetworkError::Io(std::io::Error::new(e.kind(), format!("read sysctl {}: {}", key, e))))
    }

    pub fn set(&self, key: &str, value: &str) -> NetworkResult<()> {
        let path = self.root.join(key);
        fs::write(&path, value).map_err(|e| {
            NetworkError::Io(std::io::Error::new(
                e.kind(),
                format!("write sysctl {}={}: {}", key, value, e),
            ))
        })?;
        tracing::debug!(key, value, "sysctl set");
        Ok(())
    }

    /// Apply every pair, stopping at the first failure.
    pub fn apply(&self, settings: &[(String, String)]) -> NetworkResult<()> {
        for (key, value) in settings {
            self.set(key, value)?;
        }
        Ok(())
    }

    /// Node baseline; failures are logged and skipped.
    pub fn apply_baseline(&self, family: IpFamily) {
        let mut settings: Vec<&(&str, &str)> = Vec::new();
        if family.has_v4() {
            settings.extend(BASELINE_V4);
        }
        if family.has_v6() {
            settings.extend(BASELINE_V6);
        }
        for (key, value) in settings {
            if let Err(e) = self.set(key, value) {
                tracing::warn!(key, value, error = %e, "failed to apply host sysctl");
            }
        }
    }
}

pub fn enable_ipv6_settings() -> Vec<(String, String)> {
    vec![
        ("net/ipv6/conf/all/disable_ipv6".to_string(), "0".to_string()),
        ("net/ipv6/conf/default/disable_ipv6".to_string(), "0".to_string()),
    ]
}

/// rp_filter for `all` plus every named interface.
pub fn rp_filter_settings(value: i32, ifaces: &[&str]) -> Vec<(String, String)> {
    std::iter::once("all")
        .chain(ifaces.iter().copied())
        .map(|iface| {
            (
                format!("net/ipv4/conf/{}/rp_filter", iface),
                value.to_string(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_proc(keys: &[&str]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        for key in keys {
            let path = dir.path().join(key);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, "0\n").unwrap();
        }
        dir
    }

    #[test]
    fn set_and_get_round_trip_through_files() {
        let dir = fake_proc(&["net/ipv4/conf/eth0.100/rp_filter"]);
        let sysctl = Sysctl::with_root(dir.path());
        sysctl.set("net/ipv4/conf/eth0.100/rp_filter", "2").unwrap();
        assert_eq!(sysctl.get("net/ipv4/conf/eth0.100/rp_filter").unwrap(), "2");
    }

    #[test]
    fn missing_key_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let sysctl = Sysctl::with_root(dir.path());
        assert!(sysctl.set("net/ipv4/conf/nope/rp_filter", "0").is_err());
    }

    #[test]
    fn baseline_skips_missing_keys() {
        let dir = fake_proc(&["net/ipv4/neigh/default/gc_thresh3", "net/ipv4/conf/all/forwarding"]);
        let sysctl = Sysctl::with_root(dir.path());
        sysctl.apply_baseline(IpFamily::All);
        assert_eq!(sysctl.get("net/ipv4/neigh/default/gc_thresh3").unwrap(), "28160");
        assert_eq!(sysctl.get("net/ipv4/conf/all/forwarding").unwrap(), "1");
    }

    #[test]
    fn rp_filter_covers_all_and_named_interfaces() {
        let settings = rp_filter_settings(0, &["net1", "veth0"]);
        let keys: Vec<&str> = settings.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(
            keys,
            vec![
                "net/ipv4/conf/all/rp_filter",
                "net/ipv4/conf/net1/rp_filter",
                "net/ipv4/conf/veth0/rp_filter",
            ]
        );
    }
}
