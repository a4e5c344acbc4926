//! Tune mode and first-invocation resolution.
//!
//! Every interface attach is its own process, so the decision is recomputed
//! from kernel state on each ADD and never cached.

use crate::networking::netlink::RT_TABLE_MAIN;
use crate::utils::constants::{DEFAULT_POD_FIRST_IFACE, POD_RULE_TABLE_BASE, UNDERLAY_VETH};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Mode as configured, before resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TuneMode {
    Underlay,
    Overlay,
    #[serde(alias = "disabled")]
    Disable,
    #[default]
    Auto,
}

impl fmt::Display for TuneMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TuneMode::Underlay => "underlay",
            TuneMode::Overlay => "overlay",
            TuneMode::Disable => "disable",
            TuneMode::Auto => "auto",
        };
        f.write_str(s)
    }
}

/// Mode after resolution. `Auto` never survives past `resolve`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    Underlay,
    Overlay,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Underlay => f.write_str("underlay"),
            Mode::Overlay => f.write_str("overlay"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Tuning disabled: pass the previous result through untouched.
    Skip,
    Tune { mode: Mode, first_invoke: bool },
}

/// What the resolver needs to know about this invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Observed {
    /// The current interface is the pod's configured first interface.
    pub is_first_iface: bool,
    /// The auxiliary underlay veth already exists in the pod.
    pub aux_veth_exists: bool,
    /// The current interface is the first entry of the pod's NIC list.
    pub is_first_pod_nic: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ModeError {
    #[error(
        "tune_mode is underlay but {veth} is missing from the pod, the first interface {first} must be tuned before {iface}",
        veth = UNDERLAY_VETH
    )]
    UnderlayVethMissing { iface: String, first: String },

    #[error("tune_mode overlay cannot tune the pod's first interface {iface}")]
    OverlayFirstInterface { iface: String },

    #[error(
        "tune_mode is overlay but {veth} exists in the pod, {iface} was attached after an underlay interface",
        veth = UNDERLAY_VETH
    )]
    OverlayVethPresent { iface: String },
}

/// Decide the effective mode and whether this call owns the pod-wide setup.
pub fn resolve(
    configured: TuneMode,
    obs: Observed,
    iface: &str,
    first_iface: &str,
) -> Result<Resolution, ModeError> {
    let tune = |mode, first_invoke| Ok(Resolution::Tune { mode, first_invoke });

    match (configured, obs.is_first_iface, obs.aux_veth_exists) {
        (TuneMode::Disable, _, _) => Ok(Resolution::Skip),

        (TuneMode::Auto, true, _) => tune(Mode::Underlay, true),
        (TuneMode::Auto, false, true) => tune(Mode::Underlay, false),
        (TuneMode::Auto, false, false) => tune(Mode::Overlay, obs.is_first_pod_nic),

        (TuneMode::Underlay, true, _) => tune(Mode::Underlay, true),
        (TuneMode::Underlay, false, true) => tune(Mode::Underlay, false),
        (TuneMode::Underlay, false, false) => Err(ModeError::UnderlayVethMissing {
            iface: iface.to_string(),
            first: first_iface.to_string(),
        }),

        (TuneMode::Overlay, true, _) => Err(ModeError::OverlayFirstInterface {
            iface: iface.to_string(),
        }),
        (TuneMode::Overlay, false, true) => Err(ModeError::OverlayVethPresent {
            iface: iface.to_string(),
        }),
        (TuneMode::Overlay, false, false) => tune(Mode::Overlay, obs.is_first_pod_nic),
    }
}

/// Policy routing table owned by `current`.
///
/// The overlay CNI's interface keeps the main table, the first NIC spiderpool
/// hands out gets the base table and every later NIC gets base plus its
/// position. `None` means the pod has no NIC record for `current`, which
/// callers treat as fatal.
pub fn rule_table(current: &str, pod_nics: &[String]) -> Option<u32> {
    if pod_nics.is_empty() {
        return None;
    }
    if current == DEFAULT_POD_FIRST_IFACE {
        return Some(RT_TABLE_MAIN);
    }
    let position = pod_nics.iter().position(|nic| nic == current)?;
    u32::try_from(position)
        .ok()
        .map(|offset| POD_RULE_TABLE_BASE + offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nics(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn observed(is_first_iface: bool, aux_veth_exists: bool) -> Observed {
        Observed {
            is_first_iface,
            aux_veth_exists,
            is_first_pod_nic: false,
        }
    }

    #[test]
    fn decision_table_is_complete() {
        use Mode::*;
        let ok = |mode, first_invoke| Some(Resolution::Tune { mode, first_invoke });
        let cases = [
            (TuneMode::Auto, true, false, ok(Underlay, true)),
            (TuneMode::Auto, true, true, ok(Underlay, true)),
            (TuneMode::Auto, false, true, ok(Underlay, false)),
            (TuneMode::Auto, false, false, ok(Overlay, false)),
            (TuneMode::Underlay, true, false, ok(Underlay, true)),
            (TuneMode::Underlay, true, true, ok(Underlay, true)),
            (TuneMode::Underlay, false, true, ok(Underlay, false)),
            (TuneMode::Underlay, false, false, None),
            (TuneMode::Overlay, true, false, None),
            (TuneMode::Overlay, true, true, None),
            (TuneMode::Overlay, false, true, None),
            (TuneMode::Overlay, false, false, ok(Overlay, false)),
            (TuneMode::Disable, true, true, Some(Resolution::Skip)),
            (TuneMode::Disable, true, false, Some(Resolution::Skip)),
            (TuneMode::Disable, false, true, Some(Resolution::Skip)),
            (TuneMode::Disable, false, false, Some(Resolution::Skip)),
        ];
        for (mode, first, aux, want) in cases {
            let got = resolve(mode, observed(first, aux), "net1", "eth0").ok();
            assert_eq!(got, want, "mode={} first={} aux={}", mode, first, aux);
        }
    }

    #[test]
    fn overlay_first_invoke_follows_pod_nic_order() {
        let obs = Observed {
            is_first_iface: false,
            aux_veth_exists: false,
            is_first_pod_nic: true,
        };
        for mode in [TuneMode::Auto, TuneMode::Overlay] {
            assert_eq!(
                resolve(mode, obs, "net1", "eth0").unwrap(),
                Resolution::Tune {
                    mode: Mode::Overlay,
                    first_invoke: true
                }
            );
        }
    }

    #[test]
    fn mode_errors_name_the_interface() {
        let err = resolve(TuneMode::Underlay, observed(false, false), "net1", "eth0").unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("net1") && msg.contains("veth0"), "{}", msg);
    }

    #[test]
    fn rule_table_numbering() {
        let list = nics(&["eth0", "net1", "net2"]);
        assert_eq!(rule_table("eth0", &list), Some(RT_TABLE_MAIN));
        assert_eq!(rule_table("net1", &list), Some(POD_RULE_TABLE_BASE + 1));
        assert_eq!(rule_table("net2", &list), Some(POD_RULE_TABLE_BASE + 2));

        let underlay = nics(&["net1", "net2"]);
        assert_eq!(rule_table("net1", &underlay), Some(POD_RULE_TABLE_BASE));
        assert_eq!(rule_table("net2", &underlay), Some(POD_RULE_TABLE_BASE + 1));
    }

    #[test]
    fn rule_table_missing_record() {
        assert_eq!(rule_table("eth0", &[]), None);
        assert_eq!(rule_table("net9", &nics(&["net1"])), None);
    }

    #[test]
    fn tune_mode_accepts_both_disable_spellings() {
        let a: TuneMode = serde_json::from_str("\"disable\"").unwrap();
        let b: TuneMode = serde_json::from_str("\"disabled\"").unwrap();
        assert_eq!(a, TuneMode::Disable);
        assert_eq!(b, TuneMode::Disable);
        assert!(serde_json::from_str::<TuneMode>("\"bridge\"").is_err());
    }
}
