//! Duplicate-address and gateway reachability checks, run inside the pod's
//! network namespace before any routing is changed.
//!
//! Each address family gets its own worker thread. Within a family the
//! conflict check always finishes before the gateway check starts, and the
//! first failure across families cancels the others.

pub mod arp;
pub mod ndp;
pub mod packet;
pub mod transport;

use crate::networking::error::NetworkError;
use crate::networking::netns::{CancelToken, NetNs, NsGroup};
use arp::ArpProber;
use ipnet::IpNet;
use macaddr::MacAddr6;
use ndp::NdpProber;
use std::net::{IpAddr, Ipv6Addr};
use std::time::{Duration, Instant};
use transport::{ArpSocket, NdpSocket, PacketTransport};

const IF_INET6: &str = "/proc/thread-self/net/if_inet6";
const IFA_F_TENTATIVE: u32 = 0x40;
const IPV6_READY_TIMEOUT: Duration = Duration::from_secs(10);
const IPV6_READY_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, thiserror::Error)]
pub enum DetectError {
    #[error("pod's interface {iface} with an conflicting ip {ip}, {ip} may be in use by {mac}")]
    IpConflict {
        iface: String,
        ip: IpAddr,
        mac: MacAddr6,
    },

    #[error("gateway {gateway} is unreachable from pod's interface {iface}")]
    GatewayUnreachable { iface: String, gateway: IpAddr },

    #[error("detection cancelled")]
    Cancelled,

    #[error("probe socket error: {0}")]
    Socket(#[from] std::io::Error),

    #[error(transparent)]
    Network(#[from] NetworkError),
}

/// One allocated address as handed out by IPAM, with its check toggles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpConfig {
    pub nic: String,
    pub address: IpNet,
    pub gateway: Option<IpAddr>,
    pub enable_gateway_detection: bool,
    pub enable_ip_conflict_detection: bool,
}

/// Retry budget for one probe: `retries` sends, each waiting up to
/// `timeout` for an answer, never running past `ceiling` in total.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeOptions {
    pub retries: u32,
    pub timeout: Duration,
    pub ceiling: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectOptions {
    pub conflict: ProbeOptions,
    pub gateway: ProbeOptions,
}

/// The pod interface the probes go out of.
#[derive(Debug, Clone)]
pub struct Target {
    pub iface: String,
    pub ifindex: u32,
    pub mac: MacAddr6,
}

/// Send `packet` up to `opts.retries` times and return the first reply
/// `matcher` accepts. `Ok(None)` means the budget ran out with no match.
pub(crate) fn probe<T, R>(
    transport: &mut T,
    packet: &[u8],
    dest: IpAddr,
    opts: &ProbeOptions,
    cancel: &CancelToken,
    mut matcher: impl FnMut(&[u8]) -> Option<R>,
) -> Result<Option<R>, DetectError>
where
    T: PacketTransport,
{
    let ceiling = Instant::now() + opts.ceiling;
    let mut buf = [0u8; 1500];

    for attempt in 1..=opts.retries.max(1) {
        if cancel.is_cancelled() {
            return Err(DetectError::Cancelled);
        }
        let sent_at = Instant::now();
        if sent_at >= ceiling {
            tracing::debug!(%dest, attempt, "probe ceiling reached");
            break;
        }
        transport.send(packet, dest)?;

        let deadline = (sent_at + opts.timeout).min(ceiling);
        loop {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if cancel.is_cancelled() {
                return Err(DetectError::Cancelled);
            }
            match transport.recv(&mut buf, deadline - now) {
                Ok(Some(n)) => {
                    if let Some(hit) = matcher(&buf[..n]) {
                        return Ok(Some(hit));
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    // give up on this attempt, the ceiling still bounds the total
                    tracing::debug!(%dest, attempt, error = %e, "probe receive failed");
                    break;
                }
            }
        }
    }
    Ok(None)
}

pub fn run_v4<T: PacketTransport>(
    transport: T,
    target: &Target,
    cfg: &IpConfig,
    opts: &DetectOptions,
    cancel: &CancelToken,
) -> Result<(), DetectError> {
    let IpAddr::V4(ip) = cfg.address.addr() else {
        return Ok(());
    };
    let mut prober = ArpProber::new(transport, &target.iface, target.mac);
    if cfg.enable_ip_conflict_detection {
        prober.check_conflict(ip, &opts.conflict, cancel)?;
    }
    if cfg.enable_gateway_detection {
        match cfg.gateway {
            Some(IpAddr::V4(gw)) => prober.check_gateway(ip, gw, &opts.gateway, cancel)?,
            _ => tracing::debug!(iface = %target.iface, "no ipv4 gateway to check"),
        }
    }
    Ok(())
}

pub fn run_v6<T: PacketTransport>(
    transport: T,
    target: &Target,
    cfg: &IpConfig,
    opts: &DetectOptions,
    cancel: &CancelToken,
) -> Result<(), DetectError> {
    let IpAddr::V6(ip) = cfg.address.addr() else {
        return Ok(());
    };
    let mut prober = NdpProber::new(transport, &target.iface, target.mac);
    if cfg.enable_ip_conflict_detection {
        prober.check_conflict(ip, &opts.conflict, cancel)?;
    }
    if cfg.enable_gateway_detection {
        match cfg.gateway {
            Some(IpAddr::V6(gw)) => prober.check_gateway(gw, &opts.gateway, cancel)?,
            _ => tracing::debug!(iface = %target.iface, "no ipv6 gateway to check"),
        }
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Inet6Entry {
    addr: Ipv6Addr,
    flags: u32,
}

/// Entries of `/proc/net/if_inet6` for `iface`.
fn parse_if_inet6(content: &str, iface: &str) -> Vec<Inet6Entry> {
    content
        .lines()
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            if fields.len() < 6 || fields[5] != iface {
                return None;
            }
            let raw = u128::from_str_radix(fields[0], 16).ok()?;
            let flags = u32::from_str_radix(fields[4], 16).ok()?;
            Some(Inet6Entry {
                addr: Ipv6Addr::from(raw),
                flags,
            })
        })
        .collect()
}

/// Block until `iface` has a link-local address that finished DAD. Must run
/// on a thread already inside the pod namespace.
fn wait_link_local(iface: &str, timeout: Duration, cancel: &CancelToken) -> Result<Ipv6Addr, DetectError> {
    let deadline = Instant::now() + timeout;
    loop {
        if cancel.is_cancelled() {
            return Err(DetectError::Cancelled);
        }
        let content = std::fs::read_to_string(IF_INET6)?;
        let ready = parse_if_inet6(&content, iface).into_iter().find(|e| {
            crate::networking::address::is_v6_link_local(&e.addr) && e.flags & IFA_F_TENTATIVE == 0
        });
        if let Some(entry) = ready {
            return Ok(entry.addr);
        }
        if Instant::now() >= deadline {
            return Err(NetworkError::Timeout(format!(
                "ipv6 link-local address of {} is still tentative after {:?}",
                iface, timeout
            ))
            .into());
        }
        std::thread::sleep(IPV6_READY_POLL);
    }
}

/// Runs the checks for one pod interface.
pub struct Detector {
    target: Target,
    options: DetectOptions,
}

impl Detector {
    pub fn new(target: Target, options: DetectOptions) -> Self {
        Self { target, options }
    }

    /// Check every config bound to this interface that asks for a check.
    /// Blocks the calling thread until all workers finish.
    pub fn detect(&self, pod_ns: &NetNs, configs: &[IpConfig]) -> Result<(), DetectError> {
        let relevant: Vec<IpConfig> = configs
            .iter()
            .filter(|c| c.nic == self.target.iface)
            .filter(|c| c.enable_gateway_detection || c.enable_ip_conflict_detection)
            .cloned()
            .collect();
        if relevant.is_empty() {
            return Ok(());
        }

        let mut group: NsGroup<DetectError> = NsGroup::new();
        for cfg in relevant {
            let target = self.target.clone();
            let opts = self.options.clone();
            let spawned = match cfg.address.addr() {
                IpAddr::V4(_) => group.spawn(pod_ns, "arp-probe", move |cancel| {
                    let transport = ArpSocket::open(target.ifindex)?;
                    run_v4(transport, &target, &cfg, &opts, cancel)
                }),
                IpAddr::V6(_) => group.spawn(pod_ns, "ndp-probe", move |cancel| {
                    let link_local = wait_link_local(&target.iface, IPV6_READY_TIMEOUT, cancel)?;
                    let transport = NdpSocket::open(&target.iface, target.ifindex, link_local)?;
                    run_v6(transport, &target, &cfg, &opts, cancel)
                }),
            };
            if let Err(e) = spawned {
                group.cancel_token().cancel();
                let _ = group.wait();
                return Err(e.into());
            }
        }
        group.wait()
    }
}
