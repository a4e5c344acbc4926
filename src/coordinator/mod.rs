//! Reconciliation engine: turns one ADD or DEL into the host and pod
//! routing, rule and neighbour state a multi-NIC pod needs.
//!
//! The engine is generic over the kernel (`Netlink`) and over the pieces
//! that must run on a thread inside the pod's namespace (`PodNamespace`).

pub mod add;
pub mod del;
pub mod hwaddr;
pub mod mode;
pub mod neigh;
pub mod routes;
pub mod state;

use crate::agent::AgentError;
use crate::cni::types::CniError;
use crate::config::ConfigError;
use crate::ipchecking::{DetectError, DetectOptions, Detector, IpConfig, Target};
use crate::networking::sysctl::Sysctl;
use crate::networking::{IpFamily, NetNs, Netlink, NetworkError};
use async_trait::async_trait;
use mode::ModeError;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Mode(#[from] ModeError),

    #[error(transparent)]
    Cni(#[from] CniError),

    #[error("failed to get coordinator config from agent: {0}")]
    Agent(#[from] AgentError),

    #[error("{context}: {source}")]
    Network {
        context: String,
        #[source]
        source: NetworkError,
    },

    #[error("{context}: {source}")]
    Detect {
        context: String,
        #[source]
        source: DetectError,
    },

    #[error("no rule table for {iface}: pod NIC list {pod_nics:?} has no record of it")]
    RuleTable { iface: String, pod_nics: Vec<String> },

    #[error("{0}")]
    Invalid(String),
}

pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Attach what the engine was doing to a lower-level error.
pub(crate) trait Context<T> {
    fn context(self, what: impl Into<String>) -> CoordinatorResult<T>;
}

impl<T> Context<T> for Result<T, NetworkError> {
    fn context(self, what: impl Into<String>) -> CoordinatorResult<T> {
        self.map_err(|source| CoordinatorError::Network {
            context: what.into(),
            source,
        })
    }
}

impl<T> Context<T> for Result<T, DetectError> {
    fn context(self, what: impl Into<String>) -> CoordinatorResult<T> {
        self.map_err(|source| CoordinatorError::Detect {
            context: what.into(),
            source,
        })
    }
}

/// Who and where this invocation is about.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub container_id: String,
    pub if_name: String,
    pub netns: PathBuf,
    pub pod: String,
}

/// Work that has to happen on a thread switched into the pod's namespace,
/// plus the host namespace handle needed to move links out of it.
#[async_trait]
pub trait PodNamespace: Send + Sync {
    /// Descriptor of the host namespace, used as a link move target.
    fn host_fd(&self) -> RawFd;

    /// Write sysctls as seen from inside the pod.
    async fn pod_sysctl(&self, settings: Vec<(String, String)>) -> Result<(), NetworkError>;

    /// Node-wide baseline sysctls, best effort.
    async fn host_baseline(&self, family: IpFamily);

    async fn detect(
        &self,
        target: Target,
        options: DetectOptions,
        configs: Vec<IpConfig>,
    ) -> Result<(), DetectError>;
}

/// The real pod and host namespaces.
pub struct PodNetns {
    pod: Arc<NetNs>,
    host: NetNs,
}

impl PodNetns {
    pub fn new(pod: NetNs, host: NetNs) -> Self {
        Self {
            pod: Arc::new(pod),
            host,
        }
    }
}

#[async_trait]
impl PodNamespace for PodNetns {
    fn host_fd(&self) -> RawFd {
        self.host.as_raw_fd()
    }

    async fn pod_sysctl(&self, settings: Vec<(String, String)>) -> Result<(), NetworkError> {
        self.pod.run(move || Sysctl::new().apply(&settings)).await?
    }

    async fn host_baseline(&self, family: IpFamily) {
        // The plugin process itself lives in the host namespace.
        Sysctl::new().apply_baseline(family);
    }

    async fn detect(
        &self,
        target: Target,
        options: DetectOptions,
        configs: Vec<IpConfig>,
    ) -> Result<(), DetectError> {
        let pod = Arc::clone(&self.pod);
        tokio::task::spawn_blocking(move || Detector::new(target, options).detect(&pod, &configs))
            .await
            .map_err(|e| NetworkError::Namespace(format!("detector task failed: {}", e)))?
    }
}

/// Engine over one host and one pod view of the kernel.
pub struct Coordinator<N, P> {
    host: N,
    pod: N,
    ns: P,
}

impl<N, P> Coordinator<N, P>
where
    N: Netlink,
    P: PodNamespace,
{
    pub fn new(host: N, pod: N, ns: P) -> Self {
        Self { host, pod, ns }
    }
}
