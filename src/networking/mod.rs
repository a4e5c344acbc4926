//! Kernel network state: links, addresses, routes, rules, neighbours,
//! namespaces and sysctls.

pub mod address;
pub mod error;
pub mod neigh;
pub mod netlink;
pub mod netns;
pub mod route;
pub mod rule;
pub mod sysctl;
pub mod veth;

#[cfg(test)]
pub mod fake;

pub use error::{NetworkError, NetworkResult};
pub use netlink::{IpFamily, Netlink, NetlinkHandle};
pub use netns::NetNs;
