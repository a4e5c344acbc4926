//! Names, paths and numbers shared by the coordinator.

// ============================================================================
// CNI
// ============================================================================

pub const PLUGIN_NAME: &str = "coordinator";

/// CNI spec versions this plugin can speak.
pub const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

// ============================================================================
// Paths
// ============================================================================

pub const DEFAULT_LOG_FILE: &str = "/var/log/spidernet/coordinator.log";
pub const DEFAULT_AGENT_SOCKET: &str = "/var/run/spidernet/spiderpool.sock";

// ============================================================================
// Interfaces
// ============================================================================

/// Pod-side name of the auxiliary veth created for underlay pods.
pub const UNDERLAY_VETH: &str = "veth0";

/// Default name of the pod's first NIC, the one an overlay CNI creates.
pub const DEFAULT_POD_FIRST_IFACE: &str = "eth0";

// ============================================================================
// Routing
// ============================================================================

/// First policy table handed to a spiderpool NIC; NIC `n` uses base + n.
pub const POD_RULE_TABLE_BASE: u32 = 100;

/// Host table holding per-pod routes back through the auxiliary veth.
pub const DEFAULT_HOST_RULE_TABLE: u32 = 500;

/// Priority of the host's `from all lookup <host table>` rule.
pub const HOST_RULE_PRIORITY: u32 = 1000;

// ============================================================================
// Detection
// ============================================================================

pub const DEFAULT_CONFLICT_RETRIES: u32 = 3;
/// Per-attempt wait for a conflict probe answer.
pub const CONFLICT_ATTEMPT_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_CONFLICT_CEILING: &str = "1s";

pub const DEFAULT_GATEWAY_RETRIES: u32 = 3;
pub const DEFAULT_GATEWAY_INTERVAL: &str = "100ms";
pub const DEFAULT_GATEWAY_CEILING: &str = "1s";
