//! Shared constants between the metrics agent and sandbox shims
//!
//! These constants must be identical on both sides of the agent-shim
//! boundary: the shim publishes under them, the agent discovers through them.

/// Sandbox runtime identity constants
pub mod runtime {
    /// Containerd runtime name registered by the VM sandbox shim
    pub const RUNTIME_NAME: &str = "io.containerd.vmbox.v2";

    /// Containerd v2 task state directory component
    pub const TASK_DIR: &str = "io.containerd.runtime.v2.task";
}

/// Container lifecycle event topics consumed by the agent
pub mod topics {
    /// Emitted when a container record is created
    pub const CONTAINER_CREATE: &str = "/containers/create";

    /// Emitted when a container record is deleted
    pub const CONTAINER_DELETE: &str = "/containers/delete";
}

/// Metrics transport constants
pub mod metrics {
    /// File the shim writes its abstract metrics socket name into,
    /// relative to the sandbox task state directory
    pub const ADDRESS_FILE: &str = "magent_address";

    /// HTTP path served on the shim metrics socket
    pub const SHIM_METRICS_PATH: &str = "/metrics";

    /// Prefix prepended to generic-runtime families scraped from shims,
    /// keeping them apart from the agent's own families of the same names
    pub const SHIM_FAMILY_PREFIX: &str = "vmbox_shim_";

    /// Namespace of the agent's self-observability families
    pub const AGENT_NAMESPACE: &str = "magent";
}

/// Daemon defaults
pub mod defaults {
    /// Default containerd gRPC endpoint
    pub const CONTAINERD_ADDRESS: &str = "/run/containerd/containerd.sock";

    /// Default containerd state root; shim task directories live below it
    pub const STATE_ROOT: &str = "/run/containerd";

    /// Default HTTP listen address of the agent
    pub const LISTEN_ADDRESS: &str = "127.0.0.1:8090";

    /// Default full-reconciliation interval in seconds
    pub const RECONCILE_INTERVAL_SECS: u64 = 30;

    /// Per-sandbox scrape timeout in seconds
    pub const SCRAPE_TIMEOUT_SECS: u64 = 3;
}
