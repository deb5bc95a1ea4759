//! Configuration for the metrics agent.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use magent_shared::constants::{defaults, runtime};
use magent_shared::{MagentError, MagentResult};

// ============================================================================
// Agent Options
// ============================================================================

/// Configuration options for the agent.
///
/// Users can create it with defaults and modify fields as needed, or go
/// through [`AgentOptionsBuilder`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AgentOptions {
    /// Containerd gRPC socket.
    ///
    /// Default: /run/containerd/containerd.sock
    #[serde(default = "default_containerd_address")]
    pub containerd_address: PathBuf,

    /// Containerd state root under which shims publish their metrics
    /// address files.
    ///
    /// Default: /run/containerd
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,

    /// Address the HTTP endpoint binds.
    ///
    /// Default: 127.0.0.1:8090
    #[serde(default = "default_listen_address")]
    pub listen_address: SocketAddr,

    /// Runtime shim name whose containers are tracked. Containers created
    /// under any other runtime are invisible to the agent.
    ///
    /// Default: io.containerd.vmbox.v2
    #[serde(default = "default_runtime_name")]
    pub runtime_name: String,

    /// Seconds between full reconciliation passes against containerd.
    ///
    /// Default: 30
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Seconds allowed for scraping one sandbox's shim.
    ///
    /// Default: 3
    #[serde(default = "default_scrape_timeout_secs")]
    pub scrape_timeout_secs: u64,
}

// Default value functions for AgentOptions

fn default_containerd_address() -> PathBuf {
    PathBuf::from(defaults::CONTAINERD_ADDRESS)
}

fn default_state_root() -> PathBuf {
    PathBuf::from(defaults::STATE_ROOT)
}

fn default_listen_address() -> SocketAddr {
    // The constant is a valid socket address; parsing it cannot fail.
    defaults::LISTEN_ADDRESS
        .parse()
        .unwrap_or_else(|_| SocketAddr::from(([127, 0, 0, 1], 8090)))
}

fn default_runtime_name() -> String {
    runtime::RUNTIME_NAME.to_string()
}

fn default_reconcile_interval_secs() -> u64 {
    defaults::RECONCILE_INTERVAL_SECS
}

fn default_scrape_timeout_secs() -> u64 {
    defaults::SCRAPE_TIMEOUT_SECS
}

impl Default for AgentOptions {
    fn default() -> Self {
        Self {
            containerd_address: default_containerd_address(),
            state_root: default_state_root(),
            listen_address: default_listen_address(),
            runtime_name: default_runtime_name(),
            reconcile_interval_secs: default_reconcile_interval_secs(),
            scrape_timeout_secs: default_scrape_timeout_secs(),
        }
    }
}

impl AgentOptions {
    /// Interval between reconciliation passes.
    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    /// Deadline for one sandbox scrape.
    pub fn scrape_timeout(&self) -> Duration {
        Duration::from_secs(self.scrape_timeout_secs)
    }

    /// Sanitize and validate options.
    pub fn sanitize(&self) -> MagentResult<()> {
        if self.containerd_address.as_os_str().is_empty() {
            return Err(MagentError::Config(
                "containerd_address must not be empty".to_string(),
            ));
        }
        if self.state_root.as_os_str().is_empty() {
            return Err(MagentError::Config(
                "state_root must not be empty".to_string(),
            ));
        }
        if self.runtime_name.is_empty() {
            return Err(MagentError::Config(
                "runtime_name must not be empty".to_string(),
            ));
        }
        if self.reconcile_interval_secs == 0 {
            return Err(MagentError::Config(
                "reconcile_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.scrape_timeout_secs == 0 {
            return Err(MagentError::Config(
                "scrape_timeout_secs must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Create a builder starting from default options.
    pub fn builder() -> AgentOptionsBuilder {
        AgentOptionsBuilder::new()
    }
}

// ============================================================================
// Agent Options Builder (non-consuming)
// ============================================================================

/// Builder for customizing [`AgentOptions`].
#[derive(Debug, Clone)]
pub struct AgentOptionsBuilder {
    inner: AgentOptions,
}

impl Default for AgentOptionsBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentOptionsBuilder {
    /// Create a builder starting from default options.
    pub fn new() -> Self {
        Self {
            inner: AgentOptions::default(),
        }
    }

    /// Set the containerd gRPC socket path.
    pub fn containerd_address(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.inner.containerd_address = path.into();
        self
    }

    /// Set the containerd state root.
    pub fn state_root(&mut self, path: impl Into<PathBuf>) -> &mut Self {
        self.inner.state_root = path.into();
        self
    }

    /// Set the HTTP listen address.
    pub fn listen_address(&mut self, address: SocketAddr) -> &mut Self {
        self.inner.listen_address = address;
        self
    }

    /// Set the runtime shim name to track.
    pub fn runtime_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.inner.runtime_name = name.into();
        self
    }

    /// Set the reconciliation interval.
    pub fn reconcile_interval(&mut self, interval: Duration) -> &mut Self {
        self.inner.reconcile_interval_secs = interval.as_secs();
        self
    }

    /// Set the per-sandbox scrape timeout.
    pub fn scrape_timeout(&mut self, timeout: Duration) -> &mut Self {
        self.inner.scrape_timeout_secs = timeout.as_secs();
        self
    }

    /// Build the configured [`AgentOptions`].
    pub fn build(&self) -> AgentOptions {
        self.inner.clone()
    }
}
