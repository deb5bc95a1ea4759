//! Host-side metrics agent for VM-isolated container sandboxes.
//!
//! magent watches containerd for sandbox lifecycle events, keeps an
//! in-memory registry of running sandboxes, scrapes every sandbox shim over
//! its abstract Unix metrics socket and serves the merged families together
//! with the agent's own metrics behind one HTTP endpoint.
//!
//! The crate is a library plus the `magentd` daemon binary. Embedders build
//! a [`MetricsAgent`] from [`AgentOptions`] and drive the HTTP surface
//! themselves; `magentd` wires signals, logging and the server around it.

pub mod agent;
pub mod containerd;
pub mod events;
pub mod federation;
pub mod reconcile;
pub mod registry;
pub mod server;
pub mod telemetry;
pub mod util;

pub use agent::{AgentOptions, AgentOptionsBuilder, MetricsAgent};
pub use registry::SandboxRegistry;
