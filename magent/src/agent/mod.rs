//! Agent assembly: options, wiring and lifecycle.

pub mod options;

mod core;

pub use core::MetricsAgent;
pub use options::{AgentOptions, AgentOptionsBuilder};
