//! Magent core - shared contract between the host agent and sandbox shims
//!
//! This crate contains the constants, error types, and on-disk layout
//! definitions used by both the host-side metrics agent (magent) and the
//! per-sandbox shim implementations that publish metrics to it.

pub mod constants;
pub mod errors;
pub mod layout;

pub use errors::{MagentError, MagentResult};
pub use layout::ShimLayout;
