//! On-disk layout shared between the agent and sandbox shims.
//!
//! The shim serving a sandbox writes the name of its abstract metrics socket
//! into an address file under the containerd task state directory; the agent
//! derives the identical path to discover it. Lives in magent-shared so both
//! sides of the boundary stay in agreement.

use std::path::{Path, PathBuf};

use crate::constants::{metrics, runtime};

// ============================================================================
// SHIM LAYOUT (per-host state root)
// ============================================================================

/// Per-host layout of shim state directories.
///
/// Directory structure below the containerd state root:
/// ```text
/// {state_root}/
/// └── io.containerd.runtime.v2.task/
///     └── {namespace}/
///         └── {sandbox_id}/
///             └── magent_address     # abstract socket name, written by the shim
/// ```
#[derive(Clone, Debug)]
pub struct ShimLayout {
    state_root: PathBuf,
}

impl ShimLayout {
    /// Create a layout rooted at the containerd state directory.
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
        }
    }

    /// Containerd state root this layout derives from.
    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    /// Task directory: {state_root}/io.containerd.runtime.v2.task
    pub fn task_dir(&self) -> PathBuf {
        self.state_root.join(runtime::TASK_DIR)
    }

    /// Sandbox state directory: {task_dir}/{namespace}/{sandbox_id}
    pub fn sandbox_dir(&self, namespace: &str, sandbox_id: &str) -> PathBuf {
        self.task_dir().join(namespace).join(sandbox_id)
    }

    /// Metrics address file: {sandbox_dir}/magent_address
    ///
    /// The file carries the shim's abstract socket name without the leading
    /// NUL byte.
    pub fn address_file(&self, namespace: &str, sandbox_id: &str) -> PathBuf {
        self.sandbox_dir(namespace, sandbox_id)
            .join(metrics::ADDRESS_FILE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========================================================================
    // ShimLayout tests
    // ========================================================================

    #[test]
    fn test_layout_paths() {
        let layout = ShimLayout::new("/run/containerd");

        assert_eq!(layout.state_root().to_str().unwrap(), "/run/containerd");
        assert_eq!(
            layout.task_dir().to_str().unwrap(),
            "/run/containerd/io.containerd.runtime.v2.task"
        );
        assert_eq!(
            layout.sandbox_dir("k8s.io", "sb-1").to_str().unwrap(),
            "/run/containerd/io.containerd.runtime.v2.task/k8s.io/sb-1"
        );
        assert_eq!(
            layout.address_file("k8s.io", "sb-1").to_str().unwrap(),
            "/run/containerd/io.containerd.runtime.v2.task/k8s.io/sb-1/magent_address"
        );
    }

    #[test]
    fn test_layout_is_relative_to_state_root() {
        let a = ShimLayout::new("/run/containerd");
        let b = ShimLayout::new("/var/lib/other-root");

        let a_file = a.address_file("ns", "id");
        let b_file = b.address_file("ns", "id");
        let a_rel = a_file.strip_prefix(a.state_root()).unwrap();
        let b_rel = b_file.strip_prefix(b.state_root()).unwrap();
        assert_eq!(a_rel, b_rel);
    }

}
