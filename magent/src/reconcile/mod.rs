//! Periodic reconciliation against containerd.
//!
//! Events can be missed while the agent is disconnected or restarting, so a
//! timer rebuilds the full sandbox set from scratch every interval and swaps
//! it into the registry. A failed pass leaves the registry untouched; the
//! next tick retries.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use magent_shared::MagentResult;

use crate::containerd::ContainerHost;
use crate::registry::SandboxRegistry;

pub struct ReconciliationLoop {
    host: Arc<dyn ContainerHost>,
    registry: SandboxRegistry,
    runtime: String,
    interval: Duration,
}

impl ReconciliationLoop {
    pub fn new(
        host: Arc<dyn ContainerHost>,
        registry: SandboxRegistry,
        runtime: impl Into<String>,
        interval: Duration,
    ) -> Self {
        Self {
            host,
            registry,
            runtime: runtime.into(),
            interval,
        }
    }

    /// Rebuild the sandbox set from containerd and replace the registry
    /// contents with it. Returns the number of sandboxes found.
    pub async fn resync(&self) -> MagentResult<usize> {
        let sandboxes = self.collect_sandboxes().await?;
        let count = sandboxes.len();
        self.registry.replace_all(sandboxes)?;
        Ok(count)
    }

    async fn collect_sandboxes(&self) -> MagentResult<HashMap<String, String>> {
        let namespaces = self.host.list_namespaces().await?;

        let mut sandboxes = HashMap::new();
        for namespace in &namespaces {
            let containers = self.host.list_containers(namespace, &self.runtime).await?;
            for container in containers {
                if container.is_sandbox() {
                    sandboxes.insert(container.id, namespace.clone());
                }
            }
        }
        Ok(sandboxes)
    }

    /// Resync every interval until `shutdown` fires.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick completes immediately; the startup pass already ran.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    tracing::debug!("Reconciliation loop stopping");
                    return;
                }
                _ = ticker.tick() => {
                    match self.resync().await {
                        Ok(count) => {
                            tracing::debug!(sandboxes = count, "Reconciled sandbox set");
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "Reconciliation pass failed");
                        }
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use magent_shared::constants::defaults::RECONCILE_INTERVAL_SECS;
    use magent_shared::constants::runtime::RUNTIME_NAME;

    use crate::containerd::testing::{sandbox_descriptor, workload_descriptor, FakeHost};

    fn reconciler(host: Arc<FakeHost>, registry: SandboxRegistry) -> ReconciliationLoop {
        ReconciliationLoop::new(
            host,
            registry,
            RUNTIME_NAME,
            Duration::from_secs(RECONCILE_INTERVAL_SECS),
        )
    }

    #[tokio::test]
    async fn test_resync_collects_sandboxes_across_namespaces() {
        let host = Arc::new(
            FakeHost::new()
                .with_container(sandbox_descriptor("default", "s1"))
                .with_container(sandbox_descriptor("kube-system", "s2"))
                .with_container(workload_descriptor("default", "c1")),
        );
        let registry = SandboxRegistry::new();

        let count = reconciler(host, registry.clone()).resync().await.unwrap();

        assert_eq!(count, 2);
        let snapshot = registry.snapshot().unwrap();
        assert_eq!(snapshot.get("s1").map(String::as_str), Some("default"));
        assert_eq!(snapshot.get("s2").map(String::as_str), Some("kube-system"));
        assert!(!snapshot.contains_key("c1"));
    }

    #[tokio::test]
    async fn test_resync_converges_stale_registry() {
        let host = Arc::new(FakeHost::new().with_container(sandbox_descriptor("default", "s1")));
        let registry = SandboxRegistry::new();
        // Entries left behind by missed delete events, plus a missed create.
        registry.insert("gone-1", "default").unwrap();
        registry.insert("gone-2", "kube-system").unwrap();

        let reconciler = reconciler(host.clone(), registry.clone());
        reconciler.resync().await.unwrap();

        let snapshot = registry.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("s1"));

        // Containerd state changes between passes; the next pass follows it.
        host.add_container(sandbox_descriptor("default", "s3"));
        host.remove_container("s1");
        reconciler.resync().await.unwrap();

        let snapshot = registry.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert!(snapshot.contains_key("s3"));
    }

    #[tokio::test]
    async fn test_resync_with_no_sandboxes_empties_registry() {
        let host = Arc::new(FakeHost::new());
        let registry = SandboxRegistry::new();
        registry.insert("stale", "default").unwrap();

        let count = reconciler(host, registry.clone()).resync().await.unwrap();

        assert_eq!(count, 0);
        assert!(registry.snapshot().unwrap().is_empty());
    }
}
