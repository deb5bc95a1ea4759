//! Thread-safe sandbox registry.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use magent_shared::{MagentError, MagentResult};

/// Tracks the sandboxes currently known to the agent, keyed by sandbox ID
/// with the containerd namespace each one lives in.
///
/// This is shared between the event listener, the reconciliation loop and the
/// federation path via `Arc<>`. Uses RwLock for concurrent reads (snapshot)
/// with exclusive writes (insert/remove/replace).
///
/// # Design
///
/// - **Shared ownership**: Cloneable via `Arc`, passed to every agent task
/// - **Concurrent access**: RwLock allows multiple readers, single writer
/// - **Idempotent mutation**: duplicate inserts and removes of unknown IDs
///   are no-ops, so event replay and reconciliation can race safely
/// - **No persistence**: in-memory only, rebuilt from containerd on restart
#[derive(Clone, Debug)]
pub struct SandboxRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

#[derive(Debug)]
struct RegistryInner {
    sandboxes: HashMap<String, String>,
}

impl SandboxRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                sandboxes: HashMap::new(),
            })),
        }
    }

    /// Record a sandbox if it is not already tracked.
    ///
    /// Returns `true` if the sandbox was added, `false` if it was already
    /// present (the stored namespace is left untouched).
    pub fn insert(&self, id: &str, namespace: &str) -> MagentResult<bool> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| MagentError::Internal(format!("registry lock poisoned: {}", e)))?;

        if inner.sandboxes.contains_key(id) {
            return Ok(false);
        }

        tracing::debug!(sandbox_id = %id, namespace = %namespace, "Tracking sandbox");
        inner
            .sandboxes
            .insert(id.to_string(), namespace.to_string());
        Ok(true)
    }

    /// Forget a sandbox if it is tracked.
    ///
    /// Returns the namespace the sandbox was stored under, or `None` if the
    /// ID was unknown.
    pub fn remove(&self, id: &str) -> MagentResult<Option<String>> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| MagentError::Internal(format!("registry lock poisoned: {}", e)))?;

        let namespace = inner.sandboxes.remove(id);
        if let Some(ns) = &namespace {
            tracing::debug!(sandbox_id = %id, namespace = %ns, "Dropping sandbox");
        }
        Ok(namespace)
    }

    /// Replace the entire tracked set in one step.
    ///
    /// The reconciliation loop uses this to converge on containerd's view
    /// without the registry ever being observable half-updated.
    pub fn replace_all(&self, sandboxes: HashMap<String, String>) -> MagentResult<()> {
        let mut inner = self
            .inner
            .write()
            .map_err(|e| MagentError::Internal(format!("registry lock poisoned: {}", e)))?;

        tracing::debug!(
            old_count = inner.sandboxes.len(),
            new_count = sandboxes.len(),
            "Replacing sandbox set"
        );
        inner.sandboxes = sandboxes;
        Ok(())
    }

    /// Copy the current sandbox-to-namespace map.
    ///
    /// Callers iterate the copy without holding the lock, so a scrape pass
    /// never blocks event handling.
    pub fn snapshot(&self) -> MagentResult<HashMap<String, String>> {
        let inner = self
            .inner
            .read()
            .map_err(|e| MagentError::Internal(format!("registry lock poisoned: {}", e)))?;

        Ok(inner.sandboxes.clone())
    }

    /// Get the number of sandboxes being tracked.
    pub fn count(&self) -> MagentResult<usize> {
        let inner = self
            .inner
            .read()
            .map_err(|e| MagentError::Internal(format!("registry lock poisoned: {}", e)))?;

        Ok(inner.sandboxes.len())
    }
}

impl Default for SandboxRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_snapshot() {
        let registry = SandboxRegistry::new();

        assert!(registry.insert("s1", "default").unwrap());

        let snapshot = registry.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot.get("s1").map(String::as_str), Some("default"));
    }

    #[test]
    fn test_duplicate_insert_is_noop() {
        let registry = SandboxRegistry::new();

        assert!(registry.insert("s1", "default").unwrap());
        assert!(!registry.insert("s1", "default").unwrap());
        assert!(!registry.insert("s1", "other").unwrap());

        let snapshot = registry.snapshot().unwrap();
        assert_eq!(snapshot.len(), 1);
        // First writer wins; the namespace is not rebound.
        assert_eq!(snapshot.get("s1").map(String::as_str), Some("default"));
    }

    #[test]
    fn test_remove_returns_namespace() {
        let registry = SandboxRegistry::new();
        registry.insert("s1", "kube-system").unwrap();

        assert_eq!(registry.remove("s1").unwrap(), Some("kube-system".to_string()));
        assert_eq!(registry.remove("s1").unwrap(), None);
        assert_eq!(registry.count().unwrap(), 0);
    }

    #[test]
    fn test_remove_unknown_is_noop() {
        let registry = SandboxRegistry::new();
        registry.insert("s1", "default").unwrap();

        assert_eq!(registry.remove("never-seen").unwrap(), None);
        assert_eq!(registry.count().unwrap(), 1);
    }

    #[test]
    fn test_replace_all_swaps_set() {
        let registry = SandboxRegistry::new();
        registry.insert("stale-a", "default").unwrap();
        registry.insert("stale-b", "default").unwrap();

        let fresh = HashMap::from([
            ("live-1".to_string(), "default".to_string()),
            ("live-2".to_string(), "kube-system".to_string()),
        ]);
        registry.replace_all(fresh.clone()).unwrap();

        assert_eq!(registry.snapshot().unwrap(), fresh);
    }

    #[test]
    fn test_replace_all_with_empty_clears() {
        let registry = SandboxRegistry::new();
        registry.insert("s1", "default").unwrap();

        registry.replace_all(HashMap::new()).unwrap();

        assert_eq!(registry.count().unwrap(), 0);
        assert!(registry.snapshot().unwrap().is_empty());
    }

    #[test]
    fn test_count() {
        let registry = SandboxRegistry::new();

        assert_eq!(registry.count().unwrap(), 0);

        registry.insert("s1", "default").unwrap();
        assert_eq!(registry.count().unwrap(), 1);

        registry.insert("s2", "default").unwrap();
        assert_eq!(registry.count().unwrap(), 2);
    }
}
