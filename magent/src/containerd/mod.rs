//! Containerd integration.
//!
//! Wraps the containerd gRPC surface behind the [`ContainerHost`] trait so
//! the event listener, the reconciliation loop and tests share one
//! interface. The real client lives in [`client`].

mod client;

pub use client::ContainerdHost;

use futures::stream::BoxStream;

use magent_shared::MagentResult;

/// Annotation keys whose value `"sandbox"` marks a container as the pod
/// sandbox of its pod. The first is written by containerd's CRI plugin,
/// the second by CRI-O.
const SANDBOX_ANNOTATION_KEYS: [&str; 2] = [
    "io.kubernetes.cri.container-type",
    "io.kubernetes.cri-o.ContainerType",
];

/// One container as listed or fetched from containerd.
#[derive(Clone, Debug)]
pub struct ContainerDescriptor {
    pub id: String,
    /// Namespace the container was queried from.
    pub namespace: String,
    /// Runtime shim name recorded for the container, e.g. `io.containerd.vmbox.v2`.
    pub runtime_name: String,
    /// Raw OCI runtime spec stored in the container record, if any.
    pub spec: Option<Vec<u8>>,
}

impl ContainerDescriptor {
    /// Whether this container is the pod sandbox of its pod.
    ///
    /// Decided from the CRI container-type annotations in the OCI spec.
    /// A missing or undecodable spec counts as "not a sandbox": the
    /// container is skipped rather than failing the caller.
    pub fn is_sandbox(&self) -> bool {
        let Some(spec_bytes) = &self.spec else {
            tracing::debug!(container_id = %self.id, "Container record has no OCI spec");
            return false;
        };

        let spec: oci_spec::runtime::Spec = match serde_json::from_slice(spec_bytes) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::warn!(
                    container_id = %self.id,
                    error = %e,
                    "Failed to decode container OCI spec"
                );
                return false;
            }
        };

        let Some(annotations) = spec.annotations() else {
            return false;
        };
        SANDBOX_ANNOTATION_KEYS
            .iter()
            .any(|key| annotations.get(*key).map(String::as_str) == Some("sandbox"))
    }
}

/// One event received from containerd's event service.
#[derive(Clone, Debug)]
pub struct EventEnvelope {
    pub namespace: String,
    pub topic: String,
    /// Protobuf payload with its type URL, when the event carries one.
    pub event: Option<prost_types::Any>,
}

/// Stream of events from a subscription. Ends when containerd closes the
/// connection; transport errors surface as items so the caller can decide
/// whether to resubscribe.
pub type EventStream = BoxStream<'static, MagentResult<EventEnvelope>>;

/// Host-side view of containerd.
///
/// Implemented by [`ContainerdHost`] over gRPC and by in-memory fakes in
/// tests.
#[async_trait::async_trait]
pub trait ContainerHost: Send + Sync {
    /// List the namespaces known to containerd.
    async fn list_namespaces(&self) -> MagentResult<Vec<String>>;

    /// List containers in one namespace whose runtime matches `runtime`.
    async fn list_containers(
        &self,
        namespace: &str,
        runtime: &str,
    ) -> MagentResult<Vec<ContainerDescriptor>>;

    /// Fetch a single container record. Returns `Ok(None)` if containerd
    /// no longer knows the ID.
    async fn get_container(
        &self,
        namespace: &str,
        id: &str,
    ) -> MagentResult<Option<ContainerDescriptor>>;

    /// Open an event subscription for the given filters.
    async fn subscribe(&self, filters: Vec<String>) -> MagentResult<EventStream>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory [`ContainerHost`] shared by unit tests.

    use std::sync::Mutex;

    use futures::StreamExt;

    use magent_shared::constants::runtime::RUNTIME_NAME;

    use super::*;

    pub(crate) struct FakeHost {
        containers: Mutex<Vec<ContainerDescriptor>>,
    }

    impl FakeHost {
        pub(crate) fn new() -> Self {
            Self {
                containers: Mutex::new(Vec::new()),
            }
        }

        pub(crate) fn with_container(self, descriptor: ContainerDescriptor) -> Self {
            self.add_container(descriptor);
            self
        }

        /// Make a container visible to later listings.
        pub(crate) fn add_container(&self, descriptor: ContainerDescriptor) {
            if let Ok(mut containers) = self.containers.lock() {
                containers.push(descriptor);
            }
        }

        /// Remove a container from later listings.
        pub(crate) fn remove_container(&self, id: &str) {
            if let Ok(mut containers) = self.containers.lock() {
                containers.retain(|c| c.id != id);
            }
        }

        fn all(&self) -> Vec<ContainerDescriptor> {
            self.containers
                .lock()
                .map(|c| c.clone())
                .unwrap_or_default()
        }
    }

    #[async_trait::async_trait]
    impl ContainerHost for FakeHost {
        async fn list_namespaces(&self) -> MagentResult<Vec<String>> {
            let mut namespaces: Vec<String> =
                self.all().into_iter().map(|c| c.namespace).collect();
            namespaces.sort();
            namespaces.dedup();
            Ok(namespaces)
        }

        async fn list_containers(
            &self,
            namespace: &str,
            runtime: &str,
        ) -> MagentResult<Vec<ContainerDescriptor>> {
            Ok(self
                .all()
                .into_iter()
                .filter(|c| c.namespace == namespace && c.runtime_name == runtime)
                .collect())
        }

        async fn get_container(
            &self,
            namespace: &str,
            id: &str,
        ) -> MagentResult<Option<ContainerDescriptor>> {
            Ok(self
                .all()
                .into_iter()
                .find(|c| c.namespace == namespace && c.id == id))
        }

        async fn subscribe(&self, _filters: Vec<String>) -> MagentResult<EventStream> {
            Ok(futures::stream::iter(Vec::new()).boxed())
        }
    }

    /// Descriptor whose OCI spec marks it as the pod sandbox.
    pub(crate) fn sandbox_descriptor(namespace: &str, id: &str) -> ContainerDescriptor {
        descriptor_with_annotation(namespace, id, "sandbox")
    }

    /// Descriptor for a workload container inside a pod.
    pub(crate) fn workload_descriptor(namespace: &str, id: &str) -> ContainerDescriptor {
        descriptor_with_annotation(namespace, id, "container")
    }

    fn descriptor_with_annotation(
        namespace: &str,
        id: &str,
        container_type: &str,
    ) -> ContainerDescriptor {
        let spec = serde_json::json!({
            "ociVersion": "1.0.2",
            "annotations": { "io.kubernetes.cri.container-type": container_type }
        });
        ContainerDescriptor {
            id: id.to_string(),
            namespace: namespace.to_string(),
            runtime_name: RUNTIME_NAME.to_string(),
            spec: Some(spec.to_string().into_bytes()),
        }
    }
}
