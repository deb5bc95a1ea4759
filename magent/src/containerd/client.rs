//! Containerd gRPC client.
//!
//! Connects to the containerd socket with lazy initialization so the
//! connection happens in the correct async runtime.

use std::path::PathBuf;
use std::sync::Arc;

use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::events_client::EventsClient;
use containerd_client::services::v1::namespaces_client::NamespacesClient;
use containerd_client::services::v1::{
    Container, GetContainerRequest, ListContainersRequest, ListNamespacesRequest,
    SubscribeRequest,
};
use containerd_client::with_namespace;
use futures::StreamExt;
use tokio::sync::OnceCell;
use tonic::transport::Channel;
use tonic::Request;

use magent_shared::{MagentError, MagentResult};

use super::{ContainerDescriptor, ContainerHost, EventEnvelope, EventStream};

/// Lazy gRPC connection to containerd.
///
/// Connects on first use; every service client shares the one channel.
#[derive(Clone)]
pub struct ContainerdHost {
    address: PathBuf,
    channel: Arc<OnceCell<Channel>>,
}

impl ContainerdHost {
    /// Create a lazy client for the containerd socket at `address`
    /// (does not connect immediately).
    pub fn new(address: impl Into<PathBuf>) -> Self {
        Self {
            address: address.into(),
            channel: Arc::new(OnceCell::new()),
        }
    }

    /// Get or establish the channel.
    async fn channel(&self) -> MagentResult<Channel> {
        let channel = self
            .channel
            .get_or_try_init(|| async {
                tracing::debug!(address = %self.address.display(), "Connecting to containerd");
                containerd_client::connect(&self.address).await.map_err(|e| {
                    MagentError::Containerd(format!(
                        "failed to connect to containerd at {}: {}",
                        self.address.display(),
                        e
                    ))
                })
            })
            .await?;

        Ok(channel.clone())
    }
}

fn to_descriptor(namespace: &str, container: Container) -> ContainerDescriptor {
    ContainerDescriptor {
        id: container.id,
        namespace: namespace.to_string(),
        runtime_name: container.runtime.map(|r| r.name).unwrap_or_default(),
        spec: container.spec.map(|any| any.value),
    }
}

#[async_trait::async_trait]
impl ContainerHost for ContainerdHost {
    async fn list_namespaces(&self) -> MagentResult<Vec<String>> {
        let channel = self.channel().await?;
        let mut client = NamespacesClient::new(channel);

        let response = client
            .list(ListNamespacesRequest {
                filter: String::new(),
            })
            .await
            .map_err(|e| MagentError::Containerd(format!("namespace listing failed: {e}")))?
            .into_inner();

        Ok(response.namespaces.into_iter().map(|ns| ns.name).collect())
    }

    async fn list_containers(
        &self,
        namespace: &str,
        runtime: &str,
    ) -> MagentResult<Vec<ContainerDescriptor>> {
        let channel = self.channel().await?;
        let mut client = ContainersClient::new(channel);

        let req = ListContainersRequest {
            filters: vec![format!("runtime.name==\"{}\"", runtime)],
        };
        let req = with_namespace!(req, namespace);

        let response = client
            .list(req)
            .await
            .map_err(|e| {
                MagentError::Containerd(format!(
                    "container listing failed in namespace {namespace}: {e}"
                ))
            })?
            .into_inner();

        Ok(response
            .containers
            .into_iter()
            .map(|c| to_descriptor(namespace, c))
            .collect())
    }

    async fn get_container(
        &self,
        namespace: &str,
        id: &str,
    ) -> MagentResult<Option<ContainerDescriptor>> {
        let channel = self.channel().await?;
        let mut client = ContainersClient::new(channel);

        let req = GetContainerRequest { id: id.to_string() };
        let req = with_namespace!(req, namespace);

        match client.get(req).await {
            Ok(response) => Ok(response
                .into_inner()
                .container
                .map(|c| to_descriptor(namespace, c))),
            Err(status) if status.code() == tonic::Code::NotFound => Ok(None),
            Err(status) => Err(MagentError::Containerd(format!(
                "container query failed for {id} in namespace {namespace}: {status}"
            ))),
        }
    }

    async fn subscribe(&self, filters: Vec<String>) -> MagentResult<EventStream> {
        let channel = self.channel().await?;
        let mut client = EventsClient::new(channel);

        let stream = client
            .subscribe(SubscribeRequest { filters })
            .await
            .map_err(|e| MagentError::Containerd(format!("event subscription failed: {e}")))?
            .into_inner();

        let mapped = stream.map(|item| {
            let envelope = item
                .map_err(|status| MagentError::Containerd(format!("event stream error: {status}")))?;
            Ok(EventEnvelope {
                namespace: envelope.namespace,
                topic: envelope.topic,
                event: envelope.event,
            })
        });

        Ok(mapped.boxed())
    }
}
