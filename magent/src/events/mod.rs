//! Container lifecycle event handling.
//!
//! Subscribes to containerd's create/delete topics and keeps the sandbox
//! registry current. The subscription is supervised: a closed or failed
//! stream is reopened with bounded backoff, and reconciliation repairs
//! anything missed while disconnected.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use prost::Message;
use tokio_util::sync::CancellationToken;

use magent_shared::constants::topics;
use magent_shared::{MagentError, MagentResult};

use crate::containerd::{ContainerHost, EventEnvelope};
use crate::registry::SandboxRegistry;

const CONTAINER_CREATE_URL: &str = "containerd.events.ContainerCreate";
const CONTAINER_DELETE_URL: &str = "containerd.events.ContainerDelete";

/// Subscription retry backoff bounds. Doubles per failed attempt, resets
/// once an event is received.
const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);

/// A containerd envelope decoded into the cases the agent acts on.
#[derive(Clone, Debug, PartialEq)]
pub enum LifecycleEvent {
    /// A container was created; `runtime` names the shim it runs under.
    Created { id: String, runtime: String },
    /// A container was deleted.
    Deleted { id: String },
    /// A topic or payload the agent does not track.
    Ignored,
}

/// Decode an envelope into a [`LifecycleEvent`].
///
/// Unknown topics and missing payloads are `Ignored`; a payload that does
/// not match its topic is a decode error.
pub fn decode_event(envelope: &EventEnvelope) -> MagentResult<LifecycleEvent> {
    let Some(any) = &envelope.event else {
        return Ok(LifecycleEvent::Ignored);
    };

    match envelope.topic.as_str() {
        topics::CONTAINER_CREATE => {
            if !any.type_url.ends_with(CONTAINER_CREATE_URL) {
                return Err(MagentError::Decode(format!(
                    "unexpected payload type {} on {}",
                    any.type_url, envelope.topic
                )));
            }
            let event = containerd_client::events::ContainerCreate::decode(any.value.as_slice())
                .map_err(|e| MagentError::Decode(format!("bad ContainerCreate payload: {e}")))?;
            let runtime = event.runtime.map(|r| r.name).unwrap_or_default();
            Ok(LifecycleEvent::Created {
                id: event.id,
                runtime,
            })
        }
        topics::CONTAINER_DELETE => {
            if !any.type_url.ends_with(CONTAINER_DELETE_URL) {
                return Err(MagentError::Decode(format!(
                    "unexpected payload type {} on {}",
                    any.type_url, envelope.topic
                )));
            }
            let event = containerd_client::events::ContainerDelete::decode(any.value.as_slice())
                .map_err(|e| MagentError::Decode(format!("bad ContainerDelete payload: {e}")))?;
            Ok(LifecycleEvent::Deleted { id: event.id })
        }
        _ => Ok(LifecycleEvent::Ignored),
    }
}

/// Keeps the registry in step with containerd's lifecycle events.
pub struct EventListener {
    host: Arc<dyn ContainerHost>,
    registry: SandboxRegistry,
    runtime: String,
}

impl EventListener {
    /// `runtime` is the shim name whose containers the agent tracks;
    /// creations under any other runtime are skipped.
    pub fn new(
        host: Arc<dyn ContainerHost>,
        registry: SandboxRegistry,
        runtime: impl Into<String>,
    ) -> Self {
        Self {
            host,
            registry,
            runtime: runtime.into(),
        }
    }

    /// Topic filters for the subscription.
    fn filters() -> Vec<String> {
        vec![
            format!("topic==\"{}\"", topics::CONTAINER_CREATE),
            format!("topic==\"{}\"", topics::CONTAINER_DELETE),
        ]
    }

    /// Run until `shutdown` fires, resubscribing whenever the stream ends.
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut backoff = BACKOFF_INITIAL;
        loop {
            match self.host.subscribe(Self::filters()).await {
                Ok(mut stream) => {
                    tracing::info!("Subscribed to container lifecycle events");
                    loop {
                        tokio::select! {
                            _ = shutdown.cancelled() => {
                                tracing::debug!("Event listener stopping");
                                return;
                            }
                            item = stream.next() => match item {
                                Some(Ok(envelope)) => {
                                    backoff = BACKOFF_INITIAL;
                                    self.handle_envelope(&envelope).await;
                                }
                                Some(Err(e)) => {
                                    tracing::warn!(error = %e, "Event stream error, resubscribing");
                                    break;
                                }
                                None => {
                                    tracing::warn!("Event stream closed, resubscribing");
                                    break;
                                }
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "Event subscription failed");
                }
            }

            tokio::select! {
                _ = shutdown.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(BACKOFF_MAX);
        }
    }

    /// Apply one envelope to the registry. Decode failures are logged and
    /// dropped so a bad event cannot wedge the subscription.
    pub(crate) async fn handle_envelope(&self, envelope: &EventEnvelope) {
        match decode_event(envelope) {
            Ok(LifecycleEvent::Created { id, runtime }) => {
                self.handle_created(&envelope.namespace, &id, &runtime).await;
            }
            Ok(LifecycleEvent::Deleted { id }) => {
                if let Err(e) = self.registry.remove(&id) {
                    tracing::error!(container_id = %id, error = %e, "Failed to drop sandbox");
                }
            }
            Ok(LifecycleEvent::Ignored) => {
                tracing::debug!(topic = %envelope.topic, "Ignoring event");
            }
            Err(e) => {
                tracing::warn!(topic = %envelope.topic, error = %e, "Failed to decode event payload");
            }
        }
    }

    async fn handle_created(&self, namespace: &str, id: &str, runtime: &str) {
        if runtime != self.runtime {
            tracing::debug!(
                container_id = %id,
                runtime = %runtime,
                "Skipping container from another runtime"
            );
            return;
        }

        let descriptor = match self.host.get_container(namespace, id).await {
            Ok(Some(descriptor)) => descriptor,
            Ok(None) => {
                tracing::debug!(container_id = %id, "Created container already gone");
                return;
            }
            Err(e) => {
                tracing::warn!(container_id = %id, error = %e, "Failed to fetch created container");
                return;
            }
        };

        if !descriptor.is_sandbox() {
            tracing::debug!(container_id = %id, "Skipping non-sandbox container");
            return;
        }

        match self.registry.insert(id, namespace) {
            Ok(true) => tracing::info!(sandbox_id = %id, namespace = %namespace, "Sandbox started"),
            Ok(false) => {}
            Err(e) => tracing::error!(sandbox_id = %id, error = %e, "Failed to record sandbox"),
        }
    }
}
