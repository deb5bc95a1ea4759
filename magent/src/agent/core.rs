//! Agent assembly and lifecycle.

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use magent_shared::{MagentResult, ShimLayout};

use crate::agent::options::AgentOptions;
use crate::containerd::ContainerHost;
use crate::events::EventListener;
use crate::federation::{MetricsFederator, UdsScraper};
use crate::reconcile::ReconciliationLoop;
use crate::registry::SandboxRegistry;
use crate::server::AppState;
use crate::telemetry::AgentMetrics;

/// The assembled agent: one sandbox registry fed by the event listener and
/// the reconciliation loop, scraped through the federator.
///
/// Construction primes the registry from containerd so the first `/metrics`
/// request already sees the live fleet. [`MetricsAgent::start`] spawns the
/// background loops; the HTTP endpoint is served by the caller with
/// [`MetricsAgent::app_state`] and the shutdown token.
pub struct MetricsAgent {
    options: AgentOptions,
    host: Arc<dyn ContainerHost>,
    registry: SandboxRegistry,
    metrics: AgentMetrics,
    federator: Arc<MetricsFederator>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MetricsAgent {
    /// Validate `options`, assemble the agent and prime the registry with
    /// the sandboxes currently known to containerd.
    ///
    /// # Errors
    ///
    /// Returns an error if the options fail validation or if the initial
    /// reconciliation pass cannot reach containerd.
    pub async fn new(
        options: AgentOptions,
        host: Arc<dyn ContainerHost>,
        metrics: AgentMetrics,
    ) -> MagentResult<Self> {
        options.sanitize()?;

        let registry = SandboxRegistry::new();
        let scraper = Arc::new(UdsScraper::new(
            ShimLayout::new(&options.state_root),
            options.scrape_timeout(),
        ));
        let federator = Arc::new(MetricsFederator::new(
            registry.clone(),
            scraper,
            metrics.clone(),
        ));

        let agent = Self {
            options,
            host,
            registry,
            metrics,
            federator,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        };

        let count = agent.reconciler().resync().await?;
        tracing::info!(sandboxes = count, "Sandbox registry primed");

        Ok(agent)
    }

    fn listener(&self) -> EventListener {
        EventListener::new(
            self.host.clone(),
            self.registry.clone(),
            self.options.runtime_name.clone(),
        )
    }

    fn reconciler(&self) -> ReconciliationLoop {
        ReconciliationLoop::new(
            self.host.clone(),
            self.registry.clone(),
            self.options.runtime_name.clone(),
            self.options.reconcile_interval(),
        )
    }

    /// Spawn the event listener and the reconciliation loop. Each task owns
    /// a child of the agent's shutdown token.
    pub fn start(&mut self) {
        let listener = self.listener();
        let stop = self.shutdown.child_token();
        self.tasks.push(tokio::spawn(async move {
            listener.run(stop).await;
        }));

        let reconciler = self.reconciler();
        let stop = self.shutdown.child_token();
        self.tasks.push(tokio::spawn(async move {
            reconciler.run(stop).await;
        }));

        tracing::debug!("Background loops started");
    }

    /// Shared state for the HTTP handlers.
    pub fn app_state(&self) -> AppState {
        AppState::new(
            self.federator.clone(),
            self.metrics.clone(),
            self.registry.clone(),
        )
    }

    /// Token that stops the whole agent when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Cancel the shutdown token and wait for the background tasks.
    pub async fn shutdown(&mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Background task aborted");
            }
        }
        tracing::info!("Agent stopped");
    }
}
