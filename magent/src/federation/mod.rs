//! Fleet metrics federation.
//!
//! A federation pass snapshots the registry, scrapes every tracked shim
//! concurrently, relabels what came back and merges it into one snapshot.
//! Failures stay per-sandbox: an unreachable shim loses only its own
//! families and bumps the failure counter.

pub mod model;
mod scrape;
pub mod text;

pub use scrape::{ShimScraper, UdsScraper};

use std::sync::Arc;
use std::time::Instant;

use futures::future::join_all;

use magent_shared::constants::metrics::SHIM_FAMILY_PREFIX;
use magent_shared::MagentResult;

use crate::registry::SandboxRegistry;
use crate::telemetry::AgentMetrics;

use model::{AggregatedSnapshot, MetricFamily};

/// Label added to every federated sample naming the sandbox it came from.
pub const SANDBOX_ID_LABEL: &str = "sandbox_id";

/// Prefixes of the shim's own runtime families. Every shim emits these
/// under identical names, so they are moved under the shim prefix before
/// merging.
const SHIM_RUNTIME_PREFIXES: [&str; 2] = ["go_", "process_"];

pub struct MetricsFederator {
    registry: SandboxRegistry,
    scraper: Arc<dyn ShimScraper>,
    metrics: AgentMetrics,
}

impl MetricsFederator {
    pub fn new(
        registry: SandboxRegistry,
        scraper: Arc<dyn ShimScraper>,
        metrics: AgentMetrics,
    ) -> Self {
        Self {
            registry,
            scraper,
            metrics,
        }
    }

    /// Scrape every tracked sandbox and merge the results.
    pub async fn collect(&self) -> MagentResult<AggregatedSnapshot> {
        let start = Instant::now();
        let sandboxes = self.registry.snapshot()?;
        self.metrics.scrape_started(sandboxes.len());

        let fetches = sandboxes.iter().map(|(id, namespace)| {
            let scraper = self.scraper.clone();
            async move { (id.as_str(), scraper.scrape(namespace, id).await) }
        });
        let results = join_all(fetches).await;

        let mut snapshot = AggregatedSnapshot::new();
        for (sandbox_id, result) in results {
            match result.and_then(|body| text::parse_families(&body)) {
                Ok(families) => {
                    for family in families {
                        snapshot.merge(relabel_family(family, sandbox_id));
                    }
                }
                Err(e) => {
                    tracing::warn!(
                        sandbox_id = %sandbox_id,
                        error = %e,
                        "Failed to scrape sandbox metrics"
                    );
                    self.metrics.scrape_failed();
                }
            }
        }

        self.metrics.observe_scrape_duration(start.elapsed());
        tracing::debug!(
            sandboxes = sandboxes.len(),
            families = snapshot.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Federation pass finished"
        );
        Ok(snapshot)
    }
}

/// Tag a family with its source sandbox, moving the shim's own runtime
/// families under the shim prefix first.
fn relabel_family(mut family: MetricFamily, sandbox_id: &str) -> MetricFamily {
    if SHIM_RUNTIME_PREFIXES
        .iter()
        .any(|prefix| family.name.starts_with(prefix))
    {
        family.name = format!("{SHIM_FAMILY_PREFIX}{}", family.name);
    }
    for sample in &mut family.samples {
        sample.push_label(SANDBOX_ID_LABEL, sandbox_id);
    }
    family
}
