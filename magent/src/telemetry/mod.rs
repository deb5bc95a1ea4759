//! Agent-level metrics (aggregate across all sandboxes).
//!
//! Every instrument lives in one explicitly constructed registry owned by
//! [`AgentMetrics`]; nothing registers into a process-global default. The
//! registry's families are served alongside the federated sandbox families
//! on the same endpoint.

use std::time::Duration;

use prometheus::{
    exponential_buckets, Histogram, HistogramOpts, IntCounter, IntGauge, Opts, Registry,
};

use magent_shared::constants::metrics::AGENT_NAMESPACE;
use magent_shared::{MagentError, MagentResult};

use crate::federation::model::{MetricFamily, MetricKind, MetricSample, SampleValue};

/// The agent's own instruments.
///
/// Cloneable, lightweight handle (prometheus instruments are Arc-backed).
#[derive(Clone)]
pub struct AgentMetrics {
    registry: Registry,
    /// Number of sandboxes tracked at the start of the latest pass.
    pub(crate) running_shims: IntGauge,
    /// Total federation passes served.
    pub(crate) scrape_passes: IntCounter,
    /// Individual sandbox scrapes that failed.
    pub(crate) scrape_failures: IntCounter,
    /// Wall time of each federation pass, in milliseconds.
    pub(crate) scrape_durations: Histogram,
}

impl AgentMetrics {
    /// Build the registry and register every instrument.
    pub fn new() -> MagentResult<Self> {
        let registry = Registry::new();

        let running_shims = IntGauge::with_opts(
            Opts::new("running_shim_count", "Number of running sandbox shims.")
                .namespace(AGENT_NAMESPACE),
        )
        .map_err(internal)?;
        registry.register(Box::new(running_shims.clone())).map_err(internal)?;

        let scrape_passes = IntCounter::with_opts(
            Opts::new("scrape_count", "Total metrics federation passes.")
                .namespace(AGENT_NAMESPACE),
        )
        .map_err(internal)?;
        registry.register(Box::new(scrape_passes.clone())).map_err(internal)?;

        let scrape_failures = IntCounter::with_opts(
            Opts::new("scrape_failed_count", "Sandbox scrapes that failed.")
                .namespace(AGENT_NAMESPACE),
        )
        .map_err(internal)?;
        registry.register(Box::new(scrape_failures.clone())).map_err(internal)?;

        let scrape_durations = Histogram::with_opts(
            HistogramOpts::new(
                "scrape_durations_histogram_milliseconds",
                "Wall time of one federation pass in milliseconds.",
            )
            .namespace(AGENT_NAMESPACE)
            .buckets(exponential_buckets(1.0, 4.0, 8).map_err(internal)?),
        )
        .map_err(internal)?;
        registry.register(Box::new(scrape_durations.clone())).map_err(internal)?;

        #[cfg(target_os = "linux")]
        registry
            .register(Box::new(
                prometheus::process_collector::ProcessCollector::for_self(),
            ))
            .map_err(internal)?;

        Ok(Self {
            registry,
            running_shims,
            scrape_passes,
            scrape_failures,
            scrape_durations,
        })
    }

    /// Record the start of a federation pass over `running` sandboxes.
    pub fn scrape_started(&self, running: usize) {
        self.scrape_passes.inc();
        self.running_shims.set(running as i64);
    }

    /// Record one sandbox whose scrape failed.
    pub fn scrape_failed(&self) {
        self.scrape_failures.inc();
    }

    /// Record how long a federation pass took.
    pub fn observe_scrape_duration(&self, elapsed: Duration) {
        self.scrape_durations.observe(elapsed.as_secs_f64() * 1000.0);
    }

    /// Gather the agent's own families, converted to the federation model
    /// so one encoder serves both agent and sandbox metrics.
    pub fn gather(&self) -> Vec<MetricFamily> {
        self.registry
            .gather()
            .into_iter()
            .map(convert_family)
            .collect()
    }
}

fn internal(e: prometheus::Error) -> MagentError {
    MagentError::Internal(format!("metrics registration failed: {e}"))
}

fn convert_family(proto: prometheus::proto::MetricFamily) -> MetricFamily {
    let kind = match proto.get_field_type() {
        prometheus::proto::MetricType::COUNTER => MetricKind::Counter,
        prometheus::proto::MetricType::GAUGE => MetricKind::Gauge,
        prometheus::proto::MetricType::HISTOGRAM => MetricKind::Histogram,
        prometheus::proto::MetricType::SUMMARY => MetricKind::Summary,
        prometheus::proto::MetricType::UNTYPED => MetricKind::Untyped,
    };

    let mut family = MetricFamily::new(proto.get_name(), kind);
    if !proto.get_help().is_empty() {
        family.help = Some(proto.get_help().to_string());
    }

    for metric in proto.get_metric() {
        let labels = metric
            .get_label()
            .iter()
            .map(|pair| (pair.get_name().to_string(), pair.get_value().to_string()))
            .collect();

        let value = match kind {
            MetricKind::Counter => SampleValue::Scalar(metric.get_counter().get_value()),
            MetricKind::Gauge => SampleValue::Scalar(metric.get_gauge().get_value()),
            MetricKind::Untyped => SampleValue::Scalar(metric.get_untyped().get_value()),
            MetricKind::Histogram => {
                let histogram = metric.get_histogram();
                let mut buckets: Vec<(f64, u64)> = histogram
                    .get_bucket()
                    .iter()
                    .map(|b| (b.get_upper_bound(), b.get_cumulative_count()))
                    .collect();
                // The +Inf bucket is implicit in the wire proto.
                if !buckets.last().is_some_and(|(bound, _)| bound.is_infinite()) {
                    buckets.push((f64::INFINITY, histogram.get_sample_count()));
                }
                SampleValue::Histogram {
                    buckets,
                    sum: histogram.get_sample_sum(),
                    count: histogram.get_sample_count(),
                }
            }
            MetricKind::Summary => {
                let summary = metric.get_summary();
                SampleValue::Summary {
                    quantiles: summary
                        .get_quantile()
                        .iter()
                        .map(|q| (q.get_quantile(), q.get_value()))
                        .collect(),
                    sum: summary.get_sample_sum(),
                    count: summary.get_sample_count(),
                }
            }
        };

        family.samples.push(MetricSample { labels, value });
    }

    family
}
