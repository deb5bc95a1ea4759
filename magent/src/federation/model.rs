//! Data contracts for federated metrics.
//!
//! Pure shapes shared by the text codec, the shim scraper, and the response
//! encoder. No I/O and no merge policy beyond sample concatenation lives
//! here.

use std::collections::HashMap;

/// Metric family type, as declared by a `# TYPE` line.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MetricKind {
    Counter,
    Gauge,
    Histogram,
    Summary,
    Untyped,
}

impl MetricKind {
    /// Wire name used in `# TYPE` lines.
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
            MetricKind::Histogram => "histogram",
            MetricKind::Summary => "summary",
            MetricKind::Untyped => "untyped",
        }
    }

    /// Parse a wire name; anything unrecognized is `Untyped`.
    pub fn from_wire(s: &str) -> Self {
        match s {
            "counter" => MetricKind::Counter,
            "gauge" => MetricKind::Gauge,
            "histogram" => MetricKind::Histogram,
            "summary" => MetricKind::Summary,
            _ => MetricKind::Untyped,
        }
    }
}

/// One observed value.
#[derive(Clone, Debug, PartialEq)]
pub enum SampleValue {
    /// Plain counter/gauge/untyped scalar.
    Scalar(f64),
    /// Histogram series: cumulative `(upper_bound, count)` buckets plus
    /// the `_sum` and `_count` series.
    Histogram {
        buckets: Vec<(f64, u64)>,
        sum: f64,
        count: u64,
    },
    /// Summary series: `(quantile, value)` pairs plus `_sum` and `_count`.
    Summary {
        quantiles: Vec<(f64, f64)>,
        sum: f64,
        count: u64,
    },
}

/// One sample: a label set and its value.
///
/// Label keys are unique. Insertion order is preserved so re-encoded output
/// stays close to what the shim produced.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricSample {
    pub labels: Vec<(String, String)>,
    pub value: SampleValue,
}

impl MetricSample {
    /// Convenience constructor for scalar samples.
    pub fn scalar(labels: Vec<(String, String)>, value: f64) -> Self {
        Self {
            labels,
            value: SampleValue::Scalar(value),
        }
    }

    /// Append a label, replacing any existing value under the same key.
    pub fn push_label(&mut self, name: &str, value: &str) {
        for pair in &mut self.labels {
            if pair.0 == name {
                pair.1 = value.to_string();
                return;
            }
        }
        self.labels.push((name.to_string(), value.to_string()));
    }

    /// Look up a label value by name.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }
}

/// A named group of samples sharing one metric definition.
#[derive(Clone, Debug, PartialEq)]
pub struct MetricFamily {
    pub name: String,
    pub help: Option<String>,
    pub kind: MetricKind,
    pub samples: Vec<MetricSample>,
}

impl MetricFamily {
    pub fn new(name: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            name: name.into(),
            help: None,
            kind,
            samples: Vec::new(),
        }
    }
}

/// Request-scoped merge target of one federation pass.
///
/// Keyed by family name. Merging a family whose name is already present
/// appends its samples; the first-seen help/kind win. Kind mismatches
/// between sources are an upstream operator error and are not reconciled
/// here.
#[derive(Debug, Default)]
pub struct AggregatedSnapshot {
    families: HashMap<String, MetricFamily>,
}

impl AggregatedSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge one family into the snapshot.
    pub fn merge(&mut self, family: MetricFamily) {
        match self.families.get_mut(&family.name) {
            Some(existing) => existing.samples.extend(family.samples),
            None => {
                self.families.insert(family.name.clone(), family);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&MetricFamily> {
        self.families.get(name)
    }

    /// Iterate families in unspecified order.
    pub fn families(&self) -> impl Iterator<Item = &MetricFamily> {
        self.families.values()
    }
}
