//! Text exposition codec.
//!
//! Parses and writes the newline-delimited metrics text format: `# HELP` and
//! `# TYPE` comment lines followed by one line per sample,
//! `name{label="value",...} number`. Histogram and summary series are
//! assembled into structured values so that relabeling touches every
//! sub-series of a sample consistently.

use std::collections::HashMap;

use magent_shared::{MagentError, MagentResult};

use super::model::{MetricFamily, MetricKind, MetricSample, SampleValue};

// ============================================================================
// PARSING
// ============================================================================

/// Parse an exposition document into families, in encounter order.
///
/// A malformed line fails the whole document: the caller treats the source's
/// contribution as lost rather than serving a partially-decoded family.
pub fn parse_families(text: &str) -> MagentResult<Vec<MetricFamily>> {
    let mut order: Vec<String> = Vec::new();
    let mut builders: HashMap<String, FamilyBuilder> = HashMap::new();

    for raw in text.lines() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }

        if let Some(comment) = line.strip_prefix('#') {
            let comment = comment.trim_start();
            if comment == "EOF" {
                break;
            }
            if let Some(rest) = comment.strip_prefix("HELP ") {
                let (name, help) = split_once_ws(rest);
                builder_entry(&mut order, &mut builders, name).help =
                    Some(unescape_help(help.trim()));
            } else if let Some(rest) = comment.strip_prefix("TYPE ") {
                let (name, kind) = split_once_ws(rest);
                let builder = builder_entry(&mut order, &mut builders, name);
                builder.kind = MetricKind::from_wire(kind.trim());
                builder.declared = true;
            }
            continue;
        }

        let (name, labels, value) = parse_sample_line(line)?;
        route_sample(&mut order, &mut builders, name, labels, value)?;
    }

    let mut families = Vec::with_capacity(order.len());
    for name in order {
        if let Some(builder) = builders.remove(&name) {
            families.push(builder.finish());
        }
    }
    Ok(families)
}

/// Accumulates one family while its lines stream past.
struct FamilyBuilder {
    name: String,
    help: Option<String>,
    kind: MetricKind,
    /// Whether an explicit `# TYPE` line was seen. Sub-series suffixes
    /// (`_bucket`, `_sum`, `_count`) only attach to declared families.
    declared: bool,
    scalars: Vec<MetricSample>,
    /// Histogram/summary series keyed by their residual label set.
    series: Vec<(Vec<(String, String)>, SeriesBuilder)>,
}

#[derive(Default)]
struct SeriesBuilder {
    buckets: Vec<(f64, u64)>,
    quantiles: Vec<(f64, f64)>,
    sum: f64,
    count: u64,
}

impl FamilyBuilder {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            help: None,
            kind: MetricKind::Untyped,
            declared: false,
            scalars: Vec::new(),
            series: Vec::new(),
        }
    }

    fn series_entry(&mut self, labels: Vec<(String, String)>) -> &mut SeriesBuilder {
        let idx = match self.series.iter().position(|(l, _)| *l == labels) {
            Some(i) => i,
            None => {
                self.series.push((labels, SeriesBuilder::default()));
                self.series.len() - 1
            }
        };
        &mut self.series[idx].1
    }

    fn finish(self) -> MetricFamily {
        let samples = match self.kind {
            MetricKind::Histogram => self
                .series
                .into_iter()
                .map(|(labels, s)| MetricSample {
                    labels,
                    value: SampleValue::Histogram {
                        buckets: s.buckets,
                        sum: s.sum,
                        count: s.count,
                    },
                })
                .collect(),
            MetricKind::Summary => self
                .series
                .into_iter()
                .map(|(labels, s)| MetricSample {
                    labels,
                    value: SampleValue::Summary {
                        quantiles: s.quantiles,
                        sum: s.sum,
                        count: s.count,
                    },
                })
                .collect(),
            _ => self.scalars,
        };
        MetricFamily {
            name: self.name,
            help: self.help,
            kind: self.kind,
            samples,
        }
    }
}

fn builder_entry<'a>(
    order: &mut Vec<String>,
    builders: &'a mut HashMap<String, FamilyBuilder>,
    name: &str,
) -> &'a mut FamilyBuilder {
    builders.entry(name.to_string()).or_insert_with(|| {
        order.push(name.to_string());
        FamilyBuilder::new(name)
    })
}

fn declared_kind(builders: &HashMap<String, FamilyBuilder>, name: &str) -> Option<MetricKind> {
    builders.get(name).filter(|b| b.declared).map(|b| b.kind)
}

/// Attach one raw sample line to the family it belongs to, folding
/// histogram/summary sub-series into their structured form.
fn route_sample(
    order: &mut Vec<String>,
    builders: &mut HashMap<String, FamilyBuilder>,
    name: String,
    mut labels: Vec<(String, String)>,
    value: f64,
) -> MagentResult<()> {
    if let Some(base) = name.strip_suffix("_bucket") {
        if declared_kind(builders, base) == Some(MetricKind::Histogram) {
            let le = take_label(&mut labels, "le").ok_or_else(|| {
                MagentError::Decode(format!("histogram bucket without le label: {name}"))
            })?;
            let bound = parse_float(&le)?;
            builder_entry(order, builders, base)
                .series_entry(labels)
                .buckets
                .push((bound, value as u64));
            return Ok(());
        }
    }

    if let Some(base) = name.strip_suffix("_sum") {
        if matches!(
            declared_kind(builders, base),
            Some(MetricKind::Histogram) | Some(MetricKind::Summary)
        ) {
            builder_entry(order, builders, base).series_entry(labels).sum = value;
            return Ok(());
        }
    }

    if let Some(base) = name.strip_suffix("_count") {
        if matches!(
            declared_kind(builders, base),
            Some(MetricKind::Histogram) | Some(MetricKind::Summary)
        ) {
            builder_entry(order, builders, base).series_entry(labels).count = value as u64;
            return Ok(());
        }
    }

    if declared_kind(builders, &name) == Some(MetricKind::Summary) {
        let quantile = take_label(&mut labels, "quantile").ok_or_else(|| {
            MagentError::Decode(format!("summary sample without quantile label: {name}"))
        })?;
        let quantile = parse_float(&quantile)?;
        builder_entry(order, builders, &name)
            .series_entry(labels)
            .quantiles
            .push((quantile, value));
        return Ok(());
    }

    builder_entry(order, builders, &name)
        .scalars
        .push(MetricSample::scalar(labels, value));
    Ok(())
}

fn take_label(labels: &mut Vec<(String, String)>, name: &str) -> Option<String> {
    let idx = labels.iter().position(|(k, _)| k == name)?;
    Some(labels.remove(idx).1)
}

/// Split a sample line into `(name, labels, value)`. An optional trailing
/// timestamp is accepted and dropped.
fn parse_sample_line(line: &str) -> MagentResult<(String, Vec<(String, String)>, f64)> {
    let (name, labels, rest) = match line.find('{') {
        Some(brace) => {
            let name = line[..brace].trim_end();
            let (labels, rest) = parse_labels(&line[brace + 1..])?;
            (name, labels, rest)
        }
        None => {
            let (name, rest) = split_once_ws(line);
            (name, Vec::new(), rest)
        }
    };

    if name.is_empty() {
        return Err(MagentError::Decode(format!("sample line without metric name: {line}")));
    }

    let (value_token, _timestamp) = split_once_ws(rest.trim());
    if value_token.is_empty() {
        return Err(MagentError::Decode(format!("sample line without value: {line}")));
    }
    let value = parse_float(value_token)?;

    Ok((name.to_string(), labels, value))
}

/// Parse a label block starting after `{`; returns the labels and the
/// remainder after the closing `}`.
fn parse_labels(s: &str) -> MagentResult<(Vec<(String, String)>, &str)> {
    let mut labels = Vec::new();
    let mut chars = s.char_indices().peekable();

    loop {
        while matches!(chars.peek(), Some((_, c)) if c.is_whitespace() || *c == ',') {
            chars.next();
        }
        if let Some(&(i, '}')) = chars.peek() {
            return Ok((labels, &s[i + 1..]));
        }
        if chars.peek().is_none() {
            return Err(MagentError::Decode("unterminated label set".to_string()));
        }

        let mut name = String::new();
        loop {
            match chars.next() {
                Some((_, '=')) => break,
                Some((_, c)) if c.is_whitespace() => {
                    return Err(MagentError::Decode(format!(
                        "whitespace in label name: {s}"
                    )));
                }
                Some((_, c)) => name.push(c),
                None => {
                    return Err(MagentError::Decode("unterminated label pair".to_string()));
                }
            }
        }

        match chars.next() {
            Some((_, '"')) => {}
            _ => {
                return Err(MagentError::Decode(format!(
                    "label value must be quoted: {name}"
                )));
            }
        }

        let mut value = String::new();
        loop {
            match chars.next() {
                Some((_, '"')) => break,
                Some((_, '\\')) => match chars.next() {
                    Some((_, '\\')) => value.push('\\'),
                    Some((_, '"')) => value.push('"'),
                    Some((_, 'n')) => value.push('\n'),
                    _ => {
                        return Err(MagentError::Decode(format!(
                            "invalid escape in label value of {name}"
                        )));
                    }
                },
                Some((_, c)) => value.push(c),
                None => {
                    return Err(MagentError::Decode("unterminated label value".to_string()));
                }
            }
        }

        labels.push((name, value));
    }
}

fn split_once_ws(s: &str) -> (&str, &str) {
    match s.split_once(char::is_whitespace) {
        Some((a, b)) => (a, b),
        None => (s, ""),
    }
}

fn parse_float(s: &str) -> MagentResult<f64> {
    s.trim()
        .parse::<f64>()
        .map_err(|_| MagentError::Decode(format!("invalid sample value: {s}")))
}

fn unescape_help(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('\\') => out.push('\\'),
            Some(other) => {
                out.push('\\');
                out.push(other);
            }
            None => out.push('\\'),
        }
    }
    out
}

// ============================================================================
// WRITING
// ============================================================================

/// Append one family to `out` in text exposition syntax.
pub fn write_family(out: &mut String, family: &MetricFamily) {
    if let Some(help) = &family.help {
        out.push_str("# HELP ");
        out.push_str(&family.name);
        out.push(' ');
        out.push_str(&escape_help(help));
        out.push('\n');
    }
    out.push_str("# TYPE ");
    out.push_str(&family.name);
    out.push(' ');
    out.push_str(family.kind.as_str());
    out.push('\n');

    for sample in &family.samples {
        match &sample.value {
            SampleValue::Scalar(v) => {
                write_sample_line(out, &family.name, &sample.labels, None, &format_value(*v));
            }
            SampleValue::Histogram { buckets, sum, count } => {
                let bucket_name = format!("{}_bucket", family.name);
                for (le, c) in buckets {
                    write_sample_line(
                        out,
                        &bucket_name,
                        &sample.labels,
                        Some(("le", &format_value(*le))),
                        &c.to_string(),
                    );
                }
                write_sample_line(
                    out,
                    &format!("{}_sum", family.name),
                    &sample.labels,
                    None,
                    &format_value(*sum),
                );
                write_sample_line(
                    out,
                    &format!("{}_count", family.name),
                    &sample.labels,
                    None,
                    &count.to_string(),
                );
            }
            SampleValue::Summary { quantiles, sum, count } => {
                for (q, v) in quantiles {
                    write_sample_line(
                        out,
                        &family.name,
                        &sample.labels,
                        Some(("quantile", &format_value(*q))),
                        &format_value(*v),
                    );
                }
                write_sample_line(
                    out,
                    &format!("{}_sum", family.name),
                    &sample.labels,
                    None,
                    &format_value(*sum),
                );
                write_sample_line(
                    out,
                    &format!("{}_count", family.name),
                    &sample.labels,
                    None,
                    &count.to_string(),
                );
            }
        }
    }
}

fn write_sample_line(
    out: &mut String,
    name: &str,
    labels: &[(String, String)],
    extra: Option<(&str, &str)>,
    value: &str,
) {
    out.push_str(name);
    if !labels.is_empty() || extra.is_some() {
        out.push('{');
        let mut first = true;
        for (k, v) in labels {
            if !first {
                out.push(',');
            }
            first = false;
            out.push_str(k);
            out.push_str("=\"");
            out.push_str(&escape_label_value(v));
            out.push('"');
        }
        if let Some((k, v)) = extra {
            if !first {
                out.push(',');
            }
            out.push_str(k);
            out.push_str("=\"");
            out.push_str(v);
            out.push('"');
        }
        out.push('}');
    }
    out.push(' ');
    out.push_str(value);
    out.push('\n');
}

/// Escape a label value: backslash, double-quote, newline.
pub fn escape_label_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

fn escape_help(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            _ => out.push(c),
        }
    }
    out
}

/// Format a sample value; infinities use the +Inf/-Inf spelling.
pub fn format_value(v: f64) -> String {
    if v.is_infinite() {
        if v > 0.0 {
            "+Inf".to_string()
        } else {
            "-Inf".to_string()
        }
    } else {
        format!("{v}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_scalar_families() {
        let text = "\
# HELP http_requests_total Total requests served.
# TYPE http_requests_total counter
http_requests_total{method=\"get\",code=\"200\"} 1027
http_requests_total{method=\"post\",code=\"200\"} 3
# TYPE free_memory_bytes gauge
free_memory_bytes 1.25e9
";
        let families = parse_families(text).unwrap();
        assert_eq!(families.len(), 2);

        let requests = &families[0];
        assert_eq!(requests.name, "http_requests_total");
        assert_eq!(requests.kind, MetricKind::Counter);
        assert_eq!(requests.help.as_deref(), Some("Total requests served."));
        assert_eq!(requests.samples.len(), 2);
        assert_eq!(requests.samples[0].label("method"), Some("get"));
        assert_eq!(requests.samples[0].value, SampleValue::Scalar(1027.0));

        let memory = &families[1];
        assert_eq!(memory.kind, MetricKind::Gauge);
        assert_eq!(memory.samples[0].value, SampleValue::Scalar(1.25e9));
        assert!(memory.samples[0].labels.is_empty());
    }

    #[test]
    fn test_parse_histogram_assembles_series() {
        let text = "\
# TYPE request_seconds histogram
request_seconds_bucket{path=\"/a\",le=\"0.1\"} 2
request_seconds_bucket{path=\"/a\",le=\"1\"} 5
request_seconds_bucket{path=\"/a\",le=\"+Inf\"} 6
request_seconds_sum{path=\"/a\"} 3.7
request_seconds_count{path=\"/a\"} 6
request_seconds_bucket{path=\"/b\",le=\"+Inf\"} 1
request_seconds_sum{path=\"/b\"} 0.2
request_seconds_count{path=\"/b\"} 1
";
        let families = parse_families(text).unwrap();
        assert_eq!(families.len(), 1);
        let family = &families[0];
        assert_eq!(family.kind, MetricKind::Histogram);
        assert_eq!(family.samples.len(), 2);

        let a = &family.samples[0];
        assert_eq!(a.label("path"), Some("/a"));
        assert_eq!(a.label("le"), None);
        match &a.value {
            SampleValue::Histogram { buckets, sum, count } => {
                assert_eq!(buckets.len(), 3);
                assert_eq!(buckets[0], (0.1, 2));
                assert!(buckets[2].0.is_infinite());
                assert_eq!(*sum, 3.7);
                assert_eq!(*count, 6);
            }
            other => panic!("expected histogram value, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_summary_assembles_series() {
        let text = "\
# TYPE rpc_duration_seconds summary
rpc_duration_seconds{quantile=\"0.5\"} 0.05
rpc_duration_seconds{quantile=\"0.9\"} 0.1
rpc_duration_seconds_sum 12.3
rpc_duration_seconds_count 100
";
        let families = parse_families(text).unwrap();
        let family = &families[0];
        assert_eq!(family.kind, MetricKind::Summary);
        assert_eq!(family.samples.len(), 1);
        match &family.samples[0].value {
            SampleValue::Summary { quantiles, sum, count } => {
                assert_eq!(quantiles, &vec![(0.5, 0.05), (0.9, 0.1)]);
                assert_eq!(*sum, 12.3);
                assert_eq!(*count, 100);
            }
            other => panic!("expected summary value, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_suffix_without_declaration_is_plain_family() {
        // foo_sum samples with no "# TYPE foo histogram" stay their own family
        let text = "foo_sum 4\n";
        let families = parse_families(text).unwrap();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].name, "foo_sum");
        assert_eq!(families[0].kind, MetricKind::Untyped);
    }

    #[test]
    fn test_parse_label_escapes() {
        let text = "up{path=\"C:\\\\temp\",msg=\"say \\\"hi\\\"\\n\"} 1\n";
        let families = parse_families(text).unwrap();
        let sample = &families[0].samples[0];
        assert_eq!(sample.label("path"), Some("C:\\temp"));
        assert_eq!(sample.label("msg"), Some("say \"hi\"\n"));
    }

    #[test]
    fn test_parse_drops_trailing_timestamp() {
        let text = "up 1 1395066363000\n";
        let families = parse_families(text).unwrap();
        assert_eq!(families[0].samples[0].value, SampleValue::Scalar(1.0));
    }

    #[test]
    fn test_parse_stops_at_eof_marker() {
        let text = "up 1\n# EOF\ndown 0\n";
        let families = parse_families(text).unwrap();
        assert_eq!(families.len(), 1);
        assert_eq!(families[0].name, "up");
    }

    #[test]
    fn test_parse_malformed_lines_fail() {
        assert!(parse_families("up{open=\"x\" 1\n").is_err());
        assert!(parse_families("up{} not-a-number\n").is_err());
        assert!(parse_families("up{a=unquoted} 1\n").is_err());
        assert!(parse_families("up\n").is_err());
    }

    #[test]
    fn test_write_scalar_family() {
        let mut family = MetricFamily::new("jobs_active", MetricKind::Gauge);
        family.help = Some("Active jobs.".to_string());
        family
            .samples
            .push(MetricSample::scalar(vec![("queue".into(), "fast".into())], 3.0));

        let mut out = String::new();
        write_family(&mut out, &family);
        assert_eq!(
            out,
            "# HELP jobs_active Active jobs.\n# TYPE jobs_active gauge\njobs_active{queue=\"fast\"} 3\n"
        );
    }

    #[test]
    fn test_write_histogram_family() {
        let mut family = MetricFamily::new("lat", MetricKind::Histogram);
        family.samples.push(MetricSample {
            labels: vec![("op".into(), "get".into())],
            value: SampleValue::Histogram {
                buckets: vec![(1.0, 2), (f64::INFINITY, 3)],
                sum: 2.5,
                count: 3,
            },
        });

        let mut out = String::new();
        write_family(&mut out, &family);
        assert_eq!(
            out,
            "# TYPE lat histogram\n\
             lat_bucket{op=\"get\",le=\"1\"} 2\n\
             lat_bucket{op=\"get\",le=\"+Inf\"} 3\n\
             lat_sum{op=\"get\"} 2.5\n\
             lat_count{op=\"get\"} 3\n"
        );
    }

    #[test]
    fn test_write_escapes_label_values() {
        let mut family = MetricFamily::new("up", MetricKind::Untyped);
        family
            .samples
            .push(MetricSample::scalar(vec![("p".into(), "a\\b\"c\nd".into())], 1.0));

        let mut out = String::new();
        write_family(&mut out, &family);
        assert!(out.contains("p=\"a\\\\b\\\"c\\nd\""));
    }

    #[test]
    fn test_roundtrip_through_writer_and_parser() {
        let mut family = MetricFamily::new("queue_depth", MetricKind::Gauge);
        family.help = Some("Depth per queue.".to_string());
        family
            .samples
            .push(MetricSample::scalar(vec![("q".into(), "a".into())], 7.0));
        family
            .samples
            .push(MetricSample::scalar(vec![("q".into(), "b".into())], 0.5));

        let mut out = String::new();
        write_family(&mut out, &family);
        let parsed = parse_families(&out).unwrap();
        assert_eq!(parsed, vec![family]);
    }
}
