//! Response encoding for the metrics endpoint.
//!
//! Picks the exposition format from the Accept header, renders the agent's
//! own families ahead of the federated ones, and gzips the document when the
//! client advertises support. Compression buffers come from a small pool;
//! the checkout guard returns them on every exit path.

use std::io::Write;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use bytes::Bytes;
use flate2::write::GzEncoder;
use flate2::Compression;
use parking_lot::Mutex;

use magent_shared::MagentResult;

use crate::federation::model::{AggregatedSnapshot, MetricFamily};
use crate::federation::text;

/// Idle compression buffers kept around between scrapes.
const POOL_MAX_IDLE: usize = 4;

/// Exposition format chosen from the Accept header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ExpositionFormat {
    /// `text/plain; version=0.0.4`, the default.
    Text,
    /// `application/openmetrics-text`, same body plus the `# EOF` trailer.
    OpenMetrics,
}

impl ExpositionFormat {
    /// Pick the format: OpenMetrics when the client lists its media type,
    /// plain text otherwise.
    pub fn negotiate(accept: Option<&str>) -> Self {
        let Some(accept) = accept else {
            return Self::Text;
        };
        for entry in accept.split(',') {
            let media = entry.split(';').next().unwrap_or("").trim();
            if media.eq_ignore_ascii_case("application/openmetrics-text") {
                return Self::OpenMetrics;
            }
        }
        Self::Text
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Text => "text/plain; version=0.0.4; charset=utf-8",
            Self::OpenMetrics => "application/openmetrics-text; version=0.0.1; charset=utf-8",
        }
    }
}

/// Whether the Accept-Encoding header lists gzip.
pub fn accepts_gzip(accept_encoding: Option<&str>) -> bool {
    let Some(value) = accept_encoding else {
        return false;
    };
    value
        .split(',')
        .any(|entry| entry.split(';').next().unwrap_or("").trim().eq_ignore_ascii_case("gzip"))
}

/// A rendered response body with the headers it needs.
pub struct EncodedBody {
    pub content_type: &'static str,
    pub content_encoding: Option<&'static str>,
    pub body: Bytes,
}

/// Renders exposition documents, reusing compression buffers.
pub struct ResponseEncoder {
    pool: Arc<BufferPool>,
}

impl ResponseEncoder {
    pub fn new() -> Self {
        Self {
            pool: Arc::new(BufferPool::new(POOL_MAX_IDLE)),
        }
    }

    /// Render one exposition document.
    ///
    /// `own` families come first so the agent's health metrics stay
    /// readable even when the federated snapshot is empty. Federated
    /// families are emitted in name order.
    pub fn encode(
        &self,
        own: &[MetricFamily],
        federated: &AggregatedSnapshot,
        format: ExpositionFormat,
        gzip: bool,
    ) -> MagentResult<EncodedBody> {
        let mut document = String::with_capacity(4096);
        for family in own {
            text::write_family(&mut document, family);
        }
        let mut families: Vec<&MetricFamily> = federated.families().collect();
        families.sort_by(|a, b| a.name.cmp(&b.name));
        for family in families {
            text::write_family(&mut document, family);
        }
        if format == ExpositionFormat::OpenMetrics {
            document.push_str("# EOF\n");
        }

        if gzip {
            let body = self.compress(document.as_bytes())?;
            Ok(EncodedBody {
                content_type: format.content_type(),
                content_encoding: Some("gzip"),
                body,
            })
        } else {
            Ok(EncodedBody {
                content_type: format.content_type(),
                content_encoding: None,
                body: Bytes::from(document),
            })
        }
    }

    fn compress(&self, payload: &[u8]) -> MagentResult<Bytes> {
        let mut buffer = self.pool.checkout();
        let mut encoder = GzEncoder::new(&mut *buffer, Compression::default());
        encoder.write_all(payload)?;
        encoder.finish()?;
        Ok(Bytes::copy_from_slice(&buffer))
    }
}

impl Default for ResponseEncoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Bounded stash of reusable output buffers.
struct BufferPool {
    buffers: Mutex<Vec<Vec<u8>>>,
    max_idle: usize,
}

impl BufferPool {
    fn new(max_idle: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::new()),
            max_idle,
        }
    }

    fn checkout(self: &Arc<Self>) -> PooledBuffer {
        let buffer = self.buffers.lock().pop().unwrap_or_default();
        PooledBuffer {
            buffer,
            pool: Arc::clone(self),
        }
    }

    fn checkin(&self, mut buffer: Vec<u8>) {
        buffer.clear();
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_idle {
            buffers.push(buffer);
        }
    }
}

/// Checked-out pool buffer; returns to the pool when dropped.
struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        self.pool.checkin(std::mem::take(&mut self.buffer));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Read;

    use crate::federation::model::{MetricKind, MetricSample};

    fn gauge(name: &str, value: f64) -> MetricFamily {
        let mut family = MetricFamily::new(name, MetricKind::Gauge);
        family.samples.push(MetricSample::scalar(Vec::new(), value));
        family
    }

    #[test]
    fn test_negotiate_defaults_to_text() {
        assert_eq!(ExpositionFormat::negotiate(None), ExpositionFormat::Text);
        assert_eq!(
            ExpositionFormat::negotiate(Some("text/plain")),
            ExpositionFormat::Text
        );
        assert_eq!(
            ExpositionFormat::negotiate(Some("*/*")),
            ExpositionFormat::Text
        );
    }

    #[test]
    fn test_negotiate_picks_openmetrics_when_listed() {
        assert_eq!(
            ExpositionFormat::negotiate(Some("application/openmetrics-text; version=0.0.1")),
            ExpositionFormat::OpenMetrics
        );
        assert_eq!(
            ExpositionFormat::negotiate(Some(
                "text/plain;q=0.5, application/openmetrics-text;q=0.9"
            )),
            ExpositionFormat::OpenMetrics
        );
    }

    #[test]
    fn test_accepts_gzip_token_forms() {
        assert!(!accepts_gzip(None));
        assert!(!accepts_gzip(Some("identity")));
        assert!(accepts_gzip(Some("gzip")));
        assert!(accepts_gzip(Some("deflate, gzip;q=1.0")));
        assert!(accepts_gzip(Some("GZIP")));
        // "gzip" must be a whole token, not a substring
        assert!(!accepts_gzip(Some("x-gzip-like")));
    }

    #[test]
    fn test_encode_puts_own_families_first() {
        let encoder = ResponseEncoder::new();
        let own = vec![gauge("magent_scrape_count", 1.0)];
        let mut federated = AggregatedSnapshot::new();
        federated.merge(gauge("aaa_guest_load", 0.5));

        let encoded = encoder
            .encode(&own, &federated, ExpositionFormat::Text, false)
            .unwrap();

        let body = String::from_utf8(encoded.body.to_vec()).unwrap();
        let own_at = body.find("magent_scrape_count").unwrap();
        let federated_at = body.find("aaa_guest_load").unwrap();
        assert!(own_at < federated_at);
        assert_eq!(encoded.content_type, "text/plain; version=0.0.4; charset=utf-8");
        assert!(encoded.content_encoding.is_none());
    }

    #[test]
    fn test_encode_sorts_federated_families() {
        let encoder = ResponseEncoder::new();
        let mut federated = AggregatedSnapshot::new();
        federated.merge(gauge("zzz_metric", 1.0));
        federated.merge(gauge("aaa_metric", 1.0));

        let encoded = encoder
            .encode(&[], &federated, ExpositionFormat::Text, false)
            .unwrap();

        let body = String::from_utf8(encoded.body.to_vec()).unwrap();
        assert!(body.find("aaa_metric").unwrap() < body.find("zzz_metric").unwrap());
    }

    #[test]
    fn test_openmetrics_ends_with_eof() {
        let encoder = ResponseEncoder::new();
        let encoded = encoder
            .encode(
                &[gauge("up", 1.0)],
                &AggregatedSnapshot::new(),
                ExpositionFormat::OpenMetrics,
                false,
            )
            .unwrap();

        let body = String::from_utf8(encoded.body.to_vec()).unwrap();
        assert!(body.ends_with("# EOF\n"));
        assert_eq!(
            encoded.content_type,
            "application/openmetrics-text; version=0.0.1; charset=utf-8"
        );
    }

    #[test]
    fn test_gzip_roundtrip() {
        let encoder = ResponseEncoder::new();
        let own = vec![gauge("up", 1.0)];

        let plain = encoder
            .encode(&own, &AggregatedSnapshot::new(), ExpositionFormat::Text, false)
            .unwrap();
        let compressed = encoder
            .encode(&own, &AggregatedSnapshot::new(), ExpositionFormat::Text, true)
            .unwrap();

        assert_eq!(compressed.content_encoding, Some("gzip"));
        let mut decoder = flate2::read::GzDecoder::new(&compressed.body[..]);
        let mut decompressed = String::new();
        decoder.read_to_string(&mut decompressed).unwrap();
        assert_eq!(decompressed.as_bytes(), &plain.body[..]);
    }

    #[test]
    fn test_pool_reuses_buffers() {
        let encoder = ResponseEncoder::new();
        let own = vec![gauge("up", 1.0)];

        for _ in 0..3 {
            encoder
                .encode(&own, &AggregatedSnapshot::new(), ExpositionFormat::Text, true)
                .unwrap();
        }

        // Sequential encodes hand the same buffer back and forth.
        assert_eq!(encoder.pool.buffers.lock().len(), 1);
    }
}
