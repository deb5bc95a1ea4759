//! Shim metrics scraping.
//!
//! Each sandbox's shim serves plain HTTP on an abstract unix socket whose
//! name it publishes under the containerd task state directory. The scraper
//! reads that name, dials the socket and fetches the exposition text, all
//! under one per-sandbox deadline so a wedged shim cannot stall a pass.

use std::os::linux::net::SocketAddrExt;
use std::os::unix::net::{SocketAddr, UnixStream as StdUnixStream};
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;

use magent_shared::constants::metrics::SHIM_METRICS_PATH;
use magent_shared::{MagentError, MagentResult, ShimLayout};

/// Fetches the metrics exposition text from one sandbox's shim.
#[async_trait::async_trait]
pub trait ShimScraper: Send + Sync {
    async fn scrape(&self, namespace: &str, sandbox_id: &str) -> MagentResult<String>;
}

/// Scraper for shims reachable over their abstract unix socket.
pub struct UdsScraper {
    layout: ShimLayout,
    timeout: Duration,
}

impl UdsScraper {
    pub fn new(layout: ShimLayout, timeout: Duration) -> Self {
        Self { layout, timeout }
    }

    async fn fetch(&self, namespace: &str, sandbox_id: &str) -> MagentResult<String> {
        let path = self.layout.address_file(namespace, sandbox_id);
        let raw = tokio::fs::read_to_string(&path).await.map_err(|e| {
            MagentError::Network(format!("failed to read shim address {}: {e}", path.display()))
        })?;
        let address = raw.trim();
        if address.is_empty() {
            return Err(MagentError::Network(format!(
                "shim address file {} is empty",
                path.display()
            )));
        }

        let stream = connect_abstract(address)?;
        let (mut sender, conn) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| MagentError::Network(format!("shim handshake failed: {e}")))?;
        tokio::spawn(async move {
            if let Err(e) = conn.await {
                tracing::debug!(error = %e, "Shim connection closed with error");
            }
        });

        let request = hyper::Request::builder()
            .uri(SHIM_METRICS_PATH)
            .header(hyper::header::HOST, "shim")
            .body(Empty::<Bytes>::new())
            .map_err(|e| MagentError::Internal(format!("failed to build shim request: {e}")))?;

        let response = sender
            .send_request(request)
            .await
            .map_err(|e| MagentError::Network(format!("shim request failed: {e}")))?;
        if response.status() != hyper::StatusCode::OK {
            return Err(MagentError::Network(format!(
                "shim returned {}",
                response.status()
            )));
        }

        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| MagentError::Network(format!("failed to read shim response: {e}")))?
            .to_bytes();

        String::from_utf8(body.to_vec())
            .map_err(|e| MagentError::Decode(format!("shim response is not UTF-8: {e}")))
    }
}

#[async_trait::async_trait]
impl ShimScraper for UdsScraper {
    async fn scrape(&self, namespace: &str, sandbox_id: &str) -> MagentResult<String> {
        tokio::time::timeout(self.timeout, self.fetch(namespace, sandbox_id))
            .await
            .map_err(|_| {
                MagentError::Network(format!(
                    "metrics fetch for sandbox {sandbox_id} timed out after {:?}",
                    self.timeout
                ))
            })?
    }
}

/// Connect to an abstract unix socket. `name` is the socket name without
/// the leading NUL byte.
fn connect_abstract(name: &str) -> MagentResult<tokio::net::UnixStream> {
    let addr = SocketAddr::from_abstract_name(name.as_bytes())
        .map_err(|e| MagentError::Network(format!("invalid shim socket name {name}: {e}")))?;
    let stream = StdUnixStream::connect_addr(&addr)
        .map_err(|e| MagentError::Network(format!("failed to connect to shim socket {name}: {e}")))?;
    stream.set_nonblocking(true)?;
    Ok(tokio::net::UnixStream::from_std(stream)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_missing_address_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let scraper = UdsScraper::new(ShimLayout::new(dir.path()), Duration::from_secs(1));

        let err = scraper.scrape("default", "no-such-sandbox").await.unwrap_err();
        assert!(err.to_string().contains("magent_address"));
    }

    #[tokio::test]
    async fn test_empty_address_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ShimLayout::new(dir.path());
        let address_file = layout.address_file("default", "s1");
        std::fs::create_dir_all(address_file.parent().unwrap()).unwrap();
        std::fs::write(&address_file, "\n").unwrap();

        let scraper = UdsScraper::new(layout, Duration::from_secs(1));
        let err = scraper.scrape("default", "s1").await.unwrap_err();
        assert!(err.to_string().contains("empty"));
    }

    #[tokio::test]
    async fn test_unreachable_shim_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ShimLayout::new(dir.path());
        let address_file = layout.address_file("default", "s1");
        std::fs::create_dir_all(address_file.parent().unwrap()).unwrap();
        std::fs::write(&address_file, format!("magent-test-nobody-{}", std::process::id())).unwrap();

        let scraper = UdsScraper::new(layout, Duration::from_secs(1));
        let err = scraper.scrape("default", "s1").await.unwrap_err();
        assert!(err.to_string().contains("connect"));
    }
}
