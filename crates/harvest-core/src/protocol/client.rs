//! ProtocolClient trait for issuing protocol requests to a node.
//!
//! Implementations:
//! - `HttpProtocolClient` - reqwest over HTTP(S), body streamed
//! - `ScriptedClient` - canned responses for tests

use crate::endpoint::Endpoint;
use crate::error::{HarvestError, Result};
use crate::protocol::request::OaiRequest;
use async_trait::async_trait;
use futures::TryStreamExt;
use std::time::Duration;
use tokio::io::AsyncBufRead;
use tokio_util::io::StreamReader;
use tracing::debug;

/// Raw response body, read incrementally by the splitter.
pub type ResponseBody = Box<dyn AsyncBufRead + Send + Unpin>;

/// Issues a single protocol request and hands back the response stream.
///
/// Connection, timeout and HTTP status failures must be reported as
/// `HarvestError::Transport` so callers can tell "node is down" apart from
/// "node sent garbage".
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    async fn fetch(&self, endpoint: &Endpoint, request: &OaiRequest) -> Result<ResponseBody>;
}

/// Timeouts applied to every request.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Whole-request timeout, including reading the body
    pub request_timeout: Duration,
    /// TCP/TLS connect timeout
    pub connect_timeout: Duration,
    /// Sent as the User-Agent header
    pub user_agent: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(120),
            connect_timeout: Duration::from_secs(30),
            user_agent: concat!("harvest-core/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// HTTP implementation of the protocol client.
pub struct HttpProtocolClient {
    http: reqwest::Client,
}

impl HttpProtocolClient {
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone())
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()
            .map_err(|e| HarvestError::Transport(e.to_string()))?;
        Ok(Self { http })
    }
}

#[async_trait]
impl ProtocolClient for HttpProtocolClient {
    async fn fetch(&self, endpoint: &Endpoint, request: &OaiRequest) -> Result<ResponseBody> {
        let url = request.url(endpoint);
        debug!("GET {}", url);

        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| HarvestError::Transport(format!("{} {}: {}", endpoint, request, e)))?;

        let stream = response.bytes_stream().map_err(std::io::Error::other);
        Ok(Box::new(StreamReader::new(Box::pin(stream))))
    }
}
