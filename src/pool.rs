//! Pooled HTTP client for backend connections.
//!
//! All upstream traffic goes to `127.0.0.1:<port>`; connections are pooled
//! per port so repeated requests to a warm backend reuse sockets. Responses
//! are buffered whole because the proxy may rewrite textual bodies.

use crate::error::GatewayError;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::HeaderMap;
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// A complete upstream response, buffered for rewriting.
#[derive(Debug)]
pub struct UpstreamResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Default)]
pub struct ClientStats {
    total_requests: AtomicU64,
}

impl ClientStats {
    pub fn record_request(&self) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub max_idle_per_host: usize,
    pub idle_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 10,
            idle_timeout: Duration::from_secs(90),
        }
    }
}

/// Connection-pooled client for the spawned backends.
pub struct UpstreamClient {
    client: Client<HttpConnector, Full<Bytes>>,
    stats: Arc<ClientStats>,
}

impl UpstreamClient {
    pub fn new(config: PoolConfig) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);

        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(connector);

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            "upstream client initialized"
        );

        Self {
            client,
            stats: Arc::new(ClientStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<ClientStats> {
        Arc::clone(&self.stats)
    }

    /// Send one buffered request to the backend on `port` and buffer the
    /// whole response.
    pub async fn send(
        &self,
        method: Method,
        port: u16,
        path_and_query: &str,
        headers: HeaderMap,
        body: Bytes,
    ) -> Result<UpstreamResponse, GatewayError> {
        let uri = format!("http://127.0.0.1:{port}{path_and_query}");

        let mut builder = Request::builder().method(method).uri(&uri);
        for (name, value) in headers.iter() {
            builder = builder.header(name, value);
        }
        let request = builder
            .body(Full::new(body))
            .map_err(|e| GatewayError::Upstream(format!("building request for {uri}: {e}")))?;

        self.stats.record_request();

        let response = self
            .client
            .request(request)
            .await
            .map_err(|e| GatewayError::Upstream(format!("request to {uri} failed: {e}")))?;

        let (parts, body) = response.into_parts();
        let body = body
            .collect()
            .await
            .map_err(|e| GatewayError::Upstream(format!("reading body from {uri}: {e}")))?
            .to_bytes();

        Ok(UpstreamResponse {
            status: parts.status,
            headers: parts.headers,
            body,
        })
    }
}

impl Default for UpstreamClient {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}
