//! Forwards view requests to a backend's local port and rewrites textual
//! responses so backends mounted under `/view/<descriptor>/` keep working.
//!
//! The rewriting is deliberately surface-level string replacement, matched to
//! the markup the embedded UI actually emits. No HTML parsing.

use crate::entry::{BackendEntry, EntryStatus};
use crate::error::{escape, full_body, GatewayError, HttpBody};
use crate::pool::UpstreamClient;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_TYPE, LOCATION};
use hyper::{Method, Response, StatusCode};
use std::sync::Arc;
use tracing::debug;

/// Headers forwarded in each direction. Requests forward exactly this list;
/// responses forward this list intersected with what the upstream returned.
const PROXY_HEADERS: [&str; 15] = [
    "accept",
    "accept-encoding",
    "accept-language",
    "cache-control",
    "connection",
    "content-length",
    "content-type",
    "cookie",
    "host",
    "origin",
    "pragma",
    "referer",
    "sec-fetch-mode",
    "sec-fetch-site",
    "user-agent",
];

const INSECURE_FONT_ORIGIN: &str = "http://fonts.gstatic.com";
const SECURE_FONT_ORIGIN: &str = "https://fonts.gstatic.com";

pub struct ProxyRewriter {
    client: UpstreamClient,
}

impl ProxyRewriter {
    pub fn new(client: UpstreamClient) -> Self {
        Self { client }
    }

    /// Total requests sent upstream so far, for the status page.
    pub fn request_count(&self) -> u64 {
        self.client.stats().get_total_requests()
    }

    /// Serve one view request against `entry`. `request_path` is the decoded
    /// path carrying the descriptor (no `/view/` prefix); `basepath` is the
    /// canonical slash-terminated external base for this key.
    pub async fn serve(
        &self,
        entry: &Arc<BackendEntry>,
        request_path: &str,
        query: Option<&str>,
        method: &Method,
        headers: &HeaderMap,
        body: Bytes,
        basepath: &str,
    ) -> Result<Response<HttpBody>, GatewayError> {
        if !method_allowed(method) {
            return Err(GatewayError::BadRequest(format!(
                "Unexpected method {method}"
            )));
        }

        match entry.status() {
            EntryStatus::Error => {
                let failure = entry.failure().unwrap_or(crate::entry::LaunchFailure {
                    message: "Backend failed to launch dataset.".to_string(),
                    stdout: String::new(),
                    stderr: String::new(),
                    http_status: 500,
                });
                Err(GatewayError::Launch(failure))
            }
            // A loading entry always gets the placeholder, never an upstream
            // call; the page polls by refreshing.
            EntryStatus::Loading => Ok(loading_page(entry)),
            EntryStatus::Terminated => Err(GatewayError::NotFound(request_path.to_string())),
            EntryStatus::Loaded => {
                self.forward(entry, request_path, query, method, headers, body, basepath)
                    .await
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn forward(
        &self,
        entry: &Arc<BackendEntry>,
        request_path: &str,
        query: Option<&str>,
        method: &Method,
        headers: &HeaderMap,
        body: Bytes,
        basepath: &str,
    ) -> Result<Response<HttpBody>, GatewayError> {
        let descriptor = entry.key().descriptor();
        let subpath = strip_subpath(descriptor, request_path);

        // A bare descriptor path normalizes to the canonical base with its
        // trailing slash, so relative references inside the UI resolve.
        if subpath.is_empty() {
            return Ok(redirect_to(basepath));
        }

        let path_and_query = match query {
            Some(q) if !q.is_empty() => format!("{subpath}?{q}"),
            _ => subpath.to_string(),
        };

        let upstream = self
            .client
            .send(
                method.clone(),
                entry.port(),
                &path_and_query,
                filter_headers(headers),
                body,
            )
            .await?;

        let content_type = upstream
            .headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let upstream_base = format!("http://127.0.0.1:{}", entry.port());
        let out_body: Bytes = if content_type.contains("text") {
            let text = String::from_utf8_lossy(&upstream.body);
            Bytes::from(rewrite_text(&text, &upstream_base, basepath))
        } else {
            upstream.body
        };

        debug!(
            port = entry.port(),
            subpath = %subpath,
            status = %upstream.status,
            content_type = %content_type,
            "proxied request"
        );

        let mut builder = Response::builder().status(upstream.status);
        if let Some(out_headers) = builder.headers_mut() {
            *out_headers = filter_headers(&upstream.headers);
            // Length may have changed under rewriting; always recompute.
            out_headers.remove(CONTENT_LENGTH);
            if let Ok(len) = HeaderValue::from_str(&out_body.len().to_string()) {
                out_headers.insert(CONTENT_LENGTH, len);
            }
        }
        builder
            .body(full_body(out_body))
            .map_err(|e| GatewayError::Internal(format!("building proxied response: {e}")))
    }
}

pub fn method_allowed(method: &Method) -> bool {
    matches!(
        *method,
        Method::GET | Method::HEAD | Method::OPTIONS | Method::PUT | Method::POST
    )
}

/// Keep only the fixed allow-list, preserving values verbatim.
pub fn filter_headers(headers: &HeaderMap) -> HeaderMap {
    let mut filtered = HeaderMap::new();
    for name in PROXY_HEADERS {
        let header_name = HeaderName::from_static(name);
        for value in headers.get_all(&header_name) {
            filtered.append(header_name.clone(), value.clone());
        }
    }
    filtered
}

/// The part of `path` below the key's descriptor; empty when the request is
/// for the descriptor itself.
pub fn strip_subpath<'a>(descriptor: &str, path: &'a str) -> &'a str {
    path.strip_prefix(descriptor).unwrap_or(path)
}

/// Rewrite a textual upstream body for serving under the canonical base:
/// upgrade the font-service origin, replace the literal upstream base, and
/// fix the legacy origin-relative static-asset forms the embedded UI emits.
pub fn rewrite_text(content: &str, upstream_base: &str, canonical_base: &str) -> String {
    content
        .replace(INSECURE_FONT_ORIGIN, SECURE_FONT_ORIGIN)
        .replace(upstream_base, canonical_base)
        .replace("=\"/static/", &format!("=\"{canonical_base}static/"))
        .replace("(/static/", &format!("({canonical_base}static/"))
}

fn redirect_to(basepath: &str) -> Response<HttpBody> {
    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(LOCATION, basepath)
        .header(CONTENT_TYPE, "text/plain")
        .body(full_body(format!("Redirect to {basepath}\n")))
        .expect("valid response builder")
}

/// Placeholder served while the backend is still starting. Carries the
/// startup output captured so far and refreshes itself.
fn loading_page(entry: &Arc<BackendEntry>) -> Response<HttpBody> {
    let launched = chrono::DateTime::from_timestamp(entry.launched_at(), 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| entry.launched_at().to_string());

    let html = format!(
        "<!DOCTYPE html><html><head><title>vizgate</title>\
         <meta http-equiv=\"refresh\" content=\"5\"></head><body>\
         <h1>Loading {}</h1>\
         <p>Launch started at {}.</p>\
         <pre>{}</pre>\
         </body></html>",
        escape(entry.key().dataset.as_str()),
        launched,
        escape(&entry.startup_output())
    );

    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/html; charset=utf-8")
        .header(hyper::header::CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .body(full_body(html))
        .expect("valid response builder")
}
