//! HTTP front of the gateway: routing, resolution, and the operator pages.
//!
//! One accept loop feeds hyper's auto builder so both HTTP/1.1 and h2c work.
//! Every request gets a request id (propagated from `X-Request-Id` or
//! generated) that threads through the logs.

use crate::cache::BackendCache;
use crate::config::Config;
use crate::entry::{current_timestamp, EntrySnapshot};
use crate::error::{escape, full_body, html_response, GatewayError, HttpBody};
use crate::key::BackendKey;
use crate::proxy::ProxyRewriter;
use crate::source::ItemSource;
use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::header::{HeaderMap, CACHE_CONTROL, CONTENT_TYPE, EXPIRES, LOCATION, PRAGMA};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const X_REQUEST_ID: &str = "x-request-id";
const X_FORWARDED_FOR: &str = "x-forwarded-for";

/// Shared state behind every connection handler.
struct GatewayState {
    config: Config,
    cache: Arc<BackendCache>,
    sources: Vec<Arc<dyn ItemSource>>,
    rewriter: ProxyRewriter,
    /// Gateway start time, reported by `/cache_status.json`.
    started_at: i64,
}

pub struct Gateway {
    state: Arc<GatewayState>,
}

impl Gateway {
    pub fn new(
        config: Config,
        cache: Arc<BackendCache>,
        sources: Vec<Arc<dyn ItemSource>>,
    ) -> Self {
        Self {
            state: Arc::new(GatewayState {
                config,
                cache,
                sources,
                rewriter: ProxyRewriter::new(Default::default()),
                started_at: current_timestamp(),
            }),
        }
    }

    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr: SocketAddr = ([0, 0, 0, 0], self.state.config.gateway_port).into();
        let listener = TcpListener::bind(addr).await?;
        info!(addr = %addr, "gateway listening");

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, client_addr)) => {
                            let state = Arc::clone(&self.state);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, client_addr, state).await {
                                    debug!(addr = %client_addr, error = %e, "connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("gateway shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(
    stream: tokio::net::TcpStream,
    client_addr: SocketAddr,
    state: Arc<GatewayState>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { handle_request(req, state, client_addr).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection_with_upgrades(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("connection error: {}", e))?;

    Ok(())
}

/// What a request path means. `source` is `None` for the un-prefixed forms,
/// which resolve against the default (first) source.
#[derive(Debug, PartialEq, Eq)]
enum Route<'a> {
    Index,
    View { source: Option<&'a str>, rest: &'a str },
    Relaunch { source: Option<&'a str>, rest: &'a str },
    Terminate { source: Option<&'a str>, rest: &'a str },
    CacheStatus,
    CacheStatusJson,
    IpAddress,
    Unknown,
}

fn route(path: &str) -> Route<'_> {
    if path == "/" {
        return Route::Index;
    }
    if let Some(rest) = path.strip_prefix("/source/") {
        let Some((source, tail)) = rest.split_once('/') else {
            return Route::Unknown;
        };
        return operation_route(tail, Some(source)).unwrap_or(Route::Unknown);
    }
    match path {
        "/cache_status" => Route::CacheStatus,
        "/cache_status.json" => Route::CacheStatusJson,
        "/metadata/ip_address" => Route::IpAddress,
        _ => path
            .strip_prefix('/')
            .and_then(|tail| operation_route(tail, None))
            .unwrap_or(Route::Unknown),
    }
}

/// Match the `view/`, `relaunch/`, `terminate/` operations against a path
/// with its leading (and any `/source/<name>/`) prefix already removed.
fn operation_route<'a>(tail: &'a str, source: Option<&'a str>) -> Option<Route<'a>> {
    if let Some(rest) = tail.strip_prefix("view/") {
        return Some(Route::View { source, rest });
    }
    if let Some(rest) = tail.strip_prefix("relaunch/") {
        return Some(Route::Relaunch { source, rest });
    }
    if let Some(rest) = tail.strip_prefix("terminate/") {
        return Some(Route::Terminate { source, rest });
    }
    None
}

async fn handle_request(
    req: Request<Incoming>,
    state: Arc<GatewayState>,
    client_addr: SocketAddr,
) -> Result<Response<HttpBody>, hyper::Error> {
    let request_id = req
        .headers()
        .get(X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .map(String::from)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let client = client_ip(
        req.headers(),
        client_addr.ip(),
        state.config.trust_proxy_depth,
    );

    let (parts, body) = req.into_parts();
    let path = parts.uri.path().to_string();
    let query = parts.uri.query().map(String::from);

    debug!(
        request_id = %request_id,
        method = %parts.method,
        path = %path,
        client = %client,
        "request"
    );

    let result = match route(&path) {
        Route::Index => index_page(&state),
        Route::View { source, rest } => {
            let body = body.collect().await?.to_bytes();
            serve_view(
                &state,
                source,
                rest,
                query.as_deref(),
                &parts.method,
                &parts.headers,
                body,
            )
            .await
        }
        Route::Relaunch { source, rest } => relaunch(&state, source, rest, query.as_deref()),
        Route::Terminate { source, rest } => terminate(&state, source, rest),
        Route::CacheStatus => cache_status_page(&state),
        Route::CacheStatusJson => cache_status_json(&state),
        Route::IpAddress => ip_address(&state),
        Route::Unknown => Err(GatewayError::NotFound(path.clone())),
    };

    Ok(result.unwrap_or_else(|e| {
        let status = e.status();
        if status.is_server_error() {
            warn!(request_id = %request_id, path = %path, error = %e, "request failed");
        } else {
            debug!(request_id = %request_id, path = %path, error = %e, "request rejected");
        }
        e.into_response()
    }))
}

/// Pick the source a route addresses. `None` means the un-prefixed route
/// form, which binds to the first configured source.
fn select_source<'a>(
    state: &'a GatewayState,
    name: Option<&str>,
) -> Result<&'a Arc<dyn ItemSource>, GatewayError> {
    match name {
        None => state
            .sources
            .first()
            .ok_or_else(|| GatewayError::Internal("no item sources configured".to_string())),
        Some(name) => state
            .sources
            .iter()
            .find(|s| s.name() == name)
            .ok_or_else(|| GatewayError::NotFound(format!("source {name}"))),
    }
}

fn decode_path(rest: &str) -> Result<String, GatewayError> {
    urlencoding::decode(rest)
        .map(|decoded| decoded.into_owned())
        .map_err(|e| GatewayError::BadRequest(format!("malformed path encoding: {e}")))
}

async fn serve_view(
    state: &Arc<GatewayState>,
    source_name: Option<&str>,
    rest: &str,
    query: Option<&str>,
    method: &hyper::Method,
    headers: &HeaderMap,
    body: hyper::body::Bytes,
) -> Result<Response<HttpBody>, GatewayError> {
    let source = select_source(state, source_name)?;
    let include_source = source_name.is_some();
    let decoded = decode_path(rest)?;

    // Warm path first: sub-resource requests for a running backend skip
    // filesystem resolution entirely.
    let entry = match state.cache.find_by_path(source.name(), &decoded)? {
        Some(entry) => entry,
        None => {
            let lookup = source.lookup(&decoded)?;
            state
                .cache
                .get_or_create(lookup.key, lookup.spec, &state.config.extra_scripts)
                .await?
        }
    };

    entry.touch();
    let basepath = entry
        .key()
        .gateway_basepath(&state.config.external_base(), include_source);

    state
        .rewriter
        .serve(&entry, &decoded, query, method, headers, body, &basepath)
        .await
}

/// Terminate the entry for a path (if any) and bounce back to the view URL,
/// which relaunches it. The original query string rides along.
fn relaunch(
    state: &Arc<GatewayState>,
    source_name: Option<&str>,
    rest: &str,
    query: Option<&str>,
) -> Result<Response<HttpBody>, GatewayError> {
    let source = select_source(state, source_name)?;
    let decoded = decode_path(rest)?;

    terminate_if_present(state, source.name(), &decoded)?;

    let view = match source_name {
        Some(name) => format!("/source/{name}/view/{rest}"),
        None => format!("/view/{rest}"),
    };
    let location = match query {
        Some(q) if !q.is_empty() => format!("{view}?{q}"),
        _ => view,
    };
    redirect(&location)
}

fn terminate(
    state: &Arc<GatewayState>,
    source_name: Option<&str>,
    rest: &str,
) -> Result<Response<HttpBody>, GatewayError> {
    let source = select_source(state, source_name)?;
    let decoded = decode_path(rest)?;
    terminate_if_present(state, source.name(), &decoded)?;
    redirect("/cache_status")
}

/// Terminate the matching entry in place. The entry stays listed — holding
/// its port lease and showing in `/cache_status` — until the reaper evicts
/// it; only eviction removes entries from the list.
fn terminate_if_present(
    state: &Arc<GatewayState>,
    source: &str,
    path: &str,
) -> Result<(), GatewayError> {
    if let Some(entry) = state.cache.find_by_path(source, path)? {
        info!(dataset = %entry.key().dataset, port = entry.port(), "terminating on request");
        entry.terminate();
    }
    Ok(())
}

fn redirect(location: &str) -> Result<Response<HttpBody>, GatewayError> {
    Response::builder()
        .status(StatusCode::FOUND)
        .header(LOCATION, location)
        .body(full_body(format!("Redirect to {location}\n")))
        .map_err(|e| GatewayError::Internal(format!("building redirect: {e}")))
}

fn index_page(state: &Arc<GatewayState>) -> Result<Response<HttpBody>, GatewayError> {
    let multi_source = state.sources.len() > 1;
    let mut sections = String::new();

    for source in &state.sources {
        let items = source.list_items()?;
        sections.push_str(&format!("<h2>{}</h2><ul>", escape(source.name())));
        for item in items {
            let key = BackendKey::new(source.name(), item.dataset.clone(), None);
            sections.push_str(&format!(
                "<li><a href=\"{}\">{}</a>",
                key.view_path(multi_source),
                escape(&item.dataset)
            ));
            if state.config.enable_annotations {
                sections.push_str("<ul>");
                for annotation in &item.annotations {
                    let key = BackendKey::new(
                        source.name(),
                        item.dataset.clone(),
                        Some(annotation.clone()),
                    );
                    sections.push_str(&format!(
                        "<li><a href=\"{}\">{}</a></li>",
                        key.view_path(multi_source),
                        escape(annotation)
                    ));
                }
                sections.push_str("</ul>");
            }
            sections.push_str("</li>");
        }
        sections.push_str("</ul>");
    }

    let html = format!(
        "<!DOCTYPE html><html><head><title>vizgate</title></head><body>\
         <h1>vizgate</h1>{sections}\
         <p><a href=\"/cache_status\">Cache status</a></p>\
         </body></html>"
    );
    Ok(html_response(StatusCode::OK, html))
}

fn cache_status_page(state: &Arc<GatewayState>) -> Result<Response<HttpBody>, GatewayError> {
    let mut rows = String::new();
    for entry in state.cache.entries() {
        let key = entry.key();
        let snapshot = entry.snapshot();
        rows.push_str(&format!(
            "<tr><td><a href=\"{view}\">{dataset}</a></td><td>{annotation}</td>\
             <td>{port}</td><td>{launchtime}</td><td>{last_access}</td>\
             <td>{status:?}</td>\
             <td><a href=\"{relaunch}\">relaunch</a> \
             <a href=\"{terminate}\">terminate</a></td></tr>",
            view = key.view_path(false),
            dataset = escape(&key.dataset),
            annotation = escape(key.annotation.as_deref().unwrap_or("")),
            port = entry.port(),
            launchtime = format_timestamp(snapshot.launchtime),
            last_access = format_timestamp(snapshot.last_access),
            status = snapshot.status,
            relaunch = key.relaunch_path(false),
            terminate = key.view_path(false).replacen("/view/", "/terminate/", 1),
        ));
    }

    let html = format!(
        "<!DOCTYPE html><html><head><title>vizgate cache status</title></head><body>\
         <h1>Cache status</h1>\
         <p>Gateway launched at {}. Proxied requests: {}.</p>\
         <table border=\"1\"><tr><th>dataset</th><th>annotation</th><th>port</th>\
         <th>launched</th><th>last access</th><th>status</th><th>actions</th></tr>\
         {rows}</table>\
         <p><a href=\"/\">Back to index</a></p>\
         </body></html>",
        format_timestamp(state.started_at),
        state.rewriter.request_count()
    );
    Ok(html_response(StatusCode::OK, html))
}

#[derive(Serialize)]
struct CacheStatus {
    launchtime: i64,
    entry_list: Vec<EntrySnapshot>,
}

fn cache_status_json(state: &Arc<GatewayState>) -> Result<Response<HttpBody>, GatewayError> {
    let status = CacheStatus {
        launchtime: state.started_at,
        entry_list: state.cache.snapshots(),
    };
    let body = serde_json::to_string(&status)
        .map_err(|e| GatewayError::Internal(format!("serializing cache status: {e}")))?;
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "application/json")
        .body(full_body(body))
        .map_err(|e| GatewayError::Internal(format!("building cache status: {e}")))
}

/// Reports the configured IP with caching disabled, so orchestration that
/// polls it always sees the live value.
fn ip_address(state: &Arc<GatewayState>) -> Result<Response<HttpBody>, GatewayError> {
    let ip = state
        .config
        .ip
        .clone()
        .unwrap_or_else(|| "127.0.0.1".to_string());
    Response::builder()
        .status(StatusCode::OK)
        .header(CONTENT_TYPE, "text/plain")
        .header(CACHE_CONTROL, "no-cache, no-store, must-revalidate")
        .header(PRAGMA, "no-cache")
        .header(EXPIRES, "0")
        .body(full_body(ip))
        .map_err(|e| GatewayError::Internal(format!("building ip response: {e}")))
}

fn format_timestamp(ts: i64) -> String {
    chrono::DateTime::from_timestamp(ts, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| ts.to_string())
}

/// Resolve the client address for logging. With a trust depth of `n`, the
/// n-th hop from the end of `X-Forwarded-For` is the client; anything beyond
/// the trusted proxies is attacker-controlled and ignored.
fn client_ip(headers: &HeaderMap, remote: IpAddr, trust_depth: usize) -> String {
    if trust_depth == 0 {
        return remote.to_string();
    }
    let Some(forwarded) = headers.get(X_FORWARDED_FOR).and_then(|v| v.to_str().ok()) else {
        return remote.to_string();
    };
    let hops: Vec<&str> = forwarded.split(',').map(str::trim).collect();
    if hops.len() < trust_depth {
        return remote.to_string();
    }
    hops[hops.len() - trust_depth].to_string()
}
