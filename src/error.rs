//! Error taxonomy and user-facing error pages.
//!
//! Resolution and launch errors render as HTML pages carrying the captured
//! stdout/stderr for operator diagnosis; invariant violations surface as 500s.

use crate::entry::LaunchFailure;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use thiserror::Error;

/// Response body type used across the gateway.
pub type HttpBody = BoxBody<Bytes, hyper::Error>;

pub fn full_body(content: impl Into<Bytes>) -> HttpBody {
    Full::new(content.into()).map_err(|never| match never {}).boxed()
}

#[derive(Debug, Error)]
pub enum GatewayError {
    /// Requested path does not correspond to any known dataset.
    #[error("no matching dataset found: {0}")]
    NotFound(String),

    /// Malformed request, e.g. an unsupported proxy method.
    #[error("{0}")]
    BadRequest(String),

    /// Backend process exited before signalling readiness.
    #[error("{}", .0.message)]
    Launch(LaunchFailure),

    /// More than one live entry matched a key; indicates a bug in creation
    /// serialization, not user-recoverable.
    #[error("internal error: {0}")]
    Internal(String),

    /// The spawned backend could not be reached or returned garbage.
    #[error("upstream error: {0}")]
    Upstream(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::NotFound(_) => StatusCode::NOT_FOUND,
            GatewayError::BadRequest(_) => StatusCode::BAD_REQUEST,
            GatewayError::Launch(failure) => StatusCode::from_u16(failure.http_status)
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
            GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Upstream(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Render this error as the page a browser user sees.
    pub fn into_response(self) -> Response<HttpBody> {
        let status = self.status();
        let html = match &self {
            GatewayError::Launch(failure) => launch_error_page(status, failure),
            other => error_page(status, &other.to_string()),
        };
        html_response(status, html)
    }
}

pub fn html_response(status: StatusCode, html: String) -> Response<HttpBody> {
    Response::builder()
        .status(status)
        .header(hyper::header::CONTENT_TYPE, "text/html; charset=utf-8")
        .body(full_body(html))
        .expect("valid response with StatusCode enum and static headers")
}

fn error_page(status: StatusCode, message: &str) -> String {
    format!(
        "<!DOCTYPE html><html><head><title>vizgate</title></head><body>\
         <h1>{} Error</h1><p>{}</p>\
         <p><a href=\"/\">Back to index</a></p>\
         </body></html>",
        status.as_u16(),
        escape(message)
    )
}

fn launch_error_page(status: StatusCode, failure: &LaunchFailure) -> String {
    format!(
        "<!DOCTYPE html><html><head><title>vizgate</title></head><body>\
         <h1>{} Error</h1><p>{}</p>\
         <h2>stdout</h2><pre>{}</pre>\
         <h2>stderr</h2><pre>{}</pre>\
         <p><a href=\"/\">Back to index</a></p>\
         </body></html>",
        status.as_u16(),
        escape(&failure.message),
        escape(&failure.stdout),
        escape(&failure.stderr)
    )
}

/// Minimal HTML escaping for text interpolated into error and status pages.
pub fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}
