//! Vizgate - a gateway that spawns dataset visualization backends on demand
//!
//! This library provides an HTTP gateway that:
//! - Resolves view URLs to dataset files through pluggable item sources
//! - Spawns one single-dataset backend process per dataset on first request
//! - Proxies subsequent traffic to the backend, rewriting URLs in textual
//!   responses so the UI works under the gateway's path prefix
//! - Serves a loading page while a backend starts and a classified error
//!   page when a launch fails
//! - Evicts idle backends after a configurable TTL, terminating their whole
//!   process tree

pub mod cache;
pub mod config;
pub mod entry;
pub mod error;
pub mod gateway;
pub mod key;
pub mod launcher;
pub mod pool;
pub mod proxy;
pub mod reaper;
pub mod source;
