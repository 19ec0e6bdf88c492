//! Environment-based configuration, read once at startup into an explicit
//! `Config` handed to the HTTP layer and the reaper. No ambient globals.

use anyhow::{bail, Context};
use std::time::Duration;

/// Global configuration for the gateway.
#[derive(Debug, Clone)]
pub struct Config {
    /// Path to the backend executable that serves one dataset.
    pub backend_location: String,
    /// Root directory the file-backed item source scans for datasets.
    pub data_root: String,
    /// Port the gateway itself binds.
    pub gateway_port: u16,
    /// Externally visible host (host:port) used when building canonical URLs.
    pub external_host: String,
    /// Externally visible protocol, "http" or "https".
    pub external_protocol: String,
    /// Reported by `/metadata/ip_address`.
    pub ip: Option<String>,
    /// Idle seconds before a warm backend is evicted.
    pub ttl_secs: u64,
    /// Pass `--annotations-*` flags to spawned backends.
    pub enable_annotations: bool,
    /// Pass `--backed` to spawned backends (lazy file loading).
    pub enable_backed_mode: bool,
    /// Script URLs injected into every spawned backend's pages.
    pub extra_scripts: Vec<String>,
    /// Extra CLI arguments appended verbatim to the launch command.
    pub extra_args: Option<String>,
    /// Number of X-Forwarded-For hops to trust when resolving the client IP.
    pub trust_proxy_depth: usize,
}

fn default_gateway_port() -> u16 {
    5005
}

fn default_ttl_secs() -> u64 {
    3600
}

impl Config {
    /// Read configuration from `VIZGATE_*` environment variables. Missing
    /// required variables and malformed values are fatal.
    pub fn from_env() -> anyhow::Result<Self> {
        let backend_location = require_env("VIZGATE_BACKEND")?;
        let data_root = require_env("VIZGATE_DATA")?;

        let gateway_port = match std::env::var("VIZGATE_PORT") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("VIZGATE_PORT is not a port number: {raw}"))?,
            Err(_) => default_gateway_port(),
        };

        let external_host = std::env::var("VIZGATE_EXTERNAL_HOST")
            .unwrap_or_else(|_| format!("localhost:{gateway_port}"));
        let external_protocol =
            std::env::var("VIZGATE_EXTERNAL_PROTOCOL").unwrap_or_else(|_| "http".to_string());

        let ttl_secs = match std::env::var("VIZGATE_TTL") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("VIZGATE_TTL is not a number of seconds: {raw}"))?,
            Err(_) => default_ttl_secs(),
        };

        let trust_proxy_depth = match std::env::var("VIZGATE_TRUST_PROXY_DEPTH") {
            Ok(raw) => raw
                .parse()
                .with_context(|| format!("VIZGATE_TRUST_PROXY_DEPTH is not a number: {raw}"))?,
            Err(_) => 0,
        };

        Ok(Self {
            backend_location,
            data_root,
            gateway_port,
            external_host,
            external_protocol,
            ip: std::env::var("VIZGATE_IP").ok(),
            ttl_secs,
            enable_annotations: env_flag("VIZGATE_ENABLE_ANNOTATIONS"),
            enable_backed_mode: env_flag("VIZGATE_ENABLE_BACKED_MODE"),
            extra_scripts: parse_extra_scripts(
                std::env::var("VIZGATE_EXTRA_SCRIPTS").ok().as_deref(),
            )?,
            extra_args: std::env::var("VIZGATE_EXTRA_ARGS").ok(),
            trust_proxy_depth,
        })
    }

    /// External base without a trailing slash, e.g. `http://viz.example.com`.
    pub fn external_base(&self) -> String {
        format!("{}://{}", self.external_protocol, self.external_host)
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if !std::path::Path::new(&self.data_root).is_dir() {
            bail!("VIZGATE_DATA is not a directory: {}", self.data_root);
        }
        if self.external_protocol != "http" && self.external_protocol != "https" {
            bail!(
                "VIZGATE_EXTERNAL_PROTOCOL must be http or https, got {}",
                self.external_protocol
            );
        }
        Ok(())
    }
}

fn require_env(name: &str) -> anyhow::Result<String> {
    std::env::var(name).with_context(|| format!("environment variable {name} must be set"))
}

fn env_flag(name: &str) -> bool {
    matches!(
        std::env::var(name).unwrap_or_default().to_lowercase().as_str(),
        "true" | "1"
    )
}

/// Parse the extra-scripts JSON array, e.g.
/// `["https://example.com/analytics.js"]`. These script URLs are passed to
/// every spawned backend via repeated `--scripts` flags.
pub fn parse_extra_scripts(raw: Option<&str>) -> anyhow::Result<Vec<String>> {
    match raw {
        None | Some("") => Ok(Vec::new()),
        Some(json) => serde_json::from_str(json).context(
            "error parsing VIZGATE_EXTRA_SCRIPTS, expected a JSON array like \
             [\"https://example.com/script.js\"]",
        ),
    }
}
