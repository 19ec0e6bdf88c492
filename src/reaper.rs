//! Background eviction of idle backends.
//!
//! A single long-lived task ticks on a fixed interval and evicts entries
//! whose last access is older than the TTL. The scan is driven through
//! `prune`, which takes an explicit "now" so tests exercise the policy
//! without waiting on real time.

use crate::cache::BackendCache;
use crate::entry::current_timestamp;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Seconds between scans.
const SCAN_INTERVAL: Duration = Duration::from_secs(60);

pub struct IdleReaper {
    cache: Arc<BackendCache>,
    ttl_secs: i64,
    interval: Duration,
}

impl IdleReaper {
    pub fn new(cache: Arc<BackendCache>, ttl: Duration) -> Self {
        Self {
            cache,
            ttl_secs: ttl.as_secs() as i64,
            interval: SCAN_INTERVAL,
        }
    }

    #[cfg(test)]
    fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until the shutdown channel flips. Each tick scans every entry;
    /// entry count equals the number of warm backends, so no bound on scan
    /// cost is needed.
    pub async fn run(self, mut shutdown_rx: watch::Receiver<bool>) {
        info!(ttl_secs = self.ttl_secs, "idle reaper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    self.prune(current_timestamp());
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        debug!("idle reaper shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Evict entries whose last access is older than `now - ttl`. The
    /// last-access timestamp is the sole staleness signal; launch time never
    /// enters into it. A failed eviction is logged and the scan continues.
    pub fn prune(&self, now: i64) {
        let cutoff = now - self.ttl_secs;
        let stale: Vec<_> = self
            .cache
            .entries()
            .into_iter()
            .filter(|entry| entry.last_access() < cutoff)
            .collect();

        if stale.is_empty() {
            debug!(cutoff, "prune scan found nothing stale");
            return;
        }

        for entry in stale {
            info!(
                dataset = %entry.key().dataset,
                port = entry.port(),
                last_access = entry.last_access(),
                cutoff,
                "pruning idle backend"
            );
            if let Err(e) = self.cache.evict(&entry) {
                warn!(
                    dataset = %entry.key().dataset,
                    error = %e,
                    "failed to prune entry, continuing scan"
                );
            }
        }
    }
}
