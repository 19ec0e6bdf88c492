//! In-memory registry of backend entries.
//!
//! The cache is the sole owner of the entry list: it assigns ports, dedupes
//! creation, and is the only component that removes entries. Creation-on-miss
//! is linearized by one async mutex (classic check-lock-check), so at most one
//! launch is ever started per key. Entries are independently mutable records,
//! so readers only take the list lock for the brief scan itself.

use crate::entry::{BackendEntry, EntrySnapshot, EntryStatus};
use crate::error::GatewayError;
use crate::key::BackendKey;
use crate::launcher::{LaunchSpec, ProcessLauncher};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// First port tried for a new backend; allocation probes upward from here.
pub const BASE_PORT: u16 = 8000;

/// Pause after starting a launch, giving the process a moment to produce
/// output before the loading page's first refresh polls the entry. A race
/// mitigation only, not a correctness guarantee.
const SETTLE_DELAY: Duration = Duration::from_secs(1);

const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(100);

pub struct BackendCache {
    entries: Mutex<Vec<Arc<BackendEntry>>>,
    /// Serializes the check-then-create sequence; never held across requests.
    create_lock: tokio::sync::Mutex<()>,
    launcher: ProcessLauncher,
    base_port: u16,
    settle_delay: Duration,
}

impl BackendCache {
    pub fn new(launcher: ProcessLauncher) -> Arc<Self> {
        Self::with_ports(launcher, BASE_PORT, SETTLE_DELAY)
    }

    pub fn with_ports(
        launcher: ProcessLauncher,
        base_port: u16,
        settle_delay: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            entries: Mutex::new(Vec::new()),
            create_lock: tokio::sync::Mutex::new(()),
            launcher,
            base_port,
            settle_delay,
        })
    }

    /// Ports leased by every listed entry, terminated or not. A port is only
    /// returned to the pool when its entry leaves the list.
    pub fn leased_ports(&self) -> HashSet<u16> {
        self.entries.lock().iter().map(|e| e.port()).collect()
    }

    /// Single active (non-terminated) entry for `key`, if any. More than one
    /// match means creation serialization is broken and surfaces as an
    /// internal fault.
    pub fn find_by_key(
        &self,
        key: &BackendKey,
    ) -> Result<Option<Arc<BackendEntry>>, GatewayError> {
        let matches: Vec<Arc<BackendEntry>> = self
            .entries
            .lock()
            .iter()
            .filter(|e| e.status() != EntryStatus::Terminated && e.key() == key)
            .cloned()
            .collect();
        Self::at_most_one(matches, key.descriptor())
    }

    /// Active entry whose descriptor is a prefix of `path` within `source`.
    /// Lets sub-resource requests (proxied static assets) reach their backend
    /// without re-resolving the full key.
    pub fn find_by_path(
        &self,
        source: &str,
        path: &str,
    ) -> Result<Option<Arc<BackendEntry>>, GatewayError> {
        let matches: Vec<Arc<BackendEntry>> = self
            .entries
            .lock()
            .iter()
            .filter(|e| {
                e.status() != EntryStatus::Terminated
                    && e.key().source == source
                    && path.starts_with(e.key().descriptor())
            })
            .cloned()
            .collect();
        Self::at_most_one(matches, path)
    }

    fn at_most_one(
        mut matches: Vec<Arc<BackendEntry>>,
        what: &str,
    ) -> Result<Option<Arc<BackendEntry>>, GatewayError> {
        match matches.len() {
            0 => Ok(None),
            1 => Ok(matches.pop()),
            n => Err(GatewayError::Internal(format!("Found {n} for {what}"))),
        }
    }

    /// Find the entry for `key`, creating and launching one on a miss. The
    /// double check under the creation lock is what guarantees a single
    /// launch per key under concurrent first requests.
    pub async fn get_or_create(
        self: &Arc<Self>,
        key: BackendKey,
        spec: LaunchSpec,
        scripts: &[String],
    ) -> Result<Arc<BackendEntry>, GatewayError> {
        if let Some(entry) = self.find_by_key(&key)? {
            return Ok(entry);
        }

        let _guard = self.create_lock.lock().await;
        if let Some(entry) = self.find_by_key(&key)? {
            return Ok(entry);
        }

        Ok(self.create_entry(key, spec, scripts).await)
    }

    /// Register a `Loading` entry on a fresh port and start its launcher on a
    /// background task. Only called while holding the creation lock.
    async fn create_entry(
        self: &Arc<Self>,
        key: BackendKey,
        spec: LaunchSpec,
        scripts: &[String],
    ) -> Arc<BackendEntry> {
        let port = next_free_port(self.base_port, &self.leased_ports(), is_port_in_use);
        let entry = BackendEntry::new(key, port);
        self.entries.lock().push(Arc::clone(&entry));

        info!(
            dataset = %entry.key().dataset,
            annotation = ?entry.key().annotation,
            port,
            "creating backend entry"
        );

        let launcher = self.launcher.clone();
        let launch_entry = Arc::clone(&entry);
        let scripts = scripts.to_vec();
        tokio::spawn(async move {
            launcher.launch(launch_entry, spec, &scripts).await;
        });

        tokio::time::sleep(self.settle_delay).await;
        entry
    }

    /// Remove `entry` from the list and terminate its process tree. Errors if
    /// the entry is not present (already evicted).
    pub fn evict(&self, entry: &Arc<BackendEntry>) -> Result<(), GatewayError> {
        {
            let mut entries = self.entries.lock();
            let position = entries
                .iter()
                .position(|e| Arc::ptr_eq(e, entry))
                .ok_or_else(|| {
                    GatewayError::Internal(format!(
                        "entry for {} not present in cache",
                        entry.key().descriptor()
                    ))
                })?;
            entries.remove(position);
        }
        debug!(dataset = %entry.key().dataset, port = entry.port(), "evicted entry");
        entry.terminate();
        Ok(())
    }

    /// All listed entries, newest last.
    pub fn entries(&self) -> Vec<Arc<BackendEntry>> {
        self.entries.lock().clone()
    }

    pub fn snapshots(&self) -> Vec<EntrySnapshot> {
        self.entries.lock().iter().map(|e| e.snapshot()).collect()
    }

    /// Terminate every backend, for gateway shutdown.
    pub fn terminate_all(&self) {
        for entry in self.entries() {
            entry.terminate();
        }
    }

    #[cfg(test)]
    pub(crate) fn insert_for_test(&self, entry: Arc<BackendEntry>) {
        self.entries.lock().push(entry);
    }
}

/// Lowest port >= `base` that is neither leased by a listed entry nor
/// observed busy by the probe. Linear from the base on purpose: terminated
/// entries keep their lease until evicted, and tests pin this sequence.
pub fn next_free_port(base: u16, leased: &HashSet<u16>, is_busy: impl Fn(u16) -> bool) -> u16 {
    let mut port = base;
    while leased.contains(&port) || is_busy(port) {
        port += 1;
    }
    port
}

/// Probe a local port with a short TCP connect: success means something is
/// already listening there.
pub fn is_port_in_use(port: u16) -> bool {
    let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&addr, PORT_PROBE_TIMEOUT).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(dataset: &str) -> BackendKey {
        BackendKey::new("local", dataset, None)
    }

    fn test_cache() -> Arc<BackendCache> {
        BackendCache::with_ports(
            ProcessLauncher::new("/nonexistent/backend"),
            18100,
            Duration::from_millis(10),
        )
    }

    fn spec() -> LaunchSpec {
        LaunchSpec {
            file_path: "/nonexistent/data.h5ad".to_string(),
            annotation_path: None,
        }
    }

    #[test]
    fn test_next_free_port_skips_leased_and_busy() {
        let leased: HashSet<u16> = [8000, 8001].into_iter().collect();
        let port = next_free_port(8000, &leased, |p| p == 8000);
        assert_eq!(port, 8002);
    }

    #[test]
    fn test_next_free_port_all_free() {
        let port = next_free_port(8000, &HashSet::new(), |_| false);
        assert_eq!(port, 8000);
    }

    #[test]
    fn test_is_port_in_use_against_listener() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        assert!(is_port_in_use(port));
        drop(listener);
    }

    #[test]
    fn test_find_by_key_empty() {
        let cache = test_cache();
        assert!(cache.find_by_key(&key("a.h5ad")).unwrap().is_none());
    }

    #[test]
    fn test_find_by_key_excludes_terminated() {
        let cache = test_cache();
        let entry = BackendEntry::new(key("a.h5ad"), 18100);
        cache.insert_for_test(Arc::clone(&entry));
        assert!(cache.find_by_key(&key("a.h5ad")).unwrap().is_some());

        entry.terminate();
        // Logically deleted even though still listed; its port stays leased.
        assert!(cache.find_by_key(&key("a.h5ad")).unwrap().is_none());
        assert!(cache.leased_ports().contains(&18100));
    }

    #[test]
    fn test_find_by_key_duplicate_is_internal_fault() {
        let cache = test_cache();
        cache.insert_for_test(BackendEntry::new(key("a.h5ad"), 18100));
        cache.insert_for_test(BackendEntry::new(key("a.h5ad"), 18101));
        let err = cache.find_by_key(&key("a.h5ad")).unwrap_err();
        assert!(matches!(err, GatewayError::Internal(_)));
    }

    #[test]
    fn test_find_by_path_prefix_and_source() {
        let cache = test_cache();
        cache.insert_for_test(BackendEntry::new(key("czi/pbmc3k.h5ad"), 18100));

        let hit = cache
            .find_by_path("local", "czi/pbmc3k.h5ad/static/app.js")
            .unwrap();
        assert!(hit.is_some());

        assert!(cache
            .find_by_path("s3", "czi/pbmc3k.h5ad/static/app.js")
            .unwrap()
            .is_none());
        assert!(cache.find_by_path("local", "other/x.h5ad").unwrap().is_none());
    }

    #[test]
    fn test_evict_removes_and_terminates() {
        let cache = test_cache();
        let entry = BackendEntry::new(key("a.h5ad"), 18100);
        cache.insert_for_test(Arc::clone(&entry));

        cache.evict(&entry).unwrap();
        assert_eq!(entry.status(), EntryStatus::Terminated);
        assert!(cache.entries().is_empty());
        // Port lease released with the entry.
        assert!(!cache.leased_ports().contains(&18100));
    }

    #[test]
    fn test_evict_absent_entry_errors() {
        let cache = test_cache();
        let entry = BackendEntry::new(key("a.h5ad"), 18100);
        assert!(cache.evict(&entry).is_err());
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_single_launch() {
        let cache = test_cache();

        let a = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_create(key("czi/pbmc3k.h5ad"), spec(), &[])
                    .await
                    .unwrap()
            })
        };
        let b = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_create(key("czi/pbmc3k.h5ad"), spec(), &[])
                    .await
                    .unwrap()
            })
        };

        let (entry_a, entry_b) = (a.await.unwrap(), b.await.unwrap());
        assert!(Arc::ptr_eq(&entry_a, &entry_b));
        assert_eq!(cache.entries().len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_keys_get_distinct_ports() {
        let cache = test_cache();
        let first = cache
            .get_or_create(key("a.h5ad"), spec(), &[])
            .await
            .unwrap();
        let second = cache
            .get_or_create(key("b.h5ad"), spec(), &[])
            .await
            .unwrap();
        assert_ne!(first.port(), second.port());
        assert_eq!(cache.entries().len(), 2);
    }
}
