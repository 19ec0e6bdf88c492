//! Mutable record of one spawned backend's lifecycle, owned by the cache.
//!
//! The entry is shared between the request path, the launcher task and the
//! reaper. All mutable fields live behind a single `parking_lot::Mutex`;
//! writes are single-writer at any given time (launcher task or the
//! terminate/evict path), reads come from request handlers.

use crate::key::BackendKey;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Seconds-resolution wall clock, the unit used for launch and last-access
/// timestamps throughout the gateway.
pub fn current_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Lifecycle state of a backend process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryStatus {
    /// Process launch started, ready banner not yet observed.
    Loading,
    /// Process signalled readiness and is accepting connections.
    Loaded,
    /// Process exited before signalling readiness.
    Error,
    /// Explicitly terminated or evicted. Terminal: the entry is logically
    /// deleted and excluded from all future lookups.
    Terminated,
}

#[derive(Debug)]
struct EntryState {
    pid: Option<u32>,
    status: EntryStatus,
    message: Option<String>,
    stderr: Option<String>,
    http_status: Option<u16>,
    /// Startup output accumulated before the ready banner, surfaced on the
    /// loading page.
    output: String,
    last_access: i64,
}

/// One spawned backend. Port is leased at creation and never changes; the
/// cache holds the entry for the port's whole lease.
#[derive(Debug)]
pub struct BackendEntry {
    key: BackendKey,
    port: u16,
    launched_at: i64,
    state: Mutex<EntryState>,
}

/// Row of `/cache_status.json`.
#[derive(Debug, Clone, Serialize)]
pub struct EntrySnapshot {
    pub dataset: String,
    pub annotation_file: Option<String>,
    pub launchtime: i64,
    pub last_access: i64,
    pub status: EntryStatus,
}

/// Classified launch failure, copied off the entry for error rendering.
#[derive(Debug, Clone)]
pub struct LaunchFailure {
    pub message: String,
    pub stdout: String,
    pub stderr: String,
    pub http_status: u16,
}

impl BackendEntry {
    pub fn new(key: BackendKey, port: u16) -> Arc<Self> {
        let now = current_timestamp();
        Arc::new(Self {
            key,
            port,
            launched_at: now,
            state: Mutex::new(EntryState {
                pid: None,
                status: EntryStatus::Loading,
                message: None,
                stderr: None,
                http_status: None,
                output: String::new(),
                last_access: now,
            }),
        })
    }

    pub fn key(&self) -> &BackendKey {
        &self.key
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn launched_at(&self) -> i64 {
        self.launched_at
    }

    pub fn status(&self) -> EntryStatus {
        self.state.lock().status
    }

    pub fn pid(&self) -> Option<u32> {
        self.state.lock().pid
    }

    pub fn last_access(&self) -> i64 {
        self.state.lock().last_access
    }

    pub fn startup_output(&self) -> String {
        self.state.lock().output.clone()
    }

    /// Update the last-access timestamp. Called on every served request; the
    /// reaper uses this, not the launch time, as its staleness signal.
    pub fn touch(&self) {
        self.touch_at(current_timestamp());
    }

    pub fn touch_at(&self, timestamp: i64) {
        self.state.lock().last_access = timestamp;
    }

    /// Readiness observed: record the process id and leave `Loading`.
    pub fn mark_loaded(&self, pid: u32) {
        let mut state = self.state.lock();
        state.pid = Some(pid);
        state.status = EntryStatus::Loaded;
        info!(
            dataset = %self.key.dataset,
            port = self.port,
            pid,
            "backend loaded"
        );
    }

    /// Premature exit observed: record the classified failure.
    pub fn mark_error(&self, message: impl Into<String>, stderr: impl Into<String>, http_status: u16) {
        let mut state = self.state.lock();
        state.message = Some(message.into());
        state.stderr = Some(stderr.into());
        state.http_status = Some(http_status);
        state.status = EntryStatus::Error;
    }

    /// Accumulate a line of pre-ready stdout for the loading page.
    pub fn append_output(&self, line: &str) {
        let mut state = self.state.lock();
        state.output.push_str(line);
        state.output.push('\n');
    }

    /// Failure details for error rendering; `None` unless status is `Error`.
    pub fn failure(&self) -> Option<LaunchFailure> {
        let state = self.state.lock();
        if state.status != EntryStatus::Error {
            return None;
        }
        Some(LaunchFailure {
            message: state
                .message
                .clone()
                .unwrap_or_else(|| "Backend failed to launch dataset.".to_string()),
            stdout: state.output.clone(),
            stderr: state.stderr.clone().unwrap_or_default(),
            http_status: state.http_status.unwrap_or(500),
        })
    }

    /// Terminate this backend. Idempotent: a second call only re-asserts the
    /// terminal status. When a pid is known the whole process tree goes down,
    /// children before the parent; a process that is already gone is not an
    /// error. Terminating a pid-less `Loading` entry only flips status and
    /// leaves any in-flight launch to fail on its own.
    pub fn terminate(&self) {
        let pid = {
            let mut state = self.state.lock();
            if state.status == EntryStatus::Terminated {
                state.status = EntryStatus::Terminated;
                return;
            }
            state.status = EntryStatus::Terminated;
            state.pid.take()
        };

        if let Some(pid) = pid {
            let killed = kill_process_tree(pid);
            info!(
                dataset = %self.key.dataset,
                port = self.port,
                pids = ?killed,
                "terminated backend process tree"
            );
        }
    }

    pub fn snapshot(&self) -> EntrySnapshot {
        let state = self.state.lock();
        EntrySnapshot {
            dataset: self.key.dataset.clone(),
            annotation_file: self.key.annotation.clone(),
            launchtime: self.launched_at,
            last_access: state.last_access,
            status: state.status,
        }
    }
}

/// Grace period between SIGTERM and SIGKILL for each process in the tree.
const TERMINATE_GRACE: Duration = Duration::from_millis(1500);
const TERMINATE_POLL: Duration = Duration::from_millis(50);

/// Terminate `pid` and its descendants, children first. Returns the pids that
/// were actually signalled. The backend typically forks a worker child, so
/// killing the leader alone would orphan the process actually holding the
/// port.
#[cfg(unix)]
pub fn kill_process_tree(pid: u32) -> Vec<u32> {
    let mut order = descendants(pid);
    order.push(pid);

    let mut killed = Vec::new();
    for target in order {
        if terminate_one(target) {
            killed.push(target);
        }
    }
    killed
}

#[cfg(not(unix))]
pub fn kill_process_tree(_pid: u32) -> Vec<u32> {
    warn!("process tree termination is only implemented on unix");
    Vec::new()
}

/// SIGTERM one process and wait out the grace period, escalating to SIGKILL.
/// Returns false when the process was already gone.
#[cfg(unix)]
fn terminate_one(pid: u32) -> bool {
    if !process_exists(pid) {
        return false;
    }

    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGTERM);
    }

    let deadline = std::time::Instant::now() + TERMINATE_GRACE;
    while std::time::Instant::now() < deadline {
        if !process_exists(pid) {
            return true;
        }
        std::thread::sleep(TERMINATE_POLL);
    }

    warn!(pid, "process survived SIGTERM grace period, sending SIGKILL");
    unsafe {
        libc::kill(pid as libc::pid_t, libc::SIGKILL);
    }
    true
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    unsafe { libc::kill(pid as libc::pid_t, 0) == 0 }
}

/// Direct and indirect children of `pid`, leaves first, via /proc. Processes
/// that disappear mid-scan are simply skipped.
#[cfg(unix)]
fn descendants(pid: u32) -> Vec<u32> {
    let mut result = Vec::new();
    for child in children_of(pid) {
        result.extend(descendants(child));
        result.push(child);
    }
    result
}

#[cfg(unix)]
fn children_of(pid: u32) -> Vec<u32> {
    // Fast path on Linux; falls back to a ppid scan elsewhere.
    let path = format!("/proc/{pid}/task/{pid}/children");
    if let Ok(contents) = std::fs::read_to_string(&path) {
        return contents
            .split_whitespace()
            .filter_map(|token| token.parse().ok())
            .collect();
    }

    let mut children = Vec::new();
    if let Ok(proc_dir) = std::fs::read_dir("/proc") {
        for dir_entry in proc_dir.flatten() {
            let Some(candidate) = dir_entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<u32>().ok())
            else {
                continue;
            };
            let stat_path = format!("/proc/{candidate}/stat");
            if let Ok(stat) = std::fs::read_to_string(stat_path) {
                // field 4 of /proc/<pid>/stat is the ppid; the comm field may
                // contain spaces but is parenthesized, so split after ')'.
                if let Some(after_comm) = stat.rsplit(')').next() {
                    if after_comm.split_whitespace().nth(1) == Some(&pid.to_string()) {
                        children.push(candidate);
                    }
                }
            }
        }
    }
    children
}
