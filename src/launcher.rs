//! Spawns and supervises the OS process for one cache entry.
//!
//! The launch protocol is line-oriented: the backend's stdout is read until
//! either the documented ready banner appears (success) or the stream ends
//! (the process exited; stderr is read and the failure classified). The loop
//! runs on its own task and never blocks the request that created the entry;
//! the request path observes the outcome through the entry's status.

use crate::config::Config;
use crate::entry::BackendEntry;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info};

/// The fixed stdout line the backend emits once it accepts connections.
pub const READY_BANNER: &str = "[cellxgene] Type CTRL-C at any time to exit.";

/// Stderr markers that classify a launch failure as a bad input file rather
/// than a backend fault.
const INVALID_FILE_MARKERS: [&str; 2] = ["Error while loading file", "Could not open file"];

/// Suffixes tying a dataset file to its annotations directory.
pub const DATASET_SUFFIX: &str = ".h5ad";
pub const ANNOTATIONS_SUFFIX: &str = "_annotations";

/// What to launch for one entry: the dataset file plus the annotation target.
/// `annotation_path` follows the key's convention: `None` means annotations
/// are not in play, `Some("")` means the per-dataset annotations directory.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub file_path: String,
    pub annotation_path: Option<String>,
}

/// Builds the launch command line and supervises spawned processes.
#[derive(Debug, Clone)]
pub struct ProcessLauncher {
    executable: String,
    enable_annotations: bool,
    enable_backed_mode: bool,
    extra_args: Option<String>,
}

impl ProcessLauncher {
    pub fn from_config(config: &Config) -> Self {
        Self {
            executable: config.backend_location.clone(),
            enable_annotations: config.enable_annotations,
            enable_backed_mode: config.enable_backed_mode,
            extra_args: config.extra_args.clone(),
        }
    }

    pub fn new(executable: impl Into<String>) -> Self {
        Self {
            executable: executable.into(),
            enable_annotations: false,
            enable_backed_mode: false,
            extra_args: None,
        }
    }

    pub fn with_annotations(mut self, enabled: bool) -> Self {
        self.enable_annotations = enabled;
        self
    }

    pub fn with_backed_mode(mut self, enabled: bool) -> Self {
        self.enable_backed_mode = enabled;
        self
    }

    pub fn with_extra_args(mut self, args: Option<String>) -> Self {
        self.extra_args = args;
        self
    }

    /// Build the single shell command line for one launch. Argument order is
    /// stable: dataset, port, host, annotation flags, backed flag, extra
    /// args, then one `--scripts` per injected script URL. The leading
    /// `yes |` answers the backend's interactive prompts.
    pub fn build_command(&self, spec: &LaunchSpec, port: u16, scripts: &[String]) -> String {
        let mut extra = String::new();

        match (&spec.annotation_path, self.enable_annotations) {
            (Some(annotation), true) if annotation.is_empty() => {
                extra.push_str(&format!(
                    " --annotations-dir {}",
                    shell_words::quote(&annotations_dir(&spec.file_path))
                ));
            }
            (Some(annotation), true) => {
                extra.push_str(&format!(
                    " --annotations-file {}",
                    shell_words::quote(annotation)
                ));
            }
            _ => extra.push_str(" --disable-annotations --disable-gene-sets-save"),
        }

        if self.enable_backed_mode {
            extra.push_str(" --backed");
        }

        if let Some(args) = &self.extra_args {
            extra.push(' ');
            extra.push_str(args);
        }

        let mut cmd = format!(
            "yes | {} launch {} --port {} --host 127.0.0.1{}",
            shell_words::quote(&self.executable),
            shell_words::quote(&spec.file_path),
            port,
            extra
        );

        for script in scripts {
            cmd.push_str(&format!(" --scripts {}", shell_words::quote(script)));
        }

        cmd
    }

    /// Run the launch for `entry`, mutating it as the protocol progresses.
    /// Errors are written onto the entry, never raised across the task
    /// boundary.
    pub async fn launch(&self, entry: Arc<BackendEntry>, spec: LaunchSpec, scripts: &[String]) {
        let cmd = self.build_command(&spec, entry.port(), scripts);
        info!(dataset = %entry.key().dataset, port = entry.port(), command = %cmd, "launching backend");

        let mut child = match Command::new("sh")
            .arg("-c")
            .arg(&cmd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
        {
            Ok(child) => child,
            Err(e) => {
                error!(dataset = %entry.key().dataset, error = %e, "failed to spawn backend shell");
                entry.mark_error("Backend failed to launch dataset.", e.to_string(), 500);
                return;
            }
        };

        let stdout = child.stdout.take().expect("stdout piped above");
        let mut stderr = child.stderr.take().expect("stderr piped above");
        let mut lines = BufReader::new(stdout).lines();

        loop {
            let next = lines.next_line().await;
            match next {
                Ok(Some(line)) if line == READY_BANNER => {
                    let pid = child.id().unwrap_or(0);
                    entry.mark_loaded(pid);

                    // Keep draining the pipes so the backend never blocks on
                    // a full pipe, and reap the shell when it exits.
                    let dataset = entry.key().dataset.clone();
                    tokio::spawn(async move {
                        while let Ok(Some(line)) = lines.next_line().await {
                            debug!(dataset = %dataset, line = %line, "backend stdout");
                        }
                        let mut discard = Vec::new();
                        let _ = stderr.read_to_end(&mut discard).await;
                        let _ = child.wait().await;
                    });
                    return;
                }
                Ok(Some(line)) => {
                    if !line.is_empty() {
                        entry.append_output(&line);
                    }
                }
                Ok(None) | Err(_) => {
                    // Process exited (or its pipe broke) before the banner.
                    let mut captured = String::new();
                    let _ = stderr.read_to_string(&mut captured).await;
                    let _ = child.wait().await;

                    let (message, http_status) = classify_stderr(&captured);
                    error!(
                        dataset = %entry.key().dataset,
                        port = entry.port(),
                        http_status,
                        stderr = %captured,
                        "backend exited before ready banner"
                    );
                    entry.mark_error(message, captured, http_status);
                    return;
                }
            }
        }
    }
}

/// Classify a failed launch from its captured stderr: a recognized
/// invalid-file marker is the user's fault (400), anything else is ours (500).
pub fn classify_stderr(stderr: &str) -> (&'static str, u16) {
    if INVALID_FILE_MARKERS.iter().any(|marker| stderr.contains(marker)) {
        ("File was invalid.", 400)
    } else {
        ("Backend failed to launch dataset.", 500)
    }
}

/// Annotations directory belonging to a dataset file:
/// `somedir/dataset.h5ad` -> `somedir/dataset_annotations`.
pub fn annotations_dir(file_path: &str) -> String {
    let stem = file_path.strip_suffix(DATASET_SUFFIX).unwrap_or(file_path);
    format!("{stem}{ANNOTATIONS_SUFFIX}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::BackendKey;

    fn plain_spec() -> LaunchSpec {
        LaunchSpec {
            file_path: "/tmp/czi/pbmc3k.h5ad".to_string(),
            annotation_path: None,
        }
    }

    #[test]
    fn test_build_command_plain() {
        let launcher = ProcessLauncher::new("/some/cellxgene");
        let cmd = launcher.build_command(
            &plain_spec(),
            8000,
            &[
                "http://example.com/script.js".to_string(),
                "http://example.com/script2.js".to_string(),
            ],
        );
        assert_eq!(
            cmd,
            "yes | /some/cellxgene launch /tmp/czi/pbmc3k.h5ad --port 8000 \
             --host 127.0.0.1 --disable-annotations --disable-gene-sets-save \
             --scripts http://example.com/script.js --scripts http://example.com/script2.js"
        );
    }

    #[test]
    fn test_build_command_annotations_file() {
        let launcher = ProcessLauncher::new("/some/cellxgene").with_annotations(true);
        let spec = LaunchSpec {
            file_path: "/tmp/czi/pbmc3k.h5ad".to_string(),
            annotation_path: Some("/tmp/czi/pbmc3k_annotations/my.csv".to_string()),
        };
        let cmd = launcher.build_command(&spec, 8000, &[]);
        assert_eq!(
            cmd,
            "yes | /some/cellxgene launch /tmp/czi/pbmc3k.h5ad --port 8000 \
             --host 127.0.0.1 --annotations-file /tmp/czi/pbmc3k_annotations/my.csv"
        );
    }

    #[test]
    fn test_build_command_annotations_dir() {
        let launcher = ProcessLauncher::new("/some/cellxgene").with_annotations(true);
        let spec = LaunchSpec {
            file_path: "/tmp/czi/pbmc3k.h5ad".to_string(),
            annotation_path: Some(String::new()),
        };
        let cmd = launcher.build_command(&spec, 8000, &[]);
        assert_eq!(
            cmd,
            "yes | /some/cellxgene launch /tmp/czi/pbmc3k.h5ad --port 8000 \
             --host 127.0.0.1 --annotations-dir /tmp/czi/pbmc3k_annotations"
        );
    }

    #[test]
    fn test_build_command_annotation_ignored_when_disabled() {
        let launcher = ProcessLauncher::new("/some/cellxgene");
        let spec = LaunchSpec {
            file_path: "/tmp/czi/pbmc3k.h5ad".to_string(),
            annotation_path: Some("/tmp/czi/pbmc3k_annotations/my.csv".to_string()),
        };
        let cmd = launcher.build_command(&spec, 8000, &[]);
        assert!(cmd.contains("--disable-annotations"));
        assert!(!cmd.contains("--annotations-file"));
    }

    #[test]
    fn test_build_command_backed_and_extra_args() {
        let launcher = ProcessLauncher::new("/some/cellxgene")
            .with_backed_mode(true)
            .with_extra_args(Some("--max-category-items 500".to_string()));
        let cmd = launcher.build_command(&plain_spec(), 8001, &[]);
        assert_eq!(
            cmd,
            "yes | /some/cellxgene launch /tmp/czi/pbmc3k.h5ad --port 8001 \
             --host 127.0.0.1 --disable-annotations --disable-gene-sets-save \
             --backed --max-category-items 500"
        );
    }

    #[test]
    fn test_build_command_quotes_paths() {
        let launcher = ProcessLauncher::new("/some/cellxgene");
        let spec = LaunchSpec {
            file_path: "/tmp/my data/pbmc3k.h5ad".to_string(),
            annotation_path: None,
        };
        let cmd = launcher.build_command(&spec, 8000, &[]);
        assert!(cmd.contains("'/tmp/my data/pbmc3k.h5ad'"));
    }

    #[test]
    fn test_classify_stderr_invalid_file() {
        assert_eq!(
            classify_stderr("Traceback...\nCould not open file pbmc3k.h5ad"),
            ("File was invalid.", 400)
        );
        assert_eq!(
            classify_stderr("Error while loading file: bad header"),
            ("File was invalid.", 400)
        );
    }

    #[test]
    fn test_classify_stderr_other() {
        assert_eq!(
            classify_stderr("An unexpected error"),
            ("Backend failed to launch dataset.", 500)
        );
        assert_eq!(classify_stderr(""), ("Backend failed to launch dataset.", 500));
    }

    #[test]
    fn test_annotations_dir() {
        assert_eq!(
            annotations_dir("/tmp/czi/pbmc3k.h5ad"),
            "/tmp/czi/pbmc3k_annotations"
        );
    }

    #[tokio::test]
    async fn test_launch_failure_marks_entry_error() {
        let entry = BackendEntry::new(BackendKey::new("local", "czi/pbmc3k.h5ad", None), 18000);
        // Points at a nonexistent executable; the shell exits before any
        // banner and the failure lands on the entry.
        let launcher = ProcessLauncher::new("/nonexistent/backend/binary");
        launcher
            .launch(
                Arc::clone(&entry),
                LaunchSpec {
                    file_path: "/nonexistent/data.h5ad".to_string(),
                    annotation_path: None,
                },
                &[],
            )
            .await;
        assert_eq!(entry.status(), crate::entry::EntryStatus::Error);
        let failure = entry.failure().unwrap();
        assert_eq!(failure.http_status, 500);
    }
}
