//! End-to-end tests driving real processes and sockets: a fake backend
//! script that speaks the launch protocol, and a live local upstream for the
//! proxy rewriting path.
#![cfg(unix)]

use http_body_util::BodyExt;
use hyper::body::Bytes;
use hyper::header::{HeaderMap, CONTENT_LENGTH};
use hyper::service::service_fn;
use hyper::Method;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vizgate::cache::BackendCache;
use vizgate::entry::{BackendEntry, EntryStatus};
use vizgate::key::BackendKey;
use vizgate::launcher::{LaunchSpec, ProcessLauncher, READY_BANNER};
use vizgate::pool::UpstreamClient;
use vizgate::proxy::ProxyRewriter;
use vizgate::reaper::IdleReaper;
use vizgate::source::{FileSource, ItemSource};

fn write_script(dir: &Path, name: &str, contents: &str) -> String {
    use std::os::unix::fs::PermissionsExt;
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path.to_string_lossy().into_owned()
}

/// Script that behaves like a healthy backend: some startup chatter, the
/// ready banner, then staying alive.
fn ready_backend(dir: &Path) -> String {
    write_script(
        dir,
        "fake_backend.sh",
        &format!(
            "#!/bin/sh\necho \"loading dataset\"\necho \"{READY_BANNER}\"\nsleep 30\n"
        ),
    )
}

async fn wait_for_status(entry: &Arc<BackendEntry>, wanted: EntryStatus) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while std::time::Instant::now() < deadline {
        if entry.status() == wanted {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!(
        "entry never reached {:?}, stuck at {:?}; output: {}",
        wanted,
        entry.status(),
        entry.startup_output()
    );
}

fn plain_spec() -> LaunchSpec {
    LaunchSpec {
        file_path: "/tmp/ignored.h5ad".to_string(),
        annotation_path: None,
    }
}

#[tokio::test]
async fn launch_reaches_loaded_on_ready_banner() {
    let dir = TempDir::new().unwrap();
    let launcher = ProcessLauncher::new(ready_backend(dir.path()));
    let entry = BackendEntry::new(BackendKey::new("local", "czi/pbmc3k.h5ad", None), 19001);

    launcher.launch(Arc::clone(&entry), plain_spec(), &[]).await;

    assert_eq!(entry.status(), EntryStatus::Loaded);
    assert!(entry.pid().is_some());
    assert!(entry.startup_output().contains("loading dataset"));

    // Tear the process tree down; the sleep child must not linger.
    entry.terminate();
    assert_eq!(entry.status(), EntryStatus::Terminated);
}

#[tokio::test]
async fn invalid_file_failure_is_client_error() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        dir.path(),
        "bad_file.sh",
        "#!/bin/sh\necho \"Could not open file pbmc3k.h5ad\" >&2\nexit 1\n",
    );
    let launcher = ProcessLauncher::new(script);
    let entry = BackendEntry::new(BackendKey::new("local", "czi/pbmc3k.h5ad", None), 19002);

    launcher.launch(Arc::clone(&entry), plain_spec(), &[]).await;

    assert_eq!(entry.status(), EntryStatus::Error);
    let failure = entry.failure().unwrap();
    assert_eq!(failure.message, "File was invalid.");
    assert_eq!(failure.http_status, 400);
    assert!(failure.stderr.contains("Could not open file"));
}

#[tokio::test]
async fn unclassified_failure_is_server_error() {
    let dir = TempDir::new().unwrap();
    let script = write_script(
        dir.path(),
        "crash.sh",
        "#!/bin/sh\necho \"segmentation fault\" >&2\nexit 139\n",
    );
    let launcher = ProcessLauncher::new(script);
    let entry = BackendEntry::new(BackendKey::new("local", "czi/pbmc3k.h5ad", None), 19003);

    launcher.launch(Arc::clone(&entry), plain_spec(), &[]).await;

    let failure = entry.failure().unwrap();
    assert_eq!(failure.message, "Backend failed to launch dataset.");
    assert_eq!(failure.http_status, 500);
}

#[tokio::test]
async fn resolve_launch_and_prune_end_to_end() {
    let data = TempDir::new().unwrap();
    std::fs::create_dir_all(data.path().join("czi")).unwrap();
    std::fs::write(data.path().join("czi/pbmc3k.h5ad"), b"h5ad").unwrap();

    let scripts = TempDir::new().unwrap();
    let launcher = ProcessLauncher::new(ready_backend(scripts.path()));
    let cache = BackendCache::with_ports(launcher, 19100, Duration::from_millis(10));

    let source = FileSource::new("local", data.path());
    let lookup = source.lookup("czi/pbmc3k.h5ad").unwrap();
    let entry = cache
        .get_or_create(lookup.key, lookup.spec, &[])
        .await
        .unwrap();

    wait_for_status(&entry, EntryStatus::Loaded).await;

    // A second request for the same dataset reuses the running backend.
    let lookup = source.lookup("czi/pbmc3k.h5ad/static/app.js").unwrap();
    let again = cache
        .get_or_create(lookup.key, lookup.spec, &[])
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&entry, &again));

    // Idle long past the TTL: the reaper evicts and terminates it.
    let reaper = IdleReaper::new(Arc::clone(&cache), Duration::from_secs(60));
    reaper.prune(entry.last_access() + 3600);
    assert!(cache.entries().is_empty());
    assert_eq!(entry.status(), EntryStatus::Terminated);
}

/// Serve `html` as `text/html` on an ephemeral port; the body may embed the
/// port itself via the closure argument.
async fn start_upstream(make_body: impl FnOnce(u16) -> String) -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let html = Arc::new(make_body(port));

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let html = Arc::clone(&html);
            tokio::spawn(async move {
                let io = TokioIo::new(stream);
                let service = service_fn(move |_req| {
                    let html = Arc::clone(&html);
                    async move {
                        Ok::<_, std::convert::Infallible>(
                            hyper::Response::builder()
                                .header("content-type", "text/html")
                                .body(http_body_util::Full::new(Bytes::from((*html).clone())))
                                .unwrap(),
                        )
                    }
                });
                let _ = AutoBuilder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    port
}

#[tokio::test]
async fn proxy_rewrites_live_upstream_response() {
    let port = start_upstream(|port| {
        format!(
            "<html><script src=\"/static/app.js\"></script>\
             <a href=\"http://127.0.0.1:{port}\">home</a></html>"
        )
    })
    .await;

    let entry = BackendEntry::new(BackendKey::new("local", "czi/pbmc3k.h5ad", None), port);
    entry.mark_loaded(0);

    let rewriter = ProxyRewriter::new(UpstreamClient::default());
    let response = rewriter
        .serve(
            &entry,
            "czi/pbmc3k.h5ad/index.html",
            None,
            &Method::GET,
            &HeaderMap::new(),
            Bytes::new(),
            "/view/czi/pbmc3k.h5ad/",
        )
        .await
        .unwrap();

    let content_length: usize = response
        .headers()
        .get(CONTENT_LENGTH)
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let text = String::from_utf8(body.to_vec()).unwrap();

    assert!(text.contains("src=\"/view/czi/pbmc3k.h5ad/static/app.js\""));
    assert!(text.contains("href=\"/view/czi/pbmc3k.h5ad/\""));
    assert!(!text.contains("127.0.0.1"));
    // Length reflects the rewritten body, not the upstream's.
    assert_eq!(content_length, text.len());
}
