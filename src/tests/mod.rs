use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::mpsc;
use warp::Filter;

use crate::engine::{self, CancelHandle, Config, ProbeResult, RunReport};
use crate::output::{ChannelSink, ResultSink, SinkError};
use crate::progress::{ProgressTracker, Stage};
use crate::record::{AttemptRecorder, FileRecorder, NullRecorder};

type HitMap = Arc<Mutex<HashMap<String, usize>>>;

/// Serves the fixture used across scenarios: /admin and /reports exist,
/// /status1 is forbidden, /status2 errors, everything else is a 404 page.
fn scenario_server(hits: HitMap) -> SocketAddr {
    let route = warp::path::full().map(move |path: warp::path::FullPath| {
        let p = path.as_str().to_string();
        *hits
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(p.clone())
            .or_insert(0) += 1;

        let (body, status) = match p.as_str() {
            "/admin" => ("admin success token", warp::http::StatusCode::OK),
            "/reports" => ("reports index", warp::http::StatusCode::OK),
            "/status1" => ("forbidden", warp::http::StatusCode::FORBIDDEN),
            "/status2" => ("error", warp::http::StatusCode::INTERNAL_SERVER_ERROR),
            _ => (
                "this page could not be found please verify the address and try again",
                warp::http::StatusCode::NOT_FOUND,
            ),
        };
        warp::reply::with_status(body, status)
    });

    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

fn write_file(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

fn base_config(addr: SocketAddr, wordlist: &Path) -> Config {
    Config {
        target: format!("http://{addr}/FUZZ"),
        wordlist: wordlist.to_path_buf(),
        concurrency: 2,
        timeout: Duration::from_secs(2),
        method: reqwest::Method::GET,
        no_baseline: true,
        ..Default::default()
    }
}

/// Runs the engine with a channel sink and collects the matched results.
async fn run_collect(
    cfg: Config,
    recorder: Arc<dyn AttemptRecorder>,
) -> (RunReport, Vec<ProbeResult>) {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let sinks: Vec<Box<dyn ResultSink + Send>> = vec![Box::new(ChannelSink::new(tx))];
    let (_handle, token) = engine::cancel_pair();

    let report = engine::run(token, cfg, recorder, sinks).await.unwrap();

    let mut matched = Vec::new();
    while let Ok(res) = rx.try_recv() {
        matched.push(res);
    }
    (report, matched)
}

fn hit_count(hits: &HitMap, path: &str) -> usize {
    hits.lock()
        .unwrap_or_else(|e| e.into_inner())
        .get(path)
        .copied()
        .unwrap_or(0)
}

#[tokio::test]
async fn full_run_expands_probes_and_filters() {
    let hits: HitMap = Arc::new(Mutex::new(HashMap::new()));
    let addr = scenario_server(hits.clone());

    let dir = tempfile::tempdir().unwrap();
    let wordlist = write_file(&dir, "words.txt", "admin\nreport{,s}\nstatus[1-2]\n\n");

    let mut cfg = base_config(addr, &wordlist);
    cfg.match_status = vec![200];

    let (report, matched) = run_collect(cfg, Arc::new(NullRecorder)).await;

    assert_eq!(report.results, 5);
    assert_eq!(report.matched, 2);
    assert!(report.first_error.is_none());

    let mut urls: Vec<String> = matched.iter().map(|r| r.url.clone()).collect();
    urls.sort();
    assert_eq!(
        urls,
        vec![
            format!("http://{addr}/admin"),
            format!("http://{addr}/reports")
        ]
    );

    // every expanded URL was requested exactly once
    for path in ["/admin", "/report", "/reports", "/status1", "/status2"] {
        assert_eq!(hit_count(&hits, path), 1, "{path}");
    }
}

#[tokio::test]
async fn completed_run_resumes_with_no_work() {
    let hits: HitMap = Arc::new(Mutex::new(HashMap::new()));
    let addr = scenario_server(hits.clone());

    let dir = tempfile::tempdir().unwrap();
    let wordlist = write_file(&dir, "words.txt", "alpha\nbeta\n");
    let progress = dir.path().join("progress.json");
    let attempts = dir.path().join("attempts.jsonl");

    let mut cfg = base_config(addr, &wordlist);
    cfg.concurrency = 1;
    cfg.progress_file = Some(progress.clone());

    let run_id = engine::run_identity(&cfg).unwrap();

    let recorder = Arc::new(FileRecorder::open(&attempts, &run_id).unwrap());
    let (first, _) = run_collect(cfg.clone(), recorder).await;
    assert_eq!(first.results, 2);

    let recorder = Arc::new(FileRecorder::open(&attempts, &run_id).unwrap());
    let (second, _) = run_collect(cfg, recorder).await;
    assert_eq!(second.results, 0);

    assert_eq!(hit_count(&hits, "/alpha"), 1);
    assert_eq!(hit_count(&hits, "/beta"), 1);
}

#[tokio::test]
async fn attempt_log_alone_prevents_repeat_requests() {
    let hits: HitMap = Arc::new(Mutex::new(HashMap::new()));
    let addr = scenario_server(hits.clone());

    let dir = tempfile::tempdir().unwrap();
    let wordlist = write_file(&dir, "words.txt", "alpha\nbeta\n");
    let attempts = dir.path().join("attempts.jsonl");

    let cfg = base_config(addr, &wordlist);
    let run_id = engine::run_identity(&cfg).unwrap();

    let recorder = Arc::new(FileRecorder::open(&attempts, &run_id).unwrap());
    let (first, _) = run_collect(cfg.clone(), recorder).await;
    assert_eq!(first.results, 2);

    // no progress file this time: the producer walks the whole wordlist but
    // the attempt log reports every URL as already tried
    let recorder = Arc::new(FileRecorder::open(&attempts, &run_id).unwrap());
    let (second, _) = run_collect(cfg, recorder).await;
    assert_eq!(second.results, 0);

    assert_eq!(hit_count(&hits, "/alpha"), 1);
    assert_eq!(hit_count(&hits, "/beta"), 1);
}

#[tokio::test]
async fn negative_quick_stage_skips_primary_and_completes() {
    let hits: HitMap = Arc::new(Mutex::new(HashMap::new()));
    let addr = scenario_server(hits.clone());

    let dir = tempfile::tempdir().unwrap();
    // none of the quick samples exist on the server
    let wordlist = write_file(&dir, "words.txt", "alpha\nbeta\ngamma\n");
    write_file(&dir, "words.quick.txt", "missing1\nmissing2\n");
    let progress = dir.path().join("progress.json");

    let mut cfg = base_config(addr, &wordlist);
    cfg.quick = true;
    cfg.progress_file = Some(progress.clone());

    let (report, _) = run_collect(cfg.clone(), Arc::new(NullRecorder)).await;

    // only the quick samples were probed
    assert_eq!(report.results, 2);
    assert_eq!(hit_count(&hits, "/missing1"), 1);
    assert_eq!(hit_count(&hits, "/alpha"), 0);

    let tracker = ProgressTracker::load(Some(progress)).unwrap();
    assert!(tracker.stage_completed(Stage::Primary));

    // a second invocation finds the run complete and performs no work
    let (resumed, _) = run_collect(cfg, Arc::new(NullRecorder)).await;
    assert_eq!(resumed.results, 0);
    assert_eq!(hit_count(&hits, "/missing1"), 1);
}

#[tokio::test]
async fn positive_quick_stage_proceeds_to_primary() {
    let hits: HitMap = Arc::new(Mutex::new(HashMap::new()));
    let addr = scenario_server(hits.clone());

    let dir = tempfile::tempdir().unwrap();
    let wordlist = write_file(&dir, "words.txt", "alpha\nbeta\n");
    write_file(&dir, "words.quick.txt", "admin\n");
    let progress = dir.path().join("progress.json");

    let mut cfg = base_config(addr, &wordlist);
    cfg.quick = true;
    cfg.progress_file = Some(progress.clone());

    let (report, _) = run_collect(cfg, Arc::new(NullRecorder)).await;

    assert_eq!(report.results, 3);
    assert_eq!(hit_count(&hits, "/admin"), 1);
    assert_eq!(hit_count(&hits, "/alpha"), 1);
    assert_eq!(hit_count(&hits, "/beta"), 1);

    let tracker = ProgressTracker::load(Some(progress)).unwrap();
    assert!(tracker.stage_completed(Stage::Primary));
}

/// Sink that trips the cancel handle after a fixed number of emits.
struct CancelAfter {
    remaining: usize,
    handle: Option<CancelHandle>,
}

impl ResultSink for CancelAfter {
    fn emit(&mut self, _res: &ProbeResult) -> Result<(), SinkError> {
        if self.remaining > 0 {
            self.remaining -= 1;
            if self.remaining == 0 {
                if let Some(handle) = self.handle.take() {
                    handle.cancel();
                }
            }
        }
        Ok(())
    }
}

/// Counting 404 server that takes a beat per request, so cancellation lands
/// while the stage is still in flight.
fn slow_server(hits: HitMap) -> SocketAddr {
    let route = warp::path::full().and_then(move |path: warp::path::FullPath| {
        let hits = hits.clone();
        let p = path.as_str().to_string();
        async move {
            *hits
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .entry(p)
                .or_insert(0) += 1;
            tokio::time::sleep(Duration::from_millis(50)).await;
            Ok::<_, std::convert::Infallible>(warp::reply::with_status(
                "nothing here",
                warp::http::StatusCode::NOT_FOUND,
            ))
        }
    });

    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);
    addr
}

#[tokio::test]
async fn cancelled_run_preserves_progress_and_resumes_without_repeats() {
    let hits: HitMap = Arc::new(Mutex::new(HashMap::new()));
    let addr = slow_server(hits.clone());

    let dir = tempfile::tempdir().unwrap();
    let wordlist = write_file(&dir, "words.txt", "w[1-10]\n");
    let progress = dir.path().join("progress.json");
    let attempts = dir.path().join("attempts.jsonl");

    let mut cfg = base_config(addr, &wordlist);
    cfg.concurrency = 1;
    cfg.progress_file = Some(progress.clone());

    let run_id = engine::run_identity(&cfg).unwrap();

    let (handle, token) = engine::cancel_pair();
    let recorder = Arc::new(FileRecorder::open(&attempts, &run_id).unwrap());
    let sinks: Vec<Box<dyn ResultSink + Send>> = vec![Box::new(CancelAfter {
        remaining: 3,
        handle: Some(handle),
    })];

    let first = engine::run(token, cfg.clone(), recorder, sinks)
        .await
        .unwrap();

    assert!(first.cancelled);
    assert!(first.results >= 3);
    assert!(first.results < 10);

    // the stage pointer was not advanced to the successor
    let tracker = ProgressTracker::load(Some(progress.clone())).unwrap();
    assert!(!tracker.stage_completed(Stage::Primary));
    drop(tracker);

    // resume: no URL from the first run is requested again
    let recorder = Arc::new(FileRecorder::open(&attempts, &run_id).unwrap());
    let (second, _) = run_collect(cfg, recorder).await;
    assert!(!second.cancelled);

    let counts = hits.lock().unwrap_or_else(|e| e.into_inner()).clone();
    for (path, count) in &counts {
        assert_eq!(*count, 1, "{path} was requested {count} times");
    }

    let tracker = ProgressTracker::load(Some(progress)).unwrap();
    assert!(tracker.stage_completed(Stage::Primary));
}

#[tokio::test]
async fn baseline_similarity_hides_error_page_lookalikes() {
    let hits: HitMap = Arc::new(Mutex::new(HashMap::new()));
    let addr = scenario_server(hits.clone());

    let dir = tempfile::tempdir().unwrap();
    let wordlist = write_file(&dir, "words.txt", "admin\nmissing1\n");

    let mut cfg = base_config(addr, &wordlist);
    // the baseline GET on a random token returns the fixture's 404 page
    cfg.no_baseline = false;
    cfg.similarity_threshold = 0.6;

    let (report, matched) = run_collect(cfg, Arc::new(NullRecorder)).await;

    assert_eq!(report.results, 2);
    assert_eq!(report.matched, 1);
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].url, format!("http://{addr}/admin"));
    // the kept hit was scored against the baseline and fell under the bar
    assert!(matched[0].similarity.unwrap_or(1.0) < 0.6);
}

#[tokio::test]
async fn pre_hook_options_decorate_every_probe() {
    let seen_cookie: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let seen_in_route = seen_cookie.clone();

    let route = warp::path::full()
        .and(warp::header::optional::<String>("cookie"))
        .map(move |_path: warp::path::FullPath, cookie: Option<String>| {
            *seen_in_route.lock().unwrap_or_else(|e| e.into_inner()) = cookie;
            warp::reply::with_status("ok", warp::http::StatusCode::OK)
        });
    let (addr, server) = warp::serve(route).bind_ephemeral(([127, 0, 0, 1], 0));
    tokio::spawn(server);

    let dir = tempfile::tempdir().unwrap();
    let wordlist = write_file(&dir, "words.txt", "admin\n");

    let mut cfg = base_config(addr, &wordlist);
    cfg.pre_hook = Some(r#"echo '{"cookie":"session=hooked"}'"#.to_string());

    let (report, _) = run_collect(cfg, Arc::new(NullRecorder)).await;
    assert_eq!(report.results, 1);

    let cookie = seen_cookie.lock().unwrap_or_else(|e| e.into_inner()).clone();
    assert_eq!(cookie.as_deref(), Some("session=hooked"));
}

#[tokio::test]
async fn transport_errors_surface_as_the_run_outcome() {
    let dir = tempfile::tempdir().unwrap();
    let wordlist = write_file(&dir, "words.txt", "a\n");

    // nothing listens on this port
    let mut cfg = base_config("127.0.0.1:1".parse().unwrap(), &wordlist);
    cfg.match_status = vec![200];

    let (report, matched) = run_collect(cfg, Arc::new(NullRecorder)).await;

    assert_eq!(report.results, 1);
    // errors bypass the status filter and stay visible
    assert_eq!(report.matched, 1);
    assert_eq!(matched.len(), 1);
    assert_eq!(matched[0].status, 0);
    assert!(report.first_error.is_some());
}

#[tokio::test]
async fn equivalent_configs_share_a_run_identity() {
    let dir = tempfile::tempdir().unwrap();
    let wordlist = write_file(&dir, "words.txt", "a\n");

    let cfg_a = base_config("127.0.0.1:1".parse().unwrap(), &wordlist);
    let mut cfg_b = cfg_a.clone();
    cfg_b.target = format!("  {}  ", cfg_a.target);

    // identical semantic configuration, cosmetic whitespace differences
    assert_eq!(
        engine::run_identity(&cfg_a).unwrap(),
        engine::run_identity(&cfg_b).unwrap()
    );
}
