pub mod cancel;
pub mod prehook;
pub(crate) mod stage;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task;
use tracing::{debug, info, warn};

use crate::client::{ClientError, HttpClient, RequestOptions};
use crate::expand;
use crate::identity;
use crate::matcher::{Matcher, MatcherOptions, SizeRange};
use crate::output::ResultSink;
use crate::progress::{ProgressError, ProgressTracker, Stage};
use crate::record::{AttemptRecorder, Hit};

pub use cancel::{cancel_pair, CancelHandle, CancelToken};
pub use prehook::PreHookError;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_SIMILARITY_THRESHOLD: f64 = 0.6;

/// Immutable run configuration, built once before the engine starts.
#[derive(Clone, Debug)]
pub struct Config {
    pub target: String,
    pub wordlist: PathBuf,
    pub quick: bool,
    pub quick_wordlist: Option<PathBuf>,
    pub concurrency: usize,
    pub timeout: Duration,
    pub method: reqwest::Method,
    pub follow_redirects: bool,
    pub pre_hook: Option<String>,
    pub no_baseline: bool,
    pub similarity_threshold: f64,
    pub match_status: Vec<u16>,
    pub filter_size: SizeRange,
    pub shingle_size: usize,
    pub progress_file: Option<PathBuf>,
    pub run_id: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            target: String::new(),
            wordlist: PathBuf::new(),
            quick: false,
            quick_wordlist: None,
            concurrency: 1,
            timeout: DEFAULT_TIMEOUT,
            method: reqwest::Method::HEAD,
            follow_redirects: false,
            pre_hook: None,
            no_baseline: false,
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            match_status: Vec::new(),
            filter_size: SizeRange::default(),
            shingle_size: 0,
            progress_file: None,
            run_id: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("a target URL must be provided")]
    MissingTarget,

    #[error("a wordlist must be provided")]
    MissingWordlist,

    #[error("failed to open wordlist '{path}': {source}")]
    WordlistUnreadable {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("unsupported HTTP method '{method}', expected GET, HEAD, or POST")]
    UnsupportedMethod { method: String },

    #[error("similarity threshold {value} out of range, expected 0 to 1")]
    InvalidThreshold { value: f64 },

    #[error(transparent)]
    PreHook(#[from] PreHookError),

    #[error(transparent)]
    Client(#[from] ClientError),

    #[error(transparent)]
    Progress(#[from] ProgressError),
}

/// One probe outcome. Transport failures carry status 0, an unknown length,
/// and the error message; similarity is present only when baseline filtering
/// scored the body.
#[derive(Clone, Debug)]
pub struct ProbeResult {
    pub url: String,
    pub status: u16,
    pub content_length: i64,
    pub duration: Duration,
    pub body: Vec<u8>,
    pub error: Option<String>,
    pub similarity: Option<f64>,
}

impl ProbeResult {
    pub(crate) fn failure(url: String, message: String) -> Self {
        Self {
            url,
            status: 0,
            content_length: -1,
            duration: Duration::ZERO,
            body: Vec::new(),
            error: Some(message),
            similarity: None,
        }
    }
}

/// Summary of a finished (or cancelled) run.
#[derive(Clone, Debug, Default)]
pub struct RunReport {
    pub run_id: String,
    pub results: u64,
    pub matched: u64,
    pub first_error: Option<String>,
    pub sink_error: Option<String>,
    pub cancelled: bool,
}

/// Dry-run preview of the work a configuration would schedule.
#[derive(Clone, Debug, Default)]
pub struct Plan {
    pub quick_count: u64,
    pub primary_count: u64,
    pub total_count: u64,
    pub samples: Vec<String>,
}

pub(crate) struct Validated {
    pub(crate) target: String,
    pub(crate) wordlist: PathBuf,
    pub(crate) quick_wordlist: Option<PathBuf>,
    pub(crate) concurrency: usize,
    pub(crate) timeout: Duration,
    pub(crate) method: reqwest::Method,
}

fn validate(cfg: &Config) -> Result<Validated, EngineError> {
    let target = cfg.target.trim().to_string();
    if target.is_empty() {
        return Err(EngineError::MissingTarget);
    }

    if cfg.wordlist.as_os_str().is_empty() {
        return Err(EngineError::MissingWordlist);
    }
    if let Err(e) = std::fs::metadata(&cfg.wordlist) {
        return Err(EngineError::WordlistUnreadable {
            path: cfg.wordlist.display().to_string(),
            source: e,
        });
    }

    if cfg.method != reqwest::Method::GET
        && cfg.method != reqwest::Method::HEAD
        && cfg.method != reqwest::Method::POST
    {
        return Err(EngineError::UnsupportedMethod {
            method: cfg.method.to_string(),
        });
    }

    if !(0.0..=1.0).contains(&cfg.similarity_threshold) {
        return Err(EngineError::InvalidThreshold {
            value: cfg.similarity_threshold,
        });
    }

    let timeout = if cfg.timeout.is_zero() {
        DEFAULT_TIMEOUT
    } else {
        cfg.timeout
    };

    let quick_wordlist = if cfg.quick {
        locate_quick_wordlist(&cfg.wordlist, cfg.quick_wordlist.as_deref())
    } else {
        None
    };

    Ok(Validated {
        target,
        wordlist: cfg.wordlist.clone(),
        quick_wordlist,
        concurrency: cfg.concurrency.max(1),
        timeout,
        method: cfg.method.clone(),
    })
}

/// Finds the quick-sample wordlist: an explicit path wins, then
/// `<stem>.quick.<ext>` beside the main wordlist, then `quick.txt` in the
/// same directory.
fn locate_quick_wordlist(wordlist: &Path, explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        if path.exists() {
            return Some(path.to_path_buf());
        }
        warn!(path = %path.display(), "quick wordlist not found; quick stage skipped");
        return None;
    }

    let dir = wordlist.parent().unwrap_or_else(|| Path::new("."));
    if let Some(stem) = wordlist.file_stem().map(|s| s.to_string_lossy()) {
        let sibling = match wordlist.extension().map(|e| e.to_string_lossy()) {
            Some(ext) => dir.join(format!("{stem}.quick.{ext}")),
            None => dir.join(format!("{stem}.quick")),
        };
        if sibling.exists() {
            return Some(sibling);
        }
    }

    let fallback = dir.join("quick.txt");
    fallback.exists().then_some(fallback)
}

/// Normalized `key=value` entries feeding the run identity digest; mirrors
/// the effective configuration rather than the raw flag values.
fn run_config_entries(cfg: &Config, v: &Validated) -> Vec<String> {
    let mut entries = vec![
        format!("target_url={}", v.target),
        format!("wordlist={}", v.wordlist.display()),
        format!("method={}", v.method),
        format!("concurrency={}", v.concurrency),
        format!("timeout={:?}", v.timeout),
        format!("follow_redirects={}", cfg.follow_redirects),
        format!("similarity_threshold={:.6}", cfg.similarity_threshold),
        format!("no_baseline={}", cfg.no_baseline),
    ];

    if !cfg.match_status.is_empty() {
        let codes: Vec<String> = cfg.match_status.iter().map(|c| c.to_string()).collect();
        entries.push(format!("match_status={}", codes.join(",")));
    }
    if cfg.filter_size.is_bounded() {
        let min = cfg.filter_size.min.map(|m| m.to_string()).unwrap_or_default();
        let max = cfg.filter_size.max.map(|m| m.to_string()).unwrap_or_default();
        entries.push(format!("filter_size={min}-{max}"));
    }
    if let Some(path) = &cfg.progress_file {
        entries.push(format!("progress_file={}", path.display()));
    }
    if let Some(cmd) = cfg.pre_hook.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        entries.push(format!("pre_hook={cmd}"));
    }
    if cfg.quick {
        entries.push("quick=true".to_string());
    }

    entries
}

fn payload_entries(v: &Validated) -> Vec<String> {
    let mut entries = vec![v.wordlist.display().to_string()];
    if let Some(quick) = &v.quick_wordlist {
        entries.push(quick.display().to_string());
    }
    entries
}

/// Stable run identity for a configuration, available before any request is
/// issued. An explicit `run_id` override wins over the computed digest.
pub fn run_identity(cfg: &Config) -> Result<String, EngineError> {
    let v = validate(cfg)?;
    Ok(identity::resolve_identity(
        cfg.run_id.as_deref(),
        &run_config_entries(cfg, &v),
        &payload_entries(&v),
    ))
}

/// Normalized config and payload entries feeding the identity digest, in the
/// shape downstream run headers record them.
pub fn identity_entries(cfg: &Config) -> Result<(Vec<String>, Vec<String>), EngineError> {
    let v = validate(cfg)?;
    Ok((
        identity::normalize_entries(&run_config_entries(cfg, &v)),
        identity::normalize_entries(&payload_entries(&v)),
    ))
}

/// Computes the planned permutations and up to ten sample URLs without
/// issuing any network I/O or touching the progress tracker.
pub fn plan(cfg: &Config) -> Result<Plan, EngineError> {
    let v = validate(cfg)?;
    let mut plan = Plan::default();

    if let Some(quick) = &v.quick_wordlist {
        plan.quick_count = count_permutations(quick, &v.target, &mut plan.samples)?;
    }
    plan.primary_count = count_permutations(&v.wordlist, &v.target, &mut plan.samples)?;
    plan.total_count = plan.quick_count + plan.primary_count;

    Ok(plan)
}

fn count_permutations(
    wordlist: &Path,
    target: &str,
    samples: &mut Vec<String>,
) -> Result<u64, EngineError> {
    use std::io::BufRead;

    const MAX_SAMPLES: usize = 10;

    let file = std::fs::File::open(wordlist).map_err(|e| EngineError::WordlistUnreadable {
        path: wordlist.display().to_string(),
        source: e,
    })?;

    let mut count = 0u64;
    for line in io::BufReader::new(file).lines() {
        let line = line.map_err(|e| EngineError::WordlistUnreadable {
            path: wordlist.display().to_string(),
            source: e,
        })?;
        let word = line.trim();
        if word.is_empty() {
            continue;
        }
        for payload in expand::expand_payload(word) {
            count += 1;
            if samples.len() < MAX_SAMPLES {
                samples.push(expand::expand_target(target, &payload));
            }
        }
    }
    Ok(count)
}

fn random_token() -> String {
    let bytes: [u8; 16] = rand::thread_rng().gen();
    hex::encode(bytes)
}

async fn capture_baseline(client: &HttpClient, v: &Validated) -> Result<Vec<u8>, reqwest::Error> {
    let url = expand::expand_target(&v.target, &random_token());
    let resp = client
        .request(
            reqwest::Method::GET,
            &url,
            v.timeout,
            &RequestOptions::default(),
        )
        .await?;
    Ok(resp.body)
}

/// Runs the engine to completion: computes the run identity, captures the
/// baseline, runs the pre-hook, sequences the quick and primary stages, and
/// fans matched results through the sinks in insertion order. Sink failures
/// are recorded once and never stop the run; the first transport or record
/// error becomes the run outcome.
pub async fn run(
    cancel: CancelToken,
    cfg: Config,
    recorder: Arc<dyn AttemptRecorder>,
    sinks: Vec<Box<dyn ResultSink + Send>>,
) -> Result<RunReport, EngineError> {
    let v = validate(&cfg)?;

    let run_id = identity::resolve_identity(
        cfg.run_id.as_deref(),
        &run_config_entries(&cfg, &v),
        &payload_entries(&v),
    );
    debug!(%run_id, "computed run identity");

    let client = HttpClient::new(v.timeout, cfg.follow_redirects)?;

    let baseline_body = if cfg.no_baseline {
        Vec::new()
    } else {
        match capture_baseline(&client, &v).await {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "baseline request failed; similarity filtering disabled");
                Vec::new()
            }
        }
    };

    let options = match cfg.pre_hook.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
        Some(command) => Arc::new(prehook::run(command).await?),
        None => Arc::new(RequestOptions::default()),
    };

    let matcher = Matcher::new(MatcherOptions {
        statuses: cfg.match_status.clone(),
        size: cfg.filter_size,
        baseline_body,
        similarity_threshold: cfg.similarity_threshold,
        shingle_size: cfg.shingle_size,
    });
    if !cfg.no_baseline && !matcher.has_baseline() {
        info!("no usable baseline fingerprint; similarity filtering is off for this run");
    }

    let progress = Arc::new(ProgressTracker::load(cfg.progress_file.clone())?);

    let mut report = RunReport {
        run_id: run_id.clone(),
        ..Default::default()
    };
    let mut sinks = sinks;

    if progress.stage_completed(Stage::Primary) {
        info!(%run_id, "progress file marks this run complete; nothing to do");
        finish_sinks(&mut sinks, &mut report);
        if let Err(e) = recorder.close() {
            report.first_error.get_or_insert(e.to_string());
        }
        return Ok(report);
    }

    let (result_tx, mut result_rx) = mpsc::channel::<ProbeResult>(1024);

    let ctx = stage::StageContext {
        cancel: cancel.clone(),
        client,
        options,
        method: v.method.clone(),
        timeout: v.timeout,
        target: v.target.clone(),
        concurrency: v.concurrency,
        progress: progress.clone(),
        recorder: recorder.clone(),
        results: result_tx,
    };

    let quick_wordlist = v.quick_wordlist.clone();
    let primary_wordlist = v.wordlist.clone();
    let driver = task::spawn(async move {
        let proceed = match &quick_wordlist {
            Some(path) => {
                ctx.run(Stage::Quick, path, Stage::Primary, Stage::Complete)
                    .await?
            }
            None => true,
        };
        if proceed {
            ctx.run(Stage::Primary, &primary_wordlist, Stage::Complete, Stage::Complete)
                .await?;
        } else {
            info!("quick stage saw nothing interesting; skipping primary");
        }
        Ok::<(), EngineError>(())
    });

    while let Some(mut res) = result_rx.recv().await {
        report.results += 1;

        let outcome = matcher.evaluate(&res);
        if outcome.similarity.is_some() {
            res.similarity = outcome.similarity;
        }
        if let Some(err) = &res.error {
            report.first_error.get_or_insert(err.clone());
        }
        if !outcome.matched {
            continue;
        }
        report.matched += 1;

        if res.error.is_none() {
            if let Err(e) = recorder.record_hit(&Hit {
                url: res.url.clone(),
                status: res.status,
                content_length: res.content_length,
                duration: res.duration,
            }) {
                let synthetic =
                    ProbeResult::failure(res.url.clone(), format!("record hit: {e}"));
                report.first_error.get_or_insert_with(|| format!("record hit: {e}"));
                deliver(&mut sinks, &synthetic, &mut report);
            }
        }

        deliver(&mut sinks, &res, &mut report);
    }

    match driver.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            report.first_error.get_or_insert(e.to_string());
        }
        Err(e) => {
            report.first_error.get_or_insert(format!("stage task failed: {e}"));
        }
    }

    report.cancelled = cancel.is_cancelled();
    finish_sinks(&mut sinks, &mut report);
    if let Err(e) = recorder.close() {
        report.first_error.get_or_insert(e.to_string());
    }

    Ok(report)
}

fn deliver(sinks: &mut [Box<dyn ResultSink + Send>], res: &ProbeResult, report: &mut RunReport) {
    for sink in sinks.iter_mut() {
        if let Err(e) = sink.emit(res) {
            if report.sink_error.is_none() {
                warn!(error = %e, "sink write failed; further sink errors suppressed");
                report.sink_error = Some(e.to_string());
            }
        }
    }
}

fn finish_sinks(sinks: &mut [Box<dyn ResultSink + Send>], report: &mut RunReport) {
    for sink in sinks.iter_mut() {
        if let Err(e) = sink.flush().and_then(|_| sink.close()) {
            if report.sink_error.is_none() {
                report.sink_error = Some(e.to_string());
            }
        }
    }
}
