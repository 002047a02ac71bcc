use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clap::Parser;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::runtime::Builder;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

use crate::cli::args::CliArgs;
use crate::config::{self, ConfigFile};
use crate::engine;
use crate::matcher;
use crate::output::{ChannelSink, JsonlSink, PrettySink, ResultSink, RunHeader};
use crate::record::{AttemptRecorder, FileRecorder, NullRecorder};
use crate::verify;

/// Effective settings after merging CLI flags over the config file.
struct RunSettings {
    engine: engine::Config,
    attempt_log: Option<PathBuf>,
    output: Option<PathBuf>,
    verifier: Option<String>,
    show_similarity: bool,
    dry_run: bool,
}

fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("delver={default_level}")));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn format_kv_line(label: &str, value: &str) {
    println!(":: {label:<12}: {value}");
}

fn build_run_settings(args: CliArgs, cfg: ConfigFile) -> Result<RunSettings, String> {
    let target = args
        .url
        .or(cfg.target)
        .map(|t| t.trim().to_string())
        .unwrap_or_default();
    if target.is_empty() {
        return Err("a target URL must be provided with -u".to_string());
    }

    let wordlist = args
        .wordlist
        .or(cfg.wordlist)
        .map(|w| config::expand_tilde(&w))
        .unwrap_or_default();
    if wordlist.as_os_str().is_empty() {
        return Err("a wordlist must be provided with -w".to_string());
    }

    let method_raw = args
        .method
        .or(cfg.method)
        .unwrap_or_else(|| "HEAD".to_string());
    let method = reqwest::Method::from_bytes(method_raw.trim().to_ascii_uppercase().as_bytes())
        .map_err(|_| format!("invalid HTTP method '{method_raw}'"))?;

    let match_status = match args.match_status.or(cfg.match_status) {
        Some(raw) => matcher::parse_status_list(&raw)?,
        None => Vec::new(),
    };

    let filter_size = match args.filter_size.or(cfg.filter_size) {
        Some(raw) => matcher::parse_size_range(&raw)?,
        None => matcher::SizeRange::default(),
    };

    let similarity_threshold = args
        .similarity_threshold
        .or(cfg.similarity_threshold)
        .unwrap_or(engine::DEFAULT_SIMILARITY_THRESHOLD);
    if !(0.0..=1.0).contains(&similarity_threshold) {
        return Err("--similarity-threshold must be between 0 and 1".to_string());
    }

    let timeout = args
        .timeout
        .or(cfg.timeout)
        .map(Duration::from_secs)
        .unwrap_or(engine::DEFAULT_TIMEOUT);

    let engine_cfg = engine::Config {
        target,
        wordlist,
        quick: args.quick || cfg.quick.unwrap_or(false),
        quick_wordlist: args
            .quick_wordlist
            .or(cfg.quick_wordlist)
            .map(|p| config::expand_tilde(&p)),
        concurrency: args.concurrency.or(cfg.concurrency).unwrap_or(10),
        timeout,
        method,
        follow_redirects: args.follow_redirects || cfg.follow_redirects.unwrap_or(false),
        pre_hook: args.pre_hook.or(cfg.pre_hook),
        no_baseline: args.no_baseline || cfg.no_baseline.unwrap_or(false),
        similarity_threshold,
        match_status,
        filter_size,
        shingle_size: 0,
        progress_file: args
            .progress_file
            .or(cfg.progress_file)
            .map(|p| config::expand_tilde(&p)),
        run_id: args.run_id.or(cfg.run_id).filter(|id| !id.trim().is_empty()),
    };

    Ok(RunSettings {
        engine: engine_cfg,
        attempt_log: args
            .attempt_log
            .or(cfg.attempt_log)
            .map(|p| config::expand_tilde(&p)),
        output: args.output.or(cfg.output).map(|p| config::expand_tilde(&p)),
        verifier: args.verifier.or(cfg.verifier),
        show_similarity: args.show_similarity || cfg.show_similarity.unwrap_or(false),
        dry_run: args.dry_run,
    })
}

fn print_dry_run(settings: &RunSettings) -> Result<(), String> {
    let plan = engine::plan(&settings.engine).map_err(|e| e.to_string())?;

    print!("Dry run: {} permutations", plan.total_count);
    if plan.quick_count > 0 {
        print!(" ({} quick, {} primary)", plan.quick_count, plan.primary_count);
    }
    println!();

    if plan.samples.is_empty() {
        println!("(no permutations generated)");
    } else {
        println!("Samples:");
        for sample in &plan.samples {
            println!("  {} {}", settings.engine.method, sample);
        }
    }
    Ok(())
}

pub fn run_cli() -> Result<(), String> {
    let args = CliArgs::parse();

    init_logging(args.verbose);
    if args.no_color {
        colored::control::set_override(false);
    }

    let config_file = match args.config.as_deref() {
        Some(path) => {
            let path = config::expand_tilde(path);
            match config::load_config(&path, false) {
                Ok(cfg) => cfg,
                Err(message) => {
                    eprintln!("delver: {message}");
                    exit(2);
                }
            }
        }
        None => match config::default_config_path() {
            Some(path) => config::load_config(&path, true).unwrap_or_default(),
            None => ConfigFile::default(),
        },
    };

    let settings = match build_run_settings(args, config_file) {
        Ok(settings) => settings,
        Err(message) => {
            eprintln!("delver: {message}");
            exit(2);
        }
    };

    if settings.dry_run {
        return print_dry_run(&settings);
    }

    let runtime = Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| format!("failed to start runtime: {e}"))?;
    runtime.block_on(run_async(settings))
}

async fn run_async(settings: RunSettings) -> Result<(), String> {
    let run_id = engine::run_identity(&settings.engine).map_err(|e| e.to_string())?;

    format_kv_line("target", &settings.engine.target);
    format_kv_line("wordlist", &settings.engine.wordlist.display().to_string());
    format_kv_line("method", settings.engine.method.as_str());
    format_kv_line("workers", &settings.engine.concurrency.to_string());
    format_kv_line("run id", &run_id);

    let recorder: Arc<dyn AttemptRecorder> = match &settings.attempt_log {
        Some(path) => Arc::new(
            FileRecorder::open(path, &run_id)
                .map_err(|e| format!("failed to open attempt log: {e}"))?,
        ),
        None => Arc::new(NullRecorder),
    };

    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::with_template("{spinner} probing {elapsed} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.enable_steady_tick(Duration::from_millis(120));

    let mut sinks: Vec<Box<dyn ResultSink + Send>> = Vec::new();
    sinks.push(Box::new(PrettySink::new(pb.clone(), settings.show_similarity)));

    if let Some(path) = &settings.output {
        let mut jsonl = JsonlSink::create(path, settings.show_similarity)
            .map_err(|e| format!("failed to create output file: {e}"))?;
        let (config_entries, payload_entries) =
            engine::identity_entries(&settings.engine).map_err(|e| e.to_string())?;
        let started_at = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .ok();
        jsonl
            .write_header(RunHeader {
                kind: String::new(),
                run_id: run_id.clone(),
                target_url: settings.engine.target.clone(),
                wordlist: settings.engine.wordlist.display().to_string(),
                started_at,
                config: config_entries,
                payloads: payload_entries,
            })
            .map_err(|e| format!("failed to write output header: {e}"))?;
        sinks.push(Box::new(jsonl));
    }

    let (handle, token) = engine::cancel_pair();
    let interrupt_pb = pb.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            interrupt_pb.println("interrupt received; finishing in-flight probes");
            handle.cancel();
        }
    });

    let method = settings.engine.method.clone();
    let report = match &settings.verifier {
        Some(verifier) => {
            // the verifier consumes the match stream outside the engine
            let (tx, mut rx) = mpsc::unbounded_channel();
            sinks.push(Box::new(ChannelSink::new(tx)));

            let engine_cfg = settings.engine.clone();
            let engine_task = tokio::spawn(engine::run(token, engine_cfg, recorder, sinks));

            while let Some(res) = rx.recv().await {
                if res.error.is_some() {
                    continue;
                }
                let event = verify::MatchEvent::from_result(&res, &method);
                match verify::call(verifier, &event).await {
                    Ok(response) => match response.verify {
                        Some(true) => pb.println(format!("verified :: {}", res.url)),
                        Some(false) => pb.println(format!("verifier rejected :: {}", res.url)),
                        None => {}
                    },
                    Err(e) => pb.println(format!("verifier failed for {}: {e}", res.url)),
                }
            }

            engine_task
                .await
                .map_err(|e| format!("engine task failed: {e}"))?
                .map_err(|e| e.to_string())?
        }
        None => engine::run(token, settings.engine.clone(), recorder, sinks)
            .await
            .map_err(|e| e.to_string())?,
    };

    pb.finish_and_clear();

    format_kv_line("results", &report.results.to_string());
    format_kv_line("matched", &report.matched.to_string());
    if report.cancelled {
        println!("run cancelled; progress preserved for resume");
    }

    if let Some(message) = report.sink_error {
        return Err(format!("output error: {message}"));
    }
    if let Some(message) = report.first_error {
        return Err(message);
    }

    Ok(())
}
