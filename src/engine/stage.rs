use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio::task;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::client::{HttpClient, RequestOptions};
use crate::engine::cancel::CancelToken;
use crate::engine::{EngineError, ProbeResult};
use crate::expand;
use crate::progress::{ProgressTracker, Stage};
use crate::record::AttemptRecorder;

const WORKER_QUEUE_DEPTH: usize = 32;

/// Statuses that suggest an interesting resource: anything short of an error
/// class, plus the auth/method refusals that imply the path exists.
pub(crate) fn is_quick_positive(status: u16) -> bool {
    (200..400).contains(&status) || matches!(status, 401 | 403 | 405)
}

/// Shared state for one stage invocation. The producer runs inline in
/// [`StageContext::run`]; jobs flow through an unbounded queue to a
/// round-robin dispatcher feeding per-worker channels, and every result goes
/// out on the shared bounded channel.
pub(crate) struct StageContext {
    pub(crate) cancel: CancelToken,
    pub(crate) client: HttpClient,
    pub(crate) options: Arc<RequestOptions>,
    pub(crate) method: reqwest::Method,
    pub(crate) timeout: Duration,
    pub(crate) target: String,
    pub(crate) concurrency: usize,
    pub(crate) progress: Arc<ProgressTracker>,
    pub(crate) recorder: Arc<dyn AttemptRecorder>,
    pub(crate) results: mpsc::Sender<ProbeResult>,
}

impl StageContext {
    /// Runs one stage over the wordlist and reports whether any response
    /// looked interesting. On clean completion the progress tracker advances
    /// to the configured successor; a cancelled stage leaves the cursor where
    /// it stopped so the next run resumes from it.
    pub(crate) async fn run(
        &self,
        stage: Stage,
        wordlist: &Path,
        on_positive: Stage,
        on_negative: Stage,
    ) -> Result<bool, EngineError> {
        if self.progress.stage_completed(stage) {
            // a completed quick stage reports a synthetic positive so the
            // orchestrator proceeds to the persisted primary stage
            debug!(stage = %stage, "stage already completed; skipping");
            return Ok(stage == Stage::Quick);
        }
        self.progress.ensure_stage(stage)?;

        let file = File::open(wordlist)
            .await
            .map_err(|e| EngineError::WordlistUnreadable {
                path: wordlist.display().to_string(),
                source: e,
            })?;

        let worker_count = self.concurrency.max(1);
        let (job_tx, mut job_rx) = mpsc::unbounded_channel::<String>();

        let mut worker_rxs = Vec::new();
        let mut worker_txs = Vec::with_capacity(worker_count);
        for _ in 0..worker_count {
            let (tx, rx) = mpsc::channel::<String>(WORKER_QUEUE_DEPTH);
            worker_txs.push(tx);
            worker_rxs.push(rx);
        }

        let dispatch_cancel = self.cancel.clone();
        let dispatcher = task::spawn(async move {
            let mut idx = 0usize;
            while let Some(job) = job_rx.recv().await {
                let tx = &worker_txs[idx % worker_txs.len()];
                let delivered = tokio::select! {
                    _ = dispatch_cancel.cancelled() => false,
                    sent = tx.send(job) => sent.is_ok(),
                };
                if !delivered {
                    break;
                }
                idx = idx.wrapping_add(1);
            }
        });

        let positive = Arc::new(AtomicBool::new(false));
        let mut workers = Vec::with_capacity(worker_count);
        for rx in worker_rxs {
            workers.push(task::spawn(worker_loop(
                self.cancel.clone(),
                self.client.clone(),
                self.options.clone(),
                self.method.clone(),
                self.timeout,
                rx,
                self.results.clone(),
                positive.clone(),
            )));
        }

        let mut clean = true;
        let mut lines = BufReader::new(file).lines();
        let mut word_index: u64 = 0;

        'produce: loop {
            if self.cancel.is_cancelled() {
                break;
            }

            let line = match lines.next_line().await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    // the scan cannot continue, but the cursor stays put so a
                    // resume retries from here
                    let failure =
                        ProbeResult::failure(self.target.clone(), format!("read wordlist: {e}"));
                    self.emit(failure).await;
                    clean = false;
                    break;
                }
            };

            let word = line.trim();
            if word.is_empty() {
                continue;
            }

            let variants = expand::expand_payload(word);
            let variant_count = variants.len() as u64;
            for (variant_index, payload) in variants.iter().enumerate() {
                let variant_index = variant_index as u64;
                if self.cancel.is_cancelled() {
                    break 'produce;
                }
                if !self.progress.allow(stage, word_index, variant_index) {
                    continue;
                }

                let url = expand::expand_target(&self.target, payload);
                let (next_word, next_variant) = if variant_index + 1 < variant_count {
                    (word_index, variant_index + 1)
                } else {
                    (word_index + 1, 0)
                };

                match self.recorder.mark_attempt(&url) {
                    Ok(true) => {
                        if job_tx.send(url).is_err() {
                            break 'produce;
                        }
                    }
                    Ok(false) => {
                        debug!(%url, "already attempted; skipping");
                    }
                    Err(e) => {
                        let failure =
                            ProbeResult::failure(url, format!("mark attempt: {e}"));
                        if !self.emit(failure).await {
                            break 'produce;
                        }
                    }
                }

                self.checkpoint(stage, next_word, next_variant).await;
            }

            word_index += 1;
        }

        drop(job_tx);
        let _ = dispatcher.await;
        for worker in workers {
            let _ = worker.await;
        }

        let positive = positive.load(Ordering::SeqCst);

        if clean && !self.cancel.is_cancelled() {
            let successor = if positive { on_positive } else { on_negative };
            self.checkpoint(successor, 0, 0).await;
            info!(stage = %stage, successor = %successor, positive, "stage complete");
        }

        Ok(positive)
    }

    /// Persists the cursor; a failed write surfaces as an errored result and
    /// the stage keeps going.
    async fn checkpoint(&self, stage: Stage, word_index: u64, variant_index: u64) {
        if let Err(e) = self.progress.set(stage, word_index, variant_index) {
            let failure = ProbeResult::failure(self.target.clone(), e.to_string());
            self.emit(failure).await;
        }
    }

    /// Blocking emit that honors cancellation; false means the send was
    /// abandoned.
    async fn emit(&self, result: ProbeResult) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            sent = self.results.send(result) => sent.is_ok(),
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn worker_loop(
    cancel: CancelToken,
    client: HttpClient,
    options: Arc<RequestOptions>,
    method: reqwest::Method,
    timeout: Duration,
    mut jobs: mpsc::Receiver<String>,
    results: mpsc::Sender<ProbeResult>,
    positive: Arc<AtomicBool>,
) {
    loop {
        // cancellation aborts the wait for a new job, never a job already
        // received; its per-request deadline still applies
        let url = tokio::select! {
            _ = cancel.cancelled() => break,
            job = jobs.recv() => match job {
                Some(url) => url,
                None => break,
            },
        };

        let started = Instant::now();
        let result = match client.request(method.clone(), &url, timeout, &options).await {
            Ok(resp) => {
                if is_quick_positive(resp.status) {
                    positive.store(true, Ordering::SeqCst);
                }
                ProbeResult {
                    url,
                    status: resp.status,
                    content_length: resp.content_length,
                    duration: started.elapsed(),
                    body: resp.body,
                    error: None,
                    similarity: None,
                }
            }
            Err(e) => ProbeResult {
                url,
                status: 0,
                content_length: -1,
                duration: started.elapsed(),
                body: Vec::new(),
                error: Some(e.to_string()),
                similarity: None,
            },
        };

        let delivered = tokio::select! {
            _ = cancel.cancelled() => false,
            sent = results.send(result) => sent.is_ok(),
        };
        if !delivered {
            break;
        }
    }
}
