use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A confirmed hit handed to the recorder after matching.
#[derive(Clone, Debug)]
pub struct Hit {
    pub url: String,
    pub status: u16,
    pub content_length: i64,
    pub duration: Duration,
}

#[derive(Debug, Error)]
pub enum RecorderError {
    #[error("attempt log I/O failure: {0}")]
    Io(#[from] io::Error),

    #[error("attempt log encoding failure: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Idempotent "have I tried this URL?" set plus fire-and-forget hit storage,
/// scoped to a single run identity. Implementations must be safe to call from
/// concurrent workers.
pub trait AttemptRecorder: Send + Sync {
    /// Records the URL and returns true exactly once per URL per run
    /// identity.
    fn mark_attempt(&self, url: &str) -> Result<bool, RecorderError>;

    fn record_hit(&self, hit: &Hit) -> Result<(), RecorderError>;

    fn close(&self) -> Result<(), RecorderError> {
        Ok(())
    }
}

/// Recorder used when persistence is disabled: every URL is new, hits go
/// nowhere.
#[derive(Debug, Default)]
pub struct NullRecorder;

impl AttemptRecorder for NullRecorder {
    fn mark_attempt(&self, _url: &str) -> Result<bool, RecorderError> {
        Ok(true)
    }

    fn record_hit(&self, _hit: &Hit) -> Result<(), RecorderError> {
        Ok(())
    }
}

/// In-process recorder; attempts live for the lifetime of the run only.
#[derive(Debug, Default)]
pub struct MemoryRecorder {
    seen: Mutex<HashSet<String>>,
    hits: Mutex<Vec<Hit>>,
}

impl MemoryRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hits(&self) -> Vec<Hit> {
        self.hits.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl AttemptRecorder for MemoryRecorder {
    fn mark_attempt(&self, url: &str) -> Result<bool, RecorderError> {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        Ok(seen.insert(url.to_string()))
    }

    fn record_hit(&self, hit: &Hit) -> Result<(), RecorderError> {
        let mut hits = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        hits.push(hit.clone());
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
enum LogRecord {
    Attempt {
        run_id: String,
        url: String,
    },
    Hit {
        run_id: String,
        url: String,
        status: u16,
        content_length: i64,
        duration_ms: u64,
    },
}

struct FileRecorderInner {
    seen: HashSet<String>,
    file: File,
}

/// Append-only JSONL attempt log. On open, attempts recorded under the same
/// run identity are reloaded so resumed runs skip URLs they already tried;
/// entries from other runs stay on disk but are invisible here.
pub struct FileRecorder {
    run_id: String,
    inner: Mutex<FileRecorderInner>,
}

impl FileRecorder {
    pub fn open(path: &Path, run_id: &str) -> Result<Self, RecorderError> {
        let mut seen = HashSet::new();
        match File::open(path) {
            Ok(existing) => {
                for line in BufReader::new(existing).lines() {
                    let line = line?;
                    if line.trim().is_empty() {
                        continue;
                    }
                    // a torn trailing line from a crashed run is ignored
                    let Ok(record) = serde_json::from_str::<LogRecord>(&line) else {
                        continue;
                    };
                    if let LogRecord::Attempt { run_id: rid, url } = record {
                        if rid == run_id {
                            seen.insert(url);
                        }
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            run_id: run_id.to_string(),
            inner: Mutex::new(FileRecorderInner { seen, file }),
        })
    }

    fn append(inner: &mut FileRecorderInner, record: &LogRecord) -> Result<(), RecorderError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');
        inner.file.write_all(&line)?;
        inner.file.flush()?;
        Ok(())
    }
}

impl AttemptRecorder for FileRecorder {
    fn mark_attempt(&self, url: &str) -> Result<bool, RecorderError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !inner.seen.insert(url.to_string()) {
            return Ok(false);
        }
        let record = LogRecord::Attempt {
            run_id: self.run_id.clone(),
            url: url.to_string(),
        };
        Self::append(&mut inner, &record)?;
        Ok(true)
    }

    fn record_hit(&self, hit: &Hit) -> Result<(), RecorderError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let record = LogRecord::Hit {
            run_id: self.run_id.clone(),
            url: hit.url.clone(),
            status: hit.status,
            content_length: hit.content_length,
            duration_ms: hit.duration.as_millis() as u64,
        };
        Self::append(&mut inner, &record)
    }

    fn close(&self) -> Result<(), RecorderError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.file.flush()?;
        Ok(())
    }
}
