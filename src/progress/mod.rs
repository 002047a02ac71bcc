use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Execution stages in rank order. A persisted tracker never moves to a lower
/// stage.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Quick,
    Primary,
    Complete,
}

impl Stage {
    pub fn rank(self) -> u8 {
        match self {
            Stage::Quick => 0,
            Stage::Primary => 1,
            Stage::Complete => 2,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Quick => write!(f, "quick"),
            Stage::Primary => write!(f, "primary"),
            Stage::Complete => write!(f, "complete"),
        }
    }
}

/// On-disk checkpoint: `{"stage","word_index","variant_index"}`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub stage: Stage,
    pub word_index: u64,
    pub variant_index: u64,
}

impl Cursor {
    fn key(&self) -> (u8, u64, u64) {
        (self.stage.rank(), self.word_index, self.variant_index)
    }
}

#[derive(Debug, Error)]
pub enum ProgressError {
    #[error("failed to read progress file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("invalid progress file '{path}': {source}")]
    Decode {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to write progress file '{path}': {source}")]
    Write {
        path: String,
        #[source]
        source: io::Error,
    },
}

/// Crash-safe checkpoint store. Writes go to a sibling temp file followed by
/// an atomic rename; all operations are serialized by a single lock so
/// concurrent workers observe linearizable state. Without a path the tracker
/// keeps state in memory only.
#[derive(Debug)]
pub struct ProgressTracker {
    path: Option<PathBuf>,
    state: Mutex<Option<Cursor>>,
}

impl ProgressTracker {
    pub fn in_memory() -> Self {
        Self {
            path: None,
            state: Mutex::new(None),
        }
    }

    /// Loads persisted state when the file exists; a missing file starts an
    /// empty tracker.
    pub fn load(path: Option<PathBuf>) -> Result<Self, ProgressError> {
        let Some(path) = path else {
            return Ok(Self::in_memory());
        };

        let state = match fs::read(&path) {
            Ok(raw) => {
                let cursor =
                    serde_json::from_slice::<Cursor>(&raw).map_err(|e| ProgressError::Decode {
                        path: path.display().to_string(),
                        source: e,
                    })?;
                Some(cursor)
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                return Err(ProgressError::Read {
                    path: path.display().to_string(),
                    source: e,
                })
            }
        };

        Ok(Self {
            path: Some(path),
            state: Mutex::new(state),
        })
    }

    pub fn snapshot(&self) -> Option<Cursor> {
        *self.lock()
    }

    /// Raises the tracker to `stage` with a zeroed cursor when no state is
    /// loaded or the persisted stage ranks lower. Never lowers the stage.
    pub fn ensure_stage(&self, stage: Stage) -> Result<(), ProgressError> {
        let mut state = self.lock();
        let raise = match *state {
            None => true,
            Some(cur) => stage.rank() > cur.stage.rank(),
        };
        if raise {
            let cursor = Cursor {
                stage,
                word_index: 0,
                variant_index: 0,
            };
            *state = Some(cursor);
            self.persist(&cursor)?;
        }
        Ok(())
    }

    /// Whether `(stage, word, variant)` is at or past the persisted cursor
    /// under `(rank(stage), word_index, variant_index)` lexicographic order.
    pub fn allow(&self, stage: Stage, word_index: u64, variant_index: u64) -> bool {
        let state = self.lock();
        match *state {
            None => true,
            Some(cur) => {
                let probe = Cursor {
                    stage,
                    word_index,
                    variant_index,
                };
                probe.key() >= cur.key()
            }
        }
    }

    /// Unconditionally writes the new cursor; used during forward progress.
    pub fn set(&self, stage: Stage, word_index: u64, variant_index: u64) -> Result<(), ProgressError> {
        let cursor = Cursor {
            stage,
            word_index,
            variant_index,
        };
        let mut state = self.lock();
        *state = Some(cursor);
        self.persist(&cursor)
    }

    /// True iff the persisted stage ranks strictly above `stage`.
    pub fn stage_completed(&self, stage: Stage) -> bool {
        let state = self.lock();
        match *state {
            None => false,
            Some(cur) => cur.stage.rank() > stage.rank(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Cursor>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, cursor: &Cursor) -> Result<(), ProgressError> {
        let Some(path) = &self.path else {
            return Ok(());
        };
        write_atomic(path, cursor)
    }
}

fn write_atomic(path: &Path, cursor: &Cursor) -> Result<(), ProgressError> {
    let raw = serde_json::to_vec(cursor).map_err(|e| ProgressError::Write {
        path: path.display().to_string(),
        source: io::Error::new(io::ErrorKind::InvalidData, e),
    })?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "progress".to_string());
    let tmp = path.with_file_name(format!("{file_name}.tmp"));

    fs::write(&tmp, raw).map_err(|e| ProgressError::Write {
        path: tmp.display().to_string(),
        source: e,
    })?;
    fs::rename(&tmp, path).map_err(|e| ProgressError::Write {
        path: path.display().to_string(),
        source: e,
    })
}
