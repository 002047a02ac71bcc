use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use colored::Colorize;
use indicatif::ProgressBar;
use serde::Serialize;
use thiserror::Error;

use crate::engine::ProbeResult;

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("sink I/O failure: {0}")]
    Io(#[from] io::Error),

    #[error("sink encoding failure: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("result channel closed")]
    ChannelClosed,
}

/// Downstream consumer of matched results. The orchestrator owns a list of
/// sinks and calls each in insertion order; `flush` is a no-op capability by
/// default.
pub trait ResultSink: Send {
    fn emit(&mut self, res: &ProbeResult) -> Result<(), SinkError>;

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NullSink;

impl ResultSink for NullSink {
    fn emit(&mut self, _res: &ProbeResult) -> Result<(), SinkError> {
        Ok(())
    }
}

/// Streams matched results as colored terminal lines through a progress bar
/// so output interleaves cleanly with the spinner.
pub struct PrettySink {
    pb: ProgressBar,
    show_similarity: bool,
}

impl PrettySink {
    pub fn new(pb: ProgressBar, show_similarity: bool) -> Self {
        Self {
            pb,
            show_similarity,
        }
    }
}

pub fn format_result_line(res: &ProbeResult, show_similarity: bool) -> String {
    if let Some(err) = &res.error {
        return format!(
            "{} {} {}",
            "ERR".bold().red(),
            res.url.bold().cyan(),
            err.dimmed()
        );
    }

    let status = match res.status {
        200..=299 => res.status.to_string().bold().green(),
        300..=399 => res.status.to_string().bold().blue(),
        400..=499 => res.status.to_string().bold().yellow(),
        _ => res.status.to_string().bold().red(),
    };

    let mut line = format!(
        "{} {:>8} {:>6}ms {}",
        status,
        res.content_length,
        res.duration.as_millis(),
        res.url.bold().cyan()
    );
    if show_similarity {
        if let Some(similarity) = res.similarity {
            line.push_str(&format!(" sim={similarity:.2}"));
        }
    }
    line
}

impl ResultSink for PrettySink {
    fn emit(&mut self, res: &ProbeResult) -> Result<(), SinkError> {
        self.pb.println(format_result_line(res, self.show_similarity));
        Ok(())
    }
}

/// Metadata emitted as the first JSONL record of a run.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RunHeader {
    #[serde(rename = "type")]
    pub kind: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub target_url: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub wordlist: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<u64>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub config: Vec<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub payloads: Vec<String>,
}

#[derive(Serialize)]
struct JsonlEntry<'a> {
    url: &'a str,
    status: u16,
    size: i64,
    latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    similarity: Option<f64>,
}

/// Writes results as newline-delimited JSON, flushing after every record so
/// the stream is tail-able while a run is in flight.
pub struct JsonlSink<W: Write + Send> {
    writer: W,
    show_similarity: bool,
}

impl JsonlSink<BufWriter<File>> {
    pub fn create(path: &Path, show_similarity: bool) -> Result<Self, SinkError> {
        let file = File::create(path)?;
        Ok(Self::new(BufWriter::new(file), show_similarity))
    }
}

impl<W: Write + Send> JsonlSink<W> {
    pub fn new(writer: W, show_similarity: bool) -> Self {
        Self {
            writer,
            show_similarity,
        }
    }

    pub fn write_header(&mut self, mut header: RunHeader) -> Result<(), SinkError> {
        if header.kind.is_empty() {
            header.kind = "run".to_string();
        }
        serde_json::to_writer(&mut self.writer, &header)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }
}

impl<W: Write + Send> ResultSink for JsonlSink<W> {
    fn emit(&mut self, res: &ProbeResult) -> Result<(), SinkError> {
        let entry = JsonlEntry {
            url: &res.url,
            status: res.status,
            size: res.content_length,
            latency_ms: res.duration.as_secs_f64() * 1000.0,
            error: res.error.as_deref(),
            similarity: if self.show_similarity {
                res.similarity
            } else {
                None
            },
        };
        serde_json::to_writer(&mut self.writer, &entry)?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }

    fn close(&mut self) -> Result<(), SinkError> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Forwards results onto an in-process channel; this is how embedders get the
/// raw result stream out of a run.
pub struct ChannelSink {
    tx: tokio::sync::mpsc::UnboundedSender<ProbeResult>,
}

impl ChannelSink {
    pub fn new(tx: tokio::sync::mpsc::UnboundedSender<ProbeResult>) -> Self {
        Self { tx }
    }
}

impl ResultSink for ChannelSink {
    fn emit(&mut self, res: &ProbeResult) -> Result<(), SinkError> {
        self.tx
            .send(res.clone())
            .map_err(|_| SinkError::ChannelClosed)
    }
}
