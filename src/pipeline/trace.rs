//! JSONL record of every completion call a run makes.
//!
//! Rows are handed to a dedicated writer thread so the async pipeline never
//! blocks on file I/O. The file is complete once [`TraceWorker::join`] returns.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::mpsc;
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::Stage;
use crate::gateway::CompletionResponse;
use crate::topology::Mode;

/// One call, answered or not. Counters stay zero unless it was answered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageTrace {
    pub timestamp_ms: i64,
    pub run_id: Uuid,
    pub mode: Mode,
    pub stage: Stage,
    pub agent: usize,
    pub model: String,
    pub latency_ms: u64,
    pub parts: usize,
    pub citations: usize,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub cost_nanodollars: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StageTrace {
    pub fn new(
        run_id: Uuid,
        mode: Mode,
        stage: Stage,
        agent: usize,
        model: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            timestamp_ms: Utc::now().timestamp_millis(),
            run_id,
            mode,
            stage,
            agent,
            model: model.into(),
            latency_ms: latency.as_millis() as u64,
            parts: 0,
            citations: 0,
            input_tokens: 0,
            output_tokens: 0,
            cost_nanodollars: 0,
            error: None,
        }
    }

    pub fn answered(mut self, resp: &CompletionResponse) -> Self {
        self.parts = resp.parts.len();
        self.citations = resp.citations.len();
        self.input_tokens = resp.input_tokens;
        self.output_tokens = resp.output_tokens;
        self.cost_nanodollars = resp.cost_nanodollars;
        self
    }

    pub fn failed(mut self, reason: impl Into<String>) -> Self {
        self.error = Some(reason.into());
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TraceError {
    #[error("trace file error: {0}")]
    Io(#[from] std::io::Error),
    #[error("trace row encoding failed: {0}")]
    Encode(#[from] serde_json::Error),
    /// The writer thread is gone, usually after an earlier write error.
    #[error("trace writer has stopped")]
    Closed,
    #[error("trace writer panicked")]
    WriterPanicked,
}

/// Receives trace rows from the orchestrator.
pub trait TraceSink: Send + Sync {
    fn record(&self, row: StageTrace) -> Result<(), TraceError>;
}

/// Appends rows to a JSONL file. Clones share one writer thread.
#[derive(Debug, Clone)]
pub struct JsonlTraceSink {
    rows: mpsc::Sender<StageTrace>,
}

/// Handle to the writer thread. It exits once every sink clone is dropped.
#[derive(Debug)]
pub struct TraceWorker(JoinHandle<Result<(), TraceError>>);

impl JsonlTraceSink {
    /// Create (or truncate) `path` and start the writer.
    pub fn create(path: impl AsRef<Path>) -> Result<(Self, TraceWorker), TraceError> {
        let file = File::create(path)?;
        let (rows, pending) = mpsc::channel();
        let handle = std::thread::spawn(move || append_rows(file, pending));
        Ok((Self { rows }, TraceWorker(handle)))
    }
}

impl TraceSink for JsonlTraceSink {
    fn record(&self, row: StageTrace) -> Result<(), TraceError> {
        self.rows.send(row).map_err(|_| TraceError::Closed)
    }
}

impl TraceWorker {
    /// Wait until every queued row is on disk.
    pub fn join(self) -> Result<(), TraceError> {
        self.0.join().map_err(|_| TraceError::WriterPanicked)?
    }
}

fn append_rows(file: File, pending: mpsc::Receiver<StageTrace>) -> Result<(), TraceError> {
    let mut out = BufWriter::new(file);
    for row in pending {
        serde_json::to_writer(&mut out, &row)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{Citation, Part};

    #[test]
    fn test_answered_row_copies_counters() {
        let mut resp = CompletionResponse::from_parts(vec![Part::text("a"), Part::text("b")]);
        resp.citations.push(Citation {
            uri: "https://a.example".into(),
            title: "A".into(),
        });
        resp.input_tokens = 12;
        resp.output_tokens = 4;
        resp.cost_nanodollars = 90;

        let row = StageTrace::new(
            Uuid::nil(),
            Mode::Pro,
            Stage::Refine,
            3,
            "gemini-2.5-pro",
            Duration::from_millis(25),
        )
        .answered(&resp);
        assert_eq!((row.parts, row.citations), (2, 1));
        assert_eq!((row.input_tokens, row.output_tokens, row.cost_nanodollars), (12, 4, 90));
        assert_eq!(row.latency_ms, 25);
        assert!(row.error.is_none());
    }

    #[test]
    fn test_failed_row_serializes_error_and_snake_case_enums() {
        let row = StageTrace::new(
            Uuid::nil(),
            Mode::ImageGen,
            Stage::Single,
            1,
            "m",
            Duration::ZERO,
        )
        .failed("cancelled");
        let value = serde_json::to_value(&row).unwrap();
        assert_eq!(value["mode"], "image_gen");
        assert_eq!(value["stage"], "single");
        assert_eq!(value["error"], "cancelled");
        assert_eq!(value["parts"], 0);
    }
}
