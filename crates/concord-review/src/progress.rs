use std::path::PathBuf;
use std::time::Duration;

/// A step in checking one file, reported to a [`ProgressSink`].
#[derive(Debug, Clone, PartialEq)]
pub enum ProgressEvent {
    /// A worker picked up the file.
    Start { file: PathBuf },
    /// Applicable rules were resolved.
    RulesLoaded { file: PathBuf, rules: usize },
    /// The file was split into chunks.
    Chunked { file: PathBuf, chunks: usize },
    /// Attempts on a chunk are about to run.
    ChunkStart {
        file: PathBuf,
        index: usize,
        total: usize,
        start_line: u32,
        end_line: u32,
    },
    /// A chunk finished; `failed` is set when every attempt failed.
    ChunkDone {
        file: PathBuf,
        index: usize,
        findings: usize,
        failed: bool,
    },
    /// One LLM call is starting.
    LlmCallStart {
        file: PathBuf,
        chunk: usize,
        attempt: usize,
        attempts: usize,
    },
    /// One LLM call ended.
    LlmCallEnd {
        file: PathBuf,
        chunk: usize,
        attempt: usize,
        duration: Duration,
        issues: usize,
        ok: bool,
    },
    /// Chunk findings were merged into the file's final list.
    MergeDone { file: PathBuf, findings: usize },
}

impl ProgressEvent {
    /// Stable step name.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::path::PathBuf;
    /// use concord_review::progress::ProgressEvent;
    ///
    /// let e = ProgressEvent::Start { file: PathBuf::from("a.rs") };
    /// assert_eq!(e.step(), "start");
    /// ```
    pub fn step(&self) -> &'static str {
        match self {
            ProgressEvent::Start { .. } => "start",
            ProgressEvent::RulesLoaded { .. } => "rules_loaded",
            ProgressEvent::Chunked { .. } => "chunked",
            ProgressEvent::ChunkStart { .. } => "chunk_start",
            ProgressEvent::ChunkDone { .. } => "chunk_done",
            ProgressEvent::LlmCallStart { .. } => "llm_call_start",
            ProgressEvent::LlmCallEnd { .. } => "llm_call_end",
            ProgressEvent::MergeDone { .. } => "merge_done",
        }
    }

    /// File the event belongs to.
    pub fn file(&self) -> &PathBuf {
        match self {
            ProgressEvent::Start { file }
            | ProgressEvent::RulesLoaded { file, .. }
            | ProgressEvent::Chunked { file, .. }
            | ProgressEvent::ChunkStart { file, .. }
            | ProgressEvent::ChunkDone { file, .. }
            | ProgressEvent::LlmCallStart { file, .. }
            | ProgressEvent::LlmCallEnd { file, .. }
            | ProgressEvent::MergeDone { file, .. } => file,
        }
    }
}

/// Receives progress events. Called concurrently from every worker and must
/// not panic.
pub trait ProgressSink: Send + Sync {
    fn on_event(&self, event: &ProgressEvent);
}

/// Discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressSink for NoProgress {
    fn on_event(&self, _event: &ProgressEvent) {}
}

/// Forwards events to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogProgress;

impl ProgressSink for LogProgress {
    fn on_event(&self, event: &ProgressEvent) {
        tracing::debug!(step = event.step(), file = %event.file().display(), ?event, "progress");
    }
}

impl<F> ProgressSink for F
where
    F: Fn(&ProgressEvent) + Send + Sync,
{
    fn on_event(&self, event: &ProgressEvent) {
        self(event)
    }
}
