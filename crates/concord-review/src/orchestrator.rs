//! Per-file state machine: rules, chunks, attempts, votes, merge.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use concord_chunk::{Chunker, HeuristicTokenizer, Tokenizer};
use concord_core::{CheckSettings, ConcordError, FileResult, Finding};

use crate::attempt::AttemptRunner;
use crate::consensus::aggregate;
use crate::llm::LlmGateway;
use crate::merge::merge_findings;
use crate::progress::{NoProgress, ProgressEvent, ProgressSink};
use crate::provider::RuleProvider;
use crate::validate::line_thresholds;

/// The external pieces a check needs.
#[derive(Clone)]
pub struct Collaborators {
    pub gateway: Arc<dyn LlmGateway>,
    pub rules: Arc<dyn RuleProvider>,
    pub tokenizer: Arc<dyn Tokenizer>,
    pub progress: Arc<dyn ProgressSink>,
}

impl Collaborators {
    /// Heuristic tokenizer and no progress reporting.
    pub fn new(gateway: Arc<dyn LlmGateway>, rules: Arc<dyn RuleProvider>) -> Self {
        Self {
            gateway,
            rules,
            tokenizer: Arc::new(HeuristicTokenizer::default()),
            progress: Arc::new(NoProgress),
        }
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.tokenizer = tokenizer;
        self
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressSink>) -> Self {
        self.progress = progress;
        self
    }
}

/// Where a file check stood when it stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStage {
    Start,
    RulesLoaded,
    Chunked,
    ChunkRunning,
    MergeDone,
}

impl fmt::Display for FileStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            FileStage::Start => "start",
            FileStage::RulesLoaded => "rules_loaded",
            FileStage::Chunked => "chunked",
            FileStage::ChunkRunning => "chunk_running",
            FileStage::MergeDone => "merge_done",
        };
        f.write_str(s)
    }
}

/// Checks one file end to end.
///
/// The whole-file timeout is applied by the scheduler, not here.
pub struct FileChecker {
    rules: Arc<dyn RuleProvider>,
    chunker: Chunker,
    attempts: AttemptRunner,
    progress: Arc<dyn ProgressSink>,
    consensus_ratio: f64,
}

impl FileChecker {
    pub fn new(collaborators: &Collaborators, settings: &CheckSettings) -> Self {
        Self {
            rules: Arc::clone(&collaborators.rules),
            chunker: Chunker::new(
                Arc::clone(&collaborators.tokenizer),
                settings.chunk_token_limit,
                settings.effective_overlap(),
            ),
            attempts: AttemptRunner::new(Arc::clone(&collaborators.gateway), settings)
                .with_progress(Arc::clone(&collaborators.progress)),
            progress: Arc::clone(&collaborators.progress),
            consensus_ratio: settings.consensus_ratio,
        }
    }

    /// Replace the attempt runner, e.g. to shorten its timeout.
    pub fn with_attempts(mut self, attempts: AttemptRunner) -> Self {
        self.attempts = attempts;
        self
    }

    /// Check `path`. Errors become a [`FileStatus::Failed`] result that
    /// names the stage reached.
    ///
    /// [`FileStatus::Failed`]: concord_core::FileStatus::Failed
    pub async fn check_file(&self, path: &Path) -> FileResult {
        let started = Instant::now();
        let mut stage = FileStage::Start;
        let mut result = match self.run(path, &mut stage).await {
            Ok(result) => result,
            Err(e) => {
                tracing::warn!(path = %path.display(), %stage, error = %e, "file check failed");
                FileResult::failed(path, format!("{stage}: {e}"))
            }
        };
        result.duration_ms = started.elapsed().as_millis() as u64;
        result
    }

    async fn run(&self, path: &Path, stage: &mut FileStage) -> Result<FileResult, ConcordError> {
        let file = path.to_path_buf();
        self.progress.on_event(&ProgressEvent::Start { file: file.clone() });

        let rules = self.rules.applicable_rules(path)?;
        *stage = FileStage::RulesLoaded;
        self.progress.on_event(&ProgressEvent::RulesLoaded {
            file: file.clone(),
            rules: rules.len(),
        });
        if rules.is_empty() {
            tracing::debug!(path = %path.display(), "no applicable rules, skipping");
            return Ok(FileResult::skipped(path));
        }

        let content = tokio::fs::read_to_string(path).await?;

        let chunks = self.chunker.chunk(path, &content);
        *stage = FileStage::Chunked;
        self.progress.on_event(&ProgressEvent::Chunked {
            file: file.clone(),
            chunks: chunks.len(),
        });

        *stage = FileStage::ChunkRunning;
        let mut collected: Vec<Finding> = Vec::new();
        let mut failed_chunks = 0;
        for chunk in &chunks {
            self.progress.on_event(&ProgressEvent::ChunkStart {
                file: file.clone(),
                index: chunk.index,
                total: chunks.len(),
                start_line: chunk.start_line,
                end_line: chunk.end_line,
            });

            let attempts = self.attempts.run(chunk, &rules).await;
            let failed = attempts.iter().all(|a| !a.is_completed());
            let findings = if failed {
                failed_chunks += 1;
                tracing::warn!(
                    path = %path.display(),
                    chunk = chunk.index,
                    lines = %format!("{}-{}", chunk.start_line, chunk.end_line),
                    "every attempt failed for chunk"
                );
                Vec::new()
            } else {
                let per_attempt: Vec<Vec<Finding>> =
                    attempts.into_iter().map(|a| a.findings).collect();
                aggregate(&per_attempt, self.consensus_ratio)
            };

            self.progress.on_event(&ProgressEvent::ChunkDone {
                file: file.clone(),
                index: chunk.index,
                findings: findings.len(),
                failed,
            });
            collected.extend(findings);
        }
        if failed_chunks > 0 {
            tracing::warn!(
                path = %path.display(),
                failed_chunks,
                total = chunks.len(),
                "some chunks produced no usable attempt"
            );
        }

        let merged = merge_findings(collected, &line_thresholds(&rules));
        *stage = FileStage::MergeDone;
        self.progress.on_event(&ProgressEvent::MergeDone {
            file,
            findings: merged.len(),
        });

        let mut result = FileResult::success(path, merged);
        result.chunk_count = chunks.len();
        result.failed_chunks = failed_chunks;
        Ok(result)
    }
}
