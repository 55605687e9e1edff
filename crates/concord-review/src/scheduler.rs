//! Bounded fan-out of file checks.
//!
//! A dispatcher task hands files to at most `max_workers` concurrent worker
//! tasks. Each worker runs one file under the whole-file timeout and sends
//! its [`FileResult`] down a channel, so results arrive in completion order.

use std::any::Any;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use concord_core::{CheckSettings, FileResult, FileStatus};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinError;
use tracing::Instrument;

use crate::orchestrator::FileChecker;

/// Stops a batch from issuing new files. In-flight files run to completion
/// or to their own timeout.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Live counters shared by every worker of a batch.
#[derive(Debug, Default)]
pub struct BatchCounters {
    dispatched: AtomicUsize,
    completed: AtomicUsize,
    success: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    timed_out: AtomicUsize,
}

/// Point-in-time copy of [`BatchCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchSummary {
    pub dispatched: usize,
    pub completed: usize,
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
    pub timed_out: usize,
}

impl BatchCounters {
    fn record(&self, result: &FileResult) {
        let bucket = match result.status {
            FileStatus::Success => &self.success,
            FileStatus::Skipped => &self.skipped,
            FileStatus::Failed => &self.failed,
            FileStatus::Timeout => &self.timed_out,
        };
        bucket.fetch_add(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> BatchSummary {
        BatchSummary {
            dispatched: self.dispatched.load(Ordering::SeqCst),
            completed: self.completed.load(Ordering::SeqCst),
            success: self.success.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            timed_out: self.timed_out.load(Ordering::SeqCst),
        }
    }
}

/// A running batch.
pub struct BatchHandle {
    results: mpsc::Receiver<FileResult>,
    counters: Arc<BatchCounters>,
    stop: StopHandle,
}

impl BatchHandle {
    /// Next finished file, or `None` once every dispatched file reported.
    pub async fn next(&mut self) -> Option<FileResult> {
        self.results.recv().await
    }

    /// Wait for every result.
    pub async fn collect(mut self) -> Vec<FileResult> {
        let mut all = Vec::new();
        while let Some(result) = self.next().await {
            all.push(result);
        }
        all
    }

    /// Stop issuing new files.
    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn counters(&self) -> BatchSummary {
        self.counters.snapshot()
    }
}

/// Runs a [`FileChecker`] over many files with bounded concurrency.
pub struct Scheduler {
    checker: Arc<FileChecker>,
    max_workers: usize,
    file_timeout: Duration,
    stop: StopHandle,
}

impl Scheduler {
    pub fn new(checker: Arc<FileChecker>, max_workers: usize, file_timeout: Duration) -> Self {
        Self {
            checker,
            max_workers: max_workers.max(1),
            file_timeout,
            stop: StopHandle::new(),
        }
    }

    /// Worker count and file timeout from `settings`.
    pub fn from_settings(checker: Arc<FileChecker>, settings: &CheckSettings) -> Self {
        Self::new(
            checker,
            settings.max_workers,
            Duration::from_secs(settings.file_timeout_secs),
        )
    }

    /// Share a stop flag with the caller.
    pub fn with_stop(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    /// Start checking `files`. Must be called within a Tokio runtime.
    pub fn for_each(&self, files: Vec<PathBuf>) -> BatchHandle {
        let (tx, rx) = mpsc::channel(files.len().max(1));
        let counters = Arc::new(BatchCounters::default());
        let semaphore = Arc::new(Semaphore::new(self.max_workers));

        let checker = Arc::clone(&self.checker);
        let stop = self.stop.clone();
        let limit = self.file_timeout;
        let shared = Arc::clone(&counters);
        tokio::spawn(async move {
            for file in files {
                if stop.is_stopped() {
                    break;
                }
                let Ok(permit) = Arc::clone(&semaphore).acquire_owned().await else {
                    break;
                };
                if stop.is_stopped() {
                    break;
                }
                shared.dispatched.fetch_add(1, Ordering::SeqCst);

                let checker = Arc::clone(&checker);
                let counters = Arc::clone(&shared);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let _permit = permit;
                    let result = check_with_deadline(checker, file, limit).await;
                    counters.record(&result);
                    // receiver gone means nobody is listening; the result is dropped
                    let _ = tx.send(result).await;
                });
            }
            if stop.is_stopped() {
                tracing::info!("batch stopped, no further files will be started");
            }
        });

        BatchHandle {
            results: rx,
            counters,
            stop: self.stop.clone(),
        }
    }
}

async fn check_with_deadline(checker: Arc<FileChecker>, file: PathBuf, limit: Duration) -> FileResult {
    let span = tracing::info_span!("check_file", path = %file.display());
    let task_file = file.clone();
    let mut task = tokio::spawn(
        async move { checker.check_file(&task_file).await }.instrument(span.clone()),
    );

    let result = match tokio::time::timeout(limit, &mut task).await {
        Ok(Ok(result)) => result,
        Ok(Err(join)) => FileResult::failed(&file, panic_message(join)),
        Err(_) => {
            task.abort();
            FileResult::timed_out(&file, limit)
        }
    };

    span.in_scope(|| match result.status {
        FileStatus::Success | FileStatus::Skipped => tracing::info!(
            status = %result.status,
            findings = result.total_findings(),
            duration_ms = result.duration_ms,
            "file checked"
        ),
        FileStatus::Failed | FileStatus::Timeout => tracing::warn!(
            status = %result.status,
            error = result.error_message.as_deref().unwrap_or_default(),
            "file check did not complete"
        ),
    });
    result
}

fn panic_message(err: JoinError) -> String {
    if err.is_cancelled() {
        return "file check was cancelled".into();
    }
    let payload: Box<dyn Any + Send> = err.into_panic();
    let detail = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".into());
    format!("file check panicked: {detail}")
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use async_trait::async_trait;
    use concord_core::{ConcordError, Rule, SamplingConfig, Severity};

    use super::*;
    use crate::llm::{ChatMessage, LlmGateway};
    use crate::orchestrator::Collaborators;
    use crate::provider::{RuleProvider, RuleSet};

    /// Sleeps according to the file name in the prompt and tracks how many
    /// calls overlap.
    #[derive(Default)]
    struct Pacing {
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    #[async_trait]
    impl LlmGateway for Pacing {
        async fn chat(
            &self,
            messages: Vec<ChatMessage>,
            _sampling: &SamplingConfig,
        ) -> Result<String, ConcordError> {
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            let prompt = &messages[1].content;
            let delay = if prompt.contains("hang.rs") {
                3_600_000
            } else if prompt.contains("slow.rs") {
                150
            } else {
                20
            };
            tokio::time::sleep(Duration::from_millis(delay)).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(r#"{"issues":[]}"#.into())
        }
    }

    struct PanicsOn(&'static str);

    impl RuleProvider for PanicsOn {
        fn applicable_rules(&self, path: &Path) -> Result<Vec<Rule>, ConcordError> {
            if path.ends_with(self.0) {
                panic!("provider exploded on {}", path.display());
            }
            Ok(vec![Rule::new("R", "x", Severity::Info)])
        }
    }

    fn files(dir: &Path, names: &[&str]) -> Vec<PathBuf> {
        names
            .iter()
            .map(|n| {
                let p = dir.join(n);
                std::fs::write(&p, "fn main() {}\n").unwrap();
                p
            })
            .collect()
    }

    fn scheduler(
        gateway: Arc<dyn LlmGateway>,
        rules: Arc<dyn RuleProvider>,
        workers: usize,
        timeout: Duration,
    ) -> Scheduler {
        let collab = Collaborators::new(gateway, rules);
        let checker = Arc::new(FileChecker::new(&collab, &CheckSettings::default()));
        Scheduler::new(checker, workers, timeout)
    }

    fn default_rules() -> Arc<dyn RuleProvider> {
        Arc::new(RuleSet::new(vec![Rule::new("R", "x", Severity::Info)]).unwrap())
    }

    #[tokio::test]
    async fn results_arrive_in_completion_order() {
        let dir = tempfile::tempdir().unwrap();
        let batch = files(dir.path(), &["slow.rs", "fast.rs"]);
        let s = scheduler(Arc::new(Pacing::default()), default_rules(), 2, Duration::from_secs(10));

        let results = s.for_each(batch).collect().await;
        assert_eq!(results.len(), 2);
        assert!(results[0].file_path.ends_with("fast.rs"));
        assert!(results[1].file_path.ends_with("slow.rs"));
    }

    #[tokio::test]
    async fn worker_pool_is_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let batch = files(dir.path(), &["a.rs", "b.rs", "c.rs", "d.rs", "e.rs", "f.rs"]);
        let gateway = Arc::new(Pacing::default());
        let s = scheduler(gateway.clone(), default_rules(), 2, Duration::from_secs(10));

        let mut handle = s.for_each(batch);
        let mut n = 0;
        while handle.next().await.is_some() {
            n += 1;
        }
        assert_eq!(n, 6);
        assert!(gateway.peak.load(Ordering::SeqCst) <= 2);
        let summary = handle.counters();
        assert_eq!(summary.dispatched, 6);
        assert_eq!(summary.success, 6);
    }

    #[tokio::test]
    async fn timeout_is_isolated_to_its_file() {
        let dir = tempfile::tempdir().unwrap();
        let batch = files(dir.path(), &["a.rs", "hang.rs", "c.rs"]);
        let s = scheduler(Arc::new(Pacing::default()), default_rules(), 3, Duration::from_millis(300));

        let results = s.for_each(batch).collect().await;
        assert_eq!(results.len(), 3);
        for r in &results {
            if r.file_path.ends_with("hang.rs") {
                assert_eq!(r.status, FileStatus::Timeout);
                assert!(r.findings.is_empty());
            } else {
                assert_eq!(r.status, FileStatus::Success);
            }
        }
    }

    #[tokio::test]
    async fn panic_becomes_failed_result_for_that_file_only() {
        let dir = tempfile::tempdir().unwrap();
        let batch = files(dir.path(), &["a.rs", "b.rs", "c.rs"]);
        let s = scheduler(
            Arc::new(Pacing::default()),
            Arc::new(PanicsOn("b.rs")),
            2,
            Duration::from_secs(10),
        );

        let mut handle = s.for_each(batch);
        let mut results = Vec::new();
        while let Some(r) = handle.next().await {
            results.push(r);
        }
        let b = results.iter().find(|r| r.file_path.ends_with("b.rs")).unwrap();
        assert_eq!(b.status, FileStatus::Failed);
        assert!(b.error_message.as_deref().unwrap().contains("provider exploded"));
        assert_eq!(handle.counters().success, 2);
        assert_eq!(handle.counters().failed, 1);
    }

    #[tokio::test]
    async fn stopped_batch_issues_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let batch = files(dir.path(), &["a.rs", "b.rs"]);
        let stop = StopHandle::new();
        stop.stop();
        let s = scheduler(Arc::new(Pacing::default()), default_rules(), 2, Duration::from_secs(10))
            .with_stop(stop);

        let handle = s.for_each(batch);
        assert!(handle.collect().await.is_empty());
    }
}
