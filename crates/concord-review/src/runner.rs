use std::path::PathBuf;
use std::sync::Arc;

use concord_core::{
    CheckSettings, CheckStatus, ConcordError, FileResult, FileStatus, Severity,
};

use crate::orchestrator::{Collaborators, FileChecker};
use crate::scheduler::{Scheduler, StopHandle};
use crate::state::ProgressStore;

/// Everything a finished (or interrupted) run produced.
#[derive(Debug, Clone)]
pub struct CheckOutcome {
    pub check_id: String,
    /// Results of this run, in completion order. A resumed run only holds
    /// the files it checked.
    pub results: Vec<FileResult>,
    /// Persisted status after the run.
    pub status: CheckStatus,
}

impl CheckOutcome {
    /// Results with the given status.
    pub fn count(&self, status: FileStatus) -> usize {
        self.results.iter().filter(|r| r.status == status).count()
    }

    pub fn total_findings(&self) -> usize {
        self.results.iter().map(FileResult::total_findings).sum()
    }

    /// Whether any finding is at least as severe as `threshold`.
    pub fn has_findings_at(&self, threshold: Severity) -> bool {
        self.results
            .iter()
            .flat_map(|r| &r.findings)
            .any(|f| f.severity.meets_threshold(threshold))
    }
}

/// Drives a check from the progress store: runs the remaining files and
/// checkpoints each result as it arrives.
///
/// Store I/O runs on the blocking pool so lock waits never stall workers.
pub struct CheckRunner {
    collaborators: Collaborators,
    store: ProgressStore,
    stop: StopHandle,
}

impl CheckRunner {
    pub fn new(collaborators: Collaborators, store: ProgressStore) -> Self {
        Self {
            collaborators,
            store,
            stop: StopHandle::new(),
        }
    }

    /// Stop flag shared with the scheduler; see [`StopHandle`].
    pub fn with_stop(mut self, stop: StopHandle) -> Self {
        self.stop = stop;
        self
    }

    pub fn store(&self) -> &ProgressStore {
        &self.store
    }

    /// Persist a new check for `files` and return its id.
    ///
    /// # Errors
    ///
    /// Returns [`ConcordError::Config`] for invalid settings, or a store
    /// error if the check cannot be written.
    pub async fn start(&self, files: Vec<PathBuf>, settings: CheckSettings) -> Result<String, ConcordError> {
        settings.validate()?;
        let store = self.store.clone();
        blocking(move || store.start(&files, &settings)).await
    }

    /// Start a check and run it to the end.
    ///
    /// # Errors
    ///
    /// See [`CheckRunner::start`] and [`CheckRunner::execute`].
    pub async fn run(
        &self,
        files: Vec<PathBuf>,
        settings: CheckSettings,
        on_result: impl FnMut(&FileResult),
    ) -> Result<CheckOutcome, ConcordError> {
        let check_id = self.start(files, settings).await?;
        self.execute(&check_id, on_result).await
    }

    /// Continue a stored check. Completed files are never checked again.
    ///
    /// # Errors
    ///
    /// See [`CheckRunner::execute`].
    pub async fn resume(
        &self,
        check_id: &str,
        on_result: impl FnMut(&FileResult),
    ) -> Result<CheckOutcome, ConcordError> {
        self.execute(check_id, on_result).await
    }

    /// Check every remaining file of `check_id` with the settings it was
    /// started with, calling `on_result` for each result before it is
    /// checkpointed.
    ///
    /// # Errors
    ///
    /// Returns [`ConcordError::State`] if the check is missing or corrupt.
    /// A failed checkpoint stops the batch, marks the check failed and is
    /// returned as is.
    pub async fn execute(
        &self,
        check_id: &str,
        mut on_result: impl FnMut(&FileResult),
    ) -> Result<CheckOutcome, ConcordError> {
        let state = {
            let store = self.store.clone();
            let id = check_id.to_string();
            blocking(move || store.load(&id)).await?
        }
        .ok_or_else(|| ConcordError::State(format!("no such check: {check_id}")))?;

        if state.remaining_files.is_empty() {
            tracing::info!(check_id, "nothing left to check");
            return Ok(CheckOutcome {
                check_id: check_id.to_string(),
                results: Vec::new(),
                status: state.status,
            });
        }
        state.config.validate()?;
        self.persist_status(check_id, CheckStatus::Running).await?;

        tracing::info!(
            check_id,
            remaining = state.remaining_files.len(),
            total = state.total_files.len(),
            "running check"
        );
        let checker = Arc::new(FileChecker::new(&self.collaborators, &state.config));
        let scheduler = Scheduler::from_settings(checker, &state.config).with_stop(self.stop.clone());
        let mut batch = scheduler.for_each(state.remaining_files.clone());

        let mut results = Vec::with_capacity(state.remaining_files.len());
        while let Some(result) = batch.next().await {
            on_result(&result);
            let store = self.store.clone();
            let id = check_id.to_string();
            let file = result.file_path.clone();
            if let Err(e) = blocking(move || store.complete(&id, &file)).await {
                batch.stop();
                tracing::error!(check_id, error = %e, "checkpoint failed, stopping check");
                if let Err(mark) = self.persist_status(check_id, CheckStatus::Failed).await {
                    tracing::error!(check_id, error = %mark, "could not mark check as failed");
                }
                return Err(e);
            }
            results.push(result);
        }

        let summary = batch.counters();
        // Completed is kept only when nothing remains
        let final_state = {
            let store = self.store.clone();
            let id = check_id.to_string();
            blocking(move || store.set_status(&id, CheckStatus::Interrupted)).await?
        };
        tracing::info!(
            check_id,
            status = %final_state.status,
            success = summary.success,
            skipped = summary.skipped,
            failed = summary.failed,
            timed_out = summary.timed_out,
            "check finished"
        );

        Ok(CheckOutcome {
            check_id: check_id.to_string(),
            results,
            status: final_state.status,
        })
    }

    async fn persist_status(&self, check_id: &str, status: CheckStatus) -> Result<(), ConcordError> {
        let store = self.store.clone();
        let id = check_id.to_string();
        blocking(move || store.set_status(&id, status)).await.map(|_| ())
    }
}

async fn blocking<T, F>(f: F) -> Result<T, ConcordError>
where
    F: FnOnce() -> Result<T, ConcordError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ConcordError::State(format!("progress store task failed: {e}")))?
}
