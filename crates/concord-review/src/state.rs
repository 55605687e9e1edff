//! Durable check progress.
//!
//! Each check is one JSON document, `{check_id}.json`, in the progress
//! directory. Every read-modify-write holds an advisory `{check_id}.lock`
//! file, and every write goes to a temporary file in the same directory
//! that is synced and then renamed over the document, so a crash leaves
//! either the old or the new state on disk.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::Utc;
use concord_core::{CheckSettings, CheckState, CheckStatus, ConcordError};
use sha2::{Digest, Sha256};

const LOCK_RETRY: Duration = Duration::from_millis(25);
const STALE_LOCK: Duration = Duration::from_secs(60);

/// Reads and writes [`CheckState`] documents.
///
/// # Examples
///
/// ```
/// use std::path::PathBuf;
/// use concord_core::CheckSettings;
/// use concord_review::state::ProgressStore;
///
/// let dir = tempfile::tempdir().unwrap();
/// let store = ProgressStore::new(dir.path());
/// let files = vec![PathBuf::from("a.rs"), PathBuf::from("b.rs")];
/// let id = store.start(&files, &CheckSettings::default()).unwrap();
///
/// store.complete(&id, &files[0]).unwrap();
/// let state = store.load(&id).unwrap().unwrap();
/// assert_eq!(state.remaining_files, vec![PathBuf::from("b.rs")]);
/// ```
#[derive(Debug, Clone)]
pub struct ProgressStore {
    dir: PathBuf,
    lock_timeout: Duration,
}

impl ProgressStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            lock_timeout: Duration::from_secs(10),
        }
    }

    /// How long to wait for another writer's lock before giving up.
    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the document for `check_id`.
    ///
    /// # Errors
    ///
    /// Returns [`ConcordError::State`] if the id contains anything other
    /// than ASCII letters, digits, `-` and `_`.
    pub fn state_path(&self, check_id: &str) -> Result<PathBuf, ConcordError> {
        validate_id(check_id)?;
        Ok(self.dir.join(format!("{check_id}.json")))
    }

    /// Persist a new check with every file remaining and return its id.
    ///
    /// # Errors
    ///
    /// Returns an error if the progress directory or document cannot be
    /// written.
    pub fn start(&self, files: &[PathBuf], settings: &CheckSettings) -> Result<String, ConcordError> {
        fs::create_dir_all(&self.dir)?;
        let base = generate_check_id(files);
        let mut check_id = base.clone();
        let mut n = 1;
        loop {
            let _lock = StateLock::acquire(&self.lock_path(&check_id), self.lock_timeout)?;
            let path = self.state_path(&check_id)?;
            if !path.exists() {
                let state = CheckState::new(check_id.clone(), files, settings.clone());
                write_atomic(&self.dir, &path, &state)?;
                tracing::debug!(check_id = %check_id, files = state.total_files.len(), "check started");
                return Ok(check_id);
            }
            n += 1;
            check_id = format!("{base}-{n}");
        }
    }

    /// Load a check, or `None` if no document exists.
    ///
    /// # Errors
    ///
    /// Returns [`ConcordError::State`] if the document is unreadable,
    /// corrupt or violates the completed/remaining partition.
    pub fn load(&self, check_id: &str) -> Result<Option<CheckState>, ConcordError> {
        let path = self.state_path(check_id)?;
        read_state(&path)
    }

    /// Mark `file` completed. Returns `false` if it already was.
    ///
    /// # Errors
    ///
    /// Fails if the check does not exist or the checkpoint cannot be written.
    pub fn complete(&self, check_id: &str, file: &Path) -> Result<bool, ConcordError> {
        self.update(check_id, |state| state.mark_completed(file))
            .map(|(changed, _)| changed)
    }

    /// Record a lifecycle status. [`CheckStatus::Completed`] is only kept
    /// when nothing remains; otherwise the check becomes
    /// [`CheckStatus::Interrupted`].
    ///
    /// # Errors
    ///
    /// Fails if the check does not exist or cannot be written.
    pub fn set_status(&self, check_id: &str, status: CheckStatus) -> Result<CheckState, ConcordError> {
        self.update(check_id, |state| state.set_status(status))
            .map(|(_, state)| state)
    }

    /// Files of `check_id` that still need a result, in submission order.
    ///
    /// # Errors
    ///
    /// Returns [`ConcordError::State`] if the check does not exist or is
    /// corrupt.
    pub fn pending_files(&self, check_id: &str) -> Result<Vec<PathBuf>, ConcordError> {
        match self.load(check_id)? {
            Some(state) => Ok(state.remaining_files),
            None => Err(unknown_check(check_id)),
        }
    }

    /// Every readable check, newest first. Unreadable documents are skipped
    /// with a warning.
    ///
    /// # Errors
    ///
    /// Returns an error only if the directory itself cannot be listed.
    pub fn list(&self) -> Result<Vec<CheckState>, ConcordError> {
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut states = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            match read_state(&path) {
                Ok(Some(state)) => states.push(state),
                Ok(None) => {}
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "skipping unreadable check"),
            }
        }
        states.sort_by(|a, b| b.start_time.cmp(&a.start_time).then_with(|| b.check_id.cmp(&a.check_id)));
        Ok(states)
    }

    fn lock_path(&self, check_id: &str) -> PathBuf {
        self.dir.join(format!("{check_id}.lock"))
    }

    /// Lock, read, apply `mutate`, verify and write back.
    fn update<T>(
        &self,
        check_id: &str,
        mutate: impl FnOnce(&mut CheckState) -> T,
    ) -> Result<(T, CheckState), ConcordError> {
        let path = self.state_path(check_id)?;
        let _lock = StateLock::acquire(&self.lock_path(check_id), self.lock_timeout)?;
        let mut state = read_state(&path)?.ok_or_else(|| unknown_check(check_id))?;
        let out = mutate(&mut state);
        state.updated_at = Utc::now();
        state.verify().map_err(ConcordError::State)?;
        write_atomic(&self.dir, &path, &state)?;
        Ok((out, state))
    }
}

/// `YYYYMMDD-HHMMSS-` plus the first 8 hex digits of the SHA-256 of the
/// file list.
pub fn generate_check_id(files: &[PathBuf]) -> String {
    let mut hasher = Sha256::new();
    for file in files {
        hasher.update(file.to_string_lossy().as_bytes());
        hasher.update(b"\n");
    }
    let digest = format!("{:x}", hasher.finalize());
    format!("{}-{}", Utc::now().format("%Y%m%d-%H%M%S"), &digest[..8])
}

fn validate_id(check_id: &str) -> Result<(), ConcordError> {
    let ok = !check_id.is_empty()
        && check_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(ConcordError::State(format!("invalid check id: {check_id:?}")))
    }
}

fn unknown_check(check_id: &str) -> ConcordError {
    ConcordError::State(format!("no such check: {check_id}"))
}

fn read_state(path: &Path) -> Result<Option<CheckState>, ConcordError> {
    let content = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => {
            return Err(ConcordError::State(format!(
                "failed to read check state {}: {e}",
                path.display()
            )))
        }
    };
    let state: CheckState = serde_json::from_str(&content).map_err(|e| {
        ConcordError::State(format!("corrupt check state {}: {e}", path.display()))
    })?;
    state.verify().map_err(|reason| {
        ConcordError::State(format!("inconsistent check state {}: {reason}", path.display()))
    })?;
    Ok(Some(state))
}

fn write_atomic(dir: &Path, path: &Path, state: &CheckState) -> Result<(), ConcordError> {
    let json = serde_json::to_string_pretty(state)?;
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    tmp.write_all(json.as_bytes())?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| ConcordError::Io(e.error))?;
    Ok(())
}

/// Advisory lock held by existence of a file. Removed on drop.
struct StateLock {
    path: PathBuf,
}

impl StateLock {
    fn acquire(path: &Path, timeout: Duration) -> Result<Self, ConcordError> {
        let started = Instant::now();
        loop {
            match OpenOptions::new().write(true).create_new(true).open(path) {
                Ok(mut file) => {
                    let _ = writeln!(file, "{}", std::process::id());
                    return Ok(Self {
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if is_stale(path) {
                        tracing::warn!(path = %path.display(), "removing stale state lock");
                        break_stale_lock(path)?;
                        continue;
                    }
                    if started.elapsed() >= timeout {
                        return Err(ConcordError::Lock {
                            path: path.to_path_buf(),
                            reason: format!("still held after {:.1}s", timeout.as_secs_f64()),
                        });
                    }
                    thread::sleep(LOCK_RETRY);
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

impl Drop for StateLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

/// Move a stale lock aside before deleting it, so a lock another process
/// created after the staleness check is never removed by path. If the
/// moved file turns out to be fresh it is linked back into place.
fn break_stale_lock(path: &Path) -> Result<(), ConcordError> {
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or_default();
    let aside = path.with_extension(format!("lock.stale-{}-{nanos}", std::process::id()));
    match fs::rename(path, &aside) {
        Ok(()) => {}
        // someone else broke it first
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e.into()),
    }
    if !is_stale(&aside) {
        tracing::debug!(path = %path.display(), "lock was renewed, restoring it");
        let _ = fs::hard_link(&aside, path);
    }
    fs::remove_file(&aside)?;
    Ok(())
}

fn is_stale(path: &Path) -> bool {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| SystemTime::now().duration_since(t).ok())
        .is_some_and(|age| age > STALE_LOCK)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn paths(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn check_id_format() {
        let id = generate_check_id(&paths(&["a", "b"]));
        let parts: Vec<_> = id.split('-').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0].len(), 8);
        assert_eq!(parts[1].len(), 6);
        assert_eq!(parts[2].len(), 8);
        assert!(parts[2].chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn crash_after_two_completions_leaves_c_and_d() {
        let dir = tempfile::tempdir().unwrap();
        let files = paths(&["a", "b", "c", "d"]);
        let id = {
            let store = ProgressStore::new(dir.path());
            let id = store.start(&files, &CheckSettings::default()).unwrap();
            store.complete(&id, Path::new("a")).unwrap();
            store.complete(&id, Path::new("b")).unwrap();
            id
        };

        let reopened = ProgressStore::new(dir.path());
        let state = reopened.load(&id).unwrap().unwrap();
        assert_eq!(state.remaining_files, paths(&["c", "d"]));
        assert_eq!(state.completed_files, paths(&["a", "b"]));
        assert_eq!(state.status, CheckStatus::Running);
        assert_eq!(reopened.pending_files(&id).unwrap(), paths(&["c", "d"]));
    }

    #[test]
    fn complete_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        let id = store.start(&paths(&["a", "b"]), &CheckSettings::default()).unwrap();
        assert!(store.complete(&id, Path::new("a")).unwrap());
        assert!(!store.complete(&id, Path::new("a")).unwrap());
        let state = store.load(&id).unwrap().unwrap();
        assert_eq!(state.completed_files, paths(&["a"]));
    }

    #[test]
    fn completing_everything_marks_completed() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        let id = store.start(&paths(&["a"]), &CheckSettings::default()).unwrap();
        store.complete(&id, Path::new("a")).unwrap();
        assert_eq!(store.load(&id).unwrap().unwrap().status, CheckStatus::Completed);
    }

    #[test]
    fn set_status_keeps_invariant() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        let id = store.start(&paths(&["a", "b"]), &CheckSettings::default()).unwrap();
        let state = store.set_status(&id, CheckStatus::Completed).unwrap();
        assert_eq!(state.status, CheckStatus::Interrupted);
    }

    #[test]
    fn settings_round_trip_with_the_check() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        let settings = CheckSettings {
            repeat: 3,
            consensus_ratio: 0.67,
            ..CheckSettings::default()
        };
        let id = store.start(&paths(&["a"]), &settings).unwrap();
        assert_eq!(store.load(&id).unwrap().unwrap().config, settings);
    }

    #[test]
    fn same_second_same_files_get_distinct_ids() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        let files = paths(&["a"]);
        let first = store.start(&files, &CheckSettings::default()).unwrap();
        let second = store.start(&files, &CheckSettings::default()).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn missing_check_loads_as_none_but_cannot_be_updated() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        assert!(store.load("20240101-000000-deadbeef").unwrap().is_none());
        assert!(store.complete("20240101-000000-deadbeef", Path::new("a")).is_err());
        assert!(store.pending_files("20240101-000000-deadbeef").is_err());
    }

    #[test]
    fn corrupt_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        fs::write(dir.path().join("broken.json"), "{ not json").unwrap();
        let err = store.load("broken").unwrap_err();
        assert!(matches!(err, ConcordError::State(ref m) if m.contains("corrupt")));
    }

    #[test]
    fn inconsistent_state_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        let id = store.start(&paths(&["a", "b"]), &CheckSettings::default()).unwrap();
        let path = store.state_path(&id).unwrap();
        let mut state: CheckState =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        state.completed_files.push(PathBuf::from("a"));
        fs::write(&path, serde_json::to_string(&state).unwrap()).unwrap();
        assert!(store.load(&id).is_err());
    }

    #[test]
    fn path_traversal_ids_are_rejected() {
        let store = ProgressStore::new("/tmp");
        assert!(store.state_path("../etc/passwd").is_err());
        assert!(store.state_path("").is_err());
        assert!(store.state_path("20240101-000000-abcd1234").is_ok());
    }

    #[test]
    fn held_lock_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path()).with_lock_timeout(Duration::from_millis(100));
        let id = store.start(&paths(&["a"]), &CheckSettings::default()).unwrap();
        fs::write(dir.path().join(format!("{id}.lock")), "999999").unwrap();
        let err = store.complete(&id, Path::new("a")).unwrap_err();
        assert!(matches!(err, ConcordError::Lock { .. }));
    }

    #[test]
    fn stale_lock_is_recovered() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path()).with_lock_timeout(Duration::from_millis(100));
        let id = store.start(&paths(&["a"]), &CheckSettings::default()).unwrap();
        let lock = fs::File::create(dir.path().join(format!("{id}.lock"))).unwrap();
        lock.set_modified(SystemTime::now() - Duration::from_secs(3600)).unwrap();
        drop(lock);
        assert!(store.complete(&id, Path::new("a")).unwrap());
        assert!(!dir.path().join(format!("{id}.lock")).exists());
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| n.contains("stale"))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");
    }

    #[test]
    fn breaking_a_renewed_lock_puts_it_back() {
        let dir = tempfile::tempdir().unwrap();
        let lock = dir.path().join("c1.lock");
        fs::write(&lock, "4242\n").unwrap();

        // lock judged stale, then re-created by its owner before we move it
        break_stale_lock(&lock).unwrap();

        assert_eq!(fs::read_to_string(&lock).unwrap(), "4242\n");
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn breaking_a_vanished_lock_is_fine() {
        let dir = tempfile::tempdir().unwrap();
        break_stale_lock(&dir.path().join("gone.lock")).unwrap();
    }

    #[test]
    fn concurrent_completions_are_all_persisted() {
        let dir = tempfile::tempdir().unwrap();
        let names: Vec<String> = (0..8).map(|i| format!("f{i}")).collect();
        let files: Vec<PathBuf> = names.iter().map(PathBuf::from).collect();
        let store = Arc::new(ProgressStore::new(dir.path()));
        let id = store.start(&files, &CheckSettings::default()).unwrap();

        let handles: Vec<_> = files
            .iter()
            .cloned()
            .map(|file| {
                let store = Arc::clone(&store);
                let id = id.clone();
                thread::spawn(move || store.complete(&id, &file).unwrap())
            })
            .collect();
        for h in handles {
            assert!(h.join().unwrap());
        }

        let state = store.load(&id).unwrap().unwrap();
        assert_eq!(state.completed_files.len(), 8);
        assert_eq!(state.status, CheckStatus::Completed);
    }

    #[test]
    fn list_skips_garbage_and_sorts_newest_first() {
        let dir = tempfile::tempdir().unwrap();
        let store = ProgressStore::new(dir.path());
        let first = store.start(&paths(&["a"]), &CheckSettings::default()).unwrap();
        let second = store.start(&paths(&["b"]), &CheckSettings::default()).unwrap();
        fs::write(dir.path().join("junk.json"), "[]").unwrap();
        fs::write(dir.path().join("notes.txt"), "hi").unwrap();

        let listed: Vec<_> = store.list().unwrap().into_iter().map(|s| s.check_id).collect();
        assert_eq!(listed.len(), 2);
        assert!(listed.contains(&first) && listed.contains(&second));
    }

    #[test]
    fn list_of_missing_dir_is_empty() {
        let store = ProgressStore::new("/definitely/not/a/progress/dir");
        assert!(store.list().unwrap().is_empty());
    }
}
