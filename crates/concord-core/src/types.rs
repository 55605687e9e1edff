use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::config::CheckSettings;

/// Issue severity level for rules and findings.
///
/// # Examples
///
/// ```
/// use concord_core::Severity;
///
/// let s: Severity = serde_json::from_str("\"error\"").unwrap();
/// assert_eq!(s, Severity::Error);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// A violation that must be fixed.
    Error,
    /// A likely problem worth a look.
    #[default]
    Warning,
    /// Informational observation.
    Info,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Error => write!(f, "error"),
            Severity::Warning => write!(f, "warning"),
            Severity::Info => write!(f, "info"),
        }
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "error" => Ok(Severity::Error),
            "warning" => Ok(Severity::Warning),
            "info" => Ok(Severity::Info),
            other => Err(format!("unknown severity: {other}")),
        }
    }
}

impl Severity {
    /// Case-fold an LLM-supplied severity, falling back to [`Severity::Info`].
    ///
    /// # Examples
    ///
    /// ```
    /// use concord_core::Severity;
    ///
    /// assert_eq!(Severity::from_lossy("ERROR"), Severity::Error);
    /// assert_eq!(Severity::from_lossy("critical"), Severity::Info);
    /// ```
    pub fn from_lossy(s: &str) -> Self {
        s.parse().unwrap_or(Severity::Info)
    }

    /// Returns `true` if `self` is at least as severe as `threshold`.
    ///
    /// Severity order: Error > Warning > Info.
    ///
    /// # Examples
    ///
    /// ```
    /// use concord_core::Severity;
    ///
    /// assert!(Severity::Error.meets_threshold(Severity::Warning));
    /// assert!(!Severity::Info.meets_threshold(Severity::Warning));
    /// ```
    pub fn meets_threshold(self, threshold: Severity) -> bool {
        self.rank() <= threshold.rank()
    }

    fn rank(self) -> u8 {
        match self {
            Severity::Error => 0,
            Severity::Warning => 1,
            Severity::Info => 2,
        }
    }
}

/// A review rule supplied by the rule provider.
///
/// Rules are loaded once per check and never mutated afterwards.
///
/// # Examples
///
/// ```
/// use concord_core::{Rule, Severity};
///
/// let rule = Rule::new("fn-length", "Functions must not exceed 30 lines", Severity::Warning);
/// assert_eq!(rule.line_threshold(), Some(30));
/// assert!(rule.enabled);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    /// Stable identifier, referenced by findings.
    pub id: String,
    /// Grouping used in prompts and reports.
    #[serde(default = "default_category")]
    pub category: String,
    /// Short human-readable name.
    #[serde(default)]
    pub title: String,
    /// What the rule checks, in natural language.
    pub description: String,
    /// Severity assigned to violations.
    #[serde(default)]
    pub severity: Severity,
    /// Disabled rules are never sent to the model.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Example violations or fixes included in the prompt.
    #[serde(default)]
    pub examples: Vec<String>,
    /// Glob patterns restricting which files the rule applies to (empty = all).
    #[serde(default)]
    pub applies_to: Vec<String>,
    /// Explicit line-count threshold; detected from the text when absent.
    #[serde(default)]
    pub max_lines: Option<u32>,
}

fn default_category() -> String {
    "general".into()
}

fn default_enabled() -> bool {
    true
}

impl Rule {
    /// Build an enabled rule in the `general` category.
    pub fn new(id: impl Into<String>, description: impl Into<String>, severity: Severity) -> Self {
        let id = id.into();
        Self {
            title: id.clone(),
            id,
            category: default_category(),
            description: description.into(),
            severity,
            enabled: true,
            examples: Vec::new(),
            applies_to: Vec::new(),
            max_lines: None,
        }
    }

    /// The line-count threshold this rule enforces, if it is a length rule.
    ///
    /// An explicit `max_lines` wins; otherwise phrases like `"max 30 lines"`
    /// or `"more than 50 lines"` are detected in the description or title.
    pub fn line_threshold(&self) -> Option<u32> {
        self.max_lines
            .or_else(|| detect_line_threshold(&self.description))
            .or_else(|| detect_line_threshold(&self.title))
    }

    /// Whether this rule should be checked against `path`.
    ///
    /// Invalid glob patterns never match.
    pub fn applies_to_path(&self, path: &Path) -> bool {
        if !self.enabled {
            return false;
        }
        if self.applies_to.is_empty() {
            return true;
        }
        let options = glob::MatchOptions {
            case_sensitive: true,
            require_literal_separator: false,
            require_literal_leading_dot: false,
        };
        self.applies_to.iter().any(|pattern| {
            glob::Pattern::new(pattern)
                .map(|p| p.matches_path_with(path, options))
                .unwrap_or(false)
        })
    }
}

/// Extract a line-count threshold from free text.
///
/// # Examples
///
/// ```
/// use concord_core::detect_line_threshold;
///
/// assert_eq!(detect_line_threshold("max 30 lines"), Some(30));
/// assert_eq!(detect_line_threshold("Files longer than 400 lines are hard to read"), Some(400));
/// assert_eq!(detect_line_threshold("Avoid unwrap()"), None);
/// ```
pub fn detect_line_threshold(text: &str) -> Option<u32> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(
            r"(?i)\b(?:max(?:imum)?(?:\s+of)?|at\s+most|no\s+more\s+than|more\s+than|exceeds?|exceeding|over|longer\s+than|up\s+to)\s+(\d+)\s+lines?\b",
        )
        .expect("line threshold regex compiles")
    });
    re.captures(text)
        .and_then(|caps| caps.get(1))
        .and_then(|m| m.as_str().parse().ok())
}

/// A bounded, line-numbered slice of one file.
///
/// # Examples
///
/// ```
/// use concord_core::Chunk;
/// use std::path::PathBuf;
///
/// let chunk = Chunk {
///     content: "fn a() {}\nfn b() {}".into(),
///     start_line: 10,
///     end_line: 11,
///     index: 0,
///     file_path: PathBuf::from("src/lib.rs"),
/// };
/// let lines: Vec<_> = chunk.line_map().collect();
/// assert_eq!(lines[1], (11, "fn b() {}"));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Chunk {
    /// The chunk's lines joined with `\n`.
    pub content: String,
    /// First line (1-based, inclusive).
    pub start_line: u32,
    /// Last line (1-based, inclusive).
    pub end_line: u32,
    /// Position of the chunk within the file.
    pub index: usize,
    /// File the chunk was cut from.
    pub file_path: PathBuf,
}

impl Chunk {
    /// Number of lines in the chunk.
    pub fn line_count(&self) -> u32 {
        self.end_line - self.start_line + 1
    }

    /// Iterate `(line_number, text)` pairs for this chunk's content.
    pub fn line_map(&self) -> impl Iterator<Item = (u32, &str)> + '_ {
        self.content
            .split('\n')
            .enumerate()
            .map(|(i, line)| (self.start_line + i as u32, line))
            .take_while(|(n, _)| *n <= self.end_line)
    }
}

/// One reported rule violation.
///
/// # Examples
///
/// ```
/// use concord_core::{Finding, Severity};
///
/// let f = Finding::new("R", Severity::Error, 0, 0, "bad").normalized();
/// assert_eq!((f.line_start, f.line_end), (1, 1));
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Finding {
    /// Rule that was violated.
    pub rule_id: String,
    /// Severity as reported (case-folded).
    pub severity: Severity,
    /// First affected line (1-based).
    pub line_start: u32,
    /// Last affected line (inclusive).
    pub line_end: u32,
    /// Explanation of the problem.
    pub description: String,
    /// How to fix it.
    #[serde(default)]
    pub suggestion: String,
    /// Offending code, when the model quoted it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code_snippet: Option<String>,
}

impl Finding {
    /// Build a finding with an empty suggestion.
    pub fn new(
        rule_id: impl Into<String>,
        severity: Severity,
        line_start: u32,
        line_end: u32,
        description: impl Into<String>,
    ) -> Self {
        Self {
            rule_id: rule_id.into(),
            severity,
            line_start,
            line_end,
            description: description.into(),
            suggestion: String::new(),
            code_snippet: None,
        }
    }

    /// Clamp line numbers so that `1 <= line_start <= line_end`.
    pub fn normalized(mut self) -> Self {
        self.line_start = self.line_start.max(1);
        self.line_end = self.line_end.max(self.line_start);
        self
    }

    /// Number of lines covered, counted arithmetically.
    pub fn span(&self) -> u32 {
        self.line_end.saturating_sub(self.line_start) + 1
    }

    /// Voting key: rule plus exact line range.
    pub fn key(&self) -> (&str, u32, u32) {
        (&self.rule_id, self.line_start, self.line_end)
    }

    /// Returns `true` if `self` carries more detail than `other`.
    ///
    /// A longer description wins; on a tie, the longer suggestion.
    pub fn is_richer_than(&self, other: &Finding) -> bool {
        (self.description.len(), self.suggestion.len())
            > (other.description.len(), other.suggestion.len())
    }
}

/// Terminal status of a file check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// All chunks were processed (individual chunks may have failed).
    Success,
    /// No rules applied to the file.
    Skipped,
    /// An error aborted the file.
    Failed,
    /// The whole-file deadline elapsed.
    Timeout,
}

impl fmt::Display for FileStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FileStatus::Success => write!(f, "success"),
            FileStatus::Skipped => write!(f, "skipped"),
            FileStatus::Failed => write!(f, "failed"),
            FileStatus::Timeout => write!(f, "timeout"),
        }
    }
}

/// The outcome of checking one file.
///
/// # Examples
///
/// ```
/// use concord_core::{FileResult, FileStatus, Finding, Severity};
///
/// let result = FileResult::success(
///     "src/lib.rs",
///     vec![Finding::new("R1", Severity::Error, 3, 4, "boom")],
/// );
/// assert_eq!(result.status, FileStatus::Success);
/// assert_eq!(result.error_count, 1);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileResult {
    /// File that was checked.
    pub file_path: PathBuf,
    /// When the check finished.
    pub check_time: DateTime<Utc>,
    /// Merged findings sorted by line range.
    pub findings: Vec<Finding>,
    /// Number of error-level findings.
    pub error_count: usize,
    /// Number of warning-level findings.
    pub warning_count: usize,
    /// Number of info-level findings.
    pub info_count: usize,
    /// Terminal status.
    pub status: FileStatus,
    /// Failure or timeout explanation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Chunks the file was split into.
    #[serde(default)]
    pub chunk_count: usize,
    /// Chunks for which every attempt failed.
    #[serde(default)]
    pub failed_chunks: usize,
    /// Wall-clock time spent on the file.
    #[serde(default)]
    pub duration_ms: u64,
}

impl FileResult {
    fn empty(file_path: impl Into<PathBuf>, status: FileStatus) -> Self {
        Self {
            file_path: file_path.into(),
            check_time: Utc::now(),
            findings: Vec::new(),
            error_count: 0,
            warning_count: 0,
            info_count: 0,
            status,
            error_message: None,
            chunk_count: 0,
            failed_chunks: 0,
            duration_ms: 0,
        }
    }

    /// A successful result; severity counts are tallied from `findings`.
    pub fn success(file_path: impl Into<PathBuf>, findings: Vec<Finding>) -> Self {
        let mut result = Self::empty(file_path, FileStatus::Success);
        for finding in &findings {
            match finding.severity {
                Severity::Error => result.error_count += 1,
                Severity::Warning => result.warning_count += 1,
                Severity::Info => result.info_count += 1,
            }
        }
        result.findings = findings;
        result
    }

    /// A file with no applicable rules.
    pub fn skipped(file_path: impl Into<PathBuf>) -> Self {
        Self::empty(file_path, FileStatus::Skipped)
    }

    /// A file aborted by an error.
    pub fn failed(file_path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        let mut result = Self::empty(file_path, FileStatus::Failed);
        result.error_message = Some(message.into());
        result
    }

    /// A file that exceeded its wall-clock budget.
    pub fn timed_out(file_path: impl Into<PathBuf>, limit: Duration) -> Self {
        let mut result = Self::empty(file_path, FileStatus::Timeout);
        result.error_message = Some(format!(
            "file check exceeded {:.1}s",
            limit.as_secs_f64()
        ));
        result
    }

    /// Total number of findings.
    pub fn total_findings(&self) -> usize {
        self.findings.len()
    }
}

/// Lifecycle status of a persisted check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    /// Files are being processed (or the process died mid-run).
    Running,
    /// Every file has a result.
    Completed,
    /// The run stopped with files remaining.
    Interrupted,
    /// Checkpointing failed; state may lag behind the work done.
    Failed,
}

impl fmt::Display for CheckStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CheckStatus::Running => write!(f, "running"),
            CheckStatus::Completed => write!(f, "completed"),
            CheckStatus::Interrupted => write!(f, "interrupted"),
            CheckStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Durable progress of one batch check.
///
/// `completed_files` and `remaining_files` always partition `total_files`,
/// and `status` is [`CheckStatus::Completed`] exactly when nothing remains.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckState {
    /// Identifier, also the state file stem.
    pub check_id: String,
    /// When the check was started.
    pub start_time: DateTime<Utc>,
    /// Settings the check was started with; reused on resume.
    pub config: CheckSettings,
    /// Every file in the batch, in submission order.
    pub total_files: Vec<PathBuf>,
    /// Files with a terminal result, in completion order.
    pub completed_files: Vec<PathBuf>,
    /// Files still to check, in submission order.
    pub remaining_files: Vec<PathBuf>,
    /// Lifecycle status.
    pub status: CheckStatus,
    /// Last time the state was written.
    pub updated_at: DateTime<Utc>,
}

impl CheckState {
    /// Fresh state with every file remaining. Duplicate paths are collapsed.
    pub fn new(check_id: impl Into<String>, files: &[PathBuf], config: CheckSettings) -> Self {
        let mut seen: HashSet<&Path> = HashSet::with_capacity(files.len());
        let mut total_files: Vec<PathBuf> = Vec::with_capacity(files.len());
        for file in files {
            if seen.insert(file.as_path()) {
                total_files.push(file.clone());
            }
        }
        let now = Utc::now();
        let status = if total_files.is_empty() {
            CheckStatus::Completed
        } else {
            CheckStatus::Running
        };
        Self {
            check_id: check_id.into(),
            start_time: now,
            config,
            remaining_files: total_files.clone(),
            total_files,
            completed_files: Vec::new(),
            status,
            updated_at: now,
        }
    }

    /// Move `file` from remaining to completed.
    ///
    /// Returns `false` (and changes nothing) if the file was already completed
    /// or is not part of the check.
    pub fn mark_completed(&mut self, file: &Path) -> bool {
        let Some(pos) = self.remaining_files.iter().position(|f| f == file) else {
            return false;
        };
        let file = self.remaining_files.remove(pos);
        self.completed_files.push(file);
        if self.remaining_files.is_empty() {
            self.status = CheckStatus::Completed;
        }
        self.updated_at = Utc::now();
        true
    }

    /// Set a non-terminal status, keeping the completed-iff-empty invariant.
    pub fn set_status(&mut self, status: CheckStatus) {
        self.status = if self.remaining_files.is_empty() {
            CheckStatus::Completed
        } else if status == CheckStatus::Completed {
            CheckStatus::Interrupted
        } else {
            status
        };
        self.updated_at = Utc::now();
    }

    /// Check the partition invariant, returning a description of the first
    /// violation found.
    pub fn verify(&self) -> Result<(), String> {
        let remaining: HashSet<&Path> = self.remaining_files.iter().map(PathBuf::as_path).collect();
        if let Some(file) = self
            .completed_files
            .iter()
            .find(|f| remaining.contains(f.as_path()))
        {
            return Err(format!("{} is both completed and remaining", file.display()));
        }
        let completed: HashSet<&Path> = self.completed_files.iter().map(PathBuf::as_path).collect();
        let covered = self.completed_files.len() + self.remaining_files.len();
        if covered != self.total_files.len()
            || self
                .total_files
                .iter()
                .any(|f| !completed.contains(f.as_path()) && !remaining.contains(f.as_path()))
        {
            return Err("completed and remaining files do not partition total files".into());
        }
        if (self.status == CheckStatus::Completed) != self.remaining_files.is_empty() {
            return Err(format!(
                "status {} inconsistent with {} remaining files",
                self.status,
                self.remaining_files.len()
            ));
        }
        Ok(())
    }
}

/// Output format for CLI subcommands.
///
/// # Examples
///
/// ```
/// use concord_core::OutputFormat;
///
/// let fmt: OutputFormat = "json".parse().unwrap();
/// assert_eq!(fmt, OutputFormat::Json);
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    /// Human-readable summaries.
    #[default]
    Text,
    /// Machine-readable JSON with camelCase keys.
    Json,
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputFormat::Text => write!(f, "text"),
            OutputFormat::Json => write!(f, "json"),
        }
    }
}

impl FromStr for OutputFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "text" => Ok(OutputFormat::Text),
            "json" => Ok(OutputFormat::Json),
            other => Err(format!("unknown output format: {other}")),
        }
    }
}
