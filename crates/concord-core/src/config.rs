use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ConcordError;
use crate::types::Rule;

/// Top-level configuration loaded from `.concord.toml`.
///
/// Supports layered resolution: CLI flags > env vars > local config > defaults.
///
/// # Examples
///
/// ```
/// use concord_core::ConcordConfig;
///
/// let config = ConcordConfig::default();
/// assert_eq!(config.check.max_workers, 5);
/// assert_eq!(config.check.chunk_token_limit, 20_000);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConcordConfig {
    /// LLM provider settings.
    #[serde(default)]
    pub llm: LlmConfig,
    /// Chunking, voting and scheduling settings.
    #[serde(default)]
    pub check: CheckSettings,
    /// Where check state is persisted.
    #[serde(default)]
    pub progress: ProgressConfig,
    /// Markdown rule file, relative to the config file's directory.
    #[serde(default)]
    pub rules_file: Option<PathBuf>,
    /// Inline rule definitions.
    #[serde(default)]
    pub rules: Vec<Rule>,
}

impl ConcordConfig {
    /// Load configuration from a TOML file at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`ConcordError::Io`] if the file cannot be read, or
    /// [`ConcordError::Toml`] if the content is not valid TOML.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use concord_core::ConcordConfig;
    /// use std::path::Path;
    ///
    /// let config = ConcordConfig::from_file(Path::new(".concord.toml")).unwrap();
    /// ```
    pub fn from_file(path: &Path) -> Result<Self, ConcordError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConcordError::Toml`] if parsing fails.
    ///
    /// # Examples
    ///
    /// ```
    /// use concord_core::ConcordConfig;
    ///
    /// let toml = r#"
    /// [check]
    /// repeat = 3
    /// consensus_ratio = 0.67
    /// "#;
    /// let config = ConcordConfig::from_toml(toml).unwrap();
    /// assert_eq!(config.check.repeat, 3);
    /// ```
    pub fn from_toml(content: &str) -> Result<Self, ConcordError> {
        let config: Self = toml::from_str(content)?;
        Ok(config)
    }

    /// Fill the API key from `CONCORD_API_KEY` or `OPENAI_API_KEY` when the
    /// file does not set one.
    pub fn apply_env(&mut self) {
        if self.llm.api_key.is_none() {
            self.llm.api_key = std::env::var("CONCORD_API_KEY")
                .or_else(|_| std::env::var("OPENAI_API_KEY"))
                .ok()
                .filter(|k| !k.is_empty());
        }
    }
}

/// LLM provider configuration.
///
/// # Examples
///
/// ```
/// use concord_core::LlmConfig;
///
/// let config = LlmConfig::default();
/// assert_eq!(config.model, "gpt-4o");
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Provider name (e.g. `"openai"`, `"ollama"`); informational.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,
    /// API key for the provider.
    pub api_key: Option<String>,
    /// Custom base URL for API requests.
    pub base_url: Option<String>,
}

fn default_provider() -> String {
    "openai".into()
}

fn default_model() -> String {
    "gpt-4o".into()
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_key: None,
            base_url: None,
        }
    }
}

/// Sampling parameters sent with every chat completion.
///
/// Defaults are deterministic: voting across attempts only means something
/// when repeated calls can agree.
///
/// # Examples
///
/// ```
/// use concord_core::SamplingConfig;
///
/// let s = SamplingConfig::default();
/// assert_eq!(s.temperature, 0.0);
/// assert_eq!(s.top_p, 1.0);
/// assert_eq!(s.seed, Some(42));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplingConfig {
    /// Sampling temperature.
    #[serde(default)]
    pub temperature: f64,
    /// Nucleus sampling mass.
    #[serde(default = "default_top_p")]
    pub top_p: f64,
    /// Fixed seed for providers that support it.
    #[serde(default = "default_seed")]
    pub seed: Option<u64>,
}

fn default_top_p() -> f64 {
    1.0
}

fn default_seed() -> Option<u64> {
    Some(42)
}

impl Default for SamplingConfig {
    fn default() -> Self {
        Self {
            temperature: 0.0,
            top_p: default_top_p(),
            seed: default_seed(),
        }
    }
}

/// Settings that shape one check run. Persisted with the check so a resumed
/// run behaves like the original.
///
/// # Examples
///
/// ```
/// use concord_core::CheckSettings;
///
/// let s = CheckSettings::default();
/// assert_eq!(s.repeat, 1);
/// assert_eq!(s.consensus_ratio, 1.0);
/// assert_eq!(s.file_timeout_secs, 600);
/// assert!(s.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckSettings {
    /// Token budget per chunk (default: 20000).
    #[serde(default = "default_chunk_token_limit")]
    pub chunk_token_limit: usize,
    /// LLM attempts per chunk (default: 1).
    #[serde(default = "default_repeat")]
    pub repeat: usize,
    /// Fraction of attempts that must agree on a finding (default: 1.0).
    #[serde(default = "default_consensus_ratio")]
    pub consensus_ratio: f64,
    /// Timeout for a single LLM call in seconds (default: 120).
    #[serde(default = "default_llm_timeout_secs")]
    pub llm_timeout_secs: u64,
    /// Wall-clock budget for one file in seconds (default: 600).
    #[serde(default = "default_file_timeout_secs")]
    pub file_timeout_secs: u64,
    /// Files checked concurrently (default: 5).
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Lines repeated between consecutive chunks (default: 10).
    #[serde(default = "default_overlap_lines")]
    pub overlap_lines: usize,
    /// Optional scale applied to `overlap_lines`.
    #[serde(default)]
    pub overlap_multiplier: Option<f64>,
    /// Sampling parameters for every attempt.
    #[serde(default)]
    pub sampling: SamplingConfig,
}

fn default_chunk_token_limit() -> usize {
    20_000
}

fn default_repeat() -> usize {
    1
}

fn default_consensus_ratio() -> f64 {
    1.0
}

fn default_llm_timeout_secs() -> u64 {
    120
}

fn default_file_timeout_secs() -> u64 {
    600
}

fn default_max_workers() -> usize {
    5
}

fn default_overlap_lines() -> usize {
    10
}

impl Default for CheckSettings {
    fn default() -> Self {
        Self {
            chunk_token_limit: default_chunk_token_limit(),
            repeat: default_repeat(),
            consensus_ratio: default_consensus_ratio(),
            llm_timeout_secs: default_llm_timeout_secs(),
            file_timeout_secs: default_file_timeout_secs(),
            max_workers: default_max_workers(),
            overlap_lines: default_overlap_lines(),
            overlap_multiplier: None,
            sampling: SamplingConfig::default(),
        }
    }
}

impl CheckSettings {
    /// Reject values the engine cannot run with.
    ///
    /// # Errors
    ///
    /// Returns [`ConcordError::Config`] naming the first invalid setting.
    pub fn validate(&self) -> Result<(), ConcordError> {
        if self.chunk_token_limit == 0 {
            return Err(ConcordError::Config("chunk_token_limit must be > 0".into()));
        }
        if self.repeat == 0 {
            return Err(ConcordError::Config("repeat must be at least 1".into()));
        }
        if !(self.consensus_ratio > 0.0 && self.consensus_ratio <= 1.0) {
            return Err(ConcordError::Config(format!(
                "consensus_ratio must be in (0, 1], got {}",
                self.consensus_ratio
            )));
        }
        if self.max_workers == 0 {
            return Err(ConcordError::Config("max_workers must be at least 1".into()));
        }
        if self.llm_timeout_secs == 0 || self.file_timeout_secs == 0 {
            return Err(ConcordError::Config("timeouts must be > 0 seconds".into()));
        }
        if let Some(m) = self.overlap_multiplier {
            if !(m.is_finite() && m >= 0.0) {
                return Err(ConcordError::Config(format!(
                    "overlap_multiplier must be a non-negative number, got {m}"
                )));
            }
        }
        Ok(())
    }

    /// Overlap after applying the optional multiplier.
    ///
    /// # Examples
    ///
    /// ```
    /// use concord_core::CheckSettings;
    ///
    /// let s = CheckSettings { overlap_lines: 10, overlap_multiplier: Some(1.5), ..Default::default() };
    /// assert_eq!(s.effective_overlap(), 15);
    /// ```
    pub fn effective_overlap(&self) -> usize {
        match self.overlap_multiplier {
            Some(m) if m.is_finite() && m >= 0.0 => (self.overlap_lines as f64 * m).round() as usize,
            _ => self.overlap_lines,
        }
    }
}

/// Location of persisted check state.
///
/// # Examples
///
/// ```
/// use concord_core::ProgressConfig;
///
/// assert!(ProgressConfig::default().dir.ends_with("progress"));
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProgressConfig {
    /// Directory holding `{check_id}.json` files.
    #[serde(default = "default_progress_dir")]
    pub dir: PathBuf,
}

fn default_progress_dir() -> PathBuf {
    PathBuf::from(".concord/progress")
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            dir: default_progress_dir(),
        }
    }
}
