use std::path::PathBuf;

/// Errors that can occur across the Concord engine.
///
/// Library crates return this type directly; the binary crate converts to a
/// `miette` diagnostic at the boundary.
///
/// # Examples
///
/// ```
/// use concord_core::ConcordError;
///
/// let err = ConcordError::Config("repeat must be at least 1".into());
/// assert!(err.to_string().contains("repeat"));
/// ```
#[derive(Debug, thiserror::Error)]
pub enum ConcordError {
    /// Filesystem I/O failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Rule or response parsing failure.
    #[error("parse error: {0}")]
    Parse(String),

    /// LLM API or transport error.
    #[error("LLM error: {0}")]
    Llm(String),

    /// JSON serialization / deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML deserialization failure.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Persisted check state is missing, unreadable or inconsistent.
    #[error("check state error: {0}")]
    State(String),

    /// The advisory lock around a state file could not be acquired.
    #[error("could not lock {}: {reason}", .path.display())]
    Lock {
        /// Lock file that was contended.
        path: PathBuf,
        /// Why acquisition gave up.
        reason: String,
    },

    /// A required file was not found.
    #[error("file not found: {}", .0.display())]
    FileNotFound(PathBuf),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let err: ConcordError = io_err.into();
        assert!(err.to_string().contains("gone"));
    }

    #[test]
    fn config_error_displays_message() {
        let err = ConcordError::Config("bad value".into());
        assert_eq!(err.to_string(), "configuration error: bad value");
    }

    #[test]
    fn lock_error_shows_path_and_reason() {
        let err = ConcordError::Lock {
            path: PathBuf::from("/tmp/abc.lock"),
            reason: "timed out after 5s".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("/tmp/abc.lock"));
        assert!(msg.contains("timed out"));
    }

    #[test]
    fn file_not_found_shows_path() {
        let err = ConcordError::FileNotFound(PathBuf::from("/tmp/missing.rs"));
        assert!(err.to_string().contains("/tmp/missing.rs"));
    }
}
