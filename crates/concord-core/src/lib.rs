//! Core types, configuration, and error handling for Concord.
//!
//! This crate provides the shared foundation used by the other Concord crates:
//! - [`ConcordError`]: unified error type using `thiserror`
//! - [`ConcordConfig`]: configuration loaded from `.concord.toml`
//! - The review data model: [`Rule`], [`Chunk`], [`Finding`], [`FileResult`],
//!   [`CheckState`], [`Severity`]
//! - [`rules`]: markdown rule file parsing

mod config;
mod error;
pub mod rules;
mod types;

pub use config::{CheckSettings, ConcordConfig, LlmConfig, ProgressConfig, SamplingConfig};
pub use error::ConcordError;
pub use types::{
    detect_line_threshold, CheckState, CheckStatus, Chunk, FileResult, FileStatus, Finding,
    OutputFormat, Rule, Severity,
};

/// A convenience `Result` type for Concord operations.
pub type Result<T> = std::result::Result<T, ConcordError>;
